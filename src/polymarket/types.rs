//! Shared data model: assets, orders, fills, and tracked inventory.
//!
//! `AssetId` is opaque per the exchange contract — the engine never assumes
//! structure beyond string equality. Pairing two assets into a binary market
//! (for liability aggregation) is a config-level concern, not a type-level one.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        AssetId(s.to_string())
    }
}

impl From<String> for AssetId {
    fn from(s: String) -> Self {
        AssetId(s)
    }
}

/// Order side. Distinct from which asset/outcome is being traded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Live,
    Partial,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub asset: AssetId,
    pub side: Side,
    pub price: Decimal,
    pub original_size: Decimal,
    pub remaining_size: Decimal,
    pub status: OrderStatus,
}

/// A single price/size level in a book snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Top-of-book state for one asset, as maintained by OrderbookManager.
/// `best_bid_size`/`best_ask_size` feed MomentumDetector's depth-sweep
/// check; `tick` can change live via a `tick_size_change` event.
#[derive(Debug, Clone, Copy)]
pub struct TopOfBook {
    pub best_bid: Decimal,
    pub best_bid_size: Decimal,
    pub best_ask: Decimal,
    pub best_ask_size: Decimal,
    pub tick: Decimal,
    pub last_trade_price: Option<Decimal>,
    pub ts: Instant,
    /// Set on disconnect; cleared only after a fresh `book` snapshot.
    pub stale: bool,
}

impl TopOfBook {
    pub fn is_ready(&self) -> bool {
        !self.stale && self.best_bid > Decimal::ZERO && self.best_ask > Decimal::ZERO
    }
}

/// A fill, possibly missing `trade_id` (synthesized key used in its place).
#[derive(Debug, Clone)]
pub struct Fill {
    pub trade_id: Option<String>,
    pub order_id: String,
    pub asset: AssetId,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    pub timestamp_ms: i64,
}

impl Fill {
    /// Stable identity for dedup/absorption even when `trade_id` is absent.
    pub fn key(&self) -> String {
        match &self.trade_id {
            Some(id) => id.clone(),
            None => format!("{}:{}:{}", self.order_id, self.timestamp_ms, self.size),
        }
    }
}

/// A fill observed on the user stream but not yet reflected in an
/// authoritative snapshot.
#[derive(Debug, Clone)]
pub struct PendingFill {
    pub fill: Fill,
    pub recorded_at: Instant,
}

impl PendingFill {
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.duration_since(self.recorded_at)
    }
}

/// Per-asset position state, generalizing the teacher's fixed YES/NO
/// `yes_qty`/`no_qty` fields into a map keyed by `AssetId`.
#[derive(Debug, Clone)]
pub struct TrackedPosition {
    pub confirmed_size: Decimal,
    pub confirmed_at: Instant,
    pub pending_fills: HashMap<String, PendingFill>,
    /// Σ remaining_size of our own live BUY orders, maintained by
    /// `reserve_pending_buy`/`release_pending_buy`.
    pub reserved_buy: Decimal,
    /// Size-weighted average price of the confirmed+pending long, used for
    /// equity/liability estimation. Only BUY fills move it; SELL fills
    /// realize against it.
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
}

impl TrackedPosition {
    pub fn new(now: Instant) -> Self {
        Self {
            confirmed_size: Decimal::ZERO,
            confirmed_at: now,
            pending_fills: HashMap::new(),
            reserved_buy: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
        }
    }

    pub fn pending_fill_buys(&self) -> Decimal {
        self.pending_fills
            .values()
            .filter(|p| p.fill.side == Side::Buy)
            .map(|p| p.fill.size)
            .sum()
    }

    pub fn pending_fill_sells(&self) -> Decimal {
        self.pending_fills
            .values()
            .filter(|p| p.fill.side == Side::Sell)
            .map(|p| p.fill.size)
            .sum()
    }

    /// Used for P&L, display, and sell capacity.
    pub fn effective_size(&self) -> Decimal {
        self.confirmed_size + self.pending_fill_buys() - self.pending_fill_sells()
    }

    /// Used for BUY admission.
    pub fn conservative_exposure(&self) -> Decimal {
        self.confirmed_size + self.pending_fill_buys() + self.reserved_buy
    }

    /// Mark-to-market equity: realized P&L plus unrealized P&L on the
    /// current long against `mid`.
    pub fn equity(&self, mid: Decimal) -> Decimal {
        self.realized_pnl + self.effective_size() * (mid - self.avg_entry_price)
    }
}

/// Per-market and global risk state machine values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskState {
    Normal,
    Warning,
    Halted,
    Recovering,
}

impl RiskState {
    /// Position-limit multiplier applied by InventoryManager.
    pub fn multiplier(&self) -> Decimal {
        match self {
            RiskState::Normal => Decimal::ONE,
            RiskState::Warning => Decimal::new(5, 1),
            RiskState::Recovering => Decimal::new(25, 2),
            RiskState::Halted => Decimal::ZERO,
        }
    }

    /// Ranks states by how restrictive they are; lower is more restrictive.
    /// Used to combine a per-market state with the global one.
    fn rank(&self) -> u8 {
        match self {
            RiskState::Halted => 0,
            RiskState::Recovering => 1,
            RiskState::Warning => 2,
            RiskState::Normal => 3,
        }
    }

    pub fn more_restrictive(self, other: RiskState) -> RiskState {
        if self.rank() <= other.rank() {
            self
        } else {
            other
        }
    }
}

/// Hard-fault signals that bypass the normal tick cadence: a component
/// detecting a condition that must reach RiskManager immediately rather
/// than waiting for the next `observe_equity`/`record_rejection` call.
#[derive(Debug, Clone)]
pub enum RiskSignal {
    PublicFeedDisconnect,
    PublicFeedGap { asset: AssetId, expected: u64, got: u64 },
    UserChannelDisconnect,
    UserChannelReconnected,
}

/// QuoteEngine output for one asset.
#[derive(Debug, Clone, PartialEq)]
pub enum QuoteDecision {
    CancelAll,
    Keep,
    Replace {
        bid_price: Decimal,
        ask_price: Decimal,
        bid_size: Decimal,
        ask_size: Decimal,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_key_uses_trade_id_when_present() {
        let f = Fill {
            trade_id: Some("t1".into()),
            order_id: "o1".into(),
            asset: "a".into(),
            side: Side::Buy,
            price: Decimal::new(50, 2),
            size: Decimal::new(10, 0),
            fee: Decimal::ZERO,
            timestamp_ms: 1000,
        };
        assert_eq!(f.key(), "t1");
    }

    #[test]
    fn fill_key_synthesized_when_absent() {
        let f = Fill {
            trade_id: None,
            order_id: "o1".into(),
            asset: "a".into(),
            side: Side::Buy,
            price: Decimal::new(50, 2),
            size: Decimal::new(10, 0),
            fee: Decimal::ZERO,
            timestamp_ms: 1000,
        };
        assert_eq!(f.key(), "o1:1000:10");
    }

    #[test]
    fn conservative_exposure_includes_reservation() {
        let now = Instant::now();
        let mut pos = TrackedPosition::new(now);
        pos.confirmed_size = Decimal::new(80, 0);
        pos.reserved_buy = Decimal::new(15, 0);
        assert_eq!(pos.conservative_exposure(), Decimal::new(95, 0));
    }

    #[test]
    fn more_restrictive_picks_the_harsher_state() {
        assert_eq!(RiskState::Halted.more_restrictive(RiskState::Normal), RiskState::Halted);
        assert_eq!(RiskState::Normal.more_restrictive(RiskState::Warning), RiskState::Warning);
        assert_eq!(RiskState::Recovering.more_restrictive(RiskState::Warning), RiskState::Recovering);
    }
}
