//! Component C — InventoryManager: per-asset `TrackedPosition`, pending-fill
//! absorption against authoritative REST snapshots, sizing, and limit
//! checks. Grounded on the teacher's `inventory.rs` actor shape
//! (generalized from two fixed YES/NO slots to `HashMap<AssetId, _>`) and
//! `Zuytan-rustrade/order_reconciler.rs`'s reconciliation-walk structure,
//! repointed to an oldest-first delta-absorption walk against the size
//! actually confirmed rather than a blind time cutoff.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;

use crate::config::InventoryConfig;
use crate::polymarket::types::{AssetId, Fill, PendingFill, RiskState, Side, TrackedPosition};

/// Below this magnitude a remaining delta is treated as fully absorbed;
/// guards against Decimal rounding noise from fee-adjusted sizes.
const ABSORPTION_EPSILON: Decimal = dec!(0.0000001);

pub struct InventoryManager {
    cfg: InventoryConfig,
    positions: HashMap<AssetId, TrackedPosition>,
    /// Maps an asset to the binary-market group it belongs to, for
    /// liability aggregation across the two complementary outcomes.
    groups: HashMap<AssetId, String>,
    tx: watch::Sender<HashMap<AssetId, TrackedPosition>>,
}

impl InventoryManager {
    pub fn new(
        cfg: InventoryConfig,
        assets: &[AssetId],
        groups: HashMap<AssetId, String>,
    ) -> (Self, watch::Receiver<HashMap<AssetId, TrackedPosition>>) {
        let now = Instant::now();
        let positions: HashMap<AssetId, TrackedPosition> =
            assets.iter().cloned().map(|a| (a, TrackedPosition::new(now))).collect();
        let (tx, rx) = watch::channel(positions.clone());
        (Self { cfg, positions, groups, tx }, rx)
    }

    /// Sets the authoritative confirmed size from a REST snapshot and walks
    /// pending fills oldest-first, absorbing exactly the delta between the
    /// old and new confirmed size:
    /// - ε-threshold short-circuit: stop once the remaining delta is
    ///   negligible, rather than walking fills that have nothing left to
    ///   explain.
    /// - sign-disagreement break: stop if the next oldest fill pushes the
    ///   position the opposite way from the remaining delta — it belongs to
    ///   a later snapshot, not this one.
    /// - partial-retention break: if a fill is larger than the remaining
    ///   delta, absorb only the portion the snapshot confirms and keep the
    ///   rest pending, then stop.
    pub fn set_position(&mut self, asset: &AssetId, confirmed_size: Decimal, confirmed_at: Instant) {
        let pos = self.positions.entry(asset.clone()).or_insert_with(|| TrackedPosition::new(confirmed_at));
        let delta = confirmed_size - pos.confirmed_size;
        pos.confirmed_size = confirmed_size;
        pos.confirmed_at = confirmed_at;

        let mut keys: Vec<String> = pos.pending_fills.keys().cloned().collect();
        keys.sort_by_key(|k| pos.pending_fills[k].fill.timestamp_ms);

        let mut remaining = delta;
        for key in keys {
            if remaining.abs() < ABSORPTION_EPSILON {
                break;
            }
            let signed_amt = {
                let p = &pos.pending_fills[&key];
                match p.fill.side {
                    Side::Buy => p.fill.size,
                    Side::Sell => -p.fill.size,
                }
            };
            if signed_amt == Decimal::ZERO {
                pos.pending_fills.remove(&key);
                continue;
            }
            if remaining.signum() != signed_amt.signum() {
                break;
            }
            if signed_amt.abs() <= remaining.abs() {
                remaining -= signed_amt;
                pos.pending_fills.remove(&key);
            } else {
                let absorbed = remaining;
                let entry = pos.pending_fills.get_mut(&key).expect("key present");
                entry.fill.size -= absorbed.abs();
                remaining = Decimal::ZERO;
                break;
            }
        }
        self.publish();
    }

    /// Records a fill observed on the user stream before REST catches up,
    /// and rolls it into the size-weighted average entry price (BUY) or
    /// realizes P&L against that average (SELL).
    pub fn record_pending_fill(&mut self, fill: Fill, now: Instant) {
        let asset = fill.asset.clone();
        let pos = self.positions.entry(asset).or_insert_with(|| TrackedPosition::new(now));
        let prior_size = pos.effective_size();

        match fill.side {
            Side::Buy => {
                let new_size = prior_size + fill.size;
                if new_size > Decimal::ZERO {
                    pos.avg_entry_price =
                        (pos.avg_entry_price * prior_size + fill.price * fill.size) / new_size;
                }
            }
            Side::Sell => {
                pos.realized_pnl += (fill.price - pos.avg_entry_price) * fill.size;
            }
        }

        let key = fill.key();
        pos.pending_fills.insert(key, PendingFill { fill, recorded_at: now });
        self.publish();
    }

    /// Drops pending fills that exceeded the absorption TTL without a
    /// matching confirmed snapshot ever arriving — a desync signal the
    /// caller should log and alert on.
    pub fn expire_stale_pending(&mut self, now: Instant) -> Vec<(AssetId, String)> {
        let ttl = Duration::from_millis(self.cfg.pending_fill_ttl_ms);
        let mut expired = Vec::new();
        for (asset, pos) in self.positions.iter_mut() {
            let stale_keys: Vec<String> = pos
                .pending_fills
                .iter()
                .filter(|(_, p)| p.age(now) > ttl)
                .map(|(k, _)| k.clone())
                .collect();
            for k in stale_keys {
                pos.pending_fills.remove(&k);
                expired.push((asset.clone(), k));
            }
        }
        if !expired.is_empty() {
            self.publish();
        }
        expired
    }

    pub fn reserve_pending_buy(&mut self, asset: &AssetId, size: Decimal, now: Instant) {
        let pos = self.positions.entry(asset.clone()).or_insert_with(|| TrackedPosition::new(now));
        pos.reserved_buy += size;
        self.publish();
    }

    pub fn release_pending_buy(&mut self, asset: &AssetId, size: Decimal) {
        if let Some(pos) = self.positions.get_mut(asset) {
            pos.reserved_buy = (pos.reserved_buy - size).max(Decimal::ZERO);
            self.publish();
        }
    }

    /// Admission check for a prospective BUY of `size` at `price`: the
    /// resulting conservative exposure must stay within the per-asset
    /// position cap (scaled by the current risk multiplier), the group's
    /// liability cap, and the total liability cap.
    pub fn can_open_buy(&self, asset: &AssetId, size: Decimal, price: Decimal, risk_state: RiskState) -> bool {
        let limit = self.cfg.max_position * risk_state.multiplier();
        let within_position = match self.positions.get(asset) {
            Some(p) => p.conservative_exposure() + size <= limit,
            None => size <= limit,
        };
        if !within_position {
            return false;
        }
        self.liability_ok(asset, size, price)
    }

    /// Admission check for a prospective SELL: effective size must cover it.
    pub fn can_open_sell(&self, asset: &AssetId, size: Decimal) -> bool {
        match self.positions.get(asset) {
            Some(pos) => pos.effective_size() >= size,
            None => false,
        }
    }

    /// Clamps a desired BUY size down to whatever headroom remains under
    /// the position, group-liability, and total-liability caps; returns
    /// zero rather than going negative.
    pub fn adjusted_buy_size(&self, asset: &AssetId, desired_size: Decimal, price: Decimal, risk_state: RiskState) -> Decimal {
        if desired_size <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let limit = self.cfg.max_position * risk_state.multiplier();
        let exposure = self.positions.get(asset).map(|p| p.conservative_exposure()).unwrap_or(Decimal::ZERO);
        let position_headroom = (limit - exposure).max(Decimal::ZERO);

        let group_headroom = if price > Decimal::ZERO {
            let current_group_liability = self.liability_for_group(asset);
            ((self.cfg.max_liability_per_market - current_group_liability) / price).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        let total_headroom = if price > Decimal::ZERO {
            let current_total = self.total_liability();
            ((self.cfg.max_total_liability - current_total) / price).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };

        desired_size.min(position_headroom).min(group_headroom).min(total_headroom).max(Decimal::ZERO)
    }

    pub fn effective_size(&self, asset: &AssetId) -> Decimal {
        self.positions.get(asset).map(|p| p.effective_size()).unwrap_or(Decimal::ZERO)
    }

    pub fn equity(&self, asset: &AssetId, mid: Decimal) -> Decimal {
        self.positions.get(asset).map(|p| p.equity(mid)).unwrap_or(Decimal::ZERO)
    }

    pub fn total_equity(&self, mids: &HashMap<AssetId, Decimal>) -> Decimal {
        self.positions
            .iter()
            .map(|(asset, pos)| {
                let mid = mids.get(asset).copied().unwrap_or(pos.avg_entry_price);
                pos.equity(mid)
            })
            .sum()
    }

    /// Worst-case loss for the binary market `asset` belongs to: every
    /// asset in the group resolves to 0 or 1, so a long position's
    /// maximum loss is approximately its cost basis.
    fn liability_for_group(&self, asset: &AssetId) -> Decimal {
        let Some(group) = self.groups.get(asset) else {
            return self.positions.get(asset).map(position_liability).unwrap_or(Decimal::ZERO);
        };
        self.groups
            .iter()
            .filter(|(_, g)| *g == group)
            .filter_map(|(a, _)| self.positions.get(a))
            .map(position_liability)
            .sum()
    }

    fn total_liability(&self) -> Decimal {
        self.positions.values().map(position_liability).sum()
    }

    fn liability_ok(&self, asset: &AssetId, size: Decimal, price: Decimal) -> bool {
        let added = size * price;
        if self.liability_for_group(asset) + added > self.cfg.max_liability_per_market {
            return false;
        }
        self.total_liability() + added <= self.cfg.max_total_liability
    }

    fn publish(&self) {
        self.tx.send_replace(self.positions.clone());
    }
}

fn position_liability(pos: &TrackedPosition) -> Decimal {
    (pos.effective_size() * pos.avg_entry_price).max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cfg() -> InventoryConfig {
        InventoryConfig {
            max_position: dec!(100),
            max_liability_per_market: dec!(1000),
            max_total_liability: dec!(2000),
            pending_fill_ttl_ms: 30_000,
        }
    }

    fn fill(asset: &str, side: Side, size: Decimal, price: Decimal, ts: i64) -> Fill {
        Fill {
            trade_id: Some(format!("{asset}-{ts}")),
            order_id: "o1".into(),
            asset: asset.into(),
            side,
            price,
            size,
            fee: Decimal::ZERO,
            timestamp_ms: ts,
        }
    }

    fn manager() -> (InventoryManager, watch::Receiver<HashMap<AssetId, TrackedPosition>>) {
        InventoryManager::new(cfg(), &["a".into()], HashMap::new())
    }

    #[test]
    fn pending_buy_increases_effective_size() {
        let (mut inv, _rx) = manager();
        let now = Instant::now();
        inv.record_pending_fill(fill("a", Side::Buy, dec!(10), dec!(0.5), 1000), now);
        assert_eq!(inv.effective_size(&"a".into()), dec!(10));
    }

    #[test]
    fn set_position_absorbs_matching_pending_fill() {
        let (mut inv, _rx) = manager();
        let t0 = Instant::now();
        inv.record_pending_fill(fill("a", Side::Buy, dec!(10), dec!(0.5), 1000), t0);
        let t1 = t0 + Duration::from_millis(10);
        inv.set_position(&"a".into(), dec!(10), t1);
        assert_eq!(inv.effective_size(&"a".into()), dec!(10));
        let asset: AssetId = "a".into();
        assert!(inv.positions[&asset].pending_fills.is_empty());
    }

    /// S5: confirmed snapshot only reflects part of a pending fill —
    /// absorb the confirmed portion, keep the remainder pending.
    #[test]
    fn set_position_partially_absorbs_larger_pending_fill() {
        let (mut inv, _rx) = manager();
        let t0 = Instant::now();
        inv.record_pending_fill(fill("a", Side::Buy, dec!(10), dec!(0.5), 1000), t0);
        let t1 = t0 + Duration::from_millis(10);
        inv.set_position(&"a".into(), dec!(6), t1);
        let asset: AssetId = "a".into();
        assert_eq!(inv.positions[&asset].confirmed_size, dec!(6));
        let remaining: Decimal = inv.positions[&asset].pending_fills.values().map(|p| p.fill.size).sum();
        assert_eq!(remaining, dec!(4));
        assert_eq!(inv.effective_size(&asset), dec!(10));
    }

    #[test]
    fn set_position_stops_on_sign_disagreement() {
        let (mut inv, _rx) = manager();
        let t0 = Instant::now();
        inv.record_pending_fill(fill("a", Side::Sell, dec!(5), dec!(0.5), 1000), t0);
        let t1 = t0 + Duration::from_millis(10);
        inv.set_position(&"a".into(), dec!(5), t1);
        let asset: AssetId = "a".into();
        assert_eq!(inv.positions[&asset].pending_fills.len(), 1);
    }

    #[test]
    fn can_open_buy_respects_limit_and_reservation() {
        let (mut inv, _rx) = manager();
        let now = Instant::now();
        inv.reserve_pending_buy(&"a".into(), dec!(95), now);
        assert!(!inv.can_open_buy(&"a".into(), dec!(10), dec!(0.5), RiskState::Normal));
        assert!(inv.can_open_buy(&"a".into(), dec!(5), dec!(0.5), RiskState::Normal));
    }

    #[test]
    fn halted_state_blocks_all_buys() {
        let (inv, _rx) = manager();
        assert!(!inv.can_open_buy(&"a".into(), dec!(1), dec!(0.5), RiskState::Halted));
    }

    #[test]
    fn expire_stale_pending_removes_after_ttl() {
        let (mut inv, _rx) = manager();
        let t0 = Instant::now();
        inv.record_pending_fill(fill("a", Side::Buy, dec!(10), dec!(0.5), 1000), t0);
        let expired = inv.expire_stale_pending(t0 + Duration::from_millis(31_000));
        assert_eq!(expired.len(), 1);
        assert_eq!(inv.effective_size(&"a".into()), Decimal::ZERO);
    }

    #[test]
    fn adjusted_buy_size_clamps_to_group_liability() {
        let mut cfg = cfg();
        cfg.max_liability_per_market = dec!(10);
        let mut groups = HashMap::new();
        groups.insert(AssetId::from("a"), "market1".to_string());
        let (inv, _rx) = InventoryManager::new(cfg, &["a".into()], groups);
        let adjusted = inv.adjusted_buy_size(&"a".into(), dec!(100), dec!(0.5), RiskState::Normal);
        assert_eq!(adjusted, dec!(20));
    }

    #[test]
    fn equity_reflects_unrealized_pnl() {
        let (mut inv, _rx) = manager();
        let t0 = Instant::now();
        inv.record_pending_fill(fill("a", Side::Buy, dec!(10), dec!(0.5), 1000), t0);
        assert_eq!(inv.equity(&"a".into(), dec!(0.6)), dec!(1.0));
    }
}
