//! Component F — OrderManager: turns a `QuoteDecision` into place/cancel
//! REST calls, respecting post-only, per-market and global rate limits, and
//! a cap on live orders per asset. Grounded on `executor.rs`'s open-order
//! tracking and cancel-all fallback, and `legacy/order_manager.rs`'s
//! diffing `sync()`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;

use crate::config::OrderManagerConfig;
use crate::errors::{EngineError, ExchangeRejectionError, OrderManagerError};
use crate::polymarket::inventory::InventoryManager;
use crate::polymarket::types::{AssetId, Order, OrderStatus, QuoteDecision, RiskState, Side};
use crate::rest_client::SharedRestClient;

/// Token bucket shared across all assets, refilled continuously.
struct RateLimiter {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(rate_per_sec: u32) -> Self {
        Self {
            capacity: rate_per_sec as f64,
            tokens: rate_per_sec as f64,
            rate_per_sec: rate_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// A rejection reason that means "the book moved under us", recoverable by
/// simply repricing next tick rather than escalating to risk.
fn is_post_only_cross(e: &EngineError) -> bool {
    matches!(e, EngineError::ExchangeRejection(ExchangeRejectionError::OrderRejected { reason }) if reason.to_ascii_lowercase().contains("cross"))
}

pub struct OrderManager {
    cfg: OrderManagerConfig,
    rest: SharedRestClient,
    global_limiter: RateLimiter,
    last_repost: HashMap<AssetId, Instant>,
    live_orders: HashMap<AssetId, Vec<Order>>,
    dry_run: bool,
}

impl OrderManager {
    pub fn new(cfg: OrderManagerConfig, rest: SharedRestClient, dry_run: bool) -> Self {
        let global_limiter = RateLimiter::new(cfg.global_rate_per_sec);
        Self {
            cfg,
            rest,
            global_limiter,
            last_repost: HashMap::new(),
            live_orders: HashMap::new(),
            dry_run,
        }
    }

    pub fn live_orders_for(&self, asset: &AssetId) -> &[Order] {
        self.live_orders.get(asset).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Absorbs an externally observed order-book snapshot (from
    /// UserChannelManager) so OrderManager's view of "what's live" never
    /// drifts from the exchange's. This is the *only* place a BUY
    /// reservation or a `live_orders` entry is released — an order is only
    /// ever confirmed gone once the exchange's own snapshot says so,
    /// whether that's because we cancelled it, it filled, or it expired.
    pub fn sync_from_snapshot(&mut self, asset: &AssetId, remote: Vec<Order>, inventory: &mut InventoryManager) {
        let still_live: std::collections::HashSet<&str> = remote
            .iter()
            .filter(|o| !o.status.is_terminal())
            .map(|o| o.order_id.as_str())
            .collect();
        if let Some(previous) = self.live_orders.get(asset) {
            for o in previous {
                if o.side == Side::Buy && !still_live.contains(o.order_id.as_str()) {
                    inventory.release_pending_buy(asset, o.remaining_size);
                }
            }
        }
        self.live_orders.insert(asset.clone(), remote.into_iter().filter(|o| !o.status.is_terminal()).collect());
    }

    /// Applies one asset's quote decision: cancels everything on
    /// `CancelAll`, does nothing on `Keep`, or diffs the desired bid/ask
    /// against live orders and cancels/places the delta on `Replace`.
    pub async fn apply(
        &mut self,
        asset: &AssetId,
        decision: QuoteDecision,
        inventory: &mut InventoryManager,
        risk_state: RiskState,
        now: Instant,
    ) -> Result<(), EngineError> {
        match decision {
            QuoteDecision::CancelAll => self.cancel_all(asset).await,
            QuoteDecision::Keep => Ok(()),
            QuoteDecision::Replace {
                bid_price,
                ask_price,
                bid_size,
                ask_size,
            } => self.replace(asset, bid_price, ask_price, bid_size, ask_size, inventory, risk_state, now).await,
        }
    }

    /// Issues the REST cancel only. Does not touch `live_orders` or
    /// release any BUY reservation — those only ever change once
    /// `sync_from_snapshot` observes the cancellation actually landed.
    async fn cancel_all(&mut self, asset: &AssetId) -> Result<(), EngineError> {
        if self.live_orders_for(asset).is_empty() {
            return Ok(());
        }
        if self.dry_run {
            tracing::info!(asset = %asset, "dry-run: would cancel all orders");
            return Ok(());
        }
        self.rest.cancel_all(asset).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn replace(
        &mut self,
        asset: &AssetId,
        bid_price: Decimal,
        ask_price: Decimal,
        bid_size: Decimal,
        ask_size: Decimal,
        inventory: &mut InventoryManager,
        risk_state: RiskState,
        now: Instant,
    ) -> Result<(), EngineError> {
        if !self.repost_allowed(asset, now) {
            return Ok(());
        }
        if !self.global_limiter.try_acquire(now) {
            tracing::debug!(asset = %asset, "global rate limit reached, skipping this tick");
            return Ok(());
        }

        let existing = self.live_orders_for(asset).to_vec();
        let bid_matches = existing.iter().any(|o| o.side == Side::Buy && o.price == bid_price);
        let ask_matches = existing.iter().any(|o| o.side == Side::Sell && o.price == ask_price);
        if bid_matches && ask_matches {
            return Ok(());
        }

        self.cancel_all(asset).await?;
        self.last_repost.insert(asset.clone(), now);

        if self.live_orders_for(asset).len() >= self.cfg.max_open_per_asset * 2 {
            return Ok(());
        }

        let want_bid = bid_size > Decimal::ZERO && inventory.can_open_buy(asset, bid_size, bid_price, risk_state);
        let want_ask = ask_size > Decimal::ZERO && inventory.can_open_sell(asset, ask_size);
        if !want_bid && bid_size > Decimal::ZERO {
            tracing::debug!(asset = %asset, "buy admission check failed, skipping bid");
        }
        if !want_ask && ask_size > Decimal::ZERO {
            tracing::debug!(asset = %asset, "sell admission check failed, skipping ask");
        }
        if !want_bid && !want_ask {
            return Ok(());
        }

        self.place_all(asset, want_bid.then_some((Side::Buy, bid_price, bid_size)), want_ask.then_some((Side::Sell, ask_price, ask_size)), inventory)
            .await
    }

    /// Places the bid and/or ask in a single batched REST call, after
    /// fetching the current maker fee rate (cached, refreshed on TTL).
    /// Reserves BUY inventory before the call lands so a concurrent quote
    /// pass can't over-admit against the same headroom.
    async fn place_all(
        &mut self,
        asset: &AssetId,
        bid: Option<(Side, Decimal, Decimal)>,
        ask: Option<(Side, Decimal, Decimal)>,
        inventory: &mut InventoryManager,
    ) -> Result<(), EngineError> {
        if self.dry_run {
            if let Some((side, price, size)) = bid {
                tracing::info!(asset = %asset, side = side.as_str(), %price, %size, "dry-run: would place order");
            }
            if let Some((side, price, size)) = ask {
                tracing::info!(asset = %asset, side = side.as_str(), %price, %size, "dry-run: would place order");
            }
            return Ok(());
        }

        let fee_rate_bps = self
            .rest
            .get_fee_rate_bps(asset)
            .await
            .map_err(|_| OrderManagerError::FeeFetchFailed(asset.to_string()))?;

        let now = Instant::now();
        let mut requests = Vec::new();
        if let Some((side, price, size)) = bid {
            inventory.reserve_pending_buy(asset, size, now);
            requests.push((asset.clone(), side, price, size, fee_rate_bps));
        }
        if let Some((side, price, size)) = ask {
            requests.push((asset.clone(), side, price, size, fee_rate_bps));
        }
        if requests.is_empty() {
            return Ok(());
        }

        let results = self.rest.place_batch(requests).await?;
        let mut first_err: Option<EngineError> = None;
        for result in results {
            match result {
                Ok(order) => {
                    self.live_orders.entry(asset.clone()).or_default().push(order);
                }
                Err(e) => {
                    if let Some((side, _, size)) = bid {
                        if side == Side::Buy {
                            inventory.release_pending_buy(asset, size);
                        }
                    }
                    tracing::warn!(asset = %asset, error = %e, "order placement failed");
                    if first_err.is_none() {
                        first_err = Some(if is_post_only_cross(&e) {
                            EngineError::OrderManager(OrderManagerError::PostOnlyCross)
                        } else {
                            EngineError::OrderManager(OrderManagerError::PlacementRejected(e.to_string()))
                        });
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn repost_allowed(&self, asset: &AssetId, now: Instant) -> bool {
        match self.last_repost.get(asset) {
            Some(last) => now.duration_since(*last) >= Duration::from_millis(self.cfg.min_repost_interval_ms),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_exhausts_then_refills() {
        let mut rl = RateLimiter::new(1);
        let t0 = Instant::now();
        assert!(rl.try_acquire(t0));
        assert!(!rl.try_acquire(t0));
        assert!(rl.try_acquire(t0 + Duration::from_millis(1100)));
    }

    #[test]
    fn post_only_cross_is_detected_from_rejection_reason() {
        let e = EngineError::ExchangeRejection(ExchangeRejectionError::OrderRejected {
            reason: "would cross the book".to_string(),
        });
        assert!(is_post_only_cross(&e));
        let other = EngineError::ExchangeRejection(ExchangeRejectionError::OrderRejected {
            reason: "insufficient balance".to_string(),
        });
        assert!(!is_post_only_cross(&other));
    }
}
