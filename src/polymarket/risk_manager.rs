//! Component G — RiskManager: a per-market state machine
//! (Normal → Warning → Halted → Recovering → Normal) combined with a
//! global state driven by feed health and the user channel, so one
//! market's trouble never silently halts the rest and a global fault
//! never lets an individual market look fine. Grounded on
//! `Zuytan-rustrade/risk_manager.rs`'s circuit breaker shape; the teacher
//! has no direct equivalent.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;

use crate::config::RiskConfig;
use crate::polymarket::types::{AssetId, RiskSignal, RiskState};

/// Why the global state is at its current level; more than one cause can
/// be active, so clearing one doesn't necessarily return to Normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WarningCause {
    Feed,
    Gap,
    Errors,
}

struct MarketRisk {
    state: RiskState,
    state_entered_at: Instant,
    consecutive_errors: u32,
    error_timestamps: VecDeque<Instant>,
    gap_attempts: u32,
    peak_equity: Decimal,
}

impl MarketRisk {
    fn new(now: Instant) -> Self {
        Self {
            state: RiskState::Normal,
            state_entered_at: now,
            consecutive_errors: 0,
            error_timestamps: VecDeque::new(),
            gap_attempts: 0,
            peak_equity: Decimal::ZERO,
        }
    }

    fn transition(&mut self, to: RiskState, now: Instant) {
        if to != self.state {
            self.state = to;
            self.state_entered_at = now;
        }
    }
}

pub struct RiskManager {
    cfg: RiskConfig,
    markets: std::collections::HashMap<AssetId, MarketRisk>,
    global_state: RiskState,
    global_entered_at: Instant,
    causes: HashSet<WarningCause>,
    global_peak_equity: Decimal,
}

impl RiskManager {
    pub fn new(cfg: RiskConfig, now: Instant) -> Self {
        Self {
            cfg,
            markets: std::collections::HashMap::new(),
            global_state: RiskState::Normal,
            global_entered_at: now,
            causes: HashSet::new(),
            global_peak_equity: Decimal::ZERO,
        }
    }

    fn market_mut(&mut self, asset: &AssetId, now: Instant) -> &mut MarketRisk {
        self.markets.entry(asset.clone()).or_insert_with(|| MarketRisk::new(now))
    }

    /// Combined state a quote decision for `asset` should see: the more
    /// restrictive of the per-market state and the global state.
    pub fn effective_state(&self, asset: &AssetId) -> RiskState {
        let market_state = self.markets.get(asset).map(|m| m.state).unwrap_or(RiskState::Normal);
        market_state.more_restrictive(self.global_state)
    }

    /// Global state alone, for operator display and non-market-scoped gates.
    pub fn global_state(&self) -> RiskState {
        self.global_state
    }

    /// Feeds a fresh per-market mark-to-market equity figure. Drawdown is
    /// measured against the high-water mark; a single fill whose loss
    /// exceeds `max_loss_per_trade` halts the market outright regardless of
    /// cumulative drawdown.
    pub fn observe_equity(&mut self, asset: &AssetId, equity: Decimal, now: Instant) {
        let warning_bps = self.cfg.max_drawdown_per_market_bps;
        let m = self.market_mut(asset, now);
        if equity > m.peak_equity {
            m.peak_equity = equity;
        }
        if m.peak_equity <= Decimal::ZERO || m.state == RiskState::Halted {
            return;
        }
        let drawdown_bps = (m.peak_equity - equity) / m.peak_equity * Decimal::new(10_000, 0);
        if drawdown_bps >= warning_bps {
            m.transition(RiskState::Halted, now);
        }
    }

    /// Feeds a single fill's realized loss; halts the market immediately if
    /// it alone exceeds `max_loss_per_trade`.
    pub fn observe_trade_loss(&mut self, asset: &AssetId, loss: Decimal, now: Instant) {
        if loss >= self.cfg.max_loss_per_trade {
            let m = self.market_mut(asset, now);
            m.transition(RiskState::Halted, now);
        }
    }

    /// Feeds a global mark-to-market equity figure (sum across markets).
    pub fn observe_global_equity(&mut self, equity: Decimal, now: Instant) {
        if equity > self.global_peak_equity {
            self.global_peak_equity = equity;
        }
        if self.global_peak_equity <= Decimal::ZERO {
            return;
        }
        let drawdown_bps = (self.global_peak_equity - equity) / self.global_peak_equity * Decimal::new(10_000, 0);
        if drawdown_bps >= self.cfg.max_drawdown_global_bps {
            self.enter_global(RiskState::Halted, now);
        }
    }

    /// Record an order-manager error for `asset`. Trips WARNING at
    /// `warning_errors_threshold`, HALTED at `max_consecutive_errors`, and
    /// HALTED if `max_errors_per_hour` is exceeded within the rolling
    /// window even without a consecutive streak.
    pub fn record_error(&mut self, asset: &AssetId, now: Instant) {
        let warning_threshold = self.cfg.warning_errors_threshold;
        let halt_threshold = self.cfg.max_consecutive_errors;
        let hourly_cap = self.cfg.max_errors_per_hour;
        let m = self.market_mut(asset, now);
        m.consecutive_errors += 1;
        m.error_timestamps.push_back(now);
        while let Some(front) = m.error_timestamps.front() {
            if now.duration_since(*front) > Duration::from_secs(3600) {
                m.error_timestamps.pop_front();
            } else {
                break;
            }
        }
        if m.consecutive_errors >= halt_threshold || m.error_timestamps.len() as u32 >= hourly_cap {
            m.transition(RiskState::Halted, now);
        } else if m.consecutive_errors >= warning_threshold && m.state == RiskState::Normal {
            m.transition(RiskState::Warning, now);
        }
    }

    pub fn record_success(&mut self, asset: &AssetId, now: Instant) {
        let m = self.market_mut(asset, now);
        m.consecutive_errors = 0;
        if m.state == RiskState::Warning {
            m.transition(RiskState::Normal, now);
        }
    }

    /// Records an unresolved WS sequence gap on `asset`; halts the market
    /// once `ws_gap_reconcile_attempts` have passed without a clean
    /// snapshot (see `clear_gap`).
    pub fn record_gap(&mut self, asset: &AssetId, now: Instant) {
        let threshold = self.cfg.ws_gap_reconcile_attempts;
        let m = self.market_mut(asset, now);
        m.gap_attempts += 1;
        if m.gap_attempts >= threshold {
            m.transition(RiskState::Halted, now);
        }
        self.causes.insert(WarningCause::Gap);
        self.recompute_global(now);
    }

    /// A fresh full snapshot was absorbed cleanly for `asset`; resets its
    /// gap-attempt counter.
    pub fn clear_gap(&mut self, asset: &AssetId, now: Instant) {
        if let Some(m) = self.markets.get_mut(asset) {
            m.gap_attempts = 0;
        }
        self.causes.remove(&WarningCause::Gap);
        self.recompute_global(now);
    }

    /// Handles a hard-fault signal from the orderbook or user-channel
    /// components, bypassing the normal tick cadence.
    pub fn on_risk_signal(&mut self, signal: &RiskSignal, now: Instant) {
        match signal {
            RiskSignal::PublicFeedDisconnect => {
                self.causes.insert(WarningCause::Feed);
                self.recompute_global(now);
            }
            RiskSignal::PublicFeedGap { asset, .. } => {
                self.record_gap(asset, now);
            }
            RiskSignal::UserChannelDisconnect => {
                self.enter_global(RiskState::Halted, now);
            }
            RiskSignal::UserChannelReconnected => {
                self.global_state = RiskState::Recovering;
                self.global_entered_at = now;
            }
        }
    }

    /// Marks the public feed as healthy again; if no other cause is still
    /// active, lets the global state recover.
    pub fn clear_feed_warning(&mut self, now: Instant) {
        self.causes.remove(&WarningCause::Feed);
        self.recompute_global(now);
    }

    fn recompute_global(&mut self, now: Instant) {
        if self.global_state == RiskState::Halted {
            return;
        }
        if self.causes.is_empty() {
            if self.global_state == RiskState::Warning {
                self.enter_global(RiskState::Normal, now);
            }
        } else {
            self.enter_global(RiskState::Warning, now);
        }
    }

    fn enter_global(&mut self, to: RiskState, now: Instant) {
        if to != self.global_state {
            tracing::warn!(from = ?self.global_state, to = ?to, "global risk state transition");
            self.global_state = to;
            self.global_entered_at = now;
        }
    }

    /// Called once per tick. Only advances HALTED → RECOVERING if
    /// `require_manual_reset` is false; an operator must call `clear_halt`
    /// otherwise. RECOVERING markets (and the global state) return to
    /// NORMAL after `circuit_breaker_recovery_ms` without a fresh halt.
    pub fn tick(&mut self, now: Instant) {
        let recovery = Duration::from_millis(self.cfg.circuit_breaker_recovery_ms);
        let cooldown = Duration::from_millis(self.cfg.circuit_breaker_cooldown_ms);
        let manual = self.cfg.require_manual_reset;

        for m in self.markets.values_mut() {
            if m.state == RiskState::Halted && !manual && now.duration_since(m.state_entered_at) >= cooldown {
                m.transition(RiskState::Recovering, now);
            } else if m.state == RiskState::Recovering && now.duration_since(m.state_entered_at) >= recovery {
                m.transition(RiskState::Normal, now);
            }
        }

        if self.global_state == RiskState::Recovering && now.duration_since(self.global_entered_at) >= recovery {
            self.enter_global(RiskState::Normal, now);
        }
    }

    /// Operator path out of a manually-gated halt for one market.
    pub fn clear_halt(&mut self, asset: &AssetId, now: Instant) {
        if let Some(m) = self.markets.get_mut(asset) {
            if m.state == RiskState::Halted {
                m.consecutive_errors = 0;
                m.gap_attempts = 0;
                m.transition(RiskState::Recovering, now);
            }
        }
    }

    /// Operator path out of a global halt (e.g. after a user-channel
    /// disconnect resolves and positions have been reconciled).
    pub fn clear_global_halt(&mut self, now: Instant) {
        if self.global_state == RiskState::Halted {
            self.enter_global(RiskState::Recovering, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cfg() -> RiskConfig {
        RiskConfig {
            warning_errors_threshold: 2,
            max_consecutive_errors: 3,
            max_errors_per_hour: 20,
            max_drawdown_per_market_bps: dec!(500),
            max_drawdown_global_bps: dec!(500),
            max_loss_per_trade: dec!(50),
            ws_gap_reconcile_attempts: 3,
            stale_feed_threshold_ms: 10_000,
            circuit_breaker_cooldown_ms: 1000,
            circuit_breaker_recovery_ms: 1000,
            require_manual_reset: false,
        }
    }

    #[test]
    fn drawdown_above_threshold_halts_market() {
        let mut rm = RiskManager::new(cfg(), Instant::now());
        let asset: AssetId = "a".into();
        rm.observe_equity(&asset, dec!(1000), Instant::now());
        rm.observe_equity(&asset, dec!(940), Instant::now());
        assert_eq!(rm.effective_state(&asset), RiskState::Halted);
    }

    #[test]
    fn consecutive_errors_escalate_warning_then_halt() {
        let mut rm = RiskManager::new(cfg(), Instant::now());
        let asset: AssetId = "a".into();
        let now = Instant::now();
        rm.record_error(&asset, now);
        rm.record_error(&asset, now);
        assert_eq!(rm.effective_state(&asset), RiskState::Warning);
        rm.record_error(&asset, now);
        assert_eq!(rm.effective_state(&asset), RiskState::Halted);
    }

    #[test]
    fn gap_attempts_halt_after_threshold() {
        let mut rm = RiskManager::new(cfg(), Instant::now());
        let asset: AssetId = "a".into();
        let now = Instant::now();
        rm.record_gap(&asset, now);
        rm.record_gap(&asset, now);
        assert_eq!(rm.effective_state(&asset), RiskState::Normal);
        rm.record_gap(&asset, now);
        assert_eq!(rm.effective_state(&asset), RiskState::Halted);
    }

    #[test]
    fn user_channel_disconnect_halts_globally_even_for_healthy_market() {
        let mut rm = RiskManager::new(cfg(), Instant::now());
        let asset: AssetId = "a".into();
        rm.on_risk_signal(&RiskSignal::UserChannelDisconnect, Instant::now());
        assert_eq!(rm.effective_state(&asset), RiskState::Halted);
    }

    #[test]
    fn feed_disconnect_is_global_warning_not_halt() {
        let mut rm = RiskManager::new(cfg(), Instant::now());
        let asset: AssetId = "a".into();
        rm.on_risk_signal(&RiskSignal::PublicFeedDisconnect, Instant::now());
        assert_eq!(rm.effective_state(&asset), RiskState::Warning);
    }

    #[test]
    fn single_trade_loss_above_threshold_halts_market() {
        let mut rm = RiskManager::new(cfg(), Instant::now());
        let asset: AssetId = "a".into();
        rm.observe_trade_loss(&asset, dec!(60), Instant::now());
        assert_eq!(rm.effective_state(&asset), RiskState::Halted);
    }

    #[test]
    fn halted_market_recovers_through_recovering_after_cooldown() {
        let mut rm = RiskManager::new(cfg(), Instant::now());
        let asset: AssetId = "a".into();
        let t0 = Instant::now();
        rm.observe_trade_loss(&asset, dec!(60), t0);
        assert_eq!(rm.effective_state(&asset), RiskState::Halted);
        rm.tick(t0 + Duration::from_millis(1100));
        assert_eq!(rm.effective_state(&asset), RiskState::Recovering);
        rm.tick(t0 + Duration::from_millis(2300));
        assert_eq!(rm.effective_state(&asset), RiskState::Normal);
    }

    #[test]
    fn require_manual_reset_blocks_auto_recovery() {
        let mut cfg = cfg();
        cfg.require_manual_reset = true;
        let mut rm = RiskManager::new(cfg, Instant::now());
        let asset: AssetId = "a".into();
        let t0 = Instant::now();
        rm.observe_trade_loss(&asset, dec!(60), t0);
        rm.tick(t0 + Duration::from_millis(5000));
        assert_eq!(rm.effective_state(&asset), RiskState::Halted);
        rm.clear_halt(&asset, t0 + Duration::from_millis(5000));
        assert_eq!(rm.effective_state(&asset), RiskState::Recovering);
    }
}
