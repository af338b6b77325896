//! Component D — MomentumDetector: flags fast price moves and depth
//! sweeps so QuoteEngine can widen or pull quotes ahead of adverse
//! selection. Grounded on `ofi.rs`'s `SideWindow` sliding window and
//! heartbeat `tokio::select!` shape, repointed from order-flow-imbalance
//! scoring to price-momentum/depth-sweep detection.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::watch;

use crate::config::MomentumConfig;
use crate::polymarket::types::{AssetId, TopOfBook};

struct PriceSample {
    mid: Decimal,
    at: Instant,
}

/// Rolling window of recent mid-price samples for one asset.
struct SideWindow {
    samples: VecDeque<PriceSample>,
    window: Duration,
}

impl SideWindow {
    fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    fn push(&mut self, mid: Decimal, now: Instant) {
        self.samples.push_back(PriceSample { mid, at: now });
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Signed move from the oldest sample in the window to `mid`, in tick
    /// units so the threshold matches the granularity the book itself
    /// quotes in rather than an arbitrary bps figure.
    fn move_ticks(&self, mid: Decimal, tick: Decimal) -> Decimal {
        if tick <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        match self.samples.front() {
            Some(oldest) => (mid - oldest.mid) / tick,
            None => Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MomentumFlag {
    Quiet,
    Triggered,
}

pub struct MomentumDetector {
    cfg: MomentumConfig,
    windows: HashMap<AssetId, SideWindow>,
    last_trigger: HashMap<AssetId, Instant>,
    prev_best_bid_size: HashMap<AssetId, Decimal>,
    current: HashMap<AssetId, MomentumFlag>,
    tx: watch::Sender<HashMap<AssetId, MomentumFlag>>,
}

impl MomentumDetector {
    pub fn new(cfg: MomentumConfig) -> (Self, watch::Receiver<HashMap<AssetId, MomentumFlag>>) {
        let (tx, rx) = watch::channel(HashMap::new());
        (
            Self {
                cfg,
                windows: HashMap::new(),
                last_trigger: HashMap::new(),
                prev_best_bid_size: HashMap::new(),
                current: HashMap::new(),
                tx,
            },
            rx,
        )
    }

    /// Call on every top-of-book update. Detects both a fast directional
    /// move within the configured window and a one-shot depth sweep
    /// (best-bid size dropping by more than `sweep_depth_ratio` since the
    /// previous observation of the same asset).
    pub fn observe(&mut self, asset: &AssetId, book: &TopOfBook, now: Instant) {
        let mid = (book.best_bid + book.best_ask) / Decimal::new(2, 0);
        let window = self
            .windows
            .entry(asset.clone())
            .or_insert_with(|| SideWindow::new(Duration::from_millis(self.cfg.window_ms)));
        let move_ticks = window.move_ticks(mid, book.tick).abs();
        window.push(mid, now);

        let prev_best_bid_size = self.prev_best_bid_size.insert(asset.clone(), book.best_bid_size);
        let swept = match prev_best_bid_size {
            Some(prev) if prev > Decimal::ZERO => {
                let drop_ratio = (prev - book.best_bid_size) / prev;
                drop_ratio >= self.cfg.sweep_depth_ratio
            }
            _ => false,
        };

        let in_cooldown = self
            .last_trigger
            .get(asset)
            .map(|t| now.duration_since(*t) < Duration::from_millis(self.cfg.cooldown_ms))
            .unwrap_or(false);

        let flag = if in_cooldown {
            MomentumFlag::Triggered
        } else if move_ticks >= self.cfg.trigger_ticks || swept {
            self.last_trigger.insert(asset.clone(), now);
            MomentumFlag::Triggered
        } else {
            MomentumFlag::Quiet
        };

        self.current.insert(asset.clone(), flag);
        self.tx.send_modify(|flags| {
            flags.insert(asset.clone(), flag);
        });
    }

    /// Last computed flag for `asset`, defaulting to `Quiet` for an asset
    /// that hasn't been observed yet.
    pub fn current_flag(&self, asset: &AssetId) -> MomentumFlag {
        self.current.get(asset).copied().unwrap_or(MomentumFlag::Quiet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book(bid: Decimal, ask: Decimal, best_bid_size: Decimal) -> TopOfBook {
        TopOfBook {
            best_bid: bid,
            best_bid_size,
            best_ask: ask,
            best_ask_size: dec!(100),
            tick: dec!(0.01),
            last_trade_price: None,
            ts: Instant::now(),
            stale: false,
        }
    }

    fn cfg() -> MomentumConfig {
        MomentumConfig {
            window_ms: 2000,
            trigger_ticks: dec!(3),
            cooldown_ms: 1000,
            sweep_depth_ratio: dec!(0.9),
        }
    }

    #[test]
    fn fast_move_triggers_flag() {
        let (mut m, _rx) = MomentumDetector::new(cfg());
        let asset: AssetId = "a".into();
        let t0 = Instant::now();
        m.observe(&asset, &book(dec!(0.50), dec!(0.51), dec!(100)), t0);
        m.observe(&asset, &book(dec!(0.55), dec!(0.56), dec!(100)), t0 + Duration::from_millis(100));
        assert_eq!(m.current_flag(&asset), MomentumFlag::Triggered);
    }

    #[test]
    fn quiet_book_stays_quiet() {
        let (mut m, _rx) = MomentumDetector::new(cfg());
        let asset: AssetId = "a".into();
        let t0 = Instant::now();
        m.observe(&asset, &book(dec!(0.50), dec!(0.51), dec!(100)), t0);
        m.observe(&asset, &book(dec!(0.501), dec!(0.511), dec!(100)), t0 + Duration::from_millis(100));
        assert_eq!(m.current_flag(&asset), MomentumFlag::Quiet);
    }

    #[test]
    fn depth_sweep_triggers_without_price_move() {
        let mut cfg = cfg();
        cfg.trigger_ticks = dec!(50);
        cfg.sweep_depth_ratio = dec!(0.5);
        let (mut m, _rx) = MomentumDetector::new(cfg);
        let asset: AssetId = "a".into();
        let t0 = Instant::now();
        m.observe(&asset, &book(dec!(0.50), dec!(0.51), dec!(100)), t0);
        m.observe(&asset, &book(dec!(0.50), dec!(0.51), dec!(20)), t0 + Duration::from_millis(100));
        assert_eq!(m.current_flag(&asset), MomentumFlag::Triggered);
    }

    #[test]
    fn unobserved_asset_defaults_to_quiet() {
        let (m, _rx) = MomentumDetector::new(cfg());
        assert_eq!(m.current_flag(&"unknown".into()), MomentumFlag::Quiet);
    }
}
