//! Component H — FillAnalytics: markout sampling at fixed horizons after
//! each fill, plus running per-asset and aggregate toxicity/volume/fee
//! statistics. Grounded on `ofi.rs`'s actor shape and
//! `Zuytan-rustrade/order_reconciler.rs`'s structured logging.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;

use crate::config::FillAnalyticsConfig;
use crate::persistence::Store;
use crate::polymarket::types::{AssetId, Fill, Side};

struct PendingSample {
    trade_key: String,
    asset: AssetId,
    side: Side,
    price_fill: Decimal,
    fill_at: Instant,
    fill_at_ms: i64,
    remaining_horizons: Vec<u64>,
}

/// `markout_bps = 10000 * (mid_horizon - price_fill) * sign / price_fill`,
/// sign = +1 for a BUY fill, -1 for a SELL fill — positive means the fill
/// was favorable in hindsight, negative means adverse selection.
fn markout_bps(side: Side, price_fill: Decimal, mid_horizon: Decimal) -> Decimal {
    if price_fill <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let sign = match side {
        Side::Buy => Decimal::ONE,
        Side::Sell => -Decimal::ONE,
    };
    Decimal::new(10_000, 0) * (mid_horizon - price_fill) * sign / price_fill
}

/// Running count/volume/fee/rebate/markout totals, kept both per-asset and
/// aggregated across every asset.
#[derive(Debug, Clone, Default)]
pub struct ToxicityStats {
    pub fill_count: u64,
    pub volume: Decimal,
    pub gross_fees_paid: Decimal,
    pub rebates_received: Decimal,
    pub markout_sum_bps: HashMap<u64, Decimal>,
    pub markout_samples: HashMap<u64, u64>,
    /// Fills whose shortest-horizon markout came back negative — adverse
    /// selection realized, not just paid fees.
    pub adverse_fill_count: u64,
    pub shortest_horizon_samples: u64,
}

impl ToxicityStats {
    fn record_fill(&mut self, fill: &Fill) {
        self.fill_count += 1;
        self.volume += fill.price * fill.size;
        if fill.fee >= Decimal::ZERO {
            self.gross_fees_paid += fill.fee;
        } else {
            self.rebates_received += -fill.fee;
        }
    }

    fn record_markout(&mut self, horizon_s: u64, bps: Decimal, is_shortest: bool) {
        *self.markout_sum_bps.entry(horizon_s).or_insert(Decimal::ZERO) += bps;
        *self.markout_samples.entry(horizon_s).or_insert(0) += 1;
        if is_shortest {
            self.shortest_horizon_samples += 1;
            if bps < Decimal::ZERO {
                self.adverse_fill_count += 1;
            }
        }
    }

    pub fn average_markout_bps(&self, horizon_s: u64) -> Option<Decimal> {
        let n = *self.markout_samples.get(&horizon_s)?;
        if n == 0 {
            return None;
        }
        Some(self.markout_sum_bps[&horizon_s] / Decimal::from(n))
    }

    /// Fraction of fills whose shortest-horizon markout was negative.
    pub fn adverse_fill_rate(&self) -> Option<Decimal> {
        if self.shortest_horizon_samples == 0 {
            return None;
        }
        Some(Decimal::from(self.adverse_fill_count) / Decimal::from(self.shortest_horizon_samples))
    }
}

pub struct FillAnalytics {
    cfg: FillAnalyticsConfig,
    pending: Vec<PendingSample>,
    per_asset: HashMap<AssetId, ToxicityStats>,
    aggregate: ToxicityStats,
}

impl FillAnalytics {
    pub fn new(cfg: FillAnalyticsConfig) -> Self {
        Self {
            cfg,
            pending: Vec::new(),
            per_asset: HashMap::new(),
            aggregate: ToxicityStats::default(),
        }
    }

    pub fn record_fill(&mut self, fill: &Fill, now: Instant) {
        self.per_asset.entry(fill.asset.clone()).or_default().record_fill(fill);
        self.aggregate.record_fill(fill);
        self.pending.push(PendingSample {
            trade_key: fill.key(),
            asset: fill.asset.clone(),
            side: fill.side,
            price_fill: fill.price,
            fill_at: now,
            fill_at_ms: fill.timestamp_ms,
            remaining_horizons: self.cfg.markout_horizons_s.clone(),
        });
    }

    /// Samples any due horizons using each asset's current mid-price,
    /// persisting results and folding them into the per-asset and
    /// aggregate toxicity stats.
    pub fn tick(&mut self, mids: &HashMap<AssetId, Decimal>, store: &Store, now: Instant, now_ms: i64) {
        let shortest = self.cfg.markout_horizons_s.iter().copied().min();
        for sample in &mut self.pending {
            let Some(mid) = mids.get(&sample.asset) else { continue };
            let mut sampled = Vec::new();
            sample.remaining_horizons.retain(|h| {
                let due = now.duration_since(sample.fill_at) >= Duration::from_secs(*h);
                if due {
                    sampled.push(*h);
                }
                !due
            });
            for h in sampled {
                let bps = markout_bps(sample.side, sample.price_fill, *mid);
                if let Err(e) = store.record_markout(&sample.trade_key, h, bps, now_ms) {
                    tracing::warn!(error = %e, "failed to persist markout");
                }
                let is_shortest = Some(h) == shortest;
                self.per_asset.entry(sample.asset.clone()).or_default().record_markout(h, bps, is_shortest);
                self.aggregate.record_markout(h, bps, is_shortest);
            }
        }
        self.pending.retain(|s| !s.remaining_horizons.is_empty());
    }

    pub fn average_toxicity_bps(&self, asset: &AssetId) -> Option<Decimal> {
        let shortest = self.cfg.markout_horizons_s.iter().copied().min()?;
        self.per_asset.get(asset)?.average_markout_bps(shortest)
    }

    pub fn asset_stats(&self, asset: &AssetId) -> Option<&ToxicityStats> {
        self.per_asset.get(asset)
    }

    pub fn aggregate_stats(&self) -> &ToxicityStats {
        &self.aggregate
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn oldest_fill_timestamp_ms(&self) -> Option<i64> {
        self.pending.iter().map(|s| s.fill_at_ms).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(price: Decimal, size: Decimal, fee: Decimal) -> Fill {
        Fill {
            trade_id: Some("t1".into()),
            order_id: "o1".into(),
            asset: "a".into(),
            side: Side::Buy,
            price,
            size,
            fee,
            timestamp_ms: 1000,
        }
    }

    #[test]
    fn markout_positive_for_favorable_buy() {
        let bps = markout_bps(Side::Buy, dec!(0.50), dec!(0.52));
        assert_eq!(bps, dec!(400));
    }

    #[test]
    fn markout_negative_for_adverse_sell() {
        let bps = markout_bps(Side::Sell, dec!(0.50), dec!(0.52));
        assert_eq!(bps, dec!(-400));
    }

    #[test]
    fn tick_samples_due_horizon_and_retains_later_ones() {
        let cfg = FillAnalyticsConfig {
            markout_horizons_s: vec![1, 60],
        };
        let mut fa = FillAnalytics::new(cfg);
        let t0 = Instant::now();
        fa.record_fill(&fill(dec!(0.5), dec!(10), Decimal::ZERO), t0);
        let store = Store::open(":memory:").unwrap();
        let mut mids = HashMap::new();
        mids.insert(AssetId::from("a"), dec!(0.52));
        fa.tick(&mids, &store, t0 + Duration::from_secs(2), 3000);
        assert_eq!(fa.pending_count(), 1);
        assert_eq!(fa.average_toxicity_bps(&"a".into()), Some(dec!(400)));
    }

    #[test]
    fn aggregate_stats_track_volume_and_fees() {
        let cfg = FillAnalyticsConfig { markout_horizons_s: vec![1] };
        let mut fa = FillAnalytics::new(cfg);
        let t0 = Instant::now();
        fa.record_fill(&fill(dec!(0.5), dec!(10), dec!(0.1)), t0);
        fa.record_fill(&fill(dec!(0.5), dec!(10), dec!(-0.05)), t0);
        let agg = fa.aggregate_stats();
        assert_eq!(agg.fill_count, 2);
        assert_eq!(agg.volume, dec!(10));
        assert_eq!(agg.gross_fees_paid, dec!(0.1));
        assert_eq!(agg.rebates_received, dec!(0.05));
    }

    #[test]
    fn adverse_fill_rate_counts_negative_shortest_horizon_markouts() {
        let cfg = FillAnalyticsConfig { markout_horizons_s: vec![1] };
        let mut fa = FillAnalytics::new(cfg);
        let t0 = Instant::now();
        fa.record_fill(&fill(dec!(0.5), dec!(10), Decimal::ZERO), t0);
        let store = Store::open(":memory:").unwrap();
        let mut mids = HashMap::new();
        mids.insert(AssetId::from("a"), dec!(0.49));
        fa.tick(&mids, &store, t0 + Duration::from_secs(2), 3000);
        assert_eq!(fa.aggregate_stats().adverse_fill_rate(), Some(Decimal::ONE));
    }
}
