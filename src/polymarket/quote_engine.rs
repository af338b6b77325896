//! Component E — QuoteEngine: turns top-of-book, pre-sized inventory
//! quantities, momentum, and risk state into a bid/ask decision with
//! hysteresis. Grounded on `coordinator.rs`'s debounce/repost-threshold
//! logic and `strategy.rs`'s `floor_to_tick`, repointed from the teacher's
//! continuous mid/half-spread pricing to the tick-quantized
//! track-the-touch-then-skew rule this engine needs.
//!
//! Sizing (`adjusted_buy_size`, sell-capacity clamp) happens in
//! `InventoryManager` and is passed in via `QuoteInputs::size_bid`/
//! `size_ask` — this keeps the pricing rule here pure and independent of
//! position state, which is what makes the tests below exhaustive.

use rust_decimal::Decimal;

use crate::config::QuoteEngineConfig;
use crate::polymarket::momentum::MomentumFlag;
use crate::polymarket::types::{QuoteDecision, RiskState, TopOfBook};

/// Rounds `price` down to the nearest multiple of `tick`, the maker-safe
/// direction for a bid (never crosses up into the ask).
fn floor_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).floor() * tick
}

/// Rounds `price` up to the nearest multiple of `tick`, the maker-safe
/// direction for an ask.
fn ceil_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).ceil() * tick
}

pub struct QuoteEngine {
    cfg: QuoteEngineConfig,
}

pub struct QuoteInputs {
    pub book: TopOfBook,
    pub effective_size: Decimal,
    pub momentum: MomentumFlag,
    pub risk_state: RiskState,
    pub current_bid_price: Option<Decimal>,
    pub current_ask_price: Option<Decimal>,
    /// Bid size already clamped against liability/position limits by
    /// `InventoryManager::adjusted_buy_size`.
    pub size_bid: Decimal,
    /// Ask size already clamped to available sell capacity.
    pub size_ask: Decimal,
}

impl QuoteEngine {
    pub fn new(cfg: QuoteEngineConfig) -> Self {
        Self { cfg }
    }

    /// Pricing rule (one side at a time is never priced independently —
    /// both sides always derive from the same tick-quantized touch):
    /// 1. my_bid = best_bid, my_ask = best_ask.
    /// 2. if spread >= improve_when_spread_ticks * tick AND spread > 2*tick,
    ///    improve one tick on each side (my_bid += tick, my_ask -= tick) —
    ///    the `> 2*tick` guard stops the improved quotes from crossing when
    ///    the spread is exactly at the improvement boundary.
    /// 3. skew_ticks = round(skew_coefficient * effective_size); a long
    ///    position shifts both sides down by skew_ticks * tick to
    ///    discourage further accumulation, a short shifts them up.
    /// 4. clamp to [tick, 1 - tick] with explicit cross-prevention:
    ///    my_bid = min(my_bid, best_ask - tick), my_ask = max(my_ask, best_bid + tick).
    /// 5. per-side suppression (not a full cancel) when a side's price
    ///    would sit at or past the book's edge: best_ask <= tick means no
    ///    room to bid, best_bid >= 1 - tick means no room to ask.
    /// 6. skip replace unless the new price moved by more than
    ///    `reprice_threshold_ticks` from the live order, to avoid needless
    ///    cancel/replace churn.
    pub fn decide(&self, inputs: &QuoteInputs) -> QuoteDecision {
        if inputs.risk_state == RiskState::Halted {
            return QuoteDecision::CancelAll;
        }
        if !inputs.book.is_ready() {
            return QuoteDecision::CancelAll;
        }

        let tick = inputs.book.tick;
        let best_bid = inputs.book.best_bid;
        let best_ask = inputs.book.best_ask;
        let spread = best_ask - best_bid;

        let mut my_bid = best_bid;
        let mut my_ask = best_ask;

        let improve_threshold = tick * Decimal::from(self.cfg.improve_when_spread_ticks);
        if spread >= improve_threshold && spread > tick * Decimal::new(2, 0) {
            my_bid += tick;
            my_ask -= tick;
        }

        let skew_ticks = (self.cfg.skew_coefficient * inputs.effective_size).round();
        let skew = skew_ticks * tick;
        my_bid -= skew;
        my_ask -= skew;

        my_bid = my_bid.min(best_ask - tick);
        my_ask = my_ask.max(best_bid + tick);

        my_bid = floor_to_tick(my_bid.clamp(tick, Decimal::ONE - tick), tick);
        my_ask = ceil_to_tick(my_ask.clamp(tick, Decimal::ONE - tick), tick);

        let suppress_bid = best_ask <= tick;
        let suppress_ask = best_bid >= Decimal::ONE - tick;

        if suppress_bid && suppress_ask {
            return QuoteDecision::CancelAll;
        }

        let size_bid = if suppress_bid { Decimal::ZERO } else { inputs.size_bid };
        let size_ask = if suppress_ask { Decimal::ZERO } else { inputs.size_ask };

        if size_bid <= Decimal::ZERO && size_ask <= Decimal::ZERO {
            return QuoteDecision::CancelAll;
        }

        if self.within_hysteresis(inputs.current_bid_price, my_bid, tick)
            && self.within_hysteresis(inputs.current_ask_price, my_ask, tick)
        {
            return QuoteDecision::Keep;
        }

        QuoteDecision::Replace {
            bid_price: my_bid,
            ask_price: my_ask,
            bid_size: size_bid,
            ask_size: size_ask,
        }
    }

    fn within_hysteresis(&self, current: Option<Decimal>, target: Decimal, tick: Decimal) -> bool {
        match current {
            None => false,
            Some(c) if tick <= Decimal::ZERO => c == target,
            Some(c) => {
                let diff_ticks = ((c - target) / tick).abs();
                diff_ticks <= Decimal::from(self.cfg.reprice_threshold_ticks)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Instant;

    fn cfg() -> QuoteEngineConfig {
        QuoteEngineConfig {
            order_size: dec!(20),
            improve_when_spread_ticks: 4,
            skew_coefficient: dec!(0.1),
            reprice_threshold_ticks: 2,
        }
    }

    fn ready_book(bid: Decimal, ask: Decimal) -> TopOfBook {
        TopOfBook {
            best_bid: bid,
            best_bid_size: dec!(100),
            best_ask: ask,
            best_ask_size: dec!(100),
            tick: dec!(0.01),
            last_trade_price: None,
            ts: Instant::now(),
            stale: false,
        }
    }

    fn base_inputs(book: TopOfBook) -> QuoteInputs {
        QuoteInputs {
            book,
            effective_size: Decimal::ZERO,
            momentum: MomentumFlag::Quiet,
            risk_state: RiskState::Normal,
            current_bid_price: None,
            current_ask_price: None,
            size_bid: dec!(20),
            size_ask: dec!(20),
        }
    }

    /// S1: tight one-tick book, flat inventory — quote sits exactly on the
    /// touch, no improvement (spread is only one tick) and no skew.
    #[test]
    fn s1_tight_book_flat_inventory_quotes_the_touch() {
        let engine = QuoteEngine::new(cfg());
        let inputs = base_inputs(ready_book(dec!(0.50), dec!(0.51)));
        match engine.decide(&inputs) {
            QuoteDecision::Replace { bid_price, ask_price, .. } => {
                assert_eq!(bid_price, dec!(0.50));
                assert_eq!(ask_price, dec!(0.51));
            }
            other => panic!("expected replace, got {other:?}"),
        }
    }

    /// S2: wide book, flat inventory — improves one tick on each side.
    #[test]
    fn s2_wide_book_flat_inventory_improves_one_tick() {
        let engine = QuoteEngine::new(cfg());
        let inputs = base_inputs(ready_book(dec!(0.40), dec!(0.46)));
        match engine.decide(&inputs) {
            QuoteDecision::Replace { bid_price, ask_price, .. } => {
                assert_eq!(bid_price, dec!(0.41));
                assert_eq!(ask_price, dec!(0.45));
            }
            other => panic!("expected replace, got {other:?}"),
        }
    }

    /// S3: same wide book, long 20 units at coefficient 0.1 — skew is
    /// round(0.1 * 20) = 2 ticks, shifting both improved prices down.
    #[test]
    fn s3_wide_book_long_inventory_skews_down_by_two_ticks() {
        let engine = QuoteEngine::new(cfg());
        let mut inputs = base_inputs(ready_book(dec!(0.40), dec!(0.46)));
        inputs.effective_size = dec!(20);
        match engine.decide(&inputs) {
            QuoteDecision::Replace { bid_price, ask_price, .. } => {
                assert_eq!(bid_price, dec!(0.39));
                assert_eq!(ask_price, dec!(0.43));
            }
            other => panic!("expected replace, got {other:?}"),
        }
    }

    #[test]
    fn flat_inventory_quotes_symmetric_around_mid() {
        let engine = QuoteEngine::new(cfg());
        let inputs = base_inputs(ready_book(dec!(0.49), dec!(0.51)));
        match engine.decide(&inputs) {
            QuoteDecision::Replace { bid_price, ask_price, .. } => {
                let mid = dec!(0.5);
                assert_eq!(mid - bid_price, ask_price - mid);
            }
            other => panic!("expected replace, got {other:?}"),
        }
    }

    #[test]
    fn long_inventory_skews_quotes_down() {
        let engine = QuoteEngine::new(cfg());
        let flat = base_inputs(ready_book(dec!(0.40), dec!(0.46)));
        let mut long = base_inputs(ready_book(dec!(0.40), dec!(0.46)));
        long.effective_size = dec!(200);
        let (QuoteDecision::Replace { bid_price: flat_bid, .. }, QuoteDecision::Replace { bid_price: long_bid, .. }) =
            (engine.decide(&flat), engine.decide(&long))
        else {
            panic!("expected replace decisions");
        };
        assert!(long_bid < flat_bid);
    }

    #[test]
    fn halted_state_cancels_all() {
        let engine = QuoteEngine::new(cfg());
        let mut inputs = base_inputs(ready_book(dec!(0.49), dec!(0.51)));
        inputs.risk_state = RiskState::Halted;
        assert_eq!(engine.decide(&inputs), QuoteDecision::CancelAll);
    }

    #[test]
    fn stale_book_cancels_all() {
        let engine = QuoteEngine::new(cfg());
        let mut book = ready_book(dec!(0.49), dec!(0.51));
        book.stale = true;
        let inputs = base_inputs(book);
        assert_eq!(engine.decide(&inputs), QuoteDecision::CancelAll);
    }

    #[test]
    fn small_price_move_within_hysteresis_keeps_quote() {
        let engine = QuoteEngine::new(cfg());
        let mut inputs = base_inputs(ready_book(dec!(0.50), dec!(0.51)));
        inputs.current_bid_price = Some(dec!(0.50));
        inputs.current_ask_price = Some(dec!(0.51));
        assert_eq!(engine.decide(&inputs), QuoteDecision::Keep);
    }

    #[test]
    fn price_extreme_suppresses_bid_side_only() {
        let engine = QuoteEngine::new(cfg());
        let inputs = base_inputs(ready_book(dec!(0.005), dec!(0.01)));
        match engine.decide(&inputs) {
            QuoteDecision::Replace { bid_size, ask_size, .. } => {
                assert_eq!(bid_size, Decimal::ZERO);
                assert!(ask_size > Decimal::ZERO);
            }
            other => panic!("expected replace with suppressed bid, got {other:?}"),
        }
    }

    #[test]
    fn zero_sizes_on_both_sides_cancels_all() {
        let engine = QuoteEngine::new(cfg());
        let mut inputs = base_inputs(ready_book(dec!(0.50), dec!(0.51)));
        inputs.size_bid = Decimal::ZERO;
        inputs.size_ask = Decimal::ZERO;
        assert_eq!(engine.decide(&inputs), QuoteDecision::CancelAll);
    }

    #[test]
    fn floor_and_ceil_to_tick_never_cross() {
        assert_eq!(floor_to_tick(dec!(0.4949), dec!(0.01)), dec!(0.49));
        assert_eq!(ceil_to_tick(dec!(0.5001), dec!(0.01)), dec!(0.51));
    }
}
