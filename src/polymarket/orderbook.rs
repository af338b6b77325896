//! Component A — OrderbookManager: public market-data WS → per-asset
//! top-of-book. Grounded on `bin/polymarket_v2.rs`'s `run_market_ws` /
//! `BookAssembler` / `parse_ws_message`, generalized from a fixed YES/NO
//! pair to an arbitrary `Vec<AssetId>`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::config::OrderbookConfig;
use crate::polymarket::types::{AssetId, PriceLevel, RiskSignal, TopOfBook};

#[derive(Debug, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
enum WsEvent {
    Book {
        asset_id: String,
        bids: Vec<RawLevel>,
        asks: Vec<RawLevel>,
        #[serde(default)]
        seq: Option<u64>,
    },
    PriceChange {
        asset_id: String,
        price: Decimal,
        side: String,
        size: Decimal,
        #[serde(default)]
        seq: Option<u64>,
    },
    /// Preferred input for quote decisions when the exchange sends it
    /// directly: cheaper to parse than reconstructing the touch from full
    /// depth, and doesn't disturb the depth already held by `bids`/`asks`.
    BestBidAsk {
        asset_id: String,
        best_bid: Decimal,
        best_bid_size: Decimal,
        best_ask: Decimal,
        best_ask_size: Decimal,
        #[serde(default)]
        seq: Option<u64>,
    },
    LastTradePrice {
        asset_id: String,
        price: Decimal,
    },
    TickSizeChange {
        asset_id: String,
        new_tick_size: Decimal,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: Decimal,
    size: Decimal,
}

/// Maintains a sorted book per asset so top-of-book survives incremental
/// `price_change` events between full `book` snapshots. A `best_bid_ask`
/// event overrides the derived touch without discarding the depth backing
/// `bids`/`asks`, so a later `price_change` still has something to apply to.
struct BookAssembler {
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    tick: Decimal,
    last_trade_price: Option<Decimal>,
    top_override: Option<(Decimal, Decimal, Decimal, Decimal)>,
}

impl BookAssembler {
    fn new(tick: Decimal) -> Self {
        Self {
            bids: Vec::new(),
            asks: Vec::new(),
            tick,
            last_trade_price: None,
            top_override: None,
        }
    }

    fn replace_book(&mut self, bids: Vec<RawLevel>, asks: Vec<RawLevel>) {
        self.bids = bids.into_iter().map(|l| PriceLevel { price: l.price, size: l.size }).collect();
        self.asks = asks.into_iter().map(|l| PriceLevel { price: l.price, size: l.size }).collect();
        self.bids.sort_by(|a, b| b.price.cmp(&a.price));
        self.asks.sort_by(|a, b| a.price.cmp(&b.price));
        self.top_override = None;
    }

    fn apply_price_change(&mut self, side: &str, price: Decimal, size: Decimal) {
        let levels = if side.eq_ignore_ascii_case("buy") { &mut self.bids } else { &mut self.asks };
        levels.retain(|l| l.price != price);
        if size > Decimal::ZERO {
            levels.push(PriceLevel { price, size });
        }
        if side.eq_ignore_ascii_case("buy") {
            self.bids.sort_by(|a, b| b.price.cmp(&a.price));
        } else {
            self.asks.sort_by(|a, b| a.price.cmp(&b.price));
        }
        self.top_override = None;
    }

    fn apply_best_bid_ask(&mut self, best_bid: Decimal, best_bid_size: Decimal, best_ask: Decimal, best_ask_size: Decimal) {
        self.top_override = Some((best_bid, best_bid_size, best_ask, best_ask_size));
    }

    fn top(&self, now: Instant, stale: bool) -> Option<TopOfBook> {
        if let Some((best_bid, best_bid_size, best_ask, best_ask_size)) = self.top_override {
            return Some(TopOfBook {
                best_bid,
                best_bid_size,
                best_ask,
                best_ask_size,
                tick: self.tick,
                last_trade_price: self.last_trade_price,
                ts: now,
                stale,
            });
        }
        let best = self.bids.first()?;
        let ask = self.asks.first()?;
        Some(TopOfBook {
            best_bid: best.price,
            best_bid_size: best.size,
            best_ask: ask.price,
            best_ask_size: ask.size,
            tick: self.tick,
            last_trade_price: self.last_trade_price,
            ts: now,
            stale,
        })
    }
}

pub struct OrderbookManager {
    cfg: OrderbookConfig,
    assets: Vec<AssetId>,
    tick: Decimal,
    tx: watch::Sender<HashMap<AssetId, TopOfBook>>,
    fault_tx: mpsc::Sender<RiskSignal>,
}

impl OrderbookManager {
    pub fn new(
        cfg: OrderbookConfig,
        assets: Vec<AssetId>,
        tick: Decimal,
        fault_tx: mpsc::Sender<RiskSignal>,
    ) -> (Self, watch::Receiver<HashMap<AssetId, TopOfBook>>) {
        let (tx, rx) = watch::channel(HashMap::new());
        (Self { cfg, assets, tick, tx, fault_tx }, rx)
    }

    /// Runs until the process shuts down, reconnecting with exponential
    /// backoff on every disconnect and marking all books stale meanwhile.
    pub async fn run(self) {
        let mut backoff = Duration::from_millis(self.cfg.reconnect_backoff_ms);
        let max_backoff = Duration::from_millis(self.cfg.max_reconnect_backoff_ms);

        loop {
            self.mark_all_stale();
            let _ = self.fault_tx.send(RiskSignal::PublicFeedDisconnect).await;
            match self.connect_and_stream().await {
                Ok(()) => {
                    tracing::warn!("market data stream ended cleanly, reconnecting");
                }
                Err(e) => {
                    tracing::error!(error = %e, "market data stream error, reconnecting");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, max_backoff);
        }
    }

    fn mark_all_stale(&self) {
        self.tx.send_modify(|books| {
            for book in books.values_mut() {
                book.stale = true;
            }
        });
    }

    async fn connect_and_stream(&self) -> anyhow::Result<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.cfg.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        let sub = serde_json::json!({ "assets_ids": self.assets.iter().map(|a| a.as_str()).collect::<Vec<_>>() });
        write.send(Message::Text(sub.to_string())).await?;

        let mut assemblers: HashMap<AssetId, BookAssembler> = HashMap::new();
        let mut last_seq: HashMap<AssetId, u64> = HashMap::new();
        let stale_after = Duration::from_millis(self.cfg.stale_after_ms);
        let mut last_msg = Instant::now();

        loop {
            let msg = tokio::select! {
                m = read.next() => m,
                _ = tokio::time::sleep(stale_after) => {
                    if last_msg.elapsed() >= stale_after {
                        self.mark_all_stale();
                        let _ = self.fault_tx.send(RiskSignal::PublicFeedDisconnect).await;
                    }
                    continue;
                }
            };

            let Some(msg) = msg else {
                anyhow::bail!("websocket stream closed");
            };
            let msg = msg?;
            let Message::Text(text) = msg else { continue };
            last_msg = Instant::now();

            let Ok(event) = serde_json::from_str::<WsEvent>(&text) else {
                tracing::debug!(raw = %text, "unparsed market data message");
                continue;
            };

            self.check_sequence(&event, &mut last_seq).await;
            self.apply_event(&mut assemblers, event);
        }
    }

    /// Flags a gap on the per-asset sequence counter when present; the
    /// exchange contract does not guarantee `seq` on every message type, so
    /// absence is not itself treated as a gap.
    async fn check_sequence(&self, event: &WsEvent, last_seq: &mut HashMap<AssetId, u64>) {
        let (asset_id, seq) = match event {
            WsEvent::Book { asset_id, seq: Some(s), .. } => (asset_id, *s),
            WsEvent::PriceChange { asset_id, seq: Some(s), .. } => (asset_id, *s),
            WsEvent::BestBidAsk { asset_id, seq: Some(s), .. } => (asset_id, *s),
            _ => return,
        };
        let asset = AssetId(asset_id.clone());
        if let Some(prev) = last_seq.get(&asset) {
            if seq > prev + 1 {
                let _ = self
                    .fault_tx
                    .send(RiskSignal::PublicFeedGap { asset: asset.clone(), expected: prev + 1, got: seq })
                    .await;
            }
        }
        last_seq.insert(asset, seq);
    }

    fn apply_event(&self, assemblers: &mut HashMap<AssetId, BookAssembler>, event: WsEvent) {
        let now = Instant::now();
        match event {
            WsEvent::Book { asset_id, bids, asks, .. } => {
                let asset = AssetId(asset_id);
                let assembler = assemblers.entry(asset.clone()).or_insert_with(|| BookAssembler::new(self.tick));
                assembler.replace_book(bids, asks);
                self.publish(asset, assembler, now);
            }
            WsEvent::PriceChange { asset_id, price, side, size, .. } => {
                let asset = AssetId(asset_id);
                if let Some(assembler) = assemblers.get_mut(&asset) {
                    assembler.apply_price_change(&side, price, size);
                    self.publish(asset, assembler, now);
                }
            }
            WsEvent::BestBidAsk { asset_id, best_bid, best_bid_size, best_ask, best_ask_size, .. } => {
                let asset = AssetId(asset_id);
                let assembler = assemblers.entry(asset.clone()).or_insert_with(|| BookAssembler::new(self.tick));
                assembler.apply_best_bid_ask(best_bid, best_bid_size, best_ask, best_ask_size);
                self.publish(asset, assembler, now);
            }
            WsEvent::LastTradePrice { asset_id, price } => {
                let asset = AssetId(asset_id);
                if let Some(assembler) = assemblers.get_mut(&asset) {
                    assembler.last_trade_price = Some(price);
                }
            }
            WsEvent::TickSizeChange { asset_id, new_tick_size } => {
                let asset = AssetId(asset_id);
                if let Some(assembler) = assemblers.get_mut(&asset) {
                    assembler.tick = new_tick_size;
                    self.publish(asset, assembler, now);
                }
            }
            WsEvent::Unknown => {}
        }
    }

    fn publish(&self, asset: AssetId, assembler: &BookAssembler, now: Instant) {
        if let Some(top) = assembler.top(now, false) {
            self.tx.send_modify(|books| {
                books.insert(asset, top);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_book_sorts_descending_bids_ascending_asks() {
        let mut a = BookAssembler::new(Decimal::new(1, 2));
        a.replace_book(
            vec![RawLevel { price: Decimal::new(45, 2), size: Decimal::ONE }, RawLevel { price: Decimal::new(50, 2), size: Decimal::ONE }],
            vec![RawLevel { price: Decimal::new(60, 2), size: Decimal::ONE }, RawLevel { price: Decimal::new(55, 2), size: Decimal::ONE }],
        );
        assert_eq!(a.bids[0].price, Decimal::new(50, 2));
        assert_eq!(a.asks[0].price, Decimal::new(55, 2));
    }

    #[test]
    fn price_change_zero_size_removes_level() {
        let mut a = BookAssembler::new(Decimal::new(1, 2));
        a.replace_book(vec![RawLevel { price: Decimal::new(50, 2), size: Decimal::ONE }], vec![]);
        a.apply_price_change("buy", Decimal::new(50, 2), Decimal::ZERO);
        assert!(a.bids.is_empty());
    }

    #[test]
    fn top_is_none_without_both_sides() {
        let a = BookAssembler::new(Decimal::new(1, 2));
        assert!(a.top(Instant::now(), false).is_none());
    }

    #[test]
    fn best_bid_ask_override_takes_precedence_over_depth() {
        let mut a = BookAssembler::new(Decimal::new(1, 2));
        a.replace_book(
            vec![RawLevel { price: Decimal::new(49, 2), size: Decimal::ONE }],
            vec![RawLevel { price: Decimal::new(51, 2), size: Decimal::ONE }],
        );
        a.apply_best_bid_ask(Decimal::new(50, 2), Decimal::new(5, 0), Decimal::new(52, 2), Decimal::new(5, 0));
        let top = a.top(Instant::now(), false).unwrap();
        assert_eq!(top.best_bid, Decimal::new(50, 2));
        assert_eq!(top.best_ask, Decimal::new(52, 2));
    }

    #[test]
    fn price_change_clears_stale_override() {
        let mut a = BookAssembler::new(Decimal::new(1, 2));
        a.replace_book(
            vec![RawLevel { price: Decimal::new(49, 2), size: Decimal::ONE }],
            vec![RawLevel { price: Decimal::new(51, 2), size: Decimal::ONE }],
        );
        a.apply_best_bid_ask(Decimal::new(50, 2), Decimal::new(5, 0), Decimal::new(52, 2), Decimal::new(5, 0));
        a.apply_price_change("buy", Decimal::new(49, 2), Decimal::new(2, 0));
        let top = a.top(Instant::now(), false).unwrap();
        assert_eq!(top.best_bid, Decimal::new(49, 2));
    }

    #[test]
    fn tick_size_change_mutates_live_tick() {
        let mut a = BookAssembler::new(Decimal::new(1, 2));
        a.tick = Decimal::new(5, 3);
        assert_eq!(a.tick, Decimal::new(5, 3));
    }
}
