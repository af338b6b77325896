//! Component B — UserChannelManager: authenticated WS stream of our own
//! order/fill events, with REST-based reconciliation as the authoritative
//! backstop. Grounded on `user_ws.rs`'s `DedupCache`/`parse_trade_event` and
//! `legacy/order_manager.rs`'s diffing `sync()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;

use crate::config::UserChannelConfig;
use crate::polymarket::types::{AssetId, Fill, Order, OrderStatus, RiskSignal, Side};
use crate::rest_client::SharedRestClient;

/// Bounds memory and rejects stale duplicate trade ids, mirroring the
/// teacher's TTL + size-capped cache.
pub struct DedupCache {
    seen: HashMap<String, Instant>,
    ttl: Duration,
    capacity: usize,
}

impl DedupCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            ttl,
            capacity,
        }
    }

    /// Returns true if `key` was not seen (or had aged out) and is now
    /// recorded; false if it is a duplicate within the TTL window.
    pub fn check_and_insert(&mut self, key: &str) -> bool {
        let now = Instant::now();
        self.evict_expired(now);
        if let Some(seen_at) = self.seen.get(key) {
            if now.duration_since(*seen_at) < self.ttl {
                return false;
            }
        }
        if self.seen.len() >= self.capacity {
            if let Some(oldest_key) = self.seen.iter().min_by_key(|(_, t)| **t).map(|(k, _)| k.clone()) {
                self.seen.remove(&oldest_key);
            }
        }
        self.seen.insert(key.to_string(), now);
        true
    }

    fn evict_expired(&mut self, now: Instant) {
        self.seen.retain(|_, t| now.duration_since(*t) < self.ttl);
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
enum UserWsEvent {
    Trade {
        trade_id: Option<String>,
        order_id: String,
        asset_id: String,
        side: String,
        price: Decimal,
        size: Decimal,
        #[serde(default)]
        fee: Decimal,
        timestamp_ms: i64,
    },
    OrderUpdate {
        order_id: String,
        asset_id: String,
        side: String,
        price: Decimal,
        original_size: Decimal,
        remaining_size: Decimal,
        status: String,
    },
    #[serde(other)]
    Unknown,
}

fn parse_status(s: &str) -> OrderStatus {
    match s.to_ascii_uppercase().as_str() {
        "LIVE" => OrderStatus::Live,
        "PARTIAL" | "PARTIALLY_FILLED" => OrderStatus::Partial,
        "FILLED" | "MATCHED" => OrderStatus::Filled,
        "CANCELLED" | "CANCELED" => OrderStatus::Cancelled,
        "EXPIRED" => OrderStatus::Expired,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Live,
    }
}

fn parse_side(s: &str) -> Side {
    if s.eq_ignore_ascii_case("buy") {
        Side::Buy
    } else {
        Side::Sell
    }
}

/// Diffs the locally held open-order set against an authoritative REST
/// snapshot, returning orders that disappeared from the exchange's view
/// without a terminal status ever having arrived on the stream.
pub fn diff_against_snapshot(local: &HashMap<String, Order>, remote: &[Order]) -> Vec<String> {
    let remote_ids: std::collections::HashSet<&str> = remote.iter().map(|o| o.order_id.as_str()).collect();
    local
        .values()
        .filter(|o| !o.status.is_terminal() && !remote_ids.contains(o.order_id.as_str()))
        .map(|o| o.order_id.clone())
        .collect()
}

pub struct UserChannelManager {
    cfg: UserChannelConfig,
    assets: Vec<AssetId>,
    rest: SharedRestClient,
    open_orders: Arc<Mutex<HashMap<AssetId, HashMap<String, Order>>>>,
    orders_tx: watch::Sender<HashMap<AssetId, HashMap<String, Order>>>,
    fill_tx: mpsc::Sender<Fill>,
    fault_tx: mpsc::Sender<RiskSignal>,
    /// Triggers an immediate reconcile pass outside the fixed interval,
    /// used on reconnect so a stream gap is resolved without waiting for
    /// the next tick.
    reconcile_notify: Arc<Notify>,
}

impl UserChannelManager {
    pub fn new(
        cfg: UserChannelConfig,
        assets: Vec<AssetId>,
        rest: SharedRestClient,
        fault_tx: mpsc::Sender<RiskSignal>,
    ) -> (Self, watch::Receiver<HashMap<AssetId, HashMap<String, Order>>>, mpsc::Receiver<Fill>) {
        let (orders_tx, orders_rx) = watch::channel(HashMap::new());
        let (fill_tx, fill_rx) = mpsc::channel(1024);
        (
            Self {
                cfg,
                assets,
                rest,
                open_orders: Arc::new(Mutex::new(HashMap::new())),
                orders_tx,
                fill_tx,
                fault_tx,
                reconcile_notify: Arc::new(Notify::new()),
            },
            orders_rx,
            fill_rx,
        )
    }

    pub async fn run(self) {
        let dedup = Arc::new(Mutex::new(DedupCache::new(
            Duration::from_millis(self.cfg.dedup_ttl_ms),
            self.cfg.dedup_capacity,
        )));

        let reconcile_handle = {
            let rest = self.rest.clone();
            let assets = self.assets.clone();
            let open_orders = self.open_orders.clone();
            let orders_tx = self.orders_tx.clone();
            let interval = Duration::from_millis(self.cfg.reconcile_interval_ms);
            let notify = self.reconcile_notify.clone();
            tokio::spawn(async move {
                Self::reconcile_loop(rest, assets, open_orders, orders_tx, interval, notify).await;
            })
        };

        loop {
            let _ = self.fault_tx.send(RiskSignal::UserChannelDisconnect).await;
            if let Err(e) = self.connect_and_listen(dedup.clone()).await {
                tracing::error!(error = %e, "user channel stream error, reconnecting");
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        #[allow(unreachable_code)]
        {
            reconcile_handle.abort();
        }
    }

    async fn reconcile_loop(
        rest: SharedRestClient,
        assets: Vec<AssetId>,
        open_orders: Arc<Mutex<HashMap<AssetId, HashMap<String, Order>>>>,
        orders_tx: watch::Sender<HashMap<AssetId, HashMap<String, Order>>>,
        interval: Duration,
        notify: Arc<Notify>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = notify.notified() => {}
            }
            for asset in &assets {
                let remote = match rest.get_open_orders(asset).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(asset = %asset, error = %e, "reconcile fetch failed");
                        continue;
                    }
                };
                let mut guard = open_orders.lock().await;
                let local = guard.entry(asset.clone()).or_default();
                let missing = diff_against_snapshot(local, &remote);
                for order_id in &missing {
                    tracing::warn!(asset = %asset, order_id, "order missing from exchange snapshot, marking expired");
                    if let Some(o) = local.get_mut(order_id) {
                        o.status = OrderStatus::Expired;
                    }
                }
                for o in remote {
                    local.insert(o.order_id.clone(), o);
                }
            }
            orders_tx.send_replace(open_orders.lock().await.clone());
        }
    }

    async fn connect_and_listen(&self, dedup: Arc<Mutex<DedupCache>>) -> anyhow::Result<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.cfg.ws_url).await?;
        let (_write, mut read) = ws_stream.split();

        let _ = self.fault_tx.send(RiskSignal::UserChannelReconnected).await;
        self.reconcile_notify.notify_one();

        while let Some(msg) = read.next().await {
            let msg = msg?;
            let Message::Text(text) = msg else { continue };
            let Ok(event) = serde_json::from_str::<UserWsEvent>(&text) else {
                tracing::debug!(raw = %text, "unparsed user channel message");
                continue;
            };
            self.apply_event(event, &dedup).await;
        }
        anyhow::bail!("user channel websocket closed")
    }

    async fn apply_event(&self, event: UserWsEvent, dedup: &Arc<Mutex<DedupCache>>) {
        match event {
            UserWsEvent::Trade {
                trade_id,
                order_id,
                asset_id,
                side,
                price,
                size,
                fee,
                timestamp_ms,
            } => {
                let fill = Fill {
                    trade_id,
                    order_id,
                    asset: AssetId(asset_id),
                    side: parse_side(&side),
                    price,
                    size,
                    fee,
                    timestamp_ms,
                };
                let key = fill.key();
                if !dedup.lock().await.check_and_insert(&key) {
                    return;
                }
                if self.fill_tx.send(fill).await.is_err() {
                    tracing::warn!("fill receiver dropped");
                }
            }
            UserWsEvent::OrderUpdate {
                order_id,
                asset_id,
                side,
                price,
                original_size,
                remaining_size,
                status,
            } => {
                let asset = AssetId(asset_id);
                let order = Order {
                    order_id: order_id.clone(),
                    asset: asset.clone(),
                    side: parse_side(&side),
                    price,
                    original_size,
                    remaining_size,
                    status: parse_status(&status),
                };
                let mut guard = self.open_orders.lock().await;
                guard.entry(asset).or_default().insert(order_id, order);
                self.orders_tx.send_replace(guard.clone());
            }
            UserWsEvent::Unknown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_rejects_repeat_within_ttl() {
        let mut cache = DedupCache::new(Duration::from_secs(60), 10);
        assert!(cache.check_and_insert("a"));
        assert!(!cache.check_and_insert("a"));
    }

    #[test]
    fn dedup_evicts_oldest_over_capacity() {
        let mut cache = DedupCache::new(Duration::from_secs(60), 2);
        assert!(cache.check_and_insert("a"));
        assert!(cache.check_and_insert("b"));
        assert!(cache.check_and_insert("c"));
        assert!(cache.check_and_insert("a"));
    }

    #[test]
    fn diff_flags_orders_missing_from_snapshot() {
        let mut local = HashMap::new();
        local.insert(
            "o1".to_string(),
            Order {
                order_id: "o1".into(),
                asset: "a".into(),
                side: Side::Buy,
                price: Decimal::new(50, 2),
                original_size: Decimal::new(10, 0),
                remaining_size: Decimal::new(10, 0),
                status: OrderStatus::Live,
            },
        );
        let missing = diff_against_snapshot(&local, &[]);
        assert_eq!(missing, vec!["o1".to_string()]);
    }
}
