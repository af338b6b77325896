//! Component I — Orchestrator: wires A–H together, drives the main
//! decision loop, and handles startup reconciliation and graceful
//! shutdown. Grounded on `bin/polymarket_v2.rs::main`'s channel wiring and
//! `tokio::select!` shape, plus `Zuytan-rustrade/risk_manager.rs`'s
//! multi-timer loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;

use crate::config::Config;
use crate::errors::EngineError;
use crate::persistence::Store;
use crate::polymarket::fill_analytics::FillAnalytics;
use crate::polymarket::inventory::InventoryManager;
use crate::polymarket::momentum::MomentumDetector;
use crate::polymarket::order_manager::OrderManager;
use crate::polymarket::quote_engine::{QuoteEngine, QuoteInputs};
use crate::polymarket::risk_manager::RiskManager;
use crate::polymarket::types::{AssetId, RiskSignal, TopOfBook};
use crate::rest_client::RestClient;

const TICK_INTERVAL: Duration = Duration::from_millis(250);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    cfg: Config,
    assets: Vec<AssetId>,
    tick_size: Decimal,
    store: Store,
    rest: Arc<RestClient>,
    inventory: InventoryManager,
    momentum: MomentumDetector,
    quote_engine: QuoteEngine,
    order_manager: OrderManager,
    risk: RiskManager,
    fill_analytics: FillAnalytics,
    session_id: Option<i64>,
}

impl Orchestrator {
    pub fn new(cfg: Config, rest: Arc<RestClient>) -> Result<Self, EngineError> {
        let assets: Vec<AssetId> = cfg
            .markets
            .iter()
            .flat_map(|m| m.assets.iter().cloned())
            .map(AssetId::from)
            .collect();
        let tick_size = cfg.markets.first().map(|m| m.tick_size).unwrap_or(rust_decimal_macros::dec!(0.01));

        let groups: HashMap<AssetId, String> = cfg
            .markets
            .iter()
            .flat_map(|m| m.assets.iter().map(move |a| (AssetId::from(a.clone()), m.name.clone())))
            .collect();

        let store = Store::open(&cfg.persistence.db_path)?;

        let (inventory, _inv_rx) = InventoryManager::new(cfg.inventory.clone(), &assets, groups);
        let (momentum, _mom_rx) = MomentumDetector::new(cfg.momentum.clone());
        let quote_engine = QuoteEngine::new(cfg.quote_engine.clone());
        let order_manager = OrderManager::new(cfg.order_manager.clone(), rest.clone(), cfg.engine.dry_run);
        let risk = RiskManager::new(cfg.risk.clone(), Instant::now());
        let fill_analytics = FillAnalytics::new(cfg.fill_analytics.clone());

        Ok(Self {
            cfg,
            assets,
            tick_size,
            store,
            rest,
            inventory,
            momentum,
            quote_engine,
            order_manager,
            risk,
            fill_analytics,
            session_id: None,
        })
    }

    /// Startup: pulls authoritative positions and open orders from REST
    /// before the main loop starts quoting, so the engine never quotes
    /// blind to existing exposure.
    pub async fn startup_reconcile(&mut self) -> Result<(), EngineError> {
        let session_id = self.store.start_session(now_ms(), self.cfg.engine.dry_run)?;
        tracing::info!(session_id, "starting session");
        self.session_id = Some(session_id);

        let positions = self.rest.get_positions().await?;
        let now = Instant::now();
        for row in positions {
            self.inventory.set_position(&AssetId::from(row.asset), row.size, now);
        }
        for asset in self.assets.clone() {
            let orders = self.rest.get_open_orders(&asset).await?;
            self.order_manager.sync_from_snapshot(&asset, orders, &mut self.inventory);
        }
        Ok(())
    }

    /// Drives the main loop: on every market-data change, computes a fresh
    /// quote decision for the affected asset; on a fixed interval, runs
    /// maintenance (pending-fill expiry, risk ticking, markout sampling);
    /// hard-fault signals from the public feed or user channel bypass both
    /// cadences and reach RiskManager immediately.
    /// Exits only on an unrecoverable error or external shutdown signal.
    pub async fn run(
        mut self,
        mut book_rx: tokio::sync::watch::Receiver<HashMap<AssetId, TopOfBook>>,
        mut orders_rx: tokio::sync::watch::Receiver<HashMap<AssetId, HashMap<String, crate::polymarket::types::Order>>>,
        mut fill_rx: tokio::sync::mpsc::Receiver<crate::polymarket::types::Fill>,
        mut fault_rx: tokio::sync::mpsc::Receiver<RiskSignal>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        let mut quote_tick = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("shutdown signal received");
                        break;
                    }
                }
                changed = book_rx.changed() => {
                    if changed.is_err() {
                        return Err(EngineError::Desync(crate::errors::DesyncError::SequenceGap {
                            channel: "orderbook".into(),
                            expected: 0,
                            got: 0,
                        }));
                    }
                    self.observe_books(&book_rx.borrow());
                }
                changed = orders_rx.changed() => {
                    if changed.is_err() {
                        tracing::error!("user channel order snapshot stream closed, halting");
                        break;
                    }
                    self.observe_orders(&orders_rx.borrow());
                }
                fill = fill_rx.recv() => {
                    match fill {
                        Some(fill) => self.on_fill(fill),
                        None => {
                            tracing::error!("fill channel closed, halting");
                            break;
                        }
                    }
                }
                signal = fault_rx.recv() => {
                    match signal {
                        Some(signal) => self.on_risk_signal(signal).await,
                        None => {
                            tracing::error!("fault channel closed, halting");
                            break;
                        }
                    }
                }
                _ = quote_tick.tick() => {
                    self.quote_pass(&book_rx.borrow().clone()).await;
                }
                _ = maintenance.tick() => {
                    self.maintenance_pass(&book_rx.borrow().clone());
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn observe_books(&mut self, books: &HashMap<AssetId, TopOfBook>) {
        let now = Instant::now();
        for (asset, book) in books {
            self.momentum.observe(asset, book, now);
        }
    }

    /// Folds the authoritative order snapshot from UserChannelManager into
    /// OrderManager's view, so exchange-side cancellations, fills, and
    /// expiries are reflected even when our own placement calls weren't
    /// the cause.
    fn observe_orders(&mut self, orders: &HashMap<AssetId, HashMap<String, crate::polymarket::types::Order>>) {
        for (asset, by_id) in orders {
            self.order_manager
                .sync_from_snapshot(asset, by_id.values().cloned().collect(), &mut self.inventory);
        }
    }

    fn on_fill(&mut self, fill: crate::polymarket::types::Fill) {
        let now = Instant::now();
        tracing::info!(asset = %fill.asset, side = fill.side.as_str(), price = %fill.price, size = %fill.size, "fill observed");
        if let Err(e) = self.store.record_fill(&fill) {
            tracing::warn!(error = %e, "failed to persist fill");
        }
        self.fill_analytics.record_fill(&fill, now);
        self.inventory.record_pending_fill(fill, now);
    }

    /// Routes a hard-fault signal from the orderbook or user-channel
    /// components directly into RiskManager, bypassing the quote/
    /// maintenance cadence so a disconnect is never visible late.
    async fn on_risk_signal(&mut self, signal: RiskSignal) {
        tracing::warn!(?signal, "risk signal received");
        self.risk.on_risk_signal(&signal, Instant::now());
        if matches!(signal, RiskSignal::UserChannelDisconnect) {
            for asset in self.assets.clone() {
                if let Err(e) = self.order_manager.apply(
                    &asset,
                    crate::polymarket::types::QuoteDecision::CancelAll,
                    &mut self.inventory,
                    crate::polymarket::types::RiskState::Halted,
                    Instant::now(),
                ).await {
                    tracing::warn!(asset = %asset, error = %e, "failed to flatten quotes after user channel disconnect");
                }
            }
        }
    }

    async fn quote_pass(&mut self, books: &HashMap<AssetId, TopOfBook>) {
        if self.cfg.engine.detect_only {
            return;
        }
        let now = Instant::now();
        self.risk.tick(now);

        for asset in self.assets.clone() {
            let Some(book) = books.get(&asset) else { continue };
            let risk_state = self.risk.effective_state(&asset);
            let effective_size = self.inventory.effective_size(&asset);
            let momentum = self.momentum.current_flag(&asset);
            let current = self.order_manager.live_orders_for(&asset);
            let current_bid = current
                .iter()
                .find(|o| o.side == crate::polymarket::types::Side::Buy)
                .map(|o| o.price);
            let current_ask = current
                .iter()
                .find(|o| o.side == crate::polymarket::types::Side::Sell)
                .map(|o| o.price);

            let desired_size = self.cfg.quote_engine.order_size;
            let size_bid = self.inventory.adjusted_buy_size(&asset, desired_size, book.best_bid, risk_state);
            let size_ask = desired_size.min(effective_size).max(Decimal::ZERO);

            let inputs = QuoteInputs {
                book: *book,
                effective_size,
                momentum,
                risk_state,
                current_bid_price: current_bid,
                current_ask_price: current_ask,
                size_bid,
                size_ask,
            };
            let decision = self.quote_engine.decide(&inputs);
            if let Err(e) = self.order_manager.apply(&asset, decision, &mut self.inventory, risk_state, now).await {
                tracing::warn!(asset = %asset, error = %e, "order manager apply failed");
                if !e.is_recoverable() {
                    self.risk.record_error(&asset, now);
                }
            } else {
                self.risk.record_success(&asset, now);
            }
        }
    }

    fn maintenance_pass(&mut self, books: &HashMap<AssetId, TopOfBook>) {
        let now = Instant::now();
        let expired = self.inventory.expire_stale_pending(now);
        for (asset, key) in expired {
            tracing::warn!(asset = %asset, key, "pending fill expired unconfirmed, flagging desync");
        }

        let mids: HashMap<AssetId, Decimal> = books
            .iter()
            .map(|(a, b)| (a.clone(), (b.best_bid + b.best_ask) / Decimal::new(2, 0)))
            .collect();
        self.fill_analytics.tick(&mids, &self.store, now, now_ms());

        for asset in self.assets.clone() {
            let mid = mids.get(&asset).copied().unwrap_or(Decimal::ZERO);
            if mid > Decimal::ZERO {
                let equity = self.inventory.equity(&asset, mid);
                self.risk.observe_equity(&asset, equity, now);
            }
        }
        self.risk.observe_global_equity(self.inventory.total_equity(&mids), now);
    }

    async fn shutdown(mut self) {
        tracing::info!("shutting down, cancelling all live orders");
        for asset in self.assets.clone() {
            if let Err(e) = self.order_manager.apply(
                &asset,
                crate::polymarket::types::QuoteDecision::CancelAll,
                &mut self.inventory,
                crate::polymarket::types::RiskState::Halted,
                Instant::now(),
            ).await {
                tracing::warn!(asset = %asset, error = %e, "failed to cancel orders during shutdown");
            }
        }
        if let Some(session_id) = self.session_id {
            if let Err(e) = self.store.end_session(session_id, now_ms()) {
                tracing::warn!(error = %e, "failed to record session end");
            }
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
