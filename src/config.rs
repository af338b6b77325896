//! Layered configuration: built-in defaults, overridden by a TOML file,
//! overridden by environment variables (via `dotenvy`), overridden last by
//! CLI flags in `main.rs`. Generalizes the teacher's scattered
//! `FooConfig::from_env()` per-module pattern into one document while
//! keeping each component's sub-config as its own struct.

use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub orderbook: OrderbookConfig,
    pub user_channel: UserChannelConfig,
    pub inventory: InventoryConfig,
    pub momentum: MomentumConfig,
    pub quote_engine: QuoteEngineConfig,
    pub order_manager: OrderManagerConfig,
    pub risk: RiskConfig,
    pub fill_analytics: FillAnalyticsConfig,
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub markets: Vec<MarketConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub detect_only: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            dry_run: false,
            detect_only: false,
            log_dir: default_log_dir(),
        }
    }
}

/// One binary market: two complementary assets plus its tick/pricing shape.
/// `assets` pairs into a single liability group for InventoryManager's
/// per-market liability cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    pub name: String,
    pub assets: Vec<String>,
    #[serde(default = "default_tick")]
    pub tick_size: Decimal,
}

fn default_tick() -> Decimal {
    dec!(0.01)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookConfig {
    pub ws_url: String,
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_max_reconnect_backoff_ms")]
    pub max_reconnect_backoff_ms: u64,
}

fn default_stale_after_ms() -> u64 {
    5_000
}
fn default_reconnect_backoff_ms() -> u64 {
    500
}
fn default_max_reconnect_backoff_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserChannelConfig {
    pub ws_url: String,
    #[serde(default = "default_rest_base")]
    pub rest_base: String,
    #[serde(default = "default_dedup_ttl_ms")]
    pub dedup_ttl_ms: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

fn default_rest_base() -> String {
    "https://clob.polymarket.com".to_string()
}
fn default_dedup_ttl_ms() -> u64 {
    300_000
}
fn default_dedup_capacity() -> usize {
    4096
}
fn default_reconcile_interval_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    #[serde(default = "default_max_position")]
    pub max_position: Decimal,
    /// Worst-case-loss cap (≈ entry price × size, summed over the assets of
    /// one binary market) for a single market.
    #[serde(default = "default_max_liability_per_market")]
    pub max_liability_per_market: Decimal,
    /// Same cap summed across every market.
    #[serde(default = "default_max_total_liability")]
    pub max_total_liability: Decimal,
    #[serde(default = "default_pending_fill_ttl_ms")]
    pub pending_fill_ttl_ms: u64,
}

fn default_max_position() -> Decimal {
    dec!(500)
}
fn default_max_liability_per_market() -> Decimal {
    dec!(250)
}
fn default_max_total_liability() -> Decimal {
    dec!(1000)
}
fn default_pending_fill_ttl_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Absolute mid-price move, in ticks, over `window_ms` that counts as
    /// momentum. Ticks rather than bps because tick size is the unit the
    /// quoting rule itself reasons in.
    #[serde(default = "default_trigger_ticks")]
    pub trigger_ticks: Decimal,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_sweep_depth_ratio")]
    pub sweep_depth_ratio: Decimal,
}

fn default_window_ms() -> u64 {
    500
}
fn default_trigger_ticks() -> Decimal {
    dec!(3)
}
fn default_cooldown_ms() -> u64 {
    2_000
}
fn default_sweep_depth_ratio() -> Decimal {
    dec!(0.5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteEngineConfig {
    /// Nominal per-side order size before inventory/liability adjustment.
    #[serde(default = "default_order_size")]
    pub order_size: Decimal,
    /// Minimum spread, in ticks, required before the engine improves on
    /// both best_bid/best_ask by one tick.
    #[serde(default = "default_improve_when_spread_ticks")]
    pub improve_when_spread_ticks: u32,
    /// COEFFICIENT in `skew_ticks = round(COEFFICIENT * effective_size)`.
    #[serde(default = "default_skew_coefficient")]
    pub skew_coefficient: Decimal,
    #[serde(default = "default_reprice_threshold_ticks")]
    pub reprice_threshold_ticks: u32,
}

fn default_order_size() -> Decimal {
    dec!(20)
}
fn default_improve_when_spread_ticks() -> u32 {
    4
}
fn default_skew_coefficient() -> Decimal {
    dec!(0.1)
}
fn default_reprice_threshold_ticks() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderManagerConfig {
    #[serde(default = "default_max_open_per_asset")]
    pub max_open_per_asset: usize,
    #[serde(default = "default_min_repost_interval_ms")]
    pub min_repost_interval_ms: u64,
    #[serde(default = "default_global_rate_per_sec")]
    pub global_rate_per_sec: u32,
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    #[serde(default = "default_fee_cache_ttl_ms")]
    pub fee_cache_ttl_ms: u64,
}

fn default_max_open_per_asset() -> usize {
    2
}
fn default_min_repost_interval_ms() -> u64 {
    500
}
fn default_global_rate_per_sec() -> u32 {
    10
}
fn default_batch_max() -> usize {
    15
}
fn default_fee_cache_ttl_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Consecutive order-manager errors (per market) before entering
    /// WARNING.
    #[serde(default = "default_warning_errors_threshold")]
    pub warning_errors_threshold: u32,
    /// Consecutive order-manager errors (per market) before entering
    /// HALTED.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// Errors within a rolling one-hour window (per market) before HALTED.
    #[serde(default = "default_max_errors_per_hour")]
    pub max_errors_per_hour: u32,
    #[serde(default = "default_max_drawdown_per_market_bps")]
    pub max_drawdown_per_market_bps: Decimal,
    #[serde(default = "default_max_drawdown_global_bps")]
    pub max_drawdown_global_bps: Decimal,
    /// A single fill's realized loss (in quote currency) that halts the
    /// market it occurred on.
    #[serde(default = "default_max_loss_per_trade")]
    pub max_loss_per_trade: Decimal,
    /// Unresolved sequence-gap reconcile attempts (per market) before
    /// HALTED.
    #[serde(default = "default_ws_gap_reconcile_attempts")]
    pub ws_gap_reconcile_attempts: u32,
    /// Feed silence before NORMAL → WARNING (global).
    #[serde(default = "default_stale_feed_threshold_ms")]
    pub stale_feed_threshold_ms: u64,
    #[serde(default = "default_circuit_breaker_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,
    #[serde(default = "default_circuit_breaker_recovery_ms")]
    pub circuit_breaker_recovery_ms: u64,
    /// If true, HALTED never auto-advances to RECOVERING; an operator must
    /// call `clear_halt`.
    #[serde(default)]
    pub require_manual_reset: bool,
}

fn default_warning_errors_threshold() -> u32 {
    2
}
fn default_max_consecutive_errors() -> u32 {
    5
}
fn default_max_errors_per_hour() -> u32 {
    20
}
fn default_max_drawdown_per_market_bps() -> Decimal {
    dec!(300)
}
fn default_max_drawdown_global_bps() -> Decimal {
    dec!(500)
}
fn default_max_loss_per_trade() -> Decimal {
    dec!(50)
}
fn default_ws_gap_reconcile_attempts() -> u32 {
    3
}
fn default_stale_feed_threshold_ms() -> u64 {
    10_000
}
fn default_circuit_breaker_cooldown_ms() -> u64 {
    60_000
}
fn default_circuit_breaker_recovery_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillAnalyticsConfig {
    #[serde(default = "default_markout_horizons_s")]
    pub markout_horizons_s: Vec<u64>,
}

fn default_markout_horizons_s() -> Vec<u64> {
    vec![1, 5, 15, 30, 60]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "quote_engine.db".to_string()
}

impl Config {
    /// Loads defaults, then overlays a TOML file if present, then overlays
    /// environment variables loaded via `.env` (dotenvy). CLI overlays are
    /// applied by the caller after this returns.
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        dotenvy::dotenv().ok();

        let mut cfg = if let Some(p) = path {
            let text = std::fs::read_to_string(p)
                .map_err(|e| EngineError::Config(format!("reading {}: {e}", p.display())))?;
            toml::from_str::<Config>(&text).map_err(|e| EngineError::Config(format!("parsing {}: {e}", p.display())))?
        } else {
            Config::default_shape()?
        };

        if let Ok(v) = std::env::var("QE_LOG_LEVEL") {
            cfg.engine.log_level = v;
        }
        if let Ok(v) = std::env::var("QE_WS_URL") {
            cfg.orderbook.ws_url = v.clone();
            cfg.user_channel.ws_url = v;
        }
        if let Ok(v) = std::env::var("QE_REST_BASE") {
            cfg.user_channel.rest_base = v;
        }
        if let Ok(v) = std::env::var("QE_DB_PATH") {
            cfg.persistence.db_path = v;
        }

        Ok(cfg)
    }

    /// Minimal valid shape used when no TOML file is given; requires the
    /// caller to supply endpoints via env vars before connecting.
    fn default_shape() -> Result<Self, EngineError> {
        Ok(Config {
            engine: EngineConfig::default(),
            orderbook: OrderbookConfig {
                ws_url: std::env::var("QE_WS_URL").unwrap_or_default(),
                stale_after_ms: default_stale_after_ms(),
                reconnect_backoff_ms: default_reconnect_backoff_ms(),
                max_reconnect_backoff_ms: default_max_reconnect_backoff_ms(),
            },
            user_channel: UserChannelConfig {
                ws_url: std::env::var("QE_WS_URL").unwrap_or_default(),
                rest_base: default_rest_base(),
                dedup_ttl_ms: default_dedup_ttl_ms(),
                dedup_capacity: default_dedup_capacity(),
                reconcile_interval_ms: default_reconcile_interval_ms(),
            },
            inventory: InventoryConfig {
                max_position: default_max_position(),
                max_liability_per_market: default_max_liability_per_market(),
                max_total_liability: default_max_total_liability(),
                pending_fill_ttl_ms: default_pending_fill_ttl_ms(),
            },
            momentum: MomentumConfig {
                window_ms: default_window_ms(),
                trigger_ticks: default_trigger_ticks(),
                cooldown_ms: default_cooldown_ms(),
                sweep_depth_ratio: default_sweep_depth_ratio(),
            },
            quote_engine: QuoteEngineConfig {
                order_size: default_order_size(),
                improve_when_spread_ticks: default_improve_when_spread_ticks(),
                skew_coefficient: default_skew_coefficient(),
                reprice_threshold_ticks: default_reprice_threshold_ticks(),
            },
            order_manager: OrderManagerConfig {
                max_open_per_asset: default_max_open_per_asset(),
                min_repost_interval_ms: default_min_repost_interval_ms(),
                global_rate_per_sec: default_global_rate_per_sec(),
                batch_max: default_batch_max(),
                fee_cache_ttl_ms: default_fee_cache_ttl_ms(),
            },
            risk: RiskConfig {
                warning_errors_threshold: default_warning_errors_threshold(),
                max_consecutive_errors: default_max_consecutive_errors(),
                max_errors_per_hour: default_max_errors_per_hour(),
                max_drawdown_per_market_bps: default_max_drawdown_per_market_bps(),
                max_drawdown_global_bps: default_max_drawdown_global_bps(),
                max_loss_per_trade: default_max_loss_per_trade(),
                ws_gap_reconcile_attempts: default_ws_gap_reconcile_attempts(),
                stale_feed_threshold_ms: default_stale_feed_threshold_ms(),
                circuit_breaker_cooldown_ms: default_circuit_breaker_cooldown_ms(),
                circuit_breaker_recovery_ms: default_circuit_breaker_recovery_ms(),
                require_manual_reset: false,
            },
            fill_analytics: FillAnalyticsConfig {
                markout_horizons_s: default_markout_horizons_s(),
            },
            persistence: PersistenceConfig {
                db_path: default_db_path(),
            },
            markets: Vec::new(),
        })
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.user_channel.reconcile_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let toml_text = r#"
[engine]
[orderbook]
ws_url = "wss://example/market"
[user_channel]
ws_url = "wss://example/user"
[inventory]
[momentum]
[quote_engine]
[order_manager]
[risk]
[fill_analytics]
[persistence]
"#;
        let cfg: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.inventory.max_position, dec!(500));
        assert_eq!(cfg.inventory.pending_fill_ttl_ms, 30_000);
        assert_eq!(cfg.fill_analytics.markout_horizons_s, vec![1, 5, 15, 30, 60]);
    }
}
