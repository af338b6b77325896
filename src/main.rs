use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use quote_engine::config::Config;
use quote_engine::polymarket::orderbook::OrderbookManager;
use quote_engine::polymarket::user_channel::UserChannelManager;
use quote_engine::rest_client::RestClient;
use quote_engine::Orchestrator;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

/// Binary prediction-market maker: quotes both sides of a market with
/// inventory-aware skew and a drawdown circuit breaker.
#[derive(Parser, Debug)]
#[command(name = "quote-engine", version)]
struct Cli {
    /// Path to a TOML config file; falls back to built-in defaults plus env vars.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Build every decision but never place, cancel, or modify a live order.
    #[arg(long)]
    dry_run: bool,

    /// Run market-data and momentum detection only; skip quoting entirely.
    #[arg(long)]
    detect_only: bool,

    /// Comma-separated asset ids to quote, overriding the config file's market list.
    #[arg(long, value_delimiter = ',')]
    assets: Vec<String>,

    /// Overrides `engine.log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,
}

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_STARTUP_HALT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut cfg = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    cfg.engine.dry_run |= cli.dry_run;
    cfg.engine.detect_only |= cli.detect_only;
    if let Some(level) = cli.log_level {
        cfg.engine.log_level = level;
    }
    if !cli.assets.is_empty() {
        for market in &mut cfg.markets {
            market.assets.retain(|a| cli.assets.contains(a));
        }
        cfg.markets.retain(|m| !m.assets.is_empty());
    }

    let _log_guard = init_logging(&cfg.engine.log_level, &cfg.engine.log_dir);

    let maker_address = match std::env::var("QE_MAKER_ADDRESS") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("QE_MAKER_ADDRESS is required");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let private_key = match std::env::var("QE_PRIVATE_KEY") {
        Ok(v) => SecretString::from(v),
        Err(_) => {
            eprintln!("QE_PRIVATE_KEY is required");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let assets: Vec<_> = cfg.markets.iter().flat_map(|m| m.assets.iter().cloned()).map(Into::into).collect();
    let tick = cfg.markets.first().map(|m| m.tick_size).unwrap_or(rust_decimal_macros::dec!(0.01));

    let (fault_tx, fault_rx) = tokio::sync::mpsc::channel(256);

    let (orderbook_mgr, book_rx) = OrderbookManager::new(cfg.orderbook.clone(), assets.clone(), tick, fault_tx.clone());
    tokio::spawn(orderbook_mgr.run());

    let rest = match RestClient::new(
        &cfg.user_channel.rest_base,
        &private_key,
        maker_address,
        std::time::Duration::from_millis(cfg.order_manager.fee_cache_ttl_ms),
        cfg.order_manager.batch_max,
    ) {
        Ok(r) => std::sync::Arc::new(r),
        Err(e) => {
            eprintln!("failed to construct rest client: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let (user_channel_mgr, orders_rx, fill_rx) =
        UserChannelManager::new(cfg.user_channel.clone(), assets.clone(), rest.clone(), fault_tx.clone());
    tokio::spawn(user_channel_mgr.run());

    let mut orchestrator = match Orchestrator::new(cfg, rest.clone()) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("failed to construct orchestrator: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if let Err(e) = orchestrator.startup_reconcile().await {
        eprintln!("startup reconciliation failed, halting: {e}");
        return ExitCode::from(EXIT_STARTUP_HALT);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    match orchestrator.run(book_rx, orders_rx, fill_rx, fault_rx, shutdown_rx).await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            eprintln!("engine halted: {e}");
            ExitCode::from(EXIT_STARTUP_HALT)
        }
    }
}

fn init_logging(level: &str, log_dir: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let _ = std::fs::create_dir_all(log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "quote-engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(non_blocking)
        .init();

    guard
}
