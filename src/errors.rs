//! Error taxonomy. Each component speaks its own error enum; `EngineError`
//! is the umbrella the orchestrator and `main` match on to decide whether a
//! failure is retryable, degrades to a safe state, or is fatal.

use thiserror::Error;

/// Top-level error classification, mirroring the handling policies: retry-
/// with-backoff, reject-and-log, re-auth-and-retry, force-reconcile, block-
/// placement, halt-and-flatten, reject-and-alert.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient io: {0}")]
    TransientIo(#[from] TransientIoError),

    #[error("exchange rejected request: {0}")]
    ExchangeRejection(#[from] ExchangeRejectionError),

    #[error("auth/protocol failure: {0}")]
    AuthProtocol(#[from] AuthProtocolError),

    #[error("state desync detected: {0}")]
    Desync(#[from] DesyncError),

    #[error("inventory limit: {0}")]
    Inventory(#[from] InventoryError),

    #[error("order manager: {0}")]
    OrderManager(#[from] OrderManagerError),

    #[error("drawdown threshold breached: {0}")]
    Drawdown(String),

    #[error("data integrity violation: {0}")]
    DataIntegrity(#[from] DataIntegrityError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl EngineError {
    /// Whether the orchestrator should attempt to continue after logging,
    /// rather than escalate toward a halt. Auth/protocol failures are fatal
    /// per policy, so they are deliberately excluded here even though they
    /// arrive over the same transport as transient I/O.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::TransientIo(_) => true,
            EngineError::ExchangeRejection(_) => true,
            EngineError::OrderManager(OrderManagerError::FeeFetchFailed(_)) => true,
            EngineError::OrderManager(OrderManagerError::PostOnlyCross) => true,
            EngineError::OrderManager(OrderManagerError::PlacementRejected(_)) => false,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransientIoError {
    #[error("websocket connection lost: {0}")]
    WsDisconnect(String),
    #[error("http request failed: {0}")]
    HttpFailed(#[from] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum ExchangeRejectionError {
    #[error("order rejected: {reason}")]
    OrderRejected { reason: String },
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("unknown order id referenced: {0}")]
    UnknownOrder(String),
}

#[derive(Debug, Error)]
pub enum AuthProtocolError {
    #[error("api key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("signature rejected by exchange")]
    SignatureRejected,
    #[error("session expired")]
    SessionExpired,
}

#[derive(Debug, Error)]
pub enum DesyncError {
    #[error("local and exchange order books diverge for {asset}: local={local_count} exchange={exchange_count}")]
    OrderCountMismatch {
        asset: String,
        local_count: usize,
        exchange_count: usize,
    },
    #[error("pending fill {0} never confirmed within TTL")]
    UnconfirmedFillExpired(String),
    #[error("sequence gap on {channel}: expected {expected}, got {got}")]
    SequenceGap {
        channel: String,
        expected: u64,
        got: u64,
    },
}

/// Component-level errors from InventoryManager's limit checks (§4.3).
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("unknown asset: {0}")]
    UnknownAsset(String),
}

/// Component-level errors from OrderManager's placement path (§4.6).
#[derive(Debug, Error)]
pub enum OrderManagerError {
    #[error("fee fetch failed for {0}")]
    FeeFetchFailed(String),
    #[error("order placement rejected: {0}")]
    PlacementRejected(String),
    #[error("post-only order would cross the book")]
    PostOnlyCross,
}

#[derive(Debug, Error)]
pub enum DataIntegrityError {
    #[error("crossed book for {asset}: bid {bid} >= ask {ask}")]
    CrossedBook { asset: String, bid: String, ask: String },
    #[error("negative size parsed for {asset}: {value}")]
    NegativeSize { asset: String, value: String },
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}
