//! Exchange REST wrapper: credential derivation, fee-rate caching,
//! position/open-order reads, and order placement/cancellation. Grounded on
//! `executor.rs`'s `init_clob_client`/`place_post_only_order` pair, with the
//! L1→L2 API key derivation carried over from `user_ws.rs`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::signers::local::LocalSigner;
use alloy::signers::k256::ecdsa::SigningKey;
use polymarket_client_sdk::clob::ClobClient;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::{AuthProtocolError, EngineError, ExchangeRejectionError, TransientIoError};
use crate::polymarket::types::{AssetId, Order, OrderStatus, Side};

#[derive(Debug, Clone, Serialize)]
pub struct OrderParams {
    pub asset: String,
    pub side: String,
    pub price: String,
    pub size: String,
    /// Post-only: the exchange must reject rather than cross the book.
    pub post_only: bool,
    /// Maker fee rate at signing time, in bps; carried in the signed
    /// payload so the exchange can verify it matches what it quoted us.
    pub fee_rate_bps: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedOrder {
    pub params: OrderParams,
    pub signature: String,
    pub maker_address: String,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostOrderRequest {
    pub order: SignedOrder,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub error_msg: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOrderRequest {
    pub order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionRow {
    pub asset: String,
    pub size: Decimal,
}

struct FeeCacheEntry {
    rate_bps: Decimal,
    fetched_at: Instant,
}

pub struct RestClient {
    client: ClobClient,
    signer: LocalSigner<SigningKey>,
    maker_address: String,
    fee_cache: Mutex<std::collections::HashMap<String, FeeCacheEntry>>,
    fee_cache_ttl: Duration,
    batch_max: usize,
}

impl RestClient {
    pub fn new(
        rest_base: &str,
        private_key: &SecretString,
        maker_address: String,
        fee_cache_ttl: Duration,
        batch_max: usize,
    ) -> Result<Self, EngineError> {
        let signer: LocalSigner<SigningKey> = private_key
            .expose_secret()
            .parse()
            .map_err(|e| EngineError::AuthProtocol(AuthProtocolError::KeyDerivation(format!("{e}"))))?;
        let client = ClobClient::new(rest_base);
        Ok(Self {
            client,
            signer,
            maker_address,
            fee_cache: Mutex::new(std::collections::HashMap::new()),
            fee_cache_ttl,
            batch_max,
        })
    }

    /// L1 (EOA signature) → L2 (API key/secret/passphrase) derivation, done
    /// once at startup and refreshed only on `SessionExpired`.
    pub async fn derive_api_key(&self) -> Result<(String, SecretString, SecretString), EngineError> {
        self.client
            .derive_api_key(&self.signer)
            .await
            .map_err(|e| EngineError::AuthProtocol(AuthProtocolError::KeyDerivation(format!("{e}"))))
    }

    pub async fn get_fee_rate_bps(&self, asset: &AssetId) -> Result<Decimal, EngineError> {
        let mut cache = self.fee_cache.lock().await;
        if let Some(entry) = cache.get(asset.as_str()) {
            if entry.fetched_at.elapsed() < self.fee_cache_ttl {
                return Ok(entry.rate_bps);
            }
        }
        let rate = self
            .client
            .fee_rate(asset.as_str())
            .await
            .map_err(|e| EngineError::TransientIo(TransientIoError::HttpFailed(e)))?;
        cache.insert(
            asset.as_str().to_string(),
            FeeCacheEntry {
                rate_bps: rate,
                fetched_at: Instant::now(),
            },
        );
        Ok(rate)
    }

    pub async fn get_positions(&self) -> Result<Vec<PositionRow>, EngineError> {
        self.client
            .positions(&self.maker_address)
            .await
            .map_err(|e| EngineError::TransientIo(TransientIoError::HttpFailed(e)))
    }

    pub async fn get_open_orders(&self, asset: &AssetId) -> Result<Vec<Order>, EngineError> {
        let raw = self
            .client
            .open_orders(asset.as_str())
            .await
            .map_err(|e| EngineError::TransientIo(TransientIoError::HttpFailed(e)))?;
        Ok(raw
            .into_iter()
            .map(|o| Order {
                order_id: o.order_id,
                asset: asset.clone(),
                side: if o.side == "BUY" { Side::Buy } else { Side::Sell },
                price: o.price,
                original_size: o.original_size,
                remaining_size: o.remaining_size,
                status: if o.remaining_size < o.original_size {
                    OrderStatus::Partial
                } else {
                    OrderStatus::Live
                },
            })
            .collect())
    }

    /// Places a single post-only limit order. A cross-attempt is rejected
    /// by the exchange, not silently adjusted.
    pub async fn place_post_only_order(
        &self,
        asset: &AssetId,
        side: Side,
        price: Decimal,
        size: Decimal,
        fee_rate_bps: Decimal,
    ) -> Result<Order, EngineError> {
        let params = OrderParams {
            asset: asset.as_str().to_string(),
            side: side.as_str().to_string(),
            price: price.to_string(),
            size: size.to_string(),
            post_only: true,
            fee_rate_bps: fee_rate_bps.to_string(),
        };
        let signed = self
            .client
            .sign_order(&self.signer, &params)
            .await
            .map_err(|_| EngineError::AuthProtocol(AuthProtocolError::SignatureRejected))?;
        let resp: OrderResponse = self
            .client
            .post_order(&PostOrderRequest { order: signed })
            .await
            .map_err(|e| EngineError::TransientIo(TransientIoError::HttpFailed(e)))?;
        if resp.status == "REJECTED" {
            return Err(EngineError::ExchangeRejection(ExchangeRejectionError::OrderRejected {
                reason: resp.error_msg.unwrap_or_default(),
            }));
        }
        Ok(Order {
            order_id: resp.order_id,
            asset: asset.clone(),
            side,
            price,
            original_size: size,
            remaining_size: size,
            status: OrderStatus::Live,
        })
    }

    /// Places up to `batch_max` orders in one request; callers are
    /// responsible for chunking larger batches.
    pub async fn place_batch(
        &self,
        requests: Vec<(AssetId, Side, Decimal, Decimal, Decimal)>,
    ) -> Result<Vec<Result<Order, EngineError>>, EngineError> {
        if requests.len() > self.batch_max {
            return Err(EngineError::Config(format!(
                "batch of {} exceeds max {}",
                requests.len(),
                self.batch_max
            )));
        }
        let mut out = Vec::with_capacity(requests.len());
        for (asset, side, price, size, fee_rate_bps) in requests {
            out.push(self.place_post_only_order(&asset, side, price, size, fee_rate_bps).await);
        }
        Ok(out)
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), EngineError> {
        self.client
            .cancel_order(&CancelOrderRequest {
                order_id: order_id.to_string(),
            })
            .await
            .map_err(|e| EngineError::TransientIo(TransientIoError::HttpFailed(e)))?;
        Ok(())
    }

    pub async fn cancel_all(&self, asset: &AssetId) -> Result<(), EngineError> {
        self.client
            .cancel_all(asset.as_str())
            .await
            .map_err(|e| EngineError::TransientIo(TransientIoError::HttpFailed(e)))?;
        Ok(())
    }
}

pub type SharedRestClient = Arc<RestClient>;
