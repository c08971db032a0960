//! Error types for the Meridian Router

use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::ChainId;

/// Main error type for the router.
///
/// The taxonomy is deliberately flat: every failure an auction reply or a
/// lifecycle decision can surface maps to exactly one of these kinds.
#[derive(Error, Debug, Clone)]
pub enum RouterError {
    // Validation
    #[error("Invalid parameters: {message}")]
    ParamsInvalid { message: String },

    #[error("Zero value bid")]
    ZeroValueBid,

    // Policy
    #[error("Auction rate exceeded: {elapsed_ms}ms elapsed, {minimal_period_ms}ms required")]
    AuctionRateExceeded {
        elapsed_ms: u64,
        minimal_period_ms: u64,
    },

    #[error("Auction expired: expiry {expiry}, now {now}")]
    AuctionExpired { expiry: u64, now: u64 },

    #[error("Price impact too high: {impact_e18} > {max_e18}")]
    PriceImpactTooHigh { impact_e18: String, max_e18: String },

    // Resource
    #[error("No providers available for chain {chain_id}")]
    ProvidersNotAvailable { chain_id: ChainId },

    #[error("Not enough gas on chain {chain_id}: have {balance}, need {min_gas}")]
    NotEnoughGas {
        chain_id: ChainId,
        balance: String,
        min_gas: String,
    },

    #[error("Not enough liquidity: balance {balance}, amount received {amount_received}")]
    NotEnoughLiquidity {
        balance: String,
        amount_received: String,
    },

    #[error("Amount {amount_received} does not cover gas fee {gas_fee}")]
    NotEnoughAmount {
        amount_received: String,
        gas_fee: String,
    },

    #[error("Chain {chain_id} not supported for {operation}")]
    ChainNotSupported { chain_id: ChainId, operation: String },

    // Sync
    #[error("Subgraph not synced for chain {chain_id}")]
    SubgraphNotSynced { chain_id: ChainId, records: String },

    // Lifecycle
    #[error("Receiver transaction already exists for {transaction_id}")]
    ReceiverTxExists { transaction_id: String },

    #[error("Sender transaction too new: {elapsed}s elapsed, {required}s required")]
    SenderTxTooNew { elapsed: u64, required: u64 },

    // Transport
    #[error("RPC error on chain {chain_id}: {message}")]
    RpcError { chain_id: ChainId, message: String },

    #[error("Provider not configured for chain {chain_id}")]
    ProviderNotConfigured { chain_id: ChainId },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl RouterError {
    /// Stable kind tag used in reply envelopes, metrics labels, and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::ParamsInvalid { .. } => "ParamsInvalid",
            RouterError::ZeroValueBid => "ZeroValueBid",
            RouterError::AuctionRateExceeded { .. } => "AuctionRateExceeded",
            RouterError::AuctionExpired { .. } => "AuctionExpired",
            RouterError::PriceImpactTooHigh { .. } => "PriceImpactTooHigh",
            RouterError::ProvidersNotAvailable { .. } => "ProvidersNotAvailable",
            RouterError::NotEnoughGas { .. } => "NotEnoughGas",
            RouterError::NotEnoughLiquidity { .. } => "NotEnoughLiquidity",
            RouterError::NotEnoughAmount { .. } => "NotEnoughAmount",
            RouterError::ChainNotSupported { .. } => "ChainNotSupported",
            RouterError::SubgraphNotSynced { .. } => "SubgraphNotSynced",
            RouterError::ReceiverTxExists { .. } => "ReceiverTxExists",
            RouterError::SenderTxTooNew { .. } => "SenderTxTooNew",
            RouterError::RpcError { .. } => "RpcError",
            RouterError::ProviderNotConfigured { .. } => "ProviderNotConfigured",
            RouterError::ConfigurationError(_) => "ConfigurationError",
        }
    }

    /// Structured context for the reply envelope.
    pub fn context(&self) -> BTreeMap<String, String> {
        let mut ctx = BTreeMap::new();
        match self {
            RouterError::ParamsInvalid { message } => {
                ctx.insert("message".into(), message.clone());
            }
            RouterError::AuctionRateExceeded {
                elapsed_ms,
                minimal_period_ms,
            } => {
                ctx.insert("elapsedMs".into(), elapsed_ms.to_string());
                ctx.insert("minimalPeriod".into(), minimal_period_ms.to_string());
            }
            RouterError::AuctionExpired { expiry, now } => {
                ctx.insert("expiry".into(), expiry.to_string());
                ctx.insert("now".into(), now.to_string());
            }
            RouterError::PriceImpactTooHigh { impact_e18, max_e18 } => {
                ctx.insert("priceImpact".into(), impact_e18.clone());
                ctx.insert("maxPriceImpact".into(), max_e18.clone());
            }
            RouterError::ProvidersNotAvailable { chain_id } => {
                ctx.insert("chainId".into(), chain_id.to_string());
            }
            RouterError::NotEnoughGas {
                chain_id,
                balance,
                min_gas,
            } => {
                ctx.insert("chainId".into(), chain_id.to_string());
                ctx.insert("balance".into(), balance.clone());
                ctx.insert("minGas".into(), min_gas.clone());
            }
            RouterError::NotEnoughLiquidity {
                balance,
                amount_received,
            } => {
                ctx.insert("balance".into(), balance.clone());
                ctx.insert("amountReceived".into(), amount_received.clone());
            }
            RouterError::NotEnoughAmount {
                amount_received,
                gas_fee,
            } => {
                ctx.insert("amountReceived".into(), amount_received.clone());
                ctx.insert("gasFee".into(), gas_fee.clone());
            }
            RouterError::ChainNotSupported { chain_id, operation } => {
                ctx.insert("chainId".into(), chain_id.to_string());
                ctx.insert("operation".into(), operation.clone());
            }
            RouterError::SubgraphNotSynced { chain_id, records } => {
                ctx.insert("chainId".into(), chain_id.to_string());
                ctx.insert("syncRecords".into(), records.clone());
            }
            RouterError::ReceiverTxExists { transaction_id } => {
                ctx.insert("transactionId".into(), transaction_id.clone());
            }
            RouterError::SenderTxTooNew { elapsed, required } => {
                ctx.insert("elapsed".into(), elapsed.to_string());
                ctx.insert("required".into(), required.to_string());
            }
            RouterError::RpcError { chain_id, message } => {
                ctx.insert("chainId".into(), chain_id.to_string());
                ctx.insert("message".into(), message.clone());
            }
            RouterError::ProviderNotConfigured { chain_id } => {
                ctx.insert("chainId".into(), chain_id.to_string());
            }
            RouterError::ZeroValueBid | RouterError::ConfigurationError(_) => {}
        }
        ctx
    }

    /// Transport-kind errors are retried with backoff by the lifecycle
    /// engine; everything else terminates the current attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RouterError::RpcError { .. }
                | RouterError::ProviderNotConfigured { .. }
                | RouterError::ConfigurationError(_)
        )
    }

    /// Errors worth alerting on rather than just logging.
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RouterError::NotEnoughLiquidity { .. } | RouterError::NotEnoughGas { .. }
        )
    }
}

/// Correlation identifiers carried across logs, metrics, and replies:
/// `requestContext{id, origin}` plus the `methodContext` handler name.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub id: String,
    /// Channel the request arrived on (auction, metatx, admin).
    pub origin: String,
    /// Handler that served it (evaluate, handle_fulfill_request, ...).
    pub method: String,
}

impl RequestContext {
    pub fn new(
        id: impl Into<String>,
        origin: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            origin: origin.into(),
            method: method.into(),
        }
    }
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;
