//! Indexer access - per-chain GraphQL endpoints behind a small trait.
//!
//! The tracker and evaluator consume [`SubgraphClient`]; the production
//! implementation posts GraphQL over HTTP to every configured endpoint with
//! per-request deadlines.

pub mod tracker;

pub use tracker::EventTracker;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::chain::ChainManager;
use crate::config::Settings;
use crate::error::{RouterError, RouterResult};
use crate::types::{
    ChainId, InvariantData, TransactionId, TransactionRecord, TransactionStatus, VariantData,
};

/// Deadline for subgraph queries.
const SUBGRAPH_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocks an indexer may trail the chain head and still count as synced.
const MAX_SYNC_LAG: u64 = 30;

/// An indexer's self-reported sync state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub synced: bool,
    pub latest_block: u64,
    pub synced_block: u64,
    pub lag: u64,
    pub uri: String,
}

/// Queryable view of one chain's indexed state.
#[async_trait]
pub trait SubgraphClient: Send + Sync {
    /// One record per configured endpoint for the chain.
    async fn sync_records(&self, chain_id: ChainId) -> RouterResult<Vec<SyncRecord>>;

    /// Every prepared/fulfilled/cancelled transaction touching the router.
    async fn router_transactions(&self, chain_id: ChainId)
        -> RouterResult<Vec<TransactionRecord>>;

    async fn transaction(
        &self,
        transaction_id: TransactionId,
        user: Address,
        chain_id: ChainId,
    ) -> RouterResult<Option<TransactionRecord>>;

    /// Router's locked liquidity for the asset on that chain.
    async fn asset_balance(&self, asset: Address, chain_id: ChainId) -> RouterResult<U256>;
}

const TRANSACTIONS_QUERY: &str = r#"
query RouterTransactions($router: String!) {
  transactions(
    where: { router: $router }
    orderBy: preparedBlockNumber
    orderDirection: asc
  ) {
    transactionId
    user
    router
    initiator
    sendingChainId
    sendingAssetId
    receivingChainId
    receivingAssetId
    sendingChainTxManagerAddress
    receivingChainTxManagerAddress
    callTo
    callDataHash
    receivingAddress
    amount
    expiry
    preparedBlockNumber
    status
    signature
    callData
    encryptedCallData
  }
}
"#;

const TRANSACTION_QUERY: &str = r#"
query Transaction($id: ID!) {
  transaction(id: $id) {
    transactionId
    user
    router
    initiator
    sendingChainId
    sendingAssetId
    receivingChainId
    receivingAssetId
    sendingChainTxManagerAddress
    receivingChainTxManagerAddress
    callTo
    callDataHash
    receivingAddress
    amount
    expiry
    preparedBlockNumber
    status
    signature
    callData
    encryptedCallData
  }
}
"#;

const ASSET_BALANCE_QUERY: &str = r#"
query AssetBalance($id: ID!) {
  assetBalance(id: $id) {
    amount
  }
}
"#;

const META_QUERY: &str = r#"
query { _meta { block { number } } }
"#;

/// GraphQL-over-HTTP implementation across all configured chains.
pub struct HttpSubgraph {
    settings: Arc<Settings>,
    chains: Arc<ChainManager>,
    router: Address,
    http: reqwest::Client,
}

impl HttpSubgraph {
    pub fn new(settings: Arc<Settings>, chains: Arc<ChainManager>, router: Address) -> Self {
        Self {
            settings,
            chains,
            router,
            http: reqwest::Client::builder()
                .timeout(SUBGRAPH_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    fn endpoints(&self, chain_id: ChainId) -> Vec<String> {
        self.settings
            .chain(chain_id)
            .map(|c| c.subgraphs.clone())
            .unwrap_or_default()
    }

    async fn query(
        &self,
        chain_id: ChainId,
        uri: &str,
        query: &str,
        variables: serde_json::Value,
    ) -> RouterResult<serde_json::Value> {
        let body = serde_json::json!({ "query": query, "variables": variables });
        let response: serde_json::Value = self
            .http
            .post(uri)
            .json(&body)
            .send()
            .await
            .map_err(|e| RouterError::RpcError {
                chain_id,
                message: format!("subgraph {}: {}", uri, e),
            })?
            .json()
            .await
            .map_err(|e| RouterError::RpcError {
                chain_id,
                message: format!("subgraph {}: {}", uri, e),
            })?;

        if let Some(errors) = response.get("errors") {
            return Err(RouterError::RpcError {
                chain_id,
                message: format!("subgraph {}: {}", uri, errors),
            });
        }
        Ok(response.get("data").cloned().unwrap_or(serde_json::Value::Null))
    }

    /// Run `query` against each endpoint until one answers.
    async fn query_any(
        &self,
        chain_id: ChainId,
        query: &str,
        variables: serde_json::Value,
    ) -> RouterResult<serde_json::Value> {
        let endpoints = self.endpoints(chain_id);
        if endpoints.is_empty() {
            return Err(RouterError::ChainNotSupported {
                chain_id,
                operation: "subgraph".into(),
            });
        }
        let mut last_error = None;
        for uri in &endpoints {
            match self.query(chain_id, uri, query, variables.clone()).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!(chain = %chain_id, uri, error = %e, "subgraph query failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(RouterError::ChainNotSupported {
            chain_id,
            operation: "subgraph".into(),
        }))
    }
}

#[async_trait]
impl SubgraphClient for HttpSubgraph {
    async fn sync_records(&self, chain_id: ChainId) -> RouterResult<Vec<SyncRecord>> {
        let latest_block = self.chains.get(chain_id)?.get_block_number().await?;

        let mut records = Vec::new();
        for uri in self.endpoints(chain_id) {
            let synced_block = match self
                .query(chain_id, &uri, META_QUERY, serde_json::json!({}))
                .await
            {
                Ok(data) => data
                    .pointer("/_meta/block/number")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                Err(e) => {
                    warn!(chain = %chain_id, uri, error = %e, "sync probe failed");
                    0
                }
            };
            let lag = latest_block.saturating_sub(synced_block);
            records.push(SyncRecord {
                synced: synced_block > 0 && lag <= MAX_SYNC_LAG,
                latest_block,
                synced_block,
                lag,
                uri,
            });
        }
        Ok(records)
    }

    async fn router_transactions(
        &self,
        chain_id: ChainId,
    ) -> RouterResult<Vec<TransactionRecord>> {
        let data = self
            .query_any(
                chain_id,
                TRANSACTIONS_QUERY,
                serde_json::json!({ "router": format!("{:?}", self.router) }),
            )
            .await?;

        let raw = data
            .get("transactions")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(raw
            .iter()
            .filter_map(|value| parse_transaction(value, chain_id))
            .collect())
    }

    async fn transaction(
        &self,
        transaction_id: TransactionId,
        user: Address,
        chain_id: ChainId,
    ) -> RouterResult<Option<TransactionRecord>> {
        let id = format!("{:?}-{:?}", transaction_id, user);
        let data = self
            .query_any(chain_id, TRANSACTION_QUERY, serde_json::json!({ "id": id }))
            .await?;
        Ok(data
            .get("transaction")
            .filter(|v| !v.is_null())
            .and_then(|v| parse_transaction(v, chain_id)))
    }

    async fn asset_balance(&self, asset: Address, chain_id: ChainId) -> RouterResult<U256> {
        let id = format!("{:?}-{:?}", asset, self.router);
        let data = self
            .query_any(chain_id, ASSET_BALANCE_QUERY, serde_json::json!({ "id": id }))
            .await?;
        let amount = data
            .pointer("/assetBalance/amount")
            .and_then(|v| v.as_str())
            .unwrap_or("0");
        U256::from_dec_str(amount).map_err(|e| RouterError::RpcError {
            chain_id,
            message: format!("malformed asset balance '{}': {}", amount, e),
        })
    }
}

/// Map one indexer row onto a [`TransactionRecord`]. Rows that fail to
/// parse are dropped (and logged) rather than poisoning the whole batch.
fn parse_transaction(value: &serde_json::Value, chain_id: ChainId) -> Option<TransactionRecord> {
    let str_field = |name: &str| value.get(name).and_then(|v| v.as_str());
    let addr = |name: &str| str_field(name).and_then(|s| s.parse::<Address>().ok());
    let hash = |name: &str| str_field(name).and_then(|s| s.parse::<H256>().ok());
    let num = |name: &str| {
        value.get(name).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse::<u64>().ok()))
        })
    };

    let status = match str_field("status")? {
        "Prepared" => TransactionStatus::Prepared,
        "Fulfilled" => TransactionStatus::Fulfilled,
        "Cancelled" => TransactionStatus::Cancelled,
        other => {
            warn!(chain = %chain_id, status = other, "unknown transaction status");
            return None;
        }
    };

    let record = TransactionRecord {
        invariant: InvariantData {
            transaction_id: hash("transactionId")?,
            user: addr("user")?,
            router: addr("router")?,
            initiator: addr("initiator")?,
            sending_chain_id: ChainId(num("sendingChainId")?),
            sending_asset_id: addr("sendingAssetId")?,
            receiving_chain_id: ChainId(num("receivingChainId")?),
            receiving_asset_id: addr("receivingAssetId")?,
            sending_chain_tx_manager_address: addr("sendingChainTxManagerAddress")?,
            receiving_chain_tx_manager_address: addr("receivingChainTxManagerAddress")?,
            call_to: addr("callTo")?,
            call_data_hash: hash("callDataHash")?,
            receiving_address: addr("receivingAddress")?,
        },
        variant: VariantData {
            amount: U256::from_dec_str(str_field("amount")?).ok()?,
            expiry: num("expiry")?,
            prepared_block_number: num("preparedBlockNumber")?,
        },
        status,
        chain_id,
        signature: str_field("signature").map(|s| s.to_string()),
        call_data: str_field("callData").map(|s| s.to_string()),
        encrypted_call_data: str_field("encryptedCallData").map(|s| s.to_string()),
    };
    Some(record)
}
