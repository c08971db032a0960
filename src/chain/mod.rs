//! Chain module - RPC access to every configured chain
//!
//! Providers are consumed through the [`ChainRpc`] trait so the routing core
//! never touches a concrete transport; the production implementation is a
//! multi-URL HTTP provider with automatic failover.

pub mod provider;

pub use provider::ChainProvider;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use std::sync::Arc;
use tracing::info;

use crate::config::Settings;
use crate::error::{RouterError, RouterResult};
use crate::types::ChainId;

/// Read/write access to one chain. Every call has a bounded deadline and
/// maps transport failures to `RpcError`.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// eth_call against the given transaction.
    async fn read_transaction(&self, tx: &TypedTransaction) -> RouterResult<Bytes>;

    /// Broadcast a signed raw transaction, returning its hash.
    async fn send_transaction(&self, raw: Bytes) -> RouterResult<H256>;

    async fn get_balance(&self, address: Address) -> RouterResult<U256>;

    async fn get_code(&self, address: Address) -> RouterResult<Bytes>;

    async fn get_block_number(&self) -> RouterResult<u64>;

    /// Timestamp of the given block, unix seconds.
    async fn get_block_timestamp(&self, block_number: u64) -> RouterResult<u64>;

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RouterResult<Option<TransactionReceipt>>;

    /// ERC-20 `decimals()`; 18 for the native asset.
    async fn get_decimals_for_asset(&self, asset: Address) -> RouterResult<u8>;

    async fn get_gas_price(&self) -> RouterResult<U256>;

    /// Pending-block transaction count for the address.
    async fn get_transaction_count(&self, address: Address) -> RouterResult<u64>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> RouterResult<U256>;
}

/// Holds one [`ChainRpc`] per configured chain.
pub struct ChainManager {
    chains: DashMap<ChainId, Arc<dyn ChainRpc>>,
}

impl ChainManager {
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
        }
    }

    /// Build providers for every configured chain.
    pub fn from_settings(settings: &Settings) -> RouterResult<Self> {
        let manager = Self::new();
        for chain_id in settings.chain_ids() {
            let chain = settings
                .chain(chain_id)
                .ok_or(RouterError::ProviderNotConfigured { chain_id })?;
            let provider = ChainProvider::new(chain_id, &chain.providers)?;
            manager.insert(chain_id, Arc::new(provider));
            info!(chain = %chain_id, providers = chain.providers.len(), "chain initialized");
        }
        Ok(manager)
    }

    pub fn insert(&self, chain_id: ChainId, rpc: Arc<dyn ChainRpc>) {
        self.chains.insert(chain_id, rpc);
    }

    pub fn get(&self, chain_id: ChainId) -> RouterResult<Arc<dyn ChainRpc>> {
        self.chains
            .get(&chain_id)
            .map(|e| e.value().clone())
            .ok_or(RouterError::ProviderNotConfigured { chain_id })
    }

    pub fn has(&self, chain_id: ChainId) -> bool {
        self.chains.contains_key(&chain_id)
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.chains.iter().map(|e| *e.key()).collect()
    }

    /// Probe every chain, returning (chain, healthy) pairs.
    pub async fn health_check(&self) -> Vec<(ChainId, bool)> {
        let entries: Vec<(ChainId, Arc<dyn ChainRpc>)> = self
            .chains
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut results = Vec::new();
        for (chain_id, rpc) in entries {
            let healthy = rpc.get_block_number().await.is_ok();
            crate::metrics::record_chain_health(chain_id, healthy);
            results.push((chain_id, healthy));
        }
        results
    }
}

impl Default for ChainManager {
    fn default() -> Self {
        Self::new()
    }
}
