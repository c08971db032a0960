//! Chain provider with multi-RPC support and automatic failover

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, TransactionReceipt, H256, U256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::ChainRpc;
use crate::error::{RouterError, RouterResult};
use crate::types::ChainId;

/// Deadline applied to every RPC round trip.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Multi-provider wrapper with automatic failover. Requests go to the
/// current provider; on failure the cursor advances and the call is retried
/// until every URL has been tried once.
pub struct ChainProvider {
    chain_id: ChainId,
    providers: Vec<Provider<Http>>,
    current: AtomicUsize,
    /// ERC-20 decimals are immutable; cache per asset.
    decimals_cache: DashMap<Address, u8>,
}

impl ChainProvider {
    pub fn new(chain_id: ChainId, urls: &[String]) -> RouterResult<Self> {
        let mut providers = Vec::new();
        for url in urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    providers.push(provider.interval(Duration::from_millis(100)));
                    debug!(chain = %chain_id, url, "added HTTP provider");
                }
                Err(e) => {
                    warn!(chain = %chain_id, url, error = %e, "skipping invalid provider url");
                }
            }
        }

        if providers.is_empty() {
            return Err(RouterError::ProvidersNotAvailable { chain_id });
        }

        Ok(Self {
            chain_id,
            providers,
            current: AtomicUsize::new(0),
            decimals_cache: DashMap::new(),
        })
    }

    fn active(&self) -> &Provider<Http> {
        let idx = self.current.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    fn failover(&self) {
        let current = self.current.load(Ordering::Relaxed);
        self.current
            .store((current + 1) % self.providers.len(), Ordering::Relaxed);
        warn!(chain = %self.chain_id, "provider failover");
    }

    fn rpc_error(&self, message: impl ToString) -> RouterError {
        RouterError::RpcError {
            chain_id: self.chain_id,
            message: message.to_string(),
        }
    }

    /// Run `op` against the active provider, rotating through the remaining
    /// ones on failure.
    async fn with_failover<T, F, Fut>(&self, op: F) -> RouterResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ethers::providers::ProviderError>>,
    {
        let mut last_error = None;
        for _ in 0..self.providers.len() {
            let provider = self.active().clone();
            match timeout(RPC_TIMEOUT, op(provider)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    last_error = Some(self.rpc_error(&e));
                    self.failover();
                }
                Err(_) => {
                    last_error = Some(self.rpc_error("request timed out"));
                    self.failover();
                }
            }
        }
        Err(last_error.unwrap_or_else(|| self.rpc_error("all providers failed")))
    }
}

#[async_trait]
impl ChainRpc for ChainProvider {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn read_transaction(&self, tx: &TypedTransaction) -> RouterResult<Bytes> {
        let tx = tx.clone();
        self.with_failover(move |p| {
            let tx = tx.clone();
            async move { p.call(&tx, None).await }
        })
        .await
    }

    async fn send_transaction(&self, raw: Bytes) -> RouterResult<H256> {
        // No failover for writes: a rebroadcast through another provider
        // could double-spend the nonce window. Single attempt, caller
        // retries with a fresh signature.
        let pending = timeout(RPC_TIMEOUT, self.active().send_raw_transaction(raw))
            .await
            .map_err(|_| self.rpc_error("send timed out"))?
            .map_err(|e| self.rpc_error(&e))?;
        Ok(pending.tx_hash())
    }

    async fn get_balance(&self, address: Address) -> RouterResult<U256> {
        self.with_failover(move |p| async move { p.get_balance(address, None).await })
            .await
    }

    async fn get_code(&self, address: Address) -> RouterResult<Bytes> {
        self.with_failover(move |p| async move { p.get_code(address, None).await })
            .await
    }

    async fn get_block_number(&self) -> RouterResult<u64> {
        let block = self
            .with_failover(move |p| async move { p.get_block_number().await })
            .await?;
        Ok(block.as_u64())
    }

    async fn get_block_timestamp(&self, block_number: u64) -> RouterResult<u64> {
        let block = self
            .with_failover(move |p| async move { p.get_block(block_number).await })
            .await?
            .ok_or_else(|| self.rpc_error(format!("block {} not found", block_number)))?;
        Ok(block.timestamp.as_u64())
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RouterResult<Option<TransactionReceipt>> {
        self.with_failover(move |p| async move { p.get_transaction_receipt(tx_hash).await })
            .await
    }

    async fn get_decimals_for_asset(&self, asset: Address) -> RouterResult<u8> {
        if asset == Address::zero() {
            return Ok(18);
        }
        if let Some(cached) = self.decimals_cache.get(&asset) {
            return Ok(*cached);
        }

        let selector = ethers::utils::id("decimals()");
        let mut tx = TypedTransaction::default();
        tx.set_to(asset);
        tx.set_data(Bytes::from(selector.to_vec()));

        let raw = self.read_transaction(&tx).await?;
        if raw.len() < 32 {
            return Err(self.rpc_error(format!("malformed decimals() response for {:?}", asset)));
        }
        let decimals = U256::from_big_endian(&raw[..32]).as_u64() as u8;
        self.decimals_cache.insert(asset, decimals);
        Ok(decimals)
    }

    async fn get_gas_price(&self) -> RouterResult<U256> {
        self.with_failover(move |p| async move { p.get_gas_price().await })
            .await
    }

    async fn get_transaction_count(&self, address: Address) -> RouterResult<u64> {
        let count = self
            .with_failover(move |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;
        Ok(count.as_u64())
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> RouterResult<U256> {
        let tx = tx.clone();
        self.with_failover(move |p| {
            let tx = tx.clone();
            async move { p.estimate_gas(&tx, None).await }
        })
        .await
    }
}
