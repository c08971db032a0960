//! Nonce management for reliable transaction submission
//!
//! Tracks a local counter per chain so concurrent submissions never collide,
//! with resync against the chain when the node disagrees.

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::chain::ChainRpc;
use crate::error::{RouterError, RouterResult};
use crate::types::ChainId;

struct ChainNonceState {
    /// Next nonce to hand out.
    current: u64,
    /// Outstanding submissions: nonce -> tx hash.
    pending: HashMap<u64, String>,
}

/// Manages nonces across every chain the router writes to.
pub struct NonceManager {
    wallet_address: Address,
    chain_state: DashMap<ChainId, Mutex<ChainNonceState>>,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            chain_state: DashMap::new(),
        }
    }

    /// Prime the counter from the chain's pending transaction count.
    pub async fn init_chain(&self, chain_id: ChainId, rpc: &dyn ChainRpc) -> RouterResult<()> {
        let on_chain = rpc.get_transaction_count(self.wallet_address).await?;
        self.chain_state.insert(
            chain_id,
            Mutex::new(ChainNonceState {
                current: on_chain,
                pending: HashMap::new(),
            }),
        );
        debug!(chain = %chain_id, nonce = on_chain, "nonce initialized");
        Ok(())
    }

    fn state(
        &self,
        chain_id: ChainId,
    ) -> RouterResult<dashmap::mapref::one::Ref<'_, ChainId, Mutex<ChainNonceState>>> {
        self.chain_state
            .get(&chain_id)
            .ok_or(RouterError::ProviderNotConfigured { chain_id })
    }

    /// Allocate the next nonce.
    pub async fn next(&self, chain_id: ChainId) -> RouterResult<u64> {
        let state = self.state(chain_id)?;
        let mut state = state.lock().await;
        let nonce = state.current;
        state.current += 1;
        debug!(chain = %chain_id, nonce, "allocated nonce");
        Ok(nonce)
    }

    pub async fn mark_pending(
        &self,
        chain_id: ChainId,
        nonce: u64,
        tx_hash: &str,
    ) -> RouterResult<()> {
        let state = self.state(chain_id)?;
        let mut state = state.lock().await;
        state.pending.insert(nonce, tx_hash.to_string());
        Ok(())
    }

    /// Transaction mined; the nonce is spent.
    pub async fn confirm(&self, chain_id: ChainId, nonce: u64) -> RouterResult<()> {
        let state = self.state(chain_id)?;
        let mut state = state.lock().await;
        state.pending.remove(&nonce);
        Ok(())
    }

    /// Submission failed before landing; make the nonce reusable when it was
    /// the newest allocation.
    pub async fn release(&self, chain_id: ChainId, nonce: u64) -> RouterResult<()> {
        let state = self.state(chain_id)?;
        let mut state = state.lock().await;
        state.pending.remove(&nonce);
        if state.current == nonce + 1 {
            state.current = nonce;
        }
        Ok(())
    }

    /// Re-align with the chain after a nonce error.
    pub async fn resync(&self, chain_id: ChainId, rpc: &dyn ChainRpc) -> RouterResult<()> {
        let on_chain = rpc.get_transaction_count(self.wallet_address).await?;
        let state = self.state(chain_id)?;
        let mut state = state.lock().await;

        let stale: Vec<u64> = state
            .pending
            .keys()
            .copied()
            .filter(|n| *n < on_chain)
            .collect();
        for nonce in stale {
            state.pending.remove(&nonce);
        }

        if state.current < on_chain {
            warn!(
                chain = %chain_id,
                local = state.current,
                on_chain,
                "nonce behind chain, resyncing"
            );
            state.current = on_chain;
        }
        Ok(())
    }

    pub async fn pending_count(&self, chain_id: ChainId) -> usize {
        match self.chain_state.get(&chain_id) {
            Some(state) => state.lock().await.pending.len(),
            None => 0,
        }
    }
}
