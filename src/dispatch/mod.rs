//! Chain dispatcher - serialized, nonce-ordered transaction submission.
//!
//! One worker task per chain owns that chain's outbound queue. Jobs pass
//! through estimate -> sign -> send -> confirm, with nonce resync and
//! bounded exponential backoff on failures. An action-level dedup set makes
//! re-dispatching the same action a no-op.

pub mod encode;
pub mod nonce;

pub use nonce::NonceManager;

use dashmap::DashMap;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, U256, U64};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::chain::{ChainManager, ChainRpc};
use crate::error::{RouterError, RouterResult};
use crate::oracle::{ActionKind, PriceOracle};
use crate::types::{ChainId, TransactionId};
use crate::wallet::RouterSigner;

/// Retry backoff base and cap.
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Receipt poll cadence and bound while waiting for confirmations.
const RECEIPT_POLL: Duration = Duration::from_secs(2);
const RECEIPT_POLL_LIMIT: u32 = 150;

/// A lifecycle-issued on-chain action.
#[derive(Debug, Clone)]
pub struct Action {
    pub chain_id: ChainId,
    pub kind: ActionKind,
    pub transaction_id: TransactionId,
    /// Transaction-manager contract to call.
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

type ActionKey = (ChainId, TransactionId, &'static str);

impl Action {
    fn key(&self) -> ActionKey {
        (self.chain_id, self.transaction_id, self.kind.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ActionState {
    InFlight,
    Done,
}

struct Job {
    action: Action,
    reply: oneshot::Sender<RouterResult<TransactionReceipt>>,
}

/// Dispatcher facade over one worker per chain.
pub struct Dispatcher {
    queues: DashMap<ChainId, mpsc::Sender<Job>>,
    seen: Arc<DashMap<ActionKey, ActionState>>,
    nonce: Arc<NonceManager>,
}

impl Dispatcher {
    /// Build the dispatcher and spawn one submission worker per chain.
    pub async fn start(
        chains: &ChainManager,
        signer: Arc<dyn RouterSigner>,
        oracle: Arc<PriceOracle>,
        settings: Arc<crate::config::Settings>,
    ) -> RouterResult<Self> {
        let nonce = Arc::new(NonceManager::new(signer.address()));
        let seen = Arc::new(DashMap::new());
        let queues = DashMap::new();

        for chain_id in chains.chain_ids() {
            let rpc = chains.get(chain_id)?;
            nonce.init_chain(chain_id, rpc.as_ref()).await?;

            let confirmations = settings
                .chain(chain_id)
                .map(|c| c.confirmations)
                .unwrap_or(1);

            let worker = ChainWorker {
                chain_id,
                rpc,
                signer: signer.clone(),
                oracle: oracle.clone(),
                nonce: nonce.clone(),
                confirmations,
                max_retries: settings.max_retries,
            };

            let (tx, rx) = mpsc::channel::<Job>(1_000);
            queues.insert(chain_id, tx);
            tokio::spawn(worker.run(rx));
        }

        Ok(Self {
            queues,
            seen,
            nonce,
        })
    }

    /// Test constructor: a single chain with explicit collaborators.
    pub async fn start_single(
        chain_id: ChainId,
        rpc: Arc<dyn ChainRpc>,
        signer: Arc<dyn RouterSigner>,
        oracle: Arc<PriceOracle>,
        confirmations: u64,
        max_retries: u32,
    ) -> RouterResult<Self> {
        let nonce = Arc::new(NonceManager::new(signer.address()));
        nonce.init_chain(chain_id, rpc.as_ref()).await?;
        let seen = Arc::new(DashMap::new());
        let worker = ChainWorker {
            chain_id,
            rpc,
            signer,
            oracle,
            nonce: nonce.clone(),
            confirmations,
            max_retries,
        };
        let (tx, rx) = mpsc::channel::<Job>(1_000);
        tokio::spawn(worker.run(rx));
        let queues = DashMap::new();
        queues.insert(chain_id, tx);
        Ok(Self {
            queues,
            seen,
            nonce,
        })
    }

    /// Submit an action and wait for its confirmed receipt. Returns
    /// `Ok(None)` when an identical action is already in flight or done.
    pub async fn dispatch(&self, action: Action) -> RouterResult<Option<TransactionReceipt>> {
        let key = action.key();
        // Claim the key before queueing so concurrent duplicates race on the
        // map, not on the chain.
        match self.seen.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                debug!(
                    chain = %action.chain_id,
                    kind = action.kind.name(),
                    state = ?entry.get(),
                    "duplicate action suppressed"
                );
                return Ok(None);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(ActionState::InFlight);
            }
        }

        let queue = match self.queues.get(&action.chain_id) {
            Some(q) => q.clone(),
            None => {
                self.seen.remove(&key);
                return Err(RouterError::ProviderNotConfigured {
                    chain_id: action.chain_id,
                });
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let chain_id = action.chain_id;
        if queue
            .send(Job {
                action,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            self.seen.remove(&key);
            return Err(RouterError::RpcError {
                chain_id,
                message: "dispatcher worker stopped".into(),
            });
        }

        let result = reply_rx.await.map_err(|_| RouterError::RpcError {
            chain_id,
            message: "dispatcher worker dropped the job".into(),
        })?;

        match &result {
            Ok(_) => {
                self.seen.insert(key, ActionState::Done);
            }
            Err(_) => {
                // Failed actions may be retried by the next lifecycle tick.
                self.seen.remove(&key);
            }
        }
        result.map(Some)
    }

    pub async fn pending_count(&self, chain_id: ChainId) -> usize {
        self.nonce.pending_count(chain_id).await
    }
}

/// Per-chain submission worker. Owning the queue receiver makes it the
/// single writer for the chain, which is what keeps nonces monotonic.
struct ChainWorker {
    chain_id: ChainId,
    rpc: Arc<dyn ChainRpc>,
    signer: Arc<dyn RouterSigner>,
    oracle: Arc<PriceOracle>,
    nonce: Arc<NonceManager>,
    confirmations: u64,
    max_retries: u32,
}

impl ChainWorker {
    async fn run(self, mut queue: mpsc::Receiver<Job>) {
        info!(chain = %self.chain_id, "dispatcher worker started");
        while let Some(job) = queue.recv().await {
            let kind = job.action.kind.name();
            crate::metrics::record_dispatch_attempt(self.chain_id, kind);
            let result = self.submit(&job.action).await;
            match &result {
                Ok(receipt) => {
                    crate::metrics::record_dispatch_confirmed(self.chain_id, kind);
                    info!(
                        chain = %self.chain_id,
                        kind,
                        tx_hash = ?receipt.transaction_hash,
                        "action confirmed"
                    );
                }
                Err(e) => {
                    crate::metrics::record_dispatch_failed(self.chain_id, kind);
                    error!(chain = %self.chain_id, kind, error = %e, "action failed");
                }
            }
            // Receiver may have given up; that's fine.
            let _ = job.reply.send(result);
        }
        info!(chain = %self.chain_id, "dispatcher worker stopped");
    }

    /// Full submission attempt loop for one action.
    async fn submit(&self, action: &Action) -> RouterResult<TransactionReceipt> {
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = std::cmp::min(BACKOFF_BASE * 2u32.saturating_pow(attempt - 1), BACKOFF_CAP);
                tokio::time::sleep(delay).await;
            }

            let nonce = self.nonce.next(self.chain_id).await?;
            match self.attempt_once(action, nonce).await {
                Ok(receipt) => {
                    self.nonce.confirm(self.chain_id, nonce).await?;
                    return Ok(receipt);
                }
                Err(e) => {
                    let message = e.to_string();
                    self.nonce.release(self.chain_id, nonce).await.ok();
                    if message.contains("nonce") {
                        warn!(chain = %self.chain_id, error = %message, "nonce error, resyncing");
                        self.nonce.resync(self.chain_id, self.rpc.as_ref()).await.ok();
                    } else if !e.is_retryable() {
                        return Err(e);
                    }
                    warn!(
                        chain = %self.chain_id,
                        attempt = attempt + 1,
                        max = self.max_retries,
                        error = %message,
                        "submission attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RouterError::RpcError {
            chain_id: self.chain_id,
            message: "submission retries exhausted".into(),
        }))
    }

    /// One estimate -> sign -> send -> confirm pass.
    async fn attempt_once(
        &self,
        action: &Action,
        nonce: u64,
    ) -> RouterResult<TransactionReceipt> {
        let mut tx = TypedTransaction::default();
        tx.set_from(self.signer.address());
        tx.set_to(action.to);
        tx.set_data(action.data.clone());
        tx.set_value(action.value);
        tx.set_nonce(nonce);
        tx.set_chain_id(self.chain_id.0);

        // Estimate with a 20% buffer; fall back to the static table when the
        // node refuses to estimate (e.g. because state moved under us).
        let gas_limit = match self.rpc.estimate_gas(&tx).await {
            Ok(estimate) => estimate + estimate / 5,
            Err(e) => {
                debug!(chain = %self.chain_id, error = %e, "gas estimation failed, using static estimate");
                action.kind.gas_estimate()
            }
        };
        tx.set_gas(gas_limit);

        let gas_price = self.oracle.gas_price(self.chain_id).await?;
        tx.set_gas_price(gas_price);

        let raw = self.signer.sign_transaction(&tx).await?;
        let tx_hash = self.rpc.send_transaction(raw).await?;
        self.nonce
            .mark_pending(self.chain_id, nonce, &format!("{:?}", tx_hash))
            .await?;
        debug!(chain = %self.chain_id, ?tx_hash, nonce, "transaction sent");

        self.wait_for_confirmations(tx_hash).await
    }

    async fn wait_for_confirmations(
        &self,
        tx_hash: ethers::types::H256,
    ) -> RouterResult<TransactionReceipt> {
        for _ in 0..RECEIPT_POLL_LIMIT {
            if let Some(receipt) = self.rpc.get_transaction_receipt(tx_hash).await? {
                if receipt.status == Some(U64::zero()) {
                    return Err(RouterError::RpcError {
                        chain_id: self.chain_id,
                        message: format!("transaction {:?} reverted", tx_hash),
                    });
                }
                if let Some(block) = receipt.block_number {
                    let head = self.rpc.get_block_number().await?;
                    if head + 1 >= block.as_u64() + self.confirmations {
                        return Ok(receipt);
                    }
                }
            }
            tokio::time::sleep(RECEIPT_POLL).await;
        }
        Err(RouterError::RpcError {
            chain_id: self.chain_id,
            message: format!("timed out waiting for confirmations of {:?}", tx_hash),
        })
    }
}
