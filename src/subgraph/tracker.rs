//! Polling state reconciler over the per-chain indexers.
//!
//! Each chain runs an independent poll loop: fetch sync status, fetch the
//! router's transactions, diff against the last-seen set, and emit one
//! [`TransactionEvent`] per new or status-changed record. A failing chain
//! logs and retries next tick without holding up the others.

use dashmap::DashMap;
use ethers::types::{Address, U256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use super::{SubgraphClient, SyncRecord};
use crate::error::RouterResult;
use crate::events::TransactionEvent;
use crate::types::{ChainId, TransactionId, TransactionRecord, TransactionStatus};

type SeenKey = (TransactionId, Address);

/// Subgraph-driven event tracker across all configured chains.
pub struct EventTracker {
    subgraph: Arc<dyn SubgraphClient>,
    chain_ids: Vec<ChainId>,
    poll_interval: Duration,
    event_tx: broadcast::Sender<TransactionEvent>,
    seen: DashMap<ChainId, HashMap<SeenKey, TransactionStatus>>,
    sync_status: DashMap<ChainId, Vec<SyncRecord>>,
    shutdown: Arc<RwLock<bool>>,
}

impl EventTracker {
    pub fn new(
        subgraph: Arc<dyn SubgraphClient>,
        chain_ids: Vec<ChainId>,
        poll_interval: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(10_000);
        Self {
            subgraph,
            chain_ids,
            poll_interval,
            event_tx,
            seen: DashMap::new(),
            sync_status: DashMap::new(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.event_tx.subscribe()
    }

    /// Latest cached sync records for the chain.
    pub fn sync_records(&self, chain_id: ChainId) -> Vec<SyncRecord> {
        self.sync_status
            .get(&chain_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// A chain is synced when any of its indexers is.
    pub fn is_synced(&self, chain_id: ChainId) -> bool {
        self.sync_status
            .get(&chain_id)
            .map(|e| e.value().iter().any(|r| r.synced))
            .unwrap_or(false)
    }

    pub async fn get_transaction_for_chain(
        &self,
        transaction_id: TransactionId,
        user: Address,
        chain_id: ChainId,
    ) -> RouterResult<Option<TransactionRecord>> {
        self.subgraph.transaction(transaction_id, user, chain_id).await
    }

    pub async fn get_asset_balance(
        &self,
        asset: Address,
        chain_id: ChainId,
    ) -> RouterResult<U256> {
        self.subgraph.asset_balance(asset, chain_id).await
    }

    /// Run the per-chain poll loops until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut handles = Vec::new();
        for chain_id in self.chain_ids.clone() {
            let tracker = self.clone();
            handles.push(tokio::spawn(async move {
                tracker.run_chain(chain_id).await;
            }));
        }
        futures::future::join_all(handles).await;
    }

    async fn run_chain(&self, chain_id: ChainId) {
        info!(chain = %chain_id, interval = ?self.poll_interval, "tracker started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }
            let started = std::time::Instant::now();
            match self.poll_chain_once(chain_id).await {
                Ok(emitted) => {
                    if emitted > 0 {
                        debug!(chain = %chain_id, emitted, "tracker tick");
                    }
                }
                Err(e) => {
                    // Transient by construction: keep the last snapshot and
                    // try again next tick.
                    error!(chain = %chain_id, error = %e, "tracker poll failed");
                }
            }
            crate::metrics::record_poll_duration(chain_id, started.elapsed().as_secs_f64());
        }
        info!(chain = %chain_id, "tracker stopped");
    }

    /// One poll tick: refresh sync state, then diff the router's records.
    /// Returns the number of events emitted.
    pub async fn poll_chain_once(&self, chain_id: ChainId) -> RouterResult<usize> {
        let records = self.subgraph.sync_records(chain_id).await?;
        let synced = records.iter().any(|r| r.synced);
        let lag = records.iter().map(|r| r.lag).min().unwrap_or(0);
        crate::metrics::record_subgraph_sync(chain_id, synced, lag);
        self.sync_status.insert(chain_id, records);

        if !synced {
            warn!(chain = %chain_id, "no synced indexer, skipping diff");
            return Ok(0);
        }

        let transactions = self.subgraph.router_transactions(chain_id).await?;
        Ok(self.diff_and_emit(chain_id, transactions))
    }

    /// Diff fetched records against the last-seen set and broadcast one
    /// event per change, in the order the indexer reported them.
    fn diff_and_emit(&self, chain_id: ChainId, records: Vec<TransactionRecord>) -> usize {
        let mut chain_seen = self.seen.entry(chain_id).or_default();
        let mut current_keys = std::collections::HashSet::new();
        let mut emitted = 0;

        for record in records {
            let key = (record.invariant.transaction_id, record.invariant.user);
            current_keys.insert(key);

            let changed = match chain_seen.get(&key) {
                Some(previous) => *previous != record.status,
                None => true,
            };
            if !changed {
                continue;
            }
            chain_seen.insert(key, record.status);

            let event = TransactionEvent::from_record(record);
            crate::metrics::record_tracker_event(chain_id, event.name());
            debug!(chain = %chain_id, event = event.name(), "transaction event");
            // No receivers is fine during startup.
            let _ = self.event_tx.send(event);
            emitted += 1;
        }

        // Terminal records eventually fall out of the indexer window; drop
        // them from the seen set so memory stays bounded.
        chain_seen.retain(|key, status| current_keys.contains(key) || !status.is_terminal());

        emitted
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }
}
