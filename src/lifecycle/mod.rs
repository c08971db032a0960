//! Transaction lifecycle state machine.
//!
//! One tracked transfer per `(transaction_id, user)`, created when the
//! sender-side prepare shows up in the tracker and removed at a terminal
//! state on both sides. A per-transfer lock makes every decision
//! single-flight: the lock is held for the whole read -> decide -> dispatch
//! -> confirm span (the dispatch itself runs on a spawned task so the event
//! loop never blocks), and re-entry on a busy transfer is a no-op.

pub mod policy;

pub use policy::{SideView, TransferState, SENDER_PREPARE_BUFFER};

use dashmap::DashMap;
use ethers::types::{Address, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::chain::ChainManager;
use crate::config::Settings;
use crate::dispatch::{encode, Action, Dispatcher};
use crate::error::{RouterError, RouterResult};
use crate::events::TransactionEvent;
use crate::oracle::{ActionKind, PriceOracle};
use crate::subgraph::EventTracker;
use crate::types::{
    time, ChainId, InvariantData, TransactionId, TransactionRecord, TransactionStatus, VariantData,
};

type TransferKey = (TransactionId, Address);

/// In-memory view of one cross-chain transfer.
#[derive(Debug, Clone)]
pub struct TrackedTransfer {
    pub invariant: InvariantData,
    pub sender: VariantData,
    pub receiver: Option<VariantData>,
    pub sender_status: TransactionStatus,
    pub receiver_status: Option<TransactionStatus>,
    /// Relayed signature observed on the receiver-side fulfill.
    pub receiver_signature: Option<String>,
    pub receiver_call_data: Option<String>,
    pub encrypted_call_data: String,
}

impl TrackedTransfer {
    fn from_sender_record(record: &TransactionRecord) -> Self {
        Self {
            invariant: record.invariant.clone(),
            sender: record.variant.clone(),
            receiver: None,
            sender_status: record.status,
            receiver_status: None,
            receiver_signature: None,
            receiver_call_data: None,
            encrypted_call_data: record
                .encrypted_call_data
                .clone()
                .unwrap_or_else(|| "0x".to_string()),
        }
    }

    pub fn state(&self) -> TransferState {
        policy::derive_state(self.sender_status, self.receiver_status)
    }

    fn receiver_view(&self) -> Option<SideView> {
        match (&self.receiver, self.receiver_status) {
            (Some(variant), Some(status)) => Some(SideView {
                status,
                expiry: variant.expiry,
            }),
            _ => None,
        }
    }

    fn is_removable(&self) -> bool {
        self.sender_status.is_terminal()
            && self.receiver_status.map(|s| s.is_terminal()).unwrap_or(true)
    }
}

/// A user's relayed fulfill, delivered over the meta-tx channel.
#[derive(Debug, Clone)]
pub struct FulfillRequest {
    pub transaction_id: TransactionId,
    pub user: Address,
    pub signature: String,
    pub call_data: String,
    pub relayer_fee: U256,
}

pub struct LifecycleEngine {
    settings: Arc<Settings>,
    chains: Arc<ChainManager>,
    tracker: Arc<EventTracker>,
    oracle: Arc<PriceOracle>,
    pricer: Arc<crate::auction::TransferPricer>,
    dispatcher: Arc<Dispatcher>,
    registry: DashMap<TransferKey, Arc<Mutex<TrackedTransfer>>>,
    shutdown: Arc<RwLock<bool>>,
}

impl LifecycleEngine {
    pub fn new(
        settings: Arc<Settings>,
        chains: Arc<ChainManager>,
        tracker: Arc<EventTracker>,
        oracle: Arc<PriceOracle>,
        pricer: Arc<crate::auction::TransferPricer>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            chains,
            tracker,
            oracle,
            pricer,
            dispatcher,
            registry: DashMap::new(),
            shutdown: Arc::new(RwLock::new(false)),
        })
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of one transfer, `None` when unknown or mid-decision.
    pub fn transfer(
        &self,
        transaction_id: TransactionId,
        user: Address,
    ) -> Option<TrackedTransfer> {
        let entry = self.registry.get(&(transaction_id, user))?.value().clone();
        entry.try_lock().ok().map(|guard| guard.clone())
    }

    /// Main loop: tracker events plus the periodic expiry sweep.
    pub async fn run(self: Arc<Self>) {
        let mut events = self.tracker.subscribe();
        let mut sweep =
            tokio::time::interval(Duration::from_secs(self.settings.expiry_check_interval));
        info!("lifecycle engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "lifecycle lagged behind tracker; state heals on next poll");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = sweep.tick() => {
                    self.expiry_sweep().await;
                }
            }
        }
        info!("lifecycle engine stopped");
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// Single-flight entry guard: `None` when a decision for this transfer
    /// is already executing.
    fn try_claim(&self, key: &TransferKey) -> Option<OwnedMutexGuard<TrackedTransfer>> {
        let entry = self.registry.get(key)?.value().clone();
        entry.try_lock_owned().ok()
    }

    pub async fn handle_event(&self, event: TransactionEvent) {
        let key = event.record().invariant.key();
        debug!(event = event.name(), transaction_id = ?key.0, "lifecycle event");

        match event {
            TransactionEvent::SenderPrepared(record) => {
                self.on_sender_prepared(key, record).await;
            }
            TransactionEvent::ReceiverPrepared(record) => {
                if let Some(mut transfer) = self.try_claim(&key) {
                    transfer.receiver = Some(record.variant.clone());
                    transfer.receiver_status = Some(TransactionStatus::Prepared);
                    crate::metrics::record_transfer_state(transfer.state());
                }
            }
            TransactionEvent::ReceiverFulfilled(record) => {
                self.on_receiver_fulfilled(key, record).await;
            }
            TransactionEvent::SenderFulfilled(_) => {
                if let Some(mut transfer) = self.try_claim(&key) {
                    transfer.sender_status = TransactionStatus::Fulfilled;
                    crate::metrics::record_transfer_state(transfer.state());
                    if transfer.is_removable() {
                        drop(transfer);
                        self.registry.remove(&key);
                    }
                }
            }
            TransactionEvent::ReceiverCancelled(record) => {
                if let Some(mut transfer) = self.try_claim(&key) {
                    transfer.receiver = Some(record.variant.clone());
                    transfer.receiver_status = Some(TransactionStatus::Cancelled);
                    crate::metrics::record_transfer_state(transfer.state());
                }
            }
            TransactionEvent::SenderCancelled(_) => {
                if let Some(mut transfer) = self.try_claim(&key) {
                    transfer.sender_status = TransactionStatus::Cancelled;
                    crate::metrics::record_transfer_state(transfer.state());
                    if transfer.is_removable() {
                        drop(transfer);
                        self.registry.remove(&key);
                    }
                }
            }
        }
    }

    /// New sender-side prepare: promote to a tracked transfer and, unless a
    /// receiver record already exists, prepare the receiving side.
    async fn on_sender_prepared(&self, key: TransferKey, record: TransactionRecord) {
        self.registry
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(TrackedTransfer::from_sender_record(&record))));

        let Some(mut transfer) = self.try_claim(&key) else {
            return;
        };
        if transfer.state() != TransferState::SenderPrepared {
            // Duplicate event for a transfer that already progressed.
            return;
        }

        let invariant = transfer.invariant.clone();

        // The receiver side may already exist (restart, duplicate event);
        // advance instead of double-preparing.
        match self
            .tracker
            .get_transaction_for_chain(key.0, key.1, invariant.receiving_chain_id)
            .await
        {
            Ok(Some(receiver)) => {
                debug!(transaction_id = ?key.0, "receiver record already exists, advancing");
                transfer.receiver = Some(receiver.variant.clone());
                transfer.receiver_status = Some(receiver.status);
                crate::metrics::record_transfer_state(transfer.state());
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(transaction_id = ?key.0, error = %e, "receiver lookup failed, retrying next tick");
                return;
            }
        }

        let now = time::now_seconds();
        let Some(receiver_expiry) = policy::receiver_expiry(now, transfer.sender.expiry) else {
            info!(transaction_id = ?key.0, "sender window too tight to prepare, dropping");
            drop(transfer);
            self.registry.remove(&key);
            return;
        };

        // Re-price at execution time so the bid invariants still hold.
        let quote = match self
            .pricer
            .quote_route(
                crate::auction::RouteLeg {
                    chain_id: invariant.sending_chain_id,
                    asset_id: invariant.sending_asset_id,
                },
                crate::auction::RouteLeg {
                    chain_id: invariant.receiving_chain_id,
                    asset_id: invariant.receiving_asset_id,
                },
                transfer.sender.amount,
            )
            .await
        {
            Ok(quote) => quote,
            Err(e @ RouterError::NotEnoughLiquidity { .. }) => {
                error!(transaction_id = ?key.0, error = %e, "liquidity gone since bid, dropping transfer");
                drop(transfer);
                self.registry.remove(&key);
                return;
            }
            Err(e) if e.is_retryable() => {
                warn!(transaction_id = ?key.0, error = %e, "pricing failed, retrying next tick");
                return;
            }
            Err(e) => {
                error!(transaction_id = ?key.0, error = %e, "pricing rejected transfer");
                return;
            }
        };

        let action = Action {
            chain_id: invariant.receiving_chain_id,
            kind: ActionKind::Prepare,
            transaction_id: key.0,
            to: invariant.receiving_chain_tx_manager_address,
            data: encode::prepare(
                &invariant,
                quote.amount_received,
                receiver_expiry,
                &transfer.encrypted_call_data,
            ),
            value: U256::zero(),
        };
        self.spawn_dispatch(vec![action], transfer);
    }

    /// Receiver fulfilled: the user revealed the preimage; finish the
    /// sender side with the relayed signature.
    async fn on_receiver_fulfilled(&self, key: TransferKey, record: TransactionRecord) {
        let Some(mut transfer) = self.try_claim(&key) else {
            return;
        };
        transfer.receiver = Some(record.variant.clone());
        transfer.receiver_status = Some(TransactionStatus::Fulfilled);
        transfer.receiver_signature = record.signature.clone();
        transfer.receiver_call_data = record.call_data.clone();
        crate::metrics::record_transfer_state(transfer.state());

        if let Some(action) = self.build_sender_fulfill(&transfer).await {
            self.spawn_dispatch(vec![action], transfer);
        }
    }

    async fn build_sender_fulfill(&self, transfer: &TrackedTransfer) -> Option<Action> {
        let Some(signature) = transfer.receiver_signature.clone() else {
            error!(
                transaction_id = ?transfer.invariant.transaction_id,
                "receiver fulfilled without a relayed signature; cannot fulfill sender"
            );
            return None;
        };
        let call_data = transfer
            .receiver_call_data
            .clone()
            .unwrap_or_else(|| "0x".to_string());

        let invariant = &transfer.invariant;
        let relayer_fee = self
            .relayer_fee(invariant.sending_chain_id, ActionKind::Fulfill)
            .await;

        Some(Action {
            chain_id: invariant.sending_chain_id,
            kind: ActionKind::Fulfill,
            transaction_id: invariant.transaction_id,
            to: invariant.sending_chain_tx_manager_address,
            data: encode::fulfill(
                invariant.transaction_id,
                relayer_fee,
                &signature,
                &call_data,
            ),
            value: U256::zero(),
        })
    }

    /// Relayed fulfill arriving over messaging: execute the receiver side.
    pub async fn handle_fulfill_request(&self, request: FulfillRequest) -> RouterResult<()> {
        let key = (request.transaction_id, request.user);
        let Some(transfer) = self.try_claim(&key) else {
            return Err(RouterError::ParamsInvalid {
                message: "unknown or busy transfer".into(),
            });
        };
        if transfer.state() != TransferState::BothPrepared {
            return Err(RouterError::ParamsInvalid {
                message: format!("transfer not fulfillable in state {:?}", transfer.state()),
            });
        }

        let invariant = transfer.invariant.clone();
        let action = Action {
            chain_id: invariant.receiving_chain_id,
            kind: ActionKind::Fulfill,
            transaction_id: invariant.transaction_id,
            to: invariant.receiving_chain_tx_manager_address,
            data: encode::fulfill(
                invariant.transaction_id,
                request.relayer_fee,
                &request.signature,
                &request.call_data,
            ),
            value: U256::zero(),
        };
        self.spawn_dispatch(vec![action], transfer);
        Ok(())
    }

    /// Periodic sweep: cancel expired sides, retry stalled sender fulfills,
    /// drop finished transfers. Operates on a snapshot of the registry.
    pub async fn expiry_sweep(&self) {
        let snapshot: Vec<(TransferKey, Arc<Mutex<TrackedTransfer>>)> = self
            .registry
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let now = time::now_seconds();

        for (key, entry) in snapshot {
            let Ok(transfer) = entry.try_lock_owned() else {
                continue;
            };

            match transfer.state() {
                TransferState::Fulfilled | TransferState::Cancelled => {
                    if transfer.is_removable() {
                        drop(transfer);
                        self.registry.remove(&key);
                    }
                }
                TransferState::ReceiverFulfilled => {
                    // A failed sender fulfill is retried here; the dispatcher
                    // dedups if the earlier attempt actually landed.
                    if let Some(action) = self.build_sender_fulfill(&transfer).await {
                        self.spawn_dispatch(vec![action], transfer);
                    }
                }
                TransferState::SenderPrepared
                | TransferState::BothPrepared
                | TransferState::ReceiverCancelled => {
                    let actions = self.cancel_actions(now, &key, &transfer).await;
                    if !actions.is_empty() {
                        self.spawn_dispatch(actions, transfer);
                    }
                }
            }
        }
    }

    /// Cancel actions due for this transfer, receiver side first.
    async fn cancel_actions(
        &self,
        now: u64,
        key: &TransferKey,
        transfer: &TrackedTransfer,
    ) -> Vec<Action> {
        let invariant = &transfer.invariant;
        let mut actions = Vec::new();

        if let (Some(variant), Some(TransactionStatus::Prepared)) =
            (&transfer.receiver, transfer.receiver_status)
        {
            if policy::can_cancel_receiver(now, variant.expiry) {
                actions.push(Action {
                    chain_id: invariant.receiving_chain_id,
                    kind: ActionKind::Cancel,
                    transaction_id: key.0,
                    to: invariant.receiving_chain_tx_manager_address,
                    data: encode::cancel(key.0, "0x"),
                    value: U256::zero(),
                });
            }
        }

        // Sender side only once the receiver is out of the picture and the
        // sender's own window (or the receiver's cancellation) says so.
        let receiver_gone = match transfer.receiver_status {
            Some(TransactionStatus::Cancelled) => true,
            Some(TransactionStatus::Prepared) => transfer
                .receiver
                .as_ref()
                .map(|v| now > v.expiry)
                .unwrap_or(false),
            Some(TransactionStatus::Fulfilled) => false,
            None => now > transfer.sender.expiry,
        };
        if !receiver_gone {
            return actions;
        }

        let prepared_timestamp = match self.sender_prepared_timestamp(transfer).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(transaction_id = ?key.0, error = %e, "prepared-block lookup failed");
                return actions;
            }
        };

        match policy::check_sender_cancel(now, prepared_timestamp, transfer.receiver_view(), key.0)
        {
            Ok(()) => {
                actions.push(Action {
                    chain_id: invariant.sending_chain_id,
                    kind: ActionKind::Cancel,
                    transaction_id: key.0,
                    to: invariant.sending_chain_tx_manager_address,
                    data: encode::cancel(key.0, "0x"),
                    value: U256::zero(),
                });
            }
            Err(e) => {
                debug!(transaction_id = ?key.0, reason = %e, "sender cancel deferred");
            }
        }
        actions
    }

    async fn sender_prepared_timestamp(&self, transfer: &TrackedTransfer) -> RouterResult<u64> {
        self.chains
            .get(transfer.invariant.sending_chain_id)?
            .get_block_timestamp(transfer.sender.prepared_block_number)
            .await
    }

    /// Fee owed to the meta-tx relayer for `action`, in the chain's
    /// configured relayer asset (native when unset).
    async fn relayer_fee(&self, chain_id: ChainId, action: ActionKind) -> U256 {
        let asset = self
            .settings
            .chain(chain_id)
            .and_then(|c| c.router_contract_relayer_asset)
            .unwrap_or_else(Address::zero);

        let decimals = match self.chains.get(chain_id) {
            Ok(rpc) => rpc.get_decimals_for_asset(asset).await.unwrap_or(18),
            Err(_) => 18,
        };

        self.oracle
            .gas_fee_in_token(
                chain_id,
                asset,
                decimals,
                action,
                crate::types::TransferSide::Sending,
            )
            .await
            .unwrap_or_else(|_| U256::zero())
    }

    /// Run the actions on a background task, holding the transfer's
    /// single-flight guard until every dispatch settles.
    fn spawn_dispatch(&self, actions: Vec<Action>, guard: OwnedMutexGuard<TrackedTransfer>) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let _guard = guard;
            for action in actions {
                let kind = action.kind.name();
                let transaction_id = action.transaction_id;
                match dispatcher.dispatch(action).await {
                    Ok(Some(receipt)) => {
                        info!(
                            ?transaction_id,
                            kind,
                            tx_hash = ?receipt.transaction_hash,
                            "lifecycle action confirmed"
                        );
                    }
                    Ok(None) => {
                        debug!(?transaction_id, kind, "lifecycle action already handled");
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(?transaction_id, kind, error = %e, "lifecycle action failed, will retry");
                    }
                    Err(e) => {
                        error!(?transaction_id, kind, error = %e, "lifecycle action failed");
                    }
                }
            }
        });
    }
}
