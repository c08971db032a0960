//! Lifecycle state machine scenarios: receiver prepare, fulfill chaining,
//! cancel policy, and idempotence, driven through mock chains.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, H256, U256};

use common::{wait_until, MockChain, MockSubgraph};
use meridian_router::auction::TransferPricer;
use meridian_router::chain::ChainManager;
use meridian_router::config::Settings;
use meridian_router::dispatch::Dispatcher;
use meridian_router::events::TransactionEvent;
use meridian_router::lifecycle::{FulfillRequest, LifecycleEngine, TransferState};
use meridian_router::oracle::PriceOracle;
use meridian_router::subgraph::EventTracker;
use meridian_router::types::{
    time, ChainId, InvariantData, TransactionRecord, TransactionStatus, VariantData,
};
use meridian_router::wallet::{LocalSigner, RouterSigner};

const MNEMONIC: &str = "test test test test test test test test test test test junk";

const SENDING_CHAIN: u64 = 1337;
const RECEIVING_CHAIN: u64 = 1338;

const PREPARE_SIG: &str =
    "prepare(bytes32,address,address,address,address,uint256,uint256,bytes32,bytes)";
const FULFILL_SIG: &str = "fulfill(bytes32,uint256,bytes,bytes)";
const CANCEL_SIG: &str = "cancel(bytes32,bytes)";

fn sending_asset() -> Address {
    Address::from_low_u64_be(0xA)
}

fn receiving_asset() -> Address {
    Address::from_low_u64_be(0xB)
}

fn config() -> String {
    format!(
        r#"
        mnemonic = "{MNEMONIC}"
        nats_url = "nats://localhost:4222"
        request_limit = 5000
        max_price_impact = 0.1
        amplification = 85

        [chains.1337]
        providers = ["http://localhost:8545"]
        confirmations = 1
        min_gas = "100000000000000000"
        transaction_manager_address = "0x00000000000000000000000000000000000000aa"
        subgraphs = ["http://localhost:8000/subgraphs/sending"]

        [chains.1338]
        providers = ["http://localhost:8546"]
        confirmations = 1
        min_gas = "100000000000000000"
        transaction_manager_address = "0x00000000000000000000000000000000000000bb"
        subgraphs = ["http://localhost:8001/subgraphs/receiving"]

        [[swap_pools]]
        name = "TEST"
        [[swap_pools.assets]]
        chain_id = 1337
        asset_id = "0x000000000000000000000000000000000000000a"
        [[swap_pools.assets]]
        chain_id = 1338
        asset_id = "0x000000000000000000000000000000000000000b"
        "#
    )
}

struct Harness {
    engine: Arc<LifecycleEngine>,
    chain_a: Arc<MockChain>,
    chain_b: Arc<MockChain>,
    router: Address,
    user: Address,
}

impl Harness {
    async fn new() -> Self {
        let settings = Arc::new(Settings::parse(&config()).unwrap());
        let signer: Arc<dyn RouterSigner> =
            Arc::new(LocalSigner::from_mnemonic(MNEMONIC).unwrap());
        let router = signer.address();
        let user = Address::from_low_u64_be(1);

        let chain_a = Arc::new(MockChain::new(SENDING_CHAIN));
        let chain_b = Arc::new(MockChain::new(RECEIVING_CHAIN));
        for chain in [&chain_a, &chain_b] {
            chain.set_native_balance(router, U256::exp10(18));
        }
        chain_a.set_decimals(sending_asset(), 6);
        chain_b.set_decimals(receiving_asset(), 6);

        let chains = Arc::new(ChainManager::new());
        chains.insert(ChainId(SENDING_CHAIN), chain_a.clone());
        chains.insert(ChainId(RECEIVING_CHAIN), chain_b.clone());

        let subgraph = Arc::new(MockSubgraph::new());
        let million = U256::from(1_000_000_000_000u64);
        subgraph.set_asset_balance(SENDING_CHAIN, sending_asset(), million);
        subgraph.set_asset_balance(RECEIVING_CHAIN, receiving_asset(), million);

        let tracker = Arc::new(EventTracker::new(
            subgraph,
            vec![ChainId(SENDING_CHAIN), ChainId(RECEIVING_CHAIN)],
            Duration::from_secs(10),
        ));

        let oracle = Arc::new(PriceOracle::new(settings.clone(), chains.clone()));
        let pricer = Arc::new(TransferPricer::new(
            settings.clone(),
            chains.clone(),
            tracker.clone(),
            oracle.clone(),
        ));

        let dispatcher = Arc::new(
            Dispatcher::start(&chains, signer, oracle.clone(), settings.clone())
                .await
                .unwrap(),
        );

        let engine = LifecycleEngine::new(settings, chains, tracker, oracle, pricer, dispatcher);

        Self {
            engine,
            chain_a,
            chain_b,
            router,
            user,
        }
    }

    fn invariant(&self) -> InvariantData {
        InvariantData {
            transaction_id: H256::from_low_u64_be(0x99),
            user: self.user,
            router: self.router,
            initiator: self.user,
            sending_chain_id: ChainId(SENDING_CHAIN),
            sending_asset_id: sending_asset(),
            receiving_chain_id: ChainId(RECEIVING_CHAIN),
            receiving_asset_id: receiving_asset(),
            sending_chain_tx_manager_address: Address::from_low_u64_be(0xAA),
            receiving_chain_tx_manager_address: Address::from_low_u64_be(0xBB),
            call_to: Address::zero(),
            call_data_hash: H256::zero(),
            receiving_address: self.user,
        }
    }

    fn sender_record(&self) -> TransactionRecord {
        TransactionRecord {
            invariant: self.invariant(),
            variant: VariantData {
                amount: U256::from(1_000_000u64),
                expiry: time::now_seconds() + 3 * 86_400,
                prepared_block_number: 42,
            },
            status: TransactionStatus::Prepared,
            chain_id: ChainId(SENDING_CHAIN),
            signature: None,
            call_data: None,
            encrypted_call_data: Some("0x".into()),
        }
    }

    fn receiver_record(&self, status: TransactionStatus, expiry: u64) -> TransactionRecord {
        TransactionRecord {
            invariant: self.invariant(),
            variant: VariantData {
                amount: U256::from(990_000u64),
                expiry,
                prepared_block_number: 7,
            },
            status,
            chain_id: ChainId(RECEIVING_CHAIN),
            signature: matches!(status, TransactionStatus::Fulfilled).then(|| "0xabcd".to_string()),
            call_data: matches!(status, TransactionStatus::Fulfilled).then(|| "0x".to_string()),
            encrypted_call_data: None,
        }
    }

    /// Wait for every spawned dispatch to settle.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
}

#[tokio::test]
async fn sender_prepared_triggers_receiver_prepare_once() {
    let harness = Harness::new().await;
    let record = harness.sender_record();

    harness
        .engine
        .handle_event(TransactionEvent::SenderPrepared(record.clone()))
        .await;
    assert!(wait_until(|| harness.chain_b.sent_with_selector(PREPARE_SIG).len() == 1).await);
    harness.settle().await;

    // Duplicate sender event: state check + dispatcher dedup keep it a no-op.
    harness
        .engine
        .handle_event(TransactionEvent::SenderPrepared(record))
        .await;
    harness.settle().await;
    assert_eq!(harness.chain_b.sent_with_selector(PREPARE_SIG).len(), 1);

    // Nothing touched the sending chain.
    assert!(harness.chain_a.sent_transactions().is_empty());

    let transfer = harness
        .engine
        .transfer(H256::from_low_u64_be(0x99), harness.user)
        .unwrap();
    assert_eq!(transfer.state(), TransferState::SenderPrepared);
}

#[tokio::test]
async fn fulfill_chain_runs_receiver_then_sender() {
    let harness = Harness::new().await;
    let transaction_id = H256::from_low_u64_be(0x99);

    harness
        .engine
        .handle_event(TransactionEvent::SenderPrepared(harness.sender_record()))
        .await;
    assert!(wait_until(|| harness.chain_b.sent_with_selector(PREPARE_SIG).len() == 1).await);
    harness.settle().await;

    let receiver_expiry = time::now_seconds() + 2 * 86_400;
    harness
        .engine
        .handle_event(TransactionEvent::ReceiverPrepared(
            harness.receiver_record(TransactionStatus::Prepared, receiver_expiry),
        ))
        .await;
    let transfer = harness.engine.transfer(transaction_id, harness.user).unwrap();
    assert_eq!(transfer.state(), TransferState::BothPrepared);

    // The user relays the fulfill through messaging.
    harness
        .engine
        .handle_fulfill_request(FulfillRequest {
            transaction_id,
            user: harness.user,
            signature: "0xabcd".to_string(),
            call_data: "0x".to_string(),
            relayer_fee: U256::zero(),
        })
        .await
        .unwrap();
    assert!(wait_until(|| harness.chain_b.sent_with_selector(FULFILL_SIG).len() == 1).await);
    harness.settle().await;

    // The tracker observes the receiver fulfill; the sender side follows,
    // reusing the relayed signature.
    harness
        .engine
        .handle_event(TransactionEvent::ReceiverFulfilled(
            harness.receiver_record(TransactionStatus::Fulfilled, receiver_expiry),
        ))
        .await;
    assert!(wait_until(|| harness.chain_a.sent_with_selector(FULFILL_SIG).len() == 1).await);
    harness.settle().await;

    // Terminal on both sides removes the transfer.
    harness
        .engine
        .handle_event(TransactionEvent::SenderFulfilled(TransactionRecord {
            status: TransactionStatus::Fulfilled,
            ..harness.sender_record()
        }))
        .await;
    assert!(harness.engine.transfer(transaction_id, harness.user).is_none());
    assert_eq!(harness.engine.active_count(), 0);
}

#[tokio::test]
async fn sender_cancel_respects_prepare_buffer() {
    let harness = Harness::new().await;

    harness
        .engine
        .handle_event(TransactionEvent::SenderPrepared(harness.sender_record()))
        .await;
    assert!(wait_until(|| harness.chain_b.sent_with_selector(PREPARE_SIG).len() == 1).await);
    harness.settle().await;

    // Receiver side got cancelled; the sender side may follow only after
    // the 780s safety window.
    harness
        .engine
        .handle_event(TransactionEvent::ReceiverCancelled(
            harness.receiver_record(TransactionStatus::Cancelled, time::now_seconds() + 86_400),
        ))
        .await;

    // Sender prepare only 600s old: too new to cancel.
    harness
        .chain_a
        .set_block_timestamp(42, time::now_seconds() - 600);
    harness.engine.expiry_sweep().await;
    harness.settle().await;
    assert!(harness.chain_a.sent_with_selector(CANCEL_SIG).is_empty());

    // Past the buffer: cancel goes out.
    harness
        .chain_a
        .set_block_timestamp(42, time::now_seconds() - 800);
    harness.engine.expiry_sweep().await;
    assert!(wait_until(|| harness.chain_a.sent_with_selector(CANCEL_SIG).len() == 1).await);
}

#[tokio::test]
async fn expired_receiver_is_cancelled_by_sweep() {
    let harness = Harness::new().await;

    harness
        .engine
        .handle_event(TransactionEvent::SenderPrepared(harness.sender_record()))
        .await;
    assert!(wait_until(|| harness.chain_b.sent_with_selector(PREPARE_SIG).len() == 1).await);
    harness.settle().await;

    // Receiver prepared but its expiry already passed.
    harness
        .engine
        .handle_event(TransactionEvent::ReceiverPrepared(
            harness.receiver_record(TransactionStatus::Prepared, time::now_seconds() - 10),
        ))
        .await;

    // Keep the sender side too fresh to cancel so only the receiver leg
    // goes out.
    harness
        .chain_a
        .set_block_timestamp(42, time::now_seconds() - 100);
    harness.engine.expiry_sweep().await;
    assert!(wait_until(|| harness.chain_b.sent_with_selector(CANCEL_SIG).len() == 1).await);
    harness.settle().await;
    assert!(harness.chain_a.sent_with_selector(CANCEL_SIG).is_empty());
}
