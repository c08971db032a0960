//! Dispatcher ordering and idempotence under concurrent load.

mod common;

use std::sync::Arc;

use ethers::types::{Address, Bytes, H256, U256};

use common::MockChain;
use meridian_router::chain::ChainManager;
use meridian_router::config::Settings;
use meridian_router::dispatch::{Action, Dispatcher};
use meridian_router::oracle::{ActionKind, PriceOracle};
use meridian_router::types::ChainId;
use meridian_router::wallet::{LocalSigner, RouterSigner};

const MNEMONIC: &str = "test test test test test test test test test test test junk";

const CHAIN: u64 = 1337;

fn config() -> String {
    format!(
        r#"
        mnemonic = "{MNEMONIC}"
        nats_url = "nats://localhost:4222"

        [chains.1337]
        providers = ["http://localhost:8545"]
        confirmations = 1
        min_gas = "100000000000000000"
        transaction_manager_address = "0x00000000000000000000000000000000000000aa"
        subgraphs = ["http://localhost:8000/subgraphs/sending"]
        "#
    )
}

struct Harness {
    dispatcher: Arc<Dispatcher>,
    chain: Arc<MockChain>,
}

async fn harness() -> Harness {
    let settings = Arc::new(Settings::parse(&config()).unwrap());
    let signer: Arc<dyn RouterSigner> = Arc::new(LocalSigner::from_mnemonic(MNEMONIC).unwrap());

    let chain = Arc::new(MockChain::new(CHAIN));
    let chains = Arc::new(ChainManager::new());
    chains.insert(ChainId(CHAIN), chain.clone());

    let oracle = Arc::new(PriceOracle::new(settings.clone(), chains.clone()));
    let dispatcher = Arc::new(
        Dispatcher::start_single(
            ChainId(CHAIN),
            chain.clone(),
            signer,
            oracle,
            1,
            3,
        )
        .await
        .unwrap(),
    );

    Harness { dispatcher, chain }
}

fn action(transaction_id: H256) -> Action {
    Action {
        chain_id: ChainId(CHAIN),
        kind: ActionKind::Prepare,
        transaction_id,
        to: Address::from_low_u64_be(0xAA),
        data: Bytes::from(vec![0x01, 0x02, 0x03, 0x04]),
        value: U256::zero(),
    }
}

#[tokio::test]
async fn concurrent_dispatches_emit_strictly_increasing_nonces() {
    let harness = harness().await;

    let mut handles = Vec::new();
    for i in 0..100u64 {
        let dispatcher = harness.dispatcher.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.dispatch(action(H256::from_low_u64_be(i))).await
        }));
    }

    for handle in handles {
        let receipt = handle.await.unwrap().unwrap();
        assert!(receipt.is_some(), "every distinct action lands on chain");
    }

    let nonces: Vec<u64> = harness
        .chain
        .sent_transactions()
        .iter()
        .map(|tx| tx.nonce)
        .collect();
    assert_eq!(nonces.len(), 100);
    for (expected, nonce) in nonces.iter().enumerate() {
        assert_eq!(*nonce, expected as u64, "nonces are gapless and ordered");
    }
}

#[tokio::test]
async fn duplicate_action_is_a_single_on_chain_effect() {
    let harness = harness().await;
    let first = harness
        .dispatcher
        .dispatch(action(H256::from_low_u64_be(7)))
        .await
        .unwrap();
    assert!(first.is_some());

    let second = harness
        .dispatcher
        .dispatch(action(H256::from_low_u64_be(7)))
        .await
        .unwrap();
    assert!(second.is_none(), "replay is suppressed");

    assert_eq!(harness.chain.sent_transactions().len(), 1);
}

#[tokio::test]
async fn racing_duplicates_still_land_once() {
    let harness = harness().await;

    let a = {
        let dispatcher = harness.dispatcher.clone();
        tokio::spawn(async move { dispatcher.dispatch(action(H256::from_low_u64_be(9))).await })
    };
    let b = {
        let dispatcher = harness.dispatcher.clone();
        tokio::spawn(async move { dispatcher.dispatch(action(H256::from_low_u64_be(9))).await })
    };

    let results = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
    let landed = results.iter().filter(|r| r.is_some()).count();
    assert_eq!(landed, 1);
    assert_eq!(harness.chain.sent_transactions().len(), 1);
}

#[tokio::test]
async fn distinct_kinds_for_one_transfer_both_land() {
    let harness = harness().await;
    let transaction_id = H256::from_low_u64_be(11);

    let prepare = harness.dispatcher.dispatch(action(transaction_id)).await.unwrap();
    assert!(prepare.is_some());

    let mut fulfill = action(transaction_id);
    fulfill.kind = ActionKind::Fulfill;
    let fulfilled = harness.dispatcher.dispatch(fulfill).await.unwrap();
    assert!(fulfilled.is_some());

    assert_eq!(harness.chain.sent_transactions().len(), 2);
}
