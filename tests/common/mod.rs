//! Shared test harness: in-memory chain RPC and subgraph implementations
//! driven through the same traits the daemon uses in production.
#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use meridian_router::chain::ChainRpc;
use meridian_router::error::{RouterError, RouterResult};
use meridian_router::subgraph::{SubgraphClient, SyncRecord};
use meridian_router::types::{ChainId, TransactionId, TransactionRecord};

/// A transaction accepted by the mock chain.
#[derive(Debug, Clone)]
pub struct SentTransaction {
    pub nonce: u64,
    pub to: Option<Address>,
    pub data: Vec<u8>,
    pub hash: H256,
}

/// In-memory chain backend.
pub struct MockChain {
    chain_id: ChainId,
    pub block_number: Mutex<u64>,
    pub native_balances: Mutex<HashMap<Address, U256>>,
    pub decimals: Mutex<HashMap<Address, u8>>,
    pub token_prices: Mutex<HashMap<Address, U256>>,
    pub block_timestamps: Mutex<HashMap<u64, u64>>,
    pub sent: Mutex<Vec<SentTransaction>>,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id: ChainId(chain_id),
            block_number: Mutex::new(100),
            native_balances: Mutex::new(HashMap::new()),
            decimals: Mutex::new(HashMap::new()),
            token_prices: Mutex::new(HashMap::new()),
            block_timestamps: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_native_balance(&self, address: Address, balance: U256) {
        self.native_balances.lock().unwrap().insert(address, balance);
    }

    pub fn set_decimals(&self, asset: Address, decimals: u8) {
        self.decimals.lock().unwrap().insert(asset, decimals);
    }

    pub fn set_block_timestamp(&self, block: u64, timestamp: u64) {
        self.block_timestamps.lock().unwrap().insert(block, timestamp);
    }

    pub fn sent_transactions(&self) -> Vec<SentTransaction> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent transactions whose calldata starts with the selector of `sig`.
    pub fn sent_with_selector(&self, sig: &str) -> Vec<SentTransaction> {
        let selector = ethers::utils::id(sig);
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| tx.data.len() >= 4 && tx.data[..4] == selector)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn read_transaction(&self, tx: &TypedTransaction) -> RouterResult<Bytes> {
        // Only the price oracle issues reads in tests: getTokenPrice(address).
        let data = tx.data().cloned().unwrap_or_default();
        let selector = ethers::utils::id("getTokenPrice(address)");
        if data.len() >= 36 && data[..4] == selector {
            let asset = Address::from_slice(&data[16..36]);
            let price = self
                .token_prices
                .lock()
                .unwrap()
                .get(&asset)
                .copied()
                .unwrap_or_else(|| U256::exp10(18));
            let mut out = [0u8; 32];
            price.to_big_endian(&mut out);
            return Ok(Bytes::from(out.to_vec()));
        }
        Err(RouterError::RpcError {
            chain_id: self.chain_id,
            message: "unexpected eth_call in mock".into(),
        })
    }

    async fn send_transaction(&self, raw: Bytes) -> RouterResult<H256> {
        let rlp = ethers::utils::rlp::Rlp::new(raw.as_ref());
        let (tx, _signature) =
            TypedTransaction::decode_signed(&rlp).map_err(|e| RouterError::RpcError {
                chain_id: self.chain_id,
                message: format!("mock failed to decode raw tx: {}", e),
            })?;

        let hash = H256::from(ethers::utils::keccak256(&raw));
        let to = tx.to().and_then(|t| t.as_address().copied());
        let sent = SentTransaction {
            nonce: tx.nonce().map(|n| n.as_u64()).unwrap_or_default(),
            to,
            data: tx.data().map(|d| d.to_vec()).unwrap_or_default(),
            hash,
        };
        self.sent.lock().unwrap().push(sent);
        Ok(hash)
    }

    async fn get_balance(&self, address: Address) -> RouterResult<U256> {
        Ok(self
            .native_balances
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn get_code(&self, _address: Address) -> RouterResult<Bytes> {
        Ok(Bytes::from(vec![0x60]))
    }

    async fn get_block_number(&self) -> RouterResult<u64> {
        Ok(*self.block_number.lock().unwrap())
    }

    async fn get_block_timestamp(&self, block_number: u64) -> RouterResult<u64> {
        self.block_timestamps
            .lock()
            .unwrap()
            .get(&block_number)
            .copied()
            .ok_or(RouterError::RpcError {
                chain_id: self.chain_id,
                message: format!("no timestamp for block {}", block_number),
            })
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RouterResult<Option<TransactionReceipt>> {
        let sent = self.sent.lock().unwrap();
        if sent.iter().any(|tx| tx.hash == tx_hash) {
            let mut receipt = TransactionReceipt::default();
            receipt.transaction_hash = tx_hash;
            receipt.status = Some(1u64.into());
            receipt.block_number = Some((*self.block_number.lock().unwrap()).into());
            Ok(Some(receipt))
        } else {
            Ok(None)
        }
    }

    async fn get_decimals_for_asset(&self, asset: Address) -> RouterResult<u8> {
        if asset == Address::zero() {
            return Ok(18);
        }
        Ok(self
            .decimals
            .lock()
            .unwrap()
            .get(&asset)
            .copied()
            .unwrap_or(18))
    }

    async fn get_gas_price(&self) -> RouterResult<U256> {
        Ok(U256::from(1_000_000_000u64)) // 1 gwei
    }

    async fn get_transaction_count(&self, _address: Address) -> RouterResult<u64> {
        Ok(0)
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> RouterResult<U256> {
        Ok(U256::from(100_000u64))
    }
}

/// In-memory subgraph backend shared across chains.
#[derive(Default)]
pub struct MockSubgraph {
    pub synced: Mutex<HashMap<ChainId, bool>>,
    pub asset_balances: Mutex<HashMap<(ChainId, Address), U256>>,
    pub records: Mutex<Vec<TransactionRecord>>,
}

impl MockSubgraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_synced(&self, chain_id: u64, synced: bool) {
        self.synced.lock().unwrap().insert(ChainId(chain_id), synced);
    }

    pub fn set_asset_balance(&self, chain_id: u64, asset: Address, balance: U256) {
        self.asset_balances
            .lock()
            .unwrap()
            .insert((ChainId(chain_id), asset), balance);
    }

    pub fn push_record(&self, record: TransactionRecord) {
        self.records.lock().unwrap().push(record);
    }
}

#[async_trait]
impl SubgraphClient for MockSubgraph {
    async fn sync_records(&self, chain_id: ChainId) -> RouterResult<Vec<SyncRecord>> {
        let synced = self
            .synced
            .lock()
            .unwrap()
            .get(&chain_id)
            .copied()
            .unwrap_or(true);
        Ok(vec![SyncRecord {
            synced,
            latest_block: 100,
            synced_block: if synced { 100 } else { 10 },
            lag: if synced { 0 } else { 90 },
            uri: format!("http://indexer.local/{}", chain_id),
        }])
    }

    async fn router_transactions(&self, chain_id: ChainId) -> RouterResult<Vec<TransactionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.chain_id == chain_id)
            .cloned()
            .collect())
    }

    async fn transaction(
        &self,
        transaction_id: TransactionId,
        user: Address,
        chain_id: ChainId,
    ) -> RouterResult<Option<TransactionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| {
                r.invariant.transaction_id == transaction_id
                    && r.invariant.user == user
                    && r.chain_id == chain_id
            })
            .cloned())
    }

    async fn asset_balance(&self, asset: Address, chain_id: ChainId) -> RouterResult<U256> {
        Ok(self
            .asset_balances
            .lock()
            .unwrap()
            .get(&(chain_id, asset))
            .copied()
            .unwrap_or_default())
    }
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until<F: Fn() -> bool>(predicate: F) -> bool {
    for _ in 0..100 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}
