//! Core domain types shared across the router.
//!
//! Wire-facing structs serialize as camelCase JSON with amounts as decimal
//! strings; everything internal is strongly typed (`ChainId`, `U256`,
//! `Address`, `H256`).

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Chain identifier newtype. Keying per-chain maps by this instead of a bare
/// integer (or worse, a stringified one) prevents cross-chain mix-ups.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for ChainId {
    fn from(v: u64) -> Self {
        ChainId(v)
    }
}

/// 32-byte transaction identity shared by both sides of a transfer.
pub type TransactionId = H256;

/// The immutable identity of a cross-chain transfer, identical on both
/// chains. Keyed by `(transaction_id, user)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvariantData {
    pub transaction_id: TransactionId,
    pub user: Address,
    pub router: Address,
    pub initiator: Address,
    pub sending_chain_id: ChainId,
    pub sending_asset_id: Address,
    pub receiving_chain_id: ChainId,
    pub receiving_asset_id: Address,
    pub sending_chain_tx_manager_address: Address,
    pub receiving_chain_tx_manager_address: Address,
    pub call_to: Address,
    pub call_data_hash: H256,
    pub receiving_address: Address,
}

impl InvariantData {
    /// Registry key for the lifecycle state machine.
    pub fn key(&self) -> (TransactionId, Address) {
        (self.transaction_id, self.user)
    }
}

/// The per-side mutable portion of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantData {
    #[serde(with = "u256_decimal")]
    pub amount: U256,
    /// Absolute expiry, unix seconds.
    pub expiry: u64,
    pub prepared_block_number: u64,
}

/// Status of one side's on-chain record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Prepared,
    Fulfilled,
    Cancelled,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Fulfilled | TransactionStatus::Cancelled)
    }
}

/// One side's view of a transfer as reported by that chain's indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub invariant: InvariantData,
    pub variant: VariantData,
    pub status: TransactionStatus,
    pub chain_id: ChainId,
    /// Relayed fulfill signature; present only on Fulfilled records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Unencrypted call data revealed at fulfill time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_data: Option<String>,
    /// Encrypted call data the user attached at prepare time; carried on
    /// sender-side records so the receiver prepare can forward it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_call_data: Option<String>,
}

impl TransactionRecord {
    /// Which role this record plays within its own transfer.
    pub fn side(&self) -> TransferSide {
        if self.chain_id == self.invariant.sending_chain_id {
            TransferSide::Sending
        } else {
            TransferSide::Receiving
        }
    }
}

/// Sender or receiver side of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSide {
    Sending,
    Receiving,
}

impl fmt::Display for TransferSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferSide::Sending => write!(f, "sending"),
            TransferSide::Receiving => write!(f, "receiving"),
        }
    }
}

/// User-supplied auction request, as it arrives on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionPayload {
    pub user: Address,
    pub initiator: Address,
    pub sending_chain_id: ChainId,
    pub sending_asset_id: Address,
    pub receiving_chain_id: ChainId,
    pub receiving_asset_id: Address,
    pub receiving_address: Address,
    /// Decimal string, sending-asset units.
    pub amount: String,
    /// Absolute expiry, unix seconds.
    pub expiry: u64,
    pub transaction_id: TransactionId,
    pub call_to: Address,
    pub call_data_hash: H256,
    pub encrypted_call_data: String,
    #[serde(default)]
    pub dry_run: bool,
}

/// The router's signed offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bid {
    pub user: Address,
    pub router: Address,
    pub initiator: Address,
    pub sending_chain_id: ChainId,
    pub sending_asset_id: Address,
    pub receiving_chain_id: ChainId,
    pub receiving_asset_id: Address,
    pub receiving_address: Address,
    #[serde(with = "u256_decimal")]
    pub amount: U256,
    pub transaction_id: TransactionId,
    pub expiry: u64,
    pub call_data_hash: H256,
    pub call_to: Address,
    pub encrypted_call_data: String,
    pub sending_chain_tx_manager_address: Address,
    pub receiving_chain_tx_manager_address: Address,
    /// What the router will deliver on the receiving chain, in
    /// receiving-asset units.
    #[serde(with = "u256_decimal")]
    pub amount_received: U256,
    pub bid_expiry: u64,
}

impl Bid {
    /// ABI encoding of the bid tuple; the keccak digest of this is what the
    /// router signs (EIP-191) and what takers verify.
    pub fn encode(&self) -> Vec<u8> {
        use ethers::abi::Token;
        ethers::abi::encode(&[
            Token::FixedBytes(self.transaction_id.as_bytes().to_vec()),
            Token::Address(self.user),
            Token::Address(self.router),
            Token::Uint(U256::from(self.sending_chain_id.0)),
            Token::Address(self.sending_asset_id),
            Token::Uint(U256::from(self.receiving_chain_id.0)),
            Token::Address(self.receiving_asset_id),
            Token::Uint(self.amount_received),
            Token::Uint(U256::from(self.bid_expiry)),
        ])
    }

    /// Digest the bid signature commits to.
    pub fn digest(&self) -> H256 {
        H256::from(ethers::utils::keccak256(self.encode()))
    }
}

/// Serde helpers for U256 as decimal strings on the wire.
pub mod u256_decimal {
    use ethers::types::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<U256, D::Error> {
        let s = String::deserialize(de)?;
        U256::from_dec_str(&s).map_err(de::Error::custom)
    }
}

/// Wall-clock time helpers. The daemon relies on NTP-disciplined host time;
/// policy code takes `now` as an argument so it stays testable.
pub mod time {
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn now_seconds() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invariant(sending: u64, receiving: u64) -> InvariantData {
        InvariantData {
            transaction_id: H256::from_low_u64_be(7),
            user: Address::from_low_u64_be(1),
            router: Address::from_low_u64_be(2),
            initiator: Address::from_low_u64_be(1),
            sending_chain_id: ChainId(sending),
            sending_asset_id: Address::zero(),
            receiving_chain_id: ChainId(receiving),
            receiving_asset_id: Address::zero(),
            sending_chain_tx_manager_address: Address::from_low_u64_be(10),
            receiving_chain_tx_manager_address: Address::from_low_u64_be(11),
            call_to: Address::zero(),
            call_data_hash: H256::zero(),
            receiving_address: Address::from_low_u64_be(1),
        }
    }

    #[test]
    fn record_side_classification() {
        let inv = invariant(1337, 1338);
        let record = TransactionRecord {
            invariant: inv.clone(),
            variant: VariantData {
                amount: U256::from(1000u64),
                expiry: 0,
                prepared_block_number: 1,
            },
            status: TransactionStatus::Prepared,
            chain_id: ChainId(1337),
            signature: None,
            call_data: None,
            encrypted_call_data: None,
        };
        assert_eq!(record.side(), TransferSide::Sending);

        let receiver = TransactionRecord {
            chain_id: ChainId(1338),
            ..record
        };
        assert_eq!(receiver.side(), TransferSide::Receiving);
    }

    #[test]
    fn auction_payload_wire_format_is_camel_case() {
        let json = r#"{
            "user": "0x0000000000000000000000000000000000000001",
            "initiator": "0x0000000000000000000000000000000000000001",
            "sendingChainId": 1337,
            "sendingAssetId": "0x0000000000000000000000000000000000000002",
            "receivingChainId": 1338,
            "receivingAssetId": "0x0000000000000000000000000000000000000003",
            "receivingAddress": "0x0000000000000000000000000000000000000001",
            "amount": "1000000",
            "expiry": 1700000000,
            "transactionId": "0x0707070707070707070707070707070707070707070707070707070707070707",
            "callTo": "0x0000000000000000000000000000000000000000",
            "callDataHash": "0x0000000000000000000000000000000000000000000000000000000000000000",
            "encryptedCallData": "0x"
        }"#;
        let payload: AuctionPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.sending_chain_id, ChainId(1337));
        assert_eq!(payload.amount, "1000000");
        assert!(!payload.dry_run);
    }

    #[test]
    fn bid_digest_is_stable() {
        let inv = invariant(1, 2);
        let bid = Bid {
            user: inv.user,
            router: inv.router,
            initiator: inv.initiator,
            sending_chain_id: inv.sending_chain_id,
            sending_asset_id: inv.sending_asset_id,
            receiving_chain_id: inv.receiving_chain_id,
            receiving_asset_id: inv.receiving_asset_id,
            receiving_address: inv.receiving_address,
            amount: U256::from(1_000_000u64),
            transaction_id: inv.transaction_id,
            expiry: 1_700_000_000,
            call_data_hash: inv.call_data_hash,
            call_to: inv.call_to,
            encrypted_call_data: "0x".into(),
            sending_chain_tx_manager_address: inv.sending_chain_tx_manager_address,
            receiving_chain_tx_manager_address: inv.receiving_chain_tx_manager_address,
            amount_received: U256::from(999_000u64),
            bid_expiry: 1_700_000_300,
        };
        assert_eq!(bid.digest(), bid.digest());
        let mut other = bid.clone();
        other.amount_received = U256::from(999_001u64);
        assert_ne!(bid.digest(), other.digest());
    }
}
