//! Calldata encoding for transaction-manager calls.
//!
//! Selectors are derived from the signature strings at first use, so the
//! encodings can never drift from the declared signatures.

use ethers::abi::Token;
use ethers::types::{Address, Bytes, H256, U256};

use crate::types::InvariantData;

const PREPARE_SIG: &str =
    "prepare(bytes32,address,address,address,address,uint256,uint256,bytes32,bytes)";
const FULFILL_SIG: &str = "fulfill(bytes32,uint256,bytes,bytes)";
const CANCEL_SIG: &str = "cancel(bytes32,bytes)";
const REMOVE_LIQUIDITY_SIG: &str = "removeLiquidity(uint256,address,address)";
const ADD_LIQUIDITY_FOR_SIG: &str = "addLiquidityFor(uint256,address,address)";

fn call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = ethers::utils::id(signature).to_vec();
    data.extend_from_slice(&ethers::abi::encode(args));
    Bytes::from(data)
}

/// Receiver-side prepare: lock `amount` for the user until `expiry`.
pub fn prepare(
    invariant: &InvariantData,
    amount: U256,
    expiry: u64,
    encrypted_call_data: &str,
) -> Bytes {
    let encrypted = hex_blob(encrypted_call_data);
    call(
        PREPARE_SIG,
        &[
            Token::FixedBytes(invariant.transaction_id.as_bytes().to_vec()),
            Token::Address(invariant.user),
            Token::Address(invariant.router),
            Token::Address(invariant.receiving_asset_id),
            Token::Address(invariant.receiving_address),
            Token::Uint(amount),
            Token::Uint(U256::from(expiry)),
            Token::FixedBytes(invariant.call_data_hash.as_bytes().to_vec()),
            Token::Bytes(encrypted),
        ],
    )
}

/// Fulfill with the user's relayed signature; `relayer_fee` compensates the
/// meta-tx relayer when the router operates through one.
pub fn fulfill(
    transaction_id: H256,
    relayer_fee: U256,
    signature: &str,
    call_data: &str,
) -> Bytes {
    call(
        FULFILL_SIG,
        &[
            Token::FixedBytes(transaction_id.as_bytes().to_vec()),
            Token::Uint(relayer_fee),
            Token::Bytes(hex_blob(signature)),
            Token::Bytes(hex_blob(call_data)),
        ],
    )
}

pub fn cancel(transaction_id: H256, signature: &str) -> Bytes {
    call(
        CANCEL_SIG,
        &[
            Token::FixedBytes(transaction_id.as_bytes().to_vec()),
            Token::Bytes(hex_blob(signature)),
        ],
    )
}

pub fn remove_liquidity(amount: U256, asset: Address, recipient: Address) -> Bytes {
    call(
        REMOVE_LIQUIDITY_SIG,
        &[
            Token::Uint(amount),
            Token::Address(asset),
            Token::Address(recipient),
        ],
    )
}

pub fn add_liquidity_for(amount: U256, asset: Address, router: Address) -> Bytes {
    call(
        ADD_LIQUIDITY_FOR_SIG,
        &[
            Token::Uint(amount),
            Token::Address(asset),
            Token::Address(router),
        ],
    )
}

/// Decode a 0x-prefixed hex blob, tolerating empty and unprefixed input.
fn hex_blob(value: &str) -> Vec<u8> {
    let stripped = value.trim_start_matches("0x");
    hex::decode(stripped).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChainId;

    fn invariant() -> InvariantData {
        InvariantData {
            transaction_id: H256::from_low_u64_be(7),
            user: Address::from_low_u64_be(1),
            router: Address::from_low_u64_be(2),
            initiator: Address::from_low_u64_be(1),
            sending_chain_id: ChainId(1337),
            sending_asset_id: Address::zero(),
            receiving_chain_id: ChainId(1338),
            receiving_asset_id: Address::from_low_u64_be(4),
            sending_chain_tx_manager_address: Address::from_low_u64_be(10),
            receiving_chain_tx_manager_address: Address::from_low_u64_be(11),
            call_to: Address::zero(),
            call_data_hash: H256::zero(),
            receiving_address: Address::from_low_u64_be(1),
        }
    }

    #[test]
    fn selectors_differ_per_action() {
        let inv = invariant();
        let prepare = prepare(&inv, U256::from(1u64), 100, "0x");
        let fulfill = fulfill(inv.transaction_id, U256::zero(), "0xab", "0x");
        let cancel = cancel(inv.transaction_id, "0xab");
        assert_ne!(&prepare[..4], &fulfill[..4]);
        assert_ne!(&fulfill[..4], &cancel[..4]);
        // Selector + at least one encoded word.
        assert!(prepare.len() > 36);
    }

    #[test]
    fn hex_blob_tolerates_prefixes() {
        assert_eq!(hex_blob("0xff"), vec![0xff]);
        assert_eq!(hex_blob("ff"), vec![0xff]);
        assert!(hex_blob("").is_empty());
    }
}
