//! Router key management.
//!
//! Two signer backends: a local wallet derived from the configured mnemonic,
//! or a remote web3 signer spoken to over JSON-RPC. Both sit behind
//! [`RouterSigner`] so the evaluator and dispatcher never know which one is
//! in use.

use async_trait::async_trait;
use ethers::signers::{coins_bip39::English, LocalWallet, MnemonicBuilder, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Signature};
use thiserror::Error;
use tracing::info;

use crate::config::Settings;
use crate::error::{RouterError, RouterResult};

/// Startup failures get their own type so `main` can map them onto the
/// documented exit codes (1 = config, 2 = signer unreachable).
#[derive(Error, Debug)]
pub enum WalletInitError {
    #[error("wallet configuration error: {0}")]
    Config(String),
    #[error("remote signer unreachable: {0}")]
    SignerUnreachable(String),
}

/// Signing capability used for bids and outbound transactions.
#[async_trait]
pub trait RouterSigner: Send + Sync {
    fn address(&self) -> Address;

    /// EIP-191 personal-message signature.
    async fn sign_message(&self, message: &[u8]) -> RouterResult<Signature>;

    /// Fully signed raw transaction, ready to broadcast.
    async fn sign_transaction(&self, tx: &TypedTransaction) -> RouterResult<Bytes>;
}

/// Build the configured signer, probing remote backends.
pub async fn init(settings: &Settings) -> Result<std::sync::Arc<dyn RouterSigner>, WalletInitError> {
    if let Some(mnemonic) = &settings.mnemonic {
        let signer = LocalSigner::from_mnemonic(mnemonic)?;
        info!(address = ?signer.address(), "local wallet initialized");
        return Ok(std::sync::Arc::new(signer));
    }
    if let Some(url) = &settings.web3_signer_url {
        let signer = Web3Signer::connect(url).await?;
        info!(address = ?signer.address(), url, "remote signer initialized");
        return Ok(std::sync::Arc::new(signer));
    }
    Err(WalletInitError::Config(
        "no mnemonic or web3_signer_url configured".into(),
    ))
}

/// In-process wallet derived from a BIP-39 mnemonic.
pub struct LocalSigner {
    wallet: LocalWallet,
}

impl LocalSigner {
    pub fn from_mnemonic(mnemonic: &str) -> Result<Self, WalletInitError> {
        let wallet = MnemonicBuilder::<English>::default()
            .phrase(mnemonic)
            .build()
            .map_err(|e| WalletInitError::Config(format!("invalid mnemonic: {}", e)))?;
        Ok(Self { wallet })
    }

    pub fn from_wallet(wallet: LocalWallet) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl RouterSigner for LocalSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_message(&self, message: &[u8]) -> RouterResult<Signature> {
        self.wallet
            .sign_message(message)
            .await
            .map_err(|e| RouterError::ParamsInvalid {
                message: format!("signing failed: {}", e),
            })
    }

    async fn sign_transaction(&self, tx: &TypedTransaction) -> RouterResult<Bytes> {
        let signature =
            self.wallet
                .sign_transaction(tx)
                .await
                .map_err(|e| RouterError::ParamsInvalid {
                    message: format!("signing failed: {}", e),
                })?;
        Ok(tx.rlp_signed(&signature))
    }
}

/// Remote web3 signer over JSON-RPC.
pub struct Web3Signer {
    url: String,
    address: Address,
    http: reqwest::Client,
}

impl Web3Signer {
    /// Connect and verify the service answers; the first reported account
    /// is the router key.
    pub async fn connect(url: &str) -> Result<Self, WalletInitError> {
        let http = reqwest::Client::new();
        let accounts: Vec<Address> = Self::rpc(&http, url, "eth_accounts", serde_json::json!([]))
            .await
            .map_err(|e| WalletInitError::SignerUnreachable(e.to_string()))?;
        let address = accounts
            .first()
            .copied()
            .ok_or_else(|| WalletInitError::SignerUnreachable("signer reports no accounts".into()))?;
        Ok(Self {
            url: url.to_string(),
            address,
            http,
        })
    }

    async fn rpc<T: serde::de::DeserializeOwned>(
        http: &reqwest::Client,
        url: &str,
        method: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<T> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response: serde_json::Value = http.post(url).json(&body).send().await?.json().await?;
        if let Some(error) = response.get("error") {
            anyhow::bail!("signer error: {}", error);
        }
        let result = response
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("signer returned no result"))?;
        Ok(serde_json::from_value(result)?)
    }

    fn signer_error(&self, e: impl ToString) -> RouterError {
        RouterError::RpcError {
            chain_id: crate::types::ChainId(0),
            message: format!("web3 signer {}: {}", self.url, e.to_string()),
        }
    }
}

#[async_trait]
impl RouterSigner for Web3Signer {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_message(&self, message: &[u8]) -> RouterResult<Signature> {
        let hex_message = format!("0x{}", hex::encode(message));
        let raw: String = Self::rpc(
            &self.http,
            &self.url,
            "eth_sign",
            serde_json::json!([format!("{:?}", self.address), hex_message]),
        )
        .await
        .map_err(|e| self.signer_error(e))?;

        let bytes = hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| self.signer_error(format!("malformed signature: {}", e)))?;
        Signature::try_from(bytes.as_slice())
            .map_err(|e| self.signer_error(format!("malformed signature: {}", e)))
    }

    async fn sign_transaction(&self, tx: &TypedTransaction) -> RouterResult<Bytes> {
        let raw: String = Self::rpc(
            &self.http,
            &self.url,
            "eth_signTransaction",
            serde_json::json!([tx]),
        )
        .await
        .map_err(|e| self.signer_error(e))?;
        let bytes = hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| self.signer_error(format!("malformed raw transaction: {}", e)))?;
        Ok(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str =
        "test test test test test test test test test test test junk";

    #[tokio::test]
    async fn bid_signature_round_trips() {
        let signer = LocalSigner::from_mnemonic(TEST_MNEMONIC).unwrap();
        let digest = ethers::utils::keccak256(b"bid payload");
        let signature = signer.sign_message(&digest).await.unwrap();
        assert!(signature.verify(digest.as_ref(), signer.address()).is_ok());
    }

    #[test]
    fn rejects_bad_mnemonic() {
        assert!(LocalSigner::from_mnemonic("not a mnemonic").is_err());
    }
}
