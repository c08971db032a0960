//! Token prices, gas prices, and per-action fee estimation.
//!
//! Token prices come from an on-chain oracle contract (view call, 1e18
//! scale). Gas prices prefer the configured gas stations and fall back to
//! the RPC default. Chains without a price oracle quote gas for free.

use dashmap::DashMap;
use ethers::abi::Token;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::chain::ChainManager;
use crate::config::Settings;
use crate::error::{RouterError, RouterResult};
use crate::types::{time, ChainId, TransferSide};

/// Deadline for gas-station HTTP requests.
const GAS_STATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Seconds a cached token price stays fresh.
const PRICE_CACHE_TTL: u64 = 60;

/// On-chain actions the router pays gas for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Prepare,
    Fulfill,
    Cancel,
    RemoveLiquidity,
    AddLiquidityFor,
}

impl ActionKind {
    /// Static gas-limit table; estimates are deliberately conservative.
    pub fn gas_estimate(&self) -> U256 {
        match self {
            ActionKind::Prepare => U256::from(190_000u64),
            ActionKind::Fulfill => U256::from(200_000u64),
            ActionKind::Cancel => U256::from(170_000u64),
            ActionKind::RemoveLiquidity => U256::from(120_000u64),
            ActionKind::AddLiquidityFor => U256::from(150_000u64),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Prepare => "prepare",
            ActionKind::Fulfill => "fulfill",
            ActionKind::Cancel => "cancel",
            ActionKind::RemoveLiquidity => "remove_liquidity",
            ActionKind::AddLiquidityFor => "add_liquidity_for",
        }
    }
}

/// Price and gas oracle over the configured chains.
pub struct PriceOracle {
    settings: Arc<Settings>,
    chains: Arc<ChainManager>,
    http: reqwest::Client,
    price_cache: DashMap<(ChainId, Address), (U256, u64)>,
}

impl PriceOracle {
    pub fn new(settings: Arc<Settings>, chains: Arc<ChainManager>) -> Self {
        Self {
            settings,
            chains,
            http: reqwest::Client::builder()
                .timeout(GAS_STATION_TIMEOUT)
                .build()
                .unwrap_or_default(),
            price_cache: DashMap::new(),
        }
    }

    fn oracle_address(&self, chain_id: ChainId) -> Option<Address> {
        self.settings
            .chain(chain_id)
            .and_then(|c| c.price_oracle_address)
    }

    /// Price of `asset` in the oracle's 1e18 reference units.
    /// `Address::zero()` queries the chain's native asset.
    pub async fn token_price(&self, chain_id: ChainId, asset: Address) -> RouterResult<U256> {
        let oracle = self
            .oracle_address(chain_id)
            .ok_or_else(|| RouterError::ChainNotSupported {
                chain_id,
                operation: "token_price".into(),
            })?;

        if self.settings.price_cache_mode {
            if let Some(entry) = self.price_cache.get(&(chain_id, asset)) {
                let (price, fetched_at) = *entry;
                if time::now_seconds().saturating_sub(fetched_at) < PRICE_CACHE_TTL {
                    return Ok(price);
                }
            }
        }

        let selector = ethers::utils::id("getTokenPrice(address)");
        let mut data = selector.to_vec();
        data.extend_from_slice(&ethers::abi::encode(&[Token::Address(asset)]));

        let mut tx = TypedTransaction::default();
        tx.set_to(oracle);
        tx.set_data(Bytes::from(data));

        let rpc = self.chains.get(chain_id)?;
        let raw = rpc.read_transaction(&tx).await?;
        if raw.len() < 32 {
            return Err(RouterError::RpcError {
                chain_id,
                message: format!("malformed oracle response for {:?}", asset),
            });
        }
        let price = U256::from_big_endian(&raw[..32]);

        if self.settings.price_cache_mode {
            self.price_cache
                .insert((chain_id, asset), (price, time::now_seconds()));
        }
        Ok(price)
    }

    /// Current gas price in wei. Tries each configured gas station, then the
    /// RPC default.
    pub async fn gas_price(&self, chain_id: ChainId) -> RouterResult<U256> {
        let stations = self
            .settings
            .chain(chain_id)
            .map(|c| c.gas_stations.clone())
            .unwrap_or_default();

        for station in &stations {
            match self.fetch_gas_station(station).await {
                Ok(price) => {
                    debug!(chain = %chain_id, station, %price, "gas price from station");
                    return Ok(price);
                }
                Err(e) => {
                    warn!(chain = %chain_id, station, error = %e, "gas station failed");
                }
            }
        }

        let rpc = self.chains.get(chain_id)?;
        rpc.get_gas_price().await
    }

    async fn fetch_gas_station(&self, url: &str) -> RouterResult<U256> {
        let body: serde_json::Value = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| RouterError::RpcError {
                chain_id: ChainId(0),
                message: format!("gas station {}: {}", url, e),
            })?
            .json()
            .await
            .map_err(|e| RouterError::RpcError {
                chain_id: ChainId(0),
                message: format!("gas station {}: {}", url, e),
            })?;

        let gwei = body
            .get("fast")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| RouterError::RpcError {
                chain_id: ChainId(0),
                message: format!("gas station {} returned no 'fast' field", url),
            })?;

        Ok(U256::from((gwei * 1e9) as u128))
    }

    /// Fee for `action` denominated in `asset` on `chain_id`, scaled to
    /// `decimals`. Zero when the chain carries no price oracle.
    pub async fn gas_fee_in_token(
        &self,
        chain_id: ChainId,
        asset: Address,
        decimals: u8,
        action: ActionKind,
        side: TransferSide,
    ) -> RouterResult<U256> {
        self.cross_chain_fee(chain_id, action, side, chain_id, asset, decimals)
            .await
    }

    /// Total auction fee expressed in the receiving token: the sender-side
    /// fulfill the router will pay plus the receiver-side prepare.
    pub async fn gas_fee_in_receiving(
        &self,
        sending_chain: ChainId,
        receiving_chain: ChainId,
        receiving_asset: Address,
        receiving_decimals: u8,
    ) -> RouterResult<U256> {
        let (sender_leg, receiver_leg) = tokio::join!(
            self.cross_chain_fee(
                sending_chain,
                ActionKind::Fulfill,
                TransferSide::Sending,
                receiving_chain,
                receiving_asset,
                receiving_decimals,
            ),
            self.cross_chain_fee(
                receiving_chain,
                ActionKind::Prepare,
                TransferSide::Receiving,
                receiving_chain,
                receiving_asset,
                receiving_decimals,
            ),
        );
        Ok(sender_leg? + receiver_leg?)
    }

    /// Gas burned on `gas_chain`, priced into `token` (whose oracle lives on
    /// `token_chain`). Either chain lacking an oracle makes the leg free.
    async fn cross_chain_fee(
        &self,
        gas_chain: ChainId,
        action: ActionKind,
        side: TransferSide,
        token_chain: ChainId,
        token: Address,
        decimals: u8,
    ) -> RouterResult<U256> {
        if self.oracle_address(gas_chain).is_none() || self.oracle_address(token_chain).is_none() {
            return Ok(U256::zero());
        }

        let (gas_price, native_price, token_price) = tokio::join!(
            self.gas_price(gas_chain),
            self.token_price(gas_chain, Address::zero()),
            self.token_price(token_chain, token),
        );
        let (gas_price, native_price, token_price) = (gas_price?, native_price?, token_price?);

        let fee = fee_in_token(
            gas_price,
            action.gas_estimate(),
            native_price,
            token_price,
            decimals,
        );
        debug!(
            chain = %gas_chain,
            action = action.name(),
            %side,
            %fee,
            "computed gas fee"
        );
        Ok(fee)
    }
}

/// `gas_price · gas_limit · native_price / token_price`, scaled from wei
/// (18 decimals) to `decimals`. Floor division throughout.
pub fn fee_in_token(
    gas_price: U256,
    gas_limit: U256,
    native_price: U256,
    token_price: U256,
    decimals: u8,
) -> U256 {
    if token_price.is_zero() {
        return U256::zero();
    }
    let fee_wei = gas_price * gas_limit;
    let fee_token_18 = fee_wei * native_price / token_price;
    if decimals <= 18 {
        fee_token_18 / U256::exp10((18 - decimals) as usize)
    } else {
        fee_token_18 * U256::exp10((decimals - 18) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_scales_to_token_decimals() {
        // 100 gwei, 200k gas => 0.02 native. Native at 2000, token at 1:
        // fee = 40 tokens; in 6 decimals that is 40_000_000.
        let fee = fee_in_token(
            U256::from(100_000_000_000u64),
            U256::from(200_000u64),
            U256::from(2_000u64) * U256::exp10(18),
            U256::exp10(18),
            6,
        );
        assert_eq!(fee, U256::from(40_000_000u64));
    }

    #[test]
    fn fee_with_zero_token_price_is_zero() {
        let fee = fee_in_token(
            U256::from(1u64),
            U256::from(1u64),
            U256::exp10(18),
            U256::zero(),
            18,
        );
        assert_eq!(fee, U256::zero());
    }

    #[test]
    fn gas_estimates_cover_every_action() {
        for action in [
            ActionKind::Prepare,
            ActionKind::Fulfill,
            ActionKind::Cancel,
            ActionKind::RemoveLiquidity,
            ActionKind::AddLiquidityFor,
        ] {
            assert!(action.gas_estimate() > U256::zero());
        }
    }
}
