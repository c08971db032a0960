//! Route pricing shared by the auction evaluator and the lifecycle engine.
//!
//! A quote resolves the swap pool covering the route, loads live balances
//! and decimals for every pool asset, prices the transfer through the
//! liquidity curve, and nets out the gas fee - the same ladder whether it
//! serves a bid or a receiver-side prepare.

use ethers::types::{Address, U256};
use std::sync::Arc;

use crate::amm;
use crate::chain::ChainManager;
use crate::config::{PoolAssetSettings, Settings};
use crate::error::{RouterError, RouterResult};
use crate::oracle::PriceOracle;
use crate::subgraph::EventTracker;
use crate::types::ChainId;

/// One leg of a route: chain + asset.
#[derive(Debug, Clone, Copy)]
pub struct RouteLeg {
    pub chain_id: ChainId,
    pub asset_id: Address,
}

/// A priced route.
#[derive(Debug, Clone)]
pub struct RouteQuote {
    /// Delivery amount net of the gas fee, receiving-asset units.
    pub amount_received: U256,
    /// Total fee in receiving-asset units.
    pub gas_fee: U256,
    /// Router's current receiving-side liquidity, raw units.
    pub receiver_liquidity: U256,
    pub receiving_decimals: u8,
}

pub struct TransferPricer {
    settings: Arc<Settings>,
    chains: Arc<ChainManager>,
    tracker: Arc<EventTracker>,
    oracle: Arc<PriceOracle>,
}

impl TransferPricer {
    pub fn new(
        settings: Arc<Settings>,
        chains: Arc<ChainManager>,
        tracker: Arc<EventTracker>,
        oracle: Arc<PriceOracle>,
    ) -> Self {
        Self {
            settings,
            chains,
            tracker,
            oracle,
        }
    }

    /// Price `amount` across the route. Fails with the evaluator's error
    /// kinds: `ParamsInvalid` (no pool), `PriceImpactTooHigh`,
    /// `NotEnoughAmount`, `NotEnoughLiquidity`.
    pub async fn quote_route(
        &self,
        sending: RouteLeg,
        receiving: RouteLeg,
        amount: U256,
    ) -> RouterResult<RouteQuote> {
        let (pool_assets, sending_index, receiving_index) = self.resolve_pool(sending, receiving)?;

        let state = self.load_pool_state(&pool_assets).await?;
        let receiving_decimals = state.decimals[receiving_index];

        let gas_fee = self
            .oracle
            .gas_fee_in_receiving(
                sending.chain_id,
                receiving.chain_id,
                receiving.asset_id,
                receiving_decimals,
            )
            .await?;

        let quote = amm::SwapQuote {
            amount_in: amount,
            input_decimals: state.decimals[sending_index],
            output_decimals: receiving_decimals,
            balances: &state.normalized,
            sending_index,
            receiving_index,
            input_weight: state.weights[sending_index],
            output_weight: state.weights[receiving_index],
            max_price_impact_e18: self.settings.max_price_impact_e18(),
            amplification: self.settings.amplification,
            allowed_vamm: self.settings.allowed_vamm,
        };
        let quoted = amm::amount_received(&quote)?;

        if quoted < gas_fee {
            return Err(RouterError::NotEnoughAmount {
                amount_received: quoted.to_string(),
                gas_fee: gas_fee.to_string(),
            });
        }
        let amount_received = quoted - gas_fee;

        let receiver_liquidity = state.raw[receiving_index];
        if receiver_liquidity < amount_received {
            return Err(RouterError::NotEnoughLiquidity {
                balance: receiver_liquidity.to_string(),
                amount_received: amount_received.to_string(),
            });
        }

        Ok(RouteQuote {
            amount_received,
            gas_fee,
            receiver_liquidity,
            receiving_decimals,
        })
    }

    /// Locate the pool holding both legs and the legs' indices within it.
    fn resolve_pool(
        &self,
        sending: RouteLeg,
        receiving: RouteLeg,
    ) -> RouterResult<(Vec<PoolAssetSettings>, usize, usize)> {
        for pool in &self.settings.swap_pools {
            let position = |leg: RouteLeg| {
                pool.assets
                    .iter()
                    .position(|a| ChainId(a.chain_id) == leg.chain_id && a.asset_id == leg.asset_id)
            };
            if let (Some(sending_index), Some(receiving_index)) =
                (position(sending), position(receiving))
            {
                return Ok((pool.assets.clone(), sending_index, receiving_index));
            }
        }
        Err(RouterError::ParamsInvalid {
            message: "no swap pool covers the requested route".into(),
        })
    }

    /// Fetch balances + decimals for every pool asset concurrently.
    async fn load_pool_state(&self, assets: &[PoolAssetSettings]) -> RouterResult<PoolState> {
        let reads = assets.iter().map(|asset| self.load_asset(asset));
        let loaded = futures::future::try_join_all(reads).await?;

        let mut state = PoolState::default();
        for (raw, decimals, weight) in loaded {
            state.normalized.push(amm::normalize(raw, decimals, weight));
            state.raw.push(raw);
            state.decimals.push(decimals);
            state.weights.push(weight);
        }
        Ok(state)
    }

    async fn load_asset(&self, asset: &PoolAssetSettings) -> RouterResult<(U256, u8, u32)> {
        let chain_id = ChainId(asset.chain_id);
        let weight = self
            .settings
            .chain(chain_id)
            .map(|c| c.weight)
            .unwrap_or(1);
        let rpc = self.chains.get(chain_id)?;
        let (balance, decimals) = tokio::join!(
            self.tracker.get_asset_balance(asset.asset_id, chain_id),
            rpc.get_decimals_for_asset(asset.asset_id),
        );
        Ok((balance?, decimals?, weight))
    }
}

#[derive(Default)]
struct PoolState {
    normalized: Vec<U256>,
    raw: Vec<U256>,
    decimals: Vec<u8>,
    weights: Vec<u32>,
}
