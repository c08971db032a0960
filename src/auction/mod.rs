//! Auction evaluation - admission control and quote pricing.
//!
//! `evaluate` runs the full check ladder over an inbound auction payload and
//! either returns a (signed) bid or the first failure, each failure a
//! distinct error kind. Independent external reads run concurrently; the
//! checks themselves apply in their documented order so error precedence is
//! deterministic.

pub mod pricing;
pub mod rate_limit;

pub use pricing::{RouteLeg, RouteQuote, TransferPricer};
pub use rate_limit::{RateLimiter, RateLimiterKey};

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::ChainManager;
use crate::config::Settings;
use crate::error::{RequestContext, RouterError, RouterResult};
use crate::subgraph::EventTracker;
use crate::types::{time, u256_decimal, AuctionPayload, Bid, ChainId};
use crate::wallet::RouterSigner;

/// Minimum padding between now and the auction's expiry.
pub const AUCTION_EXPIRY_BUFFER: u64 = 300;

/// How long a produced bid stays valid.
pub const BID_EXPIRY: u64 = 300;

/// Native balance below which a warning is logged (0.1 units, 18 decimals).
fn low_gas_warning_threshold() -> U256 {
    U256::exp10(17)
}

/// Successful auction reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidReply {
    pub bid: Bid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_signature: Option<String>,
    #[serde(with = "u256_decimal")]
    pub gas_fee_in_receiving_token: U256,
}

pub struct AuctionEvaluator {
    settings: Arc<Settings>,
    chains: Arc<ChainManager>,
    tracker: Arc<EventTracker>,
    pricer: Arc<TransferPricer>,
    signer: Arc<dyn RouterSigner>,
    rate_limiter: RateLimiter,
}

impl AuctionEvaluator {
    pub fn new(
        settings: Arc<Settings>,
        chains: Arc<ChainManager>,
        tracker: Arc<EventTracker>,
        pricer: Arc<TransferPricer>,
        signer: Arc<dyn RouterSigner>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(settings.request_limit);
        Self {
            settings,
            chains,
            tracker,
            pricer,
            signer,
            rate_limiter,
        }
    }

    /// Run the full admission ladder and produce a bid.
    ///
    /// In diagnostic mode every decision is logged at info level, so the
    /// trail shows up without loosening the global log filter.
    pub async fn evaluate(
        &self,
        payload: AuctionPayload,
        ctx: &RequestContext,
    ) -> RouterResult<BidReply> {
        let transaction_id = payload.transaction_id;
        let sending = payload.sending_chain_id;
        let receiving = payload.receiving_chain_id;

        let result = self.evaluate_inner(payload, ctx).await;

        let outcome = match &result {
            Ok(reply) => format!("bid amountReceived={}", reply.bid.amount_received),
            Err(e) => format!("rejected kind={}", e.kind()),
        };
        if self.settings.diagnostic_mode {
            info!(
                request = %ctx.id,
                ?transaction_id,
                sending = %sending,
                receiving = %receiving,
                %outcome,
                "auction decision"
            );
        } else {
            debug!(
                request = %ctx.id,
                ?transaction_id,
                sending = %sending,
                receiving = %receiving,
                %outcome,
                "auction decision"
            );
        }
        result
    }

    async fn evaluate_inner(
        &self,
        payload: AuctionPayload,
        ctx: &RequestContext,
    ) -> RouterResult<BidReply> {
        crate::metrics::record_auction_received(payload.sending_chain_id);
        debug!(
            request = %ctx.id,
            transaction_id = ?payload.transaction_id,
            sending = %payload.sending_chain_id,
            receiving = %payload.receiving_chain_id,
            "evaluating auction"
        );

        // 1. Structural validation beyond what deserialization enforces.
        self.validate(&payload)?;

        // 2. Amount must parse and be non-zero.
        let amount = U256::from_dec_str(&payload.amount).map_err(|_| RouterError::ZeroValueBid)?;
        if amount.is_zero() {
            return Err(RouterError::ZeroValueBid);
        }

        // 3. Rate limit per route pair.
        let key = RateLimiterKey {
            user: payload.user,
            sending_asset_id: payload.sending_asset_id,
            sending_chain_id: payload.sending_chain_id,
            receiving_asset_id: payload.receiving_asset_id,
            receiving_chain_id: payload.receiving_chain_id,
        };
        let now_ms = time::now_millis();
        self.rate_limiter.check(&key, now_ms)?;

        // 4. The auction must leave room to execute.
        let now = time::now_seconds();
        if payload.expiry <= now + AUCTION_EXPIRY_BUFFER {
            return Err(RouterError::AuctionExpired {
                expiry: payload.expiry,
                now,
            });
        }

        // 5. Both chains need providers.
        for chain_id in [payload.sending_chain_id, payload.receiving_chain_id] {
            if !self.chains.has(chain_id) {
                return Err(RouterError::ProvidersNotAvailable { chain_id });
            }
        }

        // 6. Both chains need a synced indexer.
        for chain_id in [payload.sending_chain_id, payload.receiving_chain_id] {
            if !self.tracker.is_synced(chain_id) {
                let records = self.tracker.sync_records(chain_id);
                return Err(RouterError::SubgraphNotSynced {
                    chain_id,
                    records: serde_json::to_string(&records).unwrap_or_default(),
                });
            }
        }

        let sending_settings = self
            .settings
            .chain(payload.sending_chain_id)
            .ok_or(RouterError::ProvidersNotAvailable {
                chain_id: payload.sending_chain_id,
            })?;
        let receiving_settings = self
            .settings
            .chain(payload.receiving_chain_id)
            .ok_or(RouterError::ProvidersNotAvailable {
                chain_id: payload.receiving_chain_id,
            })?;

        // 7-12: price the route; 13 inputs fetched concurrently alongside.
        let router = self.signer.address();
        let (quote, sending_native, receiving_native) = tokio::join!(
            self.pricer.quote_route(
                RouteLeg {
                    chain_id: payload.sending_chain_id,
                    asset_id: payload.sending_asset_id,
                },
                RouteLeg {
                    chain_id: payload.receiving_chain_id,
                    asset_id: payload.receiving_asset_id,
                },
                amount,
            ),
            self.native_balance(payload.sending_chain_id, router),
            self.native_balance(payload.receiving_chain_id, router),
        );
        let quote = quote?;

        // 13. Router must be able to pay for gas on both chains.
        for (chain_id, balance, chain_settings) in [
            (payload.sending_chain_id, sending_native?, sending_settings),
            (
                payload.receiving_chain_id,
                receiving_native?,
                receiving_settings,
            ),
        ] {
            let min_gas = chain_settings.min_gas_wei()?;
            if balance < min_gas {
                return Err(RouterError::NotEnoughGas {
                    chain_id,
                    balance: balance.to_string(),
                    min_gas: min_gas.to_string(),
                });
            }
            if balance < low_gas_warning_threshold() {
                warn!(chain = %chain_id, %balance, "router native balance is low");
            }
        }

        // 14. Build, sign, admit.
        let bid = Bid {
            user: payload.user,
            router,
            initiator: payload.initiator,
            sending_chain_id: payload.sending_chain_id,
            sending_asset_id: payload.sending_asset_id,
            receiving_chain_id: payload.receiving_chain_id,
            receiving_asset_id: payload.receiving_asset_id,
            receiving_address: payload.receiving_address,
            amount,
            transaction_id: payload.transaction_id,
            expiry: payload.expiry,
            call_data_hash: payload.call_data_hash,
            call_to: payload.call_to,
            encrypted_call_data: payload.encrypted_call_data.clone(),
            sending_chain_tx_manager_address: sending_settings.transaction_manager_address,
            receiving_chain_tx_manager_address: receiving_settings.transaction_manager_address,
            amount_received: quote.amount_received,
            bid_expiry: now + BID_EXPIRY,
        };

        let bid_signature = if payload.dry_run {
            None
        } else {
            let signature = self.signer.sign_message(bid.digest().as_bytes()).await?;
            Some(format!("0x{}", hex::encode(signature.to_vec())))
        };

        self.rate_limiter.record(key, now_ms);
        crate::metrics::record_bid_produced(payload.sending_chain_id, bid_signature.is_some());
        info!(
            request = %ctx.id,
            transaction_id = ?bid.transaction_id,
            amount_received = %bid.amount_received,
            dry_run = payload.dry_run,
            "bid produced"
        );

        Ok(BidReply {
            bid,
            bid_signature,
            gas_fee_in_receiving_token: quote.gas_fee,
        })
    }

    fn validate(&self, payload: &AuctionPayload) -> RouterResult<()> {
        if self.settings.clean_up_mode {
            return Err(RouterError::ParamsInvalid {
                message: "router is in clean-up mode and not accepting new transfers".into(),
            });
        }
        if payload.sending_chain_id == payload.receiving_chain_id {
            return Err(RouterError::ParamsInvalid {
                message: "sending and receiving chain must differ".into(),
            });
        }
        if payload.receiving_address == Address::zero() {
            return Err(RouterError::ParamsInvalid {
                message: "receiving address must be set".into(),
            });
        }
        Ok(())
    }

    async fn native_balance(&self, chain_id: ChainId, router: Address) -> RouterResult<U256> {
        self.chains.get(chain_id)?.get_balance(router).await
    }
}
