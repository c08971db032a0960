//! Admin HTTP surface: health, redacted config, metrics exposition, and
//! liquidity management.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::Settings;
use crate::dispatch::{encode, Action, Dispatcher};
use crate::error::{RouterError, RouterResult};
use crate::lifecycle::LifecycleEngine;
use crate::oracle::ActionKind;
use crate::types::{time, ChainId};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub dispatcher: Arc<Dispatcher>,
    pub lifecycle: Arc<LifecycleEngine>,
    pub router_address: Address,
}

/// Run the admin HTTP server.
pub async fn run_server(state: AppState) -> RouterResult<()> {
    let addr = format!("{}:{}", state.settings.api.host, state.settings.api.port);

    let app = Router::new()
        .route("/ping", get(ping))
        .route("/config", get(get_config))
        .route("/metrics", get(get_metrics))
        .route("/status", get(get_status))
        .route("/remove-liquidity", post(remove_liquidity))
        .route("/add-liquidity-for", post(add_liquidity_for))
        .with_state(state);

    info!("admin API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RouterError::ConfigurationError(format!("api bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RouterError::ConfigurationError(format!("api server: {}", e)))?;
    Ok(())
}

async fn ping() -> &'static str {
    "pong"
}

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.settings.redacted())
}

async fn get_metrics() -> impl IntoResponse {
    crate::metrics::gather()
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        router_address: format!("{:?}", state.router_address),
        active_transfers: state.lifecycle.active_count(),
        clean_up_mode: state.settings.clean_up_mode,
    })
}

async fn remove_liquidity(
    State(state): State<AppState>,
    Json(request): Json<LiquidityRequest>,
) -> impl IntoResponse {
    let data = encode::remove_liquidity(
        match request.amount_parsed() {
            Ok(amount) => amount,
            Err(e) => return error_response(e),
        },
        request.asset_id,
        request.recipient.unwrap_or(state.router_address),
    );
    run_liquidity_action(&state, request, ActionKind::RemoveLiquidity, data).await
}

async fn add_liquidity_for(
    State(state): State<AppState>,
    Json(request): Json<LiquidityRequest>,
) -> impl IntoResponse {
    let router = state.router_address;
    let data = encode::add_liquidity_for(
        match request.amount_parsed() {
            Ok(amount) => amount,
            Err(e) => return error_response(e),
        },
        request.asset_id,
        router,
    );
    run_liquidity_action(&state, request, ActionKind::AddLiquidityFor, data).await
}

async fn run_liquidity_action(
    state: &AppState,
    request: LiquidityRequest,
    kind: ActionKind,
    data: ethers::types::Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let chain_id = ChainId(request.chain_id);
    let Some(chain) = state.settings.chain(chain_id) else {
        return error_response(RouterError::ProviderNotConfigured { chain_id });
    };

    // Liquidity ops have no transfer id; derive a unique key so the
    // dispatcher's dedup never collides across invocations.
    let mut seed = Vec::new();
    seed.extend_from_slice(kind.name().as_bytes());
    seed.extend_from_slice(request.asset_id.as_bytes());
    seed.extend_from_slice(&time::now_millis().to_be_bytes());
    let transaction_id = H256::from(ethers::utils::keccak256(seed));

    let action = Action {
        chain_id,
        kind,
        transaction_id,
        to: chain.transaction_manager_address,
        data,
        value: U256::zero(),
    };

    match state.dispatcher.dispatch(action).await {
        Ok(Some(receipt)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "transactionHash": format!("{:?}", receipt.transaction_hash),
            })),
        ),
        Ok(None) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "duplicate": true })),
        ),
        Err(e) => error_response(e),
    }
}

fn error_response(error: RouterError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &error {
        RouterError::ParamsInvalid { .. } | RouterError::ProviderNotConfigured { .. } => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "error": {
                "kind": error.kind(),
                "message": error.to_string(),
                "context": error.context(),
            }
        })),
    )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiquidityRequest {
    chain_id: u64,
    asset_id: Address,
    /// Decimal string, asset units.
    amount: String,
    recipient: Option<Address>,
}

impl LiquidityRequest {
    fn amount_parsed(&self) -> RouterResult<U256> {
        U256::from_dec_str(&self.amount).map_err(|e| RouterError::ParamsInvalid {
            message: format!("invalid amount '{}': {}", self.amount, e),
        })
    }
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    router_address: String,
    active_transfers: usize,
    clean_up_mode: bool,
}
