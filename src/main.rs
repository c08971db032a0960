//! Meridian Router - cross-chain liquidity router daemon
//!
//! Bids on bridge auctions and drives the prepare / fulfill / cancel
//! two-phase commit across every configured chain pair.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info, warn};

use meridian_router::api::{self, AppState};
use meridian_router::auction::{AuctionEvaluator, TransferPricer};
use meridian_router::chain::ChainManager;
use meridian_router::config::Settings;
use meridian_router::dispatch::Dispatcher;
use meridian_router::lifecycle::LifecycleEngine;
use meridian_router::messaging::{MessagingServer, NatsTransport};
use meridian_router::oracle::PriceOracle;
use meridian_router::subgraph::{EventTracker, HttpSubgraph};
use meridian_router::types::ChainId;
use meridian_router::metrics;
use meridian_router::wallet::{self, WalletInitError};

/// Seconds allowed for in-flight work to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match Settings::load() {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    init_logging(&settings.log_level);
    info!("starting Meridian Router v{}", env!("CARGO_PKG_VERSION"));
    info!("loaded configuration for {} chains", settings.chains.len());

    // Signer first: a dead remote signer must fail fast with its own code.
    let signer = match wallet::init(&settings).await {
        Ok(signer) => signer,
        Err(WalletInitError::Config(message)) => {
            error!("wallet configuration error: {}", message);
            return ExitCode::from(1);
        }
        Err(WalletInitError::SignerUnreachable(message)) => {
            error!("signer unreachable at startup: {}", message);
            return ExitCode::from(2);
        }
    };
    let router_address = signer.address();
    info!(address = ?router_address, "router identity established");

    let chains = match ChainManager::from_settings(&settings) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("chain initialization failed: {}", e);
            return ExitCode::from(1);
        }
    };

    let oracle = Arc::new(PriceOracle::new(settings.clone(), chains.clone()));

    let subgraph = Arc::new(HttpSubgraph::new(
        settings.clone(),
        chains.clone(),
        router_address,
    ));
    let tracker = Arc::new(EventTracker::new(
        subgraph,
        settings.chain_ids(),
        Duration::from_secs(settings.subgraph_poll_interval),
    ));

    let pricer = Arc::new(TransferPricer::new(
        settings.clone(),
        chains.clone(),
        tracker.clone(),
        oracle.clone(),
    ));

    let dispatcher = match Dispatcher::start(&chains, signer.clone(), oracle.clone(), settings.clone())
        .await
    {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(e) => {
            error!("dispatcher initialization failed: {}", e);
            return ExitCode::from(1);
        }
    };

    let lifecycle = LifecycleEngine::new(
        settings.clone(),
        chains.clone(),
        tracker.clone(),
        oracle.clone(),
        pricer.clone(),
        dispatcher.clone(),
    );

    let evaluator = Arc::new(AuctionEvaluator::new(
        settings.clone(),
        chains.clone(),
        tracker.clone(),
        pricer,
        signer.clone(),
    ));

    if let Some(auth_url) = &settings.auth_url {
        info!(url = %auth_url, "auction auth service configured");
    }

    let transport = match NatsTransport::connect(&settings.nats_url).await {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("messaging transport failed: {}", e);
            return ExitCode::from(1);
        }
    };
    let messaging = MessagingServer::new(transport, evaluator, lifecycle.clone());

    // Background loops.
    let tracker_handle = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.run().await }
    });
    let lifecycle_handle = tokio::spawn({
        let lifecycle = lifecycle.clone();
        async move { lifecycle.run().await }
    });
    let messaging_handle = tokio::spawn({
        let messaging = messaging.clone();
        async move {
            if let Err(e) = messaging.run().await {
                error!("messaging server error: {}", e);
            }
        }
    });
    let api_handle = tokio::spawn({
        let state = AppState {
            settings: settings.clone(),
            dispatcher: dispatcher.clone(),
            lifecycle: lifecycle.clone(),
            router_address,
        };
        async move {
            if let Err(e) = api::run_server(state).await {
                error!("admin API error: {}", e);
            }
        }
    });
    let health_handle = tokio::spawn({
        let chains = chains.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                for (chain_id, healthy) in chains.health_check().await {
                    if !healthy {
                        warn!(chain = %chain_id, "chain health check failed");
                        continue;
                    }
                    record_wallet_balance(chains.clone(), chain_id, router_address).await;
                }
            }
        }
    });

    info!(
        "Meridian Router is running (admin http://{}:{})",
        settings.api.host, settings.api.port
    );
    if settings.diagnostic_mode {
        info!("diagnostic mode enabled: auction decisions logged at info level");
    }

    shutdown_signal().await;
    info!("shutdown signal received, stopping...");

    // Stop intake first, then give in-flight dispatches the grace window.
    messaging.stop().await;
    tracker.stop().await;
    lifecycle.stop().await;

    let drain = async {
        for chain_id in settings.chain_ids() {
            while dispatcher.pending_count(chain_id).await > 0 {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace elapsed with work still pending; receipts will be re-observed on restart");
    }

    api_handle.abort();
    health_handle.abort();
    messaging_handle.abort();
    lifecycle_handle.abort();
    tracker_handle.abort();

    info!("Meridian Router stopped");
    ExitCode::from(0)
}

async fn record_wallet_balance(chains: Arc<ChainManager>, chain_id: ChainId, router: ethers::types::Address) {
    if let Ok(rpc) = chains.get(chain_id) {
        if let Ok(balance) = rpc.get_balance(router).await {
            // Whole native units for the gauge; dust precision is irrelevant.
            let whole = (balance / ethers::types::U256::exp10(14)).low_u128() as f64 / 10_000.0;
            metrics::record_wallet_balance(chain_id, whole);
        }
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{level},meridian_router={level},hyper=warn,reqwest=warn"
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
