//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Auction volume and bid production
//! - Tracker sync state and poll latency
//! - Dispatcher throughput and failures
//! - Chain connectivity and wallet balances

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

use crate::lifecycle::TransferState;
use crate::types::ChainId;

lazy_static! {
    // Auction metrics
    pub static ref AUCTIONS_RECEIVED: CounterVec = register_counter_vec!(
        "meridian_auctions_received_total",
        "Total auction requests received, labelled by sending chain",
        &["sending_chain_id"]
    ).unwrap();

    pub static ref BIDS_PRODUCED: CounterVec = register_counter_vec!(
        "meridian_bids_produced_total",
        "Total bids produced",
        &["sending_chain_id", "signed"]
    ).unwrap();

    pub static ref AUCTION_FAILURES: CounterVec = register_counter_vec!(
        "meridian_auction_failures_total",
        "Auction evaluations that returned an error, by kind",
        &["kind"]
    ).unwrap();

    // Tracker metrics
    pub static ref SUBGRAPH_SYNCED: GaugeVec = register_gauge_vec!(
        "meridian_subgraph_synced",
        "Whether any indexer for the chain is synced (1) or not (0)",
        &["chain_id"]
    ).unwrap();

    pub static ref SUBGRAPH_LAG: GaugeVec = register_gauge_vec!(
        "meridian_subgraph_lag_blocks",
        "Best indexer lag behind chain head",
        &["chain_id"]
    ).unwrap();

    pub static ref TRACKER_EVENTS: CounterVec = register_counter_vec!(
        "meridian_tracker_events_total",
        "Transfer events emitted by the tracker",
        &["chain_id", "event"]
    ).unwrap();

    pub static ref POLL_DURATION: HistogramVec = register_histogram_vec!(
        "meridian_tracker_poll_seconds",
        "Tracker poll duration per chain",
        &["chain_id"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    // Lifecycle metrics
    pub static ref TRANSFER_STATES: CounterVec = register_counter_vec!(
        "meridian_transfer_transitions_total",
        "Lifecycle state transitions observed",
        &["state"]
    ).unwrap();

    // Dispatcher metrics
    pub static ref DISPATCH_ATTEMPTS: CounterVec = register_counter_vec!(
        "meridian_dispatch_attempts_total",
        "Actions picked up by a chain worker",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref DISPATCH_CONFIRMED: CounterVec = register_counter_vec!(
        "meridian_dispatch_confirmed_total",
        "Actions confirmed on chain",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref DISPATCH_FAILED: CounterVec = register_counter_vec!(
        "meridian_dispatch_failed_total",
        "Actions that exhausted their retries",
        &["chain_id", "kind"]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "meridian_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref WALLET_BALANCE: GaugeVec = register_gauge_vec!(
        "meridian_wallet_balance_native",
        "Router native balance per chain, in whole units",
        &["chain_id"]
    ).unwrap();
}

/// Render the exposition text for the admin endpoint.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_auction_received(sending_chain: ChainId) {
    AUCTIONS_RECEIVED
        .with_label_values(&[&sending_chain.to_string()])
        .inc();
}

pub fn record_bid_produced(sending_chain: ChainId, signed: bool) {
    BIDS_PRODUCED
        .with_label_values(&[&sending_chain.to_string(), if signed { "true" } else { "false" }])
        .inc();
}

pub fn record_auction_failure(kind: &str) {
    AUCTION_FAILURES.with_label_values(&[kind]).inc();
}

pub fn record_subgraph_sync(chain_id: ChainId, synced: bool, lag: u64) {
    SUBGRAPH_SYNCED
        .with_label_values(&[&chain_id.to_string()])
        .set(if synced { 1.0 } else { 0.0 });
    SUBGRAPH_LAG
        .with_label_values(&[&chain_id.to_string()])
        .set(lag as f64);
}

pub fn record_tracker_event(chain_id: ChainId, event: &str) {
    TRACKER_EVENTS
        .with_label_values(&[&chain_id.to_string(), event])
        .inc();
}

pub fn record_poll_duration(chain_id: ChainId, seconds: f64) {
    POLL_DURATION
        .with_label_values(&[&chain_id.to_string()])
        .observe(seconds);
}

pub fn record_transfer_state(state: TransferState) {
    TRANSFER_STATES
        .with_label_values(&[&format!("{:?}", state)])
        .inc();
}

pub fn record_dispatch_attempt(chain_id: ChainId, kind: &str) {
    DISPATCH_ATTEMPTS
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_dispatch_confirmed(chain_id: ChainId, kind: &str) {
    DISPATCH_CONFIRMED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_dispatch_failed(chain_id: ChainId, kind: &str) {
    DISPATCH_FAILED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_chain_health(chain_id: ChainId, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_wallet_balance(chain_id: ChainId, balance_native: f64) {
    WALLET_BALANCE
        .with_label_values(&[&chain_id.to_string()])
        .set(balance_native);
}
