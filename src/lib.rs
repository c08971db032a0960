//! Meridian Router - cross-chain liquidity router for HTLC-style bridging.
//!
//! The router bids on user auctions for cross-chain transfers and executes
//! the matching two-phase commit on both chains: prepare on the receiving
//! side, fulfill on both sides once the user reveals a preimage, cancel on
//! timeout.

pub mod amm;
pub mod api;
pub mod auction;
pub mod chain;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod messaging;
pub mod metrics;
pub mod oracle;
pub mod subgraph;
pub mod types;
pub mod wallet;
