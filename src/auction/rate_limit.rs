//! Per-route auction rate limiting.
//!
//! Keyed by (user, sending asset, sending chain, receiving asset, receiving
//! chain) - deliberately not by amount, so a user probing different sizes on
//! one route shares a single window.

use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{RouterError, RouterResult};
use crate::types::ChainId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimiterKey {
    pub user: Address,
    pub sending_asset_id: Address,
    pub sending_chain_id: ChainId,
    pub receiving_asset_id: Address,
    pub receiving_chain_id: ChainId,
}

/// Tracks the last admitted attempt per route pair.
pub struct RateLimiter {
    window_ms: u64,
    last_attempt: Mutex<HashMap<RateLimiterKey, u64>>,
}

impl RateLimiter {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    /// Admit iff at least the configured window has elapsed since the last
    /// *admitted* attempt. Denied attempts do not move the window.
    pub fn check(&self, key: &RateLimiterKey, now_ms: u64) -> RouterResult<()> {
        let map = self.last_attempt.lock().expect("rate limiter poisoned");
        if let Some(last) = map.get(key) {
            let elapsed = now_ms.saturating_sub(*last);
            if elapsed < self.window_ms {
                return Err(RouterError::AuctionRateExceeded {
                    elapsed_ms: elapsed,
                    minimal_period_ms: self.window_ms,
                });
            }
        }
        Ok(())
    }

    /// Record a produced bid as the new window start.
    pub fn record(&self, key: RateLimiterKey, now_ms: u64) {
        self.last_attempt
            .lock()
            .expect("rate limiter poisoned")
            .insert(key, now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RateLimiterKey {
        RateLimiterKey {
            user: Address::from_low_u64_be(1),
            sending_asset_id: Address::from_low_u64_be(2),
            sending_chain_id: ChainId(1337),
            receiving_asset_id: Address::from_low_u64_be(3),
            receiving_chain_id: ChainId(1338),
        }
    }

    #[test]
    fn admits_iff_window_elapsed() {
        let limiter = RateLimiter::new(5_000);
        let k = key();

        assert!(limiter.check(&k, 10_000).is_ok());
        limiter.record(k.clone(), 10_000);

        // 1000ms later: denied with structured context.
        let err = limiter.check(&k, 11_000).unwrap_err();
        match err {
            RouterError::AuctionRateExceeded {
                elapsed_ms,
                minimal_period_ms,
            } => {
                assert_eq!(elapsed_ms, 1_000);
                assert_eq!(minimal_period_ms, 5_000);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Exactly at the boundary: admitted.
        assert!(limiter.check(&k, 15_000).is_ok());
    }

    #[test]
    fn denied_attempts_do_not_move_the_window() {
        let limiter = RateLimiter::new(5_000);
        let k = key();
        limiter.record(k.clone(), 0);
        assert!(limiter.check(&k, 4_000).is_err());
        // Had the denial at 4s moved the window, 5.5s would still be denied.
        assert!(limiter.check(&k, 5_500).is_ok());
    }

    #[test]
    fn distinct_routes_do_not_share_a_window() {
        let limiter = RateLimiter::new(5_000);
        let a = key();
        let mut b = key();
        b.receiving_chain_id = ChainId(1);
        limiter.record(a, 0);
        assert!(limiter.check(&b, 100).is_ok());
    }
}
