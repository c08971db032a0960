//! Configuration management for the Meridian Router
//!
//! Loads configuration from TOML files with environment variable substitution.

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::error::{RouterError, RouterResult};
use crate::types::ChainId;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// BIP-39 mnemonic for the router key. Mutually exclusive with
    /// `web3_signer_url`.
    pub mnemonic: Option<String>,
    /// Remote web3 signer endpoint. Mutually exclusive with `mnemonic`.
    pub web3_signer_url: Option<String>,
    pub auth_url: Option<String>,
    pub nats_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Keyed by decimal chain id. TOML table keys are strings; the keys are
    /// validated numeric at load and only exposed through [`ChainId`]
    /// accessors.
    pub chains: HashMap<String, ChainSettings>,
    #[serde(default)]
    pub swap_pools: Vec<SwapPoolSettings>,
    /// Minimum ms between auction attempts per route pair.
    #[serde(default = "default_request_limit")]
    pub request_limit: u64,
    /// Fraction in [0, 1].
    #[serde(default = "default_max_price_impact")]
    pub max_price_impact: f64,
    /// Amplification coefficient for the liquidity curve.
    #[serde(default)]
    pub amplification: u64,
    #[serde(default = "default_true")]
    pub allowed_vamm: bool,
    #[serde(default)]
    pub diagnostic_mode: bool,
    /// When set the router stops bidding and only drains existing transfers.
    #[serde(default)]
    pub clean_up_mode: bool,
    #[serde(default)]
    pub price_cache_mode: bool,
    #[serde(default)]
    pub api: ApiSettings,
    /// Seconds between lifecycle expiry sweeps.
    #[serde(default = "default_expiry_check_interval")]
    pub expiry_check_interval: u64,
    /// Seconds between subgraph poll ticks.
    #[serde(default = "default_subgraph_poll_interval")]
    pub subgraph_poll_interval: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_limit() -> u64 {
    5_000
}

fn default_max_price_impact() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_expiry_check_interval() -> u64 {
    60
}

fn default_subgraph_poll_interval() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainSettings {
    pub providers: Vec<String>,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    /// Minimum native balance (wei, decimal string) required to bid.
    pub min_gas: String,
    pub transaction_manager_address: Address,
    #[serde(default)]
    pub subgraphs: Vec<String>,
    #[serde(default)]
    pub gas_stations: Vec<String>,
    /// On-chain price oracle; absent means gas is quoted free on this chain.
    pub price_oracle_address: Option<Address>,
    /// Asset the meta-tx relayer is paid in; native when unset.
    pub router_contract_relayer_asset: Option<Address>,
    /// Liquidity weight of this chain's assets within swap pools.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_confirmations() -> u64 {
    10
}

fn default_weight() -> u32 {
    1
}

impl ChainSettings {
    pub fn min_gas_wei(&self) -> RouterResult<U256> {
        U256::from_dec_str(&self.min_gas).map_err(|e| {
            RouterError::ConfigurationError(format!("invalid min_gas '{}': {}", self.min_gas, e))
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SwapPoolSettings {
    pub name: String,
    pub assets: Vec<PoolAssetSettings>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PoolAssetSettings {
    pub chain_id: u64,
    pub asset_id: Address,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8880,
        }
    }
}

impl Settings {
    /// Load settings from the configuration file
    pub fn load() -> RouterResult<Self> {
        let config_path = env::var("MERIDIAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path).map_err(|e| {
            RouterError::ConfigurationError(format!(
                "failed to read config file {:?}: {}",
                config_path, e
            ))
        })?;

        Self::parse(&config_str)
    }

    /// Parse settings from a TOML string with `${ENV_VAR}` substitution.
    pub fn parse(raw: &str) -> RouterResult<Self> {
        let substituted = substitute_env_vars(raw);

        let settings: Settings = toml::from_str(&substituted)
            .map_err(|e| RouterError::ConfigurationError(format!("failed to parse config: {}", e)))?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> RouterResult<()> {
        match (&self.mnemonic, &self.web3_signer_url) {
            (None, None) => {
                return Err(RouterError::ConfigurationError(
                    "one of mnemonic or web3_signer_url must be set".into(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(RouterError::ConfigurationError(
                    "mnemonic and web3_signer_url are mutually exclusive".into(),
                ))
            }
            _ => {}
        }

        if self.chains.is_empty() {
            return Err(RouterError::ConfigurationError(
                "at least one chain must be configured".into(),
            ));
        }

        for (chain_id, chain) in &self.chains {
            if chain_id.parse::<u64>().is_err() {
                return Err(RouterError::ConfigurationError(format!(
                    "chain key '{}' is not a numeric chain id",
                    chain_id
                )));
            }
            if chain.providers.is_empty() {
                return Err(RouterError::ConfigurationError(format!(
                    "chain {} has no RPC providers configured",
                    chain_id
                )));
            }
            if chain.confirmations < 1 {
                return Err(RouterError::ConfigurationError(format!(
                    "chain {} confirmations must be >= 1",
                    chain_id
                )));
            }
            if chain.weight == 0 {
                return Err(RouterError::ConfigurationError(format!(
                    "chain {} weight must be positive",
                    chain_id
                )));
            }
            chain.min_gas_wei()?;
            if chain.subgraphs.is_empty() {
                tracing::warn!("chain {} has no subgraphs - tracker will idle", chain_id);
            }
        }

        if !(0.0..=1.0).contains(&self.max_price_impact) {
            return Err(RouterError::ConfigurationError(format!(
                "max_price_impact must be within [0, 1], got {}",
                self.max_price_impact
            )));
        }

        for pool in &self.swap_pools {
            let mut seen = std::collections::HashSet::new();
            for asset in &pool.assets {
                if !self.chains.contains_key(&asset.chain_id.to_string()) {
                    return Err(RouterError::ConfigurationError(format!(
                        "swap pool '{}' references unconfigured chain {}",
                        pool.name, asset.chain_id
                    )));
                }
                if !seen.insert((asset.chain_id, asset.asset_id)) {
                    return Err(RouterError::ConfigurationError(format!(
                        "swap pool '{}' lists ({}, {:?}) twice",
                        pool.name, asset.chain_id, asset.asset_id
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn chain(&self, chain_id: ChainId) -> Option<&ChainSettings> {
        self.chains.get(&chain_id.0.to_string())
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.chains
            .keys()
            .filter_map(|k| k.parse::<u64>().ok())
            .map(ChainId)
            .collect()
    }

    /// `max_price_impact` as a 1e18 fixed-point fraction. The conversion from
    /// the configured float happens exactly once, here; all pricing math
    /// downstream is integer-only.
    pub fn max_price_impact_e18(&self) -> U256 {
        let scaled = (self.max_price_impact * 1e18).round();
        U256::from(scaled as u128)
    }

    /// Copy safe to serve from the admin surface.
    pub fn redacted(&self) -> Settings {
        let mut copy = self.clone();
        if copy.mnemonic.is_some() {
            copy.mnemonic = Some("<redacted>".to_string());
        }
        copy
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        mnemonic = "test test test test test test test test test test test junk"
        nats_url = "nats://localhost:4222"
        request_limit = 5000
        max_price_impact = 0.1
        amplification = 85

        [chains.1337]
        providers = ["http://localhost:8545"]
        confirmations = 1
        min_gas = "100000000000000000"
        transaction_manager_address = "0x00000000000000000000000000000000000000aa"
        subgraphs = ["http://localhost:8000/subgraphs/sending"]

        [chains.1338]
        providers = ["http://localhost:8546"]
        confirmations = 1
        min_gas = "100000000000000000"
        transaction_manager_address = "0x00000000000000000000000000000000000000bb"
        subgraphs = ["http://localhost:8001/subgraphs/receiving"]

        [[swap_pools]]
        name = "TEST"
        [[swap_pools.assets]]
        chain_id = 1337
        asset_id = "0x0000000000000000000000000000000000000001"
        [[swap_pools.assets]]
        chain_id = 1338
        asset_id = "0x0000000000000000000000000000000000000002"
    "#;

    #[test]
    fn parses_and_validates() {
        let settings = Settings::parse(BASE).unwrap();
        assert_eq!(settings.chains.len(), 2);
        assert_eq!(settings.request_limit, 5000);
        assert_eq!(
            settings.max_price_impact_e18(),
            U256::from(100_000_000_000_000_000u128)
        );
    }

    #[test]
    fn rejects_missing_signer() {
        let raw = BASE.replace(
            "mnemonic = \"test test test test test test test test test test test junk\"",
            "",
        );
        let err = Settings::parse(&raw).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn rejects_both_signers() {
        // Root-level key, so it must precede the table sections.
        let raw = format!("web3_signer_url = \"http://localhost:9000\"\n{}", BASE);
        assert!(Settings::parse(&raw).is_err());
    }

    #[test]
    fn redaction_suppresses_mnemonic() {
        let settings = Settings::parse(BASE).unwrap();
        let redacted = settings.redacted();
        assert_eq!(redacted.mnemonic.as_deref(), Some("<redacted>"));
    }

    #[test]
    fn env_var_substitution() {
        env::set_var("MERIDIAN_TEST_VAR", "nats://broker:4222");
        let out = substitute_env_vars("nats_url = \"${MERIDIAN_TEST_VAR}\"");
        assert_eq!(out, "nats_url = \"nats://broker:4222\"");
    }
}
