use alloy::primitives::Address;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::ethereum::transaction::DEFAULT_GAS_LIMIT;
use crate::ethereum::{film, utils};

const API_KEY_PLACEHOLDER: &str = "YOUR_API_KEY_HERE";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub contract: ContractConfig,
    pub gas: GasConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub name: String,
    pub rpc_url: String,
    /// Checked against the node's chain id when set.
    pub chain_id: Option<u64>,
    pub explorer_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractConfig {
    pub address: String,
    pub abi_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    pub default_gas_limit: u64,
    /// Fixed gas price in wei; the node's suggestion is used when unset.
    pub gas_price: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub from_block: u64,
    pub to_block: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "goerli".to_string(),
            rpc_url: format!("https://goerli.infura.io/v3/{}", API_KEY_PLACEHOLDER),
            chain_id: Some(5),
            explorer_url: Some("https://goerli.etherscan.io".to_string()),
        }
    }
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self {
            address: "0x95E72Ebd9F722e0F6AD5fcd3a29F446B7fDf7e5f".to_string(),
            abi_path: None,
        }
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            default_gas_limit: DEFAULT_GAS_LIMIT,
            gas_price: None,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            from_block: film::REFERENCE_BLOCK,
            to_block: film::REFERENCE_BLOCK,
        }
    }
}

impl ContractConfig {
    pub fn parsed_address(&self) -> Result<Address> {
        utils::validate_address(&self.address)
            .map_err(|e| anyhow!("Invalid contract.address: {}", e))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {:?}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {:?}: {}", path, e))?;

        Ok(config)
    }

    /// Load configuration from an explicit file, or from the default location
    /// when it exists, then apply environment overrides. An explicit file
    /// that cannot be read is an error.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let config = Self::load_from_file(path).await?;
                tracing::info!("Loaded configuration from {:?}", path);
                config
            }
            None => match Self::default_config_path() {
                Ok(default_path) if default_path.exists() => {
                    match Self::load_from_file(&default_path).await {
                        Ok(config) => {
                            tracing::info!("Loaded configuration from {:?}", default_path);
                            config
                        }
                        Err(e) => {
                            tracing::warn!("Failed to load config file, using defaults: {}", e);
                            Self::default()
                        }
                    }
                }
                _ => Self::default(),
            },
        };

        config.apply_env_vars();
        Ok(config)
    }

    /// Apply `API_KEY`, `RPC_URL` and `CONTRACT_ADDRESS` from the process
    /// environment.
    pub fn apply_env_vars(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(rpc_url) = lookup("RPC_URL") {
            tracing::debug!("Using RPC_URL environment variable");
            self.network.rpc_url = rpc_url;
        }

        if self.network.rpc_url.contains(API_KEY_PLACEHOLDER) {
            match lookup("API_KEY") {
                Some(api_key) => {
                    self.network.rpc_url = self.network.rpc_url.replace(API_KEY_PLACEHOLDER, &api_key);
                    tracing::debug!("Updated {} RPC URL with API key", self.network.name);
                }
                None => tracing::warn!(
                    "RPC URL for {} still contains {}, set the API_KEY environment variable",
                    self.network.name,
                    API_KEY_PLACEHOLDER
                ),
            }
        }

        if let Some(address) = lookup("CONTRACT_ADDRESS") {
            tracing::debug!("Using CONTRACT_ADDRESS environment variable");
            self.contract.address = address;
        }
    }

    /// Get default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("film-client").join("config.toml"))
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let sample_config = r#"# film-client configuration file

[network]
name = "goerli"
# YOUR_API_KEY_HERE is replaced with the API_KEY environment variable
rpc_url = "https://goerli.infura.io/v3/YOUR_API_KEY_HERE"
chain_id = 5
explorer_url = "https://goerli.etherscan.io"

[contract]
address = "0x95E72Ebd9F722e0F6AD5fcd3a29F446B7fDf7e5f"
# abi_path = "abi/EmeraldToken.json"  # defaults to the embedded ABI

[gas]
default_gas_limit = 300_000
# gas_price = 2_000_000_000  # 2 Gwei, defaults to the node's suggestion

[query]
from_block = 8_568_585
to_block = 8_568_585

# Environment variables that can be used:
# API_KEY - Infura project key substituted into rpc_url
# PRIVATE_KEY - hex private key used to sign add-film, delete-film, send and run
# RPC_URL - overrides network.rpc_url
# CONTRACT_ADDRESS - overrides contract.address
# ETHERSCAN_API_KEY - fetches ABIs of other verified contracts
"#;
        sample_config.to_string()
    }
}
