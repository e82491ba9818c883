use alloy::json_abi::JsonAbi;
use alloy::primitives::Address;
use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use super::film::{DEFAULT_CONTRACT_ADDRESS, EMERALD_TOKEN_ABI};
use super::utils::interpret_abi_error;

const ETHERSCAN_V2_API: &str = "https://api.etherscan.io/v2/api";

/// Where ABIs come from when no file is configured.
#[derive(Debug, Clone)]
pub struct AbiSource {
    pub etherscan_api_key: Option<String>,
    pub cache_dir: PathBuf,
}

impl Default for AbiSource {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("film-client")
            .join("abi-cache");

        Self {
            etherscan_api_key: std::env::var("ETHERSCAN_API_KEY").ok(),
            cache_dir,
        }
    }
}

/// Resolves a contract ABI from, in order: an explicit file, the embedded
/// film registry ABI, and Etherscan (with a disk cache).
#[derive(Debug)]
pub struct AbiResolver {
    client: Client,
    config: AbiSource,
}

impl AbiResolver {
    pub fn new(config: AbiSource) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Returns the ABI JSON text for a contract.
    ///
    /// The embedded ABI serves the default deployment, and any other address
    /// when no Etherscan key is configured.
    pub async fn resolve(
        &self,
        address: Address,
        chain_id: u64,
        abi_path: Option<&Path>,
    ) -> Result<String> {
        if let Some(path) = abi_path {
            return load_abi_file(path).await;
        }

        if address == DEFAULT_CONTRACT_ADDRESS || self.config.etherscan_api_key.is_none() {
            debug!("Using embedded ABI for {}", address);
            return Ok(EMERALD_TOKEN_ABI.to_string());
        }

        let abi = self.get_abi(address, chain_id).await?;
        serde_json::to_string(&abi).map_err(|e| anyhow!("Failed to serialize ABI: {}", e))
    }

    /// Fetch an ABI from Etherscan, trying the disk cache first.
    pub async fn get_abi(&self, address: Address, chain_id: u64) -> Result<JsonAbi> {
        let cache_key = format!("{}_{:x}", chain_id, address);

        if let Ok(abi) = self.load_cached_abi(&cache_key).await {
            debug!("ABI disk cache hit for {}", address);
            return Ok(abi);
        }

        info!("Fetching ABI from Etherscan for {} on chain {}", address, chain_id);
        let abi = self
            .fetch_from_etherscan(address, chain_id)
            .await
            .map_err(|e| anyhow!(interpret_abi_error(&e.to_string(), &address.to_string())))?;

        if let Err(e) = self.cache_abi(&cache_key, &abi).await {
            warn!("Failed to cache ABI for {}: {}", address, e);
        }

        Ok(abi)
    }

    async fn fetch_from_etherscan(&self, address: Address, chain_id: u64) -> Result<JsonAbi> {
        let api_key = self
            .config
            .etherscan_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("Missing/Invalid API Key"))?;

        let chain_id = chain_id.to_string();
        let address = address.to_string();
        let response: Value = self
            .client
            .get(ETHERSCAN_V2_API)
            .query(&[
                ("chainid", chain_id.as_str()),
                ("module", "contract"),
                ("action", "getabi"),
                ("address", address.as_str()),
                ("apikey", api_key),
            ])
            .send()
            .await
            .map_err(|e| anyhow!("Failed to fetch from Etherscan: {}", e))?
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse Etherscan response: {}", e))?;

        parse_etherscan_response(&response)
    }

    async fn load_cached_abi(&self, cache_key: &str) -> Result<JsonAbi> {
        let cache_path = self.config.cache_dir.join(format!("{}.json", cache_key));
        let content = fs::read_to_string(&cache_path)
            .await
            .map_err(|e| anyhow!("Failed to read cache file: {}", e))?;

        serde_json::from_str(&content).map_err(|e| anyhow!("Failed to parse cached ABI: {}", e))
    }

    async fn cache_abi(&self, cache_key: &str, abi: &JsonAbi) -> Result<()> {
        fs::create_dir_all(&self.config.cache_dir)
            .await
            .map_err(|e| anyhow!("Failed to create cache directory: {}", e))?;

        let cache_path = self.config.cache_dir.join(format!("{}.json", cache_key));
        let content = serde_json::to_string_pretty(abi)
            .map_err(|e| anyhow!("Failed to serialize ABI: {}", e))?;

        fs::write(&cache_path, content)
            .await
            .map_err(|e| anyhow!("Failed to write cache file: {}", e))?;

        debug!("Cached ABI to {:?}", cache_path);
        Ok(())
    }
}

/// Reads an ABI file. Both a bare ABI array and a compiler artifact with an
/// `abi` field are accepted.
pub async fn load_abi_file(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| anyhow!("Failed to read ABI file {}: {}", path.display(), e))?;

    let value: Value = serde_json::from_str(&content)
        .map_err(|e| anyhow!("Failed to parse ABI file {}: {}", path.display(), e))?;

    match value {
        Value::Array(_) => Ok(content),
        Value::Object(ref map) if map.get("abi").is_some_and(Value::is_array) => {
            Ok(map["abi"].to_string())
        }
        _ => Err(anyhow!(
            "ABI file {} holds neither an ABI array nor an artifact with an 'abi' field",
            path.display()
        )),
    }
}

fn parse_etherscan_response(response: &Value) -> Result<JsonAbi> {
    let result = response["result"].as_str();

    if response["status"] != "1" {
        let message = result
            .or_else(|| response["message"].as_str())
            .unwrap_or("Unknown error");
        return Err(anyhow!("Etherscan API error: {}", message));
    }

    let abi_str = result.ok_or_else(|| anyhow!("No ABI found in response"))?;
    serde_json::from_str(abi_str).map_err(|e| anyhow!("Failed to parse ABI JSON: {}", e))
}
