use alloy::primitives::{Address, U256};
use anyhow::{anyhow, Result};
use std::str::FromStr;

/// Parses a `0x`-prefixed 20-byte address, accepting any checksum casing.
pub fn validate_address(address: &str) -> Result<Address> {
    let address = address.trim();

    if address.is_empty() {
        return Err(anyhow!("Address cannot be empty"));
    }

    let Some(hex_part) = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
    else {
        return Err(anyhow!(
            "Invalid address format: '{}'. Ethereum addresses must start with '0x'",
            address
        ));
    };

    if hex_part.len() != 40 {
        return Err(anyhow!(
            "Invalid address length: '{}'. Expected 0x followed by 40 hex characters",
            address
        ));
    }

    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!(
            "Invalid address format: '{}'. Contains non-hexadecimal characters",
            address
        ));
    }

    Address::from_str(hex_part)
        .map_err(|e| anyhow!("Invalid Ethereum address: '{}'. Error: {}", address, e))
}

/// Checks that a name is a valid Solidity identifier before looking it up in
/// the ABI.
pub fn validate_function_name(function_name: &str) -> Result<()> {
    let mut chars = function_name.chars();
    match chars.next() {
        None => return Err(anyhow!("Function name cannot be empty")),
        Some(c) if !(c.is_ascii_alphabetic() || c == '_' || c == '$') => {
            return Err(anyhow!(
                "Invalid function name: '{}'. Function names must start with a letter or underscore",
                function_name
            ))
        }
        Some(_) => {}
    }

    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        return Err(anyhow!(
            "Invalid function name: '{}'. Function names can only contain letters, numbers, and underscores",
            function_name
        ));
    }

    Ok(())
}

/// Parses a wei amount given in decimal or `0x` hex.
pub fn parse_amount(value_str: &str) -> Result<U256> {
    let value_str = value_str.trim();
    if value_str.is_empty() {
        return Err(anyhow!("Value cannot be empty"));
    }

    match value_str
        .strip_prefix("0x")
        .or_else(|| value_str.strip_prefix("0X"))
    {
        Some(hex) => U256::from_str_radix(hex, 16)
            .map_err(|_| anyhow!("Invalid hexadecimal value: '{}'", value_str)),
        None => U256::from_str(value_str).map_err(|_| {
            anyhow!(
                "Invalid numeric value: '{}'. Use decimal format or '0x' prefixed hex",
                value_str
            )
        }),
    }
}

/// Parses a block number given in decimal or `0x` hex.
pub fn parse_block_number(block: &str) -> Result<u64> {
    let block = block.trim();
    let parsed = match block.strip_prefix("0x").or_else(|| block.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => block.parse::<u64>(),
    };
    parsed.map_err(|_| anyhow!("Invalid block number: '{}'", block))
}

/// Turns a raw node error message into a hint for the user. The original
/// message is kept at the end so nothing is lost.
pub fn interpret_rpc_error(error: &str) -> String {
    let lower = error.to_lowercase();
    let hint = if lower.contains("execution reverted") {
        "The contract function reverted. Its requirements were not met (for example the film already exists or is missing)."
    } else if lower.contains("insufficient funds") {
        "Insufficient funds to cover gas costs. Fund the sending account with test ETH."
    } else if lower.contains("gas required exceeds allowance") || lower.contains("out of gas") {
        "Gas limit too low. Raise gas.default_gas_limit in the configuration."
    } else if lower.contains("nonce too low") {
        "Nonce too low. Another transaction from this account was already mined with this nonce."
    } else if lower.contains("replacement transaction underpriced") {
        "Gas price too low to replace a pending transaction. Set gas.gas_price higher."
    } else if lower.contains("already known") {
        "The node already has this exact transaction in its pool."
    } else if lower.contains("connection refused") || lower.contains("network unreachable") {
        "Cannot connect to the RPC endpoint. Check network.rpc_url and your connection."
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "Request timed out. The RPC endpoint may be overloaded or unreachable."
    } else if lower.contains("rate limit") || lower.contains("429") {
        "Too many requests to the RPC endpoint. Try again shortly or use another endpoint."
    } else if lower.contains("unauthorized") || lower.contains("401") || lower.contains("invalid project id") {
        "The RPC endpoint rejected the credentials. Check the API_KEY environment variable."
    } else if lower.contains("method not found") {
        "The RPC endpoint does not support this method. Try a different endpoint."
    } else {
        return format!("RPC error: {}", error);
    };

    format!("{} ({})", hint, error)
}

/// Turns an Etherscan failure into a hint for the user.
pub fn interpret_abi_error(error: &str, contract_address: &str) -> String {
    let lower = error.to_lowercase();
    if lower.contains("not verified") || lower.contains("404") || lower.contains("not found") {
        format!(
            "The contract at {} is not verified on Etherscan. Point contract.abi_path at its ABI file instead.",
            contract_address
        )
    } else if lower.contains("rate limit") || lower.contains("429") {
        "Too many requests to the Etherscan API. Try again shortly.".to_string()
    } else if lower.contains("invalid api key") || lower.contains("missing/invalid api key") || lower.contains("403") {
        "Etherscan rejected the API key. Check the ETHERSCAN_API_KEY environment variable.".to_string()
    } else if lower.contains("timeout") {
        "Request to the Etherscan API timed out. Try again shortly.".to_string()
    } else if lower.contains("network") || lower.contains("connection") {
        "Cannot connect to the Etherscan API. Check your internet connection.".to_string()
    } else {
        format!("ABI resolution error: {}", error)
    }
}
