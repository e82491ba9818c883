pub mod abi;
pub mod codec;
pub mod contract;
pub mod events;
pub mod film;
pub mod provider;
pub mod stream;
pub mod transaction;
pub mod utils;

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};

/// A log entry as delivered by the node, before any ABI decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
}

impl From<alloy::rpc::types::Log> for RawLog {
    fn from(log: alloy::rpc::types::Log) -> Self {
        Self {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            block_hash: log.block_hash,
            block_number: log.block_number,
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
        }
    }
}

/// One decoded event parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedParam {
    pub name: String,
    pub indexed: bool,
    pub value: DynSolValue,
}

/// A log decoded against its event definition. Parameters are kept in
/// declaration order; indexed dynamic values hold the 32-byte topic hash.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub name: String,
    pub signature: String,
    pub params: Vec<DecodedParam>,
    pub raw: RawLog,
}

impl DecodedEvent {
    pub fn field(&self, name: &str) -> Option<&DynSolValue> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }
}

/// Printable form of a log, optionally with its decoded fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInfo {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_hash: Option<String>,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<u64>,
    pub event: Option<String>,
    pub decoded: Option<serde_json::Value>,
}

impl From<&RawLog> for EventInfo {
    fn from(log: &RawLog) -> Self {
        Self {
            address: log.address.to_string(),
            topics: log.topics.iter().map(|t| format!("0x{:x}", t)).collect(),
            data: format!("0x{}", hex::encode(&log.data)),
            block_hash: log.block_hash.map(|h| format!("0x{:x}", h)),
            block_number: log.block_number,
            transaction_hash: log.transaction_hash.map(|h| format!("0x{:x}", h)),
            log_index: log.log_index,
            event: None,
            decoded: None,
        }
    }
}

impl From<&DecodedEvent> for EventInfo {
    fn from(event: &DecodedEvent) -> Self {
        let mut decoded = serde_json::Map::new();
        for param in &event.params {
            decoded.insert(param.name.clone(), codec::value_to_json(&param.value));
        }

        Self {
            event: Some(event.signature.clone()),
            decoded: Some(serde_json::Value::Object(decoded)),
            ..EventInfo::from(&event.raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    fn sample_event() -> DecodedEvent {
        DecodedEvent {
            name: "Transfer".to_string(),
            signature: "Transfer(address,address,uint256)".to_string(),
            params: vec![
                DecodedParam {
                    name: "from".to_string(),
                    indexed: true,
                    value: DynSolValue::Address(Address::repeat_byte(0x11)),
                },
                DecodedParam {
                    name: "to".to_string(),
                    indexed: true,
                    value: DynSolValue::Address(Address::repeat_byte(0x22)),
                },
                DecodedParam {
                    name: "value".to_string(),
                    indexed: false,
                    value: DynSolValue::Uint(U256::from(100), 256),
                },
            ],
            raw: RawLog {
                block_number: Some(8568585),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_decoded_event_groups() {
        let event = sample_event();
        assert_eq!(event.params.iter().filter(|p| p.indexed).count(), 2);
        assert_eq!(
            event.field("value"),
            Some(&DynSolValue::Uint(U256::from(100), 256))
        );
        assert!(event.field("missing").is_none());
    }

    #[test]
    fn test_event_info_from_decoded() {
        let info = EventInfo::from(&sample_event());
        assert_eq!(info.block_number, Some(8568585));
        assert_eq!(
            info.event.as_deref(),
            Some("Transfer(address,address,uint256)")
        );
        let decoded = info.decoded.unwrap();
        assert_eq!(decoded["value"], serde_json::json!("100"));
    }
}
