//! Decoding of raw logs into events declared by a contract ABI.

use alloy::dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy::json_abi::Event;
use alloy::primitives::B256;

use super::codec;
use super::contract::ContractDescriptor;
use super::{DecodedEvent, DecodedParam, RawLog};
use crate::error::{Error, Result};

/// Decode a log against the descriptor's event table, selecting the event by
/// the log's first topic.
pub fn decode_log(descriptor: &ContractDescriptor, log: &RawLog) -> Result<DecodedEvent> {
    let signature = log
        .topics
        .first()
        .ok_or_else(|| Error::UnknownEvent("log has no topics".to_string()))?;

    let event = descriptor
        .event_by_topic(signature)
        .ok_or_else(|| Error::UnknownEvent(format!("0x{:x}", signature)))?;

    decode_event(event, log)
}

/// Decode a log as a specific event.
pub fn decode_event(event: &Event, log: &RawLog) -> Result<DecodedEvent> {
    let skip = if event.anonymous { 0 } else { 1 };
    if !event.anonymous && log.topics.first() != Some(&event.selector()) {
        return Err(Error::UnknownEvent(format!(
            "log does not carry the {} signature",
            event.signature()
        )));
    }

    let indexed_count = event.inputs.iter().filter(|p| p.indexed).count();
    if log.topics.len() != skip + indexed_count {
        return Err(Error::MalformedPayload(format!(
            "{} expects {} topics, log has {}",
            event.signature(),
            skip + indexed_count,
            log.topics.len()
        )));
    }

    let mut types = Vec::with_capacity(event.inputs.len());
    for input in &event.inputs {
        let ty: DynSolType = input
            .resolve()
            .map_err(|e| Error::InvalidAbi(format!("event parameter '{}': {}", input.name, e)))?;
        types.push(ty);
    }

    let body_types: Vec<DynSolType> = event
        .inputs
        .iter()
        .zip(&types)
        .filter(|(input, _)| !input.indexed)
        .map(|(_, ty)| ty.clone())
        .collect();
    let mut body = codec::decode_sequence(&body_types, &log.data)?.into_iter();
    let mut topics = log.topics[skip..].iter();

    let mut params = Vec::with_capacity(event.inputs.len());
    for (input, ty) in event.inputs.iter().zip(&types) {
        let value = if input.indexed {
            let topic = topics.next().ok_or_else(|| {
                Error::MalformedPayload(format!("missing topic for '{}'", input.name))
            })?;
            decode_topic(ty, topic)?
        } else {
            body.next().ok_or_else(|| {
                Error::MalformedPayload(format!("missing data for '{}'", input.name))
            })?
        };
        params.push(DecodedParam {
            name: input.name.clone(),
            indexed: input.indexed,
            value,
        });
    }

    tracing::trace!("Decoded event {} with {} parameters", event.name, params.len());

    Ok(DecodedEvent {
        name: event.name.clone(),
        signature: event.signature(),
        params,
        raw: log.clone(),
    })
}

/// Indexed value types are stored left-padded in the topic word; dynamic and
/// composite types are stored as the keccak hash of their encoding, which is
/// returned as-is.
fn decode_topic(ty: &DynSolType, topic: &B256) -> Result<DynSolValue> {
    match ty {
        DynSolType::String
        | DynSolType::Bytes
        | DynSolType::Array(_)
        | DynSolType::FixedArray(..)
        | DynSolType::Tuple(_) => Ok(DynSolValue::FixedBytes(*topic, 32)),
        _ => codec::decode(ty, topic.as_slice()),
    }
}
