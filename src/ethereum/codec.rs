//! ABI encoding of function calls and decoding of return values and log data.
//!
//! Values are represented with alloy's dynamic ABI model so that any ABI loaded
//! at runtime can be driven without compile-time bindings.

use alloy::dyn_abi::{DynSolType, DynSolValue, FunctionExt, JsonAbiExt, Specifier, Word};
use alloy::json_abi::{Function, JsonAbi, Param};
use alloy::primitives::{Address, Bytes, I256, U256};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A function name together with its ordered, typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<DynSolValue>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Vec<DynSolValue>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Resolve the ABI types of a parameter list.
pub fn param_types(params: &[Param]) -> Result<Vec<DynSolType>> {
    params
        .iter()
        .map(|p| {
            p.resolve()
                .map_err(|e| Error::InvalidAbi(format!("parameter '{}': {}", p.name, e)))
        })
        .collect()
}

fn function_candidates<'a>(abi: &'a JsonAbi, name: &str) -> Result<&'a [Function]> {
    abi.function(name).map(|f| f.as_slice()).ok_or_else(|| {
        let available: Vec<&str> = abi.functions().map(|f| f.name.as_str()).collect();
        Error::UnknownFunction {
            name: name.to_string(),
            available: if available.is_empty() {
                "none".to_string()
            } else {
                available.join(", ")
            },
        }
    })
}

fn arities(candidates: &[Function]) -> String {
    let mut counts: Vec<String> = candidates
        .iter()
        .map(|f| f.inputs.len().to_string())
        .collect();
    counts.sort();
    counts.dedup();
    counts.join(" or ")
}

fn type_name(value: &DynSolValue) -> String {
    value
        .as_type()
        .map(|t| t.sol_type_name().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Find the ABI function matching `call` by name, then arity, then argument types.
pub fn resolve_function<'a>(abi: &'a JsonAbi, call: &FunctionCall) -> Result<&'a Function> {
    let candidates = function_candidates(abi, &call.name)?;

    let same_arity: Vec<&Function> = candidates
        .iter()
        .filter(|f| f.inputs.len() == call.args.len())
        .collect();
    if same_arity.is_empty() {
        return Err(Error::ArgumentCountMismatch {
            function: call.name.clone(),
            expected: arities(candidates),
            got: call.args.len(),
        });
    }

    let mut first_mismatch = None;
    for function in same_arity {
        let types = param_types(&function.inputs)?;
        let mismatch = types
            .iter()
            .zip(&call.args)
            .enumerate()
            .find_map(|(i, (ty, value))| {
                if !ty.matches(value) {
                    Some((i, type_name(value)))
                } else {
                    check_width(value).err().map(|e| (i, e))
                }
            });
        match mismatch {
            None => return Ok(function),
            Some((i, got)) if first_mismatch.is_none() => {
                first_mismatch = Some(Error::ArgumentTypeMismatch {
                    function: function.signature(),
                    position: i + 1,
                    expected: types[i].sol_type_name().into_owned(),
                    got,
                });
            }
            Some(_) => {}
        }
    }

    Err(first_mismatch.unwrap_or_else(|| Error::ArgumentCountMismatch {
        function: call.name.clone(),
        expected: arities(candidates),
        got: call.args.len(),
    }))
}

/// Integers must fit the bit width they carry, inside arrays and tuples too.
fn check_width(value: &DynSolValue) -> std::result::Result<(), String> {
    match value {
        DynSolValue::Uint(num, bits) if *bits < 256 && num.bit_len() > *bits => {
            Err(format!("value {} does not fit in uint{}", num, bits))
        }
        DynSolValue::Int(num, bits) if *bits < 256 && num.bits() as usize > *bits => {
            Err(format!("value {} does not fit in int{}", num, bits))
        }
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            items.iter().try_for_each(check_width)
        }
        _ => Ok(()),
    }
}

/// Reject decoded values whose words were not canonically padded: narrow
/// integers with stray high bits, bools other than 0 or 1, addresses with
/// dirty high bytes. Statically sized members are re-encoded and compared
/// against the head words they were read from.
fn ensure_canonical(types: &[DynSolType], values: &[DynSolValue], data: &[u8]) -> Result<()> {
    let mut offset = 0;
    for (ty, value) in types.iter().zip(values) {
        check_width(value).map_err(|e| {
            Error::MalformedPayload(format!("{}: {}", ty.sol_type_name(), e))
        })?;
        match static_words(ty) {
            Some(words) => {
                let end = offset + words * 32;
                if data.get(offset..end) != Some(value.abi_encode().as_slice()) {
                    return Err(Error::MalformedPayload(format!(
                        "{} is not canonically padded",
                        ty.sol_type_name()
                    )));
                }
                offset = end;
            }
            None => offset += 32,
        }
    }
    Ok(())
}

/// Encode a call as selector followed by the positional argument encoding.
pub fn encode(abi: &JsonAbi, call: &FunctionCall) -> Result<Bytes> {
    let function = resolve_function(abi, call)?;
    encode_with(function, &call.args)
}

pub fn encode_with(function: &Function, args: &[DynSolValue]) -> Result<Bytes> {
    let encoded = function
        .abi_encode_input(args)
        .map_err(|e| Error::ArgumentTypeMismatch {
            function: function.signature(),
            position: 0,
            expected: function.signature(),
            got: e.to_string(),
        })?;
    Ok(encoded.into())
}

/// Build a typed call from JSON parameters, either positional (array) or
/// named (object keyed by parameter name).
pub fn call_from_json(abi: &JsonAbi, name: &str, parameters: &Value) -> Result<FunctionCall> {
    let candidates = function_candidates(abi, name)?;

    let given = match parameters {
        Value::Null => 0,
        Value::Array(items) => items.len(),
        Value::Object(fields) => fields.len(),
        other => {
            return Err(Error::ArgumentTypeMismatch {
                function: name.to_string(),
                position: 0,
                expected: "array or object of parameters".to_string(),
                got: other.to_string(),
            })
        }
    };

    let mut last_error = None;
    for function in candidates.iter().filter(|f| f.inputs.len() == given) {
        match args_from_json(function, parameters) {
            Ok(args) => return Ok(FunctionCall::new(name, args)),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| Error::ArgumentCountMismatch {
        function: name.to_string(),
        expected: arities(candidates),
        got: given,
    }))
}

fn args_from_json(function: &Function, parameters: &Value) -> Result<Vec<DynSolValue>> {
    let types = param_types(&function.inputs)?;
    let mismatch = |i: usize, e: String| Error::ArgumentTypeMismatch {
        function: function.signature(),
        position: i + 1,
        expected: types[i].sol_type_name().into_owned(),
        got: e,
    };

    let mut args = Vec::with_capacity(types.len());
    for (i, (input, ty)) in function.inputs.iter().zip(&types).enumerate() {
        let value = match parameters {
            Value::Array(items) => &items[i],
            Value::Object(fields) => fields
                .get(&input.name)
                .ok_or_else(|| mismatch(i, format!("missing parameter '{}'", input.name)))?,
            _ => &Value::Null,
        };
        args.push(json_to_value(value, ty).map_err(|e| mismatch(i, e))?);
    }
    Ok(args)
}

/// Number of 32-byte words a statically sized type occupies, `None` for
/// dynamic types.
fn static_words(ty: &DynSolType) -> Option<usize> {
    match ty {
        DynSolType::Bool
        | DynSolType::Int(_)
        | DynSolType::Uint(_)
        | DynSolType::FixedBytes(_)
        | DynSolType::Address
        | DynSolType::Function => Some(1),
        DynSolType::FixedArray(inner, len) => static_words(inner).map(|w| w * len),
        DynSolType::Tuple(inner) => inner
            .iter()
            .map(static_words)
            .try_fold(0, |acc, w| w.map(|w| acc + w)),
        _ => None,
    }
}

/// Decode a single value. Fixed-width types must match their width exactly;
/// dynamic types must contain at least the length their prefix declares.
pub fn decode(ty: &DynSolType, data: &[u8]) -> Result<DynSolValue> {
    if let Some(words) = static_words(ty) {
        if data.len() != words * 32 {
            return Err(Error::MalformedPayload(format!(
                "{} requires {} bytes, got {}",
                ty.sol_type_name(),
                words * 32,
                data.len()
            )));
        }
    }

    let value = ty
        .abi_decode(data)
        .map_err(|e| Error::MalformedPayload(format!("{}: {}", ty.sol_type_name(), e)))?;
    ensure_canonical(std::slice::from_ref(ty), std::slice::from_ref(&value), data)?;
    Ok(value)
}

/// Decode a sequence of values encoded back to back, as in function outputs
/// and the data section of a log.
pub fn decode_sequence(types: &[DynSolType], data: &[u8]) -> Result<Vec<DynSolValue>> {
    if types.is_empty() {
        return Ok(Vec::new());
    }

    let tuple = DynSolType::Tuple(types.to_vec());
    if let Some(words) = static_words(&tuple) {
        if data.len() != words * 32 {
            return Err(Error::MalformedPayload(format!(
                "{} requires {} bytes, got {}",
                tuple.sol_type_name(),
                words * 32,
                data.len()
            )));
        }
    }

    let values = match tuple.abi_decode_params(data) {
        Ok(DynSolValue::Tuple(values)) => values,
        Ok(other) => vec![other],
        Err(e) => {
            return Err(Error::MalformedPayload(format!(
                "{}: {}",
                tuple.sol_type_name(),
                e
            )))
        }
    };
    ensure_canonical(types, &values, data)?;
    Ok(values)
}

/// Decode the return data of a function call.
pub fn decode_output(function: &Function, data: &[u8]) -> Result<Vec<DynSolValue>> {
    if function.outputs.is_empty() {
        return Ok(Vec::new());
    }
    let values = function
        .abi_decode_output(data, false)
        .map_err(|e| Error::MalformedPayload(format!("output of {}: {}", function.signature(), e)))?;
    ensure_canonical(&param_types(&function.outputs)?, &values, data)?;
    Ok(values)
}

/// Convert a JSON value to a `DynSolValue` of the given Solidity type.
pub fn json_to_value(value: &Value, ty: &DynSolType) -> std::result::Result<DynSolValue, String> {
    match ty {
        DynSolType::Address => {
            let s = value.as_str().ok_or("address must be a string")?;
            let address = Address::from_str(s).map_err(|e| format!("invalid address: {}", e))?;
            Ok(DynSolValue::Address(address))
        }
        DynSolType::Uint(bits) => {
            let num = match value {
                Value::Number(n) => n
                    .as_u64()
                    .map(U256::from)
                    .ok_or_else(|| format!("invalid uint value: {}", n))?,
                Value::String(s) => {
                    super::utils::parse_amount(s).map_err(|e| e.to_string())?
                }
                _ => return Err("uint must be a number or string".to_string()),
            };
            let value = DynSolValue::Uint(num, *bits);
            check_width(&value)?;
            Ok(value)
        }
        DynSolType::Int(bits) => {
            let num = match value {
                Value::Number(n) => I256::from_str(&n.to_string())
                    .map_err(|_| format!("invalid int value: {}", n))?,
                Value::String(s) => {
                    I256::from_str(s).map_err(|_| format!("invalid int string: {}", s))?
                }
                _ => return Err("int must be a number or string".to_string()),
            };
            let value = DynSolValue::Int(num, *bits);
            check_width(&value)?;
            Ok(value)
        }
        DynSolType::String => {
            let s = value.as_str().ok_or("string parameter must be a string")?;
            Ok(DynSolValue::String(s.to_string()))
        }
        DynSolType::Bool => {
            let b = value.as_bool().ok_or("bool parameter must be a boolean")?;
            Ok(DynSolValue::Bool(b))
        }
        DynSolType::FixedBytes(size) => {
            let hex_str = value.as_str().ok_or("bytes must be a hex string")?;
            let bytes = hex::decode(hex_str.trim_start_matches("0x"))
                .map_err(|_| format!("invalid hex string: {}", hex_str))?;
            if bytes.len() != *size {
                return Err(format!("expected {} bytes, got {}", size, bytes.len()));
            }
            let mut word = [0u8; 32];
            word[..bytes.len()].copy_from_slice(&bytes);
            Ok(DynSolValue::FixedBytes(Word::from(word), *size))
        }
        DynSolType::Bytes => {
            let hex_str = value.as_str().ok_or("bytes must be a hex string")?;
            let bytes = hex::decode(hex_str.trim_start_matches("0x"))
                .map_err(|_| format!("invalid hex string: {}", hex_str))?;
            Ok(DynSolValue::Bytes(bytes))
        }
        DynSolType::Array(inner) => {
            let items = value.as_array().ok_or("array parameter must be an array")?;
            let values = items
                .iter()
                .map(|item| json_to_value(item, inner))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(DynSolValue::Array(values))
        }
        DynSolType::FixedArray(inner, len) => {
            let items = value.as_array().ok_or("array parameter must be an array")?;
            if items.len() != *len {
                return Err(format!("expected {} elements, got {}", len, items.len()));
            }
            let values = items
                .iter()
                .map(|item| json_to_value(item, inner))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(DynSolValue::FixedArray(values))
        }
        DynSolType::Tuple(inner) => {
            let items = value.as_array().ok_or("tuple parameter must be an array")?;
            if items.len() != inner.len() {
                return Err(format!("expected {} elements, got {}", inner.len(), items.len()));
            }
            let values = items
                .iter()
                .zip(inner)
                .map(|(item, ty)| json_to_value(item, ty))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(DynSolValue::Tuple(values))
        }
        other => Err(format!("unsupported Solidity type: {}", other.sol_type_name())),
    }
}

/// Convert a `DynSolValue` to JSON. Integers are rendered as decimal strings.
pub fn value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Address(addr) => Value::String(addr.to_string()),
        DynSolValue::Uint(num, _) => Value::String(num.to_string()),
        DynSolValue::Int(num, _) => Value::String(num.to_string()),
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..*size])))
        }
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(value_to_json).collect())
        }
        other => Value::String(format!("{:?}", other)),
    }
}

/// Render several values: a single value is returned as-is, several as an array.
pub fn values_to_json(values: &[DynSolValue]) -> Value {
    match values {
        [] => Value::Null,
        [single] => value_to_json(single),
        many => Value::Array(many.iter().map(value_to_json).collect()),
    }
}
