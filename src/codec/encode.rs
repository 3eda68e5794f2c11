//! JSON to wire encoding
//!
//! Encoding is driven by the signature: each type code says which JSON shape
//! is accepted and how it is coerced. Integer widths are range checked, except
//! `t` (uint64) which takes negative integers bit for bit.
//!
//! Booleans accept `true`/`false`, numbers (non-zero is true), strings
//! (non-empty is true) and null (false). Arrays and objects are a type
//! mismatch rather than silently false.

use serde_json::Value;

use super::signature::{first_tag, is_string_dict_entry, length_of_one_type, TypeTag};
use super::wire::WireValue;
use crate::error::{BridgeError, Result};

/// Encode `value` as the single complete type at the start of `signature`.
///
/// Returns the wire value and the number of signature characters it consumed.
pub fn encode_one(signature: &str, value: &Value) -> Result<(WireValue, usize)> {
    encode_typed(signature, value, false)
}

/// Encode a message body.
///
/// A JSON array supplies one element per complete type of `signature`; any
/// other value is taken as the only element and must consume the whole
/// signature. Absent data (or null) only matches the empty signature.
pub fn encode_sequence(signature: &str, data: Option<&Value>) -> Result<Vec<WireValue>> {
    match data {
        None | Some(Value::Null) => {
            if signature.is_empty() {
                Ok(Vec::new())
            } else {
                Err(BridgeError::mismatch(
                    format!("values for signature '{signature}'"),
                    "no data",
                ))
            }
        }
        Some(Value::Array(items)) => {
            let mut body = Vec::with_capacity(items.len());
            let mut scan = 0;
            for (index, item) in items.iter().enumerate() {
                if scan == signature.len() {
                    return Err(BridgeError::mismatch(
                        format!("{index} values for signature '{signature}'"),
                        format!("{} values", items.len()),
                    ));
                }
                let (wire, used) = encode_one(&signature[scan..], item)?;
                body.push(wire);
                scan += used;
            }
            if scan != signature.len() {
                return Err(BridgeError::mismatch(
                    format!("values for '{}'", &signature[scan..]),
                    format!("only {} values", items.len()),
                ));
            }
            Ok(body)
        }
        Some(single) => {
            let (wire, used) = encode_one(signature, single)?;
            if used != signature.len() {
                return Err(BridgeError::mismatch(
                    format!("values for '{}'", &signature[used..]),
                    "a single value",
                ));
            }
            Ok(vec![wire])
        }
    }
}

fn encode_typed(signature: &str, value: &Value, in_array: bool) -> Result<(WireValue, usize)> {
    let len = length_of_one_type(signature, in_array, true)?;
    let wire = match first_tag(signature)? {
        TypeTag::Boolean => WireValue::Bool(truthy(value)?),
        TypeTag::Byte => WireValue::Byte(narrow(value, "byte")?),
        TypeTag::Int16 => WireValue::Int16(narrow(value, "int16")?),
        TypeTag::UInt16 => WireValue::UInt16(narrow(value, "uint16")?),
        TypeTag::Int32 => WireValue::Int32(narrow(value, "int32")?),
        TypeTag::UInt32 => WireValue::UInt32(narrow(value, "uint32")?),
        TypeTag::Int64 => WireValue::Int64(narrow(value, "int64")?),
        TypeTag::UInt64 => {
            let n = integer(value)?;
            // negative integers keep their two's complement bit pattern
            let n = u64::try_from(n).unwrap_or(n as i64 as u64);
            WireValue::UInt64(n)
        }
        TypeTag::Double => WireValue::Double(
            value
                .as_f64()
                .ok_or_else(|| BridgeError::mismatch("number", kind(value)))?,
        ),
        TypeTag::String => WireValue::String(text(value)?),
        TypeTag::ObjectPath => WireValue::ObjectPath(text(value)?),
        TypeTag::Signature => WireValue::Signature(text(value)?),
        TypeTag::UnixFd => {
            return Err(BridgeError::mismatch("a supported type", "unix fd in signature"))
        }
        TypeTag::Variant => {
            let inferred = signature_for_json(value)?;
            let (inner, _) = encode_typed(inferred, value, false)?;
            WireValue::variant(inferred, inner)
        }
        TypeTag::Array => {
            let element = &signature[1..len];
            WireValue::Array {
                element: element.to_string(),
                items: encode_array_items(element, value)?,
            }
        }
        TypeTag::StructBegin => {
            WireValue::Struct(encode_sequence(&signature[1..len - 1], Some(value))?)
        }
        TypeTag::DictEntryBegin => {
            let mut fields = encode_sequence(&signature[1..len - 1], Some(value))?.into_iter();
            match (fields.next(), fields.next()) {
                (Some(key), Some(val)) => WireValue::dict_entry(key, val),
                _ => return Err(BridgeError::mismatch("[key, value]", kind(value))),
            }
        }
        tag @ (TypeTag::StructEnd
        | TypeTag::DictEntryEnd
        | TypeTag::Struct
        | TypeTag::DictEntry) => {
            return Err(BridgeError::MalformedSignature(format!(
                "unexpected '{}'",
                tag.as_char()
            )))
        }
    };
    Ok((wire, len))
}

fn encode_array_items(element: &str, value: &Value) -> Result<Vec<WireValue>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| encode_typed(element, item, true).map(|(wire, _)| wire))
            .collect(),
        Value::Object(members) if is_string_dict_entry(element) => {
            let value_signature = &element[2..element.len() - 1];
            members
                .iter()
                .map(|(name, member)| {
                    let (wire, _) = encode_typed(value_signature, member, false)?;
                    Ok(WireValue::dict_entry(WireValue::string(name.as_str()), wire))
                })
                .collect()
        }
        other => Err(BridgeError::mismatch(format!("array of '{element}'"), kind(other))),
    }
}

/// Signature a variant gets from the shape of its JSON value
pub fn signature_for_json(value: &Value) -> Result<&'static str> {
    match value {
        Value::Null => Err(BridgeError::mismatch("a value for a variant", "null")),
        Value::Bool(_) => Ok("b"),
        Value::Number(n) if n.is_f64() => Ok("d"),
        Value::Number(_) => Ok("i"),
        Value::String(_) => Ok("s"),
        Value::Object(_) => Ok("a{sv}"),
        Value::Array(_) => Ok("av"),
    }
}

fn truthy(value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        Value::String(s) => Ok(!s.is_empty()),
        other => Err(BridgeError::mismatch("boolean", kind(other))),
    }
}

fn integer(value: &Value) -> Result<i128> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .ok_or_else(|| BridgeError::mismatch("integer", "number with a fraction")),
        other => Err(BridgeError::mismatch("integer", kind(other))),
    }
}

fn narrow<T: TryFrom<i128>>(value: &Value, target: &'static str) -> Result<T> {
    let n = integer(value)?;
    T::try_from(n).map_err(|_| BridgeError::RangeError {
        value: n.to_string(),
        target,
    })
}

fn text(value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| BridgeError::mismatch("string", kind(value)))
}

pub(crate) fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
