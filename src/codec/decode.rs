//! Wire to JSON decoding
//!
//! Decoding needs no signature: the wire values carry their own types.
//! Arrays of string-keyed dict entries become JSON objects, every other
//! container (struct, dict entry, variant, plain array) becomes a JSON array.

use serde_json::{Map, Value};

use super::signature::is_string_dict_entry;
use super::wire::{MessageReader, WireValue};
use crate::error::{BridgeError, Result};

/// Decode the next value of `reader`, `None` at the end of the message
pub fn decode_one(reader: &mut MessageReader<'_>) -> Result<Option<Value>> {
    match reader.next_value() {
        Some(wire) => decode_value(wire).map(Some),
        None => Ok(None),
    }
}

/// Decode every remaining value of `reader` into a JSON array
pub fn decode_sequence(reader: &mut MessageReader<'_>) -> Result<Value> {
    let mut values = Vec::new();
    while let Some(value) = decode_one(reader)? {
        values.push(value);
    }
    Ok(Value::Array(values))
}

/// Decode a whole message body
pub fn decode_body(body: &[WireValue]) -> Result<Value> {
    decode_sequence(&mut MessageReader::new(body))
}

fn decode_value(wire: &WireValue) -> Result<Value> {
    let value = match wire {
        WireValue::Byte(n) => Value::from(*n),
        WireValue::Bool(b) => Value::Bool(*b),
        WireValue::Int16(n) => Value::from(*n),
        WireValue::UInt16(n) => Value::from(*n),
        WireValue::Int32(n) => Value::from(*n),
        WireValue::UInt32(n) => Value::from(*n),
        WireValue::Int64(n) => Value::from(*n),
        WireValue::UInt64(n) => Value::from(*n),
        // NaN and infinities have no JSON form and decode to null
        WireValue::Double(f) => Value::from(*f),
        WireValue::String(s) | WireValue::ObjectPath(s) | WireValue::Signature(s) => {
            Value::String(s.clone())
        }
        WireValue::Array { element, items } if is_string_dict_entry(element) => {
            let mut object = Map::with_capacity(items.len());
            for item in items {
                match item {
                    WireValue::DictEntry(key, value) => match key.as_ref() {
                        WireValue::String(name) => {
                            object.insert(name.clone(), decode_value(value)?);
                        }
                        other => {
                            return Err(BridgeError::MalformedWireData(format!(
                                "dictionary key of type '{}' where a string was announced",
                                other.signature()
                            )))
                        }
                    },
                    other => {
                        return Err(BridgeError::MalformedWireData(format!(
                            "'{}' inside a dictionary",
                            other.signature()
                        )))
                    }
                }
            }
            Value::Object(object)
        }
        WireValue::Array { items, .. } | WireValue::Struct(items) => decode_all(items)?,
        WireValue::DictEntry(key, value) => {
            Value::Array(vec![decode_value(key)?, decode_value(value)?])
        }
        WireValue::Variant { value, .. } => Value::Array(vec![decode_value(value)?]),
    };
    Ok(value)
}

fn decode_all(items: &[WireValue]) -> Result<Value> {
    items
        .iter()
        .map(decode_value)
        .collect::<Result<Vec<_>>>()
        .map(Value::Array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars() {
        let body = [
            WireValue::Byte(7),
            WireValue::Bool(false),
            WireValue::UInt32(u32::MAX),
            WireValue::UInt64(u64::MAX),
            WireValue::Double(0.1),
            WireValue::ObjectPath("/a/b".into()),
        ];
        assert_eq!(
            decode_body(&body).unwrap(),
            json!([7, false, 4294967295u32, u64::MAX, 0.1, "/a/b"])
        );
    }

    #[test]
    fn test_end_of_message() {
        let body = [WireValue::Int16(-2)];
        let mut reader = MessageReader::new(&body);
        assert_eq!(decode_one(&mut reader).unwrap(), Some(json!(-2)));
        assert_eq!(decode_one(&mut reader).unwrap(), None);
        assert_eq!(decode_body(&[]).unwrap(), json!([]));
    }

    #[test]
    fn test_containers() {
        let body = [
            WireValue::Struct(vec![WireValue::Int32(1), WireValue::string("x")]),
            WireValue::variant("s", WireValue::string("inner")),
            WireValue::Array {
                element: "{ub}".into(),
                items: vec![WireValue::dict_entry(WireValue::UInt32(3), WireValue::Bool(true))],
            },
        ];
        assert_eq!(
            decode_body(&body).unwrap(),
            json!([[1, "x"], ["inner"], [[3, true]]])
        );
    }

    #[test]
    fn test_string_dict() {
        let body = [WireValue::Array {
            element: "{sv}".into(),
            items: vec![WireValue::dict_entry(
                WireValue::string("level"),
                WireValue::variant("i", WireValue::Int32(3)),
            )],
        }];
        assert_eq!(decode_body(&body).unwrap(), json!([{"level": [3]}]));
    }

    #[test]
    fn test_malformed_dict_discards_everything() {
        let body = [
            WireValue::string("before"),
            WireValue::Array {
                element: "{si}".into(),
                items: vec![WireValue::Int32(1)],
            },
        ];
        assert!(matches!(
            decode_body(&body),
            Err(BridgeError::MalformedWireData(_))
        ));
    }
}
