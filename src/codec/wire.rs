//! Wire values
//!
//! The bus's own type system, one variant per type code. These only live
//! between the codec and the bus connection; nothing stores them.

use super::signature::TypeTag;

/// A value in the bus's binary type system
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    /// Array with the signature of its element type
    Array {
        element: String,
        items: Vec<WireValue>,
    },
    Struct(Vec<WireValue>),
    DictEntry(Box<WireValue>, Box<WireValue>),
    /// Variant with the signature of the contained value
    Variant {
        signature: String,
        value: Box<WireValue>,
    },
}

impl WireValue {
    pub fn string(s: impl Into<String>) -> Self {
        WireValue::String(s.into())
    }

    pub fn variant(signature: impl Into<String>, value: WireValue) -> Self {
        WireValue::Variant {
            signature: signature.into(),
            value: Box::new(value),
        }
    }

    pub fn dict_entry(key: WireValue, value: WireValue) -> Self {
        WireValue::DictEntry(Box::new(key), Box::new(value))
    }

    pub fn tag(&self) -> TypeTag {
        match self {
            WireValue::Byte(_) => TypeTag::Byte,
            WireValue::Bool(_) => TypeTag::Boolean,
            WireValue::Int16(_) => TypeTag::Int16,
            WireValue::UInt16(_) => TypeTag::UInt16,
            WireValue::Int32(_) => TypeTag::Int32,
            WireValue::UInt32(_) => TypeTag::UInt32,
            WireValue::Int64(_) => TypeTag::Int64,
            WireValue::UInt64(_) => TypeTag::UInt64,
            WireValue::Double(_) => TypeTag::Double,
            WireValue::String(_) => TypeTag::String,
            WireValue::ObjectPath(_) => TypeTag::ObjectPath,
            WireValue::Signature(_) => TypeTag::Signature,
            WireValue::Array { .. } => TypeTag::Array,
            WireValue::Struct(_) => TypeTag::StructBegin,
            WireValue::DictEntry(..) => TypeTag::DictEntryBegin,
            WireValue::Variant { .. } => TypeTag::Variant,
        }
    }

    /// Complete signature of this value
    pub fn signature(&self) -> String {
        match self {
            WireValue::Array { element, .. } => format!("a{element}"),
            WireValue::Struct(fields) => {
                let inner: String = fields.iter().map(WireValue::signature).collect();
                format!("({inner})")
            }
            WireValue::DictEntry(key, value) => {
                format!("{{{}{}}}", key.signature(), value.signature())
            }
            other => other.tag().as_char().to_string(),
        }
    }
}

/// Read cursor over the values of a message body or container
#[derive(Debug, Clone)]
pub struct MessageReader<'a> {
    values: &'a [WireValue],
    position: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(values: &'a [WireValue]) -> Self {
        Self { values, position: 0 }
    }

    /// Next value, `None` at the end of the message
    pub fn next_value(&mut self) -> Option<&'a WireValue> {
        let value = self.values.get(self.position)?;
        self.position += 1;
        Some(value)
    }
}
