//! Type signature analysis
//!
//! A signature is a flat string of type codes. [`length_of_one_type`] walks
//! exactly one complete type from the start of a signature and returns how
//! many characters it spans; both codec directions rely on it to know where
//! one element ends and the next begins.

use crate::error::{BridgeError, Result};

/// One type code of a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Variant,
    Array,
    StructBegin,
    StructEnd,
    DictEntryBegin,
    DictEntryEnd,
    /// `r`, only meaningful in bus introspection, never in a signature
    Struct,
    /// `e`, only meaningful in bus introspection, never in a signature
    DictEntry,
}

impl TypeTag {
    pub fn from_byte(code: u8) -> Option<Self> {
        let tag = match code {
            b'y' => TypeTag::Byte,
            b'b' => TypeTag::Boolean,
            b'n' => TypeTag::Int16,
            b'q' => TypeTag::UInt16,
            b'i' => TypeTag::Int32,
            b'u' => TypeTag::UInt32,
            b'x' => TypeTag::Int64,
            b't' => TypeTag::UInt64,
            b'd' => TypeTag::Double,
            b's' => TypeTag::String,
            b'o' => TypeTag::ObjectPath,
            b'g' => TypeTag::Signature,
            b'h' => TypeTag::UnixFd,
            b'v' => TypeTag::Variant,
            b'a' => TypeTag::Array,
            b'(' => TypeTag::StructBegin,
            b')' => TypeTag::StructEnd,
            b'{' => TypeTag::DictEntryBegin,
            b'}' => TypeTag::DictEntryEnd,
            b'r' => TypeTag::Struct,
            b'e' => TypeTag::DictEntry,
            _ => return None,
        };
        Some(tag)
    }

    pub fn as_char(self) -> char {
        match self {
            TypeTag::Byte => 'y',
            TypeTag::Boolean => 'b',
            TypeTag::Int16 => 'n',
            TypeTag::UInt16 => 'q',
            TypeTag::Int32 => 'i',
            TypeTag::UInt32 => 'u',
            TypeTag::Int64 => 'x',
            TypeTag::UInt64 => 't',
            TypeTag::Double => 'd',
            TypeTag::String => 's',
            TypeTag::ObjectPath => 'o',
            TypeTag::Signature => 'g',
            TypeTag::UnixFd => 'h',
            TypeTag::Variant => 'v',
            TypeTag::Array => 'a',
            TypeTag::StructBegin => '(',
            TypeTag::StructEnd => ')',
            TypeTag::DictEntryBegin => '{',
            TypeTag::DictEntryEnd => '}',
            TypeTag::Struct => 'r',
            TypeTag::DictEntry => 'e',
        }
    }

    /// Basic types are the ones allowed as dictionary keys
    pub fn is_basic(self) -> bool {
        matches!(
            self,
            TypeTag::Byte
                | TypeTag::Boolean
                | TypeTag::Int16
                | TypeTag::UInt16
                | TypeTag::Int32
                | TypeTag::UInt32
                | TypeTag::Int64
                | TypeTag::UInt64
                | TypeTag::Double
                | TypeTag::String
                | TypeTag::ObjectPath
                | TypeTag::Signature
                | TypeTag::UnixFd
        )
    }
}

/// Tag of the first type code of `signature`
pub fn first_tag(signature: &str) -> Result<TypeTag> {
    let code = *signature
        .as_bytes()
        .first()
        .ok_or_else(|| BridgeError::MalformedSignature("unexpected end of signature".into()))?;
    TypeTag::from_byte(code).ok_or_else(|| {
        BridgeError::MalformedSignature(format!("unknown type code '{}'", code as char))
    })
}

/// Length in characters of the single complete type at the start of `signature`.
///
/// `allow_dict` is true only directly under an array, where a dict entry may
/// appear. `allow_compound` is false for dict entry keys, which must be basic.
pub fn length_of_one_type(signature: &str, allow_dict: bool, allow_compound: bool) -> Result<usize> {
    let tag = first_tag(signature)?;
    match tag {
        TypeTag::Array => {
            if !allow_compound {
                return Err(out_of_context(tag, signature));
            }
            Ok(1 + length_of_one_type(&signature[1..], true, true)?)
        }
        TypeTag::StructBegin => {
            if !allow_compound {
                return Err(out_of_context(tag, signature));
            }
            let mut len = 1;
            loop {
                match signature.as_bytes().get(len) {
                    None => {
                        return Err(BridgeError::MalformedSignature(format!(
                            "unterminated struct in '{signature}'"
                        )))
                    }
                    Some(b')') if len == 1 => {
                        return Err(BridgeError::MalformedSignature("empty struct".into()))
                    }
                    Some(b')') => return Ok(len + 1),
                    Some(_) => len += length_of_one_type(&signature[len..], false, true)?,
                }
            }
        }
        TypeTag::DictEntryBegin => {
            if !allow_compound || !allow_dict {
                return Err(out_of_context(tag, signature));
            }
            let key = length_of_one_type(&signature[1..], false, false)?;
            let value = length_of_one_type(&signature[1 + key..], false, true)?;
            let end = 1 + key + value;
            if signature.as_bytes().get(end) != Some(&b'}') {
                return Err(BridgeError::MalformedSignature(format!(
                    "dict entry in '{signature}' must hold exactly one key and one value"
                )));
            }
            Ok(end + 1)
        }
        TypeTag::Variant => {
            if !allow_compound {
                return Err(out_of_context(tag, signature));
            }
            Ok(1)
        }
        TypeTag::StructEnd | TypeTag::DictEntryEnd | TypeTag::Struct | TypeTag::DictEntry => {
            Err(out_of_context(tag, signature))
        }
        _ => Ok(1),
    }
}

fn out_of_context(tag: TypeTag, signature: &str) -> BridgeError {
    BridgeError::MalformedSignature(format!(
        "type code '{}' not allowed here in '{signature}'",
        tag.as_char()
    ))
}

/// Whether an array element signature is a string-keyed dict entry (`{s...}`)
pub fn is_string_dict_entry(element: &str) -> bool {
    element.starts_with("{s")
}
