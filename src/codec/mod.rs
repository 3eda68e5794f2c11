//! Signature-driven JSON codec
//!
//! ```text
//! JSON value ──encode_sequence(signature)──▶ [WireValue] ──▶ bus message
//! bus message ──▶ [WireValue] ──decode_body──▶ JSON array
//! ```
//!
//! Both directions share [`signature::length_of_one_type`] as the single
//! definition of what one complete type is.

pub mod decode;
pub mod encode;
pub mod signature;
pub mod wire;

pub use decode::{decode_body, decode_one, decode_sequence};
pub use encode::{encode_one, encode_sequence, signature_for_json};
pub use signature::{length_of_one_type, TypeTag};
pub use wire::{MessageReader, WireValue};
