//! zbus-backed bus connections
//!
//! `user` maps to the session bus and `system` to the system bus. Wire values
//! are converted to zvariant values right before sending and back right after
//! receiving; the codec never sees zvariant types.

use std::rc::Rc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, warn};
use zbus::message::Type as MessageType;
use zbus::zvariant::{self, Array, Dict, ObjectPath, Signature, StructureBuilder, Value};
use zbus::{MatchRule, MessageStream};

use super::{
    BusClass, BusConnection, BusFault, BusProvider, CallOutcome, InboundMessage, MatchSlot,
    OutgoingMessage, SignalSink,
};
use crate::codec::{length_of_one_type, WireValue};
use crate::error::{BridgeError, Result};

/// Provider of real system and session bus connections
#[derive(Debug, Default, Clone, Copy)]
pub struct DbusProvider;

#[async_trait(?Send)]
impl BusProvider for DbusProvider {
    async fn connect(&self, class: BusClass) -> Result<Rc<dyn BusConnection>> {
        let connection = match class {
            BusClass::User => zbus::Connection::session().await,
            BusClass::System => zbus::Connection::system().await,
        }
        .map_err(|e| BridgeError::ConnectionError {
            bus: class.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Rc::new(DbusConnection { class, connection }))
    }
}

/// One zbus connection
pub struct DbusConnection {
    class: BusClass,
    connection: zbus::Connection,
}

#[async_trait(?Send)]
impl BusConnection for DbusConnection {
    fn class(&self) -> BusClass {
        self.class
    }

    async fn call_method(&self, message: OutgoingMessage) -> Result<CallOutcome> {
        let body = body_structure(&message.body)?;
        let reply = match &body {
            Some(body) => {
                self.connection
                    .call_method(
                        message.destination.as_deref(),
                        message.path.as_str(),
                        message.interface.as_deref(),
                        message.member.as_str(),
                        body,
                    )
                    .await
            }
            None => {
                self.connection
                    .call_method(
                        message.destination.as_deref(),
                        message.path.as_str(),
                        message.interface.as_deref(),
                        message.member.as_str(),
                        &(),
                    )
                    .await
            }
        };

        match reply {
            Ok(reply) => Ok(CallOutcome::Return(message_body(&reply)?)),
            Err(zbus::Error::MethodError(name, text, _)) => Ok(CallOutcome::Error(BusFault::new(
                name.as_str(),
                text.unwrap_or_default(),
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn emit_signal(&self, message: OutgoingMessage) -> Result<()> {
        let interface = message
            .interface
            .as_deref()
            .ok_or_else(|| BridgeError::BusApi("signals need an interface".into()))?;
        let body = body_structure(&message.body)?;
        match &body {
            Some(body) => {
                self.connection
                    .emit_signal(
                        message.destination.as_deref(),
                        message.path.as_str(),
                        interface,
                        message.member.as_str(),
                        body,
                    )
                    .await?
            }
            None => {
                self.connection
                    .emit_signal(
                        message.destination.as_deref(),
                        message.path.as_str(),
                        interface,
                        message.member.as_str(),
                        &(),
                    )
                    .await?
            }
        }
        Ok(())
    }

    async fn add_match(&self, rule: &str, sink: SignalSink) -> Result<MatchSlot> {
        let parsed = MatchRule::try_from(rule)
            .map_err(|e| BridgeError::BusApi(format!("invalid match rule '{rule}': {e}")))?;
        let mut stream = MessageStream::for_match_rule(parsed, &self.connection, None).await?;
        let class = self.class;
        let owned_rule = rule.to_string();

        let forwarder = tokio::task::spawn_local(async move {
            while let Some(next) = stream.next().await {
                match next.and_then(|message| inbound(&message).map_err(zbus::Error::Failure)) {
                    Ok(message) => sink(message),
                    Err(e) => warn!(bus = %class, rule = %owned_rule, error = %e, "Dropping undecodable message"),
                }
            }
            debug!(bus = %class, rule = %owned_rule, "Match stream ended");
        });

        // Aborting drops the stream, which removes the rule from the bus
        Ok(MatchSlot::new(move || forwarder.abort()))
    }
}

fn inbound(message: &zbus::Message) -> std::result::Result<InboundMessage, String> {
    let header = message.header();
    let error = match message.message_type() {
        MessageType::Error => Some(BusFault::new(
            header.error_name().map(|n| n.to_string()).unwrap_or_default(),
            message.body().deserialize::<String>().unwrap_or_default(),
        )),
        _ => None,
    };
    let body = if error.is_some() {
        Vec::new()
    } else {
        message_body(message).map_err(|e| e.to_string())?
    };
    Ok(InboundMessage {
        sender: header.sender().map(|s| s.to_string()),
        path: header.path().map(|p| p.to_string()),
        interface: header.interface().map(|i| i.to_string()),
        member: header.member().map(|m| m.to_string()),
        body,
        error,
    })
}

fn message_body(message: &zbus::Message) -> Result<Vec<WireValue>> {
    let signature = match message.header().signature() {
        Some(signature) if !signature.as_str().is_empty() => signature.as_str().to_string(),
        _ => return Ok(Vec::new()),
    };
    let body = message.body();
    let fields: zvariant::Structure<'_> = body.deserialize()?;
    let values = fields.fields().iter().map(from_value).collect::<Result<Vec<_>>>()?;

    // A body made of one struct is deserialized as that struct's fields
    let single_struct = signature.starts_with('(')
        && length_of_one_type(&signature, false, true)? == signature.len();
    if single_struct {
        return Ok(vec![WireValue::Struct(values)]);
    }
    Ok(values)
}

/// Outgoing body as one structure whose fields are the arguments
fn body_structure(body: &[WireValue]) -> Result<Option<zvariant::Structure<'static>>> {
    if body.is_empty() {
        return Ok(None);
    }
    let mut builder = StructureBuilder::new();
    for value in body {
        builder = builder.append_field(to_value(value)?);
    }
    Ok(Some(builder.build()))
}

fn signature(text: &str) -> Result<Signature<'static>> {
    Signature::try_from(text.to_string())
        .map_err(|e| BridgeError::BusApi(format!("invalid signature '{text}': {e}")))
}

fn to_value(wire: &WireValue) -> Result<Value<'static>> {
    let value = match wire {
        WireValue::Byte(n) => Value::U8(*n),
        WireValue::Bool(b) => Value::Bool(*b),
        WireValue::Int16(n) => Value::I16(*n),
        WireValue::UInt16(n) => Value::U16(*n),
        WireValue::Int32(n) => Value::I32(*n),
        WireValue::UInt32(n) => Value::U32(*n),
        WireValue::Int64(n) => Value::I64(*n),
        WireValue::UInt64(n) => Value::U64(*n),
        WireValue::Double(f) => Value::F64(*f),
        WireValue::String(s) => Value::from(s.clone()),
        WireValue::ObjectPath(p) => Value::ObjectPath(
            ObjectPath::try_from(p.clone())
                .map_err(|e| BridgeError::BusApi(format!("invalid object path '{p}': {e}")))?,
        ),
        WireValue::Signature(s) => Value::Signature(signature(s)?),
        WireValue::Array { element, items } if element.starts_with('{') => {
            let key = &element[1..2];
            let mut dict = Dict::new(signature(key)?, signature(&element[2..element.len() - 1])?);
            for item in items {
                match item {
                    WireValue::DictEntry(k, v) => dict
                        .append(to_value(k)?, to_value(v)?)
                        .map_err(|e| BridgeError::BusApi(e.to_string()))?,
                    other => {
                        return Err(BridgeError::BusApi(format!(
                            "'{}' inside a dictionary",
                            other.signature()
                        )))
                    }
                }
            }
            Value::Dict(dict)
        }
        WireValue::Array { element, items } => {
            let mut array = Array::new(signature(element)?);
            for item in items {
                array
                    .append(to_value(item)?)
                    .map_err(|e| BridgeError::BusApi(e.to_string()))?;
            }
            Value::Array(array)
        }
        WireValue::Struct(fields) => {
            let mut builder = StructureBuilder::new();
            for field in fields {
                builder = builder.append_field(to_value(field)?);
            }
            Value::Structure(builder.build())
        }
        WireValue::DictEntry(..) => {
            return Err(BridgeError::BusApi("dict entry outside of an array".into()))
        }
        WireValue::Variant { value, .. } => Value::Value(Box::new(to_value(value)?)),
    };
    Ok(value)
}

fn from_value(value: &Value<'_>) -> Result<WireValue> {
    let wire = match value {
        Value::U8(n) => WireValue::Byte(*n),
        Value::Bool(b) => WireValue::Bool(*b),
        Value::I16(n) => WireValue::Int16(*n),
        Value::U16(n) => WireValue::UInt16(*n),
        Value::I32(n) => WireValue::Int32(*n),
        Value::U32(n) => WireValue::UInt32(*n),
        Value::I64(n) => WireValue::Int64(*n),
        Value::U64(n) => WireValue::UInt64(*n),
        Value::F64(f) => WireValue::Double(*f),
        Value::Str(s) => WireValue::String(s.to_string()),
        Value::Signature(s) => WireValue::Signature(s.to_string()),
        Value::ObjectPath(p) => WireValue::ObjectPath(p.to_string()),
        Value::Value(inner) => WireValue::variant(inner.value_signature().to_string(), from_value(inner)?),
        Value::Array(array) => WireValue::Array {
            element: array.element_signature().to_string(),
            items: array.iter().map(from_value).collect::<Result<_>>()?,
        },
        Value::Dict(dict) => {
            let full = value.value_signature().to_string();
            let items = dict
                .iter()
                .map(|(k, v)| Ok(WireValue::dict_entry(from_value(k)?, from_value(v)?)))
                .collect::<Result<_>>()?;
            WireValue::Array {
                element: full.trim_start_matches('a').to_string(),
                items,
            }
        }
        Value::Structure(structure) => {
            WireValue::Struct(structure.fields().iter().map(from_value).collect::<Result<_>>()?)
        }
        #[allow(unreachable_patterns)]
        other => {
            return Err(BridgeError::MalformedWireData(format!(
                "unsupported value of type '{}'",
                other.value_signature()
            )))
        }
    };
    Ok(wire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_body, encode_sequence};
    use serde_json::{json, Value as Json};
    use zbus::zvariant::DynamicType;

    fn reply_with<B>(body: &B) -> zbus::Message
    where
        B: serde::Serialize + DynamicType,
    {
        zbus::Message::method("/org/x", "Get")
            .unwrap()
            .build(body)
            .unwrap()
    }

    /// Encode `data`, send it through a zbus message and decode it again
    fn through_message(signature: &str, data: Json) -> Json {
        let body = encode_sequence(signature, Some(&data)).unwrap();
        let message = match body_structure(&body).unwrap() {
            Some(structure) => reply_with(&structure),
            None => reply_with(&()),
        };
        decode_body(&message_body(&message).unwrap()).unwrap()
    }

    #[test]
    fn test_single_struct_body_keeps_struct_level() {
        let message = reply_with(&((7i32, "x".to_string()),));
        let body = message_body(&message).unwrap();
        assert_eq!(
            body,
            vec![WireValue::Struct(vec![WireValue::Int32(7), WireValue::string("x")])]
        );
        assert_eq!(decode_body(&body).unwrap(), json!([[7, "x"]]));

        let message = reply_with(&(7i32, "x".to_string()));
        assert_eq!(decode_body(&message_body(&message).unwrap()).unwrap(), json!([7, "x"]));
    }

    #[test]
    fn test_values_survive_zbus_messages() {
        let cases = [
            ("(is)", json!([[1, "x"]]), json!([[1, "x"]])),
            ("a{sv}", json!({"level": 3}), json!([{"level": [3]}])),
            ("v", json!("text"), json!([["text"]])),
            ("a{ys}", json!([[1, "one"]]), json!([[[1, "one"]]])),
            ("aai", json!([[1], [2, 3]]), json!([[[1], [2, 3]]])),
            ("s(ib)", json!(["a", [2, true]]), json!(["a", [2, true]])),
        ];
        for (signature, data, expected) in cases {
            assert_eq!(through_message(signature, data), expected, "signature '{signature}'");
        }
    }

    #[test]
    fn test_empty_body() {
        assert!(body_structure(&[]).unwrap().is_none());
        let message = reply_with(&());
        assert!(message_body(&message).unwrap().is_empty());
    }

    #[test]
    fn test_inbound_signal_headers() {
        let message = zbus::Message::signal("/org/example", "org.example.Lights", "Changed")
            .unwrap()
            .build(&("kitchen", true))
            .unwrap();
        let inbound = inbound(&message).unwrap();
        assert_eq!(inbound.path.as_deref(), Some("/org/example"));
        assert_eq!(inbound.interface.as_deref(), Some("org.example.Lights"));
        assert_eq!(inbound.member.as_deref(), Some("Changed"));
        assert_eq!(inbound.error, None);
        assert_eq!(
            inbound.body,
            vec![WireValue::string("kitchen"), WireValue::Bool(true)]
        );
    }

    #[test]
    fn test_inbound_error_message() {
        let call = reply_with(&());
        let message = zbus::Message::error(&call.header(), "org.example.Error.Broken")
            .unwrap()
            .build(&("bulb gone",))
            .unwrap();
        let inbound = inbound(&message).unwrap();
        assert_eq!(
            inbound.error,
            Some(BusFault::new("org.example.Error.Broken", "bulb gone"))
        );
        assert!(inbound.body.is_empty());
        assert_eq!(inbound.member, None);
    }

    #[test]
    fn test_dict_entry_outside_array_is_rejected() {
        let entry = WireValue::dict_entry(WireValue::string("k"), WireValue::Int32(1));
        assert!(matches!(to_value(&entry), Err(BridgeError::BusApi(_))));
    }
}
