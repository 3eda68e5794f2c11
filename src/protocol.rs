//! Request payloads, verbs and replies exchanged with clients

use std::str::FromStr;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::bus::{BusClass, BusFault, InboundMessage};
use crate::codec::decode_body;
use crate::error::{BridgeError, Result, Status};

/// Operations a client can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Version,
    Info,
    Call,
    Signal,
    Subscribe,
    Unsubscribe,
}

impl Verb {
    pub const ALL: [Verb; 6] = [
        Verb::Version,
        Verb::Info,
        Verb::Call,
        Verb::Signal,
        Verb::Subscribe,
        Verb::Unsubscribe,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Version => "version",
            Verb::Info => "info",
            Verb::Call => "call",
            Verb::Signal => "signal",
            Verb::Subscribe => "subscribe",
            Verb::Unsubscribe => "unsubscribe",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Verb::Version => "report the bridge version",
            Verb::Info => "list the available verbs",
            Verb::Call => "call a method on the bus and return its out-arguments",
            Verb::Signal => "emit a signal on the bus",
            Verb::Subscribe => "forward the signals of a match rule to an event",
            Verb::Unsubscribe => "stop forwarding the signals of a match rule to an event",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Verb::ALL
            .into_iter()
            .find(|verb| verb.as_str() == s)
            .ok_or_else(|| BridgeError::InvalidRequest(format!("unknown verb '{s}'")))
    }
}

/// Arguments of `call` and `signal`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub bus: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    pub path: String,
    #[serde(default)]
    pub interface: Option<String>,
    pub member: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl MessageRequest {
    pub fn from_args(args: &Value) -> Result<Self> {
        Ok(Self::deserialize(args)?)
    }

    /// Requested bus, `default` when absent
    pub fn bus_class(&self, default: BusClass) -> Result<BusClass> {
        resolve_bus(self.bus.as_deref(), default)
    }
}

/// Arguments of `subscribe` and `unsubscribe`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub bus: Option<String>,
    #[serde(rename = "match")]
    pub filter: String,
    #[serde(default)]
    pub event: Option<String>,
}

impl SubscribeRequest {
    pub fn from_args(args: &Value) -> Result<Self> {
        Ok(Self::deserialize(args)?)
    }

    /// Requested bus, `default` when absent
    pub fn bus_class(&self, default: BusClass) -> Result<BusClass> {
        resolve_bus(self.bus.as_deref(), default)
    }

    /// Target event, falling back to `default_event`
    pub fn event_or<'a>(&'a self, default_event: &'a str) -> &'a str {
        self.event.as_deref().unwrap_or(default_event)
    }
}

fn resolve_bus(bus: Option<&str>, default: BusClass) -> Result<BusClass> {
    bus.map_or(Ok(default), str::parse)
}

/// Answer to one request
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: Status,
    pub data: Option<Value>,
}

impl Reply {
    pub fn success(data: Option<Value>) -> Self {
        Self {
            status: Status::Success,
            data,
        }
    }

    pub fn failure(status: Status, data: Option<Value>) -> Self {
        Self { status, data }
    }

    /// Local failure; the error text becomes the payload
    pub fn from_error(error: &BridgeError) -> Self {
        Self::failure(error.status(), Some(Value::String(error.to_string())))
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl From<Result<Reply>> for Reply {
    fn from(result: Result<Reply>) -> Self {
        result.unwrap_or_else(|e| Reply::from_error(&e))
    }
}

/// Payload describing an error answered by a bus peer
pub fn bus_error_payload(fault: &BusFault) -> Value {
    json!({
        "DBus-error-name": fault.name,
        "DBus-error-message": fault.message,
    })
}

/// Event payload for a message received through a watch on `bus`
pub fn signal_payload(bus: BusClass, message: &InboundMessage) -> Value {
    let (status, data) = match &message.error {
        Some(fault) => ("error", bus_error_payload(fault)),
        None => match decode_body(&message.body) {
            Ok(data) => ("success", data),
            Err(_) => ("error", Value::Null),
        },
    };

    let mut payload = Map::new();
    payload.insert("bus".into(), Value::from(bus.as_str()));
    payload.insert("status".into(), Value::from(status));
    payload.insert("data".into(), data);
    payload.insert("sender".into(), optional(&message.sender));
    payload.insert("path".into(), optional(&message.path));
    payload.insert("interface".into(), optional(&message.interface));
    payload.insert("member".into(), optional(&message.member));
    Value::Object(payload)
}

fn optional(field: &Option<String>) -> Value {
    field.as_deref().map_or(Value::Null, Value::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireValue;

    #[test]
    fn test_verb_parsing() {
        for verb in Verb::ALL {
            assert_eq!(verb.as_str().parse::<Verb>().unwrap(), verb);
        }
        assert!(matches!(
            "subscribe_nfc".parse::<Verb>(),
            Err(BridgeError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_message_request_defaults() {
        let request = MessageRequest::from_args(&json!({
            "path": "/org/x",
            "member": "Ping",
        }))
        .unwrap();
        assert_eq!(request.bus_class(BusClass::System).unwrap(), BusClass::System);
        assert_eq!(request.signature, "");
        assert!(request.destination.is_none());
        assert!(request.data.is_none());

        assert!(MessageRequest::from_args(&json!({"member": "Ping"})).is_err());
        let bad_bus = MessageRequest::from_args(&json!({
            "bus": "session", "path": "/", "member": "M",
        }))
        .unwrap();
        assert!(matches!(bad_bus.bus_class(BusClass::System), Err(BridgeError::InvalidRequest(_))));
    }

    #[test]
    fn test_subscribe_request_event_fallback() {
        let request = SubscribeRequest::from_args(&json!({
            "bus": "user",
            "match": "type='signal'",
        }))
        .unwrap();
        assert_eq!(request.bus_class(BusClass::System).unwrap(), BusClass::User);
        assert_eq!(request.event_or("default"), "default");
        assert!(SubscribeRequest::from_args(&json!({"bus": "user"})).is_err());
    }

    #[test]
    fn test_signal_payload_shapes() {
        let message = InboundMessage::signal(
            "/org/x",
            "org.x.I",
            "Changed",
            vec![WireValue::string("on"), WireValue::Int32(3)],
        )
        .with_sender(":1.7");
        let payload = signal_payload(BusClass::User, &message);
        assert_eq!(
            payload,
            json!({
                "bus": "user",
                "status": "success",
                "data": ["on", 3],
                "sender": ":1.7",
                "path": "/org/x",
                "interface": "org.x.I",
                "member": "Changed",
            })
        );

        let failed = InboundMessage {
            error: Some(BusFault::new("org.x.Error.Failed", "nope")),
            ..Default::default()
        };
        let payload = signal_payload(BusClass::System, &failed);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["data"]["DBus-error-name"], "org.x.Error.Failed");
        assert_eq!(payload["sender"], Value::Null);
    }
}
