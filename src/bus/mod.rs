//! Bus connection boundary
//!
//! Everything here lives on the dispatch thread: connections, match slots
//! and signal sinks are deliberately `!Send`. The only piece that crosses
//! threads is the [`BusProvider`], which is moved onto the dispatch thread
//! once and asked for connections from there.

pub mod loopback;

#[cfg(feature = "dbus")]
pub mod dbus;

use std::collections::HashMap;
use std::rc::Rc;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::codec::WireValue;
use crate::error::{BridgeError, Result};

/// Bus scope a connection targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusClass {
    /// Per-user session bus
    User,
    /// System-wide bus
    #[default]
    System,
}

impl BusClass {
    pub fn as_str(self) -> &'static str {
        match self {
            BusClass::User => "user",
            BusClass::System => "system",
        }
    }
}

impl std::fmt::Display for BusClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusClass {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(BusClass::User),
            "system" => Ok(BusClass::System),
            other => Err(BridgeError::InvalidRequest(format!("unknown bus '{other}'"))),
        }
    }
}

/// Method call or signal ready to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub destination: Option<String>,
    pub path: String,
    pub interface: Option<String>,
    pub member: String,
    /// Signature the body was encoded against
    pub signature: String,
    pub body: Vec<WireValue>,
}

/// Error name and message carried by a bus error reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFault {
    pub name: String,
    pub message: String,
}

impl BusFault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Result of a completed method call round-trip
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Method return with its out-arguments
    Return(Vec<WireValue>),
    /// The peer answered with an error
    Error(BusFault),
}

/// Signal (or error) received through a match registration
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InboundMessage {
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub body: Vec<WireValue>,
    pub error: Option<BusFault>,
}

impl InboundMessage {
    pub fn signal(path: &str, interface: &str, member: &str, body: Vec<WireValue>) -> Self {
        Self {
            sender: None,
            path: Some(path.to_string()),
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            body,
            error: None,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

/// Callback receiving the messages of one match registration
pub type SignalSink = Rc<dyn Fn(InboundMessage)>;

/// Handle of an installed match registration.
///
/// The registration is removed from the bus when the slot is dropped.
pub struct MatchSlot {
    release: Option<Box<dyn FnOnce()>>,
}

impl MatchSlot {
    pub fn new(release: impl FnOnce() + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for MatchSlot {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for MatchSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchSlot")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// One connection to a bus, owned by the dispatch thread
#[async_trait(?Send)]
pub trait BusConnection {
    fn class(&self) -> BusClass;

    /// Send a method call and wait for its reply
    async fn call_method(&self, message: OutgoingMessage) -> Result<CallOutcome>;

    /// Send a signal
    async fn emit_signal(&self, message: OutgoingMessage) -> Result<()>;

    /// Install a signal match; matching messages are handed to `sink` on the
    /// dispatch thread until the returned slot is dropped
    async fn add_match(&self, rule: &str, sink: SignalSink) -> Result<MatchSlot>;
}

/// Creates bus connections on the dispatch thread
#[async_trait(?Send)]
pub trait BusProvider {
    async fn connect(&self, class: BusClass) -> Result<Rc<dyn BusConnection>>;
}

/// At most one live connection per bus class, created on first use.
///
/// A failed creation is not remembered, so a later request retries it.
pub struct ConnectionCache {
    provider: Box<dyn BusProvider + Send>,
    connections: HashMap<BusClass, Rc<dyn BusConnection>>,
}

impl ConnectionCache {
    pub fn new(provider: Box<dyn BusProvider + Send>) -> Self {
        Self {
            provider,
            connections: HashMap::new(),
        }
    }

    pub async fn get(&mut self, class: BusClass) -> Result<Rc<dyn BusConnection>> {
        if let Some(connection) = self.connections.get(&class) {
            return Ok(connection.clone());
        }

        match self.provider.connect(class).await {
            Ok(connection) => {
                info!(bus = %class, "Bus connection established");
                self.connections.insert(class, connection.clone());
                Ok(connection)
            }
            Err(e) => {
                error!(bus = %class, error = %e, "Creation of bus connection failed");
                Err(match e {
                    e @ BridgeError::ConnectionError { .. } => e,
                    other => BridgeError::ConnectionError {
                        bus: class.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_bus_class_parsing() {
        assert_eq!("user".parse::<BusClass>().unwrap(), BusClass::User);
        assert_eq!("system".parse::<BusClass>().unwrap(), BusClass::System);
        assert!("session".parse::<BusClass>().is_err());
        assert_eq!(BusClass::default(), BusClass::System);
        assert_eq!(serde_json::to_string(&BusClass::User).unwrap(), "\"user\"");
    }

    #[test]
    fn test_match_slot_releases_once() {
        let released = Rc::new(Cell::new(0));
        let counter = released.clone();
        let slot = MatchSlot::new(move || counter.set(counter.get() + 1));
        assert_eq!(released.get(), 0);
        drop(slot);
        assert_eq!(released.get(), 1);
    }
}
