//! Busbridge: JSON requests and events over a D-Bus style message bus.
//!
//! Callers submit `call`, `signal`, `subscribe` and `unsubscribe` requests
//! from any thread. A single dispatch thread owns the bus connections and
//! the subscription registry; it encodes JSON payloads into wire values
//! against a type signature, sends them, and fans received signals out to
//! named events.
//!
//! The real bus adapter lives behind the `dbus` feature; the loopback bus
//! in [`bus::loopback`] needs no system services.

pub mod bridge;
pub mod bus;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frontend;
pub mod host;
pub mod protocol;
pub mod registry;

pub use bridge::{Bridge, BridgeClient, BridgeService, PendingReply};
pub use bus::{BusClass, BusConnection, BusProvider, CallOutcome, InboundMessage, OutgoingMessage};
pub use config::{Args, BridgeConfig};
pub use error::{BridgeError, Result, Status};
pub use host::{EventHost, EventHub, EventReceiver, SubscriberId};
pub use protocol::{Reply, Verb};
