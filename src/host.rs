//! Host event API
//!
//! The bridge publishes signals as named events and lets clients subscribe to
//! them. [`EventHost`] is the seam toward whatever framework carries those
//! events; [`EventHub`] is the in-process implementation used by the binary
//! and the tests.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{BridgeError, Result};

/// Opaque handle of an event created through an [`EventHost`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

/// Opaque identity of a client receiving events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Event as received by one subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredEvent {
    /// Name the event was created with
    pub event: String,
    pub data: Value,
}

/// Event primitives offered by the host framework
pub trait EventHost: Send + Sync {
    /// Create a broadcastable event
    fn create_event(&self, name: &str) -> Result<EventId>;

    /// Destroy an event; its subscribers stop receiving it
    fn release_event(&self, event: EventId);

    /// Broadcast `data`, returning how many subscribers received it
    fn push(&self, event: EventId, data: Value) -> usize;

    /// Add `subscriber` to the event (no effect if already subscribed)
    fn subscribe(&self, subscriber: SubscriberId, event: EventId) -> Result<()>;

    /// Remove `subscriber` from the event
    fn unsubscribe(&self, subscriber: SubscriberId, event: EventId);
}

struct HubEvent {
    name: String,
    subscribers: HashSet<SubscriberId>,
}

#[derive(Default)]
struct HubState {
    next_event: u64,
    next_client: u64,
    events: HashMap<EventId, HubEvent>,
    clients: HashMap<SubscriberId, mpsc::UnboundedSender<DeliveredEvent>>,
}

/// In-process event host with one delivery queue per connected client
#[derive(Default)]
pub struct EventHub {
    state: Mutex<HubState>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client and get the receiving end of its event queue
    pub fn connect(&self) -> (SubscriberId, EventReceiver) {
        let mut state = self.state.lock();
        state.next_client += 1;
        let id = SubscriberId(state.next_client);
        let (sender, receiver) = mpsc::unbounded_channel();
        state.clients.insert(id, sender);
        debug!(client = %id, "Client connected to event hub");
        (id, EventReceiver { receiver })
    }

    /// Forget a client and drop it from every event
    pub fn disconnect(&self, client: SubscriberId) {
        let mut state = self.state.lock();
        state.clients.remove(&client);
        for event in state.events.values_mut() {
            event.subscribers.remove(&client);
        }
        debug!(client = %client, "Client disconnected from event hub");
    }

    /// Names of the live events
    pub fn event_names(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state.events.values().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    pub fn subscriber_count(&self, event: EventId) -> usize {
        self.state
            .lock()
            .events
            .get(&event)
            .map_or(0, |e| e.subscribers.len())
    }
}

impl EventHost for EventHub {
    fn create_event(&self, name: &str) -> Result<EventId> {
        let mut state = self.state.lock();
        state.next_event += 1;
        let id = EventId(state.next_event);
        state.events.insert(
            id,
            HubEvent {
                name: name.to_string(),
                subscribers: HashSet::new(),
            },
        );
        Ok(id)
    }

    fn release_event(&self, event: EventId) {
        self.state.lock().events.remove(&event);
    }

    fn push(&self, event: EventId, data: Value) -> usize {
        let state = self.state.lock();
        let Some(target) = state.events.get(&event) else {
            return 0;
        };
        let mut delivered = 0;
        for subscriber in &target.subscribers {
            if let Some(client) = state.clients.get(subscriber) {
                let sent = client.send(DeliveredEvent {
                    event: target.name.clone(),
                    data: data.clone(),
                });
                if sent.is_ok() {
                    delivered += 1;
                }
            }
        }
        trace!(event = %target.name, delivered, "Event pushed");
        delivered
    }

    fn subscribe(&self, subscriber: SubscriberId, event: EventId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.clients.contains_key(&subscriber) {
            return Err(BridgeError::NotFound(format!("subscriber {subscriber}")));
        }
        let target = state
            .events
            .get_mut(&event)
            .ok_or_else(|| BridgeError::NotFound(format!("event {event:?}")))?;
        target.subscribers.insert(subscriber);
        Ok(())
    }

    fn unsubscribe(&self, subscriber: SubscriberId, event: EventId) {
        if let Some(target) = self.state.lock().events.get_mut(&event) {
            target.subscribers.remove(&subscriber);
        }
    }
}

/// Receiving end of a client's event queue
#[derive(Debug)]
pub struct EventReceiver {
    receiver: mpsc::UnboundedReceiver<DeliveredEvent>,
}

impl EventReceiver {
    /// Next event, `None` once the client is disconnected
    pub async fn recv(&mut self) -> Option<DeliveredEvent> {
        self.receiver.recv().await
    }

    /// Next event, or `None` if nothing arrives within `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<DeliveredEvent> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    /// Event already queued, if any
    pub fn try_recv(&mut self) -> Option<DeliveredEvent> {
        self.receiver.try_recv().ok()
    }
}
