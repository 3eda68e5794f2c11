//! Subscription registry
//!
//! Many clients may ask for the same bus signals. The registry keeps one
//! bus-level match per `(bus, match filter)` pair (a *watch*), one host event
//! per event name (an *event record*) and a refcounted *link* for each
//! watch/event pair in use:
//!
//! ```text
//!  Watch(system, "type='signal',interface='a.B'") ──link(2)──▶ Event "default"
//!  Watch(user,   "type='signal',member='X'")      ──link(1)──┘    refcount 2
//! ```
//!
//! Invariants:
//! - a watch holds a bus registration iff it has at least one link
//! - a link exists iff its refcount is at least one
//! - an event record exists iff its refcount is at least one, except the
//!   default event, which is created with one reference and never released
//!
//! The registry is owned by the dispatch thread and is never shared, so it
//! needs no locking.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::bus::{BusClass, BusConnection, InboundMessage, MatchSlot, SignalSink};
use crate::error::{BridgeError, Result};
use crate::host::{EventHost, EventId, SubscriberId};
use crate::protocol::signal_payload;

/// Identity of a watch, stable for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct EventRecord {
    name: String,
    handle: EventId,
    refcount: u32,
}

struct Link {
    event: EventId,
    refcount: u32,
}

struct Watch {
    id: WatchId,
    bus: BusClass,
    filter: String,
    slot: Option<MatchSlot>,
    links: Vec<Link>,
}

pub struct Registry {
    host: Arc<dyn EventHost>,
    default_event: String,
    events: Vec<EventRecord>,
    watches: Vec<Watch>,
    next_watch: u64,
}

impl Registry {
    /// Create a registry and its default event
    pub fn new(host: Arc<dyn EventHost>, default_event: &str) -> Result<Self> {
        let handle = host.create_event(default_event)?;
        Ok(Self {
            host,
            default_event: default_event.to_string(),
            events: vec![EventRecord {
                name: default_event.to_string(),
                handle,
                refcount: 1,
            }],
            watches: Vec::new(),
            next_watch: 0,
        })
    }

    pub fn default_event(&self) -> &str {
        &self.default_event
    }

    /// Subscribe `subscriber` to `event`, fed by the signals matching `filter`
    /// on `connection`'s bus.
    ///
    /// `make_sink` builds the callback for a newly installed bus match; it is
    /// only called when the watch has no registration yet.
    pub async fn subscribe(
        &mut self,
        connection: &dyn BusConnection,
        filter: &str,
        event: &str,
        subscriber: SubscriberId,
        make_sink: impl FnOnce(WatchId) -> SignalSink,
    ) -> Result<EventId> {
        let bus = connection.class();
        let event_index = match self.find_event(event) {
            Some(index) => index,
            None => {
                let handle = self.host.create_event(event)?;
                self.events.push(EventRecord {
                    name: event.to_string(),
                    handle,
                    refcount: 0,
                });
                debug!(event, "Event record created");
                self.events.len() - 1
            }
        };
        let handle = self.events[event_index].handle;

        let watch_index = match self.find_watch(bus, filter) {
            Some(index) => index,
            None => {
                self.next_watch += 1;
                self.watches.push(Watch {
                    id: WatchId(self.next_watch),
                    bus,
                    filter: filter.to_string(),
                    slot: None,
                    links: Vec::new(),
                });
                debug!(%bus, filter, "Watch created");
                self.watches.len() - 1
            }
        };

        let watch = &mut self.watches[watch_index];
        match watch.links.iter_mut().find(|link| link.event == handle) {
            Some(link) => link.refcount += 1,
            None => {
                watch.links.push(Link {
                    event: handle,
                    refcount: 1,
                });
                self.events[event_index].refcount += 1;

                if self.watches[watch_index].slot.is_none() {
                    let sink = make_sink(self.watches[watch_index].id);
                    match connection.add_match(filter, sink).await {
                        Ok(slot) => {
                            debug!(%bus, filter, "Bus match installed");
                            self.watches[watch_index].slot = Some(slot);
                        }
                        Err(e) => {
                            warn!(%bus, filter, error = %e, "Bus match registration failed");
                            self.drop_reference(watch_index, event_index, handle);
                            return Err(e);
                        }
                    }
                }
            }
        }

        if let Err(e) = self.host.subscribe(subscriber, handle) {
            self.drop_reference(watch_index, event_index, handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Undo one [`Registry::subscribe`] of the same triple
    pub fn unsubscribe(
        &mut self,
        bus: BusClass,
        filter: &str,
        event: &str,
        subscriber: SubscriberId,
    ) -> Result<()> {
        let watch_index = self
            .find_watch(bus, filter)
            .ok_or_else(|| BridgeError::NotFound(format!("no watch for '{filter}' on {bus} bus")))?;
        let event_index = self
            .find_event(event)
            .ok_or_else(|| BridgeError::NotFound(format!("no event '{event}'")))?;
        let handle = self.events[event_index].handle;
        if !self.watches[watch_index].links.iter().any(|l| l.event == handle) {
            return Err(BridgeError::NotFound(format!(
                "'{filter}' on {bus} bus is not linked to event '{event}'"
            )));
        }

        self.host.unsubscribe(subscriber, handle);
        self.drop_reference(watch_index, event_index, handle);
        Ok(())
    }

    /// Fan a message received by `watch` out to every linked event, once each.
    ///
    /// Returns the number of events pushed.
    pub fn deliver(&self, watch: WatchId, message: &InboundMessage) -> usize {
        let Some(watch) = self.watches.iter().find(|w| w.id == watch) else {
            trace!(?watch, "Message for a removed watch dropped");
            return 0;
        };
        let payload = signal_payload(watch.bus, message);
        for link in &watch.links {
            self.host.push(link.event, payload.clone());
        }
        watch.links.len()
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Whether the bus match of `(bus, filter)` is installed
    pub fn is_registered(&self, bus: BusClass, filter: &str) -> bool {
        self.find_watch(bus, filter)
            .is_some_and(|index| self.watches[index].slot.is_some())
    }

    pub fn event_refcount(&self, event: &str) -> Option<u32> {
        self.find_event(event).map(|index| self.events[index].refcount)
    }

    pub fn link_refcount(&self, bus: BusClass, filter: &str, event: &str) -> Option<u32> {
        let watch = &self.watches[self.find_watch(bus, filter)?];
        let handle = self.events[self.find_event(event)?].handle;
        watch
            .links
            .iter()
            .find(|link| link.event == handle)
            .map(|link| link.refcount)
    }

    fn find_event(&self, name: &str) -> Option<usize> {
        self.events.iter().position(|e| e.name == name)
    }

    fn find_watch(&self, bus: BusClass, filter: &str) -> Option<usize> {
        self.watches
            .iter()
            .position(|w| w.bus == bus && w.filter == filter)
    }

    /// Release one reference on the link between a watch and an event,
    /// tearing down whatever loses its last reference
    fn drop_reference(&mut self, watch_index: usize, event_index: usize, handle: EventId) {
        let watch = &mut self.watches[watch_index];
        let Some(link_index) = watch.links.iter().position(|l| l.event == handle) else {
            return;
        };
        let link = &mut watch.links[link_index];
        link.refcount -= 1;
        if link.refcount > 0 {
            return;
        }
        watch.links.swap_remove(link_index);

        if watch.links.is_empty() {
            let watch = self.watches.swap_remove(watch_index);
            debug!(bus = %watch.bus, filter = %watch.filter, "Watch removed");
            // dropping the slot removes the bus match
            drop(watch.slot);
        }

        let record = &mut self.events[event_index];
        record.refcount = record.refcount.saturating_sub(1);
        if record.refcount == 0 && record.name != self.default_event {
            let record = self.events.swap_remove(event_index);
            self.host.release_event(record.handle);
            debug!(event = %record.name, "Event record released");
        }
    }
}
