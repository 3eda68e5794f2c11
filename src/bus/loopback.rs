//! In-process bus
//!
//! Records what the bridge sends, answers method calls through a pluggable
//! responder and delivers injected signals to match registrations. A match
//! receives a signal when its rule string equals the one given to
//! [`LoopbackBus::emit`]; no rule parsing is performed.
//!
//! The handle is `Send + Sync` so tests can drive it from any thread while
//! the connections themselves live on the dispatch thread.

use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    BusClass, BusConnection, BusProvider, CallOutcome, InboundMessage, MatchSlot,
    OutgoingMessage, SignalSink,
};
use crate::error::{BridgeError, Result};

type Responder = Arc<dyn Fn(&OutgoingMessage) -> CallOutcome + Send + Sync>;

struct Registration {
    id: u64,
    class: BusClass,
    rule: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Default)]
struct LoopbackState {
    next_id: u64,
    connects: usize,
    calls: Vec<(BusClass, OutgoingMessage)>,
    signals: Vec<(BusClass, OutgoingMessage)>,
    registrations: Vec<Registration>,
    installed: usize,
    released: usize,
    responder: Option<Responder>,
    refused_buses: HashSet<BusClass>,
    refuse_matches: bool,
}

/// Handle on a loopback bus shared by both bus classes
#[derive(Clone, Default)]
pub struct LoopbackBus {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every method call with `responder`
    pub fn respond_with(
        &self,
        responder: impl Fn(&OutgoingMessage) -> CallOutcome + Send + Sync + 'static,
    ) {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    /// Make connection attempts to `class` fail (or succeed again)
    pub fn refuse_connections(&self, class: BusClass, refuse: bool) {
        let mut state = self.state.lock();
        if refuse {
            state.refused_buses.insert(class);
        } else {
            state.refused_buses.remove(&class);
        }
    }

    /// Make match registrations fail
    pub fn refuse_matches(&self, refuse: bool) {
        self.state.lock().refuse_matches = refuse;
    }

    /// Deliver `message` to every registration on `class` whose rule is `rule`.
    ///
    /// Returns the number of registrations reached.
    pub fn emit(&self, class: BusClass, rule: &str, message: InboundMessage) -> usize {
        let state = self.state.lock();
        state
            .registrations
            .iter()
            .filter(|r| r.class == class && r.rule == rule)
            .filter(|r| r.sender.send(message.clone()).is_ok())
            .count()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn calls(&self) -> Vec<(BusClass, OutgoingMessage)> {
        self.state.lock().calls.clone()
    }

    pub fn signals(&self) -> Vec<(BusClass, OutgoingMessage)> {
        self.state.lock().signals.clone()
    }

    /// Rules currently registered on `class`
    pub fn active_matches(&self, class: BusClass) -> Vec<String> {
        self.state
            .lock()
            .registrations
            .iter()
            .filter(|r| r.class == class)
            .map(|r| r.rule.clone())
            .collect()
    }

    pub fn matches_installed(&self) -> usize {
        self.state.lock().installed
    }

    pub fn matches_released(&self) -> usize {
        self.state.lock().released
    }
}

#[async_trait(?Send)]
impl BusProvider for LoopbackBus {
    async fn connect(&self, class: BusClass) -> Result<Rc<dyn BusConnection>> {
        let mut state = self.state.lock();
        if state.refused_buses.contains(&class) {
            return Err(BridgeError::ConnectionError {
                bus: class.to_string(),
                reason: "connection refused by loopback".into(),
            });
        }
        state.connects += 1;
        Ok(Rc::new(LoopbackConnection {
            class,
            state: self.state.clone(),
        }))
    }
}

/// Connection half living on the dispatch thread
pub struct LoopbackConnection {
    class: BusClass,
    state: Arc<Mutex<LoopbackState>>,
}

#[async_trait(?Send)]
impl BusConnection for LoopbackConnection {
    fn class(&self) -> BusClass {
        self.class
    }

    async fn call_method(&self, message: OutgoingMessage) -> Result<CallOutcome> {
        let responder = {
            let mut state = self.state.lock();
            state.calls.push((self.class, message.clone()));
            state.responder.clone()
        };
        Ok(match responder {
            Some(responder) => responder(&message),
            None => CallOutcome::Return(Vec::new()),
        })
    }

    async fn emit_signal(&self, message: OutgoingMessage) -> Result<()> {
        self.state.lock().signals.push((self.class, message));
        Ok(())
    }

    async fn add_match(&self, rule: &str, sink: SignalSink) -> Result<MatchSlot> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<InboundMessage>();
        let id = {
            let mut state = self.state.lock();
            if state.refuse_matches {
                return Err(BridgeError::BusApi(format!("match '{rule}' refused")));
            }
            state.next_id += 1;
            let id = state.next_id;
            state.registrations.push(Registration {
                id,
                class: self.class,
                rule: rule.to_string(),
                sender,
            });
            state.installed += 1;
            id
        };
        debug!(bus = %self.class, rule, id, "Loopback match installed");

        let forwarder = tokio::task::spawn_local(async move {
            while let Some(message) = receiver.recv().await {
                sink(message);
            }
        });

        let state = self.state.clone();
        Ok(MatchSlot::new(move || {
            forwarder.abort();
            let mut state = state.lock();
            state.registrations.retain(|r| r.id != id);
            state.released += 1;
        }))
    }
}
