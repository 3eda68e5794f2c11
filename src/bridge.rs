//! Bridge service
//!
//! [`Bridge`] is the context owned by the dispatch thread: bus connections,
//! the subscription registry and a handle to schedule signal fan-out.
//! [`BridgeService`] starts that thread; [`BridgeClient`] is what callers use
//! to submit requests from any thread.
//!
//! Method calls do not hold the queue while waiting for the peer: the call
//! is sent from a local task and the reply completes the caller's
//! [`PendingReply`] whenever it arrives.

use std::rc::Rc;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::bus::{
    BusClass, BusConnection, BusFault, BusProvider, CallOutcome, ConnectionCache,
    InboundMessage, OutgoingMessage, SignalSink,
};
use crate::codec::{decode_body, encode_sequence};
use crate::config::BridgeConfig;
use crate::dispatch::{job, DispatchQueue, Dispatcher, LocalHandle};
use crate::error::{BridgeError, Result, Status};
use crate::host::{EventHost, SubscriberId};
use crate::protocol::{bus_error_payload, MessageRequest, Reply, SubscribeRequest, Verb};
use crate::registry::{Registry, WatchId};

const DISPATCH_THREAD_NAME: &str = "busbridge-dispatch";

/// State owned by the dispatch thread
pub struct Bridge {
    default_bus: BusClass,
    connections: ConnectionCache,
    registry: Registry,
    local: LocalHandle<Bridge>,
}

impl Bridge {
    pub fn new(
        config: &BridgeConfig,
        provider: Box<dyn BusProvider + Send>,
        host: Arc<dyn EventHost>,
        local: LocalHandle<Bridge>,
    ) -> Result<Self> {
        Ok(Self {
            default_bus: config.default_bus,
            connections: ConnectionCache::new(provider),
            registry: Registry::new(host, &config.default_event)?,
            local,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode a call or signal and resolve the connection it goes out on
    async fn prepare(
        &mut self,
        request: MessageRequest,
    ) -> Result<(Rc<dyn BusConnection>, OutgoingMessage)> {
        let bus = request.bus_class(self.default_bus)?;
        let body = encode_sequence(&request.signature, request.data.as_ref())?;
        let connection = self.connections.get(bus).await?;
        Ok((
            connection,
            OutgoingMessage {
                destination: request.destination,
                path: request.path,
                interface: request.interface,
                member: request.member,
                signature: request.signature,
                body,
            },
        ))
    }

    /// Send a method call; `reply` completes when the peer answers
    pub async fn process_call(&mut self, request: MessageRequest, reply: oneshot::Sender<Reply>) {
        let (connection, message) = match self.prepare(request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!(error = %e, "Call rejected");
                let _ = reply.send(Reply::from_error(&e));
                return;
            }
        };

        debug!(bus = %connection.class(), member = %message.member, "Sending method call");
        tokio::task::spawn_local(async move {
            let outcome = connection.call_method(message).await;
            let _ = reply.send(call_reply(outcome));
        });
    }

    pub async fn process_signal(&mut self, request: MessageRequest) -> Result<Reply> {
        let (connection, message) = self.prepare(request).await?;
        debug!(bus = %connection.class(), member = %message.member, "Emitting signal");
        connection.emit_signal(message).await?;
        Ok(Reply::success(None))
    }

    pub async fn process_subscribe(
        &mut self,
        request: SubscribeRequest,
        subscriber: SubscriberId,
    ) -> Result<Reply> {
        let bus = request.bus_class(self.default_bus)?;
        let connection = self.connections.get(bus).await?;
        let event = request.event_or(self.registry.default_event()).to_string();
        let local = self.local.clone();

        self.registry
            .subscribe(
                connection.as_ref(),
                &request.filter,
                &event,
                subscriber,
                move |watch| signal_sink(local, watch),
            )
            .await?;
        debug!(%bus, filter = %request.filter, %event, %subscriber, "Subscribed");
        Ok(Reply::success(None))
    }

    pub fn process_unsubscribe(
        &mut self,
        request: SubscribeRequest,
        subscriber: SubscriberId,
    ) -> Result<Reply> {
        let bus = request.bus_class(self.default_bus)?;
        let event = request.event_or(self.registry.default_event()).to_string();
        self.registry
            .unsubscribe(bus, &request.filter, &event, subscriber)?;
        debug!(%bus, filter = %request.filter, %event, %subscriber, "Unsubscribed");
        Ok(Reply::success(None))
    }

    /// Fan a message received through `watch` out to its events
    pub fn on_signal(&mut self, watch: WatchId, message: InboundMessage) {
        let pushed = self.registry.deliver(watch, &message);
        debug!(?watch, pushed, "Signal delivered");
    }
}

/// Sink handing messages of one watch back to the dispatch context
fn signal_sink(local: LocalHandle<Bridge>, watch: WatchId) -> SignalSink {
    Rc::new(move |message: InboundMessage| {
        local.schedule(move |bridge: &mut Bridge| bridge.on_signal(watch, message));
    })
}

fn call_reply(outcome: Result<CallOutcome>) -> Reply {
    match outcome {
        Ok(CallOutcome::Return(body)) => match decode_body(&body) {
            Ok(data) => Reply::success(Some(data)),
            Err(e) => Reply::from_error(&e),
        },
        Ok(CallOutcome::Error(fault)) => {
            Reply::failure(Status::GenericFailure, Some(bus_error_payload(&fault)))
        }
        Err(BridgeError::BusError { name, message }) => Reply::failure(
            Status::GenericFailure,
            Some(bus_error_payload(&BusFault::new(name, message))),
        ),
        Err(e) => Reply::from_error(&e),
    }
}

/// Running bridge: the dispatch thread and its queue
pub struct BridgeService {
    dispatcher: Dispatcher<Bridge>,
}

impl BridgeService {
    /// Start the dispatch thread with its own bus provider and registry
    pub fn start(
        config: BridgeConfig,
        provider: Box<dyn BusProvider + Send>,
        host: Arc<dyn EventHost>,
    ) -> Result<Self> {
        config.validate()?;
        let capacity = config.queue_capacity;
        let dispatcher = Dispatcher::spawn(DISPATCH_THREAD_NAME, capacity, move |local| {
            Bridge::new(&config, provider, host, local)
        })?;
        info!(capacity, "Bridge service started");
        Ok(Self { dispatcher })
    }

    /// Client submitting requests on behalf of `subscriber`
    pub fn client(&self, subscriber: SubscriberId) -> BridgeClient {
        BridgeClient {
            queue: self.dispatcher.queue(),
            subscriber,
        }
    }

    /// Run `f` against the dispatch context and wait for its result
    pub async fn inspect<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Bridge) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatcher.queue().submit(job(move |bridge: &mut Bridge| {
            async move {
                let _ = tx.send(f(bridge));
            }
            .boxed_local()
        }))?;
        rx.await.map_err(|_| BridgeError::ServiceUnavailable)
    }

    pub fn shutdown(self) {
        self.dispatcher.shutdown();
        info!("Bridge service stopped");
    }
}

/// Submits requests to the dispatch thread
#[derive(Clone)]
pub struct BridgeClient {
    queue: DispatchQueue<Bridge>,
    subscriber: SubscriberId,
}

impl BridgeClient {
    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }

    pub fn is_running(&self) -> bool {
        self.queue.is_running()
    }

    pub fn call(&self, request: MessageRequest) -> Result<PendingReply> {
        let (tx, rx) = oneshot::channel();
        self.queue.submit(job(move |bridge: &mut Bridge| {
            bridge.process_call(request, tx).boxed_local()
        }))?;
        Ok(PendingReply { receiver: rx })
    }

    pub fn signal(&self, request: MessageRequest) -> Result<PendingReply> {
        self.submit_reply(move |bridge| {
            async move { Reply::from(bridge.process_signal(request).await) }.boxed_local()
        })
    }

    pub fn subscribe(&self, request: SubscribeRequest) -> Result<PendingReply> {
        let subscriber = self.subscriber;
        self.submit_reply(move |bridge| {
            async move { Reply::from(bridge.process_subscribe(request, subscriber).await) }
                .boxed_local()
        })
    }

    pub fn unsubscribe(&self, request: SubscribeRequest) -> Result<PendingReply> {
        let subscriber = self.subscriber;
        self.submit_reply(move |bridge| {
            let reply = Reply::from(bridge.process_unsubscribe(request, subscriber));
            async move { reply }.boxed_local()
        })
    }

    /// Submit `verb` with its JSON arguments.
    ///
    /// `version` and `info` are answered here without touching the queue.
    pub fn submit(&self, verb: Verb, args: &Value) -> Result<PendingReply> {
        match verb {
            Verb::Version => Ok(PendingReply::ready(Reply::success(Some(json!(
                env!("CARGO_PKG_VERSION")
            ))))),
            Verb::Info => Ok(PendingReply::ready(Reply::success(Some(info_payload())))),
            Verb::Call => self.call(MessageRequest::from_args(args)?),
            Verb::Signal => self.signal(MessageRequest::from_args(args)?),
            Verb::Subscribe => self.subscribe(SubscribeRequest::from_args(args)?),
            Verb::Unsubscribe => self.unsubscribe(SubscribeRequest::from_args(args)?),
        }
    }

    /// Submit a request by verb name and wait for its reply
    pub async fn request(&self, verb: &str, args: &Value) -> Reply {
        let pending = verb
            .parse::<Verb>()
            .and_then(|verb| self.submit(verb, args));
        match pending {
            Ok(pending) => pending.wait().await,
            Err(e) => Reply::from_error(&e),
        }
    }

    fn submit_reply<F>(&self, f: F) -> Result<PendingReply>
    where
        F: for<'c> FnOnce(&'c mut Bridge) -> futures::future::LocalBoxFuture<'c, Reply>
            + Send
            + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.queue.submit(job(move |bridge: &mut Bridge| {
            async move {
                let reply = f(bridge).await;
                let _ = tx.send(reply);
            }
            .boxed_local()
        }))?;
        Ok(PendingReply { receiver: rx })
    }
}

fn info_payload() -> Value {
    let verbs: Map<String, Value> = Verb::ALL
        .into_iter()
        .map(|verb| (verb.as_str().to_string(), Value::from(verb.description())))
        .collect();
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "verbs": verbs,
    })
}

/// Reply that arrives once the dispatch thread has handled the request
#[derive(Debug)]
pub struct PendingReply {
    receiver: oneshot::Receiver<Reply>,
}

impl PendingReply {
    /// Reply that is already known
    pub fn ready(reply: Reply) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(reply);
        Self { receiver: rx }
    }

    /// Wait for the reply; a request dropped by a stopped dispatch loop
    /// reports [`BridgeError::ServiceUnavailable`]
    pub async fn wait(self) -> Reply {
        self.receiver
            .await
            .unwrap_or_else(|_| Reply::from_error(&BridgeError::ServiceUnavailable))
    }
}
