//! Shared base of the client and server endpoints.
//!
//! The endpoint owns the remote-to-connection table, the per-remote message
//! handler registry with buffering for late subscribers, the lifecycle
//! callback lists, and the pools. Inbound generic messages and connection
//! closures flow through a single event pump task, which runs on the
//! foreground executor: handlers therefore observe arrival order and never
//! overlap.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use stagelink_core::{NetworkAddress, Providers, RemoteId, TaskProvider};
use tokio::sync::mpsc;

use crate::config::LinkConfig;
use crate::connection::{CloseStatus, Connection};
use crate::error::LinkError;
use crate::pool::{BufferPool, Channel, Message, MessagePool};
use crate::remote::{Remote, RemoteRegistry};
use crate::socket::StreamSocket;
use crate::wire::{self, HandshakeData, PROTOCOL_VERSION, PacketKind};

/// A per-remote inbound message callback.
pub type MessageHandler = Rc<dyn Fn(Message)>;

/// A subscriber to endpoint start/stop.
pub type LifecycleCallback = Rc<dyn Fn()>;

/// A subscriber to remote connection.
pub type ConnectedCallback = Rc<dyn Fn(&Rc<Remote>)>;

/// A subscriber to remote disconnection, carrying the close status.
pub type DisconnectedCallback = Rc<dyn Fn(&Rc<Remote>, CloseStatus)>;

/// Events reported to the endpoint by its connections.
pub(crate) enum EndpointEvent {
    /// An inbound generic message.
    Message(Message),
    /// A connection reached its terminal state.
    ConnectionClosed {
        /// The remote the connection served.
        remote: RemoteId,
        /// Why it closed.
        status: CloseStatus,
    },
}

/// Running totals kept by an endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointCounters {
    /// Generic messages submitted for sending.
    pub messages_sent: u64,
    /// Generic messages received from remotes.
    pub messages_received: u64,
    /// Payload bytes submitted for sending.
    pub bytes_sent: u64,
    /// Payload bytes received from remotes.
    pub bytes_received: u64,
    /// Connections registered over the endpoint's lifetime.
    pub connections_opened: u64,
    /// Connections closed over the endpoint's lifetime.
    pub connections_closed: u64,
}

struct EndpointState<P: Providers> {
    running: bool,
    connections: HashMap<RemoteId, Rc<Connection<P>>>,
    handlers: HashMap<RemoteId, MessageHandler>,
    buffered: HashMap<RemoteId, VecDeque<Message>>,
    on_started: Vec<LifecycleCallback>,
    on_stopped: Vec<LifecycleCallback>,
    on_connected: Vec<ConnectedCallback>,
    on_disconnected: Vec<DisconnectedCallback>,
    counters: EndpointCounters,
    pump: Option<tokio::task::JoinHandle<()>>,
}

struct EndpointInner<P: Providers> {
    providers: P,
    local_id: RemoteId,
    config: LinkConfig,
    buffers: BufferPool,
    messages: MessagePool,
    events_tx: RefCell<mpsc::UnboundedSender<EndpointEvent>>,
    events_rx: RefCell<Option<mpsc::UnboundedReceiver<EndpointEvent>>>,
    local_stream_addr: Cell<Option<NetworkAddress>>,
    local_datagram_addr: Cell<Option<NetworkAddress>>,
    state: RefCell<EndpointState<P>>,
}

/// The shared connection/handler machinery beneath [`crate::Client`] and
/// [`crate::Server`].
///
/// Clone-cheap handle; all clones refer to the same endpoint.
#[derive(Clone)]
pub struct NetworkEndpoint<P: Providers> {
    inner: Rc<EndpointInner<P>>,
}

impl<P: Providers> NetworkEndpoint<P> {
    /// Create an endpoint with a freshly minted local identity.
    pub fn new(providers: P, config: LinkConfig) -> Self {
        let local_id = RemoteId::generate(providers.random());
        let buffers = BufferPool::new();
        let messages = MessagePool::with_buffers(buffers.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Rc::new(EndpointInner {
                providers,
                local_id,
                config,
                buffers,
                messages,
                events_tx: RefCell::new(events_tx),
                events_rx: RefCell::new(Some(events_rx)),
                local_stream_addr: Cell::new(None),
                local_datagram_addr: Cell::new(None),
                state: RefCell::new(EndpointState {
                    running: false,
                    connections: HashMap::new(),
                    handlers: HashMap::new(),
                    buffered: HashMap::new(),
                    on_started: Vec::new(),
                    on_stopped: Vec::new(),
                    on_connected: Vec::new(),
                    on_disconnected: Vec::new(),
                    counters: EndpointCounters::default(),
                    pump: None,
                }),
            }),
        }
    }

    /// This endpoint's 128-bit identity.
    pub fn local_id(&self) -> RemoteId {
        self.inner.local_id
    }

    /// The configuration this endpoint runs with.
    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Whether the endpoint has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.inner.state.borrow().running
    }

    /// Ids of every remote with a live connection.
    pub fn connected_remotes(&self) -> Vec<RemoteId> {
        self.inner.state.borrow().connections.keys().copied().collect()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.state.borrow().connections.len()
    }

    /// Snapshot of the endpoint's counters.
    pub fn counters(&self) -> EndpointCounters {
        self.inner.state.borrow().counters.clone()
    }

    /// Acquire a pooled message addressed to `remote`.
    ///
    /// Use [`RemoteId::BROADCAST`] to target every connected remote.
    pub fn acquire_message(
        &self,
        remote: RemoteId,
        channel: Channel,
        expected_size: usize,
    ) -> Message {
        self.inner.messages.acquire(remote, channel, expected_size)
    }

    /// Subscribe to endpoint start.
    pub fn on_started(&self, callback: LifecycleCallback) {
        self.inner.state.borrow_mut().on_started.push(callback);
    }

    /// Subscribe to endpoint stop.
    pub fn on_stopped(&self, callback: LifecycleCallback) {
        self.inner.state.borrow_mut().on_stopped.push(callback);
    }

    /// Subscribe to remote connection. Fires exactly once per successful
    /// handshake.
    pub fn on_remote_connected(&self, callback: ConnectedCallback) {
        self.inner.state.borrow_mut().on_connected.push(callback);
    }

    /// Subscribe to remote disconnection. Fires exactly once per connection,
    /// carrying the close status.
    pub fn on_remote_disconnected(&self, callback: DisconnectedCallback) {
        self.inner.state.borrow_mut().on_disconnected.push(callback);
    }

    /// Register the single message handler for a remote.
    ///
    /// Fails (returns `false`) for the broadcast sentinel, an invalid id, or
    /// a remote with no current connection. An already-registered handler is
    /// never overwritten: the call returns `true` only when `handler` is the
    /// same callback. On success, messages buffered for the remote are
    /// drained in arrival order - delivered to the new handler when
    /// `handle_buffered`, disposed otherwise.
    pub fn register_message_handler(
        &self,
        remote: RemoteId,
        handler: MessageHandler,
        handle_buffered: bool,
    ) -> bool {
        if remote.is_broadcast() || !remote.is_valid() {
            return false;
        }
        let drained = {
            let mut state = self.inner.state.borrow_mut();
            if !state.connections.contains_key(&remote) {
                return false;
            }
            if let Some(existing) = state.handlers.get(&remote) {
                return Rc::ptr_eq(existing, &handler);
            }
            state.handlers.insert(remote, handler.clone());
            state.buffered.remove(&remote).unwrap_or_default()
        };
        for message in drained {
            if handle_buffered {
                handler(message);
            } else {
                drop(message);
            }
        }
        true
    }

    /// Send a message to its target remote, or to every connected remote for
    /// [`RemoteId::BROADCAST`]. Always the asynchronous path.
    ///
    /// # Errors
    ///
    /// `UnknownRemote` when no connection exists for the target; a size
    /// error when an unreliable payload exceeds the datagram ceiling (the
    /// message is disposed, the connection stays up).
    pub fn send_message(&self, message: Message) -> Result<(), LinkError> {
        let target = message.remote();
        if target.is_broadcast() {
            let connections: Vec<_> = {
                self.inner.state.borrow().connections.values().cloned().collect()
            };
            for conn in connections {
                let mut copy = self.inner.messages.acquire(
                    conn.remote().id,
                    message.channel(),
                    message.len(),
                );
                copy.payload_mut().extend_from_slice(message.payload());
                let len = copy.len() as u64;
                match conn.send_async(PacketKind::Generic, copy) {
                    Ok(()) => {
                        let mut state = self.inner.state.borrow_mut();
                        state.counters.messages_sent += 1;
                        state.counters.bytes_sent += len;
                    }
                    Err(e) => {
                        tracing::warn!(remote = %conn.remote().id, "broadcast send failed: {e}");
                    }
                }
            }
            Ok(())
        } else {
            let conn = {
                self.inner
                    .state
                    .borrow()
                    .connections
                    .get(&target)
                    .cloned()
                    .ok_or(LinkError::UnknownRemote(target))?
            };
            let len = message.len() as u64;
            conn.send_async(PacketKind::Generic, message)?;
            let mut state = self.inner.state.borrow_mut();
            state.counters.messages_sent += 1;
            state.counters.bytes_sent += len;
            Ok(())
        }
    }

    /// Emit this endpoint's initialization packet over a freshly-connected
    /// stream socket, synchronously, so the peer can construct its `Remote`
    /// before any application packet arrives.
    pub(crate) async fn do_handshake(&self, stream: &StreamSocket<P>) -> Result<(), LinkError> {
        let stream_addr = self
            .inner
            .local_stream_addr
            .get()
            .ok_or_else(|| LinkError::InvalidAddress("local stream endpoint unset".into()))?;
        let datagram_addr = self
            .inner
            .local_datagram_addr
            .get()
            .ok_or_else(|| LinkError::InvalidAddress("local datagram endpoint unset".into()))?;
        let payload = wire::encode_handshake(
            &PROTOCOL_VERSION,
            &HandshakeData {
                id: self.inner.local_id,
                stream_addr,
                datagram_addr,
            },
        )?;
        stream.send(PacketKind::Initialization, &payload).await?;
        tracing::debug!(peer = %stream.peer_addr(), "handshake emitted");
        Ok(())
    }

    /// Record the local endpoints advertised in handshakes.
    pub(crate) fn set_local_endpoints(&self, stream: NetworkAddress, datagram: NetworkAddress) {
        self.inner.local_stream_addr.set(Some(stream));
        self.inner.local_datagram_addr.set(Some(datagram));
    }

    /// A sender connections use to report events to this endpoint.
    pub(crate) fn events_sender(&self) -> mpsc::UnboundedSender<EndpointEvent> {
        self.inner.events_tx.borrow().clone()
    }

    /// The shared pools.
    pub(crate) fn buffers(&self) -> BufferPool {
        self.inner.buffers.clone()
    }

    pub(crate) fn messages(&self) -> MessagePool {
        self.inner.messages.clone()
    }

    /// Look up the connection serving a remote.
    pub(crate) fn connection_for(&self, remote: RemoteId) -> Option<Rc<Connection<P>>> {
        self.inner.state.borrow().connections.get(&remote).cloned()
    }

    /// Start the event pump.
    pub(crate) fn start(&self) -> Result<(), LinkError> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.running {
                return Err(LinkError::AlreadyRunning);
            }
            state.running = true;
            let rx = match self.inner.events_rx.borrow_mut().take() {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    *self.inner.events_tx.borrow_mut() = tx;
                    rx
                }
            };
            let pump = self
                .inner
                .providers
                .task()
                .spawn_task("endpoint_events", event_pump(self.clone(), rx));
            state.pump = Some(pump);
        }
        let callbacks = { self.inner.state.borrow().on_started.clone() };
        for callback in callbacks {
            callback();
        }
        tracing::info!(local = %self.inner.local_id, "endpoint started");
        Ok(())
    }

    /// Register a connection; at most one per remote. A prior connection to
    /// the same remote is first closed with `Reconnected`.
    pub(crate) fn register_connection(&self, conn: Rc<Connection<P>>) {
        let remote = conn.remote().clone();
        let prior = {
            let mut state = self.inner.state.borrow_mut();
            state.counters.connections_opened += 1;
            state.connections.insert(remote.id, conn)
        };
        if let Some(prior) = prior {
            tracing::info!(remote = %remote.id, "superseding existing connection");
            prior.close(CloseStatus::Reconnected);
        }
        tracing::info!(remote = %remote.id, "remote connected");
        let callbacks = { self.inner.state.borrow().on_connected.clone() };
        for callback in callbacks {
            callback(&remote);
        }
    }

    /// Stop the endpoint: optionally notify peers, close every connection,
    /// clear all state, fire `stopped`.
    pub(crate) async fn stop(&self, graceful: bool) {
        let (connections, pump) = {
            let mut state = self.inner.state.borrow_mut();
            if !state.running {
                return;
            }
            state.running = false;
            let connections: Vec<_> = state.connections.drain().map(|(_, c)| c).collect();
            state.handlers.clear();
            // Dropping the queues disposes every buffered message.
            state.buffered.clear();
            (connections, state.pump.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        for conn in &connections {
            if graceful {
                if let Err(e) = conn.send_disconnect().await {
                    tracing::debug!(remote = %conn.remote().id, "disconnect send failed: {e}");
                }
            }
            conn.close(CloseStatus::Graceful);
            self.inner.state.borrow_mut().counters.connections_closed += 1;
            let callbacks = { self.inner.state.borrow().on_disconnected.clone() };
            for callback in callbacks {
                callback(conn.remote(), CloseStatus::Graceful);
            }
        }
        // Fresh channel so the endpoint can be started again.
        {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.inner.events_tx.borrow_mut() = tx;
            *self.inner.events_rx.borrow_mut() = Some(rx);
        }
        let callbacks = { self.inner.state.borrow().on_stopped.clone() };
        for callback in callbacks {
            callback();
        }
        tracing::info!(local = %self.inner.local_id, "endpoint stopped");
    }

    /// Deliver or buffer one inbound generic message.
    fn dispatch_message(&self, message: Message) {
        let sender = message.remote();
        let handler = {
            let mut state = self.inner.state.borrow_mut();
            state.counters.messages_received += 1;
            state.counters.bytes_received += message.len() as u64;
            state.handlers.get(&sender).cloned()
        };
        match handler {
            // Invoked on the pump task, i.e. on the foreground executor:
            // handlers see arrival order and never overlap.
            Some(handler) => handler(message),
            None => {
                let mut state = self.inner.state.borrow_mut();
                state.buffered.entry(sender).or_default().push_back(message);
            }
        }
    }

    /// Process a connection's terminal status report.
    fn handle_connection_closed(&self, remote_id: RemoteId, status: CloseStatus) {
        {
            let mut state = self.inner.state.borrow_mut();
            // A `Reconnected` close arrives after the map already holds the
            // superseding connection; only remove an entry that is actually
            // closed.
            let closed = state
                .connections
                .get(&remote_id)
                .map(|c| c.is_closed())
                .unwrap_or(false);
            if closed {
                state.connections.remove(&remote_id);
            }
            state.buffered.remove(&remote_id);
            state.counters.connections_closed += 1;
        }
        tracing::info!(remote = %remote_id, ?status, "remote disconnected");
        if let Some(remote) = RemoteRegistry::get(remote_id) {
            let callbacks = { self.inner.state.borrow().on_disconnected.clone() };
            for callback in callbacks {
                callback(&remote, status);
            }
        }
    }
}

/// Drain connection events; runs on the foreground executor.
async fn event_pump<P: Providers>(
    endpoint: NetworkEndpoint<P>,
    mut events_rx: mpsc::UnboundedReceiver<EndpointEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            EndpointEvent::Message(message) => endpoint.dispatch_message(message),
            EndpointEvent::ConnectionClosed { remote, status } => {
                endpoint.handle_connection_closed(remote, status)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagelink_core::TokioProviders;

    fn endpoint() -> NetworkEndpoint<TokioProviders> {
        NetworkEndpoint::new(TokioProviders::new(), LinkConfig::default())
    }

    #[test]
    fn test_register_handler_rejects_broadcast() {
        let endpoint = endpoint();
        let handler: MessageHandler = Rc::new(|_| {});
        assert!(!endpoint.register_message_handler(RemoteId::BROADCAST, handler, true));
    }

    #[test]
    fn test_register_handler_rejects_invalid_id() {
        let endpoint = endpoint();
        let handler: MessageHandler = Rc::new(|_| {});
        assert!(!endpoint.register_message_handler(RemoteId::default(), handler, true));
    }

    #[test]
    fn test_register_handler_rejects_unknown_remote() {
        let endpoint = endpoint();
        let handler: MessageHandler = Rc::new(|_| {});
        assert!(!endpoint.register_message_handler(RemoteId::new(1, 2), handler, true));
    }

    #[test]
    fn test_send_to_unknown_remote_fails() {
        let endpoint = endpoint();
        let message =
            endpoint.acquire_message(RemoteId::new(9, 9), Channel::ReliableOrdered, 16);
        assert!(matches!(
            endpoint.send_message(message),
            Err(LinkError::UnknownRemote(_))
        ));
    }

    #[test]
    fn test_counters_start_at_zero() {
        let endpoint = endpoint();
        let counters = endpoint.counters();
        assert_eq!(counters.messages_sent, 0);
        assert_eq!(counters.messages_received, 0);
        assert_eq!(counters.connections_opened, 0);
    }
}
