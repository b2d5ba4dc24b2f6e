//! A connection binds a stream socket and a datagram socket to one remote.
//!
//! The connection drives liveness: a producer task sends a zero-payload
//! heartbeat over the datagram path every period, and a watchdog task closes
//! the connection once the peer has been silent past the disconnect
//! threshold. Inbound packets are dispatched by kind; generic payloads are
//! forwarded to the endpoint.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use stagelink_core::{NetworkAddress, Providers, TaskProvider, TimeProvider};
use tokio::sync::mpsc;

use crate::config::LinkConfig;
use crate::endpoint::EndpointEvent;
use crate::pool::{Channel, Message, MessagePool};
use crate::remote::Remote;
use crate::socket::{DatagramSocket, SocketError, SocketEvent, StreamSocket};
use crate::wire::PacketKind;

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// The peer sent a disconnect packet, or we closed deliberately.
    Graceful,
    /// The heartbeat watchdog expired.
    Timeout,
    /// A fatal socket-level error.
    Error,
    /// Superseded by a newer connection to the same remote.
    Reconnected,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, sockets not yet pumping.
    Initializing,
    /// Both sockets ready, packets flowing.
    Established,
    /// Terminal; close is idempotent.
    Closed,
}

/// One live connection to a remote.
///
/// Owns the stream socket exclusively; owns the datagram socket only on the
/// client side (the server shares one accept-port socket across all
/// connections).
pub struct Connection<P: Providers> {
    remote: Rc<Remote>,
    stream: StreamSocket<P>,
    datagram: Rc<DatagramSocket<P>>,
    owns_datagram: bool,
    state: Cell<ConnectionState>,
    last_heartbeat: Cell<Duration>,
    events: mpsc::UnboundedSender<EndpointEvent>,
    tasks: RefCell<Vec<tokio::task::JoinHandle<()>>>,
    providers: P,
    config: LinkConfig,
    messages: MessagePool,
}

impl<P: Providers> Connection<P> {
    /// Create a connection for a remote whose handshake has completed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        providers: P,
        remote: Rc<Remote>,
        stream: StreamSocket<P>,
        datagram: Rc<DatagramSocket<P>>,
        owns_datagram: bool,
        config: LinkConfig,
        messages: MessagePool,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> Rc<Self> {
        let now = providers.time().now();
        Rc::new(Self {
            remote,
            stream,
            datagram,
            owns_datagram,
            state: Cell::new(ConnectionState::Initializing),
            // Stamped at construction so the watchdog has a baseline before
            // the first heartbeat arrives.
            last_heartbeat: Cell::new(now),
            events,
            tasks: RefCell::new(Vec::new()),
            providers,
            config,
            messages,
        })
    }

    /// Start the socket pumps, the heartbeat producer and the watchdog.
    ///
    /// `stream_events` is the stream socket's event receiver (partially
    /// consumed by the handshake wait); `datagram_events` is present only
    /// when this connection owns its datagram socket.
    pub(crate) fn start(
        self: &Rc<Self>,
        stream_events: mpsc::UnboundedReceiver<SocketEvent>,
        datagram_events: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    ) {
        self.state.set(ConnectionState::Established);
        self.last_heartbeat.set(self.providers.time().now());

        let task = self.providers.task().clone();
        let mut tasks = self.tasks.borrow_mut();
        tasks.push(task.spawn_task(
            "connection_stream_pump",
            socket_pump(self.clone(), stream_events, true),
        ));
        if let Some(datagram_events) = datagram_events {
            tasks.push(task.spawn_task(
                "connection_datagram_pump",
                socket_pump(self.clone(), datagram_events, false),
            ));
        }
        tasks.push(task.spawn_task("heartbeat_producer", heartbeat_producer(self.clone())));
        tasks.push(task.spawn_task("heartbeat_watchdog", heartbeat_watchdog(self.clone())));
    }

    /// The remote this connection serves.
    pub fn remote(&self) -> &Rc<Remote> {
        &self.remote
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Whether the connection has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state.get() == ConnectionState::Closed
    }

    pub(crate) fn stream(&self) -> &StreamSocket<P> {
        &self.stream
    }

    /// Destination for datagram sends: explicit on a shared socket, the
    /// connected default otherwise.
    fn datagram_dest(&self) -> Option<NetworkAddress> {
        if self.owns_datagram {
            None
        } else {
            Some(self.remote.datagram_addr)
        }
    }

    /// Route an outbound message by its channel selector, asynchronously.
    ///
    /// The message is disposed here regardless of outcome.
    pub(crate) fn send_async(
        &self,
        kind: PacketKind,
        message: Message,
    ) -> Result<(), SocketError> {
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        match message.channel() {
            Channel::ReliableOrdered => self.stream.send_async(kind, message.payload()),
            Channel::UnreliableUnordered => {
                self.datagram
                    .send_async(kind, message.payload(), self.datagram_dest())
            }
        }
    }

    /// Send a zero-payload disconnect notification, synchronously.
    pub(crate) async fn send_disconnect(&self) -> Result<(), SocketError> {
        self.stream.send(PacketKind::Disconnect, &[]).await
    }

    /// Dispatch one inbound packet by kind.
    pub(crate) fn handle_packet(&self, kind: PacketKind, message: Message) {
        if self.is_closed() {
            return;
        }
        match kind {
            PacketKind::Generic => {
                let _ = self.events.send(EndpointEvent::Message(message));
            }
            PacketKind::Heartbeat => {
                self.last_heartbeat.set(self.providers.time().now());
                drop(message);
            }
            PacketKind::Disconnect => {
                drop(message);
                self.close(CloseStatus::Graceful);
            }
            // Consumed by the socket layer; nothing to do here.
            PacketKind::Initialization => drop(message),
            PacketKind::Invalid => {
                tracing::warn!(remote = %self.remote.id, "dropping invalid packet");
            }
        }
    }

    /// Close the connection. Idempotent; reports the status to the endpoint
    /// exactly once.
    pub fn close(&self, status: CloseStatus) {
        if self.state.replace(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        for handle in self.tasks.borrow_mut().drain(..) {
            handle.abort();
        }
        self.stream.close();
        if self.owns_datagram {
            self.datagram.close();
        }
        let _ = self.events.send(EndpointEvent::ConnectionClosed {
            remote: self.remote.id,
            status,
        });
        tracing::info!(remote = %self.remote.id, ?status, "connection closed");
    }
}

/// Drain one socket's events into the connection.
async fn socket_pump<P: Providers>(
    conn: Rc<Connection<P>>,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    is_stream: bool,
) {
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Packet(kind, message) => conn.handle_packet(kind, message),
            // A repeated handshake after establishment changes nothing at
            // this layer.
            SocketEvent::Initialized(_) => {}
            SocketEvent::Error(e) if is_stream => {
                tracing::warn!(remote = %conn.remote.id, "stream socket error: {e}");
                conn.close(CloseStatus::Error);
                return;
            }
            SocketEvent::Error(_) => {}
            SocketEvent::Closed if is_stream => {
                // Silent teardown without a DISCONNECT: leave the verdict to
                // the heartbeat watchdog.
                return;
            }
            SocketEvent::Closed => {}
        }
    }
}

/// Send a heartbeat over the datagram path every period, best effort.
async fn heartbeat_producer<P: Providers>(conn: Rc<Connection<P>>) {
    let time = conn.providers.time().clone();
    loop {
        if time.sleep(conn.config.heartbeat_period).await.is_err() {
            return;
        }
        if conn.is_closed() {
            return;
        }
        let message = conn
            .messages
            .acquire(conn.remote.id, Channel::UnreliableUnordered, 0);
        if let Err(e) = conn.send_async(PacketKind::Heartbeat, message) {
            tracing::debug!(remote = %conn.remote.id, "heartbeat send failed: {e}");
        }
    }
}

/// Close the connection once the peer has been silent past the threshold.
async fn heartbeat_watchdog<P: Providers>(conn: Rc<Connection<P>>) {
    let time = conn.providers.time().clone();
    let threshold = conn.config.disconnect_threshold();
    loop {
        if time.sleep(conn.config.heartbeat_check_period).await.is_err() {
            return;
        }
        if conn.is_closed() {
            return;
        }
        let gap = time.now().saturating_sub(conn.last_heartbeat.get());
        if gap > threshold {
            tracing::warn!(
                remote = %conn.remote.id,
                gap_ms = gap.as_millis() as u64,
                "heartbeat watchdog expired"
            );
            conn.close(CloseStatus::Timeout);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::remote::RemoteRegistry;
    use stagelink_core::{NetworkProvider, RemoteId, TcpListenerTrait, TokioProviders};
    use std::time::Duration;

    fn run_local<F: std::future::Future>(future: F) -> F::Output {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .expect("runtime");
        let local = tokio::task::LocalSet::new();
        runtime.block_on(local.run_until(future))
    }

    /// A connection against a peer that never heartbeats closes with
    /// `Timeout` within the disconnect threshold.
    #[test]
    fn test_watchdog_closes_silent_connection() {
        run_local(async {
            let providers = TokioProviders::new();
            let config = LinkConfig::fast_local();
            let buffers = BufferPool::new();
            let messages = MessagePool::with_buffers(buffers.clone());
            let local_id = RemoteId::new(0xC0, 0xFFEE);

            // Silent peer: accepts the stream and reads nothing.
            let listener = providers
                .network()
                .bind("127.0.0.1:0")
                .await
                .expect("bind");
            let listener_addr = listener.local_addr().expect("local addr");
            tokio::task::spawn_local(async move {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                // Hold the stream open until the test ends.
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(stream);
            });

            let (stream, _) = providers
                .network()
                .connect("127.0.0.1:0", &listener_addr)
                .await
                .expect("connect");
            let peer_addr = NetworkAddress::parse(&listener_addr).expect("parse");
            let stream_socket = StreamSocket::new(
                &providers,
                stream,
                local_id,
                peer_addr,
                buffers.clone(),
                messages.clone(),
                &config,
            );
            let stream_events = stream_socket.take_events().expect("events");

            let datagram = Rc::new(
                DatagramSocket::bind(&providers, "127.0.0.1:0", local_id, buffers, messages.clone())
                    .await
                    .expect("bind udp"),
            );
            let datagram_events = datagram.take_events().expect("events");
            datagram.connect(&peer_addr).await.expect("udp connect");

            let remote =
                RemoteRegistry::get_or_insert(RemoteId::new(0xAB, 0xCD), peer_addr, peer_addr);
            let (events_tx, mut events_rx) = mpsc::unbounded_channel();
            let conn = Connection::new(
                providers.clone(),
                remote,
                stream_socket,
                datagram,
                true,
                config.clone(),
                messages,
                events_tx,
            );
            conn.start(stream_events, Some(datagram_events));
            assert_eq!(conn.state(), ConnectionState::Established);

            // Expect the watchdog to fire within threshold plus slack.
            let deadline = config.disconnect_threshold() + Duration::from_millis(300);
            let event = tokio::time::timeout(deadline, async {
                loop {
                    match events_rx.recv().await {
                        Some(EndpointEvent::ConnectionClosed { status, .. }) => return status,
                        Some(_) => continue,
                        None => panic!("event channel closed"),
                    }
                }
            })
            .await
            .expect("watchdog fired");
            assert_eq!(event, CloseStatus::Timeout);
            assert!(conn.is_closed());

            // Close is idempotent: no second status event.
            conn.close(CloseStatus::Graceful);
            assert!(events_rx.try_recv().is_err());
        });
    }
}
