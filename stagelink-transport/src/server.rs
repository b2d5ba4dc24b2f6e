//! Passive acceptor: listens on a stream port and a shared datagram port.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use stagelink_core::{
    NetworkAddress, NetworkProvider, Providers, RemoteId, TaskProvider, TcpListenerTrait,
    TimeProvider,
};
use tokio::sync::mpsc;

use crate::config::LinkConfig;
use crate::connection::Connection;
use crate::endpoint::{
    ConnectedCallback, DisconnectedCallback, MessageHandler, NetworkEndpoint,
};
use crate::error::LinkError;
use crate::pool::{Channel, Message};
use crate::socket::{DatagramSocket, SocketError, SocketEvent, StreamSocket};

struct ServerInner<P: Providers> {
    providers: P,
    endpoint: NetworkEndpoint<P>,
    datagram: RefCell<Option<Rc<DatagramSocket<P>>>>,
    accept_task: RefCell<Option<tokio::task::JoinHandle<()>>>,
    demux_task: RefCell<Option<tokio::task::JoinHandle<()>>>,
    local_addr: Cell<Option<NetworkAddress>>,
}

/// Passive acceptor spawning a connection per accepted peer.
///
/// All connections share one datagram socket bound on the accept port;
/// incoming datagrams are demultiplexed by the sender id in each frame's
/// header. Connections are marked shared so closing one never disposes the
/// socket under the others.
#[derive(Clone)]
pub struct Server<P: Providers> {
    inner: Rc<ServerInner<P>>,
}

impl<P: Providers> Server<P> {
    /// Create a server with a freshly minted local identity.
    pub fn new(providers: P, config: LinkConfig) -> Self {
        let endpoint = NetworkEndpoint::new(providers.clone(), config);
        Self {
            inner: Rc::new(ServerInner {
                providers,
                endpoint,
                datagram: RefCell::new(None),
                accept_task: RefCell::new(None),
                demux_task: RefCell::new(None),
                local_addr: Cell::new(None),
            }),
        }
    }

    /// The endpoint beneath this server.
    pub fn endpoint(&self) -> &NetworkEndpoint<P> {
        &self.inner.endpoint
    }

    /// This server's 128-bit identity.
    pub fn local_id(&self) -> RemoteId {
        self.inner.endpoint.local_id()
    }

    /// The bound address, once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<NetworkAddress> {
        self.inner.local_addr.get()
    }

    /// The bound port, once started.
    pub fn local_port(&self) -> Option<u16> {
        self.inner.local_addr.get().map(|addr| addr.port)
    }

    /// See [`NetworkEndpoint::acquire_message`].
    pub fn acquire_message(
        &self,
        remote: RemoteId,
        channel: Channel,
        expected_size: usize,
    ) -> Message {
        self.inner.endpoint.acquire_message(remote, channel, expected_size)
    }

    /// See [`NetworkEndpoint::send_message`].
    pub fn send_message(&self, message: Message) -> Result<(), LinkError> {
        self.inner.endpoint.send_message(message)
    }

    /// See [`NetworkEndpoint::register_message_handler`].
    pub fn register_message_handler(
        &self,
        remote: RemoteId,
        handler: MessageHandler,
        handle_buffered: bool,
    ) -> bool {
        self.inner
            .endpoint
            .register_message_handler(remote, handler, handle_buffered)
    }

    /// See [`NetworkEndpoint::on_remote_connected`].
    pub fn on_remote_connected(&self, callback: ConnectedCallback) {
        self.inner.endpoint.on_remote_connected(callback);
    }

    /// See [`NetworkEndpoint::on_remote_disconnected`].
    pub fn on_remote_disconnected(&self, callback: DisconnectedCallback) {
        self.inner.endpoint.on_remote_disconnected(callback);
    }

    /// Bind the stream acceptor and the shared datagram socket on `port`
    /// (0 = ephemeral) and start accepting peers.
    ///
    /// # Errors
    ///
    /// Configuration errors (port in use) fail here, with no retry.
    pub async fn start(&self, port: u16) -> Result<(), LinkError> {
        if self.inner.endpoint.is_running() {
            return Err(LinkError::AlreadyRunning);
        }
        let providers = &self.inner.providers;
        let endpoint = &self.inner.endpoint;

        let bind_addr = format!("0.0.0.0:{port}");
        let listener = providers
            .network()
            .bind(&bind_addr)
            .await
            .map_err(|e| LinkError::from_bind(&bind_addr, e))?;
        let bound = NetworkAddress::parse(&listener.local_addr().map_err(SocketError::Io)?)
            .map_err(|e| LinkError::InvalidAddress(e.to_string()))?;

        // The datagram socket shares the accept port.
        let udp_addr = format!("0.0.0.0:{}", bound.port);
        let datagram = Rc::new(
            DatagramSocket::bind(
                providers,
                &udp_addr,
                endpoint.local_id(),
                endpoint.buffers(),
                endpoint.messages(),
            )
            .await
            .map_err(|e| LinkError::from_bind(&udp_addr, e))?,
        );

        endpoint.set_local_endpoints(bound, datagram.local_addr());
        endpoint.start()?;

        let datagram_events = datagram.take_events().ok_or(LinkError::AlreadyRunning)?;
        let demux = providers.task().spawn_task(
            "server_datagram_demux",
            demux_loop(endpoint.clone(), datagram_events),
        );
        let accept = providers.task().spawn_task(
            "server_accept",
            accept_loop(providers.clone(), endpoint.clone(), listener, datagram.clone()),
        );

        *self.inner.datagram.borrow_mut() = Some(datagram);
        *self.inner.demux_task.borrow_mut() = Some(demux);
        *self.inner.accept_task.borrow_mut() = Some(accept);
        self.inner.local_addr.set(Some(bound));
        tracing::info!(addr = %bound, "server listening");
        Ok(())
    }

    /// Stop accepting, close every connection (notifying peers when
    /// `graceful`), and release the shared sockets.
    pub async fn stop(&self, graceful: bool) {
        if let Some(handle) = self.inner.accept_task.borrow_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.demux_task.borrow_mut().take() {
            handle.abort();
        }
        self.inner.endpoint.stop(graceful).await;
        if let Some(datagram) = self.inner.datagram.borrow_mut().take() {
            datagram.close();
        }
        self.inner.local_addr.set(None);
        tracing::info!("server stopped");
    }
}

/// Accept peers forever; errors on individual accepts do not stop the loop.
async fn accept_loop<P: Providers>(
    providers: P,
    endpoint: NetworkEndpoint<P>,
    listener: <P::Network as NetworkProvider>::TcpListener,
    datagram: Rc<DatagramSocket<P>>,
) {
    let task = providers.task().clone();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::info!(%peer, "accepted stream connection");
                task.spawn_task(
                    "server_handshake",
                    handshake_task(
                        providers.clone(),
                        endpoint.clone(),
                        datagram.clone(),
                        stream,
                        peer,
                    ),
                );
            }
            Err(e) => {
                tracing::warn!("accept error: {e}");
            }
        }
    }
}

/// Exchange handshakes with one accepted peer and register its connection.
async fn handshake_task<P: Providers>(
    providers: P,
    endpoint: NetworkEndpoint<P>,
    datagram: Rc<DatagramSocket<P>>,
    stream: <P::Network as NetworkProvider>::TcpStream,
    peer: String,
) {
    let Ok(peer_addr) = NetworkAddress::parse(&peer) else {
        tracing::warn!(%peer, "unparseable peer address");
        return;
    };
    let config = endpoint.config().clone();
    let socket = StreamSocket::new(
        &providers,
        stream,
        endpoint.local_id(),
        peer_addr,
        endpoint.buffers(),
        endpoint.messages(),
        &config,
    );

    // We speak first: the peer needs our identity and endpoints before any
    // application packet.
    if let Err(e) = endpoint.do_handshake(&socket).await {
        tracing::warn!(%peer, "handshake emission failed: {e}");
        socket.close();
        return;
    }
    let Some(mut events) = socket.take_events() else {
        return;
    };
    match providers
        .time()
        .timeout(config.handshake_timeout, events.recv())
        .await
    {
        Ok(Some(SocketEvent::Initialized(remote))) => {
            let conn = Connection::new(
                providers.clone(),
                remote,
                socket,
                datagram,
                false,
                config,
                endpoint.messages(),
                endpoint.events_sender(),
            );
            endpoint.register_connection(conn.clone());
            conn.start(events, None);
        }
        _ => {
            tracing::warn!(%peer, "handshake not completed, closing socket");
            socket.close();
        }
    }
}

/// Route shared-socket datagrams to connections by the frame's sender id.
async fn demux_loop<P: Providers>(
    endpoint: NetworkEndpoint<P>,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Packet(kind, message) => {
                let sender = message.remote();
                match endpoint.connection_for(sender) {
                    Some(conn) => conn.handle_packet(kind, message),
                    None => {
                        tracing::debug!(remote = %sender, "datagram for unknown remote dropped");
                    }
                }
            }
            // Handshakes ride the stream transport; a datagram one is noise.
            SocketEvent::Initialized(_) => {}
            SocketEvent::Error(_) | SocketEvent::Closed => return,
        }
    }
}
