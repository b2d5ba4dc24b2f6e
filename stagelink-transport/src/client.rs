//! Active connector toward a known server endpoint.

use std::cell::{Cell, RefCell};
use std::net::IpAddr;
use std::rc::Rc;

use stagelink_core::{
    NetworkAddress, NetworkProvider, Providers, RemoteId, TaskProvider, TimeProvider,
};
use tokio::sync::mpsc;

use crate::config::LinkConfig;
use crate::connection::{CloseStatus, Connection};
use crate::endpoint::{
    ConnectedCallback, DisconnectedCallback, MessageHandler, NetworkEndpoint,
};
use crate::error::LinkError;
use crate::pool::{Channel, Message};
use crate::socket::{DatagramSocket, SocketError, SocketEvent, StreamSocket};

/// Client reconnect states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not connecting; explicit stop is the only way here.
    Stopped,
    /// The reconnect loop is attempting the server.
    Connecting,
    /// Handshake complete, a connection is registered.
    Connected,
}

struct ClientInner<P: Providers> {
    providers: P,
    endpoint: NetworkEndpoint<P>,
    state: Cell<ClientState>,
    /// The local port requested by the caller (0 = ephemeral).
    local_port: Cell<u16>,
    /// The datagram port actually bound, reused across reconnects.
    datagram_port: Cell<u16>,
    datagram: RefCell<Option<Rc<DatagramSocket<P>>>>,
    reconnect_task: RefCell<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: RefCell<Option<mpsc::UnboundedSender<()>>>,
}

/// Active connector: dials a known server and keeps dialing until told to
/// stop.
///
/// The reconnect loop creates a fresh local-bound stream socket per attempt,
/// bounded by the connect-attempt timeout, which also paces retries. After a
/// non-graceful disconnect the loop restarts automatically on the same local
/// port; a graceful close or [`Client::stop`] ends it.
#[derive(Clone)]
pub struct Client<P: Providers> {
    inner: Rc<ClientInner<P>>,
}

impl<P: Providers> Client<P> {
    /// Create a client with a freshly minted local identity.
    pub fn new(providers: P, config: LinkConfig) -> Self {
        let endpoint = NetworkEndpoint::new(providers.clone(), config);
        Self {
            inner: Rc::new(ClientInner {
                providers,
                endpoint,
                state: Cell::new(ClientState::Stopped),
                local_port: Cell::new(0),
                datagram_port: Cell::new(0),
                datagram: RefCell::new(None),
                reconnect_task: RefCell::new(None),
                shutdown_tx: RefCell::new(None),
            }),
        }
    }

    /// The endpoint beneath this client.
    pub fn endpoint(&self) -> &NetworkEndpoint<P> {
        &self.inner.endpoint
    }

    /// This client's 128-bit identity.
    pub fn local_id(&self) -> RemoteId {
        self.inner.endpoint.local_id()
    }

    /// Current reconnect state.
    pub fn state(&self) -> ClientState {
        self.inner.state.get()
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

    /// Start connecting to `server_ip:server_port` from `local_port`
    /// (0 = ephemeral).
    ///
    /// Validates the addresses, binds and connects the datagram socket so
    /// the OS rejects datagrams from anyone but the server, then enters the
    /// reconnect loop. Returns once the loop is running; subscribe to
    /// [`Client::on_remote_connected`] for the moment the handshake lands.
    ///
    /// # Errors
    ///
    /// Configuration errors (bad address, port in use) fail here and are
    /// never retried.
    pub async fn connect(
        &self,
        server_ip: &str,
        server_port: u16,
        local_port: u16,
    ) -> Result<(), LinkError> {
        if self.inner.state.get() != ClientState::Stopped {
            return Err(LinkError::AlreadyRunning);
        }
        let ip: IpAddr = server_ip
            .parse()
            .map_err(|_| LinkError::InvalidAddress(format!("invalid server ip: {server_ip}")))?;
        if ip.is_ipv6() {
            return Err(LinkError::InvalidAddress(
                "the handshake carries IPv4 endpoints only".into(),
            ));
        }
        if server_port == 0 {
            return Err(LinkError::InvalidAddress("server port must be non-zero".into()));
        }
        let server_addr = NetworkAddress::new(ip, server_port);
        let local_bind = format!("0.0.0.0:{local_port}");

        // A stream port already in use is a configuration error, not
        // something the reconnect loop should chew on.
        if local_port != 0 {
            let probe = self
                .inner
                .providers
                .network()
                .bind(&local_bind)
                .await
                .map_err(|e| LinkError::from_bind(&local_bind, e))?;
            drop(probe);
        }

        let endpoint = &self.inner.endpoint;
        let datagram = DatagramSocket::bind(
            &self.inner.providers,
            &local_bind,
            endpoint.local_id(),
            endpoint.buffers(),
            endpoint.messages(),
        )
        .await
        .map_err(|e| LinkError::from_bind(&local_bind, e))?;
        datagram.connect(&server_addr).await.map_err(SocketError::Io)?;
        self.inner.datagram_port.set(datagram.local_addr().port);
        *self.inner.datagram.borrow_mut() = Some(Rc::new(datagram));

        self.inner.local_port.set(local_port);
        endpoint.start()?;

        // Reconnect on involuntary loss only: a graceful close suppresses
        // the loop, and a superseded connection already has a successor.
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        endpoint.on_remote_disconnected(Rc::new(move |_remote, status| {
            if matches!(status, CloseStatus::Timeout | CloseStatus::Error) {
                let _ = retry_tx.send(());
            }
        }));

        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        *self.inner.shutdown_tx.borrow_mut() = Some(shutdown_tx);

        self.inner.state.set(ClientState::Connecting);
        let handle = self.inner.providers.task().spawn_task(
            "client_reconnect",
            reconnect_loop(self.clone(), server_addr, retry_rx, shutdown_rx),
        );
        *self.inner.reconnect_task.borrow_mut() = Some(handle);
        Ok(())
    }

    /// Stop the client: cancel the reconnect loop, dispose unused sockets,
    /// and stop the endpoint (notifying peers when `graceful`).
    pub async fn stop(&self, graceful: bool) {
        if self.inner.state.get() == ClientState::Stopped {
            return;
        }
        self.inner.state.set(ClientState::Stopped);
        if let Some(shutdown_tx) = self.inner.shutdown_tx.borrow_mut().take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.inner.reconnect_task.borrow_mut().take() {
            handle.abort();
        }
        self.inner.endpoint.stop(graceful).await;
        if let Some(datagram) = self.inner.datagram.borrow_mut().take() {
            datagram.close();
        }
        tracing::info!("client stopped");
    }
}

async fn reconnect_loop<P: Providers>(
    client: Client<P>,
    server_addr: NetworkAddress,
    mut retry_rx: mpsc::UnboundedReceiver<()>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    let providers = client.inner.providers.clone();
    let time = providers.time().clone();
    let config = client.inner.endpoint.config().clone();
    loop {
        // Triggers from connections torn down before this attempt are stale.
        while retry_rx.try_recv().is_ok() {}

        client.inner.state.set(ClientState::Connecting);
        let local_stream = format!("0.0.0.0:{}", client.inner.local_port.get());
        let server_str = server_addr.to_string();
        let attempt = providers.network().connect(&local_stream, &server_str);
        match time.timeout(config.connect_attempt_timeout, attempt).await {
            Ok(Ok((stream, local_bound))) => {
                match establish(&client, stream, &local_bound, server_addr).await {
                    Ok(()) => {
                        client.inner.state.set(ClientState::Connected);
                        tracing::info!(server = %server_addr, "client connected");
                        tokio::select! {
                            _ = shutdown_rx.recv() => return,
                            trigger = retry_rx.recv() => {
                                if trigger.is_none() {
                                    return;
                                }
                                tracing::info!(server = %server_addr, "connection lost, reconnecting");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(server = %server_addr, "handshake attempt failed: {e}");
                        tokio::select! {
                            _ = shutdown_rx.recv() => return,
                            _ = time.sleep(config.connect_attempt_timeout) => {}
                        }
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(server = %server_addr, "connect failed: {e}");
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = time.sleep(config.connect_attempt_timeout) => {}
                }
            }
            Err(_) => {
                // The attempt consumed its full timeout; it already paced us.
                tracing::debug!(server = %server_addr, "connect attempt timed out");
            }
        }
        if shutdown_rx.try_recv().is_ok() {
            return;
        }
    }
}

/// Complete the handshake over a freshly-connected stream and register the
/// resulting connection.
async fn establish<P: Providers>(
    client: &Client<P>,
    stream: <P::Network as NetworkProvider>::TcpStream,
    local_bound: &str,
    server_addr: NetworkAddress,
) -> Result<(), LinkError> {
    let inner = &client.inner;
    let endpoint = &inner.endpoint;
    let providers = &inner.providers;
    let config = endpoint.config().clone();
    let local_stream_addr = NetworkAddress::parse(local_bound)
        .map_err(|e| LinkError::InvalidAddress(e.to_string()))?;

    // The first attempt uses the socket bound in connect(); a reconnect
    // rebinds on the same datagram port after the prior connection disposed
    // its socket.
    let datagram = match inner.datagram.borrow_mut().take() {
        Some(datagram) => datagram,
        None => {
            let addr = format!("0.0.0.0:{}", inner.datagram_port.get());
            let datagram = DatagramSocket::bind(
                providers,
                &addr,
                endpoint.local_id(),
                endpoint.buffers(),
                endpoint.messages(),
            )
            .await
            .map_err(|e| LinkError::from_bind(&addr, e))?;
            datagram.connect(&server_addr).await.map_err(SocketError::Io)?;
            Rc::new(datagram)
        }
    };

    let stream_socket = StreamSocket::new(
        providers,
        stream,
        endpoint.local_id(),
        server_addr,
        endpoint.buffers(),
        endpoint.messages(),
        &config,
    );
    let mut stream_events = stream_socket
        .take_events()
        .ok_or(LinkError::HandshakeFailed)?;

    // The server speaks first; its initialization packet names our Remote.
    let remote = match providers
        .time()
        .timeout(config.handshake_timeout, stream_events.recv())
        .await
    {
        Ok(Some(SocketEvent::Initialized(remote))) => remote,
        Ok(_) | Err(_) => {
            stream_socket.close();
            *inner.datagram.borrow_mut() = Some(datagram);
            return Err(LinkError::HandshakeFailed);
        }
    };

    endpoint.set_local_endpoints(local_stream_addr, datagram.local_addr());
    let datagram_events = datagram
        .take_events()
        .ok_or(LinkError::HandshakeFailed)?;
    let conn = Connection::new(
        providers.clone(),
        remote,
        stream_socket,
        datagram,
        true,
        config,
        endpoint.messages(),
        endpoint.events_sender(),
    );
    endpoint.register_connection(conn.clone());
    conn.start(stream_events, Some(datagram_events));

    // Answer with our handshake so the server can register us.
    if let Err(e) = endpoint.do_handshake(conn.stream()).await {
        conn.close(CloseStatus::Error);
        return Err(e);
    }
    Ok(())
}
