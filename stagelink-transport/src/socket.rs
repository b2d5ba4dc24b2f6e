//! Per-socket send/receive engines for the stream and datagram transports.
//!
//! Each socket owns its I/O tasks and exposes decoded frames through a
//! single-consumer event stream obtained with `take_events()`. The receive
//! path intercepts initialization packets: it validates the protocol
//! version, constructs or reuses the peer's [`Remote`], and surfaces
//! [`SocketEvent::Initialized`] instead of a raw packet.
//!
//! Sends come in two modes. The synchronous send awaits a per-frame
//! completion acknowledgement from the writer task, bounded by the reliable
//! send timeout. The asynchronous send enqueues the frame and returns
//! immediately; the writer task releases the frame buffer once the
//! transport accepts it.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::Duration;

use stagelink_core::{
    NetworkAddress, NetworkProvider, Providers, RemoteId, TaskProvider, TimeProvider,
    UdpSocketTrait,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::config::LinkConfig;
use crate::pool::{BufferPool, Channel, Message, MessagePool};
use crate::remote::{Remote, RemoteRegistry};
use crate::wire::{
    self, FrameHeader, HEADER_SIZE, MAX_DATAGRAM_SIZE, MAX_DATAGRAM_PAYLOAD, MAX_FRAME_PAYLOAD,
    PROTOCOL_VERSION, PacketKind, WireError,
};

/// Errors surfaced by socket operations.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// The socket (or its writer) has shut down.
    #[error("socket closed")]
    Closed,

    /// A synchronous send exceeded the reliable send timeout.
    #[error("send timed out")]
    Timeout,

    /// An outbound datagram frame would exceed the transport ceiling.
    #[error("datagram payload too large: {size} bytes (max {max})")]
    DatagramTooLarge {
        /// Payload size that was attempted.
        size: usize,
        /// Largest payload a datagram frame can carry.
        max: usize,
    },

    /// A wire-level encoding failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// An I/O failure reported by the transport.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Events produced by a socket's receive path.
#[derive(Debug)]
pub enum SocketEvent {
    /// A decoded non-handshake frame.
    Packet(PacketKind, Message),
    /// A valid initialization packet was intercepted; the peer's `Remote`
    /// has been constructed or reused.
    Initialized(Rc<Remote>),
    /// The receive loop stopped on a fatal error (peer loss on stream).
    Error(io::Error),
    /// The receive loop stopped silently (EOF or shutdown-class error, or a
    /// refused handshake).
    Closed,
}

/// What the receive/send loops do with a given I/O error.
enum ErrorDisposition {
    /// Transient during warm-up; rearm the loop.
    Retry,
    /// Expected teardown; stop silently.
    Shutdown,
    /// Peer loss or unexpected failure; report and stop.
    Fatal,
}

fn classify_error(kind: io::ErrorKind) -> ErrorDisposition {
    use io::ErrorKind::*;
    match kind {
        WouldBlock | NotConnected | Interrupted => ErrorDisposition::Retry,
        UnexpectedEof | ConnectionAborted | BrokenPipe => ErrorDisposition::Shutdown,
        _ => ErrorDisposition::Fatal,
    }
}

/// Decode and act on an intercepted initialization payload.
///
/// Returns `false` if the socket must stop (version mismatch). Protocol
/// violations short of that are logged and dropped without closing.
fn handle_initialization(
    payload: &[u8],
    observed_peer_ip: IpAddr,
    events: &mpsc::UnboundedSender<SocketEvent>,
) -> bool {
    let (version, data) = match wire::decode_handshake(payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::warn!("dropping invalid initialization payload: {e}");
            return true;
        }
    };
    if version != PROTOCOL_VERSION {
        tracing::warn!(
            theirs = %version,
            ours = %PROTOCOL_VERSION,
            "refusing handshake: protocol version mismatch"
        );
        let _ = events.send(SocketEvent::Closed);
        return false;
    }
    if !data.id.is_valid() || data.id.is_broadcast() {
        tracing::warn!(id = %data.id, "dropping initialization with invalid sender id");
        return true;
    }
    // Peers behind a wildcard bind advertise 0.0.0.0; substitute the address
    // we actually observed.
    let stream_addr = if data.stream_addr.is_unspecified() {
        data.stream_addr.with_ip(observed_peer_ip)
    } else {
        data.stream_addr
    };
    let datagram_addr = if data.datagram_addr.is_unspecified() {
        data.datagram_addr.with_ip(observed_peer_ip)
    } else {
        data.datagram_addr
    };
    let remote = RemoteRegistry::get_or_insert(data.id, stream_addr, datagram_addr);
    events.send(SocketEvent::Initialized(remote)).is_ok()
}

struct StreamSendOp {
    frame: Vec<u8>,
    ack: Option<oneshot::Sender<io::Result<()>>>,
}

/// Send/receive engine for one connected stream.
///
/// Frames are length-prefixed: the receive loop reads exactly
/// [`HEADER_SIZE`] bytes, decodes the header, then reads exactly
/// `data_length` payload bytes into a pooled message.
pub struct StreamSocket<P: Providers> {
    local_id: RemoteId,
    peer_addr: NetworkAddress,
    writer_tx: mpsc::UnboundedSender<StreamSendOp>,
    events_rx: RefCell<Option<mpsc::UnboundedReceiver<SocketEvent>>>,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
    buffers: BufferPool,
    time: P::Time,
    send_timeout: Duration,
    closed: Cell<bool>,
}

impl<P: Providers> StreamSocket<P> {
    /// Wrap an already-connected stream.
    ///
    /// The stream arrives pre-configured by the network provider (Nagle
    /// disabled, linger zero). Spawns the receive loop and the writer task.
    pub(crate) fn new(
        providers: &P,
        stream: <P::Network as NetworkProvider>::TcpStream,
        local_id: RemoteId,
        peer_addr: NetworkAddress,
        buffers: BufferPool,
        messages: MessagePool,
        config: &LinkConfig,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let read_handle = providers.task().spawn_task(
            "stream_receive",
            stream_receive_loop(read_half, peer_addr, messages, events_tx.clone()),
        );
        let write_handle = providers.task().spawn_task(
            "stream_send",
            stream_send_loop(write_half, writer_rx, buffers.clone(), events_tx),
        );

        Self {
            local_id,
            peer_addr,
            writer_tx,
            events_rx: RefCell::new(Some(events_rx)),
            read_handle,
            write_handle,
            buffers,
            time: providers.time().clone(),
            send_timeout: config.send_timeout,
            closed: Cell::new(false),
        }
    }

    /// Take the single-consumer event stream. Returns `None` if already taken.
    pub(crate) fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SocketEvent>> {
        self.events_rx.borrow_mut().take()
    }

    /// The peer address this socket is connected to.
    pub(crate) fn peer_addr(&self) -> NetworkAddress {
        self.peer_addr
    }

    fn encode(&self, kind: PacketKind, payload: &[u8]) -> Result<Vec<u8>, SocketError> {
        let mut frame = self.buffers.get(HEADER_SIZE + payload.len());
        match wire::encode_frame_into(&mut frame, self.local_id, kind, payload) {
            Ok(()) => Ok(frame),
            Err(e) => {
                self.buffers.release(frame);
                Err(e.into())
            }
        }
    }

    /// Synchronous send: blocks the caller until the transport accepts the
    /// frame or the reliable send timeout elapses.
    pub(crate) async fn send(&self, kind: PacketKind, payload: &[u8]) -> Result<(), SocketError> {
        let frame = self.encode(kind, payload)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.writer_tx
            .send(StreamSendOp {
                frame,
                ack: Some(ack_tx),
            })
            .map_err(|_| SocketError::Closed)?;
        match self.time.timeout(self.send_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(SocketError::Io(e)),
            Ok(Err(_)) => Err(SocketError::Closed),
            Err(_) => Err(SocketError::Timeout),
        }
    }

    /// Asynchronous send: submits the frame and returns immediately.
    pub(crate) fn send_async(&self, kind: PacketKind, payload: &[u8]) -> Result<(), SocketError> {
        let frame = self.encode(kind, payload)?;
        self.writer_tx
            .send(StreamSendOp { frame, ack: None })
            .map_err(|_| SocketError::Closed)
    }

    /// Stop both I/O tasks. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.read_handle.abort();
        self.write_handle.abort();
        tracing::debug!(peer = %self.peer_addr, "stream socket closed");
    }
}

impl<P: Providers> Drop for StreamSocket<P> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn stream_receive_loop<R>(
    mut read: R,
    peer_addr: NetworkAddress,
    messages: MessagePool,
    events: mpsc::UnboundedSender<SocketEvent>,
) where
    R: AsyncReadExt + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    loop {
        if let Err(e) = read.read_exact(&mut header_buf).await {
            match classify_error(e.kind()) {
                ErrorDisposition::Retry => continue,
                ErrorDisposition::Shutdown => {
                    let _ = events.send(SocketEvent::Closed);
                }
                ErrorDisposition::Fatal => {
                    tracing::warn!(peer = %peer_addr, "stream receive failed: {e}");
                    let _ = events.send(SocketEvent::Error(e));
                }
            }
            return;
        }

        let header = match FrameHeader::deserialize(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                // Header is fixed-size; this cannot happen once 24 bytes
                // were read, but the codec keeps the check.
                tracing::warn!(peer = %peer_addr, "undecodable frame header: {e}");
                let _ = events.send(SocketEvent::Closed);
                return;
            }
        };
        let data_length = header.data_length as usize;
        if data_length > MAX_FRAME_PAYLOAD {
            // A corrupt length would otherwise make us allocate unboundedly
            // and desynchronize the frame stream for good.
            tracing::warn!(
                peer = %peer_addr,
                length = data_length,
                "frame length exceeds ceiling, closing stream"
            );
            let _ = events.send(SocketEvent::Error(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame length exceeds ceiling",
            )));
            return;
        }

        let mut message = messages.acquire(header.sender, Channel::ReliableOrdered, data_length);
        message.payload_mut().resize(data_length, 0);
        if let Err(e) = read.read_exact(message.payload_mut()).await {
            match classify_error(e.kind()) {
                ErrorDisposition::Retry | ErrorDisposition::Shutdown => {
                    let _ = events.send(SocketEvent::Closed);
                }
                ErrorDisposition::Fatal => {
                    tracing::warn!(peer = %peer_addr, "stream receive failed mid-frame: {e}");
                    let _ = events.send(SocketEvent::Error(e));
                }
            }
            return;
        }

        tracing::trace!(
            peer = %peer_addr,
            sender = %header.sender,
            kind = ?header.kind,
            len = data_length,
            "stream frame received"
        );

        match header.kind {
            PacketKind::Initialization => {
                if !handle_initialization(message.payload(), peer_addr.ip, &events) {
                    return;
                }
            }
            kind => {
                if events.send(SocketEvent::Packet(kind, message)).is_err() {
                    return;
                }
            }
        }
    }
}

async fn stream_send_loop<W>(
    mut write: W,
    mut writer_rx: mpsc::UnboundedReceiver<StreamSendOp>,
    buffers: BufferPool,
    events: mpsc::UnboundedSender<SocketEvent>,
) where
    W: AsyncWriteExt + Unpin,
{
    while let Some(op) = writer_rx.recv().await {
        let result = write.write_all(&op.frame).await;
        buffers.release(op.frame);
        match result {
            Ok(()) => {
                if let Some(ack) = op.ack {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                let kind = e.kind();
                match op.ack {
                    Some(ack) => {
                        let _ = ack.send(Err(e));
                    }
                    None => match classify_error(kind) {
                        ErrorDisposition::Fatal => {
                            tracing::warn!("stream send failed: {kind}");
                            let _ = events.send(SocketEvent::Error(kind.into()));
                        }
                        _ => {
                            let _ = events.send(SocketEvent::Closed);
                        }
                    },
                }
                return;
            }
        }
    }
}

struct DatagramSendOp {
    frame: Vec<u8>,
    dest: Option<NetworkAddress>,
}

/// Send/receive engine for one bound datagram socket.
///
/// Every completed receive is one full frame. On the server a single socket
/// is shared by all connections (sends carry an explicit destination);
/// on the client the socket is connected and the OS rejects datagrams from
/// anyone but the server.
pub struct DatagramSocket<P: Providers> {
    socket: Rc<<P::Network as NetworkProvider>::UdpSocket>,
    local_id: RemoteId,
    local_addr: NetworkAddress,
    writer_tx: mpsc::UnboundedSender<DatagramSendOp>,
    events_rx: RefCell<Option<mpsc::UnboundedReceiver<SocketEvent>>>,
    recv_handle: tokio::task::JoinHandle<()>,
    send_handle: tokio::task::JoinHandle<()>,
    buffers: BufferPool,
    closed: Cell<bool>,
}

impl<P: Providers> DatagramSocket<P> {
    /// Bind a datagram socket and start its I/O tasks.
    pub(crate) async fn bind(
        providers: &P,
        addr: &str,
        local_id: RemoteId,
        buffers: BufferPool,
        messages: MessagePool,
    ) -> io::Result<Self> {
        let socket = Rc::new(providers.network().bind_udp(addr).await?);
        let local_addr = NetworkAddress::parse(&socket.local_addr()?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let recv_handle = providers.task().spawn_task(
            "datagram_receive",
            datagram_receive_loop(socket.clone(), messages, events_tx),
        );
        let send_handle = providers.task().spawn_task(
            "datagram_send",
            datagram_send_loop(socket.clone(), writer_rx, buffers.clone()),
        );

        tracing::debug!(local = %local_addr, "datagram socket bound");

        Ok(Self {
            socket,
            local_id,
            local_addr,
            writer_tx,
            events_rx: RefCell::new(Some(events_rx)),
            recv_handle,
            send_handle,
            buffers,
            closed: Cell::new(false),
        })
    }

    /// Lock the socket to one peer (client side).
    pub(crate) async fn connect(&self, addr: &NetworkAddress) -> io::Result<()> {
        self.socket.connect(&addr.to_string()).await
    }

    /// The local address this socket is bound to.
    pub(crate) fn local_addr(&self) -> NetworkAddress {
        self.local_addr
    }

    /// Take the single-consumer event stream. Returns `None` if already taken.
    pub(crate) fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SocketEvent>> {
        self.events_rx.borrow_mut().take()
    }

    /// Asynchronous send. `dest` is required for shared sockets and must be
    /// `None` for connected ones.
    ///
    /// Frames exceeding the datagram ceiling fail here, before submission.
    pub(crate) fn send_async(
        &self,
        kind: PacketKind,
        payload: &[u8],
        dest: Option<NetworkAddress>,
    ) -> Result<(), SocketError> {
        if payload.len() > MAX_DATAGRAM_PAYLOAD {
            return Err(SocketError::DatagramTooLarge {
                size: payload.len(),
                max: MAX_DATAGRAM_PAYLOAD,
            });
        }
        let mut frame = self.buffers.get(HEADER_SIZE + payload.len());
        if let Err(e) = wire::encode_frame_into(&mut frame, self.local_id, kind, payload) {
            self.buffers.release(frame);
            return Err(e.into());
        }
        debug_assert!(frame.len() <= MAX_DATAGRAM_SIZE);
        self.writer_tx
            .send(DatagramSendOp { frame, dest })
            .map_err(|_| SocketError::Closed)
    }

    /// Stop both I/O tasks. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.recv_handle.abort();
        self.send_handle.abort();
        tracing::debug!(local = %self.local_addr, "datagram socket closed");
    }
}

impl<P: Providers> Drop for DatagramSocket<P> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn datagram_receive_loop<U>(
    socket: Rc<U>,
    messages: MessagePool,
    events: mpsc::UnboundedSender<SocketEvent>,
) where
    U: UdpSocketTrait,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            // Some platforms deliver the ICMP unreachable of a *prior* send
            // as a reset on receive; the channel is lossy, ignore it.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => match classify_error(e.kind()) {
                ErrorDisposition::Retry => continue,
                _ => {
                    let _ = events.send(SocketEvent::Closed);
                    return;
                }
            },
        };

        let (header, payload) = match wire::decode_datagram(&buf[..len]) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(%from, "dropping undecodable datagram: {e}");
                continue;
            }
        };

        tracing::trace!(
            %from,
            sender = %header.sender,
            kind = ?header.kind,
            len = payload.len(),
            "datagram frame received"
        );

        if header.kind == PacketKind::Initialization {
            let peer_ip = match NetworkAddress::parse(&from) {
                Ok(addr) => addr.ip,
                Err(_) => continue,
            };
            if !handle_initialization(payload, peer_ip, &events) {
                return;
            }
            continue;
        }

        let mut message =
            messages.acquire(header.sender, Channel::UnreliableUnordered, payload.len());
        message.payload_mut().extend_from_slice(payload);
        if events.send(SocketEvent::Packet(header.kind, message)).is_err() {
            return;
        }
    }
}

async fn datagram_send_loop<U>(
    socket: Rc<U>,
    mut writer_rx: mpsc::UnboundedReceiver<DatagramSendOp>,
    buffers: BufferPool,
) where
    U: UdpSocketTrait,
{
    while let Some(op) = writer_rx.recv().await {
        let result = match &op.dest {
            Some(dest) => socket.send_to(&op.frame, &dest.to_string()).await,
            None => socket.send(&op.frame).await,
        };
        buffers.release(op.frame);
        if let Err(e) = result {
            // Lossy channel: a failed datagram send never tears anything
            // down, resets included.
            tracing::debug!("datagram send failed: {e}");
        }
    }
}
