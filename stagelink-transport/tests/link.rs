//! End-to-end tests over real loopback sockets.
//!
//! Every test builds a current-thread runtime with a `LocalSet` (the task
//! provider spawns with `spawn_local`) and drives real TCP/UDP traffic
//! through `TokioProviders` with aggressive timings.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use stagelink_core::{
    NetworkProvider, Providers, RemoteId, TcpListenerTrait, TokioProviders,
};
use stagelink_transport::wire::{self, HandshakeData, PROTOCOL_VERSION, PacketKind};
use stagelink_transport::{
    Channel, Client, ClientState, CloseStatus, LinkConfig, LinkError, RemoteRegistry, Server,
    SocketError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn run_local<F: std::future::Future>(future: F) -> F::Output {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("runtime");
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(future))
}

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = tokio::time::Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < deadline,
            "condition not met within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Start a server on an ephemeral port and connect a client to it, waiting
/// until both sides observed the handshake.
async fn connected_pair(
    config: &LinkConfig,
) -> (Server<TokioProviders>, Client<TokioProviders>, u16) {
    let server = Server::new(TokioProviders::new(), config.clone());
    server.start(0).await.expect("server start");
    let port = server.local_port().expect("server port");

    let client = Client::new(TokioProviders::new(), config.clone());
    client
        .connect("127.0.0.1", port, 0)
        .await
        .expect("client connect");

    let server_handle = server.clone();
    let client_handle = client.clone();
    wait_until(Duration::from_secs(1), move || {
        server_handle.endpoint().connection_count() == 1
            && client_handle.endpoint().connection_count() == 1
    })
    .await;
    (server, client, port)
}

#[test]
fn test_happy_connect() {
    run_local(async {
        let config = LinkConfig::fast_local();
        let server = Server::new(TokioProviders::new(), config.clone());
        server.start(0).await.expect("server start");
        let port = server.local_port().expect("server port");

        let server_connected = Rc::new(Cell::new(0u32));
        {
            let counter = server_connected.clone();
            server.on_remote_connected(Rc::new(move |_| counter.set(counter.get() + 1)));
        }

        let client = Client::new(TokioProviders::new(), config);
        let client_connected = Rc::new(Cell::new(0u32));
        {
            let counter = client_connected.clone();
            client.on_remote_connected(Rc::new(move |_| counter.set(counter.get() + 1)));
        }

        client
            .connect("127.0.0.1", port, 0)
            .await
            .expect("client connect");

        let (sc, cc) = (server_connected.clone(), client_connected.clone());
        wait_until(Duration::from_secs(1), move || {
            sc.get() == 1 && cc.get() == 1
        })
        .await;

        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(server.endpoint().connected_remotes(), vec![client.local_id()]);
        assert_eq!(client.endpoint().connected_remotes(), vec![server.local_id()]);

        // Exactly once per handshake.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server_connected.get(), 1);
        assert_eq!(client_connected.get(), 1);

        client.stop(true).await;
        server.stop(true).await;
    });
}

#[test]
fn test_reliable_round_trip() {
    run_local(async {
        let config = LinkConfig::fast_local();
        let (server, client, _port) = connected_pair(&config).await;

        let received: Rc<RefCell<Vec<(RemoteId, Channel, Vec<u8>)>>> =
            Rc::new(RefCell::new(Vec::new()));
        {
            let received = received.clone();
            assert!(server.register_message_handler(
                client.local_id(),
                Rc::new(move |message| {
                    received.borrow_mut().push((
                        message.remote(),
                        message.channel(),
                        message.payload().to_vec(),
                    ));
                }),
                true,
            ));
        }

        let body: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
        let mut message =
            client.acquire_message(server.local_id(), Channel::ReliableOrdered, body.len());
        message.payload_mut().extend_from_slice(&body);
        client.send_message(message).expect("send");

        {
            let received = received.clone();
            wait_until(Duration::from_secs(1), move || !received.borrow().is_empty()).await;
        }
        let (from, channel, payload) = received.borrow()[0].clone();
        assert_eq!(from, client.local_id());
        assert_eq!(channel, Channel::ReliableOrdered);
        assert_eq!(payload, body);

        client.stop(true).await;
        server.stop(true).await;
    });
}

#[test]
fn test_unreliable_round_trip() {
    run_local(async {
        let config = LinkConfig::fast_local();
        let (server, client, _port) = connected_pair(&config).await;

        let received: Rc<RefCell<Vec<(Channel, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let received = received.clone();
            assert!(server.register_message_handler(
                client.local_id(),
                Rc::new(move |message| {
                    received
                        .borrow_mut()
                        .push((message.channel(), message.payload().to_vec()));
                }),
                true,
            ));
        }

        // Loopback datagrams are dependable enough for a single send.
        let mut message =
            client.acquire_message(server.local_id(), Channel::UnreliableUnordered, 5);
        message.payload_mut().extend_from_slice(b"pulse");
        client.send_message(message).expect("send");

        {
            let received = received.clone();
            wait_until(Duration::from_secs(1), move || !received.borrow().is_empty()).await;
        }
        let (channel, payload) = received.borrow()[0].clone();
        assert_eq!(channel, Channel::UnreliableUnordered);
        assert_eq!(payload, b"pulse");

        client.stop(true).await;
        server.stop(true).await;
    });
}

#[test]
fn test_buffered_messages_drain_in_order() {
    run_local(async {
        let config = LinkConfig::fast_local();
        let (server, client, _port) = connected_pair(&config).await;

        for i in 0..3u8 {
            let mut message =
                client.acquire_message(server.local_id(), Channel::ReliableOrdered, 4);
            message.payload_mut().extend_from_slice(&[b'm', i]);
            client.send_message(message).expect("send");
        }
        // Let the frames arrive and buffer: no handler is registered yet.
        let server_handle = server.clone();
        wait_until(Duration::from_secs(1), move || {
            server_handle.endpoint().counters().messages_received == 3
        })
        .await;

        let received: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let received = received.clone();
            assert!(server.register_message_handler(
                client.local_id(),
                Rc::new(move |message| received.borrow_mut().push(message.payload().to_vec())),
                true,
            ));
        }
        // Buffered messages are delivered during registration, in order.
        assert_eq!(
            *received.borrow(),
            vec![b"m\x00".to_vec(), b"m\x01".to_vec(), b"m\x02".to_vec()]
        );

        // New messages follow the buffered ones.
        let mut message = client.acquire_message(server.local_id(), Channel::ReliableOrdered, 4);
        message.payload_mut().extend_from_slice(b"m\x03");
        client.send_message(message).expect("send");
        {
            let received = received.clone();
            wait_until(Duration::from_secs(1), move || received.borrow().len() == 4).await;
        }
        assert_eq!(received.borrow()[3], b"m\x03");

        client.stop(true).await;
        server.stop(true).await;
    });
}

#[test]
fn test_buffered_messages_discarded_when_declined() {
    run_local(async {
        let config = LinkConfig::fast_local();
        let (server, client, _port) = connected_pair(&config).await;

        let mut message = client.acquire_message(server.local_id(), Channel::ReliableOrdered, 8);
        message.payload_mut().extend_from_slice(b"early");
        client.send_message(message).expect("send");
        let server_handle = server.clone();
        wait_until(Duration::from_secs(1), move || {
            server_handle.endpoint().counters().messages_received == 1
        })
        .await;

        let received: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let received = received.clone();
            assert!(server.register_message_handler(
                client.local_id(),
                Rc::new(move |message| received.borrow_mut().push(message.payload().to_vec())),
                false,
            ));
        }
        assert!(received.borrow().is_empty());

        let mut message = client.acquire_message(server.local_id(), Channel::ReliableOrdered, 8);
        message.payload_mut().extend_from_slice(b"late");
        client.send_message(message).expect("send");
        {
            let received = received.clone();
            wait_until(Duration::from_secs(1), move || !received.borrow().is_empty()).await;
        }
        assert_eq!(*received.borrow(), vec![b"late".to_vec()]);

        client.stop(true).await;
        server.stop(true).await;
    });
}

#[test]
fn test_register_handler_twice() {
    run_local(async {
        let config = LinkConfig::fast_local();
        let (server, client, _port) = connected_pair(&config).await;

        let handler: stagelink_transport::MessageHandler = Rc::new(|_| {});
        assert!(server.register_message_handler(client.local_id(), handler.clone(), true));
        // Same callback: accepted idempotently.
        assert!(server.register_message_handler(client.local_id(), handler, true));
        // A different callback is refused.
        assert!(!server.register_message_handler(client.local_id(), Rc::new(|_| {}), true));

        client.stop(true).await;
        server.stop(true).await;
    });
}

#[test]
fn test_oversize_datagram_fails_at_source() {
    run_local(async {
        let config = LinkConfig::fast_local();
        let (server, client, _port) = connected_pair(&config).await;

        let mut message =
            client.acquire_message(server.local_id(), Channel::UnreliableUnordered, 70_000);
        message.payload_mut().resize(70_000, 0x5A);
        let result = client.send_message(message);
        assert!(matches!(
            result,
            Err(LinkError::Socket(SocketError::DatagramTooLarge { size: 70_000, .. }))
        ));

        // The connection survives and reliable traffic still flows.
        assert_eq!(client.endpoint().connection_count(), 1);
        let received = Rc::new(Cell::new(false));
        {
            let received = received.clone();
            assert!(server.register_message_handler(
                client.local_id(),
                Rc::new(move |_| received.set(true)),
                true,
            ));
        }
        let mut message = client.acquire_message(server.local_id(), Channel::ReliableOrdered, 4);
        message.payload_mut().extend_from_slice(b"ping");
        client.send_message(message).expect("send");
        {
            let received = received.clone();
            wait_until(Duration::from_secs(1), move || received.get()).await;
        }

        client.stop(true).await;
        server.stop(true).await;
    });
}

#[test]
fn test_graceful_stop_suppresses_reconnect() {
    run_local(async {
        let config = LinkConfig::fast_local();
        let (server, client, _port) = connected_pair(&config).await;

        let disconnect_status: Rc<RefCell<Option<CloseStatus>>> = Rc::new(RefCell::new(None));
        {
            let status = disconnect_status.clone();
            server.on_remote_disconnected(Rc::new(move |_, close_status| {
                *status.borrow_mut() = Some(close_status);
            }));
        }

        client.stop(true).await;
        assert_eq!(client.state(), ClientState::Stopped);

        {
            let status = disconnect_status.clone();
            wait_until(Duration::from_secs(1), move || status.borrow().is_some()).await;
        }
        assert_eq!(*disconnect_status.borrow(), Some(CloseStatus::Graceful));

        // No reconnection: the server sees no new peer.
        tokio::time::sleep(config.connect_attempt_timeout * 3).await;
        assert_eq!(server.endpoint().connection_count(), 0);
        assert_eq!(client.state(), ClientState::Stopped);

        server.stop(true).await;
    });
}

#[test]
fn test_stop_clears_state() {
    run_local(async {
        let config = LinkConfig::fast_local();
        let (server, client, _port) = connected_pair(&config).await;

        // Leave a buffered message behind on the server.
        let mut message = client.acquire_message(server.local_id(), Channel::ReliableOrdered, 4);
        message.payload_mut().extend_from_slice(b"left");
        client.send_message(message).expect("send");
        let server_handle = server.clone();
        wait_until(Duration::from_secs(1), move || {
            server_handle.endpoint().counters().messages_received == 1
        })
        .await;

        server.stop(true).await;
        assert!(!server.endpoint().is_running());
        assert_eq!(server.endpoint().connection_count(), 0);
        assert!(server.endpoint().connected_remotes().is_empty());
        // Handler registration needs a live connection; everything is gone.
        assert!(!server.register_message_handler(client.local_id(), Rc::new(|_| {}), true));

        client.stop(true).await;
        assert!(!client.endpoint().is_running());
        assert_eq!(client.endpoint().connection_count(), 0);
    });
}

#[test]
fn test_broadcast_reaches_every_client() {
    run_local(async {
        let config = LinkConfig::fast_local();
        let server = Server::new(TokioProviders::new(), config.clone());
        server.start(0).await.expect("server start");
        let port = server.local_port().expect("server port");

        let mut clients = Vec::new();
        let mut hits = Vec::new();
        for _ in 0..2 {
            let client = Client::new(TokioProviders::new(), config.clone());
            client
                .connect("127.0.0.1", port, 0)
                .await
                .expect("client connect");
            let hit: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
            clients.push(client);
            hits.push(hit);
        }
        let server_handle = server.clone();
        wait_until(Duration::from_secs(1), move || {
            server_handle.endpoint().connection_count() == 2
        })
        .await;
        for (client, hit) in clients.iter().zip(&hits) {
            let hit = hit.clone();
            assert!(client.register_message_handler(
                server.local_id(),
                Rc::new(move |message| hit.borrow_mut().push(message.payload().to_vec())),
                true,
            ));
        }

        let mut message =
            server.acquire_message(RemoteId::BROADCAST, Channel::ReliableOrdered, 4);
        message.payload_mut().extend_from_slice(b"take");
        server.send_message(message).expect("broadcast");

        for hit in &hits {
            let waiter = hit.clone();
            wait_until(Duration::from_secs(1), move || !waiter.borrow().is_empty()).await;
            assert_eq!(*hit.borrow(), vec![b"take".to_vec()]);
        }

        for client in &clients {
            client.stop(true).await;
        }
        server.stop(true).await;
    });
}

#[test]
fn test_version_mismatch_refuses_handshake() {
    run_local(async {
        let providers = TokioProviders::new();
        let config = LinkConfig::fast_local();

        // A fake server speaking the wrong protocol version.
        let listener = providers
            .network()
            .bind("127.0.0.1:0")
            .await
            .expect("bind");
        let listener_addr = listener.local_addr().expect("addr");
        let advertised =
            stagelink_core::NetworkAddress::parse(&listener_addr).expect("parse");
        tokio::task::spawn_local(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let payload = wire::encode_handshake(
                    &wire::ProtocolVersion::new(9, 9, 9, 9),
                    &HandshakeData {
                        id: RemoteId::new(0x5E, 0x5E),
                        stream_addr: advertised,
                        datagram_addr: advertised,
                    },
                )
                .expect("encode");
                let frame = wire::encode_frame(
                    RemoteId::new(0x5E, 0x5E),
                    PacketKind::Initialization,
                    &payload,
                )
                .expect("frame");
                let _ = stream.write_all(&frame).await;
                // Keep the stream open; the client must close it.
                let mut sink = vec![0u8; 1024];
                while let Ok(n) = stream.read(&mut sink).await {
                    if n == 0 {
                        break;
                    }
                }
            }
        });

        let client = Client::new(providers, config.clone());
        let connected = Rc::new(Cell::new(false));
        {
            let connected = connected.clone();
            client.on_remote_connected(Rc::new(move |_| connected.set(true)));
        }
        client
            .connect("127.0.0.1", advertised.port, 0)
            .await
            .expect("connect starts");

        // Several attempt windows later: no connection was ever registered
        // and the mismatched remote never entered the registry.
        tokio::time::sleep(config.connect_attempt_timeout * 4).await;
        assert!(!connected.get());
        assert_eq!(client.endpoint().connection_count(), 0);
        assert!(client.endpoint().connected_remotes().is_empty());
        assert!(RemoteRegistry::is_empty());
        assert_eq!(client.state(), ClientState::Connecting);

        client.stop(false).await;
    });
}

#[test]
fn test_heartbeat_loss_times_out_and_reconnects() {
    run_local(async {
        let providers = TokioProviders::new();
        let config = LinkConfig::fast_local();

        // A fake server that completes a valid handshake but never sends a
        // single heartbeat.
        let listener = providers
            .network()
            .bind("127.0.0.1:0")
            .await
            .expect("bind");
        let listener_addr = listener.local_addr().expect("addr");
        let advertised =
            stagelink_core::NetworkAddress::parse(&listener_addr).expect("parse");
        let accepts = Rc::new(Cell::new(0u32));
        {
            let accepts = accepts.clone();
            tokio::task::spawn_local(async move {
                loop {
                    let Ok((mut stream, _)) = listener.accept().await else {
                        return;
                    };
                    accepts.set(accepts.get() + 1);
                    let payload = wire::encode_handshake(
                        &PROTOCOL_VERSION,
                        &HandshakeData {
                            id: RemoteId::new(0xFA, 0xCE),
                            stream_addr: advertised,
                            datagram_addr: advertised,
                        },
                    )
                    .expect("encode");
                    let frame = wire::encode_frame(
                        RemoteId::new(0xFA, 0xCE),
                        PacketKind::Initialization,
                        &payload,
                    )
                    .expect("frame");
                    let _ = stream.write_all(&frame).await;
                    // Swallow whatever the client sends, forever.
                    tokio::task::spawn_local(async move {
                        let mut sink = vec![0u8; 4096];
                        while let Ok(n) = stream.read(&mut sink).await {
                            if n == 0 {
                                break;
                            }
                        }
                    });
                }
            });
        }

        let client = Client::new(providers, config.clone());
        let statuses: Rc<RefCell<Vec<CloseStatus>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let statuses = statuses.clone();
            client.on_remote_disconnected(Rc::new(move |_, status| {
                statuses.borrow_mut().push(status);
            }));
        }
        client
            .connect("127.0.0.1", advertised.port, 0)
            .await
            .expect("connect starts");

        // The watchdog closes the silent connection with Timeout...
        {
            let statuses = statuses.clone();
            wait_until(
                config.disconnect_threshold() + Duration::from_secs(2),
                move || !statuses.borrow().is_empty(),
            )
            .await;
        }
        assert_eq!(statuses.borrow()[0], CloseStatus::Timeout);

        // ...and the reconnect loop dials again.
        {
            let accepts = accepts.clone();
            wait_until(Duration::from_secs(3), move || accepts.get() >= 2).await;
        }

        client.stop(false).await;
    });
}
