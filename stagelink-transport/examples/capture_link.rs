//! Capture-link example: a server and a client exchanging frames over both
//! channels on real sockets.
//!
//! Run as two separate processes:
//!
//! ```bash
//! # Terminal 1 - Start the server
//! cargo run --example capture_link -- server
//!
//! # Terminal 2 - Run the client
//! cargo run --example capture_link -- client
//! ```
//!
//! The server echoes every reliable message it receives; the client sends a
//! burst of reliable slate messages and a stream of unreliable pose packets.

use std::cell::Cell;
use std::env;
use std::rc::Rc;
use std::time::Duration;

use stagelink_core::TokioProviders;
use stagelink_transport::{Channel, Client, LinkConfig, Server};

const PORT: u16 = 9000;

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== StageLink Server ===\n");

    let server = Server::new(TokioProviders::new(), LinkConfig::default());

    {
        let server_echo = server.clone();
        server.on_remote_connected(Rc::new(move |remote| {
            println!("remote connected: {}", remote.id);
            let server_echo = server_echo.clone();
            let remote_id = remote.id;
            // Echo reliable traffic back; count unreliable pose packets.
            let poses = Rc::new(Cell::new(0u64));
            server_echo.clone().register_message_handler(
                remote_id,
                Rc::new(move |message| match message.channel() {
                    Channel::ReliableOrdered => {
                        println!(
                            "slate from {}: {:?}",
                            message.remote(),
                            String::from_utf8_lossy(message.payload())
                        );
                        let mut reply = server_echo.acquire_message(
                            message.remote(),
                            Channel::ReliableOrdered,
                            message.len(),
                        );
                        reply.payload_mut().extend_from_slice(message.payload());
                        if let Err(e) = server_echo.send_message(reply) {
                            eprintln!("echo failed: {e}");
                        }
                    }
                    Channel::UnreliableUnordered => {
                        poses.set(poses.get() + 1);
                        if poses.get() % 60 == 0 {
                            println!("{} pose packets received", poses.get());
                        }
                    }
                }),
                true,
            );
        }));
    }
    {
        server.on_remote_disconnected(Rc::new(|remote, status| {
            println!("remote disconnected: {} ({status:?})", remote.id);
        }));
    }

    server.start(PORT).await?;
    println!("listening on port {PORT}\n");

    // Serve until interrupted.
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
}

async fn run_client() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== StageLink Client ===\n");

    let client = Client::new(TokioProviders::new(), LinkConfig::default());

    let server_id = Rc::new(Cell::new(None));
    {
        let server_id = server_id.clone();
        let client_handle = client.clone();
        client.on_remote_connected(Rc::new(move |remote| {
            println!("connected to server {}", remote.id);
            server_id.set(Some(remote.id));
            client_handle.register_message_handler(
                remote.id,
                Rc::new(|message| {
                    println!(
                        "echo from server: {:?}",
                        String::from_utf8_lossy(message.payload())
                    );
                }),
                true,
            );
        }));
    }

    client.connect("127.0.0.1", PORT, 0).await?;

    // Wait for the handshake.
    while server_id.get().is_none() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let server_id = server_id.get().expect("server id");

    // A few reliable slate messages.
    for take in 1..=3u32 {
        let body = format!("scene 12 take {take}");
        let mut message =
            client.acquire_message(server_id, Channel::ReliableOrdered, body.len());
        message.payload_mut().extend_from_slice(body.as_bytes());
        client.send_message(message)?;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // A second of 60 Hz pose packets over the unreliable channel.
    for frame in 0u32..60 {
        let mut message = client.acquire_message(server_id, Channel::UnreliableUnordered, 16);
        message.payload_mut().extend_from_slice(&frame.to_le_bytes());
        message.payload_mut().extend_from_slice(&[0u8; 12]);
        client.send_message(message)?;
        tokio::time::sleep(Duration::from_millis(16)).await;
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    client.stop(true).await;
    println!("\ndone");
    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    // Current-thread runtime with a LocalSet: the task provider spawns with
    // spawn_local.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("failed to build runtime");
    let local = tokio::task::LocalSet::new();

    match mode {
        "server" => runtime.block_on(local.run_until(async {
            if let Err(e) = run_server().await {
                eprintln!("server error: {e}");
                std::process::exit(1);
            }
        })),
        "client" => runtime.block_on(local.run_until(async {
            if let Err(e) = run_client().await {
                eprintln!("client error: {e}");
                std::process::exit(1);
            }
        })),
        _ => {
            println!("StageLink capture-link example\n");
            println!("Usage:");
            println!("  cargo run --example capture_link -- server   # Start the server");
            println!("  cargo run --example capture_link -- client   # Run the client\n");
            println!("Run the server first in one terminal, then the client in another.");
        }
    }
}
