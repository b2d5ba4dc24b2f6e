//! # StageLink Transport Layer
//!
//! Dual-channel networking substrate for StageLink live capture: a framed
//! message protocol carried simultaneously over a stream transport
//! (reliable, ordered) and a datagram transport (unreliable, unordered),
//! with identity-based addressing of remotes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              Application Code                    │
//! │      Uses Client / Server + handlers            │
//! ├─────────────────────────────────────────────────┤
//! │     NetworkEndpoint (remote routing)            │
//! │     • One connection per remote id              │
//! │     • Handler table with buffering              │
//! ├─────────────────────────────────────────────────┤
//! │     Connection (liveness + dispatch)            │
//! │     • Heartbeat producer and watchdog           │
//! │     • Channel-aware send routing                │
//! ├─────────────────────────────────────────────────┤
//! │     Sockets + Wire Format                       │
//! │     • Length-prefixed frames on the stream      │
//! │     • One frame per datagram                    │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`Client`] | Active connector with an automatic reconnect loop |
//! | [`Server`] | Passive acceptor with a shared datagram socket |
//! | [`NetworkEndpoint`] | Remote table, handler registry, lifecycle events |
//! | [`wire`] | Frame codec and the version handshake |
//! | [`pool`] | Pooled messages and byte buffers |
//!
//! ## Quick Start
//!
//! ```ignore
//! use stagelink_core::TokioProviders;
//! use stagelink_transport::{Channel, Client, LinkConfig, Server};
//!
//! let server = Server::new(TokioProviders::new(), LinkConfig::default());
//! server.start(9000).await?;
//!
//! let client = Client::new(TokioProviders::new(), LinkConfig::default());
//! client.connect("127.0.0.1", 9000, 0).await?;
//! ```
//!
//! All tasks run on a single-threaded cooperative scheduler (the providers'
//! task spawner); application handlers are invoked on it in arrival order
//! and never overlap.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Client reconnect loop over a [`NetworkEndpoint`].
pub mod client;

/// Configuration knobs.
pub mod config;

/// Per-remote connections with heartbeat liveness.
pub mod connection;

/// Shared endpoint machinery beneath client and server.
pub mod endpoint;

/// Error types for the link layer.
pub mod error;

/// Pooled messages and byte buffers.
pub mod pool;

/// Remote identities and the process-wide registry.
pub mod remote;

/// Server accept loop and datagram demultiplexing.
pub mod server;

/// Stream and datagram socket engines.
pub mod socket;

/// Frame codec and the version handshake.
pub mod wire;

// Client / server exports
pub use client::{Client, ClientState};
pub use server::Server;

// Endpoint exports
pub use endpoint::{
    ConnectedCallback, DisconnectedCallback, EndpointCounters, LifecycleCallback, MessageHandler,
    NetworkEndpoint,
};

// Connection exports
pub use connection::{CloseStatus, Connection, ConnectionState};

// Pool exports
pub use pool::{BufferPool, Channel, LARGE_PAYLOAD_THRESHOLD, Message, MessagePool};

// Remote exports
pub use remote::{Remote, RemoteRegistry};

// Wire format exports
pub use wire::{
    HEADER_SIZE, MAX_DATAGRAM_PAYLOAD, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION, PacketKind,
    ProtocolVersion,
};

// Error exports
pub use config::LinkConfig;
pub use error::LinkError;
pub use socket::{SocketError, SocketEvent};
