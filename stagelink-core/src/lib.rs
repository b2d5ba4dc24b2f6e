//! # stagelink-core
//!
//! Core abstractions for the StageLink networking substrate.
//!
//! This crate provides the foundational traits and types the transport layer
//! is written against. Application code depends on these abstractions rather
//! than on concrete I/O, so the same transport logic runs over real Tokio
//! networking in production and over test doubles in deterministic tests.
//!
//! ## The Provider Pattern
//!
//! The transport interacts with the outside world through a small set of
//! operations: time, networking, task spawning, and randomness. Each is
//! abstracted behind a trait with a Tokio-backed production implementation:
//!
//! | Trait | Production | Purpose |
//! |-------|------------|---------|
//! | [`TimeProvider`] | Wall clock | Sleep, timeout, now() |
//! | [`TaskProvider`] | `spawn_local` | Cooperative task spawning |
//! | [`RandomProvider`] | Thread-local RNG | Identity generation |
//! | [`NetworkProvider`] | Tokio TCP/UDP | Connect, listen, bind |
//!
//! [`TaskProvider`] doubles as the *foreground executor*: every task it
//! spawns runs on the same single-threaded cooperative scheduler, so
//! application-visible callbacks never overlap and observe a deterministic
//! ordering.
//!
//! **Important**: transport code never calls tokio directly.
//! - ❌ `tokio::time::sleep()`
//! - ✅ `time_provider.sleep()`
//!
//! ## Core Types
//!
//! - [`RemoteId`]: 128-bit identity of a peer process
//! - [`NetworkAddress`]: IP address + port

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod network;
mod providers;
mod random;
mod task;
mod time;
mod types;

// Provider trait exports
pub use network::{
    NetworkProvider, TcpListenerTrait, TokioNetworkProvider, TokioTcpListener, TokioUdpSocket,
    UdpSocketTrait,
};
pub use providers::{Providers, TokioProviders};
pub use random::{RandomProvider, TokioRandomProvider};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};

// Core type exports
pub use types::{NetworkAddress, NetworkAddressParseError, RemoteId};
