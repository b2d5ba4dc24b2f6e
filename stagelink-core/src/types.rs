//! Core types for remote addressing.
//!
//! This module provides the fundamental types for peer identity in StageLink:
//! - [`RemoteId`]: 128-bit unique identifier assigned once per process
//! - [`NetworkAddress`]: IP address + port

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::RandomProvider;

/// 128-bit unique identifier for a remote process.
///
/// Every StageLink process mints one id at startup and uses it for the
/// lifetime of the process. The all-ones pattern is reserved for
/// [`RemoteId::BROADCAST`], which is only meaningful as an outbound send
/// target and never appears as a wire sender.
///
/// # Examples
///
/// ```
/// use stagelink_core::RemoteId;
///
/// let id = RemoteId::new(0x123, 0x456);
/// assert!(id.is_valid());
/// assert!(!id.is_broadcast());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RemoteId {
    /// First 64 bits.
    pub first: u64,
    /// Second 64 bits.
    pub second: u64,
}

impl RemoteId {
    /// Sentinel targeting every connected remote at once.
    ///
    /// Valid only for outbound sends; the registry never stores it.
    pub const BROADCAST: RemoteId = RemoteId::new(u64::MAX, u64::MAX);

    /// Create an id with explicit values.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// Mint a fresh random id.
    ///
    /// Guaranteed to be valid and distinct from the broadcast sentinel.
    pub fn generate<R: RandomProvider>(random: &R) -> Self {
        loop {
            let id = Self::new(random.random(), random.random());
            if id.is_valid() && !id.is_broadcast() {
                return id;
            }
        }
    }

    /// Check whether this is the broadcast sentinel.
    pub const fn is_broadcast(&self) -> bool {
        self.first == u64::MAX && self.second == u64::MAX
    }

    /// Check whether the id is valid (non-zero).
    pub const fn is_valid(&self) -> bool {
        self.first != 0 || self.second != 0
    }

    /// The 16-byte wire form: both halves little-endian.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.first.to_le_bytes());
        bytes[8..].copy_from_slice(&self.second.to_le_bytes());
        bytes
    }

    /// Reconstruct an id from its 16-byte wire form.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let first = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);
        let second = u64::from_le_bytes([
            bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ]);
        Self { first, second }
    }
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

/// Network address (IPv4/IPv6 + port).
///
/// # Examples
///
/// ```
/// use stagelink_core::NetworkAddress;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4500);
/// assert_eq!(addr.to_string(), "127.0.0.1:4500");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// IP address (IPv4 or IPv6).
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
}

impl NetworkAddress {
    /// Create a new network address.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Parse an `ip:port` string; IPv6 hosts use bracket notation
    /// (`[::1]:4500`).
    ///
    /// # Errors
    ///
    /// Reports whether the host or the port part was at fault, carrying the
    /// original input.
    pub fn parse(s: &str) -> Result<Self, NetworkAddressParseError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| NetworkAddressParseError::BadPort { input: s.into() })?;
        let port: u16 = port
            .parse()
            .map_err(|_| NetworkAddressParseError::BadPort { input: s.into() })?;
        // A bracketed host is IPv6; the brackets themselves are not part of
        // the address.
        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or(NetworkAddressParseError::BadHost { input: s.into() })?,
            None => host,
        };
        let ip: IpAddr = host
            .parse()
            .map_err(|_| NetworkAddressParseError::BadHost { input: s.into() })?;
        Ok(Self::new(ip, port))
    }

    /// Convert to a standard library socket address.
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Whether the IP is the unspecified wildcard (0.0.0.0 / ::).
    pub fn is_unspecified(&self) -> bool {
        self.ip.is_unspecified()
    }

    /// Same port, different IP.
    pub fn with_ip(&self, ip: IpAddr) -> Self {
        Self::new(ip, self.port)
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The standard library already prints socket addresses in the
        // bracket notation parse() accepts.
        std::fmt::Display::fmt(&self.to_socket_addr(), f)
    }
}

/// Failure to parse a network address from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkAddressParseError {
    /// The host part is not a usable IP address.
    #[error("unparseable host in address {input:?}")]
    BadHost {
        /// The input that failed to parse.
        input: String,
    },
    /// The port part is absent or not a 16-bit number.
    #[error("missing or unparseable port in address {input:?}")]
    BadPort {
        /// The input that failed to parse.
        input: String,
    },
}
