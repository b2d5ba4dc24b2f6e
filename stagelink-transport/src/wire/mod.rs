//! Wire format for link frames.
//!
//! Frame format: `[sender:16][kind:4][length:4][payload:N]`
//!
//! - **sender**: 128-bit remote identity of the sending process
//!   (two little-endian u64)
//! - **kind**: packet kind discriminant (little-endian u32)
//! - **length**: payload byte count (little-endian u32)
//! - **payload**: application data, opaque to this layer
//!
//! The same frame travels over both transports. On the stream transport the
//! header is read first to learn the payload length; a datagram always
//! carries exactly one frame.

use stagelink_core::{NetworkAddress, RemoteId};
use std::net::{IpAddr, Ipv4Addr};

/// Header size: 16 (sender) + 4 (kind) + 4 (length) = 24 bytes.
pub const HEADER_SIZE: usize = 24;

/// Largest datagram the unreliable transport will carry (IPv4 UDP ceiling).
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Largest payload that fits in a single datagram frame.
pub const MAX_DATAGRAM_PAYLOAD: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

/// Maximum payload size on the stream transport (1 MiB).
///
/// Frames claiming more than this are rejected to prevent memory exhaustion
/// from a corrupt length field.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Serialized size of an initialization payload.
pub const HANDSHAKE_SIZE: usize = 16 + 16 + 2 * ENDPOINT_SIZE;

/// Serialized size of one endpoint: family byte + IPv4 octets + port.
const ENDPOINT_SIZE: usize = 1 + 4 + 2;

/// Address family marker for IPv4 endpoints.
const FAMILY_INET: u8 = 2;

/// Discriminates what a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Malformed or unrecognized; logged and dropped.
    Invalid,
    /// The version handshake binding endpoints to remote identities.
    Initialization,
    /// Application payload.
    Generic,
    /// Zero-payload liveness probe.
    Heartbeat,
    /// Graceful close notification.
    Disconnect,
}

impl PacketKind {
    /// The on-wire discriminant.
    pub const fn to_wire(self) -> u32 {
        match self {
            PacketKind::Invalid => 0,
            PacketKind::Initialization => 1,
            PacketKind::Generic => 2,
            PacketKind::Heartbeat => 3,
            PacketKind::Disconnect => 4,
        }
    }

    /// Decode a wire discriminant. Unrecognized values map to `Invalid`.
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => PacketKind::Initialization,
            2 => PacketKind::Generic,
            3 => PacketKind::Heartbeat,
            4 => PacketKind::Disconnect,
            0 => PacketKind::Invalid,
            other => {
                tracing::warn!(kind = other, "unknown packet kind on wire");
                PacketKind::Invalid
            }
        }
    }
}

/// Wire format error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Payload exceeds the stream frame ceiling.
    #[error("frame payload too large: {size} bytes (max {MAX_FRAME_PAYLOAD})")]
    PayloadTooLarge {
        /// Actual payload size in bytes.
        size: usize,
    },

    /// A datagram did not contain exactly one frame.
    #[error("datagram length {have} does not match framed length {framed}")]
    DatagramLengthMismatch {
        /// Bytes the datagram carried.
        have: usize,
        /// Bytes the header claims.
        framed: usize,
    },

    /// An endpoint used an address family the wire cannot carry.
    #[error("unsupported address family {family}")]
    UnsupportedAddressFamily {
        /// The family discriminant encountered.
        family: u8,
    },
}

/// Fixed-layout frame header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Identity of the sending process.
    pub sender: RemoteId,
    /// What the payload is.
    pub kind: PacketKind,
    /// Payload byte count.
    pub data_length: u32,
}

impl FrameHeader {
    /// Serialize the header into a buffer of at least [`HEADER_SIZE`] bytes.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the buffer is too small.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..16].copy_from_slice(&self.sender.to_bytes());
        buf[16..20].copy_from_slice(&self.kind.to_wire().to_le_bytes());
        buf[20..24].copy_from_slice(&self.data_length.to_le_bytes());
    }

    /// Deserialize a header from a buffer.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientData` if the buffer is smaller than [`HEADER_SIZE`].
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }
        let mut sender = [0u8; 16];
        sender.copy_from_slice(&buf[0..16]);
        let kind = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let data_length = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        Ok(Self {
            sender: RemoteId::from_bytes(sender),
            kind: PacketKind::from_wire(kind),
            data_length,
        })
    }
}

/// Encode a frame into `buf` (cleared first), typically a pooled buffer.
///
/// # Errors
///
/// Returns `PayloadTooLarge` if the payload exceeds [`MAX_FRAME_PAYLOAD`].
pub fn encode_frame_into(
    buf: &mut Vec<u8>,
    sender: RemoteId,
    kind: PacketKind,
    payload: &[u8],
) -> Result<(), WireError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(WireError::PayloadTooLarge {
            size: payload.len(),
        });
    }
    buf.clear();
    buf.resize(HEADER_SIZE, 0);
    let header = FrameHeader {
        sender,
        kind,
        data_length: payload.len() as u32,
    };
    header.serialize_into(&mut buf[..HEADER_SIZE]);
    buf.extend_from_slice(payload);
    Ok(())
}

/// Encode a frame into a fresh buffer.
///
/// # Errors
///
/// Returns `PayloadTooLarge` if the payload exceeds [`MAX_FRAME_PAYLOAD`].
///
/// # Examples
///
/// ```
/// use stagelink_core::RemoteId;
/// use stagelink_transport::wire::{PacketKind, decode_datagram, encode_frame};
///
/// let sender = RemoteId::new(1, 2);
/// let frame = encode_frame(sender, PacketKind::Generic, b"hello").expect("encode");
/// let (header, payload) = decode_datagram(&frame).expect("decode");
///
/// assert_eq!(header.sender, sender);
/// assert_eq!(payload, b"hello");
/// ```
pub fn encode_frame(
    sender: RemoteId,
    kind: PacketKind,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    encode_frame_into(&mut buf, sender, kind, payload)?;
    Ok(buf)
}

/// Decode a datagram that must carry exactly one frame.
///
/// # Errors
///
/// - `InsufficientData`: shorter than a header
/// - `DatagramLengthMismatch`: the datagram and the framed length disagree
pub fn decode_datagram(data: &[u8]) -> Result<(FrameHeader, &[u8]), WireError> {
    let header = FrameHeader::deserialize(data)?;
    let framed = HEADER_SIZE + header.data_length as usize;
    if data.len() != framed {
        return Err(WireError::DatagramLengthMismatch {
            have: data.len(),
            framed,
        });
    }
    Ok((header, &data[HEADER_SIZE..]))
}

/// Protocol version carried in the handshake.
///
/// Mismatched versions refuse the handshake; there is no cross-version
/// compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Build number.
    pub build: u32,
    /// Revision number.
    pub revision: u32,
}

impl ProtocolVersion {
    /// Create a version with explicit components.
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// The protocol version this build speaks.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(0, 1, 1, 0);

/// Identity and endpoints carried in an initialization payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeData {
    /// Identity of the sending process.
    pub id: RemoteId,
    /// The sender's stream endpoint.
    pub stream_addr: NetworkAddress,
    /// The sender's datagram endpoint.
    pub datagram_addr: NetworkAddress,
}

fn encode_endpoint(buf: &mut Vec<u8>, addr: &NetworkAddress) -> Result<(), WireError> {
    match addr.ip {
        IpAddr::V4(ip) => {
            buf.push(FAMILY_INET);
            buf.extend_from_slice(&ip.octets());
            buf.extend_from_slice(&addr.port.to_be_bytes());
            Ok(())
        }
        // The handshake only carries IPv4; family byte values for IPv6 are
        // not defined on this wire.
        IpAddr::V6(_) => Err(WireError::UnsupportedAddressFamily { family: 10 }),
    }
}

fn decode_endpoint(buf: &[u8]) -> Result<NetworkAddress, WireError> {
    if buf.len() < ENDPOINT_SIZE {
        return Err(WireError::InsufficientData {
            needed: ENDPOINT_SIZE,
            have: buf.len(),
        });
    }
    if buf[0] != FAMILY_INET {
        return Err(WireError::UnsupportedAddressFamily { family: buf[0] });
    }
    let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
    let port = u16::from_be_bytes([buf[5], buf[6]]);
    Ok(NetworkAddress::new(IpAddr::V4(ip), port))
}

/// Encode an initialization payload: version, sender id, both endpoints.
///
/// # Errors
///
/// Returns `UnsupportedAddressFamily` for IPv6 endpoints.
pub fn encode_handshake(
    version: &ProtocolVersion,
    data: &HandshakeData,
) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(HANDSHAKE_SIZE);
    buf.extend_from_slice(&version.major.to_le_bytes());
    buf.extend_from_slice(&version.minor.to_le_bytes());
    buf.extend_from_slice(&version.build.to_le_bytes());
    buf.extend_from_slice(&version.revision.to_le_bytes());
    buf.extend_from_slice(&data.id.to_bytes());
    encode_endpoint(&mut buf, &data.stream_addr)?;
    encode_endpoint(&mut buf, &data.datagram_addr)?;
    Ok(buf)
}

/// Decode an initialization payload.
///
/// # Errors
///
/// Returns `InsufficientData` for truncated payloads and
/// `UnsupportedAddressFamily` for unknown endpoint families.
pub fn decode_handshake(payload: &[u8]) -> Result<(ProtocolVersion, HandshakeData), WireError> {
    if payload.len() < HANDSHAKE_SIZE {
        return Err(WireError::InsufficientData {
            needed: HANDSHAKE_SIZE,
            have: payload.len(),
        });
    }
    let word = |i: usize| {
        u32::from_le_bytes([
            payload[i * 4],
            payload[i * 4 + 1],
            payload[i * 4 + 2],
            payload[i * 4 + 3],
        ])
    };
    let version = ProtocolVersion::new(word(0), word(1), word(2), word(3));
    let mut id = [0u8; 16];
    id.copy_from_slice(&payload[16..32]);
    let stream_addr = decode_endpoint(&payload[32..32 + ENDPOINT_SIZE])?;
    let datagram_addr = decode_endpoint(&payload[32 + ENDPOINT_SIZE..HANDSHAKE_SIZE])?;
    Ok((
        version,
        HandshakeData {
            id: RemoteId::from_bytes(id),
            stream_addr,
            datagram_addr,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader {
            sender: RemoteId::new(0x1234567890ABCDEF, 0xFEDCBA0987654321),
            kind: PacketKind::Generic,
            data_length: 100,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.serialize_into(&mut buf);
        let decoded = FrameHeader::deserialize(&buf).expect("deserialize");
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_layout() {
        let sender = RemoteId::new(0x1111111111111111, 0x2222222222222222);
        let frame = encode_frame(sender, PacketKind::Disconnect, b"abc").expect("encode");

        assert_eq!(frame.len(), HEADER_SIZE + 3);
        // sender occupies the first 16 bytes
        assert_eq!(&frame[..8], &0x1111111111111111u64.to_le_bytes());
        assert_eq!(&frame[8..16], &0x2222222222222222u64.to_le_bytes());
        // kind at offset 16, little-endian
        assert_eq!(&frame[16..20], &4u32.to_le_bytes());
        // length at offset 20
        assert_eq!(&frame[20..24], &3u32.to_le_bytes());
        // payload follows
        assert_eq!(&frame[HEADER_SIZE..], b"abc");
    }

    #[test]
    fn test_packet_kind_wire_values() {
        assert_eq!(PacketKind::Invalid.to_wire(), 0);
        assert_eq!(PacketKind::Initialization.to_wire(), 1);
        assert_eq!(PacketKind::Generic.to_wire(), 2);
        assert_eq!(PacketKind::Heartbeat.to_wire(), 3);
        assert_eq!(PacketKind::Disconnect.to_wire(), 4);
        for kind in [
            PacketKind::Invalid,
            PacketKind::Initialization,
            PacketKind::Generic,
            PacketKind::Heartbeat,
            PacketKind::Disconnect,
        ] {
            assert_eq!(PacketKind::from_wire(kind.to_wire()), kind);
        }
    }

    #[test]
    fn test_packet_kind_unknown_maps_to_invalid() {
        assert_eq!(PacketKind::from_wire(99), PacketKind::Invalid);
    }

    #[test]
    fn test_roundtrip_bit_fidelity() {
        let sender = RemoteId::new(0x123456789ABCDEF0, 0xFEDCBA9876543210);
        let payload: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();

        let frame = encode_frame(sender, PacketKind::Generic, &payload).expect("encode");
        let (header, decoded) = decode_datagram(&frame).expect("decode");

        assert_eq!(header.sender, sender);
        assert_eq!(header.kind, PacketKind::Generic);
        assert_eq!(header.data_length as usize, payload.len());
        assert_eq!(decoded, payload.as_slice());
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode_frame(RemoteId::new(42, 43), PacketKind::Heartbeat, &[])
            .expect("encode");
        assert_eq!(frame.len(), HEADER_SIZE);
        let (header, payload) = decode_datagram(&frame).expect("decode");
        assert_eq!(header.kind, PacketKind::Heartbeat);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_insufficient_data_header() {
        let result = FrameHeader::deserialize(&[0u8; 10]);
        assert!(matches!(
            result,
            Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: 10
            })
        ));
    }

    #[test]
    fn test_datagram_length_mismatch() {
        let frame = encode_frame(RemoteId::new(1, 2), PacketKind::Generic, b"payload")
            .expect("encode");
        // Truncated datagram
        assert!(matches!(
            decode_datagram(&frame[..frame.len() - 1]),
            Err(WireError::DatagramLengthMismatch { .. })
        ));
        // Trailing garbage
        let mut extended = frame.clone();
        extended.push(0);
        assert!(matches!(
            decode_datagram(&extended),
            Err(WireError::DatagramLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let result = encode_frame(RemoteId::new(1, 1), PacketKind::Generic, &payload);
        assert!(matches!(result, Err(WireError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_datagram_payload_ceiling() {
        // A max-size datagram payload frames to exactly the UDP ceiling.
        assert_eq!(MAX_DATAGRAM_PAYLOAD + HEADER_SIZE, MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_handshake_roundtrip() {
        let data = HandshakeData {
            id: RemoteId::new(0xAAAA, 0xBBBB),
            stream_addr: NetworkAddress::parse("192.168.1.5:4500").expect("parse"),
            datagram_addr: NetworkAddress::parse("192.168.1.5:4501").expect("parse"),
        };
        let payload = encode_handshake(&PROTOCOL_VERSION, &data).expect("encode");
        assert_eq!(payload.len(), HANDSHAKE_SIZE);

        let (version, decoded) = decode_handshake(&payload).expect("decode");
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_handshake_endpoint_layout() {
        let data = HandshakeData {
            id: RemoteId::new(1, 2),
            stream_addr: NetworkAddress::parse("10.1.2.3:258").expect("parse"),
            datagram_addr: NetworkAddress::parse("10.1.2.3:258").expect("parse"),
        };
        let payload = encode_handshake(&PROTOCOL_VERSION, &data).expect("encode");
        // First endpoint starts after version (16) + id (16)
        assert_eq!(payload[32], FAMILY_INET);
        assert_eq!(&payload[33..37], &[10, 1, 2, 3]);
        // Port 258 = 0x0102 big-endian on the wire
        assert_eq!(&payload[37..39], &[0x01, 0x02]);
    }

    #[test]
    fn test_handshake_refuses_ipv6() {
        let data = HandshakeData {
            id: RemoteId::new(1, 2),
            stream_addr: NetworkAddress::parse("[::1]:4500").expect("parse"),
            datagram_addr: NetworkAddress::parse("[::1]:4501").expect("parse"),
        };
        assert!(matches!(
            encode_handshake(&PROTOCOL_VERSION, &data),
            Err(WireError::UnsupportedAddressFamily { .. })
        ));
    }

    #[test]
    fn test_handshake_truncated() {
        let data = HandshakeData {
            id: RemoteId::new(1, 2),
            stream_addr: NetworkAddress::parse("127.0.0.1:1").expect("parse"),
            datagram_addr: NetworkAddress::parse("127.0.0.1:2").expect("parse"),
        };
        let payload = encode_handshake(&PROTOCOL_VERSION, &data).expect("encode");
        assert!(matches!(
            decode_handshake(&payload[..HANDSHAKE_SIZE - 1]),
            Err(WireError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_handshake_unknown_family() {
        let data = HandshakeData {
            id: RemoteId::new(1, 2),
            stream_addr: NetworkAddress::parse("127.0.0.1:1").expect("parse"),
            datagram_addr: NetworkAddress::parse("127.0.0.1:2").expect("parse"),
        };
        let mut payload = encode_handshake(&PROTOCOL_VERSION, &data).expect("encode");
        payload[32] = 77;
        assert!(matches!(
            decode_handshake(&payload),
            Err(WireError::UnsupportedAddressFamily { family: 77 })
        ));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "0.1.1.0");
    }

    #[test]
    fn test_encode_into_reuses_buffer() {
        let sender = RemoteId::new(7, 8);
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(b"stale contents");
        encode_frame_into(&mut buf, sender, PacketKind::Generic, b"fresh").expect("encode");
        let (header, payload) = decode_datagram(&buf).expect("decode");
        assert_eq!(header.sender, sender);
        assert_eq!(payload, b"fresh");
    }
}
