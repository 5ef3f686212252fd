//! Tunnel wire format
//!
//! Every datagram exchanged with the remote relay carries a 2-byte header:
//!
//! ```text
//! +--------+----------+----------------------+
//! | flag   | reserved | payload (0..N bytes) |
//! | 1 byte | 1 byte   |                      |
//! +--------+----------+----------------------+
//! ```
//!
//! The reserved byte is always 0 on send and ignored on receive.
//! ANNOUNCE carries the 2-byte encoded service port as its payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Length of the tunnel header (flag + reserved)
pub const HEADER_LEN: usize = 2;

/// Payload data relayed between the service and the remote peer
pub const FLAG_DATA: u8 = 0;

/// Liveness/reachability probe used during negotiation
pub const FLAG_DUMMY: u8 = 1;

/// Keep-alive sent by the remote server
pub const FLAG_SERVER_KEEPALIVE: u8 = 2;

/// Tells the remote server which local service port is relayed
pub const FLAG_ANNOUNCE: u8 = 4;

/// Reply to a server keep-alive
pub const FLAG_KEEPALIVE_ACK: u8 = 5;

// ============================================================================
// Flags
// ============================================================================

/// Known packet kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Data,
    Dummy,
    ServerKeepalive,
    Announce,
    KeepaliveAck,
}

impl Flag {
    /// Map a raw flag byte to a known kind
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            FLAG_DATA => Some(Flag::Data),
            FLAG_DUMMY => Some(Flag::Dummy),
            FLAG_SERVER_KEEPALIVE => Some(Flag::ServerKeepalive),
            FLAG_ANNOUNCE => Some(Flag::Announce),
            FLAG_KEEPALIVE_ACK => Some(Flag::KeepaliveAck),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Flag::Data => FLAG_DATA,
            Flag::Dummy => FLAG_DUMMY,
            Flag::ServerKeepalive => FLAG_SERVER_KEEPALIVE,
            Flag::Announce => FLAG_ANNOUNCE,
            Flag::KeepaliveAck => FLAG_KEEPALIVE_ACK,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Flag::Data => "data",
            Flag::Dummy => "dummy",
            Flag::ServerKeepalive => "server keep-alive",
            Flag::Announce => "announcement",
            Flag::KeepaliveAck => "keep-alive ack",
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Datagram too short to contain the tunnel header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("malformed packet: {len} bytes is shorter than the {HEADER_LEN}-byte header")]
pub struct MalformedPacket {
    pub len: usize,
}

// ============================================================================
// Port Encoding
// ============================================================================

/// Byte order of the ANNOUNCE port field
///
/// Deployed relays disagree on this field, so it is selectable per tunnel.
/// Big-endian is the documented convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortByteOrder {
    #[default]
    BigEndian,
    /// Low byte first, as emitted by older clients
    LittleEndian,
}

/// Encode a port using the documented big-endian convention
pub fn encode_port(port: u16) -> [u8; 2] {
    encode_port_with(PortByteOrder::BigEndian, port)
}

/// Decode a big-endian port field
pub fn decode_port(bytes: [u8; 2]) -> u16 {
    decode_port_with(PortByteOrder::BigEndian, bytes)
}

pub fn encode_port_with(order: PortByteOrder, port: u16) -> [u8; 2] {
    match order {
        PortByteOrder::BigEndian => port.to_be_bytes(),
        PortByteOrder::LittleEndian => port.to_le_bytes(),
    }
}

pub fn decode_port_with(order: PortByteOrder, bytes: [u8; 2]) -> u16 {
    match order {
        PortByteOrder::BigEndian => u16::from_be_bytes(bytes),
        PortByteOrder::LittleEndian => u16::from_le_bytes(bytes),
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Prepend `[flag, 0]` to `payload`
pub fn frame(flag: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.push(flag);
    packet.push(0);
    packet.extend_from_slice(payload);
    packet
}

/// Split a datagram into its flag byte and payload
pub fn parse(raw: &[u8]) -> Result<(u8, &[u8]), MalformedPacket> {
    if raw.len() < HEADER_LEN {
        return Err(MalformedPacket { len: raw.len() });
    }

    Ok((raw[0], &raw[HEADER_LEN..]))
}

/// Build an ANNOUNCE packet for `service_port`
pub fn announce(order: PortByteOrder, service_port: u16) -> Vec<u8> {
    frame(FLAG_ANNOUNCE, &encode_port_with(order, service_port))
}

/// Build a header-only control packet (DUMMY, KEEPALIVE_ACK)
pub fn control(flag: Flag) -> Vec<u8> {
    frame(flag.as_byte(), &[])
}
