//! Addresses, packet types, and the in-memory packet representation.
//!
//! Only the field semantics are fixed here; byte-level framing of the header
//! is the transport's concern. The 4-byte big-endian integer payloads used by
//! ranging acknowledgments and slot assignments are part of the protocol and
//! encoded/decoded in this module.

use thiserror::Error;

/// Address of one network participant. 0-254 are unicast addresses, 255 is
/// reserved for broadcast.
pub type NodeAddress = u8;

/// Destination address that reaches every node in range.
pub const BROADCAST_ADDRESS: NodeAddress = 0xFF;

/// Largest payload a single packet may carry.
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Status flag bits carried by every packet.
pub mod flags {
    /// The packet acknowledges an earlier request.
    pub const ACK: u8 = 0x01;
    /// The receiver is expected to answer.
    pub const REQUEST_RESPONSE: u8 = 0x02;
    /// The sender observed an error condition.
    pub const ERROR: u8 = 0x04;
}

/// Packet type identifiers as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Slot assignment, payload is the transmit delay in microseconds.
    Tdi = 0x01,
    /// Node payload data, answers a `ReqData` poll.
    Data = 0x02,
    /// Gateway poll trigger, broadcast once per cycle.
    ReqData = 0x03,
    /// Ranging request/acknowledgment; the ack payload is the round-trip
    /// time of flight in microseconds.
    Ping = 0x7F,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN}-byte limit")]
pub struct PayloadTooLarge(pub usize);

/// One MAC-layer packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src: NodeAddress,
    pub dst: NodeAddress,
    pub kind: PacketType,
    pub flags: u8,
    /// Sequence number, compared mod 256 to match responses to poll cycles.
    pub dsn: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Ranging request. The answering side fills in the measured round trip.
    pub fn ping_request(src: NodeAddress, dst: NodeAddress) -> Self {
        Self {
            src,
            dst,
            kind: PacketType::Ping,
            flags: flags::REQUEST_RESPONSE,
            dsn: 0,
            payload: Vec::new(),
        }
    }

    /// Ranging acknowledgment carrying the measured round trip in microseconds.
    pub fn ping_reply(src: NodeAddress, dst: NodeAddress, round_trip_us: u32) -> Self {
        Self {
            src,
            dst,
            kind: PacketType::Ping,
            flags: flags::ACK,
            dsn: 0,
            payload: round_trip_us.to_be_bytes().to_vec(),
        }
    }

    /// Slot assignment for one node, delay in microseconds after the poll
    /// broadcast.
    pub fn tdi(src: NodeAddress, dst: NodeAddress, delay_us: u32) -> Self {
        Self {
            src,
            dst,
            kind: PacketType::Tdi,
            flags: 0,
            dsn: 0,
            payload: delay_us.to_be_bytes().to_vec(),
        }
    }

    /// Poll trigger broadcast to all nodes, tagged with the cycle's sequence
    /// number.
    pub fn req_data(src: NodeAddress, dsn: u8) -> Self {
        Self {
            src,
            dst: BROADCAST_ADDRESS,
            kind: PacketType::ReqData,
            flags: flags::REQUEST_RESPONSE,
            dsn,
            payload: Vec::new(),
        }
    }

    /// Node data answer, echoing the poll's sequence number.
    pub fn data(
        src: NodeAddress,
        dst: NodeAddress,
        dsn: u8,
        payload: Vec<u8>,
    ) -> Result<Self, PayloadTooLarge> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            src,
            dst,
            kind: PacketType::Data,
            flags: 0,
            dsn,
            payload,
        })
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst == BROADCAST_ADDRESS
    }

    pub fn wants_response(&self) -> bool {
        self.flags & flags::REQUEST_RESPONSE != 0
    }

    /// Decode the leading 4 payload bytes as a big-endian integer. Ranging
    /// acks and slot assignments use this encoding.
    pub fn payload_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}
