//! Fixed-capacity packet frames and message-record encoding.
//!
//! Wire layout (all integers little-endian):
//!
//! | offset | field                     | size |
//! |-------:|---------------------------|-----:|
//! | 0      | from-connection-index     | 1    |
//! | 1      | local packet ack          | 2    |
//! | 3      | last-received remote ack  | 2    |
//! | 5      | previous-acks bitfield    | 2    |
//! | 7      | reliable-bundle count     | 1    |
//! | 8      | unreliable-bundle count   | 1    |
//! | 9…     | concatenated records      |      |
//!
//! Each record: body-size u16 (excluding the size field itself), type id u8,
//! send-timestamp f32, reliable-id u16 iff the type is reliable, sequence-id
//! u16 iff the type is in-order, then payload bytes.
use byteorder::{ByteOrder, LittleEndian};

use crate::address::NetAddress;
use crate::message::{NetMessage, INVALID_RELIABLE_ID, INVALID_SEQUENCE_ID};
use crate::registry::{MessageFlags, MessageRegistry};

/// Maximum size of one packet on the wire.
pub const PACKET_MTU: usize = 1452;
/// First byte of the message-record region.
pub const PACKET_HEADER_SIZE: usize = 9;

/// Connection index marking a connectionless packet.
pub const INVALID_CONNECTION_INDEX: u8 = 0xFF;
/// Sentinel packet ack.
pub const INVALID_ACK_ID: u16 = 0xFFFF;

const FROM_CONN_INDEX_OFFSET: usize = 0;
const ACK_OFFSET: usize = 1;
const LAST_RECEIVED_ACK_OFFSET: usize = 3;
const PREV_ACK_BITFIELD_OFFSET: usize = 5;
const RELIABLE_BUNDLE_COUNT_OFFSET: usize = 7;
const UNRELIABLE_BUNDLE_COUNT_OFFSET: usize = 8;

/// Bytes a message occupies as a packet record, including the size field.
pub fn record_size(flags: MessageFlags, payload_len: usize) -> usize {
    let mut size = 2 + 1 + 4; // body-size + type id + send timestamp
    if flags.reliable {
        size += 2;
    }
    if flags.in_order {
        size += 2;
    }
    size + payload_len
}

/// One MTU-sized frame. The header bytes 0..=8 are always present, even on
/// an empty frame.
#[derive(Clone)]
pub struct NetPacket {
    /// Source address, filled in by the channel on receive.
    pub sender: NetAddress,
    /// Scheduled delivery time in channel milliseconds (lag simulation).
    pub delivery_time_ms: f64,

    buffer: [u8; PACKET_MTU],
    bytes_used: usize,
    read_cursor: usize,
}

impl Default for NetPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl NetPacket {
    pub fn new() -> Self {
        let mut packet = Self {
            sender: NetAddress::default(),
            delivery_time_ms: 0.0,
            buffer: [0u8; PACKET_MTU],
            bytes_used: PACKET_HEADER_SIZE,
            read_cursor: PACKET_HEADER_SIZE,
        };
        packet.set_from_conn_idx(INVALID_CONNECTION_INDEX);
        packet.set_packet_ack(INVALID_ACK_ID);
        packet.set_last_received_ack(INVALID_ACK_ID);
        packet
    }

    /// Reconstructs a packet from raw datagram bytes. Rejects frames too
    /// short to carry the header.
    pub fn from_bytes(data: &[u8], sender: NetAddress) -> Option<Self> {
        if data.len() < PACKET_HEADER_SIZE || data.len() > PACKET_MTU {
            return None;
        }
        let mut packet = Self::new();
        packet.buffer[..data.len()].copy_from_slice(data);
        packet.bytes_used = data.len();
        packet.sender = sender;
        Some(packet)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.bytes_used]
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn free_bytes(&self) -> usize {
        PACKET_MTU - self.bytes_used
    }

    /// True when no records remain (both bundle counts zero).
    pub fn is_empty(&self) -> bool {
        self.reliable_bundle_count() == 0 && self.unreliable_bundle_count() == 0
    }

    pub fn can_fit(&self, msg: &NetMessage, registry: &MessageRegistry) -> bool {
        record_size(registry.flags(msg.message_type_id), msg.payload_len()) <= self.free_bytes()
    }

    /// Appends `msg` as a record, stamping its send time from the session
    /// clock. Fails without mutation if the record does not fit. Bundle
    /// counts are the caller's bookkeeping.
    pub fn write(&mut self, msg: &mut NetMessage, registry: &MessageRegistry, now: f64) -> bool {
        let flags = registry.flags(msg.message_type_id);
        let size = record_size(flags, msg.payload_len());
        if size > self.free_bytes() {
            return false;
        }

        msg.sent_time = now as f32;

        let mut cursor = self.bytes_used;
        let body_size = (size - 2) as u16;
        LittleEndian::write_u16(&mut self.buffer[cursor..], body_size);
        cursor += 2;
        self.buffer[cursor] = msg.message_type_id;
        cursor += 1;
        LittleEndian::write_f32(&mut self.buffer[cursor..], msg.sent_time);
        cursor += 4;
        if flags.reliable {
            LittleEndian::write_u16(&mut self.buffer[cursor..], msg.reliable_id);
            cursor += 2;
        }
        if flags.in_order {
            LittleEndian::write_u16(&mut self.buffer[cursor..], msg.sequence_id);
            cursor += 2;
        }
        self.buffer[cursor..cursor + msg.payload_len()].copy_from_slice(msg.payload());
        self.bytes_used = cursor + msg.payload_len();

        true
    }

    /// Reads the next record, decrementing the matching bundle counter.
    /// Returns `None` once both counters reach zero.
    pub fn read(&mut self, registry: &MessageRegistry) -> Option<NetMessage> {
        if self.is_empty() {
            return None;
        }
        if self.read_cursor + 3 > self.bytes_used {
            return None;
        }

        let mut cursor = self.read_cursor;
        let mut body_size = LittleEndian::read_u16(&self.buffer[cursor..]) as usize;
        cursor += 2;
        if cursor + body_size > self.bytes_used || body_size < 5 {
            return None;
        }

        let type_id = self.buffer[cursor];
        cursor += 1;
        body_size -= 1;

        let mut msg = NetMessage::new(type_id);
        msg.sent_time = LittleEndian::read_f32(&self.buffer[cursor..]);
        cursor += 4;
        body_size -= 4;

        let flags = registry.expect(type_id).flags;
        if flags.reliable {
            if body_size < 2 {
                return None;
            }
            msg.reliable_id = LittleEndian::read_u16(&self.buffer[cursor..]);
            cursor += 2;
            body_size -= 2;
        } else {
            msg.reliable_id = INVALID_RELIABLE_ID;
        }
        if flags.in_order {
            if body_size < 2 {
                return None;
            }
            msg.sequence_id = LittleEndian::read_u16(&self.buffer[cursor..]);
            cursor += 2;
            body_size -= 2;
        } else {
            msg.sequence_id = INVALID_SEQUENCE_ID;
        }

        if msg.set_payload(&self.buffer[cursor..cursor + body_size]).is_err() {
            return None;
        }
        cursor += body_size;
        self.read_cursor = cursor;

        if flags.reliable {
            self.decrement_reliable_bundle_count();
        } else {
            self.decrement_unreliable_bundle_count();
        }

        Some(msg)
    }

    // -- header fields ----------------------------------------------------

    pub fn from_conn_idx(&self) -> u8 {
        self.buffer[FROM_CONN_INDEX_OFFSET]
    }

    pub fn set_from_conn_idx(&mut self, idx: u8) {
        self.buffer[FROM_CONN_INDEX_OFFSET] = idx;
    }

    pub fn packet_ack(&self) -> u16 {
        LittleEndian::read_u16(&self.buffer[ACK_OFFSET..])
    }

    pub fn set_packet_ack(&mut self, ack: u16) {
        LittleEndian::write_u16(&mut self.buffer[ACK_OFFSET..], ack);
    }

    pub fn last_received_ack(&self) -> u16 {
        LittleEndian::read_u16(&self.buffer[LAST_RECEIVED_ACK_OFFSET..])
    }

    pub fn set_last_received_ack(&mut self, ack: u16) {
        LittleEndian::write_u16(&mut self.buffer[LAST_RECEIVED_ACK_OFFSET..], ack);
    }

    pub fn prev_ack_bitfield(&self) -> u16 {
        LittleEndian::read_u16(&self.buffer[PREV_ACK_BITFIELD_OFFSET..])
    }

    pub fn set_prev_ack_bitfield(&mut self, bitfield: u16) {
        LittleEndian::write_u16(&mut self.buffer[PREV_ACK_BITFIELD_OFFSET..], bitfield);
    }

    pub fn reliable_bundle_count(&self) -> u8 {
        self.buffer[RELIABLE_BUNDLE_COUNT_OFFSET]
    }

    pub fn unreliable_bundle_count(&self) -> u8 {
        self.buffer[UNRELIABLE_BUNDLE_COUNT_OFFSET]
    }

    pub fn increment_reliable_bundle_count(&mut self) {
        self.buffer[RELIABLE_BUNDLE_COUNT_OFFSET] += 1;
    }

    pub fn increment_unreliable_bundle_count(&mut self) {
        self.buffer[UNRELIABLE_BUNDLE_COUNT_OFFSET] += 1;
    }

    pub fn set_unreliable_bundle_count(&mut self, count: u8) {
        self.buffer[UNRELIABLE_BUNDLE_COUNT_OFFSET] = count;
    }

    fn decrement_reliable_bundle_count(&mut self) {
        self.buffer[RELIABLE_BUNDLE_COUNT_OFFSET] -= 1;
    }

    fn decrement_unreliable_bundle_count(&mut self) {
        self.buffer[UNRELIABLE_BUNDLE_COUNT_OFFSET] -= 1;
    }
}

impl std::fmt::Debug for NetPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetPacket")
            .field("sender", &self.sender)
            .field("from_conn_idx", &self.from_conn_idx())
            .field("packet_ack", &self.packet_ack())
            .field("last_received_ack", &self.last_received_ack())
            .field("prev_ack_bitfield", &self.prev_ack_bitfield())
            .field("reliable_bundle_count", &self.reliable_bundle_count())
            .field("unreliable_bundle_count", &self.unreliable_bundle_count())
            .field("bytes_used", &self.bytes_used)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerRoute;

    const UNRELIABLE_ID: u8 = 20;
    const RELIABLE_ID: u8 = 21;
    const ORDERED_ID: u8 = 22;
    const CONNECTIONLESS_ID: u8 = 23;

    fn test_registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry.register(UNRELIABLE_ID, MessageFlags::unreliable(), HandlerRoute::Event);
        registry.register(RELIABLE_ID, MessageFlags::reliable(), HandlerRoute::Event);
        registry.register(ORDERED_ID, MessageFlags::reliable_in_order(), HandlerRoute::Event);
        registry.register(CONNECTIONLESS_ID, MessageFlags::connectionless(), HandlerRoute::Event);
        registry
    }

    #[test]
    fn test_header_defaults() {
        let packet = NetPacket::new();
        assert_eq!(packet.bytes_used(), PACKET_HEADER_SIZE);
        assert_eq!(packet.from_conn_idx(), INVALID_CONNECTION_INDEX);
        assert_eq!(packet.packet_ack(), INVALID_ACK_ID);
        assert_eq!(packet.last_received_ack(), INVALID_ACK_ID);
        assert_eq!(packet.prev_ack_bitfield(), 0);
        assert!(packet.is_empty());
    }

    #[test]
    fn test_record_round_trip_every_flag_shape() {
        let registry = test_registry();

        for (id, reliable_id, sequence_id) in [
            (UNRELIABLE_ID, INVALID_RELIABLE_ID, INVALID_SEQUENCE_ID),
            (RELIABLE_ID, 7, INVALID_SEQUENCE_ID),
            (ORDERED_ID, 8, 3),
            (CONNECTIONLESS_ID, INVALID_RELIABLE_ID, INVALID_SEQUENCE_ID),
        ] {
            let mut packet = NetPacket::new();
            let mut msg = NetMessage::new(id);
            msg.reliable_id = reliable_id;
            msg.sequence_id = sequence_id;
            msg.write_u32(0xFEEDFACE).unwrap();
            msg.write_string(Some("hi")).unwrap();

            assert!(packet.write(&mut msg, &registry, 1.5));
            let flags = registry.flags(id);
            if flags.reliable {
                packet.increment_reliable_bundle_count();
            } else {
                packet.increment_unreliable_bundle_count();
            }

            let mut parsed = packet.read(&registry).expect("record should parse");
            assert_eq!(parsed.message_type_id, id);
            assert_eq!(parsed.reliable_id, reliable_id);
            assert_eq!(parsed.sequence_id, sequence_id);
            assert_eq!(parsed.sent_time, 1.5);
            assert_eq!(parsed.read_u32().unwrap(), 0xFEEDFACE);
            assert_eq!(parsed.read_string().unwrap().as_deref(), Some("hi"));
            assert!(packet.read(&registry).is_none());
        }
    }

    #[test]
    fn test_write_rejects_oversized_without_mutation() {
        let registry = test_registry();
        let mut packet = NetPacket::new();

        let mut big = NetMessage::new(UNRELIABLE_ID);
        big.write_bytes(&[0u8; 1024]).unwrap();
        while packet.write(&mut big.clone(), &registry, 0.0) {
            packet.increment_unreliable_bundle_count();
        }

        let used_before = packet.bytes_used();
        assert!(!packet.write(&mut big, &registry, 0.0));
        assert_eq!(packet.bytes_used(), used_before);
        assert!(packet.bytes_used() <= PACKET_MTU);
    }

    #[test]
    fn test_read_order_matches_write_order() {
        let registry = test_registry();
        let mut packet = NetPacket::new();

        for value in 0u32..3 {
            let mut msg = NetMessage::new(UNRELIABLE_ID);
            msg.write_u32(value).unwrap();
            assert!(packet.write(&mut msg, &registry, 0.0));
            packet.increment_unreliable_bundle_count();
        }

        for expected in 0u32..3 {
            let mut msg = packet.read(&registry).unwrap();
            assert_eq!(msg.read_u32().unwrap(), expected);
        }
        assert!(packet.read(&registry).is_none());
    }

    #[test]
    fn test_from_bytes_rejects_truncated_header() {
        assert!(NetPacket::from_bytes(&[0u8; 8], NetAddress::default()).is_none());
        assert!(NetPacket::from_bytes(&[0u8; 9], NetAddress::default()).is_some());
    }

    #[test]
    fn test_wire_round_trip_through_bytes() {
        let registry = test_registry();
        let mut packet = NetPacket::new();
        packet.set_from_conn_idx(2);
        packet.set_packet_ack(100);
        packet.set_last_received_ack(99);
        packet.set_prev_ack_bitfield(0b101);

        let mut msg = NetMessage::new(RELIABLE_ID);
        msg.reliable_id = 55;
        msg.write_u8(0x42).unwrap();
        assert!(packet.write(&mut msg, &registry, 2.0));
        packet.increment_reliable_bundle_count();

        let sender = NetAddress::new(0x7F000001, 4000);
        let mut parsed = NetPacket::from_bytes(packet.as_bytes(), sender).unwrap();
        assert_eq!(parsed.from_conn_idx(), 2);
        assert_eq!(parsed.packet_ack(), 100);
        assert_eq!(parsed.last_received_ack(), 99);
        assert_eq!(parsed.prev_ack_bitfield(), 0b101);
        assert_eq!(parsed.sender, sender);

        let mut out = parsed.read(&registry).unwrap();
        assert_eq!(out.reliable_id, 55);
        assert_eq!(out.read_u8().unwrap(), 0x42);
    }
}
