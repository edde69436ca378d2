//! Per-peer connection state: send queues, ack tracking and the
//! reliable/in-order delivery engine.
use smallvec::SmallVec;
use std::collections::VecDeque;

use crate::address::NetAddress;
use crate::cycle::Cycle;
use crate::interval::Interval;
use crate::message::{NetMessage, INVALID_RELIABLE_ID};
use crate::packet::{NetPacket, INVALID_ACK_ID};
use crate::registry::MessageRegistry;
use crate::stats::ConnectionStats;

/// Packets-per-second tick rate of a connection.
pub const DEFAULT_TICK_HZ: f64 = 20.0;
/// Minimum age before an unconfirmed reliable is retransmitted.
pub const RELIABLE_RESEND_SECONDS: f64 = 0.150;

pub const MAX_ACK_ID: i32 = 63354;
pub const MAX_RELIABLE_ID: i32 = 65534;
pub const MAX_SEQUENCE_ID: i32 = 65534;

/// Span of reliable ids allowed in flight ahead of the oldest unconfirmed.
pub const RELIABLE_ID_WINDOW: u32 = 1024;
pub const PACKET_TRACKER_BUFFER_SIZE: usize = 256;

/// Which reliable ids rode in one outgoing packet, keyed by that packet's
/// ack. Trackers live in a ring; a later packet with the same slot
/// overwrites the prior occupant.
#[derive(Debug, Clone)]
pub struct PacketTracker {
    ack_id: u16,
    reliable_ids: SmallVec<[u16; 8]>,
    confirmed: bool,
}

impl Default for PacketTracker {
    fn default() -> Self {
        Self {
            ack_id: INVALID_ACK_ID,
            reliable_ids: SmallVec::new(),
            confirmed: false,
        }
    }
}

/// One peer of a session.
///
/// The connection owns everything needed to turn enqueued messages into
/// packets and inbound packets into an exactly-once, optionally ordered
/// message stream: reliable retransmission, ack confirmation through the
/// tracker ring, duplicate suppression and the in-order reorder buffer.
pub struct Connection {
    pub index: u8,
    pub guid: String,
    pub address: NetAddress,
    /// Token presented during the join handshake; lets a retransmitted
    /// JOIN_REQUEST resolve to the already-created connection.
    pub join_token: u32,

    tick_interval: Interval,
    ack_cycle: Cycle,
    reliable_id_cycle: Cycle,
    send_sequence_cycle: Cycle,
    recv_sequence_cycle: Cycle,

    unsent_unreliables: VecDeque<NetMessage>,
    unsent_reliables: Vec<NetMessage>,
    /// Sorted oldest last-sent-time first.
    sent_unconfirmed_reliables: Vec<NetMessage>,
    waiting_in_order: Vec<NetMessage>,
    processed_reliables: Vec<u16>,

    trackers: Vec<PacketTracker>,

    last_ack_received: u16,
    last_ack_sent: u16,
    prev_acks_bitfield: u16,

    oldest_unconfirmed_reliable_id: u16,
    last_reliable_id_sent: u16,
    last_reliable_id_received: u16,

    pub time_since_last_recv: f64,
    pub time_since_last_send: f64,

    stats: ConnectionStats,
}

impl Connection {
    pub fn new(index: u8, guid: &str, address: NetAddress, now: f64) -> Self {
        Self {
            index,
            guid: guid.to_string(),
            address,
            join_token: 0,
            tick_interval: Interval::from_frequency(DEFAULT_TICK_HZ, now),
            ack_cycle: Cycle::new(0, MAX_ACK_ID),
            reliable_id_cycle: Cycle::new(0, MAX_RELIABLE_ID),
            send_sequence_cycle: Cycle::new(0, MAX_SEQUENCE_ID),
            recv_sequence_cycle: Cycle::new(0, MAX_SEQUENCE_ID),
            unsent_unreliables: VecDeque::new(),
            unsent_reliables: Vec::new(),
            sent_unconfirmed_reliables: Vec::new(),
            waiting_in_order: Vec::new(),
            processed_reliables: Vec::new(),
            trackers: vec![PacketTracker::default(); PACKET_TRACKER_BUFFER_SIZE],
            last_ack_received: INVALID_ACK_ID,
            last_ack_sent: INVALID_ACK_ID,
            prev_acks_bitfield: 0,
            oldest_unconfirmed_reliable_id: INVALID_RELIABLE_ID,
            last_reliable_id_sent: 0,
            last_reliable_id_received: 0,
            time_since_last_recv: 0.0,
            time_since_last_send: 0.0,
            stats: ConnectionStats::default(),
        }
    }

    pub fn set_tick_frequency(&mut self, hz: f64, now: f64) {
        self.tick_interval.set_frequency(hz, now);
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    // -- sending ----------------------------------------------------------

    /// Enqueues a message. Reliable in-order messages are stamped with the
    /// next send sequence id here; reliable ids are assigned at packet-build
    /// time.
    pub fn send(&mut self, mut msg: NetMessage, registry: &MessageRegistry) {
        let flags = registry.flags(msg.message_type_id);
        self.stats.messages_sent += 1;
        if flags.reliable {
            if flags.in_order {
                msg.sequence_id = self.send_sequence_cycle.current();
                self.send_sequence_cycle.increment();
            }
            self.unsent_reliables.push(msg);
        } else {
            self.unsent_unreliables.push_back(msg);
        }
    }

    /// Advances timers; true when the tick interval fired and a packet
    /// should be built.
    pub fn update(&mut self, dt: f64, now: f64) -> bool {
        self.time_since_last_recv += dt;
        self.time_since_last_send += dt;
        self.tick_interval.check_and_reset(now)
    }

    /// Builds the packet for this tick, or `None` when there is nothing to
    /// carry.
    ///
    /// Stages, in order: due retransmissions (oldest first, original ids),
    /// new reliables within the sliding window, then opportunistic
    /// unreliables which are dropped if they no longer fit.
    pub fn build_packet(
        &mut self,
        registry: &MessageRegistry,
        now: f64,
        from_index: u8,
    ) -> Option<NetPacket> {
        if self.unsent_unreliables.is_empty()
            && self.unsent_reliables.is_empty()
            && self.sent_unconfirmed_reliables.is_empty()
        {
            return None;
        }

        let mut packet = NetPacket::new();
        self.last_ack_sent = self.next_send_ack();
        packet.set_packet_ack(self.last_ack_sent);
        packet.set_last_received_ack(self.last_ack_received);
        packet.set_prev_ack_bitfield(self.prev_acks_bitfield);
        packet.set_from_conn_idx(from_index);

        let tracker_ack = self.last_ack_sent;
        {
            let tracker = &mut self.trackers[tracker_ack as usize % PACKET_TRACKER_BUFFER_SIZE];
            tracker.ack_id = tracker_ack;
            tracker.reliable_ids.clear();
            tracker.confirmed = false;
        }

        // Retransmit stage.
        for msg in &mut self.sent_unconfirmed_reliables {
            if now - msg.last_sent_time < RELIABLE_RESEND_SECONDS {
                continue;
            }
            if !packet.can_fit(msg, registry) {
                continue;
            }
            packet.write(msg, registry, now);
            packet.increment_reliable_bundle_count();
            msg.last_sent_time = now;
            self.trackers[tracker_ack as usize % PACKET_TRACKER_BUFFER_SIZE]
                .reliable_ids
                .push(msg.reliable_id);
            self.stats.reliables_retransmitted += 1;
        }

        // New-reliable stage.
        let mut unsent_idx = 0;
        while unsent_idx < self.unsent_reliables.len() {
            let next_reliable_id = self.reliable_id_cycle.current();

            if INVALID_RELIABLE_ID == self.oldest_unconfirmed_reliable_id {
                self.oldest_unconfirmed_reliable_id = next_reliable_id;
            } else if self
                .reliable_id_cycle
                .abs_delta(next_reliable_id, self.oldest_unconfirmed_reliable_id)
                >= RELIABLE_ID_WINDOW
            {
                // Window full: no new reliables this tick.
                break;
            }

            if !packet.can_fit(&self.unsent_reliables[unsent_idx], registry) {
                unsent_idx += 1;
                continue;
            }

            let mut msg = self.unsent_reliables.remove(unsent_idx);
            msg.reliable_id = next_reliable_id;
            self.last_reliable_id_sent = next_reliable_id;
            self.reliable_id_cycle.increment();
            msg.last_sent_time = now;

            packet.write(&mut msg, registry, now);
            packet.increment_reliable_bundle_count();
            self.trackers[tracker_ack as usize % PACKET_TRACKER_BUFFER_SIZE]
                .reliable_ids
                .push(next_reliable_id);
            self.sent_unconfirmed_reliables.push(msg);
        }

        self.sent_unconfirmed_reliables.sort_by(|a, b| {
            a.last_sent_time
                .partial_cmp(&b.last_sent_time)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Unreliable stage: whatever fits goes out, the rest is dropped.
        while let Some(mut msg) = self.unsent_unreliables.pop_front() {
            if packet.write(&mut msg, registry, now) {
                packet.increment_unreliable_bundle_count();
            } else {
                log::trace!(
                    "dropping unreliable message {} that missed the packet",
                    msg.message_type_id
                );
            }
        }

        if packet.is_empty() {
            return None;
        }

        self.stats.packets_sent += 1;
        Some(packet)
    }

    fn next_send_ack(&mut self) -> u16 {
        let ack = self.ack_cycle.current();
        self.ack_cycle.increment();
        ack
    }

    // -- receiving --------------------------------------------------------

    /// Processes one inbound packet, pushing accepted messages onto `out`
    /// in delivery order. Ack bookkeeping runs before any message is
    /// surfaced.
    pub fn process_packet(
        &mut self,
        packet: &mut NetPacket,
        registry: &MessageRegistry,
        out: &mut Vec<NetMessage>,
    ) {
        self.time_since_last_recv = 0.0;
        self.stats.packets_received += 1;

        self.process_received_packet_ack(packet.packet_ack());
        self.confirm_acks(packet.last_received_ack(), packet.prev_ack_bitfield());

        while let Some(mut msg) = packet.read(registry) {
            msg.sender = Some(self.index);
            msg.sender_address = self.address;

            if registry.flags(msg.message_type_id).in_order {
                self.process_in_order_message(msg, registry, out);
            } else {
                self.process_message(msg, registry, out);
            }
        }
    }

    fn process_in_order_message(
        &mut self,
        msg: NetMessage,
        registry: &MessageRegistry,
        out: &mut Vec<NetMessage>,
    ) {
        if msg.sequence_id == self.recv_sequence_cycle.current() {
            self.process_message(msg, registry, out);
            self.recv_sequence_cycle.increment();
            self.flush_waiting_in_order(registry, out);
        } else {
            if self
                .waiting_in_order
                .iter()
                .any(|waiting| waiting.sequence_id == msg.sequence_id)
            {
                return;
            }
            if self.has_reliable_been_processed(msg.reliable_id) {
                return;
            }
            self.waiting_in_order.push(msg);
            self.waiting_in_order.sort_by_key(|m| m.sequence_id);
        }
    }

    fn flush_waiting_in_order(&mut self, registry: &MessageRegistry, out: &mut Vec<NetMessage>) {
        while !self.waiting_in_order.is_empty() {
            if self.waiting_in_order[0].sequence_id != self.recv_sequence_cycle.current() {
                return;
            }
            let msg = self.waiting_in_order.remove(0);
            self.process_message(msg, registry, out);
            self.recv_sequence_cycle.increment();
        }
    }

    fn process_message(
        &mut self,
        msg: NetMessage,
        registry: &MessageRegistry,
        out: &mut Vec<NetMessage>,
    ) {
        let flags = registry.flags(msg.message_type_id);

        // Connectionless-only enforcement happens at the session layer;
        // everything reaching a connection carries its sender index.
        debug_assert!(flags.connectionless || msg.sender.is_some());

        if flags.reliable {
            if self
                .reliable_id_cycle
                .is_greater(msg.reliable_id, self.last_reliable_id_received)
            {
                self.last_reliable_id_received = msg.reliable_id;
                self.purge_old_processed_reliables();
            }

            if self.has_reliable_been_processed(msg.reliable_id) {
                self.stats.duplicates_suppressed += 1;
                return;
            }
            self.processed_reliables.push(msg.reliable_id);
        }

        self.stats.messages_received += 1;
        out.push(msg);
    }

    fn has_reliable_been_processed(&self, reliable_id: u16) -> bool {
        self.processed_reliables.contains(&reliable_id)
    }

    fn purge_old_processed_reliables(&mut self) {
        let cycle = &self.reliable_id_cycle;
        let last = self.last_reliable_id_received;
        self.processed_reliables
            .retain(|&id| cycle.abs_delta(last, id) <= RELIABLE_ID_WINDOW);
    }

    // -- ack bookkeeping --------------------------------------------------

    /// Folds a newly observed remote packet ack into the local
    /// last-received/bitfield pair.
    fn process_received_packet_ack(&mut self, received_ack: u16) {
        if INVALID_ACK_ID == received_ack {
            return;
        }

        if INVALID_ACK_ID == self.last_ack_received {
            self.last_ack_received = received_ack;
            return;
        }

        if received_ack == self.last_ack_received {
            // Duplicate datagram; the wire may replay a packet verbatim.
            log::debug!("received duplicate packet ack {}", received_ack);
            return;
        }

        let delta = self.ack_cycle.abs_delta(received_ack, self.last_ack_received);
        if self.ack_cycle.is_greater(received_ack, self.last_ack_received) {
            self.last_ack_received = received_ack;
            self.prev_acks_bitfield = if delta >= 16 {
                0
            } else {
                self.prev_acks_bitfield << delta
            };
        }

        if delta >= 1 && delta <= 16 {
            self.prev_acks_bitfield |= 1 << (delta - 1);
        }
    }

    /// Confirms the tracker named by the remote's last-received ack and
    /// every set bit of its 16-wide history bitfield.
    fn confirm_acks(&mut self, received_packet_ack: u16, bitfield: u16) {
        self.confirm_tracker(received_packet_ack);
        for bit_idx in 1u16..=16 {
            if bitfield & (1 << (bit_idx - 1)) != 0 {
                self.confirm_tracker(received_packet_ack.wrapping_sub(bit_idx));
            }
        }
    }

    fn confirm_tracker(&mut self, packet_ack: u16) {
        if INVALID_ACK_ID == packet_ack {
            return;
        }

        let slot = packet_ack as usize % PACKET_TRACKER_BUFFER_SIZE;
        if self.trackers[slot].ack_id != packet_ack || self.trackers[slot].confirmed {
            return;
        }
        self.trackers[slot].confirmed = true;

        let reliable_ids = self.trackers[slot].reliable_ids.clone();
        for reliable_id in reliable_ids {
            self.confirm_reliable(reliable_id);
        }
    }

    fn confirm_reliable(&mut self, reliable_id: u16) {
        let Some(position) = self
            .sent_unconfirmed_reliables
            .iter()
            .position(|msg| msg.reliable_id == reliable_id)
        else {
            return;
        };
        self.sent_unconfirmed_reliables.remove(position);

        // Slide the window forward to the oldest id still outstanding.
        self.oldest_unconfirmed_reliable_id = self
            .sent_unconfirmed_reliables
            .iter()
            .map(|msg| msg.reliable_id)
            .fold(INVALID_RELIABLE_ID, |oldest, id| {
                if oldest == INVALID_RELIABLE_ID || self.reliable_id_cycle.is_greater(oldest, id) {
                    id
                } else {
                    oldest
                }
            });
    }

    // -- introspection ----------------------------------------------------

    pub fn unconfirmed_reliable_count(&self) -> usize {
        self.sent_unconfirmed_reliables.len()
    }

    pub fn pending_reliable_count(&self) -> usize {
        self.unsent_reliables.len()
    }

    pub fn waiting_in_order_count(&self) -> usize {
        self.waiting_in_order.len()
    }

    pub fn was_reliable_processed(&self, reliable_id: u16) -> bool {
        self.has_reliable_been_processed(reliable_id)
    }

    pub fn last_ack_received(&self) -> u16 {
        self.last_ack_received
    }

    pub fn prev_acks_bitfield(&self) -> u16 {
        self.prev_acks_bitfield
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HandlerRoute, MessageFlags};

    const UNRELIABLE_ID: u8 = 30;
    const RELIABLE_ID: u8 = 31;
    const ORDERED_ID: u8 = 32;

    fn test_registry() -> MessageRegistry {
        let mut registry = MessageRegistry::new();
        registry.register(UNRELIABLE_ID, MessageFlags::unreliable(), HandlerRoute::Event);
        registry.register(RELIABLE_ID, MessageFlags::reliable(), HandlerRoute::Event);
        registry.register(ORDERED_ID, MessageFlags::reliable_in_order(), HandlerRoute::Event);
        registry
    }

    fn pair() -> (Connection, Connection) {
        let a = Connection::new(0, "a", NetAddress::new(0x7F000001, 1000), 0.0);
        let b = Connection::new(1, "b", NetAddress::new(0x7F000001, 1001), 0.0);
        (a, b)
    }

    fn msg_with_tag(id: u8, tag: u32) -> NetMessage {
        let mut msg = NetMessage::new(id);
        msg.write_u32(tag).unwrap();
        msg
    }

    fn deliver(
        from: &mut Connection,
        to: &mut Connection,
        registry: &MessageRegistry,
        now: f64,
    ) -> Vec<NetMessage> {
        let mut out = Vec::new();
        if let Some(mut packet) = from.build_packet(registry, now, from.index) {
            to.process_packet(&mut packet, registry, &mut out);
        }
        out
    }

    #[test]
    fn test_unreliable_send_and_receive() {
        let registry = test_registry();
        let (mut a, mut b) = pair();

        a.send(msg_with_tag(UNRELIABLE_ID, 7), &registry);
        let mut out = deliver(&mut a, &mut b, &registry, 0.0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].read_u32().unwrap(), 7);
        assert_eq!(out[0].sender, Some(b.index));
    }

    #[test]
    fn test_empty_tick_builds_nothing() {
        let registry = test_registry();
        let (mut a, _) = pair();
        assert!(a.build_packet(&registry, 0.0, 0).is_none());
    }

    #[test]
    fn test_reliable_retransmits_with_same_id_until_confirmed() {
        let registry = test_registry();
        let (mut a, mut b) = pair();

        a.send(msg_with_tag(RELIABLE_ID, 1), &registry);
        let first = a.build_packet(&registry, 0.0, 0).unwrap();
        assert_eq!(first.reliable_bundle_count(), 1);
        assert_eq!(a.unconfirmed_reliable_count(), 1);
        drop(first); // lost on the wire

        // Too soon: nothing is due, the tick is abandoned.
        assert!(a.build_packet(&registry, 0.1, 0).is_none());

        // Past the resend threshold the same reliable id goes out again.
        let mut retransmit = a.build_packet(&registry, 0.2, 0).unwrap();
        assert_eq!(retransmit.reliable_bundle_count(), 1);

        let mut out = Vec::new();
        b.process_packet(&mut retransmit, &registry, &mut out);
        assert_eq!(out.len(), 1);
        assert!(a.unconfirmed_reliable_count() == 1);

        // b's next packet carries the ack; a releases the reliable.
        b.send(msg_with_tag(UNRELIABLE_ID, 0), &registry);
        let mut ack_packet = b.build_packet(&registry, 0.25, 1).unwrap();
        let mut ack_out = Vec::new();
        a.process_packet(&mut ack_packet, &registry, &mut ack_out);
        assert_eq!(a.unconfirmed_reliable_count(), 0);
    }

    #[test]
    fn test_duplicate_reliable_is_processed_once() {
        let registry = test_registry();
        let (mut a, mut b) = pair();

        a.send(msg_with_tag(RELIABLE_ID, 9), &registry);
        let packet = a.build_packet(&registry, 0.0, 0).unwrap();

        let mut out = Vec::new();
        b.process_packet(&mut packet.clone(), &registry, &mut out);

        // The retransmission of the same reliable id arrives in a new packet.
        let mut retransmit = a.build_packet(&registry, 0.2, 0).unwrap();
        b.process_packet(&mut retransmit, &registry, &mut out);

        assert_eq!(out.len(), 1);
        assert!(b.was_reliable_processed(0));
        assert_eq!(b.stats().duplicates_suppressed, 1);
    }

    #[test]
    fn test_in_order_reorder_buffer_flushes_in_send_order() {
        let registry = test_registry();
        let (mut a, mut b) = pair();

        a.send(msg_with_tag(ORDERED_ID, 0), &registry);
        let pa = a.build_packet(&registry, 0.0, 0).unwrap();
        a.send(msg_with_tag(ORDERED_ID, 1), &registry);
        let pb = a.build_packet(&registry, 0.01, 0).unwrap();
        a.send(msg_with_tag(ORDERED_ID, 2), &registry);
        let pc = a.build_packet(&registry, 0.02, 0).unwrap();

        // Arrival order B, A, C.
        let mut out = Vec::new();
        b.process_packet(&mut pb.clone(), &registry, &mut out);
        assert!(out.is_empty());
        assert_eq!(b.waiting_in_order_count(), 1);

        b.process_packet(&mut pa.clone(), &registry, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(b.waiting_in_order_count(), 0);

        b.process_packet(&mut pc.clone(), &registry, &mut out);
        assert_eq!(out.len(), 3);

        let tags: Vec<u32> = out.iter_mut().map(|m| m.read_u32().unwrap()).collect();
        assert_eq!(tags, vec![0, 1, 2]);
        assert_eq!(b.waiting_in_order_count(), 0);
    }

    #[test]
    fn test_retransmitted_in_order_reliable_is_not_double_buffered() {
        let registry = test_registry();
        let (mut a, mut b) = pair();

        // Sequence 0 lost, sequence 1 arrives and waits.
        a.send(msg_with_tag(ORDERED_ID, 0), &registry);
        let p0 = a.build_packet(&registry, 0.0, 0).unwrap();
        a.send(msg_with_tag(ORDERED_ID, 1), &registry);
        let p1 = a.build_packet(&registry, 0.01, 0).unwrap();

        let mut out = Vec::new();
        b.process_packet(&mut p1.clone(), &registry, &mut out);
        assert_eq!(b.waiting_in_order_count(), 1);

        // The retransmission of sequence 1 must not buffer a second copy.
        b.process_packet(&mut p1.clone(), &registry, &mut out);
        assert_eq!(b.waiting_in_order_count(), 1);

        b.process_packet(&mut p0.clone(), &registry, &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_ack_confirmation_is_idempotent() {
        let registry = test_registry();
        let (mut a, mut b) = pair();

        a.send(msg_with_tag(RELIABLE_ID, 3), &registry);
        let packet = a.build_packet(&registry, 0.0, 0).unwrap();
        let mut out = Vec::new();
        b.process_packet(&mut packet.clone(), &registry, &mut out);

        b.send(msg_with_tag(UNRELIABLE_ID, 0), &registry);
        let ack_packet = b.build_packet(&registry, 0.05, 1).unwrap();

        a.process_packet(&mut ack_packet.clone(), &registry, &mut out);
        assert_eq!(a.unconfirmed_reliable_count(), 0);

        // Queue a fresh reliable, then replay the old ack info: the new
        // message must not be released by stale confirmation state.
        a.send(msg_with_tag(RELIABLE_ID, 4), &registry);
        let _inflight = a.build_packet(&registry, 0.1, 0).unwrap();
        assert_eq!(a.unconfirmed_reliable_count(), 1);

        a.process_packet(&mut ack_packet.clone(), &registry, &mut out);
        assert_eq!(a.unconfirmed_reliable_count(), 1);
    }

    #[test]
    fn test_ack_bitfield_records_prior_acks() {
        let registry = test_registry();
        let (mut a, mut b) = pair();

        // Three packets from a, received in order by b.
        for tag in 0..3 {
            a.send(msg_with_tag(UNRELIABLE_ID, tag), &registry);
            let mut packet = a.build_packet(&registry, tag as f64 * 0.01, 0).unwrap();
            let mut out = Vec::new();
            b.process_packet(&mut packet, &registry, &mut out);
        }

        assert_eq!(b.last_ack_received(), 2);
        // Bits 0 and 1 mark acks 1 and 0 as received.
        assert_eq!(b.prev_acks_bitfield() & 0b11, 0b11);
    }

    #[test]
    fn test_reliable_window_pauses_new_reliables() {
        let registry = test_registry();
        let (mut a, _) = pair();

        // Saturate beyond the window; nothing is ever confirmed.
        for tag in 0..(RELIABLE_ID_WINDOW + 200) {
            a.send(msg_with_tag(RELIABLE_ID, tag), &registry);
        }

        let mut now = 0.0;
        for _ in 0..64 {
            // Packets go out (and are lost), retransmissions dominate once
            // the window fills.
            let _ = a.build_packet(&registry, now, 0);
            now += 0.2;
        }

        assert!(a.unconfirmed_reliable_count() as u32 <= RELIABLE_ID_WINDOW);
        assert!(a.pending_reliable_count() > 0);
    }

    #[test]
    fn test_window_reopens_after_confirmation() {
        let registry = test_registry();
        let (mut a, mut b) = pair();

        for tag in 0..40 {
            a.send(msg_with_tag(RELIABLE_ID, tag), &registry);
        }
        let packet = a.build_packet(&registry, 0.0, 0).unwrap();
        assert_eq!(a.unconfirmed_reliable_count(), 40);

        let mut out = Vec::new();
        b.process_packet(&mut packet.clone(), &registry, &mut out);
        b.send(msg_with_tag(UNRELIABLE_ID, 0), &registry);
        let mut ack = b.build_packet(&registry, 0.05, 1).unwrap();
        a.process_packet(&mut ack, &registry, &mut out);

        assert_eq!(a.unconfirmed_reliable_count(), 0);
        // With everything confirmed the window slides; new sends flow again.
        a.send(msg_with_tag(RELIABLE_ID, 99), &registry);
        assert!(a.build_packet(&registry, 0.1, 0).is_some());
        assert_eq!(a.unconfirmed_reliable_count(), 1);
    }
}
