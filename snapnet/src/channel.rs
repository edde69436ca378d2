//! Packet channel: socket ownership plus simulated loss and latency.
//!
//! The channel sits between the session and the wire. Outbound packets go
//! straight to the socket; inbound packets pass a drop filter and a delay
//! queue ordered by scheduled delivery time, so tests can reproduce loss,
//! reordering and latency without leaving the process.
use rand::Rng;
use std::collections::VecDeque;

use crate::address::NetAddress;
use crate::packet::NetPacket;
use crate::socket::{SocketError, UdpSocket};

enum Transport {
    Udp(UdpSocket),
    /// Degenerate variant: outbound short-circuits to the inbound queue
    /// without touching a socket.
    Loopback(VecDeque<NetPacket>),
}

pub struct PacketChannel {
    transport: Transport,
    local_address: NetAddress,

    packet_loss: f32,
    min_lag_ms: f64,
    max_lag_ms: f64,

    /// Delayed inbound packets, ascending by scheduled delivery time.
    lag_queue: Vec<NetPacket>,
}

impl PacketChannel {
    pub fn new(socket: UdpSocket) -> Self {
        let local_address = socket.address();
        Self {
            transport: Transport::Udp(socket),
            local_address,
            packet_loss: 0.0,
            min_lag_ms: 0.0,
            max_lag_ms: 0.0,
            lag_queue: Vec::new(),
        }
    }

    /// A channel whose sends are its own receives. The same loss/lag
    /// policies apply.
    pub fn loopback(local_address: NetAddress) -> Self {
        Self {
            transport: Transport::Loopback(VecDeque::new()),
            local_address,
            packet_loss: 0.0,
            min_lag_ms: 0.0,
            max_lag_ms: 0.0,
            lag_queue: Vec::new(),
        }
    }

    pub fn address(&self) -> NetAddress {
        self.local_address
    }

    pub fn send(&mut self, addr: NetAddress, packet: &NetPacket) -> Result<usize, SocketError> {
        match &mut self.transport {
            Transport::Udp(socket) => socket.send_to(packet.as_bytes(), addr),
            Transport::Loopback(pending) => {
                let mut echo = packet.clone();
                echo.sender = self.local_address;
                let len = echo.bytes_used();
                pending.push_back(echo);
                Ok(len)
            }
        }
    }

    /// Yields at most one delivered packet per call.
    ///
    /// Each call also ingests at most one raw datagram, applying the loss
    /// filter and assigning a delivery time `now + uniform(min_lag, max_lag)`.
    /// A queued packet is surfaced only once its scheduled time has passed,
    /// in scheduled order.
    pub fn receive(&mut self, now_seconds: f64) -> Option<NetPacket> {
        let now_ms = now_seconds * 1000.0;

        if let Some(packet) = self.ingest_one() {
            if self.packet_loss > 0.0 && rand::thread_rng().gen::<f32>() < self.packet_loss {
                log::trace!("loss sim dropped inbound packet from {}", packet.sender);
            } else {
                let lag_ms = if self.max_lag_ms > self.min_lag_ms {
                    rand::thread_rng().gen_range(self.min_lag_ms..=self.max_lag_ms)
                } else {
                    self.min_lag_ms
                };
                let mut packet = packet;
                packet.delivery_time_ms = now_ms + lag_ms;
                self.lag_queue.push(packet);
                self.lag_queue.sort_by(|a, b| {
                    a.delivery_time_ms
                        .partial_cmp(&b.delivery_time_ms)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }

        if self
            .lag_queue
            .first()
            .is_some_and(|front| front.delivery_time_ms <= now_ms)
        {
            return Some(self.lag_queue.remove(0));
        }

        None
    }

    fn ingest_one(&mut self) -> Option<NetPacket> {
        match &mut self.transport {
            Transport::Udp(socket) => match socket.recv_from() {
                Ok(Some((data, from))) => NetPacket::from_bytes(data, from),
                Ok(None) => None,
                Err(e) => {
                    log::warn!("socket receive failed: {}", e);
                    None
                }
            },
            Transport::Loopback(pending) => pending.pop_front(),
        }
    }

    /// Probability in [0, 1] that an inbound datagram is discarded.
    pub fn set_loss(&mut self, loss: f32) {
        self.packet_loss = loss.clamp(0.0, 1.0);
    }

    /// Simulated inbound latency range; normalised so `0 <= min <= max`.
    pub fn set_lag(&mut self, min_lag_ms: f64, max_lag_ms: f64) {
        self.min_lag_ms = min_lag_ms.max(0.0);
        self.max_lag_ms = max_lag_ms.max(self.min_lag_ms);
    }
}
