//! Session lifecycle, the join handshake and inbound dispatch.
//!
//! A session owns the packet channel and a slot array of connections and is
//! driven exclusively by [`UdpSession::update`] from the application's frame
//! loop. Core handshake messages are consumed by the state machine; every
//! other registered message surfaces as a [`SessionEvent`].
use crate::address::{AddressError, NetAddress};
use crate::channel::PacketChannel;
use crate::connection::Connection;
use crate::interval::Interval;
use crate::message::NetMessage;
use crate::packet::{NetPacket, INVALID_CONNECTION_INDEX};
use crate::registry::{core_message, HandlerRoute, MessageFlags, MessageRegistry};
use crate::socket::{SocketError, UdpSocket};

/// Well-known session port.
pub const DEFAULT_UDP_PORT: u16 = 1919;
pub const DEFAULT_PORT_ATTEMPT_RANGE: u16 = 32;
pub const DEFAULT_MAX_CONNECTIONS: u8 = 8;

/// Errors surfaced by session operations.
#[derive(Debug)]
pub enum SessionError {
    AlreadyStarted,
    NotStarted,
    InvalidState,
    Socket(SocketError),
    Address(AddressError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::AlreadyStarted => write!(f, "Session already started"),
            SessionError::NotStarted => write!(f, "Session not started"),
            SessionError::InvalidState => write!(f, "Operation not valid in current state"),
            SessionError::Socket(e) => write!(f, "Socket error: {}", e),
            SessionError::Address(e) => write!(f, "Address error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<SocketError> for SessionError {
    fn from(err: SocketError) -> Self {
        SessionError::Socket(err)
    }
}

impl From<AddressError> for SessionError {
    fn from(err: AddressError) -> Self {
        SessionError::Address(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Invalid,
    Disconnected,
    Discover,
    Connecting,
    Joining,
    Ready,
}

/// Events emitted by [`UdpSession::update`].
#[derive(Debug)]
pub enum SessionEvent {
    ConnectionJoined(u8),
    ConnectionLeft(u8),
    SessionJoined,
    HostLeft,
    /// A non-core message that cleared duplicate suppression and ordering.
    Message(NetMessage),
}

/// Tunables, all defaulting to the protocol constants.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_connections: u8,
    /// Per-connection packet build rate.
    pub tick_hz: f64,
    /// Send a heartbeat after this much send silence.
    pub heartbeat_seconds: f64,
    /// A peer silent this long is also heartbeated.
    pub healthy_seconds: f64,
    /// A peer silent this long is destroyed.
    pub timeout_seconds: f64,
    /// Discover / connecting give up after this long.
    pub join_timeout_seconds: f64,
    /// PING / JOIN_REQUEST resend rate while joining.
    pub join_retry_hz: f64,
    pub port_attempt_range: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            tick_hz: crate::connection::DEFAULT_TICK_HZ,
            heartbeat_seconds: 1.0,
            healthy_seconds: 3.0,
            timeout_seconds: 30.0,
            join_timeout_seconds: 30.0,
            join_retry_hz: 4.0,
            port_attempt_range: DEFAULT_PORT_ATTEMPT_RANGE,
        }
    }
}

/// A UDP session: packet channel, connection slots, message registry and the
/// discovery/join state machine.
pub struct UdpSession {
    config: SessionConfig,
    state: SessionState,
    registry: MessageRegistry,
    channel: Option<PacketChannel>,
    connections: Vec<Option<Connection>>,
    my_connection_index: Option<u8>,
    host_connection_index: Option<u8>,
    listening: bool,
    clock: f64,

    host_join_address: NetAddress,
    discover_timeout: f64,
    discover_interval: Interval,
    connecting_timeout: f64,
    connecting_interval: Interval,
    join_token: u32,

    events: Vec<SessionEvent>,
}

impl UdpSession {
    pub fn new(config: SessionConfig) -> Self {
        let mut registry = MessageRegistry::new();
        registry.register(
            core_message::PING,
            MessageFlags::connectionless(),
            HandlerRoute::Core,
        );
        registry.register(
            core_message::PONG,
            MessageFlags::connectionless(),
            HandlerRoute::Core,
        );
        registry.register(
            core_message::JOIN_REQUEST,
            MessageFlags::connectionless(),
            HandlerRoute::Core,
        );
        registry.register(
            core_message::JOIN_RESPONSE,
            MessageFlags::connectionless(),
            HandlerRoute::Core,
        );
        registry.register(
            core_message::HEARTBEAT,
            MessageFlags::unreliable(),
            HandlerRoute::Core,
        );
        registry.register(
            core_message::LEAVE,
            MessageFlags::unreliable(),
            HandlerRoute::Core,
        );

        let max_connections = config.max_connections;
        let join_retry_hz = config.join_retry_hz;
        Self {
            config,
            state: SessionState::Invalid,
            registry,
            channel: None,
            connections: (0..max_connections).map(|_| None).collect(),
            my_connection_index: None,
            host_connection_index: None,
            listening: false,
            clock: 0.0,
            host_join_address: NetAddress::default(),
            discover_timeout: 0.0,
            discover_interval: Interval::from_frequency(join_retry_hz, 0.0),
            connecting_timeout: 0.0,
            connecting_interval: Interval::from_frequency(join_retry_hz, 0.0),
            join_token: 0,
            events: Vec::new(),
        }
    }

    /// Registers an application message type. Returns false if the id is
    /// taken (the core ids always are).
    pub fn register_message(&mut self, id: u8, flags: MessageFlags) -> bool {
        self.registry.register(id, flags, HandlerRoute::Event)
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    // -- lifecycle --------------------------------------------------------

    /// Binds the socket, walking the configured port range, and enters
    /// `Disconnected`.
    pub fn start(&mut self, port: u16) -> Result<(), SessionError> {
        if self.channel.is_some() {
            return Err(SessionError::AlreadyStarted);
        }
        let socket = UdpSocket::bind(port, self.config.port_attempt_range)?;
        log::debug!("session bound at {}", socket.address());
        self.channel = Some(PacketChannel::new(socket));
        self.set_state(SessionState::Disconnected);
        Ok(())
    }

    /// Drops the channel and returns to `Invalid`.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        if SessionState::Invalid == self.state {
            return Err(SessionError::InvalidState);
        }
        self.channel = None;
        self.set_state(SessionState::Invalid);
        Ok(())
    }

    /// Installs the local connection into slot 0 and becomes a listening
    /// host.
    pub fn host(&mut self, port: u16) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected && self.state != SessionState::Invalid {
            return Err(SessionError::InvalidState);
        }
        if self.channel.is_none() {
            self.start(port)?;
        }

        let local_addr = self.local_address().ok_or(SessionError::NotStarted)?;
        self.create_connection(0, "host", local_addr);
        self.host_connection_index = Some(0);
        self.my_connection_index = Some(0);
        self.listening = true;
        self.set_state(SessionState::Ready);
        Ok(())
    }

    /// Begins discovery of a host at `address`.
    pub fn join(&mut self, address: NetAddress) -> Result<(), SessionError> {
        if SessionState::Invalid == self.state {
            self.start(DEFAULT_UDP_PORT)?;
        }
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState);
        }

        self.host_join_address = address;
        self.discover_timeout = self.config.join_timeout_seconds;
        self.discover_interval.reset(self.clock);
        self.set_state(SessionState::Discover);
        Ok(())
    }

    /// Notifies every peer, flushes, and drops to `Disconnected`.
    pub fn leave(&mut self) {
        let Some(my_index) = self.my_connection_index else {
            self.set_state(SessionState::Disconnected);
            return;
        };

        let mut leave_msg = NetMessage::new(core_message::LEAVE);
        let _ = leave_msg.write_u8(my_index);

        for idx in 0..self.connections.len() as u8 {
            if self.connections[idx as usize].is_some() {
                self.send_packet_immediately(idx, leave_msg.clone());
                self.flush_connection(idx);
            }
        }

        self.set_state(SessionState::Disconnected);
    }

    /// Drives the state machine. Call once per frame with the elapsed
    /// seconds; returns the events produced this step.
    pub fn update(&mut self, dt: f64) -> Vec<SessionEvent> {
        self.clock += dt;
        match self.state {
            SessionState::Discover => self.discover_update(dt),
            SessionState::Connecting => self.connecting_update(dt),
            SessionState::Joining => self.joining_update(),
            SessionState::Ready => self.ready_update(dt),
            _ => {}
        }
        std::mem::take(&mut self.events)
    }

    fn set_state(&mut self, new_state: SessionState) {
        self.state = new_state;
        if SessionState::Disconnected == self.state {
            self.destroy_all_connections();
        }
    }

    // -- state updates ----------------------------------------------------

    fn discover_update(&mut self, dt: f64) {
        self.discover_timeout -= dt;
        if self.discover_timeout <= 0.0 {
            log::warn!("discover timed out");
            self.events.push(SessionEvent::HostLeft);
            self.leave();
            return;
        }

        if self.discover_interval.check_and_reset(self.clock) {
            let msg = NetMessage::new(core_message::PING);
            self.send_message_direct(self.host_join_address, msg);
            log::debug!("sending ping to {}", self.host_join_address);
        }

        self.process_incoming_packets();
    }

    fn connecting_update(&mut self, dt: f64) {
        self.connecting_timeout -= dt;
        if self.connecting_timeout <= 0.0 {
            log::warn!("connecting timed out");
            self.events.push(SessionEvent::HostLeft);
            self.leave();
            return;
        }

        if self.connecting_interval.check_and_reset(self.clock) {
            let mut msg = NetMessage::new(core_message::JOIN_REQUEST);
            let _ = msg.write_u32(self.join_token);
            if let Some(host_idx) = self.host_connection_index {
                self.send_message_direct_to_index(host_idx, msg);
                log::debug!("sending join request");
            }
        }

        self.process_incoming_packets();
    }

    fn joining_update(&mut self) {
        self.set_state(SessionState::Ready);
        log::debug!("fully connected to host");
        self.events.push(SessionEvent::SessionJoined);
    }

    fn ready_update(&mut self, dt: f64) {
        if self.host_connection_index.is_none() {
            self.events.push(SessionEvent::HostLeft);
            self.leave();
            return;
        }

        let my_index = self.my_connection_index;
        let mut timed_out: Vec<u8> = Vec::new();

        for idx in 0..self.connections.len() {
            let Some(conn) = self.connections[idx].as_mut() else {
                continue;
            };
            let tick_due = conn.update(dt, self.clock);

            if Some(idx as u8) != my_index {
                if conn.time_since_last_recv >= self.config.healthy_seconds
                    || conn.time_since_last_send >= self.config.heartbeat_seconds
                {
                    conn.send(NetMessage::new(core_message::HEARTBEAT), &self.registry);
                }

                if conn.time_since_last_recv > self.config.timeout_seconds {
                    timed_out.push(idx as u8);
                    continue;
                }
            }

            if tick_due {
                if let Some(packet) =
                    conn.build_packet(&self.registry, self.clock, my_index.unwrap_or(INVALID_CONNECTION_INDEX))
                {
                    conn.time_since_last_send = 0.0;
                    let addr = conn.address;
                    if let Some(channel) = self.channel.as_mut() {
                        if let Err(e) = channel.send(addr, &packet) {
                            log::warn!("failed to send to {}: {}", addr, e);
                        }
                    }
                }
            }
        }

        for idx in timed_out {
            log::warn!("connection {} timed out", idx);
            self.destroy_connection(idx);
        }

        self.process_incoming_packets();
    }

    // -- inbound ----------------------------------------------------------

    fn process_incoming_packets(&mut self) {
        loop {
            let packet = match self.channel.as_mut() {
                Some(channel) => channel.receive(self.clock),
                None => None,
            };
            let Some(mut packet) = packet else {
                break;
            };

            let from_index = packet.from_conn_idx();
            if INVALID_CONNECTION_INDEX == from_index {
                self.process_connectionless_packet(&mut packet);
            } else if let Some(conn) = self
                .connections
                .get_mut(from_index as usize)
                .and_then(|slot| slot.as_mut())
            {
                let mut accepted = Vec::new();
                conn.process_packet(&mut packet, &self.registry, &mut accepted);
                for msg in accepted {
                    self.dispatch_message(msg);
                }
            } else {
                log::trace!("dropping packet from unknown connection index {}", from_index);
            }
        }
    }

    fn process_connectionless_packet(&mut self, packet: &mut NetPacket) {
        loop {
            let Some(mut msg) = packet.read(&self.registry) else {
                return;
            };
            msg.sender = None;
            msg.sender_address = packet.sender;

            if self.registry.flags(msg.message_type_id).connectionless {
                self.dispatch_message(msg);
            }
        }
    }

    fn dispatch_message(&mut self, msg: NetMessage) {
        let route = self.registry.expect(msg.message_type_id).route;
        match route {
            HandlerRoute::Core => self.handle_core_message(msg),
            HandlerRoute::Event => self.events.push(SessionEvent::Message(msg)),
        }
    }

    fn handle_core_message(&mut self, msg: NetMessage) {
        match msg.message_type_id {
            core_message::PING => self.handle_ping(msg),
            core_message::PONG => self.handle_pong(msg),
            core_message::JOIN_REQUEST => self.handle_join_request(msg),
            core_message::JOIN_RESPONSE => self.handle_join_response(msg),
            core_message::LEAVE => self.handle_leave(msg),
            core_message::HEARTBEAT => {}
            _ => {}
        }
    }

    // -- join handshake ---------------------------------------------------

    fn handle_ping(&mut self, msg: NetMessage) {
        if !(SessionState::Ready == self.state && self.is_host() && self.listening) {
            return;
        }
        let Some(host_idx) = self.host_connection_index else {
            return;
        };

        let mut response = NetMessage::new(core_message::PONG);
        let _ = response.write_u8(host_idx);
        let _ = response.write_u8(self.config.max_connections);
        self.send_message_direct(msg.sender_address, response);
        log::debug!("received ping, sending pong to {}", msg.sender_address);
    }

    fn handle_pong(&mut self, mut msg: NetMessage) {
        if self.state != SessionState::Discover {
            return;
        }

        let (Ok(host_idx), Ok(max_connections)) = (msg.read_u8(), msg.read_u8()) else {
            log::warn!("malformed pong from {}", msg.sender_address);
            return;
        };

        self.set_max_connections(max_connections);
        self.join_token = rand::random();

        self.set_state(SessionState::Connecting);
        self.create_connection(host_idx, "host", msg.sender_address);
        self.host_connection_index = Some(host_idx);

        self.connecting_timeout = self.config.join_timeout_seconds;
        self.connecting_interval.reset(self.clock);
        log::debug!("received pong from host [index {}]", host_idx);
    }

    fn handle_join_request(&mut self, mut msg: NetMessage) {
        if self.state != SessionState::Ready {
            return;
        }

        let Ok(join_token) = msg.read_u32() else {
            log::warn!("malformed join request from {}", msg.sender_address);
            return;
        };

        // A retransmitted request for a connection we already made gets the
        // same accept back.
        let existing = self
            .connections
            .iter()
            .flatten()
            .find(|conn| conn.join_token != 0 && conn.join_token == join_token)
            .map(|conn| conn.index);
        if let Some(index) = existing {
            let mut accept = NetMessage::new(core_message::JOIN_RESPONSE);
            let _ = accept.write_bool(true);
            let _ = accept.write_u8(index);
            self.send_message_direct(msg.sender_address, accept);
            log::debug!("duplicate join request, re-sending accept for {}", index);
            return;
        }

        if !self.listening || !self.has_free_connection_slots() {
            let mut deny = NetMessage::new(core_message::JOIN_RESPONSE);
            let _ = deny.write_bool(false);
            self.send_message_direct(msg.sender_address, deny);
            log::debug!("join request denied for {}", msg.sender_address);
            return;
        }

        let Some(new_index) = self.free_connection_index() else {
            return;
        };
        self.create_connection(new_index, &format!("peer-{}", new_index), msg.sender_address);
        if let Some(conn) = self.connection_mut(new_index) {
            conn.join_token = join_token;
        }

        let mut accept = NetMessage::new(core_message::JOIN_RESPONSE);
        let _ = accept.write_bool(true);
        let _ = accept.write_u8(new_index);
        self.send_message_direct(msg.sender_address, accept);

        self.events.push(SessionEvent::ConnectionJoined(new_index));
        log::debug!("accepted join from {} as connection {}", msg.sender_address, new_index);
    }

    fn handle_join_response(&mut self, mut msg: NetMessage) {
        if self.state != SessionState::Connecting {
            return;
        }

        let Ok(success) = msg.read_bool() else {
            return;
        };
        if !success {
            log::warn!("host denied join");
            self.leave();
            return;
        }

        let Ok(assigned_index) = msg.read_u8() else {
            return;
        };
        let Some(local_addr) = self.local_address() else {
            return;
        };

        self.create_connection(assigned_index, "self", local_addr);
        self.my_connection_index = Some(assigned_index);
        let join_token = self.join_token;
        if let Some(conn) = self.connection_mut(assigned_index) {
            conn.join_token = join_token;
        }

        self.set_state(SessionState::Joining);
        self.events.push(SessionEvent::ConnectionJoined(assigned_index));
        log::debug!("join accepted, local connection at slot {}", assigned_index);
    }

    fn handle_leave(&mut self, mut msg: NetMessage) {
        let Ok(index) = msg.read_u8() else {
            return;
        };
        if self.connection(index).is_none() {
            return;
        }

        // Subscribers observe the departure before the slot is torn down.
        self.events.push(SessionEvent::ConnectionLeft(index));
        self.destroy_connection(index);
        log::debug!("received leave for connection {}", index);
    }

    // -- sending ----------------------------------------------------------

    /// Builds a connectionless one-message packet and submits it to the
    /// channel.
    pub fn send_message_direct(&mut self, dest: NetAddress, mut msg: NetMessage) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };

        let mut packet = NetPacket::new();
        packet.write(&mut msg, &self.registry, self.clock);
        packet.set_from_conn_idx(INVALID_CONNECTION_INDEX);
        packet.set_unreliable_bundle_count(1);

        if let Err(e) = channel.send(dest, &packet) {
            log::warn!("direct send to {} failed: {}", dest, e);
        }
    }

    pub fn send_message_direct_to_index(&mut self, index: u8, msg: NetMessage) {
        if let Some(conn) = self.connection(index) {
            let dest = conn.address;
            self.send_message_direct(dest, msg);
        }
    }

    /// Enqueues `msg` and forces one packet out immediately, bypassing the
    /// tick interval.
    pub fn send_packet_immediately(&mut self, index: u8, msg: NetMessage) {
        let my_index = self.my_connection_index.unwrap_or(INVALID_CONNECTION_INDEX);
        let clock = self.clock;
        let Some(conn) = self.connections.get_mut(index as usize).and_then(|s| s.as_mut()) else {
            return;
        };
        conn.send(msg, &self.registry);
        if let Some(packet) = conn.build_packet(&self.registry, clock, my_index) {
            conn.time_since_last_send = 0.0;
            let addr = conn.address;
            if let Some(channel) = self.channel.as_mut() {
                let _ = channel.send(addr, &packet);
            }
        }
    }

    /// Builds and transmits packets for a connection until its queues are
    /// drained of sendable messages.
    pub fn flush_connection(&mut self, index: u8) {
        let my_index = self.my_connection_index.unwrap_or(INVALID_CONNECTION_INDEX);
        let clock = self.clock;
        loop {
            let Some(conn) = self.connections.get_mut(index as usize).and_then(|s| s.as_mut())
            else {
                return;
            };
            let Some(packet) = conn.build_packet(&self.registry, clock, my_index) else {
                return;
            };
            conn.time_since_last_send = 0.0;
            let addr = conn.address;
            if let Some(channel) = self.channel.as_mut() {
                let _ = channel.send(addr, &packet);
            }
        }
    }

    pub fn send_to_index(&mut self, index: u8, msg: NetMessage) {
        if let Some(conn) = self.connections.get_mut(index as usize).and_then(|s| s.as_mut()) {
            conn.send(msg, &self.registry);
        }
    }

    pub fn send_to_all(&mut self, msg: NetMessage) {
        for idx in 0..self.connections.len() as u8 {
            if self.connections[idx as usize].is_some() {
                self.send_to_index(idx, msg.clone());
            }
        }
    }

    /// Sends to every connection except the local one.
    pub fn send_to_others(&mut self, msg: NetMessage) {
        for idx in 0..self.connections.len() as u8 {
            if Some(idx) == self.my_connection_index {
                continue;
            }
            if self.connections[idx as usize].is_some() {
                self.send_to_index(idx, msg.clone());
            }
        }
    }

    pub fn send_to_host(&mut self, msg: NetMessage) {
        if let Some(host_idx) = self.host_connection_index {
            self.send_to_index(host_idx, msg);
        }
    }

    // -- connection management --------------------------------------------

    fn create_connection(&mut self, index: u8, guid: &str, address: NetAddress) -> bool {
        if self.connection(index).is_some() {
            return false;
        }
        if self.connection_by_address(address).is_some() {
            return false;
        }
        if index as usize >= self.connections.len() {
            return false;
        }

        let mut conn = Connection::new(index, guid, address, self.clock);
        conn.set_tick_frequency(self.config.tick_hz, self.clock);

        if Some(address) == self.local_address() {
            self.my_connection_index = Some(index);
        }
        self.connections[index as usize] = Some(conn);
        true
    }

    pub fn destroy_connection(&mut self, index: u8) {
        let Some(slot) = self.connections.get_mut(index as usize) else {
            return;
        };
        if slot.take().is_none() {
            return;
        }

        if Some(index) == self.my_connection_index {
            self.my_connection_index = None;
        }
        if Some(index) == self.host_connection_index {
            self.host_connection_index = None;
        }
    }

    fn destroy_all_connections(&mut self) {
        for idx in 0..self.connections.len() as u8 {
            self.destroy_connection(idx);
        }
    }

    fn set_max_connections(&mut self, max_connections: u8) {
        self.config.max_connections = max_connections;
        self.connections
            .resize_with(max_connections as usize, || None);
    }

    fn has_free_connection_slots(&self) -> bool {
        self.connections.iter().any(|slot| slot.is_none())
    }

    fn free_connection_index(&self) -> Option<u8> {
        self.connections
            .iter()
            .position(|slot| slot.is_none())
            .map(|idx| idx as u8)
    }

    // -- accessors --------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn is_host(&self) -> bool {
        self.host_connection_index.is_some()
            && self.host_connection_index == self.my_connection_index
    }

    pub fn is_client(&self) -> bool {
        self.my_connection_index.is_some()
            && self.my_connection_index != self.host_connection_index
    }

    pub fn is_running(&self) -> bool {
        self.my_connection_index.is_some()
    }

    pub fn is_ready(&self) -> bool {
        SessionState::Ready == self.state
    }

    pub fn start_listening(&mut self) {
        self.listening = true;
    }

    pub fn stop_listening(&mut self) {
        self.listening = false;
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_bound(&self) -> bool {
        self.channel.is_some()
    }

    pub fn local_address(&self) -> Option<NetAddress> {
        self.channel.as_ref().map(|channel| channel.address())
    }

    pub fn host_address(&self) -> Option<NetAddress> {
        self.host_connection_index
            .and_then(|idx| self.connection(idx))
            .map(|conn| conn.address)
    }

    pub fn my_connection_index(&self) -> Option<u8> {
        self.my_connection_index
    }

    pub fn host_connection_index(&self) -> Option<u8> {
        self.host_connection_index
    }

    pub fn max_connections(&self) -> u8 {
        self.config.max_connections
    }

    pub fn connection(&self, index: u8) -> Option<&Connection> {
        self.connections.get(index as usize).and_then(|s| s.as_ref())
    }

    pub fn connection_mut(&mut self, index: u8) -> Option<&mut Connection> {
        self.connections.get_mut(index as usize).and_then(|s| s.as_mut())
    }

    pub fn connection_by_address(&self, address: NetAddress) -> Option<&Connection> {
        self.connections
            .iter()
            .flatten()
            .find(|conn| conn.address == address)
    }

    pub fn connection_by_guid(&self, guid: &str) -> Option<&Connection> {
        self.connections.iter().flatten().find(|conn| conn.guid == guid)
    }

    pub fn live_connection_count(&self) -> usize {
        self.connections.iter().flatten().count()
    }

    // -- simulation -------------------------------------------------------

    pub fn set_packet_loss(&mut self, loss: f32) {
        if let Some(channel) = self.channel.as_mut() {
            channel.set_loss(loss);
        }
    }

    pub fn set_packet_lag(&mut self, min_lag_ms: f64, max_lag_ms: f64) {
        if let Some(channel) = self.channel.as_mut() {
            channel.set_lag(min_lag_ms, max_lag_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_invalid_until_started() {
        let mut session = UdpSession::new(SessionConfig::default());
        assert_eq!(session.state(), SessionState::Invalid);
        session.start(0).unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.local_address().is_some());
    }

    #[test]
    fn test_start_twice_fails() {
        let mut session = UdpSession::new(SessionConfig::default());
        session.start(0).unwrap();
        assert!(matches!(session.start(0), Err(SessionError::AlreadyStarted)));
    }

    #[test]
    fn test_host_installs_local_connection_in_slot_zero() {
        let mut session = UdpSession::new(SessionConfig::default());
        session.start(0).unwrap();
        session.host(0).unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.is_host());
        assert!(!session.is_client());
        assert!(session.is_listening());
        assert_eq!(session.my_connection_index(), Some(0));
        assert_eq!(
            session.connection(0).unwrap().address,
            session.local_address().unwrap()
        );
    }

    #[test]
    fn test_core_ids_cannot_be_reregistered() {
        let mut session = UdpSession::new(SessionConfig::default());
        assert!(!session.register_message(core_message::PING, MessageFlags::unreliable()));
        assert!(session.register_message(100, MessageFlags::reliable()));
        assert!(!session.register_message(100, MessageFlags::reliable()));
    }

    #[test]
    fn test_discover_timeout_leaves_with_host_left_event() {
        let mut session = UdpSession::new(SessionConfig::default());
        session.start(0).unwrap();
        session
            .join(NetAddress::new(0x7F000001, 65000))
            .unwrap();
        assert_eq!(session.state(), SessionState::Discover);

        // Nobody answers; burn through the 30s timeout.
        let mut saw_host_left = false;
        for _ in 0..40 {
            for event in session.update(1.0) {
                if matches!(event, SessionEvent::HostLeft) {
                    saw_host_left = true;
                }
            }
        }
        assert!(saw_host_left);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.live_connection_count(), 0);
    }

    #[test]
    fn test_leave_without_connections_just_disconnects() {
        let mut session = UdpSession::new(SessionConfig::default());
        session.start(0).unwrap();
        session.leave();
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
