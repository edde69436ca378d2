//! # snapnet
//!
//! A session-based reliable UDP transport with snapshot object replication,
//! built for games that run a synchronous, polling frame loop.
//!
//! The stack is layered: a non-blocking datagram socket, a packet channel
//! that can simulate loss and latency, MTU-sized packets of bundled message
//! records, per-connection reliable/in-order delivery with selective acks,
//! a session state machine that handles discovery and joining, and a
//! NetObject system that replicates per-object snapshots at a fixed tick
//! rate.
//!
//! ## Features
//!
//! - **Per-message delivery flags**: unreliable, reliable, reliable
//!   in-order, connectionless
//! - **Selective acknowledgement** with a 16-deep ack history bitfield and
//!   a 1024-id reliable sliding window
//! - **Deterministic simulated time**: the session clock advances only
//!   through `update(dt)`, so loss, lag, and every timeout replay exactly
//!   in tests
//! - **Loss/latency simulation** inside the packet channel
//! - **Snapshot replication** with host-authoritative clock sync and
//!   stale-update rejection
//!
//! ## Quick Start
//!
//! ```no_run
//! use snapnet::prelude::*;
//!
//! // Host
//! let mut session = UdpSession::new(SessionConfig::default());
//! session.host(1919).unwrap();
//!
//! loop {
//!     for event in session.update(1.0 / 60.0) {
//!         match event {
//!             SessionEvent::ConnectionJoined(index) => println!("joined: {}", index),
//!             SessionEvent::Message(msg) => println!("message {}", msg.message_type_id),
//!             _ => {}
//!         }
//!     }
//! }
//! ```

pub mod address;
pub mod bitpack;
pub mod channel;
pub mod connection;
pub mod cycle;
pub mod interval;
pub mod message;
pub mod object;
pub mod packet;
pub mod registry;
pub mod session;
pub mod socket;
pub mod stats;

pub use address::{resolve_hostname, AddressError, NetAddress};
pub use bitpack::BitPacker;
pub use channel::PacketChannel;
pub use connection::{Connection, PacketTracker, RELIABLE_ID_WINDOW, RELIABLE_RESEND_SECONDS};
pub use cycle::Cycle;
pub use interval::Interval;
pub use message::{NetMessage, INVALID_RELIABLE_ID, INVALID_SEQUENCE_ID, MAX_PAYLOAD_SIZE};
pub use object::{NetObject, NetObjectId, NetObjectSystem, NetObjectType, ObjectHandle};
pub use packet::{NetPacket, INVALID_ACK_ID, INVALID_CONNECTION_INDEX, PACKET_MTU};
pub use registry::{core_message, HandlerRoute, MessageDefinition, MessageFlags, MessageRegistry};
pub use session::{
    SessionConfig, SessionError, SessionEvent, SessionState, UdpSession, DEFAULT_UDP_PORT,
};
pub use socket::{SocketError, UdpSocket};
pub use stats::{ConnectionStats, SocketStats};

/// Unified error type encompassing all snapnet error variants.
#[derive(Debug)]
pub enum NetError {
    Socket(SocketError),
    Session(SessionError),
    Address(AddressError),
    Io(std::io::Error),
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetError::Socket(e) => write!(f, "Socket error: {}", e),
            NetError::Session(e) => write!(f, "Session error: {}", e),
            NetError::Address(e) => write!(f, "Address error: {}", e),
            NetError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for NetError {}

impl From<SocketError> for NetError {
    fn from(err: SocketError) -> Self {
        NetError::Socket(err)
    }
}

impl From<SessionError> for NetError {
    fn from(err: SessionError) -> Self {
        NetError::Session(err)
    }
}

impl From<AddressError> for NetError {
    fn from(err: AddressError) -> Self {
        NetError::Address(err)
    }
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        NetError::Io(err)
    }
}

/// Prelude: import everything commonly needed.
pub mod prelude {
    pub use crate::{
        core_message, MessageFlags, NetAddress, NetError, NetMessage, NetObjectSystem,
        NetObjectType, ObjectHandle, SessionConfig, SessionEvent, SessionState, UdpSession,
    };
}
