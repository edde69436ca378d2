//! Snapshot-based object replication on top of a session.
//!
//! The host owns every replicated object. At a fixed cadence it refreshes a
//! snapshot per object and sends a delta-less UPDATE to each peer whose last
//! sent copy differs. Clients apply the newest snapshot against a clock
//! mapping established once by SET_CLOCK; stale snapshots (older send time
//! than the last applied one) are discarded, which is the replication
//! layer's only defence against reordering of its unreliable updates.
use std::collections::{BTreeMap, HashMap};

use crate::interval::Interval;
use crate::message::NetMessage;
use crate::registry::{core_message, MessageFlags};
use crate::session::{SessionEvent, UdpSession};

pub const DEFAULT_OBJECT_UPDATE_HZ: f64 = 20.0;

pub type NetObjectId = u16;

/// Opaque key into an application-supplied object registry. The transport
/// never dereferences application memory; it only carries this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u32);

/// Capabilities of one replicated object type.
///
/// Everything defaults to a no-op; a type implements just what its data
/// needs. Snapshot buffers are fixed at `snapshot_size` bytes and compared
/// byte-for-byte to decide whether a peer needs an update.
pub trait NetObjectType {
    fn snapshot_size(&self) -> usize;

    fn append_create_info(&mut self, _msg: &mut NetMessage, _object: ObjectHandle) {}

    /// Builds the local object for a replica; `None` aborts the create.
    fn process_create_info(
        &mut self,
        _msg: &mut NetMessage,
        _net_id: NetObjectId,
    ) -> Option<ObjectHandle> {
        None
    }

    fn append_destroy_info(&mut self, _msg: &mut NetMessage, _object: ObjectHandle) {}

    fn process_destroy_info(&mut self, _msg: &mut NetMessage, _object: ObjectHandle) {}

    fn refresh_snapshot(&mut self, _snapshot: &mut [u8], _object: ObjectHandle) {}

    fn append_snapshot(&mut self, _msg: &mut NetMessage, _snapshot: &[u8]) {}

    fn process_snapshot(&mut self, _msg: &mut NetMessage, _snapshot: &mut [u8]) {}

    fn apply_snapshot(&mut self, _snapshot: &[u8], _object: ObjectHandle, _delta_seconds: f64) {}
}

/// Bookkeeping for one replicated object.
pub struct NetObject {
    pub type_id: u8,
    pub net_id: NetObjectId,
    pub object: ObjectHandle,

    current_snapshot: Vec<u8>,
    last_received_snapshot: Vec<u8>,
    last_sent_snapshots: HashMap<u8, Vec<u8>>,

    last_received_client_timestamp: f64,
    last_updated_timestamp: f64,
    snapshot_valid: bool,
    is_local_dirty: bool,
}

impl NetObject {
    fn new(type_id: u8, net_id: NetObjectId, object: ObjectHandle, snapshot_size: usize) -> Self {
        Self {
            type_id,
            net_id,
            object,
            current_snapshot: vec![0u8; snapshot_size],
            last_received_snapshot: vec![0u8; snapshot_size],
            last_sent_snapshots: HashMap::new(),
            last_received_client_timestamp: 0.0,
            last_updated_timestamp: 0.0,
            snapshot_valid: false,
            is_local_dirty: false,
        }
    }

    /// True when the peer's last-sent snapshot byte-matches the current one.
    /// A peer that has never been sent a copy has no comparison basis and is
    /// always out of sync.
    pub fn is_synced(&self, conn_index: u8) -> bool {
        match self.last_sent_snapshots.get(&conn_index) {
            Some(last_sent) => last_sent[..] == self.current_snapshot[..],
            None => false,
        }
    }

    pub fn save_last_sent_snapshot(&mut self, conn_index: u8) {
        self.last_sent_snapshots
            .insert(conn_index, self.current_snapshot.clone());
    }

    pub fn last_updated_timestamp(&self) -> f64 {
        self.last_updated_timestamp
    }

    pub fn has_valid_snapshot(&self) -> bool {
        self.snapshot_valid
    }

    /// True between receiving a snapshot and applying it locally.
    pub fn is_locally_dirty(&self) -> bool {
        self.is_local_dirty
    }
}

/// The replication system, bound to exactly one session.
pub struct NetObjectSystem {
    update_interval: Interval,
    types: HashMap<u8, Box<dyn NetObjectType>>,
    objects: BTreeMap<NetObjectId, NetObject>,
    next_id: NetObjectId,

    host_clock_at_sync: f64,
    client_clock_at_sync: f64,
    clock_synced: bool,
}

impl NetObjectSystem {
    /// Binds the system to `session`, claiming the four replication message
    /// ids.
    pub fn new(session: &mut UdpSession) -> Self {
        let registered = session
            .register_message(core_message::NETOBJECT_CREATE, MessageFlags::reliable_in_order())
            && session
                .register_message(core_message::NETOBJECT_DESTROY, MessageFlags::reliable_in_order())
            && session.register_message(core_message::NETOBJECT_UPDATE, MessageFlags::unreliable())
            && session.register_message(core_message::NETOBJECT_SET_CLOCK, MessageFlags::reliable());
        debug_assert!(registered, "net object message ids already registered");

        Self {
            update_interval: Interval::from_frequency(DEFAULT_OBJECT_UPDATE_HZ, session.clock()),
            types: HashMap::new(),
            objects: BTreeMap::new(),
            next_id: 0,
            host_clock_at_sync: 0.0,
            client_clock_at_sync: 0.0,
            clock_synced: false,
        }
    }

    pub fn register_type(&mut self, type_id: u8, definition: Box<dyn NetObjectType>) {
        self.types.insert(type_id, definition);
    }

    pub fn set_update_hz(&mut self, hz: f64, now: f64) {
        self.update_interval.set_frequency(hz, now);
    }

    pub fn update_hz(&self) -> f64 {
        1.0 / self.update_interval.period()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn find(&self, net_id: NetObjectId) -> Option<&NetObject> {
        self.objects.get(&net_id)
    }

    pub fn is_clock_synced(&self) -> bool {
        self.clock_synced
    }

    // -- host side --------------------------------------------------------

    /// Starts replicating a local object; broadcasts CREATE to every peer.
    pub fn replicate(
        &mut self,
        session: &mut UdpSession,
        object: ObjectHandle,
        type_id: u8,
    ) -> Option<NetObjectId> {
        if !self.types.contains_key(&type_id) {
            return None;
        }
        let net_id = self.unused_net_id();

        let definition = self.types.get_mut(&type_id)?;
        let snapshot_size = definition.snapshot_size();

        let mut create = NetMessage::new(core_message::NETOBJECT_CREATE);
        let _ = create.write_u8(type_id);
        let _ = create.write_u16(net_id);
        definition.append_create_info(&mut create, object);

        self.objects
            .insert(net_id, NetObject::new(type_id, net_id, object, snapshot_size));
        session.send_to_others(create);

        Some(net_id)
    }

    /// Stops replicating; broadcasts DESTROY to every peer.
    pub fn stop_replication(&mut self, session: &mut UdpSession, net_id: NetObjectId) {
        let Some(net_object) = self.objects.remove(&net_id) else {
            return;
        };

        let mut destroy = NetMessage::new(core_message::NETOBJECT_DESTROY);
        let _ = destroy.write_u16(net_id);
        if let Some(definition) = self.types.get_mut(&net_object.type_id) {
            definition.append_destroy_info(&mut destroy, net_object.object);
        }
        session.send_to_others(destroy);
    }

    fn unused_net_id(&mut self) -> NetObjectId {
        while self.objects.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        self.next_id
    }

    // -- driving ----------------------------------------------------------

    /// Runs the replication cadence. Call once per frame after
    /// `session.update`.
    pub fn tick(&mut self, session: &mut UdpSession) {
        let now = session.clock();

        if self.update_interval.check_and_reset(now) && session.is_host() {
            self.send_updates(session);
        }

        if session.is_client() && self.clock_synced {
            for net_object in self.objects.values_mut() {
                if !net_object.snapshot_valid {
                    continue;
                }
                let dt = now - net_object.last_received_client_timestamp;
                if dt <= 0.0 {
                    continue;
                }
                if let Some(definition) = self.types.get_mut(&net_object.type_id) {
                    definition.apply_snapshot(
                        &net_object.last_received_snapshot,
                        net_object.object,
                        dt,
                    );
                    net_object.is_local_dirty = false;
                }
            }
        }
    }

    fn send_updates(&mut self, session: &mut UdpSession) {
        for net_object in self.objects.values_mut() {
            if let Some(definition) = self.types.get_mut(&net_object.type_id) {
                definition.refresh_snapshot(&mut net_object.current_snapshot, net_object.object);
            }
        }

        let my_index = session.my_connection_index();
        for conn_index in 0..session.max_connections() {
            if Some(conn_index) == my_index {
                continue;
            }
            if session.connection(conn_index).is_none() {
                continue;
            }

            for net_object in self.objects.values_mut() {
                if net_object.is_synced(conn_index) {
                    continue;
                }
                let Some(definition) = self.types.get_mut(&net_object.type_id) else {
                    continue;
                };

                let mut update = NetMessage::new(core_message::NETOBJECT_UPDATE);
                let _ = update.write_u16(net_object.net_id);
                let _ = update.write_f64(session.clock());
                definition.append_snapshot(&mut update, &net_object.current_snapshot);

                session.send_to_index(conn_index, update);
                net_object.save_last_sent_snapshot(conn_index);
            }
        }
    }

    /// Consumes replication events from the session. Returns true when the
    /// event was fully handled here.
    pub fn process_event(&mut self, session: &mut UdpSession, event: &mut SessionEvent) -> bool {
        match event {
            SessionEvent::ConnectionJoined(conn_index) => {
                if session.is_host() {
                    self.init_connection(session, *conn_index);
                }
                false
            }
            SessionEvent::Message(msg) => match msg.message_type_id {
                core_message::NETOBJECT_CREATE => {
                    self.handle_create(msg);
                    true
                }
                core_message::NETOBJECT_DESTROY => {
                    self.handle_destroy(msg);
                    true
                }
                core_message::NETOBJECT_UPDATE => {
                    self.handle_update(msg);
                    true
                }
                core_message::NETOBJECT_SET_CLOCK => {
                    self.handle_set_clock(session, msg);
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Brings a newly joined peer up to date: clock first, then a CREATE per
    /// live object.
    fn init_connection(&mut self, session: &mut UdpSession, conn_index: u8) {
        let mut set_clock = NetMessage::new(core_message::NETOBJECT_SET_CLOCK);
        let _ = set_clock.write_f64(session.clock());
        session.send_to_index(conn_index, set_clock);

        for net_object in self.objects.values_mut() {
            let Some(definition) = self.types.get_mut(&net_object.type_id) else {
                continue;
            };
            let mut create = NetMessage::new(core_message::NETOBJECT_CREATE);
            let _ = create.write_u8(net_object.type_id);
            let _ = create.write_u16(net_object.net_id);
            definition.append_create_info(&mut create, net_object.object);
            session.send_to_index(conn_index, create);
        }
    }

    // -- message handlers -------------------------------------------------

    fn handle_create(&mut self, msg: &mut NetMessage) {
        let (Ok(type_id), Ok(net_id)) = (msg.read_u8(), msg.read_u16()) else {
            log::warn!("malformed net object create");
            return;
        };

        let Some(definition) = self.types.get_mut(&type_id) else {
            log::warn!("create for unregistered net object type {}", type_id);
            return;
        };

        let Some(object) = definition.process_create_info(msg, net_id) else {
            return;
        };

        let snapshot_size = definition.snapshot_size();
        self.objects
            .insert(net_id, NetObject::new(type_id, net_id, object, snapshot_size));
    }

    fn handle_destroy(&mut self, msg: &mut NetMessage) {
        let Ok(net_id) = msg.read_u16() else {
            return;
        };
        let Some(net_object) = self.objects.remove(&net_id) else {
            return;
        };
        if let Some(definition) = self.types.get_mut(&net_object.type_id) {
            definition.process_destroy_info(msg, net_object.object);
        }
    }

    fn handle_update(&mut self, msg: &mut NetMessage) {
        let Ok(net_id) = msg.read_u16() else {
            return;
        };
        // The embedded host time is superseded by the record's send
        // timestamp, which the staleness comparison uses.
        let _ = msg.read_f64();
        let host_time = f64::from(msg.sent_time);

        let Some(net_object) = self.objects.get_mut(&net_id) else {
            return;
        };

        if host_time <= net_object.last_updated_timestamp {
            return;
        }

        let client_timestamp = (host_time - self.host_clock_at_sync) + self.client_clock_at_sync;
        if let Some(definition) = self.types.get_mut(&net_object.type_id) {
            definition.process_snapshot(msg, &mut net_object.last_received_snapshot);
        }
        net_object.last_received_client_timestamp = client_timestamp;
        net_object.last_updated_timestamp = host_time;
        net_object.snapshot_valid = true;
        net_object.is_local_dirty = true;
    }

    fn handle_set_clock(&mut self, session: &UdpSession, msg: &mut NetMessage) {
        if self.clock_synced {
            return;
        }
        self.host_clock_at_sync = f64::from(msg.sent_time);
        self.client_clock_at_sync = session.clock();
        self.clock_synced = true;
        log::debug!("replication clock synced to host");
    }

    /// Converts a host timestamp into the local clock domain.
    pub fn host_time_to_client_time(&self, host_time: f64) -> f64 {
        (host_time - self.host_clock_at_sync) + self.client_clock_at_sync
    }
}
