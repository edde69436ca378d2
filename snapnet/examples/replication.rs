//! Minimal host/client pair in one process: the host replicates a counter
//! object and the client prints the snapshots it applies.
//!
//! Run with: cargo run --example replication
use snapnet::prelude::*;

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

const COUNTER_TYPE: u8 = 1;

struct CounterType {
    values: Rc<RefCell<Vec<u32>>>,
    label: &'static str,
}

impl NetObjectType for CounterType {
    fn snapshot_size(&self) -> usize {
        4
    }

    fn process_create_info(
        &mut self,
        _msg: &mut NetMessage,
        net_id: snapnet::NetObjectId,
    ) -> Option<ObjectHandle> {
        println!("[{}] created replica for net id {}", self.label, net_id);
        let mut values = self.values.borrow_mut();
        values.push(0);
        Some(ObjectHandle(values.len() as u32 - 1))
    }

    fn refresh_snapshot(&mut self, snapshot: &mut [u8], object: ObjectHandle) {
        snapshot.copy_from_slice(&self.values.borrow()[object.0 as usize].to_le_bytes());
    }

    fn append_snapshot(&mut self, msg: &mut NetMessage, snapshot: &[u8]) {
        msg.write_bytes(snapshot).unwrap();
    }

    fn process_snapshot(&mut self, msg: &mut NetMessage, snapshot: &mut [u8]) {
        msg.read_bytes(snapshot).unwrap();
    }

    fn apply_snapshot(&mut self, snapshot: &[u8], object: ObjectHandle, _delta_seconds: f64) {
        let value = u32::from_le_bytes(snapshot.try_into().unwrap());
        let mut values = self.values.borrow_mut();
        if values[object.0 as usize] != value {
            values[object.0 as usize] = value;
            println!("[{}] counter is now {}", self.label, value);
        }
    }
}

fn session_with_counter(label: &'static str) -> (UdpSession, NetObjectSystem, Rc<RefCell<Vec<u32>>>) {
    let mut session = UdpSession::new(SessionConfig::default());
    let mut objects = NetObjectSystem::new(&mut session);
    let values = Rc::new(RefCell::new(Vec::new()));
    objects.register_type(
        COUNTER_TYPE,
        Box::new(CounterType {
            values: Rc::clone(&values),
            label,
        }),
    );
    (session, objects, values)
}

fn main() {
    env_logger::init();

    let (mut host, mut host_objects, host_values) = session_with_counter("host");
    host.host(0).unwrap();
    let host_port = host.local_address().unwrap().port;

    let (mut client, mut client_objects, _client_values) = session_with_counter("client");
    client.start(0).unwrap();
    client.join(NetAddress::new(0x7F000001, host_port)).unwrap();

    host_values.borrow_mut().push(0);
    let mut replicated = false;

    let dt = 1.0 / 60.0;
    for frame in 0..600 {
        for (session, objects) in [
            (&mut host, &mut host_objects),
            (&mut client, &mut client_objects),
        ] {
            for mut event in session.update(dt) {
                if !objects.process_event(session, &mut event) {
                    if let SessionEvent::SessionJoined = event {
                        println!("[client] joined session");
                    }
                }
            }
            objects.tick(session);
        }

        if client.is_ready() && !replicated {
            host_objects
                .replicate(&mut host, ObjectHandle(0), COUNTER_TYPE)
                .unwrap();
            replicated = true;
        }

        if replicated && frame % 60 == 0 {
            host_values.borrow_mut()[0] += 1;
        }

        thread::sleep(Duration::from_millis(2));
    }
}
