//! The long-lived per-peer record. Outlives any single `Connection`.

use std::collections::VecDeque;
use std::time::Instant;

use bitflags::bitflags;

use crate::connection::ConnectionHandle;
use crate::message::{EndpointKey, Message, TYPE_NOOP};

bitflags! {
    pub struct RemoteFlags: u32 {
        /// Reconnect backoff is in effect; the dispatcher does nothing
        /// until the debounce timer unblocks it.
        const CONN_BLOCKED = 1 << 0;
    }
}

pub struct Remote {
    pub key: EndpointKey,
    /// The currently authoritative `Connection`, if any.
    pub conn: Option<ConnectionHandle>,
    pub msg_queue: VecDeque<Message>,
    pub cntl_msg_queue: VecDeque<Message>,
    /// Synchronous mode: the one data message currently awaiting an ACK.
    pub wait_ack_message: Option<Message>,
    pub noop: Message,
    pub serial: u32,
    pub flags: RemoteFlags,
    pub timestamp: Instant,
}

impl Remote {
    pub fn new(key: EndpointKey) -> Remote {
        let mut noop = Message::new(key.address, key.port);
        noop.ty = TYPE_NOOP;
        Remote {
            key,
            conn: None,
            msg_queue: VecDeque::new(),
            cntl_msg_queue: VecDeque::new(),
            wait_ack_message: None,
            noop,
            serial: 0,
            flags: RemoteFlags::empty(),
            timestamp: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.timestamp = Instant::now();
    }

    /// Nothing queued and nothing in flight: eligible for GC.
    pub fn is_idle(&self) -> bool {
        self.conn.is_none()
            && self.msg_queue.is_empty()
            && self.cntl_msg_queue.is_empty()
            && self.wait_ack_message.is_none()
    }

    pub fn next_serial(&mut self) -> u32 {
        let s = self.serial.wrapping_add(1);
        self.serial = s;
        s
    }
}
