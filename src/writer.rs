//! Serialises the current outgoing message and tracks completion.
//!
//! Owns the per-connection send timeout and the reusable wire-header
//! scratch buffer. At most one message is ever in flight through a
//! `Writer` at a time — `Remote::process_queues` enforces that only one
//! write is started per connection.

use crate::message::{Message, MsgFlags};
use crate::serializer::{WireHeader, WIRE_HEADER_SIZE};

/// The three buffers a [`Writer`] hands the transport for a single
/// scatter write: wire header, message header, message data. The
/// latter two may be empty.
pub struct WriteBuffers {
    pub wire_header: [u8; WIRE_HEADER_SIZE],
    pub header: Vec<u8>,
    pub data: Vec<u8>,
}

/// Tracks the message currently being transmitted on one connection.
pub struct Writer {
    in_flight: Option<InFlight>,
}

struct InFlight {
    msg: Message,
}

impl Writer {
    pub fn new() -> Self {
        Writer { in_flight: None }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Assign `serial` (already incremented by the caller) and
    /// serialise `msg`'s wire header, returning the three buffers a
    /// scatter write needs. Panics if a message is already in flight —
    /// `Remote::process_queues` must never call this twice without an
    /// intervening completion.
    pub fn begin(&mut self, mut msg: Message, serial: u32) -> WriteBuffers {
        assert!(self.in_flight.is_none(), "writer already has a message in flight");
        msg.serial = serial;
        let wire = WireHeader {
            identity: msg.identity,
            serial,
            ty: msg.ty,
            header_len: msg.header_len(),
            data_len: msg.data_len(),
        };
        let mut wire_header = [0u8; WIRE_HEADER_SIZE];
        wire.encode(&mut wire_header);
        let bufs = WriteBuffers {
            wire_header,
            header: msg.header.clone(),
            data: msg.data.clone(),
        };
        self.in_flight = Some(InFlight { msg });
        bufs
    }

    /// The underlying socket write completed. If the message did not
    /// request an ACK, `ACK_RECEIVED` is simulated immediately.
    pub fn on_write_complete(&mut self) {
        if let Some(f) = self.in_flight.as_mut() {
            f.msg.flags.insert(MsgFlags::WRITE_DONE);
            if !f.msg.req_ack() {
                f.msg.flags.insert(MsgFlags::ACK_RECEIVED);
            }
        }
    }

    /// An ACK matching the in-flight message's identity arrived.
    pub fn on_ack_received(&mut self) {
        if let Some(f) = self.in_flight.as_mut() {
            f.msg.flags.insert(MsgFlags::ACK_RECEIVED);
        }
    }

    /// A message completes when both `WRITE_DONE` and `ACK_RECEIVED`
    /// are set. Returns the finished message so the caller can invoke
    /// its send callback and free the in-flight slot.
    pub fn take_if_complete(&mut self) -> Option<Message> {
        let done = self
            .in_flight
            .as_ref()
            .map(|f| {
                f.msg.flags.contains(MsgFlags::WRITE_DONE)
                    && f.msg.flags.contains(MsgFlags::ACK_RECEIVED)
            })
            .unwrap_or(false);
        if done {
            self.in_flight.take().map(|f| f.msg)
        } else {
            None
        }
    }

    /// Abort whatever is in flight (connection shutdown, timeout),
    /// returning it so the caller can fire its send callback with the
    /// given reason.
    pub fn abort(&mut self) -> Option<Message> {
        self.in_flight.take().map(|f| f.msg)
    }

    pub fn current_identity(&self) -> Option<[u8; 16]> {
        self.in_flight.as_ref().map(|f| f.msg.identity)
    }
}

impl Default for Writer {
    fn default() -> Self {
        Writer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn msg() -> Message {
        let mut m = Message::new("127.0.0.1".parse::<IpAddr>().unwrap(), 1234);
        m.identity = [1; 16];
        m.data = b"hi".to_vec();
        m
    }

    #[test]
    fn completes_without_ack_on_write_done() {
        let mut w = Writer::new();
        w.begin(msg(), 1);
        assert!(w.take_if_complete().is_none());
        w.on_write_complete();
        let done = w.take_if_complete().expect("should complete without ack");
        assert_eq!(done.serial, 1);
    }

    #[test]
    fn waits_for_ack_when_requested() {
        let mut w = Writer::new();
        let mut m = msg();
        m.set_req_ack(true);
        w.begin(m, 5);
        w.on_write_complete();
        assert!(w.take_if_complete().is_none(), "still waiting on ack");
        w.on_ack_received();
        let done = w.take_if_complete().unwrap();
        assert_eq!(done.serial, 5);
    }

    #[test]
    #[should_panic(expected = "already has a message in flight")]
    fn rejects_second_concurrent_write() {
        let mut w = Writer::new();
        w.begin(msg(), 1);
        w.begin(msg(), 2);
    }
}
