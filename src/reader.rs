//! Pull-based reader state machine.
//!
//! Consumes a byte stream into fully formed [`Message`]s, acquiring a
//! slot from the owning connection's [`BufferPool`] for each one and
//! applying back-pressure (stopping the stream) when the pool is
//! exhausted. Used verbatim underneath both the cleartext and TLS
//! transports — the reader never branches on encryption.

use crate::buffer_pool::{BufferPool, INLINE_DATA_SIZE, INLINE_HEADER_SIZE};
use crate::error::{ChirpError, Result};
use crate::message::{Message, MsgFlags, TYPE_ACK, TYPE_NOOP, TYPE_REQ_ACK};
use crate::serializer::{Handshake, WireHeader, HANDSHAKE_SIZE, WIRE_HEADER_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Start,
    Handshake,
    Wait,
    Slot,
    Header,
    Data,
}

/// The environment a [`Reader`] is driven inside: everything it needs
/// to act on a decoded handshake, an ACK/NOOP, or a fully reassembled
/// message without owning the [`Connection`](crate::connection::Connection)
/// itself.
pub trait ReaderSink {
    fn pool(&self) -> &BufferPool;
    fn max_msg_size(&self) -> usize;

    /// Called once, to produce the bytes of our own outbound handshake
    /// when entering `START`.
    fn local_handshake(&self) -> Handshake;

    /// A peer handshake has just been decoded.
    fn on_handshake(&mut self, hs: Handshake) -> Result<()>;

    /// A NOOP liveness probe arrived.
    fn on_noop(&mut self);

    /// An ACK arrived; `identity` is the identity of the message it
    /// acknowledges.
    fn on_ack(&mut self, identity: [u8; 16]);

    /// The sender's endpoint tuple and published identity, stamped onto
    /// every message acquired into a slot.
    fn remote_endpoint(&self) -> (std::net::IpAddr, u16, [u8; 16]);

    /// The connection handle bytes are currently being read on, stamped
    /// onto delivered messages so `release` can clear back-pressure.
    fn connection_handle(&self) -> usize;

    /// A fully reassembled message is ready for the receive callback.
    fn deliver(&mut self, msg: Message, slot: u32);

    /// The peer violated framing or exceeded limits; shut the
    /// connection down with a protocol error.
    fn protocol_error(&mut self, reason: String);

    /// Stream back-pressure: stop/resume reading from the socket.
    fn set_stopped(&mut self, stopped: bool);
}

/// The reader state machine described in spec §4.3.
pub struct Reader {
    state: State,
    scratch: Vec<u8>,
    header: Option<WireHeader>,
    slot: Option<u32>,
    overflow_header: Option<Vec<u8>>,
    overflow_data: Option<Vec<u8>>,
    header_have: usize,
    data_have: usize,
}

impl Reader {
    pub fn new() -> Self {
        Reader {
            state: State::Start,
            scratch: Vec::with_capacity(WIRE_HEADER_SIZE),
            header: None,
            slot: None,
            overflow_header: None,
            overflow_data: None,
            header_have: 0,
            data_have: 0,
        }
    }

    /// True once the peer's handshake has been consumed and we're
    /// reading message frames.
    pub fn is_established(&self) -> bool {
        !matches!(self.state, State::Start | State::Handshake)
    }

    /// Consume as much of `buf` as the current state allows, driving
    /// the state machine forward. Returns the number of bytes consumed.
    /// Call repeatedly (e.g. once per socket read) feeding unconsumed
    /// bytes back in along with newly arrived ones on the next call —
    /// this is what makes partial reads and "stop because no slot"
    /// resumable: the caller simply re-invokes `read` with the leftover
    /// slice once more bytes (or a freed slot) are available.
    pub fn read(&mut self, sink: &mut dyn ReaderSink, buf: &[u8]) -> usize {
        let mut off = 0;
        loop {
            if self.state == State::Start {
                // START produces no consumption; it is driven once by
                // the connection before any bytes arrive.
                self.state = State::Handshake;
                continue;
            }
            let remaining = &buf[off..];
            if remaining.is_empty() {
                break;
            }
            match self.state {
                State::Start => unreachable!(),
                State::Handshake => {
                    let need = HANDSHAKE_SIZE - self.scratch.len();
                    let take = need.min(remaining.len());
                    self.scratch.extend_from_slice(&remaining[..take]);
                    off += take;
                    if self.scratch.len() < HANDSHAKE_SIZE {
                        break;
                    }
                    let mut arr = [0u8; HANDSHAKE_SIZE];
                    arr.copy_from_slice(&self.scratch);
                    self.scratch.clear();
                    let hs = Handshake::decode(&arr);
                    if let Err(_e) = sink.on_handshake(hs) {
                        break;
                    }
                    self.state = State::Wait;
                }
                State::Wait => {
                    let need = WIRE_HEADER_SIZE - self.scratch.len();
                    let take = need.min(remaining.len());
                    self.scratch.extend_from_slice(&remaining[..take]);
                    off += take;
                    if self.scratch.len() < WIRE_HEADER_SIZE {
                        break;
                    }
                    let mut arr = [0u8; WIRE_HEADER_SIZE];
                    arr.copy_from_slice(&self.scratch);
                    self.scratch.clear();
                    let hdr = WireHeader::decode(&arr);

                    if let Err(reason) = validate_header(&hdr, sink.max_msg_size()) {
                        sink.protocol_error(reason);
                        break;
                    }

                    if hdr.ty & TYPE_NOOP != 0 {
                        sink.on_noop();
                        continue;
                    }
                    if hdr.ty & TYPE_ACK != 0 {
                        sink.on_ack(hdr.identity);
                        continue;
                    }
                    self.header = Some(hdr);
                    self.state = State::Slot;
                }
                State::Slot => {
                    if self.slot.is_none() {
                        match sink.pool().acquire() {
                            Some(idx) => self.slot = Some(idx),
                            None => {
                                sink.set_stopped(true);
                                break;
                            }
                        }
                    }
                    let hdr = self.header.clone().expect("header set before Slot state");
                    let idx = self.slot.unwrap();
                    let (address, port, remote_identity) = sink.remote_endpoint();
                    sink.pool().with_slot(idx, |slot| {
                        slot.msg.identity = hdr.identity;
                        slot.msg.serial = hdr.serial;
                        slot.msg.ty = hdr.ty;
                        slot.msg.address = address;
                        slot.msg.ip_protocol = crate::message::IpProtocol::of(&address);
                        slot.msg.port = port;
                        slot.msg.remote_identity = remote_identity;
                        slot.msg
                            .flags
                            .set(MsgFlags::SEND_ACK, hdr.ty & TYPE_REQ_ACK != 0);
                    });
                    self.header_have = 0;
                    self.data_have = 0;
                    self.overflow_header = None;
                    self.overflow_data = None;
                    if hdr.header_len > 0 {
                        self.state = State::Header;
                    } else if hdr.data_len > 0 {
                        self.state = State::Data;
                    } else {
                        self.deliver_current(sink);
                    }
                }
                State::Header => {
                    let hdr = self.header.unwrap();
                    let total = hdr.header_len as usize;
                    let take = (total - self.header_have).min(remaining.len());
                    self.copy_into_header(sink, &remaining[..take]);
                    self.header_have += take;
                    off += take;
                    if self.header_have < total {
                        break;
                    }
                    if hdr.data_len > 0 {
                        self.state = State::Data;
                    } else {
                        self.deliver_current(sink);
                    }
                }
                State::Data => {
                    let hdr = self.header.unwrap();
                    let total = hdr.data_len as usize;
                    let take = (total - self.data_have).min(remaining.len());
                    self.copy_into_data(sink, &remaining[..take]);
                    self.data_have += take;
                    off += take;
                    if self.data_have < total {
                        break;
                    }
                    self.deliver_current(sink);
                }
            }
        }
        off
    }

    fn copy_into_header(&mut self, sink: &dyn ReaderSink, bytes: &[u8]) {
        let idx = self.slot.unwrap();
        let total = self.header.unwrap().header_len as usize;
        if total <= INLINE_HEADER_SIZE {
            sink.pool().with_slot(idx, |slot| {
                let start = self.header_have;
                slot.inline_header[start..start + bytes.len()].copy_from_slice(bytes);
            });
        } else {
            let buf = self
                .overflow_header
                .get_or_insert_with(|| Vec::with_capacity(total));
            buf.extend_from_slice(bytes);
        }
    }

    fn copy_into_data(&mut self, sink: &dyn ReaderSink, bytes: &[u8]) {
        let idx = self.slot.unwrap();
        let total = self.header.unwrap().data_len as usize;
        if total <= INLINE_DATA_SIZE {
            sink.pool().with_slot(idx, |slot| {
                let start = self.data_have;
                slot.inline_data[start..start + bytes.len()].copy_from_slice(bytes);
            });
        } else {
            let buf = self
                .overflow_data
                .get_or_insert_with(|| Vec::with_capacity(total));
            buf.extend_from_slice(bytes);
        }
    }

    fn deliver_current(&mut self, sink: &mut dyn ReaderSink) {
        let hdr = self.header.take().expect("header set while delivering");
        let idx = self.slot.take().unwrap();
        let header_len = hdr.header_len as usize;
        let data_len = hdr.data_len as usize;
        let overflow_header = self.overflow_header.take();
        let overflow_data = self.overflow_data.take();
        self.header_have = 0;
        self.data_have = 0;

        let mut msg = sink.pool().with_slot(idx, |slot| slot.msg.clone());
        msg.slot = Some(idx);
        msg.flags.insert(MsgFlags::USED);
        msg.pool = Some(sink.pool().clone());
        msg.conn_handle = Some(sink.connection_handle());
        msg.header = match overflow_header {
            Some(v) => {
                msg.flags.insert(MsgFlags::FREE_HEADER);
                v
            }
            None => sink
                .pool()
                .with_slot(idx, |slot| slot.inline_header[..header_len].to_vec()),
        };
        msg.data = match overflow_data {
            Some(v) => {
                msg.flags.insert(MsgFlags::FREE_DATA);
                v
            }
            None => sink
                .pool()
                .with_slot(idx, |slot| slot.inline_data[..data_len].to_vec()),
        };

        sink.pool().bump_refcount();
        self.state = State::Wait;
        sink.deliver(msg, idx);
    }
}

fn validate_header(hdr: &WireHeader, max_msg_size: usize) -> std::result::Result<(), String> {
    let total = hdr.header_len as usize + hdr.data_len as usize;
    if total > max_msg_size {
        return Err(format!(
            "message of {} bytes exceeds max_msg_size {}",
            total, max_msg_size
        ));
    }
    let is_ack_or_noop = hdr.ty & (TYPE_ACK | TYPE_NOOP) != 0;
    if is_ack_or_noop {
        if hdr.header_len != 0 || hdr.data_len != 0 {
            return Err("ACK/NOOP must carry no header or data".into());
        }
        if hdr.ty & TYPE_REQ_ACK != 0 {
            return Err("ACK/NOOP must not set REQ_ACK".into());
        }
    }
    Ok(())
}

impl Default for Reader {
    fn default() -> Self {
        Reader::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    struct TestSink {
        pool: BufferPool,
        delivered: Vec<Message>,
        acks: Vec<[u8; 16]>,
        noops: u32,
        stopped: bool,
        errors: Vec<String>,
        handshakes: Vec<Handshake>,
    }

    impl TestSink {
        fn new(max_slots: u8) -> Self {
            TestSink {
                pool: BufferPool::new(max_slots),
                delivered: Vec::new(),
                acks: Vec::new(),
                noops: 0,
                stopped: false,
                errors: Vec::new(),
                handshakes: Vec::new(),
            }
        }
    }

    impl ReaderSink for TestSink {
        fn pool(&self) -> &BufferPool {
            &self.pool
        }
        fn max_msg_size(&self) -> usize {
            1024 * 1024
        }
        fn local_handshake(&self) -> Handshake {
            Handshake {
                port: 1,
                identity: [0; 16],
            }
        }
        fn on_handshake(&mut self, hs: Handshake) -> Result<()> {
            self.handshakes.push(hs);
            Ok(())
        }
        fn on_noop(&mut self) {
            self.noops += 1;
        }
        fn on_ack(&mut self, identity: [u8; 16]) {
            self.acks.push(identity);
        }
        fn remote_endpoint(&self) -> (IpAddr, u16, [u8; 16]) {
            ("127.0.0.1".parse().unwrap(), 4242, [0xAA; 16])
        }
        fn connection_handle(&self) -> usize {
            0
        }
        fn deliver(&mut self, msg: Message, _slot: u32) {
            self.delivered.push(msg);
        }
        fn protocol_error(&mut self, reason: String) {
            self.errors.push(reason);
        }
        fn set_stopped(&mut self, stopped: bool) {
            self.stopped = stopped;
        }
    }

    fn wire_bytes(hdr: WireHeader, header: &[u8], data: &[u8]) -> Vec<u8> {
        let mut buf = [0u8; WIRE_HEADER_SIZE];
        hdr.encode(&mut buf);
        let mut out = buf.to_vec();
        out.extend_from_slice(header);
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn handshake_then_message_delivers() {
        let mut sink = TestSink::new(4);
        let mut reader = Reader::new();

        let mut hs_buf = [0u8; HANDSHAKE_SIZE];
        Handshake {
            port: 2998,
            identity: [9; 16],
        }
        .encode(&mut hs_buf);

        let hdr = WireHeader {
            identity: [1; 16],
            serial: 1,
            ty: 0,
            header_len: 0,
            data_len: 5,
        };
        let mut bytes = hs_buf.to_vec();
        bytes.extend(wire_bytes(hdr, &[], b"hello"));

        let consumed = reader.read(&mut sink, &bytes);
        assert_eq!(consumed, bytes.len());
        assert_eq!(sink.handshakes.len(), 1);
        assert_eq!(sink.delivered.len(), 1);
        assert_eq!(sink.delivered[0].data, b"hello");
    }

    #[test]
    fn partial_reads_accumulate() {
        let mut sink = TestSink::new(4);
        let mut reader = Reader::new();
        reader.state = State::Wait; // pretend handshake already done

        let hdr = WireHeader {
            identity: [2; 16],
            serial: 1,
            ty: 0,
            header_len: 3,
            data_len: 2,
        };
        let bytes = wire_bytes(hdr, b"abc", b"xy");

        // feed one byte at a time
        let mut total = 0;
        for chunk in bytes.chunks(1) {
            total += reader.read(&mut sink, chunk);
        }
        assert_eq!(total, bytes.len());
        assert_eq!(sink.delivered.len(), 1);
        assert_eq!(sink.delivered[0].header, b"abc");
        assert_eq!(sink.delivered[0].data, b"xy");
    }

    #[test]
    fn pool_exhaustion_stops_stream() {
        let mut sink = TestSink::new(1);
        // pre-acquire the only slot to simulate "held by user"
        let held = sink.pool.acquire().unwrap();

        let mut reader = Reader::new();
        reader.state = State::Wait;
        let hdr = WireHeader {
            identity: [3; 16],
            serial: 1,
            ty: 0,
            header_len: 0,
            data_len: 0,
        };
        let bytes = wire_bytes(hdr, &[], &[]);
        let consumed = reader.read(&mut sink, &bytes);
        assert_eq!(consumed, bytes.len());
        assert!(sink.stopped);
        assert!(sink.delivered.is_empty());

        sink.pool.release(held);
        sink.stopped = false;
        // resuming with the same bytes now succeeds
        let consumed2 = reader.read(&mut sink, &bytes);
        assert_eq!(consumed2, bytes.len());
        assert_eq!(sink.delivered.len(), 1);
    }

    #[test]
    fn oversize_message_is_protocol_error() {
        let mut sink = TestSink::new(4);
        let mut reader = Reader::new();
        reader.state = State::Wait;
        let hdr = WireHeader {
            identity: [4; 16],
            serial: 1,
            ty: 0,
            header_len: 0,
            data_len: 2_000_000,
        };
        let mut buf = [0u8; WIRE_HEADER_SIZE];
        hdr.encode(&mut buf);
        reader.read(&mut sink, &buf);
        assert_eq!(sink.errors.len(), 1);
    }

    #[test]
    fn ack_and_noop_with_payload_rejected() {
        let mut sink = TestSink::new(4);
        let mut reader = Reader::new();
        reader.state = State::Wait;
        let hdr = WireHeader {
            identity: [5; 16],
            serial: 1,
            ty: TYPE_ACK,
            header_len: 1,
            data_len: 0,
        };
        let mut buf = [0u8; WIRE_HEADER_SIZE];
        hdr.encode(&mut buf);
        reader.read(&mut sink, &buf);
        assert_eq!(sink.errors.len(), 1);
    }

    #[test]
    fn noop_refreshes_and_acks_route_to_sink() {
        let mut sink = TestSink::new(4);
        let mut reader = Reader::new();
        reader.state = State::Wait;

        let noop_hdr = WireHeader {
            identity: [0; 16],
            serial: 0,
            ty: TYPE_NOOP,
            header_len: 0,
            data_len: 0,
        };
        let mut buf = [0u8; WIRE_HEADER_SIZE];
        noop_hdr.encode(&mut buf);
        reader.read(&mut sink, &buf);
        assert_eq!(sink.noops, 1);

        let ack_hdr = WireHeader {
            identity: [7; 16],
            serial: 0,
            ty: TYPE_ACK,
            header_len: 0,
            data_len: 0,
        };
        ack_hdr.encode(&mut buf);
        reader.read(&mut sink, &buf);
        assert_eq!(sink.acks, vec![[7u8; 16]]);
    }
}
