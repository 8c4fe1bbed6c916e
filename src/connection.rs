//! A single TCP stream, optionally TLS-wrapped, with its reader,
//! writer, buffers, and lifecycle flags.
//!
//! Ownership follows the Design Notes §9 redesign: `Connection` does
//! not hold a pointer back to its `Remote`. It stores the `Remote`'s
//! endpoint key; the `Remote` stores this connection's
//! [`ConnectionHandle`] (a slab key owned by
//! [`crate::protocol::ProtocolState`]). Both pools live on `Protocol`.

use std::net::IpAddr;
use std::time::Instant;

use bitflags::bitflags;

use crate::buffer_pool::BufferPool;
use crate::message::{EndpointKey, IpProtocol, Message, TYPE_ACK};
use crate::reader::Reader;
use crate::transport::Transport;
use crate::writer::{WriteBuffers, Writer};

bitflags! {
    /// Lifecycle bits tracked per `Connection`. There is no separate
    /// init-progress bitmask: `Connection::new` either returns a fully
    /// constructed value or, via `?`, unwinds through ordinary `Drop`
    /// on whatever fields it already built, so nothing here tracks
    /// partial construction.
    pub struct ConnFlags: u32 {
        const CONNECTED       = 1 << 0;
        const SHUTTING_DOWN   = 1 << 1;
        const WRITE_PENDING   = 1 << 2;
        const TLS_HANDSHAKE   = 1 << 3;
        const ENCRYPTED       = 1 << 4;
        const STOPPED         = 1 << 5;
        const INCOMING        = 1 << 6;
        /// Superseded by a newer authoritative connection for the same
        /// Remote; draining until `REUSE_TIME` GC reaps it.
        const OLD             = 1 << 7;
        /// Shut down as part of deleting its Remote; the close path
        /// must free the Remote once every handle has closed.
        const DELETE_REMOTE   = 1 << 8;
    }
}

/// A slab key into `ProtocolState::connections`. Not separately
/// generation-stamped: `slab::Slab` never reuses a key while the old
/// occupant is still present, and `Remote::conn` is always cleared
/// before a slot is vacated, so a stale handle is simply absent from
/// the slab rather than aliasing a newer connection.
pub type ConnectionHandle = usize;

/// The TCP stream is taken out of the struct for the duration of an
/// `.await` (reading/writing/handshaking) and put back afterwards,
/// since [`crate::protocol::ProtocolState`] is borrowed through a
/// `RefCell` and no borrow may live across an await point.
pub struct ConnTransport(Option<Transport>);

impl ConnTransport {
    pub fn new(t: Transport) -> Self {
        ConnTransport(Some(t))
    }

    pub fn take(&mut self) -> Transport {
        self.0.take().expect("transport taken twice")
    }

    pub fn put_back(&mut self, t: Transport) {
        self.0 = Some(t);
    }

    pub fn peek(&self) -> &Transport {
        self.0.as_ref().expect("transport currently checked out")
    }
}

pub struct Connection {
    pub handle: ConnectionHandle,
    pub transport: ConnTransport,
    pub ip_protocol: IpProtocol,
    pub address: IpAddr,
    pub port: u16,
    pub remote_port: u16,
    pub remote_identity: [u8; 16],
    /// Set once the handshake completes and this connection is
    /// associated with a `Remote`.
    pub remote_key: Option<EndpointKey>,
    pub reader: Reader,
    pub writer: Writer,
    pub flags: ConnFlags,
    pub pool: BufferPool,
    /// Ack path for inbound messages: bumped as ACKs are sent so a
    /// stale/duplicate ACK from a superseded connection is ignored.
    pub release_serial: u32,
    pub ack_message: Message,
    pub last_activity: Instant,
    pub incoming: bool,
    /// Buffers from the most recent `Writer::begin`, waiting to be
    /// handed to the transport by the connection's I/O task.
    pub pending_write: Option<WriteBuffers>,
}

impl Connection {
    pub fn new(
        handle: ConnectionHandle,
        transport: Transport,
        address: IpAddr,
        port: u16,
        max_slots: u8,
        incoming: bool,
    ) -> Connection {
        let mut ack_message = Message::new(address, port);
        ack_message.ty = TYPE_ACK;
        Connection {
            handle,
            transport: ConnTransport::new(transport),
            ip_protocol: IpProtocol::of(&address),
            address,
            port,
            remote_port: 0,
            remote_identity: [0; 16],
            remote_key: None,
            reader: Reader::new(),
            writer: Writer::new(),
            flags: if incoming {
                ConnFlags::INCOMING
            } else {
                ConnFlags::empty()
            },
            pool: BufferPool::new(max_slots),
            release_serial: 0,
            ack_message,
            last_activity: Instant::now(),
            incoming,
            pending_write: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_authoritative_candidate(&self) -> bool {
        !self.flags.intersects(ConnFlags::OLD | ConnFlags::SHUTTING_DOWN)
    }
}
