use std::net::IpAddr;

use crate::error::ChirpError;

/// Bit 0 of the wire `type` field: sender requests an ACK.
pub const TYPE_REQ_ACK: u8 = 1 << 0;
/// Bit 1: this message is an ACK.
pub const TYPE_ACK: u8 = 1 << 1;
/// Bit 2: this message is a liveness NOOP.
pub const TYPE_NOOP: u8 = 1 << 2;

bitflags::bitflags! {
    /// Internal bookkeeping flags carried alongside a [`Message`], never
    /// placed on the wire.
    pub struct MsgFlags: u16 {
        const USED         = 1 << 0;
        const ACK_RECEIVED = 1 << 1;
        const WRITE_DONE   = 1 << 2;
        const FREE_HEADER  = 1 << 3;
        const FREE_DATA    = 1 << 4;
        const HAS_SLOT     = 1 << 5;
        const SEND_ACK     = 1 << 6;
    }
}

/// Which IP family a [`Message`]/[`Remote`](crate::remote::Remote) endpoint
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    V4,
    V6,
}

impl IpProtocol {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpProtocol::V4,
            IpAddr::V6(_) => IpProtocol::V6,
        }
    }
}

/// The endpoint tuple a [`Remote`](crate::remote::Remote) is keyed by:
/// `(ip_protocol, address, port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub ip_protocol: IpProtocol,
    pub address: IpAddr,
    pub port: u16,
}

impl EndpointKey {
    pub fn new(address: IpAddr, port: u16) -> Self {
        EndpointKey {
            ip_protocol: IpProtocol::of(&address),
            address,
            port,
        }
    }
}

/// Outcome delivered to a send callback, or to the library user on
/// message delivery.
pub type SendResult = std::result::Result<(), ChirpError>;

/// The user-visible message envelope described by the wire protocol.
///
/// `identity` is preserved verbatim across replies; `serial` is assigned
/// by the [`Writer`](crate::writer::Writer) strictly before the first
/// byte leaves the wire.
#[derive(Debug, Clone)]
pub struct Message {
    pub identity: [u8; 16],
    pub serial: u32,
    pub ty: u8,
    pub header: Vec<u8>,
    pub data: Vec<u8>,
    pub ip_protocol: IpProtocol,
    pub address: IpAddr,
    pub port: u16,
    pub remote_identity: [u8; 16],
    pub(crate) flags: MsgFlags,
    pub(crate) slot: Option<u32>,
    /// Correlates a queued/in-flight message back to the send callback
    /// registered for it. Never placed on the wire; unrelated to
    /// `identity`, which is user data and not guaranteed unique across
    /// remotes.
    pub(crate) callback_id: Option<u64>,
    /// The pool this slot was acquired from, held directly so release
    /// works even after the owning Connection has been torn down (spec
    /// §4.2: the pool outlives the Connection while a slot is held).
    pub(crate) pool: Option<crate::buffer_pool::BufferPool>,
    /// The connection the slot was acquired on, used only to clear its
    /// back-pressure `STOPPED` flag on release, if it still exists.
    pub(crate) conn_handle: Option<usize>,
}

impl Message {
    /// A blank outbound message, ready to have its identity/header/data
    /// filled in by the caller before a `send`.
    pub fn new(address: IpAddr, port: u16) -> Self {
        Message {
            identity: [0; 16],
            serial: 0,
            ty: 0,
            header: Vec::new(),
            data: Vec::new(),
            ip_protocol: IpProtocol::of(&address),
            address,
            port,
            remote_identity: [0; 16],
            flags: MsgFlags::empty(),
            slot: None,
            callback_id: None,
            pool: None,
            conn_handle: None,
        }
    }

    pub fn endpoint(&self) -> EndpointKey {
        EndpointKey {
            ip_protocol: self.ip_protocol,
            address: self.address,
            port: self.port,
        }
    }

    pub fn header_len(&self) -> u16 {
        self.header.len() as u16
    }

    pub fn data_len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn set_req_ack(&mut self, on: bool) {
        if on {
            self.ty |= TYPE_REQ_ACK;
        } else {
            self.ty &= !TYPE_REQ_ACK;
        }
    }

    pub fn req_ack(&self) -> bool {
        self.ty & TYPE_REQ_ACK != 0
    }

    pub fn is_ack(&self) -> bool {
        self.ty & TYPE_ACK != 0
    }

    pub fn is_noop(&self) -> bool {
        self.ty & TYPE_NOOP != 0
    }

    pub fn slot_index(&self) -> Option<u32> {
        self.slot
    }

    pub fn flags_contains_send_ack(&self) -> bool {
        self.flags.contains(MsgFlags::SEND_ACK)
    }

    pub fn make_ack_for(&self) -> Message {
        let mut ack = Message::new(self.address, self.port);
        ack.identity = self.identity;
        ack.remote_identity = self.remote_identity;
        ack.ty = TYPE_ACK;
        ack
    }
}

/// A callback fired exactly once with the outcome of a `send`.
pub type SendCallback = Box<dyn FnOnce(SendResult) + Send + 'static>;

/// A callback fired for every fully reassembled inbound message.
/// `Chirp` is single-threaded (`!Send`), so unlike `SendCallback` this
/// carries no `Send` bound.
pub type RecvCallback = Box<dyn FnMut(Message) + 'static>;
