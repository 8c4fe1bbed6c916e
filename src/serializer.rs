//! Fixed-layout encode/decode of the handshake and wire-message headers.
//!
//! These sizes are protocol-defining: 18 bytes for the handshake, 27
//! bytes for the wire message header, both in network byte order with
//! no alignment padding. Encoders and decoders operate on caller
//! supplied buffers of exactly these sizes and never allocate.

use byteorder::{BigEndian, ByteOrder};

pub const HANDSHAKE_SIZE: usize = 18;
pub const WIRE_HEADER_SIZE: usize = 27;

/// The 18-byte handshake: `port:u16 | identity:16B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub port: u16,
    pub identity: [u8; 16],
}

impl Handshake {
    pub fn encode(&self, buf: &mut [u8; HANDSHAKE_SIZE]) {
        BigEndian::write_u16(&mut buf[0..2], self.port);
        buf[2..18].copy_from_slice(&self.identity);
    }

    pub fn decode(buf: &[u8; HANDSHAKE_SIZE]) -> Handshake {
        let port = BigEndian::read_u16(&buf[0..2]);
        let mut identity = [0u8; 16];
        identity.copy_from_slice(&buf[2..18]);
        Handshake { port, identity }
    }
}

/// The 27-byte wire message header:
/// `identity:16B | serial:u32 | type:u8 | header_len:u16 | data_len:u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub identity: [u8; 16],
    pub serial: u32,
    pub ty: u8,
    pub header_len: u16,
    pub data_len: u32,
}

impl WireHeader {
    pub fn encode(&self, buf: &mut [u8; WIRE_HEADER_SIZE]) {
        buf[0..16].copy_from_slice(&self.identity);
        BigEndian::write_u32(&mut buf[16..20], self.serial);
        buf[20] = self.ty;
        BigEndian::write_u16(&mut buf[21..23], self.header_len);
        BigEndian::write_u32(&mut buf[23..27], self.data_len);
    }

    pub fn decode(buf: &[u8; WIRE_HEADER_SIZE]) -> WireHeader {
        let mut identity = [0u8; 16];
        identity.copy_from_slice(&buf[0..16]);
        let serial = BigEndian::read_u32(&buf[16..20]);
        let ty = buf[20];
        let header_len = BigEndian::read_u16(&buf[21..23]);
        let data_len = BigEndian::read_u32(&buf[23..27]);
        WireHeader {
            identity,
            serial,
            ty,
            header_len,
            data_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trip() {
        let hs = Handshake {
            port: 2998,
            identity: [7u8; 16],
        };
        let mut buf = [0u8; HANDSHAKE_SIZE];
        hs.encode(&mut buf);
        assert_eq!(Handshake::decode(&buf), hs);
    }

    #[test]
    fn handshake_byte_layout_has_no_padding() {
        let hs = Handshake {
            port: 0x1234,
            identity: [0xAB; 16],
        };
        let mut buf = [0u8; HANDSHAKE_SIZE];
        hs.encode(&mut buf);
        assert_eq!(&buf[0..2], &[0x12, 0x34]);
        assert_eq!(&buf[2..18], &[0xAB; 16][..]);
    }

    #[test]
    fn wire_header_round_trip() {
        let hdr = WireHeader {
            identity: [1u8; 16],
            serial: 0xdead_beef,
            ty: crate::message::TYPE_REQ_ACK,
            header_len: 12,
            data_len: 4096,
        };
        let mut buf = [0u8; WIRE_HEADER_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(WireHeader::decode(&buf), hdr);
    }

    #[test]
    fn wire_header_field_order_matches_wire_layout() {
        let hdr = WireHeader {
            identity: [0u8; 16],
            serial: 1,
            ty: 0xFF,
            header_len: 0x0102,
            data_len: 0x03040506,
        };
        let mut buf = [0u8; WIRE_HEADER_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(buf[20], 0xFF);
        assert_eq!(&buf[21..23], &[0x01, 0x02]);
        assert_eq!(&buf[23..27], &[0x03, 0x04, 0x05, 0x06]);
    }
}
