//! Wire framing: the 20-byte transport header prepended to every frame and
//! the payload layouts of the built-in administration frames.
//!
//! All integers are little-endian on the wire. Headers are decoded and
//! encoded field by field; frames are never overlaid onto structs.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::Write;

/// Start-of-frame sentinel.
pub const COOKIE: u32 = 0xA55A_5AA5;

/// Size of the transport header on the wire.
pub const HEADER_SIZE: usize = 20;

/// Default TCP port of the gateway.
pub const DEFAULT_PORT: u16 = 50111;

/// Transport data types.
pub const DT_QUERY_SERVER: u16 = 0x0000;
pub const DT_MARSHAL: u16 = 0x0200;
pub const DT_ACKNOWLEDGE: u16 = 0x8000;
pub const DT_KEEP_ALIVE: u16 = 0xFFFF;

/// Transaction ids with this bit set were generated by the device side.
pub const TRANSACTION_DEVICE: u16 = 0x8000;

/// Result codes carried in the `state` byte of replies and acknowledges.
pub mod state {
    pub const OK: u8 = 0x00;
    pub const CHECKSUM_ERROR: u8 = 0x10;
    pub const LENGTH_INCOMPLETE: u8 = 0x11;
    pub const DATA_TYPE_UNKNOWN: u8 = 0x12;
    pub const DEVICE_UNKNOWN: u8 = 0x13;
    pub const CHANNEL_UNKNOWN: u8 = 0x14;
    pub const SEQUENCE_ERROR: u8 = 0x15;
    pub const BUFFER_OVERFLOW: u8 = 0x16;
    pub const RESOURCE_ERROR: u8 = 0x17;
    pub const KEEP_ALIVE_ERROR: u8 = 0x20;
}

/// Feature bits advertised in the QueryServer reply.
pub const FEATURE_KEEP_ALIVE: u32 = 0x0000_0001;
pub const FEATURE_NXAPI: u32 = 0x0000_0002;
pub const FEATURE_PERMANENT_CONNECTION: u32 = 0x8000_0000;

/// Length of the server name field in the QueryServer reply.
pub const SERVER_NAME_LEN: usize = 32;

/// A keep-alive frame carries a single 32-bit ComID.
pub const KEEP_ALIVE_PAYLOAD_SIZE: usize = 4;

/// Advisory keep-alive timeouts in milliseconds.
pub const KEEP_ALIVE_CLIENT_TIMEOUT: u32 = 500;
pub const KEEP_ALIVE_SERVER_TIMEOUT: u32 = 2000;

/// Transport header preceding every frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub cookie: u32,
    /// Payload length in bytes, excluding the header itself.
    pub length: u32,
    /// CRC-16 over the payload, 0 = no checksum.
    pub checksum: u16,
    pub data_type: u16,
    pub device: u8,
    pub channel: u8,
    /// Increased with every frame the originator transmits.
    pub sequence_nr: u8,
    /// Result code on replies, 0 on requests.
    pub state: u8,
    pub transaction: u16,
    pub reserved: u16,
}

impl TransportHeader {
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> TransportHeader {
        TransportHeader {
            cookie: LittleEndian::read_u32(&raw[0..4]),
            length: LittleEndian::read_u32(&raw[4..8]),
            checksum: LittleEndian::read_u16(&raw[8..10]),
            data_type: LittleEndian::read_u16(&raw[10..12]),
            device: raw[12],
            channel: raw[13],
            sequence_nr: raw[14],
            state: raw[15],
            transaction: LittleEndian::read_u16(&raw[16..18]),
            reserved: LittleEndian::read_u16(&raw[18..20]),
        }
    }

    pub fn encode(&self, out: &mut [u8; HEADER_SIZE]) {
        LittleEndian::write_u32(&mut out[0..4], self.cookie);
        LittleEndian::write_u32(&mut out[4..8], self.length);
        LittleEndian::write_u16(&mut out[8..10], self.checksum);
        LittleEndian::write_u16(&mut out[10..12], self.data_type);
        out[12] = self.device;
        out[13] = self.channel;
        out[14] = self.sequence_nr;
        out[15] = self.state;
        LittleEndian::write_u16(&mut out[16..18], self.transaction);
        LittleEndian::write_u16(&mut out[18..20], self.reserved);
    }
}

/// Payload of the QueryServer reply (data type 0x0000).
#[derive(Debug, Clone)]
pub struct QueryServerReply {
    pub server_name: String,
    pub version: [u32; 4],
    pub features: u32,
    /// Number of parallel services, i.e. Rx buffers of the connector.
    pub parallel_services: u32,
    /// Capacity of a single Rx buffer.
    pub buffer_size: u32,
    /// Registered data types; the keep-alive type is appended by `encode`.
    pub data_types: Vec<u16>,
}

impl QueryServerReply {
    pub const STRUCT_VERSION: u32 = 1;

    /// Encoded size in bytes, including the appended keep-alive type.
    pub fn encoded_len(&self) -> usize {
        4 + SERVER_NAME_LEN + 16 + 4 + 4 + 4 + 4 + (self.data_types.len() + 1) * 2
    }

    /// Write the reply payload. Returns the number of bytes written.
    pub fn encode(&self, out: &mut [u8]) -> usize {
        let total = self.encoded_len();
        let mut cursor = &mut out[..total];

        cursor.write_u32::<LittleEndian>(Self::STRUCT_VERSION).unwrap();

        let mut name = [0u8; SERVER_NAME_LEN];
        let bytes = self.server_name.as_bytes();
        let count = bytes.len().min(SERVER_NAME_LEN - 1);
        name[..count].copy_from_slice(&bytes[..count]);
        cursor.write_all(&name).unwrap();

        for &word in &self.version {
            cursor.write_u32::<LittleEndian>(word).unwrap();
        }

        cursor.write_u32::<LittleEndian>(self.features).unwrap();
        cursor.write_u32::<LittleEndian>(self.parallel_services).unwrap();
        cursor.write_u32::<LittleEndian>(self.buffer_size).unwrap();
        cursor
            .write_u32::<LittleEndian>(self.data_types.len() as u32 + 1)
            .unwrap();

        for &data_type in &self.data_types {
            cursor.write_u16::<LittleEndian>(data_type).unwrap();
        }
        cursor.write_u16::<LittleEndian>(DT_KEEP_ALIVE).unwrap();

        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> TransportHeader {
        TransportHeader {
            cookie: COOKIE,
            length: 24,
            checksum: 0xBEEF,
            data_type: DT_MARSHAL,
            device: 1,
            channel: 2,
            sequence_nr: 3,
            state: 0,
            transaction: 0x1234,
            reserved: 0,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let mut raw = [0u8; HEADER_SIZE];

        header.encode(&mut raw);

        assert_eq!(TransportHeader::decode(&raw), header);
    }

    #[test]
    fn test_header_wire_layout() {
        let header = sample_header();
        let mut raw = [0u8; HEADER_SIZE];

        header.encode(&mut raw);

        assert_eq!(&raw[0..4], &[0xA5, 0x5A, 0x5A, 0xA5]);
        assert_eq!(&raw[4..8], &[24, 0, 0, 0]);
        assert_eq!(&raw[8..10], &[0xEF, 0xBE]);
        assert_eq!(&raw[10..12], &[0x00, 0x02]);
        assert_eq!(raw[12], 1);
        assert_eq!(raw[13], 2);
        assert_eq!(raw[14], 3);
        assert_eq!(raw[15], 0);
        assert_eq!(&raw[16..18], &[0x34, 0x12]);
        assert_eq!(&raw[18..20], &[0x00, 0x00]);
    }

    #[test]
    fn test_query_server_layout() {
        let reply = QueryServerReply {
            server_name: "gateway".into(),
            version: [2, 4, 0, 1],
            features: FEATURE_KEEP_ALIVE,
            parallel_services: 8,
            buffer_size: 6144,
            data_types: vec![DT_MARSHAL],
        };

        let mut out = [0u8; 128];
        let count = reply.encode(&mut out);

        assert_eq!(count, reply.encoded_len());
        assert_eq!(count, 4 + 32 + 16 + 4 + 4 + 4 + 4 + 4);

        assert_eq!(LittleEndian::read_u32(&out[0..4]), 1);
        assert_eq!(&out[4..11], b"gateway");
        assert_eq!(out[11], 0);
        assert_eq!(LittleEndian::read_u32(&out[36..40]), 2);
        assert_eq!(LittleEndian::read_u32(&out[52..56]), FEATURE_KEEP_ALIVE);
        assert_eq!(LittleEndian::read_u32(&out[56..60]), 8);
        assert_eq!(LittleEndian::read_u32(&out[60..64]), 6144);
        assert_eq!(LittleEndian::read_u32(&out[64..68]), 2);
        assert_eq!(LittleEndian::read_u16(&out[68..70]), DT_MARSHAL);
        assert_eq!(LittleEndian::read_u16(&out[70..72]), DT_KEEP_ALIVE);
    }
}
