//! Device structures and mailbox packets as they appear in method payloads.
//!
//! The payload of a marshalled call carries the device structures in their
//! native little-endian layout, including the alignment padding the device
//! firmware uses. Encoding and decoding is done field by field.

use crate::status::{ApiError, ApiResult};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::Write;

/// Length of board name and alias fields.
pub const NAME_LEN: usize = 16;

/// Length of the firmware name field in the channel information.
pub const FIRMWARE_NAME_LEN: usize = 63;

/// Header of the marshalled call itself; follows the transport header in
/// every marshaller frame.
pub const MARSHAL_HEADER_SIZE: usize = 20;

/// Request/answer flag in the marshal sequence word.
pub const SEQ_REQUEST: u32 = 0x0000_0001;
/// Peer supports sequence numbering.
pub const SEQ_SUPPORTED: u32 = 0x0000_0002;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MarshalHeader {
    pub handle: u32,
    pub method_id: u32,
    pub sequence: u32,
    pub error: u32,
    pub data_size: u32,
}

impl MarshalHeader {
    pub fn decode(raw: &[u8]) -> MarshalHeader {
        MarshalHeader {
            handle: LittleEndian::read_u32(&raw[0..4]),
            method_id: LittleEndian::read_u32(&raw[4..8]),
            sequence: LittleEndian::read_u32(&raw[8..12]),
            error: LittleEndian::read_u32(&raw[12..16]),
            data_size: LittleEndian::read_u32(&raw[16..20]),
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        LittleEndian::write_u32(&mut out[0..4], self.handle);
        LittleEndian::write_u32(&mut out[4..8], self.method_id);
        LittleEndian::write_u32(&mut out[8..12], self.sequence);
        LittleEndian::write_u32(&mut out[12..16], self.error);
        LittleEndian::write_u32(&mut out[16..20], self.data_size);
    }
}

/// Write `value` as a NUL-padded fixed-size string field.
pub fn write_fixed_str(out: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let count = bytes.len().min(out.len().saturating_sub(1));
    out[..count].copy_from_slice(&bytes[..count]);
    for byte in &mut out[count..] {
        *byte = 0;
    }
}

/// Read a NUL-terminated string out of a fixed-size field.
pub fn read_fixed_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Driver information returned by `xDriverGetInformation`.
#[derive(Debug, Clone, Default)]
pub struct DriverInformation {
    pub version: String,
    pub board_count: u32,
}

impl DriverInformation {
    pub const SIZE: usize = 32 + 4;

    pub fn encode(&self, out: &mut [u8]) {
        write_fixed_str(&mut out[0..32], &self.version);
        LittleEndian::write_u32(&mut out[32..36], self.board_count);
    }
}

/// Static production data of a device.
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    pub cookie: [u8; 4],
    pub dpm_total_size: u32,
    pub device_number: u32,
    pub serial_number: u32,
    pub hw_options: [u16; 4],
    pub manufacturer: u16,
    pub production_date: u16,
    pub license_flags1: u32,
    pub license_flags2: u32,
    pub license_id: u16,
    pub license_flags: u16,
    pub device_class: u16,
    pub hw_revision: u8,
    pub hw_compatibility: u8,
    pub reserved: u32,
}

impl SystemInfo {
    pub const SIZE: usize = 48;

    pub fn encode(&self, out: &mut [u8]) {
        let mut cursor = &mut out[..Self::SIZE];
        cursor.write_all(&self.cookie).unwrap();
        cursor.write_u32::<LittleEndian>(self.dpm_total_size).unwrap();
        cursor.write_u32::<LittleEndian>(self.device_number).unwrap();
        cursor.write_u32::<LittleEndian>(self.serial_number).unwrap();
        for &option in &self.hw_options {
            cursor.write_u16::<LittleEndian>(option).unwrap();
        }
        cursor.write_u16::<LittleEndian>(self.manufacturer).unwrap();
        cursor.write_u16::<LittleEndian>(self.production_date).unwrap();
        cursor.write_u32::<LittleEndian>(self.license_flags1).unwrap();
        cursor.write_u32::<LittleEndian>(self.license_flags2).unwrap();
        cursor.write_u16::<LittleEndian>(self.license_id).unwrap();
        cursor.write_u16::<LittleEndian>(self.license_flags).unwrap();
        cursor.write_u16::<LittleEndian>(self.device_class).unwrap();
        cursor.write_u8(self.hw_revision).unwrap();
        cursor.write_u8(self.hw_compatibility).unwrap();
        cursor.write_u32::<LittleEndian>(self.reserved).unwrap();
    }
}

/// Board information returned by `xDriverEnumBoards`.
#[derive(Debug, Clone, Default)]
pub struct BoardInformation {
    pub board_error: i32,
    pub name: String,
    pub alias: String,
    pub board_id: u32,
    pub system_error: u32,
    pub physical_address: u32,
    pub irq_number: u32,
    pub irq_enabled: u8,
    pub channel_count: u32,
    pub dpm_total_size: u32,
    pub system_info: SystemInfo,
}

impl BoardInformation {
    /// Encoded size including the padding behind the irq flag.
    pub const SIZE: usize = 4 + NAME_LEN * 2 + 4 * 4 + 1 + 3 + 4 * 2 + SystemInfo::SIZE;

    pub fn encode(&self, out: &mut [u8]) {
        LittleEndian::write_i32(&mut out[0..4], self.board_error);
        write_fixed_str(&mut out[4..20], &self.name);
        write_fixed_str(&mut out[20..36], &self.alias);
        LittleEndian::write_u32(&mut out[36..40], self.board_id);
        LittleEndian::write_u32(&mut out[40..44], self.system_error);
        LittleEndian::write_u32(&mut out[44..48], self.physical_address);
        LittleEndian::write_u32(&mut out[48..52], self.irq_number);
        out[52] = self.irq_enabled;
        out[53..56].copy_from_slice(&[0; 3]);
        LittleEndian::write_u32(&mut out[56..60], self.channel_count);
        LittleEndian::write_u32(&mut out[60..64], self.dpm_total_size);
        self.system_info.encode(&mut out[64..64 + SystemInfo::SIZE]);
    }
}

/// Channel information returned by `xDriverEnumChannels` and `xChannelInfo`.
#[derive(Debug, Clone, Default)]
pub struct ChannelInformation {
    pub board_name: String,
    pub board_alias: String,
    pub device_number: u32,
    pub serial_number: u32,
    pub fw_major: u16,
    pub fw_minor: u16,
    pub fw_build: u16,
    pub fw_revision: u16,
    pub fw_name_length: u8,
    pub fw_name: String,
    pub fw_year: u16,
    pub fw_month: u8,
    pub fw_day: u8,
    pub channel_error: u32,
    pub open_count: u32,
    pub put_packet_count: u32,
    pub get_packet_count: u32,
    pub mailbox_size: u32,
    pub io_in_area_count: u32,
    pub io_out_area_count: u32,
    pub hsk_size: u32,
    pub netx_flags: u32,
    pub host_flags: u32,
}

impl ChannelInformation {
    pub const SIZE: usize = NAME_LEN * 2 + 4 * 2 + 2 * 4 + 1 + FIRMWARE_NAME_LEN + 2 + 1 + 1 + 4 * 10;

    pub fn encode(&self, out: &mut [u8]) {
        write_fixed_str(&mut out[0..16], &self.board_name);
        write_fixed_str(&mut out[16..32], &self.board_alias);
        LittleEndian::write_u32(&mut out[32..36], self.device_number);
        LittleEndian::write_u32(&mut out[36..40], self.serial_number);
        LittleEndian::write_u16(&mut out[40..42], self.fw_major);
        LittleEndian::write_u16(&mut out[42..44], self.fw_minor);
        LittleEndian::write_u16(&mut out[44..46], self.fw_build);
        LittleEndian::write_u16(&mut out[46..48], self.fw_revision);
        out[48] = self.fw_name_length;
        write_fixed_str(&mut out[49..49 + FIRMWARE_NAME_LEN], &self.fw_name);
        LittleEndian::write_u16(&mut out[112..114], self.fw_year);
        out[114] = self.fw_month;
        out[115] = self.fw_day;
        LittleEndian::write_u32(&mut out[116..120], self.channel_error);
        LittleEndian::write_u32(&mut out[120..124], self.open_count);
        LittleEndian::write_u32(&mut out[124..128], self.put_packet_count);
        LittleEndian::write_u32(&mut out[128..132], self.get_packet_count);
        LittleEndian::write_u32(&mut out[132..136], self.mailbox_size);
        LittleEndian::write_u32(&mut out[136..140], self.io_in_area_count);
        LittleEndian::write_u32(&mut out[140..144], self.io_out_area_count);
        LittleEndian::write_u32(&mut out[144..148], self.hsk_size);
        LittleEndian::write_u32(&mut out[148..152], self.netx_flags);
        LittleEndian::write_u32(&mut out[152..156], self.host_flags);
    }
}

/// Size of the mailbox packet header.
pub const PACKET_HEADER_SIZE: usize = 40;

/// Header of a mailbox packet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub dest: u32,
    pub src: u32,
    pub dest_id: u32,
    pub src_id: u32,
    /// Length of the data part behind the header.
    pub len: u32,
    pub id: u32,
    pub state: u32,
    pub cmd: u32,
    pub ext: u32,
    pub rout: u32,
}

/// A mailbox packet: fixed header plus `len` data bytes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub data: Vec<u8>,
}

impl Packet {
    /// Parse a packet from its wire form. The declared data length must fit
    /// into the supplied bytes.
    pub fn decode(raw: &[u8]) -> ApiResult<Packet> {
        if raw.len() < PACKET_HEADER_SIZE {
            return Err(ApiError::INVALID_PARAMETER);
        }

        let header = PacketHeader {
            dest: LittleEndian::read_u32(&raw[0..4]),
            src: LittleEndian::read_u32(&raw[4..8]),
            dest_id: LittleEndian::read_u32(&raw[8..12]),
            src_id: LittleEndian::read_u32(&raw[12..16]),
            len: LittleEndian::read_u32(&raw[16..20]),
            id: LittleEndian::read_u32(&raw[20..24]),
            state: LittleEndian::read_u32(&raw[24..28]),
            cmd: LittleEndian::read_u32(&raw[28..32]),
            ext: LittleEndian::read_u32(&raw[32..36]),
            rout: LittleEndian::read_u32(&raw[36..40]),
        };

        let len = header.len as usize;
        if raw.len() < PACKET_HEADER_SIZE + len {
            return Err(ApiError::INVALID_PARAMETER);
        }

        Ok(Packet {
            header,
            data: raw[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + len].to_vec(),
        })
    }

    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.data.len()
    }

    /// Write the packet; `header.len` is taken from the data length.
    pub fn encode(&self, out: &mut [u8]) -> usize {
        LittleEndian::write_u32(&mut out[0..4], self.header.dest);
        LittleEndian::write_u32(&mut out[4..8], self.header.src);
        LittleEndian::write_u32(&mut out[8..12], self.header.dest_id);
        LittleEndian::write_u32(&mut out[12..16], self.header.src_id);
        LittleEndian::write_u32(&mut out[16..20], self.data.len() as u32);
        LittleEndian::write_u32(&mut out[20..24], self.header.id);
        LittleEndian::write_u32(&mut out[24..28], self.header.state);
        LittleEndian::write_u32(&mut out[28..32], self.header.cmd);
        LittleEndian::write_u32(&mut out[32..36], self.header.ext);
        LittleEndian::write_u32(&mut out[36..40], self.header.rout);
        out[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + self.data.len()]
            .copy_from_slice(&self.data);

        self.encoded_len()
    }
}

/// Mailbox command and sequencing constants used by the download hook.
pub mod mailbox {
    /// Answer bit ORed into the command of confirmation packets.
    pub const MSK_ANSWER: u32 = 0x0000_0001;

    /// Destination of system mailbox packets.
    pub const DEST_SYSTEM: u32 = 0;

    pub const FILE_DOWNLOAD_REQ: u32 = 0x0000_1E62;
    pub const FILE_DOWNLOAD_CNF: u32 = 0x0000_1E63;
    pub const FILE_DOWNLOAD_DATA_REQ: u32 = 0x0000_1E64;
    pub const FILE_DOWNLOAD_DATA_CNF: u32 = 0x0000_1E65;
    pub const FILE_DOWNLOAD_ABORT_REQ: u32 = 0x0000_1E66;
    pub const FILE_DOWNLOAD_ABORT_CNF: u32 = 0x0000_1E67;

    /// Sequencing bits in the `ext` word of data packets.
    pub const SEQ_NONE: u32 = 0x00;
    pub const SEQ_LAST: u32 = 0x40;
    pub const SEQ_FIRST: u32 = 0x80;
    pub const SEQ_MIDDLE: u32 = 0xC0;
    pub const SEQ_MASK: u32 = 0xC0;
}

/// Directory entry used by the file enumeration calls. On the wire the
/// entry is a 36-byte record: list handle, 16-byte name, type byte, three
/// pad bytes, file size, callback and user words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub list_handle: u32,
    pub name: String,
    pub file_type: u8,
    pub file_size: u32,
}

impl DirectoryEntry {
    pub const SIZE: usize = 4 + NAME_LEN + 1 + 3 + 4 + 4 + 4;

    pub fn decode(raw: &[u8]) -> ApiResult<DirectoryEntry> {
        if raw.len() < Self::SIZE {
            return Err(ApiError::INVALID_PARAMETER);
        }

        Ok(DirectoryEntry {
            list_handle: LittleEndian::read_u32(&raw[0..4]),
            name: read_fixed_str(&raw[4..20]),
            file_type: raw[20],
            file_size: LittleEndian::read_u32(&raw[24..28]),
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        LittleEndian::write_u32(&mut out[0..4], self.list_handle);
        write_fixed_str(&mut out[4..20], &self.name);
        out[20] = self.file_type;
        out[21..24].copy_from_slice(&[0; 3]);
        LittleEndian::write_u32(&mut out[24..28], self.file_size);
        LittleEndian::write_u32(&mut out[28..32], 0);
        LittleEndian::write_u32(&mut out[32..36], 0);
    }
}

/// Block access commands shared by the control/status block methods.
pub const CMD_READ_DATA: u32 = 1;
pub const CMD_WRITE_DATA: u32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_header_roundtrip() {
        let header = MarshalHeader {
            handle: 0x8000_0001,
            method_id: 8,
            sequence: SEQ_REQUEST | 7 << 16,
            error: 0,
            data_size: 12,
        };

        let mut raw = [0u8; MARSHAL_HEADER_SIZE];
        header.encode(&mut raw);

        assert_eq!(MarshalHeader::decode(&raw), header);
        assert_eq!(&raw[0..4], &[0x01, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_fixed_str_truncates_and_pads() {
        let mut out = [0xFFu8; 8];
        write_fixed_str(&mut out, "board");
        assert_eq!(&out, b"board\0\0\0");

        write_fixed_str(&mut out, "a much longer name");
        assert_eq!(out[7], 0, "field must stay terminated");
        assert_eq!(read_fixed_str(&out), "a much ");
    }

    #[test]
    fn test_board_information_size() {
        let info = BoardInformation {
            name: "cifX0".into(),
            alias: "plc".into(),
            channel_count: 2,
            ..BoardInformation::default()
        };

        let mut out = vec![0u8; BoardInformation::SIZE];
        info.encode(&mut out);

        assert_eq!(BoardInformation::SIZE, 112);
        assert_eq!(read_fixed_str(&out[4..20]), "cifX0");
        assert_eq!(read_fixed_str(&out[20..36]), "plc");
        assert_eq!(LittleEndian::read_u32(&out[56..60]), 2);
    }

    #[test]
    fn test_channel_information_size() {
        let info = ChannelInformation {
            board_name: "cifX0".into(),
            fw_name: "SIMFW".into(),
            fw_name_length: 5,
            mailbox_size: 1596,
            ..ChannelInformation::default()
        };

        let mut out = vec![0u8; ChannelInformation::SIZE];
        info.encode(&mut out);

        assert_eq!(ChannelInformation::SIZE, 156);
        assert_eq!(out[48], 5);
        assert_eq!(read_fixed_str(&out[49..112]), "SIMFW");
        assert_eq!(LittleEndian::read_u32(&out[132..136]), 1596);
    }

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet {
            header: PacketHeader {
                dest: mailbox::DEST_SYSTEM,
                cmd: mailbox::FILE_DOWNLOAD_REQ,
                ext: mailbox::SEQ_NONE,
                ..PacketHeader::default()
            },
            data: vec![1, 2, 3, 4, 5],
        };

        let mut raw = vec![0u8; packet.encoded_len()];
        assert_eq!(packet.encode(&mut raw), PACKET_HEADER_SIZE + 5);

        let decoded = Packet::decode(&raw).unwrap();
        assert_eq!(decoded.header.cmd, mailbox::FILE_DOWNLOAD_REQ);
        assert_eq!(decoded.header.len, 5);
        assert_eq!(decoded.data, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_packet_decode_short_input() {
        assert!(Packet::decode(&[0u8; 10]).is_err());

        let mut raw = vec![0u8; PACKET_HEADER_SIZE];
        LittleEndian::write_u32(&mut raw[16..20], 4);
        assert!(Packet::decode(&raw).is_err());
    }

    #[test]
    fn test_directory_entry_roundtrip() {
        let entry = DirectoryEntry {
            list_handle: 7,
            name: "FIRMWARE.NXF".into(),
            file_type: 1,
            file_size: 0x4000,
        };

        let mut raw = [0u8; DirectoryEntry::SIZE];
        entry.encode(&mut raw);

        assert_eq!(DirectoryEntry::SIZE, 36);
        assert_eq!(DirectoryEntry::decode(&raw).unwrap(), entry);
    }
}
