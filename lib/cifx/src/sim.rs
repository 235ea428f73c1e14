//! A simulated driver backend.
//!
//! Stands in for the real device library when the gateway runs without
//! hardware and backs the dispatcher tests. Mailboxes are loopbacks: every
//! packet put is answered by a confirmation carrying the answer bit, I/O
//! areas and the control/status blocks are plain memory.

use crate::driver::{DriverApi, RawHandle};
use crate::status::{ApiError, ApiResult};
use crate::types::{
    mailbox, BoardInformation, ChannelInformation, DirectoryEntry, DriverInformation, Packet,
    SystemInfo,
};
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

const DRIVER_HANDLE: RawHandle = 1;
const MAILBOX_DEPTH: usize = 8;
const IO_AREA_SIZE: usize = 64;
const BLOCK_SIZE: usize = 64;

/// Description of one simulated board.
#[derive(Debug, Clone)]
pub struct SimBoard {
    pub name: String,
    pub alias: String,
    pub device_number: u32,
    pub serial_number: u32,
    pub channel_count: u32,
    /// Boards with a file volume take downloads themselves; the download
    /// hook captures them otherwise.
    pub has_file_system: bool,
}

impl Default for SimBoard {
    fn default() -> SimBoard {
        SimBoard {
            name: "cifX0".into(),
            alias: String::new(),
            device_number: 7_833_000,
            serial_number: 20_001,
            channel_count: 1,
            has_file_system: false,
        }
    }
}

/// One opened system device or channel.
struct Endpoint {
    board: usize,
    mailbox: VecDeque<Packet>,
    io_input: Vec<u8>,
    io_output: Vec<u8>,
    control_block: Vec<u8>,
    status_block: Vec<u8>,
    extended_status_block: Vec<u8>,
    host_state: u32,
    bus_state: u32,
    lock_state: u32,
}

impl Endpoint {
    fn new(board: usize) -> Endpoint {
        Endpoint {
            board,
            mailbox: VecDeque::new(),
            io_input: vec![0; IO_AREA_SIZE],
            io_output: vec![0; IO_AREA_SIZE],
            control_block: vec![0; BLOCK_SIZE],
            status_block: vec![0; BLOCK_SIZE],
            extended_status_block: vec![0; BLOCK_SIZE],
            host_state: 0,
            bus_state: 0,
            lock_state: 0,
        }
    }
}

struct SimState {
    next_handle: RawHandle,
    endpoints: HashMap<RawHandle, Endpoint>,
}

/// The simulated driver. Thread-safe; call counters are kept per entry
/// point so tests can assert how often the library was really touched.
pub struct SimDriver {
    boards: Vec<SimBoard>,
    state: Mutex<SimState>,
    calls: Mutex<HashMap<&'static str, u32>>,
}

impl SimDriver {
    pub fn new(boards: Vec<SimBoard>) -> SimDriver {
        SimDriver {
            boards,
            state: Mutex::new(SimState {
                next_handle: DRIVER_HANDLE + 1,
                endpoints: HashMap::new(),
            }),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Number of invocations of the named entry point.
    pub fn calls(&self, name: &str) -> u32 {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn bump(&self, name: &'static str) {
        *self.calls.lock().unwrap().entry(name).or_insert(0) += 1;
    }

    fn board_index(&self, name: &str) -> ApiResult<usize> {
        self.boards
            .iter()
            .position(|board| {
                board.name.eq_ignore_ascii_case(name)
                    || (!board.alias.is_empty() && board.alias.eq_ignore_ascii_case(name))
            })
            .ok_or(ApiError::INVALID_BOARD)
    }

    fn open_endpoint(&self, board: usize) -> RawHandle {
        let mut state = self.state.lock().unwrap();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.endpoints.insert(handle, Endpoint::new(board));
        handle
    }

    fn close_endpoint(&self, handle: RawHandle) -> ApiResult<()> {
        self.state
            .lock()
            .unwrap()
            .endpoints
            .remove(&handle)
            .map(|_| ())
            .ok_or(ApiError::INVALID_HANDLE)
    }

    fn with_endpoint<T>(
        &self,
        handle: RawHandle,
        op: impl FnOnce(&mut Endpoint) -> ApiResult<T>,
    ) -> ApiResult<T> {
        let mut state = self.state.lock().unwrap();
        let endpoint = state
            .endpoints
            .get_mut(&handle)
            .ok_or(ApiError::INVALID_HANDLE)?;
        op(endpoint)
    }

    fn board_information(&self, board: usize) -> BoardInformation {
        let sim = &self.boards[board];
        BoardInformation {
            board_error: 0,
            name: sim.name.clone(),
            alias: sim.alias.clone(),
            board_id: board as u32,
            system_error: 0,
            physical_address: 0,
            irq_number: 0,
            irq_enabled: 0,
            channel_count: sim.channel_count,
            dpm_total_size: 0x1_0000,
            system_info: SystemInfo {
                cookie: *b"netX",
                dpm_total_size: 0x1_0000,
                device_number: sim.device_number,
                serial_number: sim.serial_number,
                device_class: 0x0001,
                hw_revision: 1,
                ..SystemInfo::default()
            },
        }
    }

    fn put(&self, handle: RawHandle, packet: &Packet) -> ApiResult<()> {
        self.with_endpoint(handle, |endpoint| {
            if endpoint.mailbox.len() >= MAILBOX_DEPTH {
                return Err(ApiError::MAILBOX_FULL);
            }

            // Loopback: answer the request straight away.
            let mut confirmation = packet.clone();
            confirmation.header.cmd |= mailbox::MSK_ANSWER;
            confirmation.header.state = 0;
            confirmation.header.dest = packet.header.src;
            confirmation.header.src = packet.header.dest;
            endpoint.mailbox.push_back(confirmation);
            Ok(())
        })
    }

    fn get(&self, handle: RawHandle) -> ApiResult<Packet> {
        self.with_endpoint(handle, |endpoint| {
            endpoint.mailbox.pop_front().ok_or(ApiError::NO_PACKET)
        })
    }

    fn mbx_state(&self, handle: RawHandle) -> ApiResult<(u32, u32)> {
        self.with_endpoint(handle, |endpoint| {
            let free = MAILBOX_DEPTH - endpoint.mailbox.len();
            Ok((endpoint.mailbox.len() as u32, free as u32))
        })
    }
}

fn region(block: &[u8], offset: u32, len: usize) -> ApiResult<std::ops::Range<usize>> {
    let start = offset as usize;
    let end = start.checked_add(len).ok_or(ApiError::INVALID_PARAMETER)?;
    if end > block.len() {
        return Err(ApiError::INVALID_PARAMETER);
    }
    Ok(start..end)
}

impl DriverApi for SimDriver {
    fn driver_open(&self) -> ApiResult<RawHandle> {
        self.bump("driver_open");
        Ok(DRIVER_HANDLE)
    }

    fn driver_close(&self, _driver: RawHandle) -> ApiResult<()> {
        self.bump("driver_close");
        Ok(())
    }

    fn driver_get_information(&self, _driver: RawHandle) -> ApiResult<DriverInformation> {
        self.bump("driver_get_information");
        Ok(DriverInformation {
            version: "simulated driver V1.0".into(),
            board_count: self.boards.len() as u32,
        })
    }

    fn driver_enum_boards(&self, _driver: RawHandle, board: u32) -> ApiResult<BoardInformation> {
        self.bump("driver_enum_boards");
        if board as usize >= self.boards.len() {
            return Err(ApiError::INVALID_BOARD);
        }
        Ok(self.board_information(board as usize))
    }

    fn driver_enum_channels(
        &self,
        _driver: RawHandle,
        board: u32,
        channel: u32,
    ) -> ApiResult<ChannelInformation> {
        self.bump("driver_enum_channels");
        let sim = self
            .boards
            .get(board as usize)
            .ok_or(ApiError::INVALID_BOARD)?;
        if channel >= sim.channel_count {
            return Err(ApiError::INVALID_CHANNEL);
        }

        Ok(ChannelInformation {
            board_name: sim.name.clone(),
            board_alias: sim.alias.clone(),
            device_number: sim.device_number,
            serial_number: sim.serial_number,
            fw_major: 1,
            fw_minor: 4,
            fw_name_length: 12,
            fw_name: "Simulated FW".into(),
            mailbox_size: 1596,
            io_in_area_count: 1,
            io_out_area_count: 1,
            ..ChannelInformation::default()
        })
    }

    fn driver_restart_device(&self, _driver: RawHandle, board: &str) -> ApiResult<()> {
        self.bump("driver_restart_device");
        self.board_index(board).map(|_| ())
    }

    fn sysdevice_open(&self, _driver: RawHandle, board: &str) -> ApiResult<RawHandle> {
        self.bump("sysdevice_open");
        let board = self.board_index(board)?;
        Ok(self.open_endpoint(board))
    }

    fn sysdevice_close(&self, sysdevice: RawHandle) -> ApiResult<()> {
        self.bump("sysdevice_close");
        self.close_endpoint(sysdevice)
    }

    fn sysdevice_get_mbx_state(&self, sysdevice: RawHandle) -> ApiResult<(u32, u32)> {
        self.bump("sysdevice_get_mbx_state");
        self.mbx_state(sysdevice)
    }

    fn sysdevice_put_packet(
        &self,
        sysdevice: RawHandle,
        packet: &Packet,
        _timeout_ms: u32,
    ) -> ApiResult<()> {
        self.bump("sysdevice_put_packet");
        self.put(sysdevice, packet)
    }

    fn sysdevice_get_packet(
        &self,
        sysdevice: RawHandle,
        _size: u32,
        _timeout_ms: u32,
    ) -> ApiResult<Packet> {
        self.bump("sysdevice_get_packet");
        self.get(sysdevice)
    }

    fn sysdevice_info(&self, sysdevice: RawHandle, _command: u32, data: &mut [u8]) -> ApiResult<()> {
        self.bump("sysdevice_info");
        self.with_endpoint(sysdevice, |_| {
            for byte in data.iter_mut() {
                *byte = 0;
            }
            let count = data.len().min(4);
            data[..count].copy_from_slice(&b"netX"[..count]);
            Ok(())
        })
    }

    fn sysdevice_reset(&self, sysdevice: RawHandle, _timeout_ms: u32) -> ApiResult<()> {
        self.bump("sysdevice_reset");
        self.with_endpoint(sysdevice, |endpoint| {
            endpoint.mailbox.clear();
            Ok(())
        })
    }

    fn sysdevice_reset_ex(
        &self,
        sysdevice: RawHandle,
        timeout_ms: u32,
        _mode: u32,
    ) -> ApiResult<()> {
        self.bump("sysdevice_reset_ex");
        self.sysdevice_reset(sysdevice, timeout_ms)
    }

    fn sysdevice_find_first_file(
        &self,
        sysdevice: RawHandle,
        _channel: u32,
        entry: &mut DirectoryEntry,
    ) -> ApiResult<()> {
        self.bump("sysdevice_find_first_file");
        self.with_endpoint(sysdevice, |_| {
            entry.list_handle = 1;
            entry.name = "FIRMWARE.NXF".into();
            entry.file_type = 1;
            entry.file_size = 0x8000;
            Ok(())
        })
    }

    fn sysdevice_find_next_file(
        &self,
        sysdevice: RawHandle,
        _channel: u32,
        _entry: &mut DirectoryEntry,
    ) -> ApiResult<()> {
        self.bump("sysdevice_find_next_file");
        self.with_endpoint(sysdevice, |_| Err(ApiError::NO_PACKET))
    }

    fn device_has_file_system(&self, device: RawHandle) -> ApiResult<bool> {
        self.bump("device_has_file_system");
        let state = self.state.lock().unwrap();
        let endpoint = state.endpoints.get(&device).ok_or(ApiError::INVALID_HANDLE)?;
        Ok(self.boards[endpoint.board].has_file_system)
    }

    fn channel_open(&self, _driver: RawHandle, board: &str, channel: u32) -> ApiResult<RawHandle> {
        self.bump("channel_open");
        let board = self.board_index(board)?;
        if channel >= self.boards[board].channel_count {
            return Err(ApiError::INVALID_CHANNEL);
        }
        Ok(self.open_endpoint(board))
    }

    fn channel_close(&self, channel: RawHandle) -> ApiResult<()> {
        self.bump("channel_close");
        self.close_endpoint(channel)
    }

    fn channel_get_mbx_state(&self, channel: RawHandle) -> ApiResult<(u32, u32)> {
        self.bump("channel_get_mbx_state");
        self.mbx_state(channel)
    }

    fn channel_put_packet(
        &self,
        channel: RawHandle,
        packet: &Packet,
        _timeout_ms: u32,
    ) -> ApiResult<()> {
        self.bump("channel_put_packet");
        self.put(channel, packet)
    }

    fn channel_get_packet(
        &self,
        channel: RawHandle,
        _size: u32,
        _timeout_ms: u32,
    ) -> ApiResult<Packet> {
        self.bump("channel_get_packet");
        self.get(channel)
    }

    fn channel_get_send_packet(&self, channel: RawHandle, _size: u32) -> ApiResult<Packet> {
        self.bump("channel_get_send_packet");
        // The send mailbox of the simulator drains instantly, so the last
        // sent packet is never retained.
        self.with_endpoint(channel, |_| Err(ApiError::NO_PACKET))
    }

    fn channel_config_lock(
        &self,
        channel: RawHandle,
        command: u32,
        state: u32,
        _timeout_ms: u32,
    ) -> ApiResult<u32> {
        self.bump("channel_config_lock");
        self.with_endpoint(channel, |endpoint| {
            if command != 0 {
                endpoint.lock_state = state;
            }
            Ok(endpoint.lock_state)
        })
    }

    fn channel_reset(&self, channel: RawHandle, _mode: u32, _timeout_ms: u32) -> ApiResult<()> {
        self.bump("channel_reset");
        self.with_endpoint(channel, |endpoint| {
            endpoint.mailbox.clear();
            endpoint.io_input.iter_mut().for_each(|b| *b = 0);
            endpoint.io_output.iter_mut().for_each(|b| *b = 0);
            Ok(())
        })
    }

    fn channel_info(&self, channel: RawHandle, data: &mut [u8]) -> ApiResult<()> {
        self.bump("channel_info");
        let board = self.with_endpoint(channel, |endpoint| Ok(endpoint.board))?;
        let info = self.driver_enum_channels(DRIVER_HANDLE, board as u32, 0)?;

        let mut encoded = [0u8; ChannelInformation::SIZE];
        info.encode(&mut encoded);
        let count = data.len().min(encoded.len());
        data[..count].copy_from_slice(&encoded[..count]);
        Ok(())
    }

    fn channel_watchdog(&self, channel: RawHandle, _command: u32, trigger: u32) -> ApiResult<u32> {
        self.bump("channel_watchdog");
        self.with_endpoint(channel, |_| Ok(trigger.wrapping_add(1)))
    }

    fn channel_host_state(
        &self,
        channel: RawHandle,
        command: u32,
        state: u32,
        _timeout_ms: u32,
    ) -> ApiResult<u32> {
        self.bump("channel_host_state");
        self.with_endpoint(channel, |endpoint| {
            if command != 0 {
                endpoint.host_state = state;
            }
            Ok(endpoint.host_state)
        })
    }

    fn channel_bus_state(
        &self,
        channel: RawHandle,
        command: u32,
        state: u32,
        _timeout_ms: u32,
    ) -> ApiResult<u32> {
        self.bump("channel_bus_state");
        self.with_endpoint(channel, |endpoint| {
            if command != 0 {
                endpoint.bus_state = state;
            }
            Ok(endpoint.bus_state)
        })
    }

    fn channel_io_info(
        &self,
        channel: RawHandle,
        _command: u32,
        _area: u32,
        data: &mut [u8],
    ) -> ApiResult<()> {
        self.bump("channel_io_info");
        self.with_endpoint(channel, |_| {
            for byte in data.iter_mut() {
                *byte = 0;
            }
            if data.len() >= 4 {
                LittleEndian::write_u32(&mut data[..4], IO_AREA_SIZE as u32);
            }
            Ok(())
        })
    }

    fn channel_io_read(
        &self,
        channel: RawHandle,
        _area: u32,
        offset: u32,
        data: &mut [u8],
        _timeout_ms: u32,
    ) -> ApiResult<()> {
        self.bump("channel_io_read");
        self.with_endpoint(channel, |endpoint| {
            let range = region(&endpoint.io_input, offset, data.len())?;
            data.copy_from_slice(&endpoint.io_input[range]);
            Ok(())
        })
    }

    fn channel_io_write(
        &self,
        channel: RawHandle,
        _area: u32,
        offset: u32,
        data: &[u8],
        _timeout_ms: u32,
    ) -> ApiResult<()> {
        self.bump("channel_io_write");
        self.with_endpoint(channel, |endpoint| {
            let range = region(&endpoint.io_input, offset, data.len())?;
            endpoint.io_input[range].copy_from_slice(data);
            Ok(())
        })
    }

    fn channel_io_read_send_data(
        &self,
        channel: RawHandle,
        _area: u32,
        offset: u32,
        data: &mut [u8],
    ) -> ApiResult<()> {
        self.bump("channel_io_read_send_data");
        self.with_endpoint(channel, |endpoint| {
            let range = region(&endpoint.io_output, offset, data.len())?;
            data.copy_from_slice(&endpoint.io_output[range]);
            Ok(())
        })
    }

    fn channel_control_block(
        &self,
        channel: RawHandle,
        command: u32,
        offset: u32,
        data: &mut [u8],
    ) -> ApiResult<()> {
        self.bump("channel_control_block");
        self.with_endpoint(channel, |endpoint| {
            block_op(&mut endpoint.control_block, command, offset, data)
        })
    }

    fn channel_status_block(
        &self,
        channel: RawHandle,
        command: u32,
        offset: u32,
        data: &mut [u8],
    ) -> ApiResult<()> {
        self.bump("channel_status_block");
        self.with_endpoint(channel, |endpoint| {
            block_op(&mut endpoint.status_block, command, offset, data)
        })
    }

    fn channel_extended_status_block(
        &self,
        channel: RawHandle,
        command: u32,
        offset: u32,
        data: &mut [u8],
    ) -> ApiResult<()> {
        self.bump("channel_extended_status_block");
        self.with_endpoint(channel, |endpoint| {
            block_op(&mut endpoint.extended_status_block, command, offset, data)
        })
    }
}

fn block_op(block: &mut [u8], command: u32, offset: u32, data: &mut [u8]) -> ApiResult<()> {
    use crate::types::{CMD_READ_DATA, CMD_WRITE_DATA};

    let range = region(block, offset, data.len())?;
    match command {
        CMD_READ_DATA => {
            data.copy_from_slice(&block[range]);
            Ok(())
        }
        CMD_WRITE_DATA => {
            block[range].copy_from_slice(data);
            Ok(())
        }
        _ => Err(ApiError::INVALID_COMMAND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PacketHeader;

    #[test]
    fn test_mailbox_loopback() {
        let driver = SimDriver::new(vec![SimBoard::default()]);
        let handle = driver.channel_open(DRIVER_HANDLE, "cifX0", 0).unwrap();

        let packet = Packet {
            header: PacketHeader {
                cmd: 0x200,
                ..PacketHeader::default()
            },
            data: vec![1, 2, 3],
        };

        driver.channel_put_packet(handle, &packet, 10).unwrap();
        assert_eq!(driver.channel_get_mbx_state(handle).unwrap().0, 1);

        let confirmation = driver.channel_get_packet(handle, 1024, 10).unwrap();
        assert_eq!(confirmation.header.cmd, 0x201);
        assert_eq!(confirmation.data, vec![1, 2, 3]);

        assert_eq!(
            driver.channel_get_packet(handle, 1024, 10),
            Err(ApiError::NO_PACKET)
        );
    }

    #[test]
    fn test_unknown_board() {
        let driver = SimDriver::new(vec![SimBoard::default()]);
        assert_eq!(
            driver.channel_open(DRIVER_HANDLE, "other", 0),
            Err(ApiError::INVALID_BOARD)
        );
        assert_eq!(driver.driver_enum_boards(DRIVER_HANDLE, 3).unwrap_err(), ApiError::INVALID_BOARD);
    }

    #[test]
    fn test_io_bounds_checked() {
        let driver = SimDriver::new(vec![SimBoard::default()]);
        let handle = driver.channel_open(DRIVER_HANDLE, "cifX0", 0).unwrap();

        let mut data = [0u8; 8];
        assert!(driver.channel_io_read(handle, 0, 60, &mut data, 10).is_err());
        assert!(driver.channel_io_read(handle, 0, 56, &mut data, 10).is_ok());
    }

    #[test]
    fn test_block_buffers_are_distinct() {
        use crate::types::{CMD_READ_DATA, CMD_WRITE_DATA};

        let driver = SimDriver::new(vec![SimBoard::default()]);
        let handle = driver.channel_open(DRIVER_HANDLE, "cifX0", 0).unwrap();

        let mut control = [1u8; 4];
        let mut status = [2u8; 4];
        let mut extended = [3u8; 4];

        driver
            .channel_control_block(handle, CMD_WRITE_DATA, 0, &mut control)
            .unwrap();
        driver
            .channel_status_block(handle, CMD_WRITE_DATA, 0, &mut status)
            .unwrap();
        driver
            .channel_extended_status_block(handle, CMD_WRITE_DATA, 0, &mut extended)
            .unwrap();

        let mut read = [0u8; 4];
        driver
            .channel_control_block(handle, CMD_READ_DATA, 0, &mut read)
            .unwrap();
        assert_eq!(read, [1; 4]);

        driver
            .channel_status_block(handle, CMD_READ_DATA, 0, &mut read)
            .unwrap();
        assert_eq!(read, [2; 4]);

        driver
            .channel_extended_status_block(handle, CMD_READ_DATA, 0, &mut read)
            .unwrap();
        assert_eq!(read, [3; 4]);
    }

    #[test]
    fn test_file_system_flag() {
        let driver = SimDriver::new(vec![SimBoard {
            has_file_system: true,
            ..SimBoard::default()
        }]);
        let handle = driver.sysdevice_open(DRIVER_HANDLE, "cifX0").unwrap();

        assert_eq!(driver.device_has_file_system(handle), Ok(true));
    }
}
