//! Download-hook interposer.
//!
//! A decorator over the driver trait that watches the mailbox traffic of
//! the packet-level entry points for file download commands. Devices
//! without a writable file volume cannot take the download themselves; for
//! those the hook withholds the packets, synthesises the confirmations,
//! assembles the file image in memory and hands it to a storage callback
//! when the final block arrives. Devices with a volume see the unchanged
//! packet stream and the hook only keeps a copy.

use crate::driver::{DriverApi, RawHandle};
use crate::status::{ApiError, ApiResult};
use crate::types::{mailbox, BoardInformation, DirectoryEntry, Packet, PacketHeader};
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use marshaller::logging;
use std::sync::{Arc, Mutex};

/// What kind of image a download carries, derived from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    Firmware,
    Module,
    Config,
    File,
}

impl DownloadMode {
    /// Classify by extension: `.NXF` firmware, `.NXO` module, `.NXD` and
    /// `.XML` configuration, anything else a plain file.
    pub fn from_file_name(name: &str) -> DownloadMode {
        if name.len() < 5 {
            return DownloadMode::File;
        }

        let ext = &name[name.len() - 4..];
        if ext.eq_ignore_ascii_case(".nxf") {
            DownloadMode::Firmware
        } else if ext.eq_ignore_ascii_case(".nxo") {
            DownloadMode::Module
        } else if ext.eq_ignore_ascii_case(".nxd") || ext.eq_ignore_ascii_case(".xml") {
            DownloadMode::Config
        } else {
            DownloadMode::File
        }
    }

    fn tracked(self) -> bool {
        !matches!(self, DownloadMode::File)
    }
}

/// Sink for completed downloads.
pub trait FileStorage: Send + Sync {
    fn store(
        &self,
        board: &BoardInformation,
        file_name: &str,
        data: &[u8],
        channel: u32,
        mode: DownloadMode,
    ) -> ApiResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnMode {
    /// Device has no file volume: packets are withheld and answered here.
    Capture,
    /// Device handles the download itself: packets pass through.
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnPhase {
    Request,
    Data,
    Finished,
    Failed,
}

struct Transaction {
    phase: TxnPhase,
    mode: DownloadMode,
    txn_mode: TxnMode,
    file_name: String,
    channel: u32,
    max_block_size: u32,
    data: Vec<u8>,
    error: u32,
    board: BoardInformation,
    pending_cnf: Option<Packet>,
}

struct OpenInfo {
    driver: RawHandle,
    board: String,
}

/// The decorator. Wraps another driver and interposes the six packet-level
/// entry points of the system device and channel objects.
pub struct DownloadHook {
    inner: Arc<dyn DriverApi>,
    storage: Arc<dyn FileStorage>,
    opens: Mutex<HashMap<RawHandle, OpenInfo>>,
    transactions: Mutex<HashMap<RawHandle, Transaction>>,
    log: logging::Logger,
}

impl DownloadHook {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        inner: Arc<dyn DriverApi>,
        storage: Arc<dyn FileStorage>,
        log: L,
    ) -> DownloadHook {
        DownloadHook {
            inner,
            storage,
            opens: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            log: logging::child_or_discard(log),
        }
    }

    /// Board information for an open device handle, resolved through the
    /// wrapped driver's enumeration.
    fn board_info(&self, device: RawHandle) -> ApiResult<BoardInformation> {
        let (driver, board) = {
            let opens = self.opens.lock().unwrap();
            let info = opens.get(&device).ok_or(ApiError::INVALID_HANDLE)?;
            (info.driver, info.board.clone())
        };

        let count = self.inner.driver_get_information(driver)?.board_count;
        for index in 0..count {
            let info = self.inner.driver_enum_boards(driver, index)?;
            if info.name.eq_ignore_ascii_case(&board)
                || (!info.alias.is_empty() && info.alias.eq_ignore_ascii_case(&board))
            {
                return Ok(info);
            }
        }

        Err(ApiError::INVALID_BOARD)
    }

    fn transaction_mode(&self, device: RawHandle) -> Option<TxnMode> {
        match self.inner.device_has_file_system(device) {
            Ok(true) => Some(TxnMode::Monitor),
            Ok(false) => Some(TxnMode::Capture),
            // Unknown device type: leave the packet stream alone.
            Err(_) => None,
        }
    }

    /// Shared put-packet wrapper.
    fn hooked_put(
        &self,
        device: RawHandle,
        packet: &Packet,
        timeout_ms: u32,
        forward: impl FnOnce(&Packet, u32) -> ApiResult<()>,
    ) -> ApiResult<()> {
        let cmd = packet.header.cmd;
        let is_download = cmd == mailbox::FILE_DOWNLOAD_REQ
            || cmd == mailbox::FILE_DOWNLOAD_DATA_REQ
            || cmd == mailbox::FILE_DOWNLOAD_ABORT_REQ;

        if !is_download {
            return forward(packet, timeout_ms);
        }

        let capture = {
            let mut transactions = self.transactions.lock().unwrap();

            let phase = match transactions.get(&device).map(|t| t.phase) {
                // A stale transaction is replaced by the new request.
                Some(TxnPhase::Finished) | Some(TxnPhase::Failed) => {
                    transactions.remove(&device);
                    TxnPhase::Request
                }
                Some(phase) => phase,
                None => TxnPhase::Request,
            };

            match phase {
                TxnPhase::Request => {
                    if cmd == mailbox::FILE_DOWNLOAD_REQ {
                        if let Some(transaction) = self.start_transaction(device, packet) {
                            logging::debug!(self.log, "tracking download";
                                            "file" => &transaction.file_name,
                                            "size" => transaction.data.capacity(),
                                            "capture" => transaction.txn_mode == TxnMode::Capture);
                            transactions.insert(device, transaction);
                        }
                    }
                }

                TxnPhase::Data => {
                    let transaction = transactions
                        .get_mut(&device)
                        .expect("data phase without transaction");
                    Self::take_data(transaction, packet);
                }

                TxnPhase::Finished | TxnPhase::Failed => unreachable!(),
            }

            match transactions.get_mut(&device) {
                Some(transaction) if transaction.txn_mode == TxnMode::Capture => {
                    transaction.pending_cnf = Some(Self::confirmation_for(transaction, packet));
                    true
                }
                _ => false,
            }
        };

        if capture {
            Ok(())
        } else {
            forward(packet, timeout_ms)
        }
    }

    /// Parse a download request and open a transaction for it, if it is of
    /// a tracked kind and the device type can be determined.
    fn start_transaction(&self, device: RawHandle, packet: &Packet) -> Option<Transaction> {
        let data = &packet.data;
        if data.len() < 20 {
            return None;
        }

        let max_block_size = LittleEndian::read_u32(&data[4..8]);
        let file_length = LittleEndian::read_u32(&data[8..12]);
        let channel = LittleEndian::read_u32(&data[12..16]);
        let name_len = LittleEndian::read_u16(&data[16..18]) as usize;

        if name_len == 0 || data.len() < 20 + name_len {
            return None;
        }
        // The transmitted length includes the terminator.
        let file_name =
            String::from_utf8_lossy(&data[20..20 + name_len - 1]).into_owned();

        let mode = DownloadMode::from_file_name(&file_name);
        if !mode.tracked() {
            return None;
        }

        let txn_mode = self.transaction_mode(device)?;
        let board = match self.board_info(device) {
            Ok(board) => board,
            Err(err) => {
                logging::warn!(self.log, "no board information for download";
                               "file" => &file_name, "status" => %err);
                return None;
            }
        };

        Some(Transaction {
            phase: TxnPhase::Request,
            mode,
            txn_mode,
            file_name,
            channel,
            max_block_size,
            data: Vec::with_capacity(file_length as usize),
            error: 0,
            board,
            pending_cnf: None,
        })
    }

    /// Append a data packet to the transaction, honouring the sequencing
    /// bits: first and middle blocks carry the full block size, the last or
    /// an unsequenced one is sized by the packet length.
    fn take_data(transaction: &mut Transaction, packet: &Packet) {
        match packet.header.cmd {
            mailbox::FILE_DOWNLOAD_DATA_REQ => {
                if packet.data.len() < 8 {
                    transaction.error = ApiError::PACKET_OUT_OF_SEQ.code();
                    transaction.phase = TxnPhase::Failed;
                    return;
                }
                let block = &packet.data[8..];

                match packet.header.ext & mailbox::SEQ_MASK {
                    mailbox::SEQ_FIRST | mailbox::SEQ_MIDDLE => {
                        let count = (transaction.max_block_size as usize).min(block.len());
                        transaction.data.extend_from_slice(&block[..count]);
                    }
                    _ => {
                        transaction.data.extend_from_slice(block);
                        transaction.phase = TxnPhase::Finished;
                    }
                }
            }

            mailbox::FILE_DOWNLOAD_ABORT_REQ => {
                transaction.phase = TxnPhase::Failed;
            }

            _ => {
                transaction.error = ApiError::PACKET_OUT_OF_SEQ.code();
                transaction.phase = TxnPhase::Failed;
            }
        }
    }

    /// Build the confirmation the device would have sent.
    fn confirmation_for(transaction: &Transaction, request: &Packet) -> Packet {
        let mut data = Vec::new();

        if transaction.error == 0 {
            match request.header.cmd {
                mailbox::FILE_DOWNLOAD_REQ => {
                    let mut word = [0u8; 4];
                    LittleEndian::write_u32(&mut word, transaction.max_block_size);
                    data.extend_from_slice(&word);
                }
                mailbox::FILE_DOWNLOAD_DATA_REQ => {
                    // Echo the announced checksum as the expected one.
                    let mut word = [0u8; 4];
                    let checksum = LittleEndian::read_u32(&request.data[4..8]);
                    LittleEndian::write_u32(&mut word, checksum);
                    data.extend_from_slice(&word);
                }
                _ => {}
            }
        }

        Packet {
            header: PacketHeader {
                dest: request.header.src,
                src: request.header.dest,
                dest_id: request.header.dest_id,
                src_id: request.header.src_id,
                len: data.len() as u32,
                id: request.header.id,
                state: transaction.error,
                cmd: request.header.cmd | mailbox::MSK_ANSWER,
                ext: 0,
                rout: request.header.rout,
            },
            data,
        }
    }

    /// Shared get-packet wrapper: serve synthesised confirmations first,
    /// watch real ones for the phase change, finish or fail the
    /// transaction.
    fn hooked_get(
        &self,
        device: RawHandle,
        size: u32,
        timeout_ms: u32,
        forward: impl FnOnce(u32, u32) -> ApiResult<Packet>,
    ) -> ApiResult<Packet> {
        let (tracked, pending) = {
            let mut transactions = self.transactions.lock().unwrap();
            match transactions.get_mut(&device) {
                None => (false, None),
                Some(transaction) => {
                    let pending = if transaction.txn_mode == TxnMode::Capture {
                        transaction.pending_cnf.take()
                    } else {
                        None
                    };
                    (true, pending)
                }
            }
        };

        if !tracked {
            return forward(size, timeout_ms);
        }

        let result = match pending {
            Some(packet) => Ok(packet),
            None => forward(size, timeout_ms),
        };

        let finished = {
            let mut transactions = self.transactions.lock().unwrap();
            let mut finished = None;

            if let Some(transaction) = transactions.get_mut(&device) {
                if let Ok(packet) = &result {
                    if transaction.phase == TxnPhase::Request
                        && packet.header.cmd == mailbox::FILE_DOWNLOAD_CNF
                        && packet.header.state == 0
                    {
                        // The device may lower the block size.
                        if packet.data.len() >= 4 {
                            let device_block = LittleEndian::read_u32(&packet.data[..4]);
                            if device_block > 0 && device_block < transaction.max_block_size {
                                transaction.max_block_size = device_block;
                            }
                        }
                        transaction.phase = TxnPhase::Data;
                    }
                }

                match transaction.phase {
                    TxnPhase::Finished => finished = transactions.remove(&device),
                    TxnPhase::Failed => {
                        transactions.remove(&device);
                    }
                    _ => {}
                }
            }

            finished
        };

        if let Some(transaction) = finished {
            logging::info!(self.log, "download complete";
                           "file" => &transaction.file_name,
                           "bytes" => transaction.data.len(),
                           "channel" => transaction.channel);

            if let Err(err) = self.storage.store(
                &transaction.board,
                &transaction.file_name,
                &transaction.data,
                transaction.channel,
                transaction.mode,
            ) {
                logging::warn!(self.log, "storing download failed";
                               "file" => &transaction.file_name, "status" => %err);
            }
        }

        result
    }

    /// Shared mailbox-state wrapper: a waiting synthesised confirmation
    /// counts as a receivable packet.
    fn hooked_mbx_state(
        &self,
        device: RawHandle,
        forward: impl FnOnce() -> ApiResult<(u32, u32)>,
    ) -> ApiResult<(u32, u32)> {
        let (mut recv, send) = forward()?;

        let transactions = self.transactions.lock().unwrap();
        if let Some(transaction) = transactions.get(&device) {
            if transaction.txn_mode == TxnMode::Capture && transaction.pending_cnf.is_some() {
                recv += 1;
            }
        }

        Ok((recv, send))
    }

    fn forget(&self, device: RawHandle) {
        self.opens.lock().unwrap().remove(&device);
        self.transactions.lock().unwrap().remove(&device);
    }
}

impl DriverApi for DownloadHook {
    fn driver_open(&self) -> ApiResult<RawHandle> {
        self.inner.driver_open()
    }

    fn driver_close(&self, driver: RawHandle) -> ApiResult<()> {
        self.inner.driver_close(driver)
    }

    fn driver_get_information(
        &self,
        driver: RawHandle,
    ) -> ApiResult<crate::types::DriverInformation> {
        self.inner.driver_get_information(driver)
    }

    fn driver_enum_boards(&self, driver: RawHandle, board: u32) -> ApiResult<BoardInformation> {
        self.inner.driver_enum_boards(driver, board)
    }

    fn driver_enum_channels(
        &self,
        driver: RawHandle,
        board: u32,
        channel: u32,
    ) -> ApiResult<crate::types::ChannelInformation> {
        self.inner.driver_enum_channels(driver, board, channel)
    }

    fn driver_restart_device(&self, driver: RawHandle, board: &str) -> ApiResult<()> {
        self.inner.driver_restart_device(driver, board)
    }

    fn sysdevice_open(&self, driver: RawHandle, board: &str) -> ApiResult<RawHandle> {
        let handle = self.inner.sysdevice_open(driver, board)?;
        self.opens.lock().unwrap().insert(
            handle,
            OpenInfo {
                driver,
                board: board.to_owned(),
            },
        );
        Ok(handle)
    }

    fn sysdevice_close(&self, sysdevice: RawHandle) -> ApiResult<()> {
        let result = self.inner.sysdevice_close(sysdevice);
        if result.is_ok() {
            self.forget(sysdevice);
        }
        result
    }

    fn sysdevice_get_mbx_state(&self, sysdevice: RawHandle) -> ApiResult<(u32, u32)> {
        self.hooked_mbx_state(sysdevice, || self.inner.sysdevice_get_mbx_state(sysdevice))
    }

    fn sysdevice_put_packet(
        &self,
        sysdevice: RawHandle,
        packet: &Packet,
        timeout_ms: u32,
    ) -> ApiResult<()> {
        self.hooked_put(sysdevice, packet, timeout_ms, |packet, timeout| {
            self.inner.sysdevice_put_packet(sysdevice, packet, timeout)
        })
    }

    fn sysdevice_get_packet(
        &self,
        sysdevice: RawHandle,
        size: u32,
        timeout_ms: u32,
    ) -> ApiResult<Packet> {
        self.hooked_get(sysdevice, size, timeout_ms, |size, timeout| {
            self.inner.sysdevice_get_packet(sysdevice, size, timeout)
        })
    }

    fn sysdevice_info(&self, sysdevice: RawHandle, command: u32, data: &mut [u8]) -> ApiResult<()> {
        self.inner.sysdevice_info(sysdevice, command, data)
    }

    fn sysdevice_reset(&self, sysdevice: RawHandle, timeout_ms: u32) -> ApiResult<()> {
        self.inner.sysdevice_reset(sysdevice, timeout_ms)
    }

    fn sysdevice_reset_ex(&self, sysdevice: RawHandle, timeout_ms: u32, mode: u32) -> ApiResult<()> {
        self.inner.sysdevice_reset_ex(sysdevice, timeout_ms, mode)
    }

    fn sysdevice_find_first_file(
        &self,
        sysdevice: RawHandle,
        channel: u32,
        entry: &mut DirectoryEntry,
    ) -> ApiResult<()> {
        self.inner.sysdevice_find_first_file(sysdevice, channel, entry)
    }

    fn sysdevice_find_next_file(
        &self,
        sysdevice: RawHandle,
        channel: u32,
        entry: &mut DirectoryEntry,
    ) -> ApiResult<()> {
        self.inner.sysdevice_find_next_file(sysdevice, channel, entry)
    }

    fn device_has_file_system(&self, device: RawHandle) -> ApiResult<bool> {
        self.inner.device_has_file_system(device)
    }

    fn channel_open(&self, driver: RawHandle, board: &str, channel: u32) -> ApiResult<RawHandle> {
        let handle = self.inner.channel_open(driver, board, channel)?;
        self.opens.lock().unwrap().insert(
            handle,
            OpenInfo {
                driver,
                board: board.to_owned(),
            },
        );
        Ok(handle)
    }

    fn channel_close(&self, channel: RawHandle) -> ApiResult<()> {
        let result = self.inner.channel_close(channel);
        if result.is_ok() {
            self.forget(channel);
        }
        result
    }

    fn channel_get_mbx_state(&self, channel: RawHandle) -> ApiResult<(u32, u32)> {
        self.hooked_mbx_state(channel, || self.inner.channel_get_mbx_state(channel))
    }

    fn channel_put_packet(
        &self,
        channel: RawHandle,
        packet: &Packet,
        timeout_ms: u32,
    ) -> ApiResult<()> {
        self.hooked_put(channel, packet, timeout_ms, |packet, timeout| {
            self.inner.channel_put_packet(channel, packet, timeout)
        })
    }

    fn channel_get_packet(&self, channel: RawHandle, size: u32, timeout_ms: u32) -> ApiResult<Packet> {
        self.hooked_get(channel, size, timeout_ms, |size, timeout| {
            self.inner.channel_get_packet(channel, size, timeout)
        })
    }

    fn channel_get_send_packet(&self, channel: RawHandle, size: u32) -> ApiResult<Packet> {
        self.inner.channel_get_send_packet(channel, size)
    }

    fn channel_config_lock(
        &self,
        channel: RawHandle,
        command: u32,
        state: u32,
        timeout_ms: u32,
    ) -> ApiResult<u32> {
        self.inner.channel_config_lock(channel, command, state, timeout_ms)
    }

    fn channel_reset(&self, channel: RawHandle, mode: u32, timeout_ms: u32) -> ApiResult<()> {
        self.inner.channel_reset(channel, mode, timeout_ms)
    }

    fn channel_info(&self, channel: RawHandle, data: &mut [u8]) -> ApiResult<()> {
        self.inner.channel_info(channel, data)
    }

    fn channel_watchdog(&self, channel: RawHandle, command: u32, trigger: u32) -> ApiResult<u32> {
        self.inner.channel_watchdog(channel, command, trigger)
    }

    fn channel_host_state(
        &self,
        channel: RawHandle,
        command: u32,
        state: u32,
        timeout_ms: u32,
    ) -> ApiResult<u32> {
        self.inner.channel_host_state(channel, command, state, timeout_ms)
    }

    fn channel_bus_state(
        &self,
        channel: RawHandle,
        command: u32,
        state: u32,
        timeout_ms: u32,
    ) -> ApiResult<u32> {
        self.inner.channel_bus_state(channel, command, state, timeout_ms)
    }

    fn channel_io_info(
        &self,
        channel: RawHandle,
        command: u32,
        area: u32,
        data: &mut [u8],
    ) -> ApiResult<()> {
        self.inner.channel_io_info(channel, command, area, data)
    }

    fn channel_io_read(
        &self,
        channel: RawHandle,
        area: u32,
        offset: u32,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> ApiResult<()> {
        self.inner.channel_io_read(channel, area, offset, data, timeout_ms)
    }

    fn channel_io_write(
        &self,
        channel: RawHandle,
        area: u32,
        offset: u32,
        data: &[u8],
        timeout_ms: u32,
    ) -> ApiResult<()> {
        self.inner.channel_io_write(channel, area, offset, data, timeout_ms)
    }

    fn channel_io_read_send_data(
        &self,
        channel: RawHandle,
        area: u32,
        offset: u32,
        data: &mut [u8],
    ) -> ApiResult<()> {
        self.inner.channel_io_read_send_data(channel, area, offset, data)
    }

    fn channel_control_block(
        &self,
        channel: RawHandle,
        command: u32,
        offset: u32,
        data: &mut [u8],
    ) -> ApiResult<()> {
        self.inner.channel_control_block(channel, command, offset, data)
    }

    fn channel_status_block(
        &self,
        channel: RawHandle,
        command: u32,
        offset: u32,
        data: &mut [u8],
    ) -> ApiResult<()> {
        self.inner.channel_status_block(channel, command, offset, data)
    }

    fn channel_extended_status_block(
        &self,
        channel: RawHandle,
        command: u32,
        offset: u32,
        data: &mut [u8],
    ) -> ApiResult<()> {
        self.inner
            .channel_extended_status_block(channel, command, offset, data)
    }

    fn channel_find_first_file(
        &self,
        channel: RawHandle,
        entry: &mut DirectoryEntry,
    ) -> ApiResult<()> {
        self.inner.channel_find_first_file(channel, entry)
    }

    fn channel_find_next_file(
        &self,
        channel: RawHandle,
        entry: &mut DirectoryEntry,
    ) -> ApiResult<()> {
        self.inner.channel_find_next_file(channel, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBoard, SimDriver};

    struct RecordingStorage {
        stored: Mutex<Vec<(String, Vec<u8>, u32, DownloadMode)>>,
    }

    impl RecordingStorage {
        fn new() -> Arc<RecordingStorage> {
            Arc::new(RecordingStorage {
                stored: Mutex::new(Vec::new()),
            })
        }
    }

    impl FileStorage for RecordingStorage {
        fn store(
            &self,
            _board: &BoardInformation,
            file_name: &str,
            data: &[u8],
            channel: u32,
            mode: DownloadMode,
        ) -> ApiResult<()> {
            self.stored
                .lock()
                .unwrap()
                .push((file_name.to_owned(), data.to_vec(), channel, mode));
            Ok(())
        }
    }

    fn download_request(file_name: &str, file_length: u32, max_block: u32) -> Packet {
        let mut data = Vec::new();
        let mut word = [0u8; 4];

        LittleEndian::write_u32(&mut word, 1); // transfer type
        data.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, max_block);
        data.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, file_length);
        data.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, 0); // channel
        data.extend_from_slice(&word);

        let mut half = [0u8; 2];
        LittleEndian::write_u16(&mut half, file_name.len() as u16 + 1);
        data.extend_from_slice(&half);
        data.extend_from_slice(&[0, 0]);
        data.extend_from_slice(file_name.as_bytes());
        data.push(0);

        Packet {
            header: PacketHeader {
                dest: mailbox::DEST_SYSTEM,
                cmd: mailbox::FILE_DOWNLOAD_REQ,
                ext: mailbox::SEQ_NONE,
                ..PacketHeader::default()
            },
            data,
        }
    }

    fn data_packet(block: &[u8], seq: u32, block_no: u32) -> Packet {
        let mut data = Vec::new();
        let mut word = [0u8; 4];

        LittleEndian::write_u32(&mut word, block_no);
        data.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, 0xCAFE); // checksum
        data.extend_from_slice(&word);
        data.extend_from_slice(block);

        Packet {
            header: PacketHeader {
                dest: mailbox::DEST_SYSTEM,
                cmd: mailbox::FILE_DOWNLOAD_DATA_REQ,
                ext: seq,
                ..PacketHeader::default()
            },
            data,
        }
    }

    fn make_hook(has_file_system: bool) -> (Arc<SimDriver>, Arc<RecordingStorage>, DownloadHook) {
        let driver = Arc::new(SimDriver::new(vec![SimBoard {
            has_file_system,
            ..SimBoard::default()
        }]));
        let storage = RecordingStorage::new();
        let hook = DownloadHook::new(driver.clone(), storage.clone(), None);
        (driver, storage, hook)
    }

    #[test]
    fn test_mode_from_file_name() {
        assert_eq!(DownloadMode::from_file_name("X030D000.nxf"), DownloadMode::Firmware);
        assert_eq!(DownloadMode::from_file_name("STACK.NXO"), DownloadMode::Module);
        assert_eq!(DownloadMode::from_file_name("config.nxd"), DownloadMode::Config);
        assert_eq!(DownloadMode::from_file_name("net.XML"), DownloadMode::Config);
        assert_eq!(DownloadMode::from_file_name("readme.txt"), DownloadMode::File);
        assert_eq!(DownloadMode::from_file_name("x"), DownloadMode::File);
    }

    #[test]
    fn test_capture_download_on_ram_device() {
        let (driver, storage, hook) = make_hook(false);
        let device = hook.sysdevice_open(1, "cifX0").unwrap();

        // Request: a 10-byte firmware in blocks of 4.
        hook.sysdevice_put_packet(device, &download_request("BOOT.NXF", 10, 4), 100)
            .unwrap();

        // The request never reached the device.
        assert_eq!(driver.calls("sysdevice_put_packet"), 0);

        // The synthesised confirmation is announced and served.
        assert_eq!(hook.sysdevice_get_mbx_state(device).unwrap().0, 1);
        let cnf = hook.sysdevice_get_packet(device, 1024, 100).unwrap();
        assert_eq!(cnf.header.cmd, mailbox::FILE_DOWNLOAD_CNF);
        assert_eq!(cnf.header.state, 0);
        assert_eq!(LittleEndian::read_u32(&cnf.data[..4]), 4);

        // Two full blocks, then the remainder.
        hook.sysdevice_put_packet(device, &data_packet(&[1, 2, 3, 4], mailbox::SEQ_FIRST, 0), 100)
            .unwrap();
        let cnf = hook.sysdevice_get_packet(device, 1024, 100).unwrap();
        assert_eq!(cnf.header.cmd, mailbox::FILE_DOWNLOAD_DATA_CNF);

        hook.sysdevice_put_packet(device, &data_packet(&[5, 6, 7, 8], mailbox::SEQ_MIDDLE, 1), 100)
            .unwrap();
        hook.sysdevice_get_packet(device, 1024, 100).unwrap();

        hook.sysdevice_put_packet(device, &data_packet(&[9, 10], mailbox::SEQ_LAST, 2), 100)
            .unwrap();
        hook.sysdevice_get_packet(device, 1024, 100).unwrap();

        let stored = storage.stored.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, "BOOT.NXF");
        assert_eq!(stored[0].1, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(stored[0].2, 0);
        assert_eq!(stored[0].3, DownloadMode::Firmware);

        // Nothing of the download transaction touched the device mailbox.
        assert_eq!(driver.calls("sysdevice_put_packet"), 0);
        assert_eq!(driver.calls("sysdevice_get_packet"), 0);
    }

    #[test]
    fn test_monitor_download_on_flash_device() {
        let (driver, storage, hook) = make_hook(true);
        let device = hook.sysdevice_open(1, "cifX0").unwrap();

        hook.sysdevice_put_packet(device, &download_request("CONF.NXD", 6, 1024), 100)
            .unwrap();
        assert_eq!(driver.calls("sysdevice_put_packet"), 1, "must be forwarded");

        // The confirmation comes from the device loopback.
        let cnf = hook.sysdevice_get_packet(device, 1024, 100).unwrap();
        assert_eq!(cnf.header.cmd, mailbox::FILE_DOWNLOAD_CNF);

        hook.sysdevice_put_packet(
            device,
            &data_packet(&[1, 2, 3, 4, 5, 6], mailbox::SEQ_NONE, 0),
            100,
        )
        .unwrap();
        assert_eq!(driver.calls("sysdevice_put_packet"), 2);
        hook.sysdevice_get_packet(device, 1024, 100).unwrap();

        // Snooped and stored nevertheless.
        let stored = storage.stored.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].1, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(stored[0].3, DownloadMode::Config);
    }

    #[test]
    fn test_abort_cancels_transaction() {
        let (_driver, storage, hook) = make_hook(false);
        let device = hook.sysdevice_open(1, "cifX0").unwrap();

        hook.sysdevice_put_packet(device, &download_request("BOOT.NXF", 8, 4), 100)
            .unwrap();
        hook.sysdevice_get_packet(device, 1024, 100).unwrap();

        let abort = Packet {
            header: PacketHeader {
                cmd: mailbox::FILE_DOWNLOAD_ABORT_REQ,
                ..PacketHeader::default()
            },
            data: Vec::new(),
        };
        hook.sysdevice_put_packet(device, &abort, 100).unwrap();
        let cnf = hook.sysdevice_get_packet(device, 1024, 100).unwrap();
        assert_eq!(cnf.header.cmd, mailbox::FILE_DOWNLOAD_ABORT_CNF);

        assert!(storage.stored.lock().unwrap().is_empty());

        // Transaction gone: further gets reach the (empty) device mailbox.
        assert_eq!(
            hook.sysdevice_get_packet(device, 1024, 100),
            Err(ApiError::NO_PACKET)
        );
    }

    #[test]
    fn test_plain_files_not_tracked() {
        let (driver, storage, hook) = make_hook(false);
        let device = hook.sysdevice_open(1, "cifX0").unwrap();

        hook.sysdevice_put_packet(device, &download_request("README.TXT", 4, 64), 100)
            .unwrap();

        // Untracked kinds are forwarded even on devices without a volume.
        assert_eq!(driver.calls("sysdevice_put_packet"), 1);
        assert!(storage.stored.lock().unwrap().is_empty());
    }

    #[test]
    fn test_non_download_packets_pass_through() {
        let (driver, _storage, hook) = make_hook(false);
        let device = hook.channel_open(1, "cifX0", 0).unwrap();

        let packet = Packet {
            header: PacketHeader {
                cmd: 0x200,
                ..PacketHeader::default()
            },
            data: vec![9],
        };
        hook.channel_put_packet(device, &packet, 100).unwrap();
        assert_eq!(driver.calls("channel_put_packet"), 1);

        let cnf = hook.channel_get_packet(device, 1024, 100).unwrap();
        assert_eq!(cnf.header.cmd, 0x201);
        assert_eq!(cnf.data, vec![9]);
    }

    #[test]
    fn test_out_of_sequence_fails_transaction() {
        let (_driver, storage, hook) = make_hook(false);
        let device = hook.sysdevice_open(1, "cifX0").unwrap();

        hook.sysdevice_put_packet(device, &download_request("BOOT.NXF", 8, 4), 100)
            .unwrap();
        hook.sysdevice_get_packet(device, 1024, 100).unwrap();

        // A second download request in the data phase is out of sequence.
        hook.sysdevice_put_packet(device, &download_request("BOOT.NXF", 8, 4), 100)
            .unwrap();
        let cnf = hook.sysdevice_get_packet(device, 1024, 100).unwrap();
        assert_eq!(cnf.header.state, ApiError::PACKET_OUT_OF_SEQ.code());

        assert!(storage.stored.lock().unwrap().is_empty());
    }
}
