//! The device driver abstraction the dispatcher calls into.
//!
//! The underlying library exposes its API as a table of entry points, not
//! all of which every driver build provides. The trait mirrors that table:
//! the entries a driver must supply have no default, the optional ones
//! default to [`ApiError::FUNCTION_NOT_AVAILABLE`], which the dispatcher
//! forwards to the remote caller unchanged.
//!
//! All calls may block up to the timeout the remote caller supplied; the
//! dispatcher runs them from its own thread.

use crate::status::{ApiError, ApiResult};
use crate::types::{
    BoardInformation, ChannelInformation, DirectoryEntry, DriverInformation, Packet,
};

/// Opaque handle of the underlying library (driver, system device or
/// channel instance).
pub type RawHandle = u64;

#[inline]
fn not_available<T>() -> ApiResult<T> {
    Err(ApiError::FUNCTION_NOT_AVAILABLE)
}

pub trait DriverApi: Send + Sync {
    // Driver object.

    fn driver_open(&self) -> ApiResult<RawHandle>;

    fn driver_close(&self, driver: RawHandle) -> ApiResult<()>;

    fn driver_get_information(&self, driver: RawHandle) -> ApiResult<DriverInformation>;

    fn driver_enum_boards(&self, driver: RawHandle, board: u32) -> ApiResult<BoardInformation>;

    fn driver_enum_channels(
        &self,
        driver: RawHandle,
        board: u32,
        channel: u32,
    ) -> ApiResult<ChannelInformation>;

    fn driver_restart_device(&self, _driver: RawHandle, _board: &str) -> ApiResult<()> {
        not_available()
    }

    // System device object.

    fn sysdevice_open(&self, driver: RawHandle, board: &str) -> ApiResult<RawHandle>;

    fn sysdevice_close(&self, sysdevice: RawHandle) -> ApiResult<()>;

    fn sysdevice_get_mbx_state(&self, sysdevice: RawHandle) -> ApiResult<(u32, u32)>;

    fn sysdevice_put_packet(
        &self,
        sysdevice: RawHandle,
        packet: &Packet,
        timeout_ms: u32,
    ) -> ApiResult<()>;

    fn sysdevice_get_packet(
        &self,
        sysdevice: RawHandle,
        size: u32,
        timeout_ms: u32,
    ) -> ApiResult<Packet>;

    /// `data` is sized by the caller; the driver fills it with the
    /// requested information block.
    fn sysdevice_info(&self, _sysdevice: RawHandle, _command: u32, _data: &mut [u8]) -> ApiResult<()> {
        not_available()
    }

    fn sysdevice_reset(&self, _sysdevice: RawHandle, _timeout_ms: u32) -> ApiResult<()> {
        not_available()
    }

    fn sysdevice_reset_ex(
        &self,
        _sysdevice: RawHandle,
        _timeout_ms: u32,
        _mode: u32,
    ) -> ApiResult<()> {
        not_available()
    }

    fn sysdevice_find_first_file(
        &self,
        _sysdevice: RawHandle,
        _channel: u32,
        _entry: &mut DirectoryEntry,
    ) -> ApiResult<()> {
        not_available()
    }

    fn sysdevice_find_next_file(
        &self,
        _sysdevice: RawHandle,
        _channel: u32,
        _entry: &mut DirectoryEntry,
    ) -> ApiResult<()> {
        not_available()
    }

    /// Whether the device keeps a writable file volume of its own.
    /// Downloads to devices without one cannot be forwarded and are
    /// captured by the download hook instead.
    fn device_has_file_system(&self, _device: RawHandle) -> ApiResult<bool> {
        not_available()
    }

    // Channel object.

    fn channel_open(&self, driver: RawHandle, board: &str, channel: u32) -> ApiResult<RawHandle>;

    fn channel_close(&self, channel: RawHandle) -> ApiResult<()>;

    fn channel_get_mbx_state(&self, channel: RawHandle) -> ApiResult<(u32, u32)>;

    fn channel_put_packet(
        &self,
        channel: RawHandle,
        packet: &Packet,
        timeout_ms: u32,
    ) -> ApiResult<()>;

    fn channel_get_packet(&self, channel: RawHandle, size: u32, timeout_ms: u32)
        -> ApiResult<Packet>;

    fn channel_get_send_packet(&self, _channel: RawHandle, _size: u32) -> ApiResult<Packet> {
        not_available()
    }

    fn channel_config_lock(
        &self,
        _channel: RawHandle,
        _command: u32,
        _state: u32,
        _timeout_ms: u32,
    ) -> ApiResult<u32> {
        not_available()
    }

    fn channel_reset(&self, _channel: RawHandle, _mode: u32, _timeout_ms: u32) -> ApiResult<()> {
        not_available()
    }

    fn channel_info(&self, _channel: RawHandle, _data: &mut [u8]) -> ApiResult<()> {
        not_available()
    }

    fn channel_watchdog(&self, _channel: RawHandle, _command: u32, _trigger: u32) -> ApiResult<u32> {
        not_available()
    }

    fn channel_host_state(
        &self,
        _channel: RawHandle,
        _command: u32,
        _state: u32,
        _timeout_ms: u32,
    ) -> ApiResult<u32> {
        not_available()
    }

    fn channel_bus_state(
        &self,
        _channel: RawHandle,
        _command: u32,
        _state: u32,
        _timeout_ms: u32,
    ) -> ApiResult<u32> {
        not_available()
    }

    fn channel_io_info(
        &self,
        _channel: RawHandle,
        _command: u32,
        _area: u32,
        _data: &mut [u8],
    ) -> ApiResult<()> {
        not_available()
    }

    fn channel_io_read(
        &self,
        _channel: RawHandle,
        _area: u32,
        _offset: u32,
        _data: &mut [u8],
        _timeout_ms: u32,
    ) -> ApiResult<()> {
        not_available()
    }

    fn channel_io_write(
        &self,
        _channel: RawHandle,
        _area: u32,
        _offset: u32,
        _data: &[u8],
        _timeout_ms: u32,
    ) -> ApiResult<()> {
        not_available()
    }

    fn channel_io_read_send_data(
        &self,
        _channel: RawHandle,
        _area: u32,
        _offset: u32,
        _data: &mut [u8],
    ) -> ApiResult<()> {
        not_available()
    }

    /// Block access; `command` selects read or write, `data` is the block
    /// window either way.
    fn channel_control_block(
        &self,
        _channel: RawHandle,
        _command: u32,
        _offset: u32,
        _data: &mut [u8],
    ) -> ApiResult<()> {
        not_available()
    }

    fn channel_status_block(
        &self,
        _channel: RawHandle,
        _command: u32,
        _offset: u32,
        _data: &mut [u8],
    ) -> ApiResult<()> {
        not_available()
    }

    fn channel_extended_status_block(
        &self,
        _channel: RawHandle,
        _command: u32,
        _offset: u32,
        _data: &mut [u8],
    ) -> ApiResult<()> {
        not_available()
    }

    fn channel_find_first_file(
        &self,
        _channel: RawHandle,
        _entry: &mut DirectoryEntry,
    ) -> ApiResult<()> {
        not_available()
    }

    fn channel_find_next_file(
        &self,
        _channel: RawHandle,
        _entry: &mut DirectoryEntry,
    ) -> ApiResult<()> {
        not_available()
    }
}
