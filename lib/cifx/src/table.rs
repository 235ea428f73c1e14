//! The device table: every board known to the driver, its system-device
//! slot and its channel slots, with reference-counted opens.
//!
//! The table is built once by enumerating the driver and is read-mostly
//! afterwards; only the open counters change, and only from the dispatcher
//! thread.

use crate::driver::{DriverApi, RawHandle};
use crate::status::{ApiError, ApiResult};
use crate::types::BoardInformation;
use marshaller::logging;
use std::sync::Arc;

/// An openable slot: a system device or one communication channel.
/// The library handle is live exactly while `open_count > 0`.
#[derive(Debug, Default)]
pub struct SlotState {
    pub raw: RawHandle,
    pub open_count: u32,
}

#[derive(Debug, Default)]
pub struct ChannelSlot {
    pub state: SlotState,
    /// Set when the channel answered the enumeration probe at startup.
    pub valid: bool,
}

pub struct DeviceEntry {
    pub board: u32,
    pub info: BoardInformation,
    pub valid: bool,
    pub sysdevice: SlotState,
    pub channels: Vec<ChannelSlot>,
}

/// Driver connection plus the device table built from it.
pub struct Instance {
    pub driver: Arc<dyn DriverApi>,
    pub driver_handle: RawHandle,
    pub driver_open_count: u32,
    pub devices: Vec<DeviceEntry>,
}

impl Instance {
    /// Open the driver and enumerate boards and channels into the table.
    pub fn new(driver: Arc<dyn DriverApi>, log: &logging::Logger) -> ApiResult<Instance> {
        let driver_handle = driver
            .driver_open()
            .map_err(|_| ApiError::DRIVER_NOT_LOADED)?;
        let info = driver
            .driver_get_information(driver_handle)
            .map_err(|_| ApiError::DRIVER_NOT_LOADED)?;

        let mut devices = Vec::with_capacity(info.board_count as usize);

        for board in 0..info.board_count {
            let board_info = match driver.driver_enum_boards(driver_handle, board) {
                Ok(board_info) => board_info,
                Err(err) => {
                    logging::warn!(log, "board enumeration failed";
                                   "board" => board, "status" => %err);
                    devices.push(DeviceEntry {
                        board,
                        info: BoardInformation::default(),
                        valid: false,
                        sysdevice: SlotState::default(),
                        channels: Vec::new(),
                    });
                    continue;
                }
            };

            let mut channels = Vec::with_capacity(board_info.channel_count as usize);
            for channel in 0..board_info.channel_count {
                let valid = driver
                    .driver_enum_channels(driver_handle, board, channel)
                    .is_ok();
                channels.push(ChannelSlot {
                    state: SlotState::default(),
                    valid,
                });
            }

            logging::debug!(log, "board registered";
                            "board" => board,
                            "name" => &board_info.name,
                            "channels" => board_info.channel_count);

            devices.push(DeviceEntry {
                board,
                info: board_info,
                valid: true,
                sysdevice: SlotState::default(),
                channels,
            });
        }

        Ok(Instance {
            driver,
            driver_handle,
            driver_open_count: 0,
            devices,
        })
    }

    /// Look a board up by name or alias, case-insensitively.
    pub fn find_device(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|device| {
            device.valid
                && (device.info.name.eq_ignore_ascii_case(name)
                    || (!device.info.alias.is_empty()
                        && device.info.alias.eq_ignore_ascii_case(name)))
        })
    }

    /// Close every open slot and the driver itself.
    pub fn close_all(&mut self, log: &logging::Logger) {
        for device in &mut self.devices {
            if device.sysdevice.open_count > 0 {
                if let Err(err) = self.driver.sysdevice_close(device.sysdevice.raw) {
                    logging::warn!(log, "system device close failed";
                                   "board" => device.board, "status" => %err);
                }
                device.sysdevice = SlotState::default();
            }

            for (number, channel) in device.channels.iter_mut().enumerate() {
                if channel.state.open_count > 0 {
                    if let Err(err) = self.driver.channel_close(channel.state.raw) {
                        logging::warn!(log, "channel close failed";
                                       "board" => device.board,
                                       "channel" => number,
                                       "status" => %err);
                    }
                    channel.state = SlotState::default();
                }
            }
        }

        if let Err(err) = self.driver.driver_close(self.driver_handle) {
            logging::warn!(log, "driver close failed"; "status" => %err);
        }
        self.driver_open_count = 0;
    }
}
