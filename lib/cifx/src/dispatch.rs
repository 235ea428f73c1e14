//! The marshaller-frame dispatcher: decodes the call header of an incoming
//! frame, routes it to one of the four remote object types and writes the
//! reply into the same buffer.
//!
//! Every method validates the handle against the device table and the
//! declared payload size against the request shape before the driver is
//! touched; validation failures never reach the driver.

use crate::driver::DriverApi;
use crate::handle::{Handle, ObjectType, SYSTEM_CHANNEL};
use crate::status::{status_of, ApiError, ApiResult};
use crate::table::Instance;
use crate::types::{
    read_fixed_str, BoardInformation, ChannelInformation, DirectoryEntry, DriverInformation,
    MarshalHeader, Packet, CMD_READ_DATA, CMD_WRITE_DATA, MARSHAL_HEADER_SIZE, NAME_LEN,
    PACKET_HEADER_SIZE, SEQ_REQUEST,
};
use byteorder::{ByteOrder, LittleEndian};
use marshaller::frame::DT_MARSHAL;
use marshaller::{logging, Buffer, Marshaller, TransportHandler};
use std::sync::{Arc, Mutex};

/// Version reported by the class factory. The remote driver side insists on
/// 0.900; newer servers keep reporting it for compatibility.
pub const SERVER_API_VERSION: u32 = 0x0009_0000;

/// Method selectors per object type.
mod method {
    pub mod class_factory {
        pub const SERVER_VERSION: u32 = 0x00;
        pub const CREATE_INSTANCE: u32 = 0x01;
    }

    pub mod driver {
        pub const OPEN: u32 = 0x01;
        pub const CLOSE: u32 = 0x02;
        pub const GET_INFORMATION: u32 = 0x03;
        pub const ERROR_DESCRIPTION: u32 = 0x04;
        pub const ENUM_BOARDS: u32 = 0x05;
        pub const ENUM_CHANNELS: u32 = 0x06;
        pub const OPEN_CHANNEL: u32 = 0x08;
        pub const OPEN_SYSDEVICE: u32 = 0x09;
        pub const RESTART_DEVICE: u32 = 0x10;
    }

    pub mod sysdevice {
        pub const CLOSE: u32 = 0x01;
        pub const INFO: u32 = 0x02;
        pub const RESET: u32 = 0x03;
        pub const GET_MBX_STATE: u32 = 0x04;
        pub const PUT_PACKET: u32 = 0x05;
        pub const GET_PACKET: u32 = 0x06;
        pub const DOWNLOAD: u32 = 0x07;
        pub const FIND_FIRST_FILE: u32 = 0x08;
        pub const FIND_NEXT_FILE: u32 = 0x09;
        pub const UPLOAD: u32 = 0x10;
        pub const RESET_EX: u32 = 0x11;
    }

    pub mod channel {
        pub const CLOSE: u32 = 0x01;
        pub const DOWNLOAD: u32 = 0x02;
        pub const GET_MBX_STATE: u32 = 0x03;
        pub const PUT_PACKET: u32 = 0x04;
        pub const GET_PACKET: u32 = 0x05;
        pub const GET_SEND_PACKET: u32 = 0x06;
        pub const CONFIG_LOCK: u32 = 0x07;
        pub const RESET: u32 = 0x08;
        pub const INFO: u32 = 0x09;
        pub const WATCHDOG: u32 = 0x10;
        pub const HOST_STATE: u32 = 0x11;
        pub const IO_READ: u32 = 0x12;
        pub const IO_WRITE: u32 = 0x13;
        pub const IO_READ_SEND_DATA: u32 = 0x14;
        pub const BUS_STATE: u32 = 0x15;
        pub const CONTROL_BLOCK: u32 = 0x16;
        pub const STATUS_BLOCK: u32 = 0x17;
        pub const EXTENDED_STATUS_BLOCK: u32 = 0x18;
        pub const USER_BLOCK: u32 = 0x19;
        pub const FIND_FIRST_FILE: u32 = 0x20;
        pub const FIND_NEXT_FILE: u32 = 0x21;
        pub const UPLOAD: u32 = 0x22;
        pub const IO_INFO: u32 = 0x23;
    }
}

/// The transport handler for marshalled device API calls.
pub struct CifxTransport {
    inner: Mutex<Instance>,
    log: logging::Logger,
}

impl CifxTransport {
    /// Build the device table from the driver and register the handler for
    /// the marshaller data type on the core.
    pub fn install<'a, L: Into<Option<&'a logging::Logger>>>(
        core: &Marshaller,
        driver: Arc<dyn DriverApi>,
        log: L,
    ) -> ApiResult<Arc<CifxTransport>> {
        let log = logging::child_or_discard(log);
        let instance = Instance::new(driver, &log)?;

        let transport = Arc::new(CifxTransport {
            inner: Mutex::new(instance),
            log,
        });

        core.register_transport(DT_MARSHAL, transport.clone())
            .map_err(|_| ApiError::FUNCTION_FAILED)?;

        Ok(transport)
    }

    /// Decode, dispatch and answer one frame in place.
    fn handle_frame(&self, buffer: &mut Buffer) {
        let used = buffer.used();

        if used < MARSHAL_HEADER_SIZE || buffer.capacity() < MARSHAL_HEADER_SIZE {
            // Not even a call header; answer with a bare error header if
            // there is room for one.
            let header = MarshalHeader {
                error: ApiError::INVALID_PARAMETER.code(),
                ..MarshalHeader::default()
            };
            if buffer.capacity() >= MARSHAL_HEADER_SIZE {
                header.encode(&mut buffer.area_mut()[..MARSHAL_HEADER_SIZE]);
                buffer.set_used(MARSHAL_HEADER_SIZE);
            } else {
                buffer.set_used(0);
            }
            return;
        }

        let mut header = MarshalHeader::decode(&buffer.payload()[..MARSHAL_HEADER_SIZE]);

        let result = if header.data_size as usize > used - MARSHAL_HEADER_SIZE {
            header.data_size = 0;
            Err(ApiError::INVALID_PARAMETER)
        } else {
            let mut instance = self.inner.lock().unwrap();
            let body = &mut buffer.area_mut()[MARSHAL_HEADER_SIZE..];
            self.route(&mut instance, &mut header, body)
        };

        header.error = status_of(&result);
        // Turn the sequence word into an answer, keeping the correlation
        // number intact.
        header.sequence &= !SEQ_REQUEST;

        logging::trace!(self.log, "call dispatched";
                        "handle" => header.handle,
                        "method" => header.method_id,
                        "error" => header.error,
                        "reply_size" => header.data_size);

        header.encode(&mut buffer.area_mut()[..MARSHAL_HEADER_SIZE]);
        buffer.set_used(MARSHAL_HEADER_SIZE + header.data_size as usize);
    }

    fn route(
        &self,
        instance: &mut Instance,
        header: &mut MarshalHeader,
        body: &mut [u8],
    ) -> ApiResult<()> {
        let handle = Handle::from_raw(header.handle);

        // Handle 0 addresses the class factory as well.
        if header.handle == 0
            || (handle.is_valid() && handle.object_type() == Some(ObjectType::ClassFactory))
        {
            return self.class_factory(header, body);
        }

        if !handle.is_valid() {
            header.data_size = 0;
            return Err(ApiError::INVALID_HANDLE);
        }

        match handle.object_type() {
            Some(ObjectType::Driver) => self.driver_object(instance, header, body),
            Some(ObjectType::Sysdevice) => self.sysdevice_object(instance, handle, header, body),
            Some(ObjectType::Channel) => self.channel_object(instance, handle, header, body),
            _ => {
                header.data_size = 0;
                Err(ApiError::INVALID_HANDLE)
            }
        }
    }
}

/// Class factory methods.
impl CifxTransport {
    fn class_factory(&self, header: &mut MarshalHeader, body: &mut [u8]) -> ApiResult<()> {
        match header.method_id {
            method::class_factory::SERVER_VERSION => {
                header.data_size = 0;
                if body.len() < 4 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                LittleEndian::write_u32(&mut body[..4], SERVER_API_VERSION);
                header.data_size = 4;
                Ok(())
            }

            method::class_factory::CREATE_INSTANCE => {
                let request = header.data_size;
                header.data_size = 0;

                if request != 4 || body.len() < 4 {
                    return Err(ApiError::INVALID_PARAMETER);
                }

                let requested = LittleEndian::read_u32(&body[..4]);
                let object_type = if requested <= 0xFF {
                    ObjectType::from_code(requested as u8)
                } else {
                    None
                };

                // Only the factory itself and the driver singleton can be
                // instantiated directly.
                let handle = match object_type {
                    Some(ObjectType::ClassFactory) => Handle::new(ObjectType::ClassFactory, 0, 0),
                    Some(ObjectType::Driver) => Handle::new(ObjectType::Driver, 0, 0),
                    _ => return Err(ApiError::INVALID_PARAMETER),
                };

                LittleEndian::write_u32(&mut body[..4], handle.raw());
                header.data_size = 4;
                Ok(())
            }

            _ => {
                header.data_size = 0;
                Err(ApiError::INVALID_PARAMETER)
            }
        }
    }
}

/// Driver object methods.
impl CifxTransport {
    fn driver_object(
        &self,
        instance: &mut Instance,
        header: &mut MarshalHeader,
        body: &mut [u8],
    ) -> ApiResult<()> {
        let request = header.data_size as usize;

        match header.method_id {
            method::driver::OPEN => {
                header.data_size = 0;
                instance.driver_open_count += 1;
                Ok(())
            }

            method::driver::CLOSE => {
                header.data_size = 0;
                if instance.driver_open_count == 0 {
                    return Err(ApiError::NOT_OPENED);
                }
                instance.driver_open_count -= 1;
                Ok(())
            }

            method::driver::GET_INFORMATION => {
                header.data_size = 0;
                if request < 4 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let size = LittleEndian::read_u32(&body[..4]) as usize;

                let info = instance.driver.driver_get_information(instance.driver_handle)?;
                let mut encoded = [0u8; DriverInformation::SIZE];
                info.encode(&mut encoded);

                let copy = size.min(DriverInformation::SIZE);
                if body.len() < copy {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                body[..copy].copy_from_slice(&encoded[..copy]);
                header.data_size = copy as u32;
                Ok(())
            }

            method::driver::ERROR_DESCRIPTION => {
                header.data_size = 0;
                Err(ApiError::FUNCTION_NOT_AVAILABLE)
            }

            method::driver::ENUM_BOARDS => {
                header.data_size = 0;
                if request != 8 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let board = LittleEndian::read_u32(&body[..4]);
                let size = LittleEndian::read_u32(&body[4..8]) as usize;

                let info = instance.driver.driver_enum_boards(instance.driver_handle, board)?;
                let mut encoded = [0u8; BoardInformation::SIZE];
                info.encode(&mut encoded);

                let copy = size.min(BoardInformation::SIZE);
                if body.len() < copy {
                    return Err(ApiError::BUFFER_TOO_SHORT);
                }
                body[..copy].copy_from_slice(&encoded[..copy]);
                header.data_size = copy as u32;
                Ok(())
            }

            method::driver::ENUM_CHANNELS => {
                header.data_size = 0;
                if request != 12 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let board = LittleEndian::read_u32(&body[..4]);
                let channel = LittleEndian::read_u32(&body[4..8]);
                let size = LittleEndian::read_u32(&body[8..12]) as usize;

                let info =
                    instance
                        .driver
                        .driver_enum_channels(instance.driver_handle, board, channel)?;
                let mut encoded = [0u8; ChannelInformation::SIZE];
                info.encode(&mut encoded);

                let copy = size.min(ChannelInformation::SIZE);
                if body.len() < copy {
                    return Err(ApiError::BUFFER_TOO_SHORT);
                }
                body[..copy].copy_from_slice(&encoded[..copy]);
                header.data_size = copy as u32;
                Ok(())
            }

            method::driver::OPEN_CHANNEL => self.open_channel(instance, header, body),

            method::driver::OPEN_SYSDEVICE => self.open_sysdevice(instance, header, body),

            method::driver::RESTART_DEVICE => {
                header.data_size = 0;
                if request != NAME_LEN {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let name = read_fixed_str(&body[..NAME_LEN]);
                instance
                    .driver
                    .driver_restart_device(instance.driver_handle, &name)
            }

            _ => {
                header.data_size = 0;
                Err(ApiError::INVALID_PARAMETER)
            }
        }
    }

    /// `xChannelOpen` carried by the driver object: board name length, name
    /// bytes and the channel number.
    fn open_channel(
        &self,
        instance: &mut Instance,
        header: &mut MarshalHeader,
        body: &mut [u8],
    ) -> ApiResult<()> {
        let request = header.data_size as usize;
        header.data_size = 0;

        if request < 8 {
            return Err(ApiError::INVALID_PARAMETER);
        }
        let name_len = LittleEndian::read_u32(&body[..4]) as usize;
        if name_len == 0 || name_len > NAME_LEN || request != 8 + name_len {
            return Err(ApiError::INVALID_PARAMETER);
        }

        let name = read_fixed_str(&body[4..4 + name_len]);
        let channel = LittleEndian::read_u32(&body[4 + name_len..8 + name_len]);

        let device_idx = instance.find_device(&name).ok_or(ApiError::INVALID_BOARD)?;
        let board = instance.devices[device_idx].board;

        if channel as usize >= instance.devices[device_idx].channels.len() {
            return Err(ApiError::INVALID_CHANNEL);
        }

        {
            let driver = instance.driver.clone();
            let driver_handle = instance.driver_handle;
            let slot = &mut instance.devices[device_idx].channels[channel as usize].state;

            if slot.open_count > 0 {
                slot.open_count += 1;
            } else {
                slot.raw = driver.channel_open(driver_handle, &name, channel)?;
                slot.open_count = 1;
            }
        }

        if body.len() < 4 {
            return Err(ApiError::INVALID_PARAMETER);
        }
        let handle = Handle::new(ObjectType::Channel, board as u8, channel as u8);
        LittleEndian::write_u32(&mut body[..4], handle.raw());
        header.data_size = 4;
        Ok(())
    }

    /// `xSysdeviceOpen` carried by the driver object: board name length and
    /// name bytes.
    fn open_sysdevice(
        &self,
        instance: &mut Instance,
        header: &mut MarshalHeader,
        body: &mut [u8],
    ) -> ApiResult<()> {
        let request = header.data_size as usize;
        header.data_size = 0;

        if request < 4 {
            return Err(ApiError::INVALID_PARAMETER);
        }
        let name_len = LittleEndian::read_u32(&body[..4]) as usize;
        if name_len == 0 || name_len > NAME_LEN || request != 4 + name_len {
            return Err(ApiError::INVALID_PARAMETER);
        }

        let name = read_fixed_str(&body[4..4 + name_len]);

        let device_idx = instance.find_device(&name).ok_or(ApiError::INVALID_BOARD)?;
        let board = instance.devices[device_idx].board;

        {
            let driver = instance.driver.clone();
            let driver_handle = instance.driver_handle;
            let slot = &mut instance.devices[device_idx].sysdevice;

            if slot.open_count > 0 {
                slot.open_count += 1;
            } else {
                slot.raw = driver.sysdevice_open(driver_handle, &name)?;
                slot.open_count = 1;
            }
        }

        if body.len() < 4 {
            return Err(ApiError::INVALID_PARAMETER);
        }
        let handle = Handle::new(ObjectType::Sysdevice, board as u8, SYSTEM_CHANNEL);
        LittleEndian::write_u32(&mut body[..4], handle.raw());
        header.data_size = 4;
        Ok(())
    }
}

/// System device methods.
impl CifxTransport {
    fn sysdevice_object(
        &self,
        instance: &mut Instance,
        handle: Handle,
        header: &mut MarshalHeader,
        body: &mut [u8],
    ) -> ApiResult<()> {
        let index = handle.index() as usize;

        if index >= instance.devices.len() || handle.subindex() != SYSTEM_CHANNEL {
            header.data_size = 0;
            return Err(ApiError::INVALID_HANDLE);
        }
        if instance.devices[index].sysdevice.open_count == 0 {
            header.data_size = 0;
            return Err(ApiError::CHANNEL_NOT_INITIALIZED);
        }

        let driver = instance.driver.clone();
        let raw = instance.devices[index].sysdevice.raw;
        let request = header.data_size as usize;

        match header.method_id {
            method::sysdevice::CLOSE => {
                header.data_size = 0;
                let slot = &mut instance.devices[index].sysdevice;

                if slot.open_count > 1 {
                    slot.open_count -= 1;
                } else {
                    driver.sysdevice_close(slot.raw)?;
                    slot.open_count = 0;
                    slot.raw = 0;
                }
                Ok(())
            }

            method::sysdevice::INFO => {
                header.data_size = 0;
                if request < 8 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let command = LittleEndian::read_u32(&body[..4]);
                let size = LittleEndian::read_u32(&body[4..8]) as usize;
                let limit = size.min(body.len());

                let result = driver.sysdevice_info(raw, command, &mut body[..limit]);
                if result.is_ok() || result == Err(ApiError::BUFFER_TOO_SHORT) {
                    header.data_size = limit as u32;
                }
                result
            }

            method::sysdevice::RESET => {
                header.data_size = 0;
                if request != 4 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let timeout = LittleEndian::read_u32(&body[..4]);
                driver.sysdevice_reset(raw, timeout)
            }

            method::sysdevice::RESET_EX => {
                header.data_size = 0;
                if request != 8 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let timeout = LittleEndian::read_u32(&body[..4]);
                let mode = LittleEndian::read_u32(&body[4..8]);
                driver.sysdevice_reset_ex(raw, timeout, mode)
            }

            method::sysdevice::GET_MBX_STATE => {
                header.data_size = 0;
                let (recv, send) = driver.sysdevice_get_mbx_state(raw)?;
                if body.len() < 8 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                LittleEndian::write_u32(&mut body[..4], recv);
                LittleEndian::write_u32(&mut body[4..8], send);
                header.data_size = 8;
                Ok(())
            }

            method::sysdevice::PUT_PACKET => {
                put_packet(header, body, |packet, timeout| {
                    driver.sysdevice_put_packet(raw, packet, timeout)
                })
            }

            method::sysdevice::GET_PACKET => {
                get_packet(header, body, |size, timeout| {
                    driver.sysdevice_get_packet(raw, size, timeout)
                })
            }

            method::sysdevice::FIND_FIRST_FILE => {
                find_file_with_channel(header, body, |channel, entry| {
                    driver.sysdevice_find_first_file(raw, channel, entry)
                })
            }

            method::sysdevice::FIND_NEXT_FILE => {
                find_file_with_channel(header, body, |channel, entry| {
                    driver.sysdevice_find_next_file(raw, channel, entry)
                })
            }

            method::sysdevice::DOWNLOAD | method::sysdevice::UPLOAD => {
                header.data_size = 0;
                Err(ApiError::FUNCTION_NOT_AVAILABLE)
            }

            _ => {
                header.data_size = 0;
                Err(ApiError::INVALID_PARAMETER)
            }
        }
    }
}

/// Channel methods.
impl CifxTransport {
    fn channel_object(
        &self,
        instance: &mut Instance,
        handle: Handle,
        header: &mut MarshalHeader,
        body: &mut [u8],
    ) -> ApiResult<()> {
        let index = handle.index() as usize;
        let subindex = handle.subindex() as usize;

        let in_bounds = index < instance.devices.len()
            && instance.devices[index].valid
            && subindex < instance.devices[index].channels.len();
        if !in_bounds {
            header.data_size = 0;
            return Err(ApiError::INVALID_HANDLE);
        }
        if instance.devices[index].channels[subindex].state.open_count == 0 {
            header.data_size = 0;
            return Err(ApiError::CHANNEL_NOT_INITIALIZED);
        }

        let driver = instance.driver.clone();
        let raw = instance.devices[index].channels[subindex].state.raw;
        let request = header.data_size as usize;

        match header.method_id {
            method::channel::CLOSE => {
                header.data_size = 0;
                let slot = &mut instance.devices[index].channels[subindex].state;

                if slot.open_count > 1 {
                    slot.open_count -= 1;
                } else {
                    driver.channel_close(slot.raw)?;
                    slot.open_count = 0;
                    slot.raw = 0;
                }
                Ok(())
            }

            method::channel::GET_MBX_STATE => {
                header.data_size = 0;
                let (recv, send) = driver.channel_get_mbx_state(raw)?;
                if body.len() < 8 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                LittleEndian::write_u32(&mut body[..4], recv);
                LittleEndian::write_u32(&mut body[4..8], send);
                header.data_size = 8;
                Ok(())
            }

            method::channel::PUT_PACKET => {
                put_packet(header, body, |packet, timeout| {
                    driver.channel_put_packet(raw, packet, timeout)
                })
            }

            method::channel::GET_PACKET => {
                get_packet(header, body, |size, timeout| {
                    driver.channel_get_packet(raw, size, timeout)
                })
            }

            method::channel::GET_SEND_PACKET => {
                header.data_size = 0;
                if request != 4 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let size = LittleEndian::read_u32(&body[..4]) as usize;
                let limit = size.min(body.len());

                let packet = driver.channel_get_send_packet(raw, limit as u32)?;
                write_packet_reply(header, body, &packet, limit)
            }

            method::channel::CONFIG_LOCK => {
                header.data_size = 0;
                if request != 12 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let command = LittleEndian::read_u32(&body[..4]);
                let state = LittleEndian::read_u32(&body[4..8]);
                let timeout = LittleEndian::read_u32(&body[8..12]);

                let result = driver.channel_config_lock(raw, command, state, timeout);
                write_state_reply(header, body, result, state)
            }

            method::channel::RESET => {
                header.data_size = 0;
                if request != 8 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let mode = LittleEndian::read_u32(&body[..4]);
                let timeout = LittleEndian::read_u32(&body[4..8]);
                driver.channel_reset(raw, mode, timeout)
            }

            method::channel::INFO => {
                header.data_size = 0;
                if request < 4 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let size = LittleEndian::read_u32(&body[..4]) as usize;
                let limit = size.min(body.len());

                let result = driver.channel_info(raw, &mut body[..limit]);
                header.data_size = limit as u32;
                result
            }

            method::channel::WATCHDOG => {
                header.data_size = 0;
                if request != 8 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let command = LittleEndian::read_u32(&body[..4]);
                let trigger = LittleEndian::read_u32(&body[4..8]);

                let result = driver.channel_watchdog(raw, command, trigger);
                write_state_reply(header, body, result, trigger)
            }

            method::channel::HOST_STATE => {
                header.data_size = 0;
                if request != 12 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let command = LittleEndian::read_u32(&body[..4]);
                let state = LittleEndian::read_u32(&body[4..8]);
                let timeout = LittleEndian::read_u32(&body[8..12]);

                let result = driver.channel_host_state(raw, command, state, timeout);
                write_state_reply(header, body, result, state)
            }

            method::channel::BUS_STATE => {
                header.data_size = 0;
                if request != 12 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let command = LittleEndian::read_u32(&body[..4]);
                let state = LittleEndian::read_u32(&body[4..8]);
                let timeout = LittleEndian::read_u32(&body[8..12]);

                let result = driver.channel_bus_state(raw, command, state, timeout);
                write_state_reply(header, body, result, state)
            }

            method::channel::IO_INFO => {
                header.data_size = 0;
                if request != 12 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let command = LittleEndian::read_u32(&body[..4]);
                let area = LittleEndian::read_u32(&body[4..8]);
                let data_len = LittleEndian::read_u32(&body[8..12]) as usize;
                let limit = data_len.min(body.len());

                let result = driver.channel_io_info(raw, command, area, &mut body[..limit]);
                if result.is_ok() {
                    header.data_size = limit as u32;
                }
                result
            }

            method::channel::IO_READ => {
                header.data_size = 0;
                if request != 16 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let area = LittleEndian::read_u32(&body[..4]);
                let offset = LittleEndian::read_u32(&body[4..8]);
                let timeout = LittleEndian::read_u32(&body[8..12]);
                let data_len = LittleEndian::read_u32(&body[12..16]) as usize;
                let limit = data_len.min(body.len());

                let result = driver.channel_io_read(raw, area, offset, &mut body[..limit], timeout);
                // A missing communication flag still carries the process
                // image, so the data is returned along with the status.
                if result.is_ok() || result == Err(ApiError::NO_COM_FLAG) {
                    header.data_size = limit as u32;
                }
                result
            }

            method::channel::IO_WRITE => {
                header.data_size = 0;
                if request < 16 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let area = LittleEndian::read_u32(&body[..4]);
                let offset = LittleEndian::read_u32(&body[4..8]);
                let timeout = LittleEndian::read_u32(&body[8..12]);
                let data_len = LittleEndian::read_u32(&body[12..16]) as usize;

                if request != 16 + data_len {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let data = body[16..16 + data_len].to_vec();
                driver.channel_io_write(raw, area, offset, &data, timeout)
            }

            method::channel::IO_READ_SEND_DATA => {
                header.data_size = 0;
                if request != 12 {
                    return Err(ApiError::INVALID_PARAMETER);
                }
                let area = LittleEndian::read_u32(&body[..4]);
                let offset = LittleEndian::read_u32(&body[4..8]);
                let data_len = LittleEndian::read_u32(&body[8..12]) as usize;
                let limit = data_len.min(body.len());

                let result = driver.channel_io_read_send_data(raw, area, offset, &mut body[..limit]);
                if result.is_ok() || result == Err(ApiError::NO_COM_FLAG) {
                    header.data_size = limit as u32;
                }
                result
            }

            method::channel::CONTROL_BLOCK => {
                block_access(header, body, |command, offset, data| {
                    driver.channel_control_block(raw, command, offset, data)
                })
            }

            method::channel::STATUS_BLOCK => {
                block_access(header, body, |command, offset, data| {
                    driver.channel_status_block(raw, command, offset, data)
                })
            }

            method::channel::EXTENDED_STATUS_BLOCK => {
                block_access(header, body, |command, offset, data| {
                    driver.channel_extended_status_block(raw, command, offset, data)
                })
            }

            method::channel::FIND_FIRST_FILE => {
                find_file(header, body, |entry| driver.channel_find_first_file(raw, entry))
            }

            method::channel::FIND_NEXT_FILE => {
                find_file(header, body, |entry| driver.channel_find_next_file(raw, entry))
            }

            method::channel::USER_BLOCK
            | method::channel::DOWNLOAD
            | method::channel::UPLOAD => {
                header.data_size = 0;
                Err(ApiError::FUNCTION_NOT_AVAILABLE)
            }

            _ => {
                header.data_size = 0;
                Err(ApiError::INVALID_COMMAND)
            }
        }
    }
}

/// Shared payload plumbing for the packet and block methods.

fn put_packet(
    header: &mut MarshalHeader,
    body: &mut [u8],
    put: impl FnOnce(&Packet, u32) -> ApiResult<()>,
) -> ApiResult<()> {
    let request = header.data_size as usize;
    header.data_size = 0;

    if request < 8 {
        return Err(ApiError::INVALID_PARAMETER);
    }
    let send_size = LittleEndian::read_u32(&body[..4]) as usize;
    if send_size < PACKET_HEADER_SIZE || request != 8 + send_size {
        return Err(ApiError::INVALID_PARAMETER);
    }

    let packet = Packet::decode(&body[4..4 + send_size])?;
    let timeout = LittleEndian::read_u32(&body[4 + send_size..8 + send_size]);

    put(&packet, timeout)
}

fn get_packet(
    header: &mut MarshalHeader,
    body: &mut [u8],
    get: impl FnOnce(u32, u32) -> ApiResult<Packet>,
) -> ApiResult<()> {
    let request = header.data_size as usize;
    header.data_size = 0;

    if request != 8 {
        return Err(ApiError::INVALID_PARAMETER);
    }
    let size = LittleEndian::read_u32(&body[..4]) as usize;
    let timeout = LittleEndian::read_u32(&body[4..8]);
    let limit = size.min(body.len());

    let packet = get(limit as u32, timeout)?;
    write_packet_reply(header, body, &packet, limit)
}

/// Copy a received packet into the reply area, truncating to `limit` when
/// the mailbox handed out more than the caller asked for.
fn write_packet_reply(
    header: &mut MarshalHeader,
    body: &mut [u8],
    packet: &Packet,
    limit: usize,
) -> ApiResult<()> {
    let encoded_len = packet.encoded_len();

    if encoded_len > limit {
        let mut full = vec![0u8; encoded_len];
        packet.encode(&mut full);
        body[..limit].copy_from_slice(&full[..limit]);
        header.data_size = limit as u32;
        return Err(ApiError::BUFFER_TOO_SHORT);
    }

    packet.encode(&mut body[..encoded_len]);
    header.data_size = encoded_len as u32;
    Ok(())
}

/// Reply with a single state word; on failure the request value is echoed
/// so the reply shape stays fixed.
fn write_state_reply(
    header: &mut MarshalHeader,
    body: &mut [u8],
    result: ApiResult<u32>,
    fallback: u32,
) -> ApiResult<()> {
    if body.len() < 4 {
        return Err(ApiError::INVALID_PARAMETER);
    }

    let value = *result.as_ref().unwrap_or(&fallback);
    LittleEndian::write_u32(&mut body[..4], value);
    header.data_size = 4;

    result.map(|_| ())
}

fn block_access(
    header: &mut MarshalHeader,
    body: &mut [u8],
    call: impl FnOnce(u32, u32, &mut [u8]) -> ApiResult<()>,
) -> ApiResult<()> {
    let request = header.data_size as usize;
    header.data_size = 0;

    if request < 12 {
        return Err(ApiError::INVALID_PARAMETER);
    }
    let command = LittleEndian::read_u32(&body[..4]);
    let offset = LittleEndian::read_u32(&body[4..8]);
    let data_len = LittleEndian::read_u32(&body[8..12]) as usize;

    match command {
        CMD_READ_DATA => {
            let limit = data_len.min(body.len());
            let result = call(command, offset, &mut body[..limit]);
            if result.is_ok() || result == Err(ApiError::BUFFER_TOO_SHORT) {
                header.data_size = limit as u32;
            }
            result
        }

        CMD_WRITE_DATA => {
            if request != 12 + data_len {
                return Err(ApiError::INVALID_PARAMETER);
            }
            let mut data = body[12..12 + data_len].to_vec();
            call(command, offset, &mut data)
        }

        _ => Err(ApiError::INVALID_PARAMETER),
    }
}

/// File enumeration with a leading channel number (system device flavour).
fn find_file_with_channel(
    header: &mut MarshalHeader,
    body: &mut [u8],
    call: impl FnOnce(u32, &mut DirectoryEntry) -> ApiResult<()>,
) -> ApiResult<()> {
    let request = header.data_size as usize;
    header.data_size = 0;

    if request != 4 + DirectoryEntry::SIZE {
        return Err(ApiError::INVALID_PARAMETER);
    }
    let channel = LittleEndian::read_u32(&body[..4]);
    let mut entry = DirectoryEntry::decode(&body[4..4 + DirectoryEntry::SIZE])?;

    call(channel, &mut entry)?;

    entry.encode(&mut body[..DirectoryEntry::SIZE]);
    header.data_size = DirectoryEntry::SIZE as u32;
    Ok(())
}

/// File enumeration on a communication channel.
fn find_file(
    header: &mut MarshalHeader,
    body: &mut [u8],
    call: impl FnOnce(&mut DirectoryEntry) -> ApiResult<()>,
) -> ApiResult<()> {
    let request = header.data_size as usize;
    header.data_size = 0;

    if request != DirectoryEntry::SIZE {
        return Err(ApiError::INVALID_PARAMETER);
    }
    let mut entry = DirectoryEntry::decode(&body[..DirectoryEntry::SIZE])?;

    call(&mut entry)?;

    entry.encode(&mut body[..DirectoryEntry::SIZE]);
    header.data_size = DirectoryEntry::SIZE as u32;
    Ok(())
}

impl TransportHandler for CifxTransport {
    fn handle(&self, _core: &Marshaller, buffer: &mut Buffer) {
        self.handle_frame(buffer);
    }

    fn deinit(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.close_all(&self.log);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBoard, SimDriver};
    use crate::types::mailbox;
    use crate::types::PacketHeader;

    fn make_transport() -> (Arc<SimDriver>, CifxTransport) {
        let driver = Arc::new(SimDriver::new(vec![
            SimBoard {
                name: "cifX0".into(),
                alias: "plc".into(),
                channel_count: 2,
                ..SimBoard::default()
            },
            SimBoard {
                name: "cifX1".into(),
                channel_count: 1,
                ..SimBoard::default()
            },
        ]));

        let log = logging::child_or_discard(None);
        let instance = Instance::new(driver.clone(), &log).unwrap();

        let transport = CifxTransport {
            inner: Mutex::new(instance),
            log,
        };

        (driver, transport)
    }

    fn call(
        transport: &CifxTransport,
        handle: u32,
        method_id: u32,
        data: &[u8],
    ) -> (MarshalHeader, Vec<u8>) {
        let mut buffer = Buffer::detached(2048);
        let header = MarshalHeader {
            handle,
            method_id,
            sequence: SEQ_REQUEST | 5 << 16,
            error: 0,
            data_size: data.len() as u32,
        };

        {
            let area = buffer.area_mut();
            header.encode(&mut area[..MARSHAL_HEADER_SIZE]);
            area[MARSHAL_HEADER_SIZE..MARSHAL_HEADER_SIZE + data.len()].copy_from_slice(data);
        }
        buffer.set_used(MARSHAL_HEADER_SIZE + data.len());

        transport.handle_frame(&mut buffer);

        let reply = MarshalHeader::decode(&buffer.payload()[..MARSHAL_HEADER_SIZE]);
        let body = buffer.payload()[MARSHAL_HEADER_SIZE..].to_vec();
        assert_eq!(body.len(), reply.data_size as usize);
        (reply, body)
    }

    fn u32le(value: u32) -> [u8; 4] {
        let mut out = [0u8; 4];
        LittleEndian::write_u32(&mut out, value);
        out
    }

    fn open_channel_req(name: &str, channel: u32) -> Vec<u8> {
        let name_len = name.len() + 1;
        let mut data = Vec::new();
        data.extend_from_slice(&u32le(name_len as u32));
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        data.extend_from_slice(&u32le(channel));
        data
    }

    fn open_sysdevice_req(name: &str) -> Vec<u8> {
        let name_len = name.len() + 1;
        let mut data = Vec::new();
        data.extend_from_slice(&u32le(name_len as u32));
        data.extend_from_slice(name.as_bytes());
        data.push(0);
        data
    }

    #[test]
    fn test_server_version() {
        let (_driver, transport) = make_transport();

        let (reply, body) = call(&transport, 0, method::class_factory::SERVER_VERSION, &[]);

        assert_eq!(reply.error, 0);
        assert_eq!(LittleEndian::read_u32(&body[..4]), SERVER_API_VERSION);
        // Answer bit cleared, correlation number kept.
        assert_eq!(reply.sequence, 5 << 16);
    }

    #[test]
    fn test_create_instance() {
        let (_driver, transport) = make_transport();

        let (reply, body) = call(
            &transport,
            0,
            method::class_factory::CREATE_INSTANCE,
            &u32le(ObjectType::Driver as u32),
        );

        assert_eq!(reply.error, 0);
        let handle = Handle::from_raw(LittleEndian::read_u32(&body[..4]));
        assert!(handle.is_valid());
        assert_eq!(handle.object_type(), Some(ObjectType::Driver));
    }

    #[test]
    fn test_create_instance_rejects_other_types() {
        let (_driver, transport) = make_transport();

        let (reply, _body) = call(
            &transport,
            0,
            method::class_factory::CREATE_INSTANCE,
            &u32le(ObjectType::Channel as u32),
        );

        assert_eq!(reply.error, ApiError::INVALID_PARAMETER.code());
        assert_eq!(reply.data_size, 0);
    }

    #[test]
    fn test_invalid_handle_rejected_without_driver_call() {
        let (driver, transport) = make_transport();

        // Not valid at all.
        let (reply, _) = call(&transport, 0x0000_0003, method::channel::GET_MBX_STATE, &[]);
        assert_eq!(reply.error, ApiError::INVALID_HANDLE.code());

        // Valid bit but unknown object type.
        let (reply, _) = call(&transport, 0x8000_0004, 1, &[]);
        assert_eq!(reply.error, ApiError::INVALID_HANDLE.code());

        // Channel index out of table bounds.
        let bogus = Handle::new(ObjectType::Channel, 9, 0).raw();
        let (reply, _) = call(&transport, bogus, method::channel::GET_MBX_STATE, &[]);
        assert_eq!(reply.error, ApiError::INVALID_HANDLE.code());

        // Channel subindex beyond the board's channel count.
        let bogus = Handle::new(ObjectType::Channel, 0, 7).raw();
        let (reply, _) = call(&transport, bogus, method::channel::GET_MBX_STATE, &[]);
        assert_eq!(reply.error, ApiError::INVALID_HANDLE.code());

        // Sysdevice must carry the system channel subindex.
        let bogus = Handle::new(ObjectType::Sysdevice, 0, 0).raw();
        let (reply, _) = call(&transport, bogus, method::sysdevice::GET_MBX_STATE, &[]);
        assert_eq!(reply.error, ApiError::INVALID_HANDLE.code());

        assert_eq!(driver.calls("channel_get_mbx_state"), 0);
        assert_eq!(driver.calls("sysdevice_get_mbx_state"), 0);
    }

    #[test]
    fn test_channel_not_initialized_before_open() {
        let (driver, transport) = make_transport();

        let handle = Handle::new(ObjectType::Channel, 0, 0).raw();
        let (reply, _) = call(&transport, handle, method::channel::GET_MBX_STATE, &[]);

        assert_eq!(reply.error, ApiError::CHANNEL_NOT_INITIALIZED.code());
        assert_eq!(driver.calls("channel_get_mbx_state"), 0);
    }

    #[test]
    fn test_driver_get_information() {
        let (_driver, transport) = make_transport();
        let driver_handle = Handle::new(ObjectType::Driver, 0, 0).raw();

        let (reply, body) = call(
            &transport,
            driver_handle,
            method::driver::GET_INFORMATION,
            &u32le(DriverInformation::SIZE as u32),
        );

        assert_eq!(reply.error, 0);
        assert_eq!(body.len(), DriverInformation::SIZE);
        assert_eq!(LittleEndian::read_u32(&body[32..36]), 2);
    }

    #[test]
    fn test_enum_boards_and_size_mismatch() {
        let (_driver, transport) = make_transport();
        let driver_handle = Handle::new(ObjectType::Driver, 0, 0).raw();

        let mut data = Vec::new();
        data.extend_from_slice(&u32le(0));
        data.extend_from_slice(&u32le(BoardInformation::SIZE as u32));
        let (reply, body) = call(&transport, driver_handle, method::driver::ENUM_BOARDS, &data);

        assert_eq!(reply.error, 0);
        assert_eq!(read_fixed_str(&body[4..20]), "cifX0");

        // Truncated request shape.
        let (reply, _) = call(&transport, driver_handle, method::driver::ENUM_BOARDS, &data[..5]);
        assert_eq!(reply.error, ApiError::INVALID_PARAMETER.code());
        assert_eq!(reply.data_size, 0);
    }

    #[test]
    fn test_open_channel_and_mbx_state() {
        let (driver, transport) = make_transport();

        let (reply, body) = call(
            &transport,
            Handle::new(ObjectType::Driver, 0, 0).raw(),
            method::driver::OPEN_CHANNEL,
            &open_channel_req("cifX0", 0),
        );
        assert_eq!(reply.error, 0);

        let channel = Handle::from_raw(LittleEndian::read_u32(&body[..4]));
        assert!(channel.is_valid());
        assert_eq!(channel.object_type(), Some(ObjectType::Channel));
        assert_eq!(channel.index(), 0);
        assert_eq!(channel.subindex(), 0);

        let (reply, body) = call(&transport, channel.raw(), method::channel::GET_MBX_STATE, &[]);
        assert_eq!(reply.error, 0);
        assert_eq!(reply.data_size, 8);
        assert_eq!(LittleEndian::read_u32(&body[..4]), 0);
        assert!(LittleEndian::read_u32(&body[4..8]) > 0);

        assert_eq!(driver.calls("channel_open"), 1);
        assert_eq!(driver.calls("channel_get_mbx_state"), 1);
    }

    #[test]
    fn test_open_channel_by_alias_case_insensitive() {
        let (_driver, transport) = make_transport();

        let (reply, _) = call(
            &transport,
            Handle::new(ObjectType::Driver, 0, 0).raw(),
            method::driver::OPEN_CHANNEL,
            &open_channel_req("PLC", 1),
        );
        assert_eq!(reply.error, 0);
    }

    #[test]
    fn test_open_channel_unknown_board_and_channel() {
        let (_driver, transport) = make_transport();
        let driver_handle = Handle::new(ObjectType::Driver, 0, 0).raw();

        let (reply, _) = call(
            &transport,
            driver_handle,
            method::driver::OPEN_CHANNEL,
            &open_channel_req("noSuchBoard", 0),
        );
        assert_eq!(reply.error, ApiError::INVALID_BOARD.code());

        let (reply, _) = call(
            &transport,
            driver_handle,
            method::driver::OPEN_CHANNEL,
            &open_channel_req("cifX0", 5),
        );
        assert_eq!(reply.error, ApiError::INVALID_CHANNEL.code());
    }

    #[test]
    fn test_channel_reference_counting() {
        let (driver, transport) = make_transport();
        let driver_handle = Handle::new(ObjectType::Driver, 0, 0).raw();

        // Three opens against the same channel, then three closes.
        let mut channel = 0;
        for _ in 0..3 {
            let (reply, body) = call(
                &transport,
                driver_handle,
                method::driver::OPEN_CHANNEL,
                &open_channel_req("cifX0", 0),
            );
            assert_eq!(reply.error, 0);
            channel = LittleEndian::read_u32(&body[..4]);
        }

        assert_eq!(driver.calls("channel_open"), 1);

        for _ in 0..3 {
            let (reply, _) = call(&transport, channel, method::channel::CLOSE, &[]);
            assert_eq!(reply.error, 0);
        }

        assert_eq!(driver.calls("channel_close"), 1);

        // The slot is closed now.
        let (reply, _) = call(&transport, channel, method::channel::CLOSE, &[]);
        assert_eq!(reply.error, ApiError::CHANNEL_NOT_INITIALIZED.code());
    }

    #[test]
    fn test_sysdevice_packet_roundtrip() {
        let (_driver, transport) = make_transport();
        let driver_handle = Handle::new(ObjectType::Driver, 0, 0).raw();

        let (reply, body) = call(
            &transport,
            driver_handle,
            method::driver::OPEN_SYSDEVICE,
            &open_sysdevice_req("cifX0"),
        );
        assert_eq!(reply.error, 0);

        let sysdevice = Handle::from_raw(LittleEndian::read_u32(&body[..4]));
        assert_eq!(sysdevice.object_type(), Some(ObjectType::Sysdevice));
        assert_eq!(sysdevice.subindex(), SYSTEM_CHANNEL);

        // Put a packet; the simulator answers with the confirmation.
        let packet = Packet {
            header: PacketHeader {
                dest: mailbox::DEST_SYSTEM,
                cmd: 0x2F00,
                ..PacketHeader::default()
            },
            data: vec![0xAA; 8],
        };
        let mut encoded = vec![0u8; packet.encoded_len()];
        packet.encode(&mut encoded);

        let mut data = Vec::new();
        data.extend_from_slice(&u32le(encoded.len() as u32));
        data.extend_from_slice(&encoded);
        data.extend_from_slice(&u32le(100));

        let (reply, _) = call(&transport, sysdevice.raw(), method::sysdevice::PUT_PACKET, &data);
        assert_eq!(reply.error, 0);

        // Mailbox now reports one pending packet.
        let (reply, body) = call(&transport, sysdevice.raw(), method::sysdevice::GET_MBX_STATE, &[]);
        assert_eq!(reply.error, 0);
        assert_eq!(LittleEndian::read_u32(&body[..4]), 1);

        // Fetch it back; the confirmation carries the answer bit.
        let mut data = Vec::new();
        data.extend_from_slice(&u32le(1024));
        data.extend_from_slice(&u32le(100));
        let (reply, body) = call(&transport, sysdevice.raw(), method::sysdevice::GET_PACKET, &data);

        assert_eq!(reply.error, 0);
        let cnf = Packet::decode(&body).unwrap();
        assert_eq!(cnf.header.cmd, 0x2F00 | mailbox::MSK_ANSWER);
        assert_eq!(cnf.data, vec![0xAA; 8]);
    }

    #[test]
    fn test_get_packet_truncation() {
        let (_driver, transport) = make_transport();
        let driver_handle = Handle::new(ObjectType::Driver, 0, 0).raw();

        let (_, body) = call(
            &transport,
            driver_handle,
            method::driver::OPEN_SYSDEVICE,
            &open_sysdevice_req("cifX0"),
        );
        let sysdevice = LittleEndian::read_u32(&body[..4]);

        let packet = Packet {
            header: PacketHeader::default(),
            data: vec![0x55; 64],
        };
        let mut encoded = vec![0u8; packet.encoded_len()];
        packet.encode(&mut encoded);

        let mut data = Vec::new();
        data.extend_from_slice(&u32le(encoded.len() as u32));
        data.extend_from_slice(&encoded);
        data.extend_from_slice(&u32le(0));
        let (reply, _) = call(&transport, sysdevice, method::sysdevice::PUT_PACKET, &data);
        assert_eq!(reply.error, 0);

        // Ask for less than the waiting confirmation.
        let mut data = Vec::new();
        data.extend_from_slice(&u32le(48));
        data.extend_from_slice(&u32le(0));
        let (reply, body) = call(&transport, sysdevice, method::sysdevice::GET_PACKET, &data);

        assert_eq!(reply.error, ApiError::BUFFER_TOO_SHORT.code());
        assert_eq!(reply.data_size, 48);
        assert_eq!(body.len(), 48);
    }

    #[test]
    fn test_channel_state_methods() {
        let (_driver, transport) = make_transport();

        let (_, body) = call(
            &transport,
            Handle::new(ObjectType::Driver, 0, 0).raw(),
            method::driver::OPEN_CHANNEL,
            &open_channel_req("cifX0", 0),
        );
        let channel = LittleEndian::read_u32(&body[..4]);

        // Host state: command 1 sets, reply echoes the stored state.
        let mut data = Vec::new();
        data.extend_from_slice(&u32le(1));
        data.extend_from_slice(&u32le(0x80));
        data.extend_from_slice(&u32le(50));
        let (reply, body) = call(&transport, channel, method::channel::HOST_STATE, &data);
        assert_eq!(reply.error, 0);
        assert_eq!(LittleEndian::read_u32(&body[..4]), 0x80);

        // Watchdog trigger advances.
        let mut data = Vec::new();
        data.extend_from_slice(&u32le(1));
        data.extend_from_slice(&u32le(10));
        let (reply, body) = call(&transport, channel, method::channel::WATCHDOG, &data);
        assert_eq!(reply.error, 0);
        assert_eq!(LittleEndian::read_u32(&body[..4]), 11);
    }

    #[test]
    fn test_block_read_write() {
        let (_driver, transport) = make_transport();

        let (_, body) = call(
            &transport,
            Handle::new(ObjectType::Driver, 0, 0).raw(),
            method::driver::OPEN_CHANNEL,
            &open_channel_req("cifX0", 0),
        );
        let channel = LittleEndian::read_u32(&body[..4]);

        // Write four bytes at offset 8 of the control block.
        let mut data = Vec::new();
        data.extend_from_slice(&u32le(CMD_WRITE_DATA));
        data.extend_from_slice(&u32le(8));
        data.extend_from_slice(&u32le(4));
        data.extend_from_slice(&[1, 2, 3, 4]);
        let (reply, _) = call(&transport, channel, method::channel::CONTROL_BLOCK, &data);
        assert_eq!(reply.error, 0);

        // Read them back.
        let mut data = Vec::new();
        data.extend_from_slice(&u32le(CMD_READ_DATA));
        data.extend_from_slice(&u32le(8));
        data.extend_from_slice(&u32le(4));
        let (reply, body) = call(&transport, channel, method::channel::CONTROL_BLOCK, &data);
        assert_eq!(reply.error, 0);
        assert_eq!(body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_io_write_then_read() {
        let (_driver, transport) = make_transport();

        let (_, body) = call(
            &transport,
            Handle::new(ObjectType::Driver, 0, 0).raw(),
            method::driver::OPEN_CHANNEL,
            &open_channel_req("cifX0", 0),
        );
        let channel = LittleEndian::read_u32(&body[..4]);

        let mut data = Vec::new();
        data.extend_from_slice(&u32le(0));
        data.extend_from_slice(&u32le(0));
        data.extend_from_slice(&u32le(10));
        data.extend_from_slice(&u32le(3));
        data.extend_from_slice(&[7, 8, 9]);
        let (reply, _) = call(&transport, channel, method::channel::IO_WRITE, &data);
        assert_eq!(reply.error, 0);

        let mut data = Vec::new();
        data.extend_from_slice(&u32le(0));
        data.extend_from_slice(&u32le(0));
        data.extend_from_slice(&u32le(10));
        data.extend_from_slice(&u32le(3));
        let (reply, body) = call(&transport, channel, method::channel::IO_READ, &data);
        assert_eq!(reply.error, 0);
        assert_eq!(body, vec![7, 8, 9]);
    }

    #[test]
    fn test_function_not_available_on_minimal_driver() {
        struct MinimalDriver;

        impl DriverApi for MinimalDriver {
            fn driver_open(&self) -> ApiResult<crate::driver::RawHandle> {
                Ok(1)
            }
            fn driver_close(&self, _driver: crate::driver::RawHandle) -> ApiResult<()> {
                Ok(())
            }
            fn driver_get_information(
                &self,
                _driver: crate::driver::RawHandle,
            ) -> ApiResult<DriverInformation> {
                Ok(DriverInformation {
                    version: "minimal".into(),
                    board_count: 1,
                })
            }
            fn driver_enum_boards(
                &self,
                _driver: crate::driver::RawHandle,
                board: u32,
            ) -> ApiResult<BoardInformation> {
                if board > 0 {
                    return Err(ApiError::INVALID_BOARD);
                }
                Ok(BoardInformation {
                    name: "bare0".into(),
                    channel_count: 1,
                    ..BoardInformation::default()
                })
            }
            fn driver_enum_channels(
                &self,
                _driver: crate::driver::RawHandle,
                _board: u32,
                _channel: u32,
            ) -> ApiResult<ChannelInformation> {
                Ok(ChannelInformation::default())
            }
            fn sysdevice_open(
                &self,
                _driver: crate::driver::RawHandle,
                _board: &str,
            ) -> ApiResult<crate::driver::RawHandle> {
                Ok(2)
            }
            fn sysdevice_close(&self, _sysdevice: crate::driver::RawHandle) -> ApiResult<()> {
                Ok(())
            }
            fn sysdevice_get_mbx_state(
                &self,
                _sysdevice: crate::driver::RawHandle,
            ) -> ApiResult<(u32, u32)> {
                Ok((0, 0))
            }
            fn sysdevice_put_packet(
                &self,
                _sysdevice: crate::driver::RawHandle,
                _packet: &Packet,
                _timeout_ms: u32,
            ) -> ApiResult<()> {
                Ok(())
            }
            fn sysdevice_get_packet(
                &self,
                _sysdevice: crate::driver::RawHandle,
                _size: u32,
                _timeout_ms: u32,
            ) -> ApiResult<Packet> {
                Err(ApiError::NO_PACKET)
            }
            fn channel_open(
                &self,
                _driver: crate::driver::RawHandle,
                _board: &str,
                _channel: u32,
            ) -> ApiResult<crate::driver::RawHandle> {
                Ok(3)
            }
            fn channel_close(&self, _channel: crate::driver::RawHandle) -> ApiResult<()> {
                Ok(())
            }
            fn channel_get_mbx_state(
                &self,
                _channel: crate::driver::RawHandle,
            ) -> ApiResult<(u32, u32)> {
                Ok((0, 0))
            }
            fn channel_put_packet(
                &self,
                _channel: crate::driver::RawHandle,
                _packet: &Packet,
                _timeout_ms: u32,
            ) -> ApiResult<()> {
                Ok(())
            }
            fn channel_get_packet(
                &self,
                _channel: crate::driver::RawHandle,
                _size: u32,
                _timeout_ms: u32,
            ) -> ApiResult<Packet> {
                Err(ApiError::NO_PACKET)
            }
        }

        let log = logging::child_or_discard(None);
        let instance = Instance::new(Arc::new(MinimalDriver), &log).unwrap();
        let transport = CifxTransport {
            inner: Mutex::new(instance),
            log,
        };

        let (_, body) = call(
            &transport,
            Handle::new(ObjectType::Driver, 0, 0).raw(),
            method::driver::OPEN_CHANNEL,
            &open_channel_req("bare0", 0),
        );
        let channel = LittleEndian::read_u32(&body[..4]);

        let mut data = Vec::new();
        data.extend_from_slice(&u32le(1));
        data.extend_from_slice(&u32le(0));
        let (reply, _) = call(&transport, channel, method::channel::WATCHDOG, &data);
        assert_eq!(reply.error, ApiError::FUNCTION_NOT_AVAILABLE.code());

        // Restart is optional too and reported per call, not per driver.
        let mut name = vec![0u8; NAME_LEN];
        name[..5].copy_from_slice(b"bare0");
        let (reply, _) = call(
            &transport,
            Handle::new(ObjectType::Driver, 0, 0).raw(),
            method::driver::RESTART_DEVICE,
            &name,
        );
        assert_eq!(reply.error, ApiError::FUNCTION_NOT_AVAILABLE.code());
    }

    #[test]
    fn test_unknown_methods() {
        let (_driver, transport) = make_transport();

        let (reply, _) = call(
            &transport,
            Handle::new(ObjectType::Driver, 0, 0).raw(),
            0x77,
            &[],
        );
        assert_eq!(reply.error, ApiError::INVALID_PARAMETER.code());

        let (_, body) = call(
            &transport,
            Handle::new(ObjectType::Driver, 0, 0).raw(),
            method::driver::OPEN_CHANNEL,
            &open_channel_req("cifX0", 0),
        );
        let channel = LittleEndian::read_u32(&body[..4]);

        let (reply, _) = call(&transport, channel, 0x77, &[]);
        assert_eq!(reply.error, ApiError::INVALID_COMMAND.code());
    }

    #[test]
    fn test_driver_open_close_counting() {
        let (_driver, transport) = make_transport();
        let driver_handle = Handle::new(ObjectType::Driver, 0, 0).raw();

        let (reply, _) = call(&transport, driver_handle, method::driver::CLOSE, &[]);
        assert_eq!(reply.error, ApiError::NOT_OPENED.code());

        let (reply, _) = call(&transport, driver_handle, method::driver::OPEN, &[]);
        assert_eq!(reply.error, 0);
        let (reply, _) = call(&transport, driver_handle, method::driver::CLOSE, &[]);
        assert_eq!(reply.error, 0);
    }

    #[test]
    fn test_end_to_end_open_channel_over_transport() {
        use marshaller::crc::crc16;
        use marshaller::frame::{state, TransportHeader, COOKIE, DT_ACKNOWLEDGE, HEADER_SIZE};
        use marshaller::{Connector, ConnectorConfig, MarshallerParams, Result as CoreResult};

        struct CaptureConnector {
            sent: Mutex<Vec<(TransportHeader, Vec<u8>)>>,
        }

        impl Connector for CaptureConnector {
            fn transmit(&self, core: &Marshaller, buffer: Buffer) -> CoreResult<()> {
                self.sent
                    .lock()
                    .unwrap()
                    .push((buffer.header, buffer.payload().to_vec()));
                core.tx_complete(buffer);
                Ok(())
            }

            fn deinit(&self) {}
        }

        let core = Marshaller::new(MarshallerParams::default(), Box::new(|| ()), None);
        let driver = Arc::new(SimDriver::new(vec![SimBoard::default()]));
        CifxTransport::install(&core, driver.clone(), None).unwrap();

        let conn = Arc::new(CaptureConnector {
            sent: Mutex::new(Vec::new()),
        });
        let id = core
            .register_connector(conn.clone(), ConnectorConfig::default())
            .unwrap();

        let send = |handle: u32, method_id: u32, data: &[u8]| -> (MarshalHeader, Vec<u8>) {
            let mut payload = vec![0u8; MARSHAL_HEADER_SIZE + data.len()];
            MarshalHeader {
                handle,
                method_id,
                sequence: SEQ_REQUEST,
                error: 0,
                data_size: data.len() as u32,
            }
            .encode(&mut payload[..MARSHAL_HEADER_SIZE]);
            payload[MARSHAL_HEADER_SIZE..].copy_from_slice(data);

            let header = TransportHeader {
                cookie: COOKIE,
                length: payload.len() as u32,
                checksum: crc16(&payload),
                data_type: DT_MARSHAL,
                ..TransportHeader::default()
            };
            let mut raw = [0u8; HEADER_SIZE];
            header.encode(&mut raw);
            let mut frame = raw.to_vec();
            frame.extend_from_slice(&payload);

            core.rx_data(id, &frame).unwrap();
            core.dispatch_one().unwrap();

            let mut sent = conn.sent.lock().unwrap();
            assert_eq!(sent.len(), 2, "expected acknowledge plus reply");

            let (ack, ack_payload) = sent.remove(0);
            assert_eq!(ack.data_type, DT_ACKNOWLEDGE);
            assert_eq!(ack.state, state::OK);
            assert!(ack_payload.is_empty());

            let (reply, reply_payload) = sent.remove(0);
            assert_eq!(reply.data_type, DT_MARSHAL);
            assert_eq!(reply.checksum, crc16(&reply_payload));

            let call_header = MarshalHeader::decode(&reply_payload[..MARSHAL_HEADER_SIZE]);
            (call_header, reply_payload[MARSHAL_HEADER_SIZE..].to_vec())
        };

        // Instantiate the driver object.
        let (reply, body) = send(
            0,
            method::class_factory::CREATE_INSTANCE,
            &u32le(ObjectType::Driver as u32),
        );
        assert_eq!(reply.error, 0);
        let driver_handle = LittleEndian::read_u32(&body[..4]);

        // Open channel 0 on the board by name.
        let (reply, body) = send(
            driver_handle,
            method::driver::OPEN_CHANNEL,
            &open_channel_req("cifX0", 0),
        );
        assert_eq!(reply.error, 0);
        let channel = Handle::from_raw(LittleEndian::read_u32(&body[..4]));
        assert!(channel.is_valid());
        assert_eq!(channel.object_type(), Some(ObjectType::Channel));
        assert_eq!(channel.index(), 0);
        assert_eq!(channel.subindex(), 0);

        // The mailbox state comes back from the driver.
        let (reply, body) = send(channel.raw(), method::channel::GET_MBX_STATE, &[]);
        assert_eq!(reply.error, 0);
        assert_eq!(body.len(), 8);

        // Closing drops the open count to zero and hits the library once.
        let (reply, _) = send(channel.raw(), method::channel::CLOSE, &[]);
        assert_eq!(reply.error, 0);
        assert_eq!(driver.calls("channel_open"), 1);
        assert_eq!(driver.calls("channel_close"), 1);
    }

    #[test]
    fn test_declared_size_beyond_frame_rejected() {
        let (_driver, transport) = make_transport();

        let mut buffer = Buffer::detached(256);
        let header = MarshalHeader {
            handle: 0,
            method_id: method::class_factory::CREATE_INSTANCE,
            sequence: SEQ_REQUEST,
            error: 0,
            data_size: 64, // claims more than the frame carries
        };
        {
            let area = buffer.area_mut();
            header.encode(&mut area[..MARSHAL_HEADER_SIZE]);
        }
        buffer.set_used(MARSHAL_HEADER_SIZE + 4);

        transport.handle_frame(&mut buffer);

        let reply = MarshalHeader::decode(&buffer.payload()[..MARSHAL_HEADER_SIZE]);
        assert_eq!(reply.error, ApiError::INVALID_PARAMETER.code());
        assert_eq!(reply.data_size, 0);
    }
}
