//! Status codes of the device API.
//!
//! Every driver entry point reports a 32-bit status, zero meaning success.
//! Error codes follow the severity/facility layout of the device firmware
//! (bit 31 set, facility in bits 16..27), so codes coming back from a real
//! driver pass through the gateway unchanged.

use std::fmt;

/// Non-zero API status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiError(pub u32);

pub type ApiResult<T> = Result<T, ApiError>;

/// Status reported for a successful call.
pub const STATUS_OK: u32 = 0;

impl ApiError {
    // Generic API errors.
    pub const INVALID_POINTER: ApiError = ApiError(0x800A_0001);
    pub const INVALID_BOARD: ApiError = ApiError(0x800A_0002);
    pub const INVALID_CHANNEL: ApiError = ApiError(0x800A_0003);
    pub const INVALID_HANDLE: ApiError = ApiError(0x800A_0004);
    pub const INVALID_PARAMETER: ApiError = ApiError(0x800A_0005);
    pub const INVALID_COMMAND: ApiError = ApiError(0x800A_0006);
    pub const BUFFER_TOO_SHORT: ApiError = ApiError(0x800A_0007);
    pub const FUNCTION_FAILED: ApiError = ApiError(0x800A_0008);
    pub const FUNCTION_NOT_AVAILABLE: ApiError = ApiError(0x800A_0012);

    // Device errors.
    pub const NO_COM_FLAG: ApiError = ApiError(0x800B_0001);
    pub const NO_PACKET: ApiError = ApiError(0x800B_0002);
    pub const PACKET_OUT_OF_SEQ: ApiError = ApiError(0x800B_0003);
    pub const MAILBOX_FULL: ApiError = ApiError(0x800B_0004);
    pub const FILE_STORE_FAILED: ApiError = ApiError(0x800B_0005);

    // Driver errors.
    pub const DRIVER_NOT_LOADED: ApiError = ApiError(0x800C_0001);
    pub const NOT_OPENED: ApiError = ApiError(0x800C_0002);
    pub const CHANNEL_NOT_INITIALIZED: ApiError = ApiError(0x800C_0003);

    /// Raw status value as put on the wire.
    #[inline]
    pub fn code(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            ApiError::INVALID_POINTER => "invalid pointer",
            ApiError::INVALID_BOARD => "invalid board",
            ApiError::INVALID_CHANNEL => "invalid channel",
            ApiError::INVALID_HANDLE => "invalid handle",
            ApiError::INVALID_PARAMETER => "invalid parameter",
            ApiError::INVALID_COMMAND => "invalid command",
            ApiError::BUFFER_TOO_SHORT => "buffer too short",
            ApiError::FUNCTION_FAILED => "function failed",
            ApiError::FUNCTION_NOT_AVAILABLE => "function not available",
            ApiError::NO_COM_FLAG => "no communication",
            ApiError::NO_PACKET => "no packet available",
            ApiError::PACKET_OUT_OF_SEQ => "packet out of sequence",
            ApiError::MAILBOX_FULL => "mailbox full",
            ApiError::FILE_STORE_FAILED => "file storage failed",
            ApiError::DRIVER_NOT_LOADED => "driver not loaded",
            ApiError::NOT_OPENED => "not opened",
            ApiError::CHANNEL_NOT_INITIALIZED => "channel not initialized",
            _ => return write!(f, "device status 0x{:08X}", self.0),
        };
        write!(f, "{} (0x{:08X})", name, self.0)
    }
}

/// Fold a result into the wire status word.
#[inline]
pub fn status_of<T>(result: &ApiResult<T>) -> u32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(err) => err.code(),
    }
}
