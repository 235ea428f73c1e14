//! cifX object model for the remote fieldbus gateway.
//!
//! This crate turns marshalled method calls arriving over the transport core
//! into invocations of a local device driver. It owns the encoded object
//! handles, the device/channel table with its open counting, the frame
//! dispatcher for the four remote object types (class factory, driver,
//! system device, channel), the download-hook interposer and a simulated
//! driver used by tests and by the gateway when no hardware is attached.

pub mod dispatch;
pub mod download;
pub mod driver;
pub mod handle;
pub mod sim;
pub mod status;
pub mod table;
pub mod types;

pub use crate::dispatch::CifxTransport;
pub use crate::download::{DownloadHook, DownloadMode, FileStorage};
pub use crate::driver::{DriverApi, RawHandle};
pub use crate::handle::{Handle, ObjectType};
pub use crate::sim::{SimBoard, SimDriver};
pub use crate::status::{ApiError, ApiResult};
