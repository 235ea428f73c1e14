//! Transport core of the remote fieldbus gateway.
//!
//! The marshaller multiplexes framed requests arriving on byte-stream
//! connectors (TCP, serial, ...) onto registered transport handlers. It owns
//! the per-connector buffer pools, the receive state machine that locates
//! frames in the incoming byte stream, the request queue drained by the
//! embedder's dispatcher thread and the keep-alive handshake. Everything
//! device specific lives behind the [`registry::TransportHandler`] trait.

pub mod buffer;
pub mod connector;
pub mod crc;
pub mod error;
pub mod frame;
pub mod logging;
pub mod marshaller;
pub mod registry;

pub use crate::buffer::{Buffer, BufferKind};
pub use crate::connector::{Connector, ConnectorConfig, ConnectorId, Mode};
pub use crate::error::{MarshallerError, Result};
pub use crate::marshaller::{Marshaller, MarshallerParams, ALL_CONNECTORS};
pub use crate::registry::TransportHandler;
