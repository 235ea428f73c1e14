//! Registry of transport handlers keyed by the 16-bit frame data type.

use crate::buffer::Buffer;
use crate::error::{MarshallerError, Result};
use crate::marshaller::Marshaller;
use std::sync::Arc;

/// A transport handler consumes frames of one data type.
///
/// `handle` runs on the embedder's dispatcher thread. The handler writes the
/// reply payload into the same buffer, sets the used length and leaves the
/// transport header finalisation (length, checksum) to the core.
pub trait TransportHandler: Send + Sync {
    fn handle(&self, core: &Marshaller, buffer: &mut Buffer);

    /// Invoked from the timer tick.
    fn poll(&self) {}

    /// Called when the owning marshaller stops.
    fn deinit(&self) {}
}

pub(crate) struct TransportEntry {
    pub data_type: u16,
    pub handler: Arc<dyn TransportHandler>,
}

/// Fixed-capacity handler table. Lookup is linear; the table is small.
pub(crate) struct Registry {
    entries: Vec<TransportEntry>,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Registry {
        Registry {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Register a handler. Data type 0 is reserved for the built-in
    /// QueryServer admin command and cannot be taken.
    pub fn register(&mut self, data_type: u16, handler: Arc<dyn TransportHandler>) -> Result<()> {
        if data_type == 0 {
            return Err(MarshallerError::InvalidParameter);
        }
        if self.find(data_type).is_some() {
            return Err(MarshallerError::AlreadyRegistered);
        }
        if self.entries.len() >= self.capacity {
            return Err(MarshallerError::OutOfResources);
        }

        self.entries.push(TransportEntry { data_type, handler });
        Ok(())
    }

    pub fn unregister(&mut self, data_type: u16) -> Option<Arc<dyn TransportHandler>> {
        let idx = self.entries.iter().position(|e| e.data_type == data_type)?;
        Some(self.entries.remove(idx).handler)
    }

    pub fn find(&self, data_type: u16) -> Option<Arc<dyn TransportHandler>> {
        self.entries
            .iter()
            .find(|e| e.data_type == data_type)
            .map(|e| Arc::clone(&e.handler))
    }

    /// Registered data types in registration order.
    pub fn data_types(&self) -> Vec<u16> {
        self.entries.iter().map(|e| e.data_type).collect()
    }

    /// Snapshot of the handlers, for poll and deinit fan-out.
    pub fn handlers(&self) -> Vec<Arc<dyn TransportHandler>> {
        self.entries.iter().map(|e| Arc::clone(&e.handler)).collect()
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
