use std::fmt;
use std::io;

/// Errors surfaced by the marshaller core.
#[derive(Debug)]
pub enum MarshallerError {
    /// A parameter was out of range (unknown connector, zero data type, ...).
    InvalidParameter,
    /// No free slot or buffer was available.
    OutOfResources,
    /// A transport is already registered for the data type.
    AlreadyRegistered,
    /// The request queue is empty.
    QueueEmpty,
    /// No transport is registered for the frame's data type.
    NoTransport,
    /// The connector failed to put the frame on the wire.
    Io(io::Error),
}

impl From<io::Error> for MarshallerError {
    fn from(err: io::Error) -> Self {
        MarshallerError::Io(err)
    }
}

impl fmt::Display for MarshallerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MarshallerError::InvalidParameter => write!(f, "invalid parameter"),
            MarshallerError::OutOfResources => write!(f, "out of resources"),
            MarshallerError::AlreadyRegistered => write!(f, "data type already registered"),
            MarshallerError::QueueEmpty => write!(f, "request queue empty"),
            MarshallerError::NoTransport => write!(f, "no transport for data type"),
            MarshallerError::Io(err) => write!(f, "transmit failed: {}", err),
        }
    }
}

impl std::error::Error for MarshallerError {}

pub type Result<T> = std::result::Result<T, MarshallerError>;
