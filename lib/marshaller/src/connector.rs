//! The connector contract and the per-connector state kept by the core.
//!
//! A connector is the byte-stream endpoint (typically one TCP client). It
//! feeds received bytes into [`crate::Marshaller::rx_data`] and puts filled
//! buffers on the wire when the core calls [`Connector::transmit`]. The core
//! keeps one slot per registered connector holding the buffer pool and the
//! receive scanner state.

use crate::buffer::{Buffer, Pool};
use crate::error::Result;
use crate::frame::HEADER_SIZE;
use crate::logging;
use crate::marshaller::Marshaller;
use std::sync::{Arc, Mutex};

pub type ConnectorId = usize;

/// Connector access mode. A disabled connector drops incoming bytes at the
/// ingress entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Enabled,
    Disabled,
}

/// Registration parameters of a connector.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Number of Rx buffers, i.e. parallel services.
    pub rx_buffer_count: usize,
    /// Capacity of each Rx buffer in bytes.
    pub rx_buffer_size: usize,
    /// Number of Tx buffers for unsolicited data.
    pub tx_buffer_count: usize,
    /// Capacity of each Tx buffer in bytes.
    pub tx_buffer_size: usize,
    /// Frame assembly timeout in milliseconds.
    pub timeout_ms: u32,
}

impl Default for ConnectorConfig {
    fn default() -> ConnectorConfig {
        ConnectorConfig {
            rx_buffer_count: 8,
            rx_buffer_size: 6144,
            tx_buffer_count: 2,
            tx_buffer_size: 6144,
            timeout_ms: 3000,
        }
    }
}

/// Callbacks a connector provides at registration.
///
/// `transmit` hands a filled buffer to the wire; the connector must
/// eventually return it through [`Marshaller::tx_complete`], on failure
/// paths included. The core never holds any of its locks while calling into
/// the connector, so the implementation is free to call back immediately.
pub trait Connector: Send + Sync {
    fn transmit(&self, core: &Marshaller, buffer: Buffer) -> Result<()>;

    /// Shut the connector down. Called when the owning marshaller stops.
    fn deinit(&self);

    /// Invoked from the timer tick.
    fn poll(&self) {}
}

/// Receive scanner states. `current` Rx buffer is occupied exactly while the
/// scanner sits in `WaitData` or `CheckFrame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scan {
    SearchCookie,
    SearchHeader,
    WaitData,
    CheckFrame,
}

/// Mutable receive-side state of a connector, guarded by the slot mutex.
pub(crate) struct RxState {
    pub scan: Scan,
    /// Header accumulator; the first four bytes double as the cookie shift
    /// window during `SearchCookie`.
    pub raw_header: [u8; HEADER_SIZE],
    /// Bytes of the current frame consumed so far (header plus payload).
    pub offset: usize,
    pub monitor_timeout: bool,
    pub elapsed_ms: u32,
    /// Last ComID handed out to the peer.
    pub keep_alive_id: u32,
    pub current: Option<Buffer>,
    pub mode: Mode,
}

impl RxState {
    pub fn new() -> RxState {
        RxState {
            scan: Scan::SearchCookie,
            raw_header: [0; HEADER_SIZE],
            offset: 0,
            monitor_timeout: false,
            elapsed_ms: 0,
            keep_alive_id: 0,
            current: None,
            mode: Mode::Enabled,
        }
    }
}

/// A registered connector: callbacks, configuration, buffer pool and
/// scanner state. The pool and the scanner have separate locks so a
/// transmit completion can release its buffer while the ingress thread is
/// still inside the state machine.
pub(crate) struct Slot {
    pub index: ConnectorId,
    pub conn: Arc<dyn Connector>,
    pub config: ConnectorConfig,
    pub pool: Mutex<Pool>,
    pub rx: Mutex<RxState>,
    pub log: logging::Logger,
}

impl Slot {
    pub fn new(
        index: ConnectorId,
        conn: Arc<dyn Connector>,
        config: ConnectorConfig,
        log: logging::Logger,
    ) -> Slot {
        let pool = Pool::new(
            index,
            config.rx_buffer_count,
            config.rx_buffer_size,
            config.tx_buffer_count,
            config.tx_buffer_size,
        );

        Slot {
            index,
            conn,
            config,
            pool: Mutex::new(pool),
            rx: Mutex::new(RxState::new()),
            log,
        }
    }
}
