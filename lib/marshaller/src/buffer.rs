//! Typed frame buffers and the per-connector pool they are recycled through.
//!
//! Every buffer belongs to exactly one of the four free lists, the current
//! Rx slot of the receive state machine, the request queue or an in-flight
//! transmit. Ownership is expressed by move: acquiring a buffer takes it out
//! of the pool, releasing pushes it back onto the list matching its kind.

use crate::connector::ConnectorId;
use crate::frame::{TransportHeader, KEEP_ALIVE_PAYLOAD_SIZE};
use std::collections::VecDeque;

/// The four buffer classes. The kind is assigned at allocation and stays
/// with the buffer for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Rx,
    Tx,
    Ack,
    KeepAlive,
}

/// A fixed-capacity frame buffer.
///
/// The transport header is kept out of the payload area: it holds the last
/// validated header for received frames and the header to emit for outgoing
/// ones.
#[derive(Debug)]
pub struct Buffer {
    kind: BufferKind,
    connector: ConnectorId,
    pub header: TransportHeader,
    data: Vec<u8>,
    used: usize,
    send_offset: usize,
}

impl Buffer {
    fn new(kind: BufferKind, connector: ConnectorId, capacity: usize) -> Buffer {
        Buffer {
            kind,
            connector,
            header: TransportHeader::default(),
            data: vec![0; capacity],
            used: 0,
            send_offset: 0,
        }
    }

    /// A buffer owned by no pool, for transport handlers that need a
    /// scratch frame and for driving handlers directly in tests. Must not
    /// be handed to `Marshaller::tx_complete`.
    pub fn detached(capacity: usize) -> Buffer {
        Buffer::new(BufferKind::Tx, 0, capacity)
    }

    #[inline]
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    #[inline]
    pub fn connector(&self) -> ConnectorId {
        self.connector
    }

    /// Payload capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of payload bytes in use.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Set the number of payload bytes in use.
    ///
    /// Panics if `used` exceeds the capacity; the receive path checks the
    /// declared length against the capacity before any data is copied.
    #[inline]
    pub fn set_used(&mut self, used: usize) {
        assert!(used <= self.data.len());
        self.used = used;
    }

    /// The used part of the payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// The whole payload area, regardless of the used length.
    #[inline]
    pub fn area_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Current send offset for fragmented egress.
    #[inline]
    pub fn send_offset(&self) -> usize {
        self.send_offset
    }

    #[inline]
    pub fn set_send_offset(&mut self, offset: usize) {
        self.send_offset = offset;
    }
}

/// Per-connector buffer pool with one free list per buffer kind.
///
/// Sizing follows the connector registration: `rx_count` Rx buffers,
/// `tx_count` Tx buffers, `rx_count + tx_count + 2` header-only Ack buffers
/// and a single keep-alive buffer. The Ack list is over-provisioned so a
/// negative acknowledge can always be produced even with the Rx list drained;
/// one outstanding keep-alive per connector is all the protocol allows.
#[derive(Debug)]
pub struct Pool {
    rx: VecDeque<Buffer>,
    tx: VecDeque<Buffer>,
    ack: VecDeque<Buffer>,
    keep_alive: VecDeque<Buffer>,
}

impl Pool {
    pub fn new(
        connector: ConnectorId,
        rx_count: usize,
        rx_size: usize,
        tx_count: usize,
        tx_size: usize,
    ) -> Pool {
        let mut pool = Pool {
            rx: VecDeque::with_capacity(rx_count),
            tx: VecDeque::with_capacity(tx_count),
            ack: VecDeque::with_capacity(rx_count + tx_count + 2),
            keep_alive: VecDeque::with_capacity(1),
        };

        for _ in 0..rx_count {
            pool.rx.push_back(Buffer::new(BufferKind::Rx, connector, rx_size));
        }
        for _ in 0..tx_count {
            pool.tx.push_back(Buffer::new(BufferKind::Tx, connector, tx_size));
        }
        for _ in 0..rx_count + tx_count + 2 {
            pool.ack.push_back(Buffer::new(BufferKind::Ack, connector, 0));
        }
        pool.keep_alive.push_back(Buffer::new(
            BufferKind::KeepAlive,
            connector,
            KEEP_ALIVE_PAYLOAD_SIZE,
        ));

        pool
    }

    fn list(&mut self, kind: BufferKind) -> &mut VecDeque<Buffer> {
        match kind {
            BufferKind::Rx => &mut self.rx,
            BufferKind::Tx => &mut self.tx,
            BufferKind::Ack => &mut self.ack,
            BufferKind::KeepAlive => &mut self.keep_alive,
        }
    }

    /// Take a buffer of the requested kind. Returns `None` when the free
    /// list is exhausted.
    pub fn acquire(&mut self, kind: BufferKind) -> Option<Buffer> {
        self.list(kind).pop_front().map(|mut buffer| {
            buffer.used = 0;
            buffer.send_offset = 0;
            buffer
        })
    }

    /// Return a buffer to the free list matching its kind.
    pub fn release(&mut self, mut buffer: Buffer) {
        buffer.used = 0;
        let kind = buffer.kind;
        self.list(kind).push_back(buffer);
    }

    /// Total number of buffers currently on the free lists.
    pub fn free_count(&self) -> usize {
        self.rx.len() + self.tx.len() + self.ack.len() + self.keep_alive.len()
    }
}
