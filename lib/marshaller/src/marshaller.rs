//! The marshaller instance: connector slots, transport registry, request
//! queue and the receive state machine that turns raw connector bytes into
//! dispatched frames.

use crate::buffer::{Buffer, BufferKind};
use crate::connector::{Connector, ConnectorConfig, ConnectorId, Mode, RxState, Scan, Slot};
use crate::crc::crc16;
use crate::error::{MarshallerError, Result};
use crate::frame::{
    state, QueryServerReply, TransportHeader, COOKIE, DT_ACKNOWLEDGE, DT_KEEP_ALIVE,
    DT_QUERY_SERVER, FEATURE_KEEP_ALIVE, HEADER_SIZE, KEEP_ALIVE_PAYLOAD_SIZE,
};
use crate::logging;
use crate::registry::{Registry, TransportHandler};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Sentinel accepted by [`Marshaller::set_mode`] to address every connector.
pub const ALL_CONNECTORS: ConnectorId = ConnectorId::MAX;

/// Version words reported in the QueryServer reply.
pub const SERVER_VERSION: [u32; 4] = [2, 4, 0, 1];

/// Timer period expected by [`Marshaller::tick`], in milliseconds.
pub const TICK_MS: u32 = 10;

/// Startup parameters.
#[derive(Debug, Clone)]
pub struct MarshallerParams {
    /// Name reported to clients, truncated to 31 bytes on the wire.
    pub server_name: String,
    pub max_connectors: usize,
    pub max_transports: usize,
}

impl Default for MarshallerParams {
    fn default() -> MarshallerParams {
        MarshallerParams {
            server_name: "Fieldbus Gateway".into(),
            max_connectors: 4,
            max_transports: 4,
        }
    }
}

/// The marshaller core. All methods take `&self`; the instance is shared
/// between the ingress threads, the timer thread and the dispatcher thread.
pub struct Marshaller {
    server_name: String,
    slots: Mutex<Vec<Option<Arc<Slot>>>>,
    registry: Mutex<Registry>,
    pending: Mutex<VecDeque<Buffer>>,
    request_hook: Box<dyn Fn() + Send + Sync>,
    started: Instant,
    log: logging::Logger,
}

impl Marshaller {
    /// Create a new instance. `request_hook` is invoked from the ingress
    /// path whenever a frame has been queued for dispatch; the embedder is
    /// expected to wake the thread that drains [`Marshaller::dispatch_one`].
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        params: MarshallerParams,
        request_hook: Box<dyn Fn() + Send + Sync>,
        log: L,
    ) -> Marshaller {
        let mut slots = Vec::with_capacity(params.max_connectors);
        slots.resize_with(params.max_connectors, || None);

        Marshaller {
            server_name: params.server_name,
            slots: Mutex::new(slots),
            registry: Mutex::new(Registry::new(params.max_transports)),
            pending: Mutex::new(VecDeque::new()),
            request_hook,
            started: Instant::now(),
            log: logging::child_or_discard(log),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Milliseconds since the instance was created; ComID source.
    fn tick_count(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    fn slot(&self, id: ConnectorId) -> Option<Arc<Slot>> {
        self.slots.lock().unwrap().get(id).and_then(|s| s.clone())
    }
}

/// Connector management.
impl Marshaller {
    /// Install a connector, allocating its buffer pool. Returns the
    /// connector index used for all subsequent calls.
    pub fn register_connector(
        &self,
        conn: Arc<dyn Connector>,
        config: ConnectorConfig,
    ) -> Result<ConnectorId> {
        let mut slots = self.slots.lock().unwrap();

        let index = slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(MarshallerError::OutOfResources)?;

        let log = self.log.new(logging::o!("connector" => index));
        logging::debug!(log, "connector registered";
                        "rx_buffers" => config.rx_buffer_count,
                        "rx_size" => config.rx_buffer_size,
                        "timeout_ms" => config.timeout_ms);

        slots[index] = Some(Arc::new(Slot::new(index, conn, config, log)));
        Ok(index)
    }

    /// Remove a connector. Its buffer pool is torn down; buffers still in
    /// flight are dropped when they come back.
    pub fn unregister_connector(&self, id: ConnectorId) {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            slots.get_mut(id).and_then(|s| s.take())
        };

        if let Some(slot) = slot {
            logging::debug!(slot.log, "connector unregistered");
        }
    }

    /// Enable or disable one connector, or all of them via
    /// [`ALL_CONNECTORS`].
    pub fn set_mode(&self, id: ConnectorId, mode: Mode) -> Result<()> {
        let targets: Vec<Arc<Slot>> = {
            let slots = self.slots.lock().unwrap();

            if id == ALL_CONNECTORS {
                slots.iter().flatten().cloned().collect()
            } else {
                let slot = slots
                    .get(id)
                    .and_then(|s| s.clone())
                    .ok_or(MarshallerError::OutOfResources)?;
                vec![slot]
            }
        };

        for slot in targets {
            slot.rx.lock().unwrap().mode = mode;
        }
        Ok(())
    }

    /// Number of buffers currently on the connector's free lists. Mainly a
    /// diagnostic; the pool never grows or shrinks after registration.
    pub fn free_buffers(&self, id: ConnectorId) -> Option<usize> {
        let slot = self.slot(id)?;
        let count = slot.pool.lock().unwrap().free_count();
        Some(count)
    }

    /// Take a buffer from a connector's pool, e.g. for unsolicited data.
    pub fn acquire_buffer(&self, id: ConnectorId, kind: BufferKind) -> Option<Buffer> {
        let slot = self.slot(id)?;
        let buffer = slot.pool.lock().unwrap().acquire(kind);
        buffer
    }

    /// Return a buffer to its originating free list. Called by connectors
    /// once a transmit has finished, and usable to give back buffers taken
    /// with [`Marshaller::acquire_buffer`].
    pub fn tx_complete(&self, buffer: Buffer) {
        if let Some(slot) = self.slot(buffer.connector()) {
            slot.pool.lock().unwrap().release(buffer);
        }
    }
}

/// Transport management and dispatch.
impl Marshaller {
    pub fn register_transport(
        &self,
        data_type: u16,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<()> {
        self.registry.lock().unwrap().register(data_type, handler)
    }

    pub fn unregister_transport(&self, data_type: u16) {
        self.registry.lock().unwrap().unregister(data_type);
    }

    /// Number of frames waiting for dispatch.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Drain one frame from the request queue and run its transport
    /// handler. The reply produced by the handler is transmitted before the
    /// call returns.
    pub fn dispatch_one(&self) -> Result<()> {
        let mut buffer = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(MarshallerError::QueueEmpty)?;

        let handler = self.registry.lock().unwrap().find(buffer.header.data_type);
        let handler = match handler {
            Some(handler) => handler,
            None => {
                // The transport was unregistered while the frame sat on the
                // queue; fail the stale entry instead of dispatching it.
                logging::warn!(self.log, "dropping queued frame without transport";
                               "data_type" => buffer.header.data_type);
                self.tx_complete(buffer);
                return Err(MarshallerError::NoTransport);
            }
        };

        handler.handle(self, &mut buffer);
        buffer.header.state = state::OK;
        self.tx_data(buffer)
    }

    /// Finalise the transport header of a filled buffer and put it on the
    /// wire through its connector.
    pub fn tx_data(&self, buffer: Buffer) -> Result<()> {
        let slot = match self.slot(buffer.connector()) {
            Some(slot) => slot,
            None => return Err(MarshallerError::InvalidParameter),
        };
        self.tx_buffer(&slot, buffer)
    }

    fn tx_buffer(&self, slot: &Slot, mut buffer: Buffer) -> Result<()> {
        buffer.header.length = buffer.used() as u32;
        buffer.header.checksum = crc16(buffer.payload());
        slot.conn.transmit(self, buffer)
    }

    /// Timer tick; call every [`TICK_MS`] milliseconds. Advances the frame
    /// assembly timeouts and runs the registered poll callbacks.
    pub fn tick(&self) {
        let handlers = self.registry.lock().unwrap().handlers();
        for handler in handlers {
            handler.poll();
        }

        let slots: Vec<Arc<Slot>> = self.slots.lock().unwrap().iter().flatten().cloned().collect();
        for slot in slots {
            // A held scanner lock means the ingress thread is active right
            // now, which restarts the timeout anyway.
            if let Ok(mut guard) = slot.rx.try_lock() {
                let rx = &mut *guard;
                if rx.monitor_timeout {
                    rx.elapsed_ms += TICK_MS;
                    if rx.elapsed_ms > slot.config.timeout_ms {
                        logging::debug!(slot.log, "frame assembly timed out";
                                        "elapsed_ms" => rx.elapsed_ms);
                        self.reset_rx(&slot, rx);
                    }
                }
            }
            slot.conn.poll();
        }
    }

    /// Tear everything down: transports first, then connectors.
    pub fn stop(&self) {
        let handlers = {
            let mut registry = self.registry.lock().unwrap();
            let handlers = registry.handlers();
            registry.clear();
            handlers
        };
        for handler in handlers {
            handler.deinit();
        }

        let slots: Vec<Arc<Slot>> = {
            let mut slots = self.slots.lock().unwrap();
            slots.iter_mut().filter_map(|s| s.take()).collect()
        };
        for slot in slots {
            slot.conn.deinit();
        }

        self.pending.lock().unwrap().clear();
    }
}

/// Ingress: the receive state machine.
impl Marshaller {
    /// Push bytes received from the wire into the connector's scanner.
    /// Complete admin frames are answered synchronously; data frames are
    /// acknowledged and queued for [`Marshaller::dispatch_one`].
    pub fn rx_data(&self, id: ConnectorId, data: &[u8]) -> Result<()> {
        let slot = self.slot(id).ok_or(MarshallerError::InvalidParameter)?;
        let mut guard = slot.rx.lock().unwrap();
        let rx = &mut *guard;

        if rx.mode == Mode::Disabled {
            return Err(MarshallerError::InvalidParameter);
        }

        // The line is alive, restart the assembly timeout.
        rx.elapsed_ms = 0;

        let mut data = data;
        loop {
            let advanced = match rx.scan {
                Scan::SearchCookie => self.scan_cookie(rx, &mut data),
                Scan::SearchHeader => self.scan_header(&slot, rx, &mut data),
                Scan::WaitData => self.wait_data(rx, &mut data),
                Scan::CheckFrame => {
                    self.check_frame(&slot, rx);
                    self.reset_rx(&slot, rx);
                    !data.is_empty()
                }
            };

            if !advanced {
                return Ok(());
            }
        }
    }

    /// Slide a four-byte window over the input until the start-of-frame
    /// cookie appears. Arbitrary leading junk is tolerated.
    fn scan_cookie(&self, rx: &mut RxState, data: &mut &[u8]) -> bool {
        let input: &[u8] = *data;

        for (idx, &byte) in input.iter().enumerate() {
            rx.raw_header[rx.offset] = byte;
            rx.offset += 1;

            if rx.offset >= 4 {
                if LittleEndian::read_u32(&rx.raw_header[..4]) == COOKIE {
                    *data = &input[idx + 1..];
                    rx.scan = Scan::SearchHeader;
                    rx.monitor_timeout = true;
                    return true;
                }
                rx.raw_header.copy_within(1..4, 0);
                rx.offset = 3;
            }
        }

        *data = &input[input.len()..];
        false
    }

    /// Accumulate the remainder of the transport header, then claim a
    /// buffer for the announced payload.
    fn scan_header(&self, slot: &Slot, rx: &mut RxState, data: &mut &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }

        let input: &[u8] = *data;
        let copy = input.len().min(HEADER_SIZE - rx.offset);
        let offset = rx.offset;
        rx.raw_header[offset..offset + copy].copy_from_slice(&input[..copy]);
        rx.offset += copy;

        if rx.offset < HEADER_SIZE {
            return false;
        }

        let header = TransportHeader::decode(&rx.raw_header);

        if header.data_type == DT_ACKNOWLEDGE {
            // Acknowledges carry no payload and claim no buffer; any bytes
            // behind the header restart the cookie hunt.
            *data = &input[copy..];
            self.reset_rx(slot, rx);
            return !data.is_empty();
        }

        let kind = if header.data_type == DT_KEEP_ALIVE {
            BufferKind::KeepAlive
        } else {
            BufferKind::Rx
        };

        let buffer = slot.pool.lock().unwrap().acquire(kind);
        match buffer {
            None => {
                self.send_ack(slot, &header, state::RESOURCE_ERROR);
                self.reset_rx(slot, rx);
                true
            }
            Some(buffer) if (buffer.capacity() as u32) < header.length => {
                self.send_ack(slot, &header, state::BUFFER_OVERFLOW);
                slot.pool.lock().unwrap().release(buffer);
                self.reset_rx(slot, rx);
                true
            }
            Some(mut buffer) => {
                *data = &input[copy..];
                buffer.header = header;
                rx.current = Some(buffer);
                rx.scan = Scan::WaitData;
                true
            }
        }
    }

    /// Copy payload bytes into the current buffer until the declared length
    /// is reached. Surplus input stays in the stream for the next frame.
    fn wait_data(&self, rx: &mut RxState, data: &mut &[u8]) -> bool {
        let length = {
            let buffer = rx.current.as_ref().expect("scanner must own an rx buffer");
            buffer.header.length as usize
        };

        if length == 0 {
            rx.scan = Scan::CheckFrame;
            return true;
        }

        let input: &[u8] = *data;
        let received = rx.offset - HEADER_SIZE;
        let copy = input.len().min(length - received);

        if copy > 0 {
            let buffer = rx.current.as_mut().expect("scanner must own an rx buffer");
            buffer.area_mut()[received..received + copy].copy_from_slice(&input[..copy]);
            buffer.set_used(received + copy);
        }

        rx.offset += copy;
        *data = &input[copy..];

        if rx.offset < HEADER_SIZE + length {
            false
        } else {
            rx.scan = Scan::CheckFrame;
            true
        }
    }

    /// Verify the checksum of the assembled frame and route it: admin
    /// frames are served in place, data frames go to the request queue.
    fn check_frame(&self, slot: &Slot, rx: &mut RxState) {
        let header = rx.current.as_ref().expect("scanner must own an rx buffer").header;

        if header.length > 0 && header.checksum != 0 {
            let computed = {
                let buffer = rx.current.as_ref().expect("scanner must own an rx buffer");
                crc16(buffer.payload())
            };
            if computed != header.checksum {
                logging::debug!(slot.log, "frame checksum mismatch";
                                "expected" => header.checksum,
                                "computed" => computed);
                self.send_ack(slot, &header, state::CHECKSUM_ERROR);
                return;
            }
        }

        match header.data_type {
            DT_QUERY_SERVER => self.handle_query_server(slot, rx, &header),
            DT_KEEP_ALIVE => self.handle_keep_alive(slot, rx, &header),
            _ => {
                let handler = self.registry.lock().unwrap().find(header.data_type);
                if handler.is_none() {
                    self.send_ack(slot, &header, state::DATA_TYPE_UNKNOWN);
                    return;
                }

                self.send_ack(slot, &header, state::OK);

                let buffer = rx.current.take().expect("scanner must own an rx buffer");
                self.pending.lock().unwrap().push_back(buffer);
                (self.request_hook)();
            }
        }
    }

    /// Built-in QueryServer admin command: acknowledge, then describe the
    /// server in the same buffer.
    fn handle_query_server(&self, slot: &Slot, rx: &mut RxState, header: &TransportHeader) {
        self.send_ack(slot, header, state::OK);

        let mut buffer = match rx.current.take() {
            Some(buffer) => buffer,
            None => return,
        };

        let reply = QueryServerReply {
            server_name: self.server_name.clone(),
            version: SERVER_VERSION,
            features: FEATURE_KEEP_ALIVE,
            parallel_services: slot.config.rx_buffer_count as u32,
            buffer_size: slot.config.rx_buffer_size as u32,
            data_types: self.registry.lock().unwrap().data_types(),
        };

        if reply.encoded_len() > buffer.capacity() {
            slot.pool.lock().unwrap().release(buffer);
            return;
        }

        let used = reply.encode(buffer.area_mut());
        buffer.set_used(used);

        if let Err(err) = self.tx_buffer(slot, buffer) {
            logging::warn!(slot.log, "query server reply not transmitted"; "error" => %err);
        }
    }

    /// Built-in keep-alive handshake: echo a matching ComID, hand out a
    /// fresh one for ComID 0, NAK everything else.
    fn handle_keep_alive(&self, slot: &Slot, rx: &mut RxState, header: &TransportHeader) {
        let mut ack_state = state::OK;
        let mut reply = false;
        let mut com_id = 0u32;

        if header.length as usize != KEEP_ALIVE_PAYLOAD_SIZE {
            ack_state = state::LENGTH_INCOMPLETE;
        } else {
            com_id = {
                let buffer = rx.current.as_ref().expect("scanner must own an rx buffer");
                LittleEndian::read_u32(&buffer.payload()[..4])
            };

            if com_id == 0 {
                // Fresh ComID: non-zero, and different from the previous one
                // so a renegotiation is observable.
                let mut next = self.tick_count();
                if next == rx.keep_alive_id {
                    next = !next;
                }
                if next == 0 {
                    next = rx.keep_alive_id.wrapping_add(1);
                    if next == 0 {
                        next = 1;
                    }
                }

                rx.keep_alive_id = next;
                com_id = next;
                reply = true;
            } else if com_id != rx.keep_alive_id {
                ack_state = state::KEEP_ALIVE_ERROR;
            } else {
                reply = true;
            }
        }

        self.send_ack(slot, header, ack_state);

        if reply {
            let mut buffer = rx.current.take().expect("scanner must own an rx buffer");
            LittleEndian::write_u32(&mut buffer.area_mut()[..4], com_id);
            buffer.set_used(KEEP_ALIVE_PAYLOAD_SIZE);

            if let Err(err) = self.tx_buffer(slot, buffer) {
                logging::warn!(slot.log, "keep-alive reply not transmitted"; "error" => %err);
            }
        }
    }

    /// Emit an acknowledge for the given request header. The Ack list is
    /// over-provisioned; if it is empty nevertheless, the frame is dropped
    /// silently.
    fn send_ack(&self, slot: &Slot, header: &TransportHeader, ack_state: u8) {
        let ack = slot.pool.lock().unwrap().acquire(BufferKind::Ack);
        let mut ack = match ack {
            Some(ack) => ack,
            None => return,
        };

        ack.header = *header;
        ack.header.data_type = DT_ACKNOWLEDGE;
        ack.header.state = ack_state;
        ack.set_used(0);

        if let Err(err) = self.tx_buffer(slot, ack) {
            logging::trace!(slot.log, "acknowledge not transmitted"; "error" => %err);
        }
    }

    /// Abort any frame assembly in progress and return the scanner to the
    /// cookie hunt, releasing the current buffer if one is owned.
    fn reset_rx(&self, slot: &Slot, rx: &mut RxState) {
        rx.monitor_timeout = false;
        rx.elapsed_ms = 0;
        rx.raw_header = [0; HEADER_SIZE];
        rx.offset = 0;

        if let Some(buffer) = rx.current.take() {
            slot.pool.lock().unwrap().release(buffer);
        }

        rx.scan = Scan::SearchCookie;
    }
}
