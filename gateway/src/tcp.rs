//! TCP connector: binds one client byte stream to a marshaller connector
//! slot.
//!
//! The accept loop polls the listener once a second. A connected client is
//! read on its own thread with a five second idle timeout; keep-alives are
//! expected to arrive well inside that window, so an idle socket is treated
//! as dead and closed. A second client connecting while one is being served
//! is closed immediately.

use marshaller::frame::HEADER_SIZE;
use marshaller::{logging, Buffer, Connector, ConnectorId, Marshaller, MarshallerError, Result};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_secs(1);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpConnector {
    stream: Mutex<Option<TcpStream>>,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    log: logging::Logger,
}

impl TcpConnector {
    pub fn new(log: &logging::Logger) -> TcpConnector {
        TcpConnector {
            stream: Mutex::new(None),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            log: log.new(logging::o!("connector" => "tcp")),
        }
    }

    /// Adopt a freshly accepted client. Fails when one is already served.
    fn attach(&self, stream: TcpStream) -> bool {
        let mut guard = self.stream.lock().unwrap();
        if guard.is_some() {
            return false;
        }
        *guard = Some(stream);
        true
    }

    fn detach(&self) {
        let mut guard = self.stream.lock().unwrap();
        if let Some(stream) = guard.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        logging::debug!(self.log, "client detached";
                        "rx_bytes" => self.rx_bytes.load(Ordering::Relaxed),
                        "tx_bytes" => self.tx_bytes.load(Ordering::Relaxed));
    }
}

impl Connector for TcpConnector {
    /// Frames go out as one `header ∥ payload` write. The buffer is always
    /// returned to the core, transmitted or not.
    fn transmit(&self, core: &Marshaller, buffer: Buffer) -> Result<()> {
        let mut raw = [0u8; HEADER_SIZE];
        buffer.header.encode(&mut raw);

        let result = {
            let guard = self.stream.lock().unwrap();
            match guard.as_ref() {
                Some(stream) => {
                    let mut writer = stream;
                    writer
                        .write_all(&raw)
                        .and_then(|()| writer.write_all(buffer.payload()))
                }
                None => Err(std::io::ErrorKind::NotConnected.into()),
            }
        };

        if result.is_ok() {
            self.tx_bytes.fetch_add(
                (HEADER_SIZE + buffer.used()) as u64,
                Ordering::Relaxed,
            );
        }

        core.tx_complete(buffer);
        result.map_err(MarshallerError::Io)
    }

    fn deinit(&self) {
        self.detach();
    }
}

/// Accept clients on `listener` and feed their bytes into the core.
/// Runs until `running` is cleared.
pub fn serve(
    core: Arc<Marshaller>,
    connector: Arc<TcpConnector>,
    id: ConnectorId,
    listener: TcpListener,
    running: Arc<AtomicBool>,
    log: logging::Logger,
) {
    listener
        .set_nonblocking(true)
        .expect("nonblocking listener setup failed");

    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let reader = match stream.try_clone() {
                    Ok(reader) => reader,
                    Err(err) => {
                        logging::warn!(log, "cloning client socket failed"; "error" => %err);
                        continue;
                    }
                };

                if !connector.attach(stream) {
                    // One client at a time; the newcomer is dropped.
                    logging::info!(log, "rejecting second client"; "peer" => %peer);
                    let _ = reader.shutdown(Shutdown::Both);
                    continue;
                }

                logging::info!(log, "client connected"; "peer" => %peer);

                let core = core.clone();
                let connector = connector.clone();
                let running = running.clone();
                let log = log.new(logging::o!("peer" => peer.to_string()));

                thread::spawn(move || {
                    client_loop(&core, &connector, id, reader, &running, &log);
                });
            }

            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }

            Err(err) => {
                logging::warn!(log, "accept failed"; "error" => %err);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Blocking read loop of one client.
fn client_loop(
    core: &Marshaller,
    connector: &TcpConnector,
    id: ConnectorId,
    mut stream: TcpStream,
    running: &AtomicBool,
    log: &logging::Logger,
) {
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(READ_TIMEOUT));

    let mut buf = [0u8; 2048];

    while running.load(Ordering::Relaxed) {
        match stream.read(&mut buf) {
            Ok(0) => {
                logging::info!(log, "client closed the connection");
                break;
            }

            Ok(count) => {
                connector.rx_bytes.fetch_add(count as u64, Ordering::Relaxed);
                if let Err(err) = core.rx_data(id, &buf[..count]) {
                    logging::warn!(log, "ingress rejected"; "error" => %err);
                }
            }

            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,

            Err(ref err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                // No traffic, not even keep-alives: treat the peer as gone.
                logging::info!(log, "client idle, closing");
                break;
            }

            Err(err) => {
                logging::warn!(log, "read failed"; "error" => %err);
                break;
            }
        }
    }

    connector.detach();
}
