use clap::{App, Arg};
use marshaller::frame::DEFAULT_PORT;
use marshaller::logging;
use marshaller::marshaller::TICK_MS;
use marshaller::{ConnectorConfig, Marshaller, MarshallerParams};
use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use cifx::{CifxTransport, DownloadHook, SimDriver};

mod config;
mod storage;
mod tcp;

use crate::config::GatewayConfig;
use crate::storage::DiskStorage;
use crate::tcp::TcpConnector;

fn main() {
    let matches = App::new("Fieldbus Gateway")
        .version("0.1.0")
        .about("Exposes locally attached fieldbus controller boards to remote clients.")
        .arg(Arg::with_name("CONFIG_FILE").help("Path to the config file"))
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .takes_value(true)
                .help("Listen on this TCP port instead of the configured address"),
        )
        .get_matches();

    let mut config = match matches.value_of("CONFIG_FILE") {
        Some(path) => GatewayConfig::load(path),
        None => GatewayConfig::default(),
    };

    let logger = logging::init(&config.log.level);

    // Driver stack: the simulated boards behind the download hook, which
    // stores captured images on disk.
    let sim = Arc::new(SimDriver::new(config.sim_boards()));
    let disk = Arc::new(DiskStorage::new(&config.storage.download_dir[..], &logger));
    let driver = Arc::new(DownloadHook::new(sim, disk, &logger));

    // The request notification wakes the dispatcher thread.
    let signal = Arc::new((Mutex::new(false), Condvar::new()));
    let notify = signal.clone();

    let core = Arc::new(Marshaller::new(
        MarshallerParams {
            server_name: config.server.server_name.clone(),
            max_connectors: config.server.max_connectors,
            max_transports: 4,
        },
        Box::new(move || {
            let (pending, wakeup) = &*notify;
            *pending.lock().unwrap() = true;
            wakeup.notify_one();
        }),
        &logger,
    ));

    CifxTransport::install(&core, driver, &logger).expect("Error installing the device transport");

    let connector = Arc::new(TcpConnector::new(&logger));
    let id = core
        .register_connector(
            connector.clone(),
            ConnectorConfig {
                rx_buffer_count: config.connector.rx_buffer_count,
                rx_buffer_size: config.connector.rx_buffer_size,
                tx_buffer_count: config.connector.tx_buffer_count,
                tx_buffer_size: config.connector.tx_buffer_size,
                timeout_ms: config.connector.timeout_ms,
            },
        )
        .expect("Error registering the TCP connector");

    let address = match matches.value_of("port") {
        Some(port) => format!("0.0.0.0:{}", port),
        None => config
            .server
            .address
            .take()
            .unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_PORT)),
    };

    let listener = TcpListener::bind(&address).expect("Error binding the listen socket");
    logging::info!(logger, "gateway listening";
                   "address" => &address,
                   "server_name" => &config.server.server_name);

    let running = Arc::new(AtomicBool::new(true));

    // Ctrl-C clears the running flag; the accept loop, the client readers
    // and the worker threads all watch it and wind down.
    {
        let running = running.clone();
        let logger = logger.new(logging::o!());
        ctrlc::set_handler(move || {
            logging::info!(logger, "shutdown requested");
            running.store(false, std::sync::atomic::Ordering::Relaxed);
        })
        .expect("Error installing the shutdown handler");
    }

    // Timer thread: drives the frame timeouts and poll callbacks.
    {
        let core = core.clone();
        let running = running.clone();
        thread::spawn(move || {
            while running.load(std::sync::atomic::Ordering::Relaxed) {
                core.tick();
                thread::sleep(Duration::from_millis(u64::from(TICK_MS)));
            }
        });
    }

    // Dispatcher thread: drains the request queue whenever the core
    // signals new work.
    {
        let core = core.clone();
        let running = running.clone();
        let signal = signal.clone();
        thread::spawn(move || {
            let (pending, wakeup) = &*signal;

            while running.load(std::sync::atomic::Ordering::Relaxed) {
                {
                    let mut flagged = pending.lock().unwrap();
                    while !*flagged {
                        let (guard, _timeout) = wakeup
                            .wait_timeout(flagged, Duration::from_millis(500))
                            .unwrap();
                        flagged = guard;
                        if !running.load(std::sync::atomic::Ordering::Relaxed) {
                            return;
                        }
                    }
                    *flagged = false;
                }

                while core.dispatch_one().is_ok() {}
            }
        });
    }

    tcp::serve(core.clone(), connector, id, listener, running, logger);

    // The accept loop has returned; tear down transports and connectors.
    core.stop();
}
