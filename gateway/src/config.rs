use cifx::SimBoard;
use marshaller::frame::DEFAULT_PORT;
use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::path::Path;

#[derive(Serialize, Deserialize)]
pub struct Server {
    /// Listen address; `0.0.0.0:<default port>` when absent.
    pub address: Option<String>,
    pub server_name: String,
    pub max_connectors: usize,
}

#[derive(Serialize, Deserialize)]
pub struct Connector {
    pub rx_buffer_count: usize,
    pub rx_buffer_size: usize,
    pub tx_buffer_count: usize,
    pub tx_buffer_size: usize,
    /// Frame assembly timeout in milliseconds.
    pub timeout_ms: u32,
}

#[derive(Serialize, Deserialize)]
pub struct Log {
    pub level: String,
}

#[derive(Serialize, Deserialize)]
pub struct Storage {
    /// Captured download images are written below this directory.
    pub download_dir: String,
}

/// One simulated board; the gateway serves these when no real driver is
/// linked in.
#[derive(Serialize, Deserialize)]
pub struct Board {
    pub name: String,
    pub alias: Option<String>,
    pub device_number: u32,
    pub serial_number: u32,
    pub channels: u32,
    pub flash: bool,
}

#[derive(Serialize, Deserialize)]
pub struct GatewayConfig {
    pub server: Server,
    pub connector: Connector,
    pub log: Log,
    pub storage: Storage,
    pub board: Vec<Board>,
}

impl Default for GatewayConfig {
    fn default() -> GatewayConfig {
        GatewayConfig {
            server: Server {
                address: Some(format!("0.0.0.0:{}", DEFAULT_PORT)),
                server_name: "Fieldbus Gateway".into(),
                max_connectors: 2,
            },
            connector: Connector {
                rx_buffer_count: 8,
                rx_buffer_size: 6144,
                tx_buffer_count: 2,
                tx_buffer_size: 6144,
                timeout_ms: 3000,
            },
            log: Log {
                level: "info".into(),
            },
            storage: Storage {
                download_dir: "downloads".into(),
            },
            board: vec![Board {
                name: "cifX0".into(),
                alias: None,
                device_number: 7_833_000,
                serial_number: 20_001,
                channels: 1,
                flash: false,
            }],
        }
    }
}

impl GatewayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> GatewayConfig {
        serdeconv::from_toml_file(path).expect("Error loading gateway configuration file")
    }

    pub fn sim_boards(&self) -> Vec<SimBoard> {
        self.board
            .iter()
            .map(|board| SimBoard {
                name: board.name.clone(),
                alias: board.alias.clone().unwrap_or_default(),
                device_number: board.device_number,
                serial_number: board.serial_number,
                channel_count: board.channels,
                has_file_system: board.flash,
            })
            .collect()
    }
}
