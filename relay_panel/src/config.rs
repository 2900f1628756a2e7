// Startup configuration for both binaries.
//
// Each binary starts from its `*Config::default()` (the deployment's
// historical constants), applies the matching section of an optional JSON
// file, then applies any flags given on the command line. The override
// structs serve as both the clap flag group and the serde schema, so a
// field means the same thing in either place:
//
//   {
//     "server": { "port": 9100, "relay_pins": [4, 5] },
//     "client": { "server": "192.168.1.20", "port": 9100, "debounce_ms": 15 }
//   }
//
// Durations are whole milliseconds (`*_ms`). The resolved config is
// validated before anything touches a socket or a pin.

use std::collections::BTreeSet;
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use relay_panel_protocol::MAX_RELAYS;
use serde::Deserialize;
use thiserror::Error;

use crate::client::ClientConfig;
use crate::server::ServerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("expected 1..={MAX_RELAYS} relay pins, got {0}")]
    BadRelayCount(usize),
    #[error("at most {MAX_RELAYS} buttons are supported, got {0}")]
    TooManyButtons(usize),
    #[error("pin {0} is assigned more than once")]
    DuplicatePin(u8),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("probe window ({window:?}) must be shorter than the liveness interval ({interval:?})")]
    ProbeWindowTooLong {
        window: Duration,
        interval: Duration,
    },
    #[error("reading config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Contents of a `--config` file. Either section may be omitted.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub server: ServerOverrides,
    pub client: ClientOverrides,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Args, Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerOverrides {
    /// Address to listen on [default: 0.0.0.0]
    #[arg(long)]
    pub bind: Option<Ipv4Addr>,

    /// Port to listen on [default: 9000]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Output pin for each relay, relay 1 first [default: 4,5,6,27]
    #[arg(long, value_delimiter = ',')]
    pub relay_pins: Option<Vec<u8>>,

    /// Probe the client after this long without a confirmed reply [default: 30000]
    #[arg(long)]
    pub liveness_interval_ms: Option<u64>,

    /// How long the client has to answer a probe [default: 1000]
    #[arg(long)]
    pub probe_window_ms: Option<u64>,

    /// Longest wait between checks in the session loop [default: 20]
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
}

impl ServerOverrides {
    pub fn apply(self, config: &mut ServerConfig) {
        set(&mut config.bind_addr, self.bind);
        set(&mut config.port, self.port);
        set(&mut config.relay_pins, self.relay_pins);
        set_ms(&mut config.liveness_interval, self.liveness_interval_ms);
        set_ms(&mut config.probe_window, self.probe_window_ms);
        set_ms(&mut config.poll_interval, self.poll_interval_ms);
    }
}

#[derive(Args, Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientOverrides {
    /// Relay server address [default: 127.0.0.1]
    #[arg(long)]
    pub server: Option<Ipv4Addr>,

    /// Relay server port [default: 9000]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Input pin for each button, button 1 first [default: 4,5,6,27]
    #[arg(long, value_delimiter = ',')]
    pub button_pins: Option<Vec<u8>>,

    /// Whether a pressed button reads LOW [default: true]
    #[arg(long)]
    pub active_low: Option<bool>,

    /// Status LED pin, lit while any relay is on [default: 25]
    #[arg(long)]
    pub status_led_pin: Option<u8>,

    /// Network LED pin, lit while connected [default: 24]
    #[arg(long)]
    pub network_led_pin: Option<u8>,

    /// Debounce window [default: 10]
    #[arg(long)]
    pub debounce_ms: Option<u64>,

    /// Probe the server after this long without a confirmed reply [default: 35000]
    #[arg(long)]
    pub liveness_interval_ms: Option<u64>,

    /// How long the server has to answer a probe [default: 1000]
    #[arg(long)]
    pub probe_window_ms: Option<u64>,

    /// Control loop tick [default: 5]
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// How long to wait for READY after connecting [default: 5000]
    #[arg(long)]
    pub handshake_timeout_ms: Option<u64>,

    /// TCP connect timeout [default: 5000]
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// First reconnect delay, doubled on each failure [default: 250]
    #[arg(long)]
    pub backoff_initial_ms: Option<u64>,

    /// Longest reconnect delay [default: 30000]
    #[arg(long)]
    pub backoff_max_ms: Option<u64>,

    /// Consecutive reconnect attempts before giving up [default: 10]
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl ClientOverrides {
    pub fn apply(self, config: &mut ClientConfig) {
        let ip = self.server.unwrap_or(*config.server.ip());
        let port = self.port.unwrap_or(config.server.port());
        config.server = SocketAddrV4::new(ip, port);
        set(&mut config.button_pins, self.button_pins);
        set(&mut config.active_low, self.active_low);
        set(&mut config.status_led_pin, self.status_led_pin);
        if self.network_led_pin.is_some() {
            config.network_led_pin = self.network_led_pin;
        }
        set_ms(&mut config.debounce, self.debounce_ms);
        set_ms(&mut config.liveness_interval, self.liveness_interval_ms);
        set_ms(&mut config.probe_window, self.probe_window_ms);
        set_ms(&mut config.poll_interval, self.poll_interval_ms);
        set_ms(&mut config.handshake_timeout, self.handshake_timeout_ms);
        set_ms(&mut config.connect_timeout, self.connect_timeout_ms);
        set_ms(&mut config.backoff.initial, self.backoff_initial_ms);
        set_ms(&mut config.backoff.max_delay, self.backoff_max_ms);
        set(&mut config.backoff.max_retries, self.max_retries);
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn set_ms(slot: &mut Duration, ms: Option<u64>) {
    set(slot, ms.map(Duration::from_millis));
}

/// Defaults, then the file's `server` section, then the command line.
pub fn resolve_server(
    file: Option<&Path>,
    cli: ServerOverrides,
) -> Result<ServerConfig, ConfigError> {
    let mut config = ServerConfig::default();
    if let Some(path) = file {
        ConfigFile::load(path)?.server.apply(&mut config);
    }
    cli.apply(&mut config);
    validate_server(&config)?;
    Ok(config)
}

/// Defaults, then the file's `client` section, then the command line.
pub fn resolve_client(
    file: Option<&Path>,
    cli: ClientOverrides,
) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();
    if let Some(path) = file {
        ConfigFile::load(path)?.client.apply(&mut config);
    }
    cli.apply(&mut config);
    validate_client(&config)?;
    Ok(config)
}

pub fn validate_server(config: &ServerConfig) -> Result<(), ConfigError> {
    let count = config.relay_pins.len();
    if count == 0 || count > usize::from(MAX_RELAYS) {
        return Err(ConfigError::BadRelayCount(count));
    }
    unique_pins(config.relay_pins.iter().copied())?;
    nonzero("poll_interval", config.poll_interval)?;
    liveness(config.liveness_interval, config.probe_window)
}

pub fn validate_client(config: &ClientConfig) -> Result<(), ConfigError> {
    if config.button_pins.len() > usize::from(MAX_RELAYS) {
        return Err(ConfigError::TooManyButtons(config.button_pins.len()));
    }
    unique_pins(
        config
            .button_pins
            .iter()
            .copied()
            .chain([config.status_led_pin])
            .chain(config.network_led_pin),
    )?;
    nonzero("poll_interval", config.poll_interval)?;
    nonzero("handshake_timeout", config.handshake_timeout)?;
    nonzero("connect_timeout", config.connect_timeout)?;
    nonzero("backoff_initial", config.backoff.initial)?;
    liveness(config.liveness_interval, config.probe_window)
}

fn unique_pins(pins: impl IntoIterator<Item = u8>) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for pin in pins {
        if !seen.insert(pin) {
            return Err(ConfigError::DuplicatePin(pin));
        }
    }
    Ok(())
}

fn nonzero(name: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(ConfigError::ZeroDuration(name))
    } else {
        Ok(())
    }
}

fn liveness(interval: Duration, window: Duration) -> Result<(), ConfigError> {
    nonzero("liveness_interval", interval)?;
    nonzero("probe_window", window)?;
    if window >= interval {
        return Err(ConfigError::ProbeWindowTooLong { window, interval });
    }
    Ok(())
}
