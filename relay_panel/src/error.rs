// Top-level error types for the two binaries.
//
// Per-concern errors (`RelayError`, `ConfigError`, `ProtocolError`) live next
// to the code that raises them and convert into these via `#[from]`. Session
// failures are not errors here: a dropped or unresponsive client is an
// expected event the server recovers from, and the client's link losses are
// handled by its reconnect loop until the retry budget runs out.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use thiserror::Error;

use crate::config::ConfigError;
use crate::relays::RelayError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("expected READY from server, got {0}")]
    Handshake(String),
    #[error("link to server lost; gave up after {attempts} reconnect attempt(s)")]
    LinkDown { attempts: u32 },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
