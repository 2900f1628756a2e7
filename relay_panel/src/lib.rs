// relay_panel: relay server and button-panel client for the remote relay link.
//
// Two long-running processes share one TCP connection. The server owns the
// relay output lines, executes `relayN_ON/OFF` commands, and probes the
// client with `PING`. The client owns the buttons and indicator LEDs,
// forwards debounced button edges, probes the server with `ping`, and
// reconnects with bounded backoff when the link is lost. Whenever a server
// session ends, every relay is forced OFF before the next client is
// accepted.
//
// Module overview:
// - `server.rs`:   TCP listener and the server's `ServerState` machine
//                  (Listening → Connected → Active → Closing).
// - `session.rs`:  One client session: handshake, command dispatch, liveness
//                  probe with command deferral, fail-safe teardown.
// - `client.rs`:   The panel's `ClientState` machine (Disconnected →
//                  Connecting → AwaitReady → Active → Reconnecting).
// - `link.rs`:     Framed TCP connection with a reader thread feeding an
//                  `mpsc` channel; `recv_timeout` is the readiness wait.
// - `relays.rs`:   `RelayBank`, the relay output lines and fail-safe shutoff.
// - `debounce.rs`: Confirm-step edge detector and `ButtonLine`.
// - `liveness.rs`: `LivenessMonitor` and reconnect `BackoffPolicy`.
// - `lines.rs`:    `InputLines`/`OutputLines` traits and `SimulatedLines`.
// - `config.rs`:   Defaults, JSON config file, CLI overrides, validation.
// - `error.rs`:    `ServerError` and `ClientError`.
// - `logging.rs`:  `env_logger` setup for the binaries.
//
// Dependencies: `relay_panel_protocol` (tokens and framing). Everything runs
// on std threads and blocking sockets; there is no async runtime.
//
// Both sides can run as standalone binaries (`src/bin/`) or be embedded via
// the library API (`start_server`, `start_client`).

pub mod client;
pub mod config;
pub mod debounce;
pub mod error;
pub mod lines;
pub mod link;
pub mod liveness;
pub mod logging;
pub mod relays;
pub mod server;
pub mod session;

pub use client::{ClientConfig, ClientHandle, RelayClient, start_client};
pub use error::{ClientError, ServerError};
pub use lines::{InputLines, OutputLines, SimulatedLines};
pub use server::{ServerConfig, ServerHandle, start_server};
