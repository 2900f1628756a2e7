// CLI entry point for the relay server.
//
// Binds the listener, drives every relay OFF, and serves one panel client
// at a time until Ctrl+C. Relay outputs go to the in-memory line table;
// wiring real GPIO is done by embedding the library with another
// `OutputLines` implementation.
//
// Usage:
//   relay-server [OPTIONS]
//     --config <PATH>              JSON config file ("server" section)
//     --debug                      Log every frame
//     --bind <ADDR>                Listen address (default: 0.0.0.0)
//     --port <PORT>                Listen port (default: 9000)
//     --relay-pins <P1,P2,..>      Relay output pins (default: 4,5,6,27)
//     --liveness-interval-ms <MS>  Probe interval (default: 30000)
//     --probe-window-ms <MS>       Probe reply window (default: 1000)
//     --poll-interval-ms <MS>      Loop tick (default: 20)

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use relay_panel::config::{ServerOverrides, resolve_server};
use relay_panel::logging::init_logging;
use relay_panel::{ServerError, SimulatedLines, start_server};

#[derive(Debug, Parser)]
#[command(name = "relay-server", version, about = "Relay server for the remote relay panel")]
struct Cli {
    /// JSON config file; its "server" section is applied before any flags
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log every frame sent and received
    #[arg(long, short)]
    debug: bool,

    #[command(flatten)]
    overrides: ServerOverrides,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(e) = run(cli) {
        error!("relay-server failed: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), ServerError> {
    let config = resolve_server(cli.config.as_deref(), cli.overrides)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)).map_err(io::Error::other)?;

    let (handle, addr) = start_server(config, Box::new(SimulatedLines::new()))?;
    info!("Relay server listening on {addr}");
    info!("Press Ctrl+C to stop.");

    while running.load(Ordering::SeqCst) && handle.is_running() {
        thread::sleep(Duration::from_millis(100));
    }

    info!("Shutting down...");
    handle.stop();
    Ok(())
}
