// CLI entry point for the button-panel client.
//
// Connects to the relay server and forwards button presses until Ctrl+C (or
// `quit`), then sends CLOSE. Buttons are simulated lines driven from stdin:
//
//   press 2      hold button 2 down
//   release 2    let it go
//   quit         close the link and exit
//
// Exit status is non-zero when the first connection or handshake fails, or
// when the link cannot be re-established within the retry budget.
//
// Usage:
//   relay-client [OPTIONS]
//     --config <PATH>           JSON config file ("client" section)
//     --debug                   Log every frame
//     --server <ADDR>           Server address (default: 127.0.0.1)
//     --port <PORT>             Server port (default: 9000)
//     --button-pins <P1,..>     Button input pins (default: 4,5,6,27)
//     --debounce-ms <MS>        Debounce window (default: 10)
//     (see --help for the full list)

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use clap::Parser;
use log::{error, info, warn};
use relay_panel::config::{ClientOverrides, resolve_client};
use relay_panel::logging::init_logging;
use relay_panel::{ClientConfig, ClientError, RelayClient, SimulatedLines};

#[derive(Debug, Parser)]
#[command(name = "relay-client", version, about = "Button-panel client for the remote relay panel")]
struct Cli {
    /// JSON config file; its "client" section is applied before any flags
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log every frame sent and received
    #[arg(long, short)]
    debug: bool,

    #[command(flatten)]
    overrides: ClientOverrides,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Press(usize),
    Release(usize),
    Quit,
}

fn parse_command(line: &str) -> Option<ConsoleCommand> {
    let mut words = line.split_whitespace();
    let verb = words.next()?;
    if verb == "quit" {
        return Some(ConsoleCommand::Quit);
    }
    let n: usize = words.next()?.parse().ok()?;
    if n == 0 || words.next().is_some() {
        return None;
    }
    match verb {
        "press" => Some(ConsoleCommand::Press(n)),
        "release" => Some(ConsoleCommand::Release(n)),
        _ => None,
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(e) = run(cli) {
        error!("relay-client failed: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), ClientError> {
    let config = resolve_client(cli.config.as_deref(), cli.overrides)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)).map_err(io::Error::other)?;

    let lines = SimulatedLines::new();
    spawn_console(&config, lines.clone(), running.clone());

    let mut client = RelayClient::new(config, Box::new(lines.clone()), Box::new(lines))?;
    client.run(&running)
}

/// Read button commands from stdin on a background thread. End of input
/// leaves the client running; only `quit` stops it.
fn spawn_console(config: &ClientConfig, lines: SimulatedLines, running: Arc<AtomicBool>) {
    let pins = config.button_pins.clone();
    let active_low = config.active_low;
    // Idle level: released.
    for &pin in &pins {
        lines.set_level(pin, active_low);
    }
    info!("Type `press N`, `release N` or `quit`.");

    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let (n, pressed) = match parse_command(&line) {
                Some(ConsoleCommand::Press(n)) => (n, true),
                Some(ConsoleCommand::Release(n)) => (n, false),
                Some(ConsoleCommand::Quit) => {
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                None => {
                    warn!("unrecognised input {line:?}");
                    continue;
                }
            };
            match pins.get(n - 1) {
                Some(&pin) => lines.set_level(pin, pressed != active_low),
                None => warn!("no button {n} (have {})", pins.len()),
            }
        }
    });
}
