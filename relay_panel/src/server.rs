// TCP server and session state machine for the relay side of the link.
//
// The server serves one client at a time. Its whole life is a loop over an
// explicit `ServerState`, advanced by `Server::transition`:
//
//   Listening ──accept──▶ Connected ──READY──▶ Active ──▶ Closing ──▶ Listening
//                                      │                     ▲
//                                      └──write failed───────┘
//
// - **Listening**: non-blocking `accept()` polled every `ACCEPT_POLL` so the
//   `keep_running` flag is noticed. Further clients wait in the OS backlog
//   until the current session ends.
// - **Connected**: wrap the stream in a `Link` (spawning its reader thread)
//   and send `READY`.
// - **Active**: one step per iteration. A due liveness probe always runs
//   before any pending command. Otherwise the loop blocks on the link's
//   channel until a frame arrives, the next probe falls due, or the tick
//   expires, whichever is first.
// - **Closing**: force every relay OFF, close the link, log the reason.
//
// The `RelayBank` lives on `Server`, not on the session, and is only touched
// from this thread, so it needs no locking.
//
// Shutdown: `ServerHandle::stop` clears `keep_running`; an active session is
// torn down (relays OFF) before the thread exits.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::error::ServerError;
use crate::lines::OutputLines;
use crate::link::Link;
use crate::relays::RelayBank;
use crate::session::{Dispatch, Session, TeardownReason};

/// How often the listener re-checks `keep_running` while idle.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Configuration for starting a relay server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: Ipv4Addr,
    pub port: u16,
    /// Output pin for each relay; entry N-1 drives relay N.
    pub relay_pins: Vec<u8>,
    /// Probe the client when it has been this long since the last `OK`.
    pub liveness_interval: Duration,
    /// How long to wait for `OK` after sending `PING`.
    pub probe_window: Duration,
    /// Upper bound on one blocking wait in the active loop.
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            port: 9000,
            relay_pins: vec![4, 5, 6, 27],
            liveness_interval: Duration::from_secs(30),
            probe_window: Duration::from_secs(1),
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Where the server is in its connection lifecycle.
pub enum ServerState {
    Listening,
    Connected {
        stream: TcpStream,
        peer: SocketAddr,
    },
    Active(Session),
    Closing {
        session: Session,
        reason: TeardownReason,
    },
}

/// Handle returned by `start_server` to control the running server.
pub struct ServerHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// Signal the server to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// False once the server thread has exited.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Bind the listener, take ownership of the relay outputs (driving them all
/// OFF), and run the server on a background thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used to
/// let the OS pick a free port).
pub fn start_server(
    config: ServerConfig,
    outputs: Box<dyn OutputLines + Send>,
) -> Result<(ServerHandle, SocketAddr), ServerError> {
    let relays = RelayBank::new(&config.relay_pins, outputs)?;

    let bind = SocketAddrV4::new(config.bind_addr, config.port);
    let listener = TcpListener::bind(bind).map_err(|source| ServerError::Bind {
        addr: bind,
        source,
    })?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let server = Server {
        config,
        relays,
        listener,
        keep_running: keep_running.clone(),
    };
    let thread = thread::spawn(move || server.run());

    Ok((
        ServerHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

struct Server {
    config: ServerConfig,
    relays: RelayBank,
    listener: TcpListener,
    keep_running: Arc<AtomicBool>,
}

impl Server {
    fn run(mut self) {
        info!(
            "Starting server: {} relay(s) on pins {:?}",
            self.relays.lines().len(),
            self.config.relay_pins
        );
        let mut state = ServerState::Listening;
        while let Some(next) = self.transition(state) {
            state = next;
        }
        // Nothing should be ON here, but the outputs outlive this thread.
        self.relays.all_off();
        info!("server stopped");
    }

    /// Advance the state machine by one step. `None` means the server is
    /// done.
    fn transition(&mut self, state: ServerState) -> Option<ServerState> {
        match state {
            ServerState::Listening => self.accept(),
            ServerState::Connected { stream, peer } => Some(self.open_session(stream, peer)),
            ServerState::Active(session) => Some(self.step_active(session)),
            ServerState::Closing { session, reason } => {
                self.close_session(session, reason);
                Some(ServerState::Listening)
            }
        }
    }

    fn running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }

    fn accept(&mut self) -> Option<ServerState> {
        while self.running() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!("Connection request from {peer}");
                    return Some(ServerState::Connected { stream, peer });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        None
    }

    fn open_session(&mut self, stream: TcpStream, peer: SocketAddr) -> ServerState {
        let link = match Link::from_stream(stream) {
            Ok(link) => link,
            Err(e) => {
                // No session existed, so no relay can have been switched.
                error!("could not set up link to {peer}: {e}");
                return ServerState::Listening;
            }
        };
        let mut session = Session::new(
            link,
            self.config.liveness_interval,
            self.config.probe_window,
        );
        match session.greet() {
            Ok(()) => ServerState::Active(session),
            Err(reason) => ServerState::Closing { session, reason },
        }
    }

    fn step_active(&mut self, mut session: Session) -> ServerState {
        if !self.running() {
            return ServerState::Closing {
                session,
                reason: TeardownReason::Shutdown,
            };
        }

        if session.probe_due(Instant::now()) {
            if let Err(reason) = session.probe() {
                return ServerState::Closing { session, reason };
            }
        }

        let wait = session.wait_budget(Instant::now(), self.config.poll_interval);
        let Some(inbound) = session.next_inbound(wait) else {
            return ServerState::Active(session);
        };
        match session.handle_inbound(inbound, &mut self.relays) {
            Dispatch::Continue => ServerState::Active(session),
            Dispatch::Close(reason) => ServerState::Closing { session, reason },
        }
    }

    fn close_session(&mut self, session: Session, reason: TeardownReason) {
        let peer = session.peer();
        match reason {
            TeardownReason::CloseRequested | TeardownReason::Shutdown => {
                info!("{reason} ({peer})");
            }
            _ => warn!("{reason} ({peer})"),
        }
        let released = session.teardown(&mut self.relays);
        if !released.is_empty() {
            let ids: Vec<String> = released.iter().map(ToString::to_string).collect();
            info!("fail-safe: relay(s) {} forced OFF", ids.join(", "));
        }
    }
}
