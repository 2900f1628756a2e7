// Panel client: buttons in, relay commands out, over one supervised link.
//
// The client owns the button inputs and the indicator LEDs. Its life is a
// loop over an explicit `ClientState`, advanced by `RelayClient::transition`:
//
//   Disconnected ─▶ Connecting ─▶ AwaitReady ─▶ Active ─▶ Reconnecting ─┐
//        ▲              ▲                                               │
//        │              └──────────────── backoff delay ◀───────────────┘
//        └── stop requested (from any state)
//
// - **Connecting**: open a fresh TCP stream. Each attempt starts from a new
//   socket; a lost link is closed before anything else happens.
// - **AwaitReady**: wait `handshake_timeout` for `READY`. On the very first
//   attempt a refused connection or a wrong greeting is fatal; later they
//   only count against the retry budget.
// - **Active**: every `poll_interval`, wait for an inbound frame (`PING` is
//   answered with `OK`, `rNon`/`rNoff` update the status LED). If nothing
//   arrived, sample every button and send the confirmed edges. When no
//   liveness has been confirmed for `liveness_interval`, send `ping` and
//   require `ok` within `probe_window`.
// - **Reconnecting**: sleep the backoff delay for this attempt (interrupted
//   by a stop request), or give up with `ClientError::LinkDown` once the
//   retry budget is spent.
//
// On entering `Active`, every edge detector is re-armed. The server forces
// all relays OFF when a session ends, so a button still held across a
// reconnect must be reported again.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use relay_panel_protocol::{Message, RelayId, RelayState};

use crate::config::ConfigError;
use crate::debounce::ButtonLine;
use crate::error::ClientError;
use crate::lines::{InputLines, OutputLines};
use crate::link::{Inbound, Link};
use crate::liveness::{BackoffPolicy, LivenessMonitor};

/// Longest single sleep while waiting out a backoff delay, so a stop
/// request is noticed promptly.
const STOP_CHECK: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub server: SocketAddrV4,
    /// Input pin for each button; entry N-1 controls relay N.
    pub button_pins: Vec<u8>,
    /// Pressed reads LOW (button to ground with a pull-up).
    pub active_low: bool,
    /// Lit while any relay is acknowledged ON.
    pub status_led_pin: u8,
    /// Lit while the link is up.
    pub network_led_pin: Option<u8>,
    pub debounce: Duration,
    pub liveness_interval: Duration,
    pub probe_window: Duration,
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000),
            button_pins: vec![4, 5, 6, 27],
            active_low: true,
            status_led_pin: 25,
            network_led_pin: Some(24),
            debounce: Duration::from_millis(10),
            liveness_interval: Duration::from_secs(35),
            probe_window: Duration::from_secs(1),
            poll_interval: Duration::from_millis(5),
            handshake_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Why the link was dropped or could not be re-established.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkLoss {
    PeerClosed,
    ProbeUnanswered,
    WriteFailed(String),
    ConnectFailed(String),
    HandshakeFailed(String),
}

impl fmt::Display for LinkLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("server closed the connection"),
            Self::ProbeUnanswered => f.write_str("server did not answer ping"),
            Self::WriteFailed(e) => write!(f, "write to server failed: {e}"),
            Self::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            Self::HandshakeFailed(got) => write!(f, "bad handshake: {got}"),
        }
    }
}

/// Where the client is in its link lifecycle. `attempt` is 0 for the first
/// connection and counts consecutive reconnect attempts after that.
pub enum ClientState {
    Disconnected,
    Connecting {
        attempt: u32,
    },
    AwaitReady {
        link: Link,
        attempt: u32,
    },
    Active {
        link: Link,
        liveness: LivenessMonitor,
    },
    Reconnecting {
        attempt: u32,
        reason: LinkLoss,
    },
}

pub struct RelayClient {
    config: ClientConfig,
    buttons: Vec<ButtonLine>,
    inputs: Box<dyn InputLines + Send>,
    leds: Box<dyn OutputLines + Send>,
    /// Relays the server has acknowledged ON during the current session.
    acked_on: BTreeSet<RelayId>,
}

impl RelayClient {
    pub fn new(
        config: ClientConfig,
        inputs: Box<dyn InputLines + Send>,
        leds: Box<dyn OutputLines + Send>,
    ) -> Result<Self, ClientError> {
        let buttons = config
            .button_pins
            .iter()
            .enumerate()
            .map(|(i, &pin)| {
                RelayId::from_index(i)
                    .map(|relay| ButtonLine::new(relay, pin, config.active_low, config.debounce))
                    .map_err(|_| ConfigError::TooManyButtons(config.button_pins.len()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut client = Self {
            config,
            buttons,
            inputs,
            leds,
            acked_on: BTreeSet::new(),
        };
        client.set_status_led(false);
        client.set_network_led(false);
        Ok(client)
    }

    /// Run until `keep_running` is cleared (returns `Ok`) or the link is
    /// declared down.
    pub fn run(&mut self, keep_running: &AtomicBool) -> Result<(), ClientError> {
        info!(
            "Starting client: server {}, {} button(s) on pins {:?}",
            self.config.server,
            self.buttons.len(),
            self.config.button_pins
        );
        let mut state = ClientState::Disconnected;
        while let Some(next) = self.transition(state, keep_running)? {
            state = next;
        }
        info!("client stopped");
        Ok(())
    }

    /// Advance the state machine by one step. `Ok(None)` means the client
    /// stopped cleanly.
    fn transition(
        &mut self,
        state: ClientState,
        keep_running: &AtomicBool,
    ) -> Result<Option<ClientState>, ClientError> {
        let running = keep_running.load(Ordering::SeqCst);
        let next = match state {
            ClientState::Disconnected if running => ClientState::Connecting { attempt: 0 },
            ClientState::Disconnected => return Ok(None),
            ClientState::Connecting { .. } if !running => ClientState::Disconnected,
            ClientState::Connecting { attempt } => self.connect(attempt)?,
            ClientState::AwaitReady { link, attempt } => self.await_ready(link, attempt)?,
            ClientState::Active { link, liveness: _ } if !running => {
                self.shutdown(link);
                ClientState::Disconnected
            }
            ClientState::Active { link, liveness } => self.step_active(link, liveness),
            ClientState::Reconnecting { attempt, reason } => {
                self.backoff(attempt, &reason, keep_running)?
            }
        };
        Ok(Some(next))
    }

    fn connect(&mut self, attempt: u32) -> Result<ClientState, ClientError> {
        let addr = SocketAddr::V4(self.config.server);
        debug!("connecting to {addr} (attempt {attempt})");
        match Link::connect(addr, self.config.connect_timeout) {
            Ok(link) => Ok(ClientState::AwaitReady { link, attempt }),
            Err(source) if attempt == 0 => Err(ClientError::Connect { addr, source }),
            Err(e) => Ok(ClientState::Reconnecting {
                attempt: attempt + 1,
                reason: LinkLoss::ConnectFailed(e.to_string()),
            }),
        }
    }

    fn await_ready(&mut self, link: Link, attempt: u32) -> Result<ClientState, ClientError> {
        let got = match link.recv_timeout(self.config.handshake_timeout) {
            Some(Inbound::Message(Message::Ready)) => {
                info!("Connected to server {}", link.peer());
                return Ok(self.enter_active(link));
            }
            Some(Inbound::Message(other)) => other.to_string(),
            Some(Inbound::Unknown(text)) => format!("{text:?}"),
            Some(Inbound::Closed) => "connection closed".to_string(),
            None => format!("nothing within {:?}", self.config.handshake_timeout),
        };
        drop(link);
        if attempt == 0 {
            return Err(ClientError::Handshake(got));
        }
        Ok(ClientState::Reconnecting {
            attempt: attempt + 1,
            reason: LinkLoss::HandshakeFailed(got),
        })
    }

    fn enter_active(&mut self, link: Link) -> ClientState {
        self.acked_on.clear();
        self.set_status_led(false);
        self.set_network_led(true);
        for button in &mut self.buttons {
            button.rearm();
        }
        ClientState::Active {
            link,
            liveness: LivenessMonitor::new(self.config.liveness_interval, Instant::now()),
        }
    }

    fn step_active(&mut self, mut link: Link, mut liveness: LivenessMonitor) -> ClientState {
        let result = match link.recv_timeout(self.config.poll_interval) {
            Some(inbound) => self.handle_inbound(&mut link, &mut liveness, inbound),
            None => self.scan_buttons(&mut link),
        };
        let result = result.and_then(|()| {
            if liveness.is_due(Instant::now()) {
                self.probe(&mut link, &mut liveness)
            } else {
                Ok(())
            }
        });
        match result {
            Ok(()) => ClientState::Active { link, liveness },
            Err(reason) => self.lose_link(link, reason),
        }
    }

    fn handle_inbound(
        &mut self,
        link: &mut Link,
        liveness: &mut LivenessMonitor,
        inbound: Inbound,
    ) -> Result<(), LinkLoss> {
        match inbound {
            Inbound::Message(Message::Ping) => {
                send(link, &Message::PingReply)?;
                liveness.confirm(Instant::now());
            }
            Inbound::Message(Message::ClientPingReply) => liveness.confirm(Instant::now()),
            Inbound::Message(Message::Ack { relay, state }) => self.apply_ack(relay, state),
            Inbound::Message(other) => warn!("unexpected message from server: {other}"),
            Inbound::Unknown(text) => warn!("unknown message from server: {text:?}"),
            Inbound::Closed => return Err(LinkLoss::PeerClosed),
        }
        Ok(())
    }

    fn apply_ack(&mut self, relay: RelayId, state: RelayState) {
        info!("server confirmed relay {relay} {state}");
        match state {
            RelayState::On => self.acked_on.insert(relay),
            RelayState::Off => self.acked_on.remove(&relay),
        };
        self.set_status_led(!self.acked_on.is_empty());
    }

    fn scan_buttons(&mut self, link: &mut Link) -> Result<(), LinkLoss> {
        for button in &mut self.buttons {
            match button.poll(self.inputs.as_mut()) {
                Ok(Some(edge)) => {
                    let (relay, state) = (button.relay(), edge.relay_state());
                    info!("button {relay} {edge:?}");
                    send(link, &Message::Switch { relay, state })?;
                }
                Ok(None) => {}
                Err(e) => warn!("reading button {} (pin {}): {e}", button.relay(), button.pin()),
            }
        }
        Ok(())
    }

    /// Send `ping` and wait for `ok`. Other traffic is handled as usual
    /// while waiting, but only `ok` completes the probe.
    fn probe(&mut self, link: &mut Link, liveness: &mut LivenessMonitor) -> Result<(), LinkLoss> {
        debug!("probing server");
        send(link, &Message::ClientPing)?;
        let deadline = Instant::now() + self.config.probe_window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match link.recv_timeout(remaining) {
                None => return Err(LinkLoss::ProbeUnanswered),
                Some(Inbound::Message(Message::ClientPingReply)) => {
                    liveness.confirm(Instant::now());
                    return Ok(());
                }
                Some(other) => self.handle_inbound(link, liveness, other)?,
            }
        }
    }

    fn lose_link(&mut self, link: Link, reason: LinkLoss) -> ClientState {
        drop(link);
        warn!("link to server lost: {reason}");
        self.acked_on.clear();
        self.set_status_led(false);
        self.set_network_led(false);
        ClientState::Reconnecting { attempt: 1, reason }
    }

    fn backoff(
        &mut self,
        attempt: u32,
        reason: &LinkLoss,
        keep_running: &AtomicBool,
    ) -> Result<ClientState, ClientError> {
        let policy = self.config.backoff;
        if policy.exhausted(attempt) {
            return Err(ClientError::LinkDown {
                attempts: attempt - 1,
            });
        }
        let delay = policy.delay(attempt);
        info!(
            "reconnecting in {delay:?} (attempt {attempt}/{}): {reason}",
            policy.max_retries
        );
        if !sleep_while_running(delay, keep_running) {
            return Ok(ClientState::Disconnected);
        }
        Ok(ClientState::Connecting { attempt })
    }

    /// Graceful stop: tell the server, then drop the link.
    fn shutdown(&mut self, mut link: Link) {
        info!("closing link to {}", link.peer());
        if let Err(e) = link.send(&Message::Close) {
            debug!("sending CLOSE: {e}");
        }
        link.close();
        self.acked_on.clear();
        self.set_status_led(false);
        self.set_network_led(false);
    }

    fn set_status_led(&mut self, on: bool) {
        let pin = self.config.status_led_pin;
        self.set_led(pin, on);
    }

    fn set_network_led(&mut self, on: bool) {
        if let Some(pin) = self.config.network_led_pin {
            self.set_led(pin, on);
        }
    }

    fn set_led(&mut self, pin: u8, on: bool) {
        if let Err(e) = self.leds.write_line(pin, on) {
            warn!("driving LED on pin {pin}: {e}");
        }
    }
}

fn send(link: &mut Link, msg: &Message) -> Result<(), LinkLoss> {
    link.send(msg)
        .map_err(|e| LinkLoss::WriteFailed(e.to_string()))
}

/// Sleep for `total`, waking early if `keep_running` is cleared. Returns
/// false if it was.
fn sleep_while_running(total: Duration, keep_running: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if !keep_running.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(STOP_CHECK));
    }
}

/// Handle returned by `start_client` to control a client running on a
/// background thread.
pub struct ClientHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<Result<(), ClientError>>>,
}

impl ClientHandle {
    /// Ask the client to close its link and wait for it to finish.
    pub fn stop(self) -> Result<(), ClientError> {
        self.keep_running.store(false, Ordering::SeqCst);
        self.join()
    }

    /// Wait for the client to finish on its own.
    pub fn join(mut self) -> Result<(), ClientError> {
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("client thread panicked").into())),
            None => Ok(()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }
}

/// Build a client and run it on a background thread.
pub fn start_client(
    config: ClientConfig,
    inputs: Box<dyn InputLines + Send>,
    leds: Box<dyn OutputLines + Send>,
) -> Result<ClientHandle, ClientError> {
    let mut client = RelayClient::new(config, inputs, leds)?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let flag = keep_running.clone();
    let thread = thread::spawn(move || client.run(&flag));
    Ok(ClientHandle {
        keep_running,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, BufWriter, Write};
    use std::net::{TcpListener, TcpStream};

    use relay_panel_protocol::{read_message, write_message};

    use super::*;
    use crate::lines::SimulatedLines;

    const WAIT: Duration = Duration::from_secs(5);

    /// A scripted server end: one accepted connection, raw frames.
    struct FakeServer {
        reader: BufReader<TcpStream>,
        writer: BufWriter<TcpStream>,
    }

    impl FakeServer {
        fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(WAIT)).unwrap();
            Self {
                reader: BufReader::new(stream.try_clone().unwrap()),
                writer: BufWriter::new(stream),
            }
        }

        fn send(&mut self, token: &str) {
            write_message(&mut self.writer, token.as_bytes()).unwrap();
            self.writer.flush().unwrap();
        }

        fn recv(&mut self) -> String {
            String::from_utf8(read_message(&mut self.reader).unwrap()).unwrap()
        }
    }

    fn config_for(listener: &TcpListener) -> ClientConfig {
        let SocketAddr::V4(server) = listener.local_addr().unwrap() else {
            panic!("loopback listener is IPv4");
        };
        ClientConfig {
            server,
            debounce: Duration::ZERO,
            handshake_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy {
                initial: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                max_retries: 3,
            },
            ..ClientConfig::default()
        }
    }

    fn spawn(config: ClientConfig, lines: &SimulatedLines) -> ClientHandle {
        start_client(config, Box::new(lines.clone()), Box::new(lines.clone())).unwrap()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn too_many_buttons_rejected() {
        let config = ClientConfig {
            button_pins: vec![1, 2, 3, 4, 5],
            ..ClientConfig::default()
        };
        let lines = SimulatedLines::new();
        let err = RelayClient::new(config, Box::new(lines.clone()), Box::new(lines)).err();
        assert!(matches!(
            err,
            Some(ClientError::Config(ConfigError::TooManyButtons(5)))
        ));
    }

    #[test]
    fn first_connect_failure_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_for(&listener);
        drop(listener);

        let lines = SimulatedLines::new();
        let err = spawn(config, &lines).join().unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }), "{err}");
    }

    #[test]
    fn first_handshake_mismatch_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let lines = SimulatedLines::new();
        let client = spawn(config_for(&listener), &lines);

        let mut server = FakeServer::accept(&listener);
        server.send("HELLO");
        match client.join() {
            Err(ClientError::Handshake(got)) => assert!(got.contains("HELLO"), "{got}"),
            other => panic!("expected handshake error, got {other:?}"),
        }
    }

    #[test]
    fn answers_ping_and_tracks_acks() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let lines = SimulatedLines::new();
        let client = spawn(config_for(&listener), &lines);

        let mut server = FakeServer::accept(&listener);
        server.send("READY");
        assert!(wait_for(|| lines.is_high(24)), "network LED lit");

        server.send("PING");
        assert_eq!(server.recv(), "OK");

        server.send("r2on");
        assert!(wait_for(|| lines.is_high(25)));
        server.send("r3on");
        server.send("r2off");
        // Relay 3 is still acknowledged ON.
        thread::sleep(Duration::from_millis(50));
        assert!(lines.is_high(25));
        server.send("r3off");
        assert!(wait_for(|| !lines.is_high(25)));

        client.stop().unwrap();
        assert_eq!(server.recv(), "CLOSE");
        assert!(!lines.is_high(24));
    }

    #[test]
    fn button_edges_become_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let lines = SimulatedLines::new();
        let client = spawn(config_for(&listener), &lines);

        let mut server = FakeServer::accept(&listener);
        server.send("READY");

        // Button 2 is pin 5, active-low.
        lines.set_level(5, false);
        assert_eq!(server.recv(), "relay2_ON");
        lines.set_level(5, true);
        assert_eq!(server.recv(), "relay2_OFF");

        client.stop().unwrap();
        assert_eq!(server.recv(), "CLOSE");
    }

    #[test]
    fn unknown_server_message_is_ignored() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let lines = SimulatedLines::new();
        let client = spawn(config_for(&listener), &lines);

        let mut server = FakeServer::accept(&listener);
        server.send("READY");
        server.send("FOO");
        server.send("PING");
        assert_eq!(server.recv(), "OK");
        assert!(!client.is_finished());
        client.stop().unwrap();
    }

    #[test]
    fn silent_server_triggers_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let lines = SimulatedLines::new();
        let config = ClientConfig {
            liveness_interval: Duration::from_millis(100),
            probe_window: Duration::from_millis(100),
            ..config_for(&listener)
        };
        let client = spawn(config, &lines);

        let mut first = FakeServer::accept(&listener);
        first.send("READY");
        assert_eq!(first.recv(), "ping");
        // No `ok`: the client gives up on this link and dials again.
        let mut second = FakeServer::accept(&listener);
        second.send("READY");
        assert_eq!(second.recv(), "ping");
        second.send("ok");

        client.stop().unwrap();
    }

    #[test]
    fn gives_up_after_retry_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let lines = SimulatedLines::new();
        let client = spawn(config_for(&listener), &lines);

        let mut server = FakeServer::accept(&listener);
        server.send("READY");
        assert!(wait_for(|| lines.is_high(24)));
        drop(listener);
        drop(server);

        match client.join() {
            Err(ClientError::LinkDown { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected link down, got {other:?}"),
        }
        assert!(!lines.is_high(24));
    }
}
