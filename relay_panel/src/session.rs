// Per-connection session state for the relay server.
//
// `Session` is what the server's `Active` state holds: the client link, the
// liveness monitor, and a queue of commands deferred while a probe was in
// flight. The relay outputs themselves live in the server's `RelayBank`
// and are passed in by reference, since they outlive any one session.
//
// Key responsibilities:
// - Handshake: `greet` sends `READY`.
// - Dispatch: map each inbound message onto the relay bank and reply
//   (`rNon`/`rNoff` for switches, `ok` for client pings, usage text for
//   `HELP`). Unknown or misdirected messages are logged and ignored; the
//   session stays open.
// - Liveness: `probe` sends `PING` and waits a fixed window for `OK`.
//   Well-formed commands that arrive during the window are queued and
//   dispatched afterwards, in order. Silence, EOF, or an unrecognised frame
//   in place of the reply ends the session.
// - Teardown: `teardown` forces every relay OFF before the link is closed.
//   Every path out of a session goes through it.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use relay_panel_protocol::{Message, RelayId, RelayState, USAGE_TEXT};

use crate::link::{Inbound, Link};
use crate::liveness::LivenessMonitor;
use crate::relays::{RelayBank, RelayError};

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownReason {
    /// The client sent `CLOSE`.
    CloseRequested,
    /// No `OK` arrived within the probe window.
    ProbeTimeout,
    /// Something other than `OK` answered the probe.
    ProbeMismatch,
    /// EOF or a read error on the socket.
    PeerDisconnected,
    /// A reply could not be written.
    WriteFailed,
    /// The server is stopping.
    Shutdown,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CloseRequested => "Received CLOSE from client",
            Self::ProbeTimeout => "client did not answer PING",
            Self::ProbeMismatch => "client answered PING with an unexpected reply",
            Self::PeerDisconnected => "Unexpected close with client",
            Self::WriteFailed => "write to client failed",
            Self::Shutdown => "server shutting down",
        })
    }
}

/// Outcome of handling one inbound event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Close(TeardownReason),
}

pub struct Session {
    link: Link,
    liveness: LivenessMonitor,
    probe_window: Duration,
    deferred: VecDeque<Message>,
    last_activity: Instant,
    commands_handled: u64,
}

impl Session {
    pub fn new(link: Link, liveness_interval: Duration, probe_window: Duration) -> Self {
        let now = Instant::now();
        Self {
            link,
            liveness: LivenessMonitor::new(liveness_interval, now),
            probe_window,
            deferred: VecDeque::new(),
            last_activity: now,
            commands_handled: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.link.peer()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn commands_handled(&self) -> u64 {
        self.commands_handled
    }

    /// Send the `READY` handshake.
    pub fn greet(&mut self) -> Result<(), TeardownReason> {
        self.send(&Message::Ready)
    }

    pub fn probe_due(&self, now: Instant) -> bool {
        self.liveness.is_due(now)
    }

    /// How long the loop may block before the next probe falls due, capped
    /// at `tick` so shutdown requests are noticed promptly.
    pub fn wait_budget(&self, now: Instant, tick: Duration) -> Duration {
        if self.deferred.is_empty() {
            self.liveness.time_until_due(now).min(tick)
        } else {
            Duration::ZERO
        }
    }

    /// Send `PING` and wait up to the probe window for `OK`.
    pub fn probe(&mut self) -> Result<(), TeardownReason> {
        debug!("probing {}", self.peer());
        self.send(&Message::Ping)?;
        let deadline = Instant::now() + self.probe_window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TeardownReason::ProbeTimeout);
            }
            match self.link.recv_timeout(remaining) {
                None => return Err(TeardownReason::ProbeTimeout),
                Some(Inbound::Message(Message::PingReply)) => {
                    let now = Instant::now();
                    self.liveness.confirm(now);
                    self.last_activity = now;
                    return Ok(());
                }
                Some(Inbound::Message(other)) => {
                    debug!("deferring {other} until probe completes");
                    self.deferred.push_back(other);
                }
                Some(Inbound::Unknown(text)) => {
                    warn!("expected OK from {}, got {text:?}", self.peer());
                    return Err(TeardownReason::ProbeMismatch);
                }
                Some(Inbound::Closed) => return Err(TeardownReason::PeerDisconnected),
            }
        }
    }

    /// Next event to handle: deferred commands first, then the socket.
    pub fn next_inbound(&mut self, wait: Duration) -> Option<Inbound> {
        if let Some(msg) = self.deferred.pop_front() {
            return Some(Inbound::Message(msg));
        }
        self.link.recv_timeout(wait)
    }

    pub fn handle_inbound(&mut self, inbound: Inbound, relays: &mut RelayBank) -> Dispatch {
        match inbound {
            Inbound::Message(msg) => {
                self.last_activity = Instant::now();
                self.dispatch(msg, relays)
            }
            Inbound::Unknown(text) => {
                self.last_activity = Instant::now();
                warn!("unknown command from {}: {text:?}", self.peer());
                Dispatch::Continue
            }
            Inbound::Closed => Dispatch::Close(TeardownReason::PeerDisconnected),
        }
    }

    /// Act on one message from the client.
    pub fn dispatch(&mut self, msg: Message, relays: &mut RelayBank) -> Dispatch {
        let result = match msg {
            Message::Switch { relay, state } => self.switch(relay, state, relays),
            Message::ClientPing => self.send(&Message::ClientPingReply),
            Message::Help => self
                .link
                .send_text(USAGE_TEXT)
                .map_err(|_| TeardownReason::WriteFailed),
            Message::Close => Err(TeardownReason::CloseRequested),
            Message::PingReply => {
                debug!("unsolicited OK from {}", self.peer());
                Ok(())
            }
            Message::Ready
            | Message::Ping
            | Message::ClientPingReply
            | Message::Ack { .. } => {
                warn!("ignoring server-side message {msg} from {}", self.peer());
                Ok(())
            }
        };
        match result {
            Ok(()) => Dispatch::Continue,
            Err(reason) => Dispatch::Close(reason),
        }
    }

    fn switch(
        &mut self,
        relay: RelayId,
        state: RelayState,
        relays: &mut RelayBank,
    ) -> Result<(), TeardownReason> {
        match relays.switch(relay, state) {
            Ok(()) => {
                self.commands_handled += 1;
                self.send(&Message::Ack { relay, state })
            }
            Err(e @ RelayError::Unconfigured(_)) => {
                warn!("{e}; command ignored");
                Ok(())
            }
            Err(e) => {
                // The line may be in any state; do not confirm it.
                warn!("{e}");
                Ok(())
            }
        }
    }

    /// Force every relay OFF, then close the link. Returns the relays that
    /// were released.
    pub fn teardown(mut self, relays: &mut RelayBank) -> Vec<RelayId> {
        let released = relays.all_off();
        self.link.close();
        info!(
            "session with {} ended after {} command(s)",
            self.peer(),
            self.commands_handled
        );
        released
    }

    fn send(&mut self, msg: &Message) -> Result<(), TeardownReason> {
        self.link.send(msg).map_err(|e| {
            warn!("sending {msg} to {}: {e}", self.link.peer());
            TeardownReason::WriteFailed
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, BufWriter};
    use std::net::{TcpListener, TcpStream};

    use relay_panel_protocol::{read_message, write_message};

    use super::*;
    use crate::lines::SimulatedLines;

    const PINS: [u8; 4] = [4, 5, 6, 27];

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    /// A session on the server half plus raw framed access to the client half.
    fn session_pair(
        interval: Duration,
        window: Duration,
    ) -> (Session, BufReader<TcpStream>, BufWriter<TcpStream>) {
        let (client, server) = tcp_pair();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let session = Session::new(Link::from_stream(server).unwrap(), interval, window);
        let reader = BufReader::new(client.try_clone().unwrap());
        (session, reader, BufWriter::new(client))
    }

    fn recv(reader: &mut BufReader<TcpStream>) -> String {
        String::from_utf8(read_message(reader).unwrap()).unwrap()
    }

    fn send(writer: &mut BufWriter<TcpStream>, token: &str) {
        write_message(writer, token.as_bytes()).unwrap();
    }

    fn relay(n: u8) -> RelayId {
        RelayId::new(n).unwrap()
    }

    fn bank() -> (RelayBank, SimulatedLines) {
        let lines = SimulatedLines::new();
        (
            RelayBank::new(&PINS, Box::new(lines.clone())).unwrap(),
            lines,
        )
    }

    const LONG: Duration = Duration::from_secs(30);
    const WINDOW: Duration = Duration::from_secs(1);

    #[test]
    fn greet_sends_ready() {
        let (mut session, mut reader, _writer) = session_pair(LONG, WINDOW);
        session.greet().unwrap();
        assert_eq!(recv(&mut reader), "READY");
    }

    #[test]
    fn switch_is_acknowledged() {
        let (mut session, mut reader, _writer) = session_pair(LONG, WINDOW);
        let (mut relays, lines) = bank();

        let on = Message::Switch {
            relay: relay(3),
            state: RelayState::On,
        };
        assert_eq!(session.dispatch(on, &mut relays), Dispatch::Continue);
        assert_eq!(recv(&mut reader), "r3on");
        assert!(lines.is_high(6));
        assert_eq!(session.commands_handled(), 1);
    }

    #[test]
    fn unconfigured_relay_gets_no_ack() {
        let (mut session, mut reader, _writer) = session_pair(LONG, WINDOW);
        let lines = SimulatedLines::new();
        let mut relays = RelayBank::new(&[4], Box::new(lines)).unwrap();

        let msg = Message::Switch {
            relay: relay(2),
            state: RelayState::On,
        };
        assert_eq!(session.dispatch(msg, &mut relays), Dispatch::Continue);
        session.dispatch(Message::ClientPing, &mut relays);
        // The next thing on the wire is the ping reply, not an ack.
        assert_eq!(recv(&mut reader), "ok");
    }

    #[test]
    fn help_answers_with_usage() {
        let (mut session, mut reader, _writer) = session_pair(LONG, WINDOW);
        let (mut relays, _lines) = bank();
        assert_eq!(
            session.dispatch(Message::Help, &mut relays),
            Dispatch::Continue
        );
        assert_eq!(recv(&mut reader), USAGE_TEXT);
    }

    #[test]
    fn close_ends_the_session() {
        let (mut session, _reader, _writer) = session_pair(LONG, WINDOW);
        let (mut relays, _lines) = bank();
        assert_eq!(
            session.dispatch(Message::Close, &mut relays),
            Dispatch::Close(TeardownReason::CloseRequested)
        );
    }

    #[test]
    fn unknown_and_misdirected_messages_keep_session_open() {
        let (mut session, _reader, _writer) = session_pair(LONG, WINDOW);
        let (mut relays, _lines) = bank();
        assert_eq!(
            session.handle_inbound(Inbound::Unknown("FOO".into()), &mut relays),
            Dispatch::Continue
        );
        assert_eq!(
            session.dispatch(Message::Ready, &mut relays),
            Dispatch::Continue
        );
        assert!(relays.lines().iter().all(|l| !l.state.is_on()));
    }

    #[test]
    fn probe_confirmed_by_ok() {
        let (mut session, mut reader, mut writer) =
            session_pair(Duration::ZERO, Duration::from_secs(5));
        assert!(session.probe_due(Instant::now()));

        let replier = std::thread::spawn(move || {
            assert_eq!(recv(&mut reader), "PING");
            send(&mut writer, "OK");
            (reader, writer)
        });
        assert_eq!(session.probe(), Ok(()));
        let _keep_open = replier.join().unwrap();
    }

    #[test]
    fn probe_times_out_on_silence() {
        let (mut session, mut reader, _writer) =
            session_pair(Duration::ZERO, Duration::from_millis(50));
        assert_eq!(session.probe(), Err(TeardownReason::ProbeTimeout));
        assert_eq!(recv(&mut reader), "PING");
    }

    #[test]
    fn probe_rejects_garbage_reply() {
        let (mut session, _reader, mut writer) =
            session_pair(Duration::ZERO, Duration::from_secs(5));
        send(&mut writer, "NOPE");
        assert_eq!(session.probe(), Err(TeardownReason::ProbeMismatch));
    }

    #[test]
    fn commands_during_probe_are_deferred_in_order() {
        let (mut session, _reader, mut writer) =
            session_pair(Duration::ZERO, Duration::from_secs(5));
        send(&mut writer, "relay1_ON");
        send(&mut writer, "relay2_ON");
        send(&mut writer, "OK");
        assert_eq!(session.probe(), Ok(()));

        assert_eq!(
            session.wait_budget(Instant::now(), LONG),
            Duration::ZERO,
            "deferred work must not wait"
        );
        let first = session.next_inbound(Duration::ZERO);
        let second = session.next_inbound(Duration::ZERO);
        assert_eq!(
            first,
            Some(Inbound::Message(Message::Switch {
                relay: relay(1),
                state: RelayState::On
            }))
        );
        assert_eq!(
            second,
            Some(Inbound::Message(Message::Switch {
                relay: relay(2),
                state: RelayState::On
            }))
        );
    }

    #[test]
    fn teardown_releases_every_relay() {
        let (mut session, _reader, _writer) = session_pair(LONG, WINDOW);
        let (mut relays, lines) = bank();
        for n in [1, 4] {
            let msg = Message::Switch {
                relay: relay(n),
                state: RelayState::On,
            };
            session.dispatch(msg, &mut relays);
        }
        assert!(lines.is_high(4) && lines.is_high(27));

        let released = session.teardown(&mut relays);
        assert_eq!(released, vec![relay(1), relay(4)]);
        assert!(!lines.is_high(4));
        assert!(!lines.is_high(27));
    }
}
