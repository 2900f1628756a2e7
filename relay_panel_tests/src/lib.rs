// Test-only harness for end-to-end relay panel tests.
//
// Wraps a real relay server (`start_server`) and a real panel client
// (`start_client`), each on its own `SimulatedLines` pin table, so a test
// can press buttons on the panel and watch relay outputs on the server:
// press → relayN_ON → relay pin HIGH → rNon → status LED lit.
//
// `FakeRelayServer` is a scripted stand-in for the server side, speaking
// raw frames, for scenarios the real server never produces (a bad
// handshake, a server that stops answering probes).
//
// The only test-specific code here is the waiting and scripting wrappers.
// All networking, session, and debounce logic runs through the same code
// paths as the binaries.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::io::{BufReader, BufWriter, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use relay_panel::liveness::BackoffPolicy;
use relay_panel::{
    ClientConfig, ClientError, ClientHandle, ServerConfig, ServerHandle, SimulatedLines,
    start_client, start_server,
};
use relay_panel_protocol::{read_message, write_message};

/// Default timeout for blocking waits.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between condition checks.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if cond() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Loopback server config on an OS-assigned port.
pub fn test_server_config() -> ServerConfig {
    ServerConfig {
        bind_addr: Ipv4Addr::LOCALHOST,
        port: 0,
        ..ServerConfig::default()
    }
}

/// Client config pointed at `addr`, with a short debounce and fast backoff.
pub fn test_client_config(addr: SocketAddr) -> ClientConfig {
    let server = match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => SocketAddrV4::new(Ipv4Addr::LOCALHOST, addr.port()),
    };
    ClientConfig {
        server,
        debounce: Duration::from_millis(2),
        handshake_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        backoff: BackoffPolicy {
            initial: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            max_retries: 5,
        },
        ..ClientConfig::default()
    }
}

/// A real relay server with simulated relay outputs.
pub struct TestRelayHost {
    handle: Option<ServerHandle>,
    config: ServerConfig,
    pub addr: SocketAddr,
    pub lines: SimulatedLines,
}

impl TestRelayHost {
    pub fn start() -> Self {
        Self::start_with(test_server_config())
    }

    pub fn start_with(config: ServerConfig) -> Self {
        let lines = SimulatedLines::new();
        let (handle, addr) = start_server(config.clone(), Box::new(lines.clone()))
            .expect("TestRelayHost::start failed");
        Self {
            handle: Some(handle),
            config,
            addr,
            lines,
        }
    }

    /// Output pin driving relay `n` (1-based).
    pub fn relay_pin(&self, n: u8) -> u8 {
        self.config.relay_pins[usize::from(n) - 1]
    }

    pub fn relay_on(&self, n: u8) -> bool {
        self.lines.is_high(self.relay_pin(n))
    }

    /// Block until relay `n` reaches the given state.
    pub fn wait_relay(&self, n: u8, on: bool) -> bool {
        wait_until(WAIT_TIMEOUT, || self.relay_on(n) == on)
    }

    /// Stop the server, then start a fresh one on the same port with the
    /// same pin table.
    pub fn restart(&mut self) {
        self.shutdown();
        let config = ServerConfig {
            port: self.addr.port(),
            ..self.config.clone()
        };
        let (handle, addr) = start_server(config, Box::new(self.lines.clone()))
            .expect("TestRelayHost::restart failed");
        self.handle = Some(handle);
        self.addr = addr;
    }

    /// Stop the server; the listener is closed when this returns.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }
}

impl Drop for TestRelayHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A real panel client with simulated buttons and LEDs.
pub struct TestPanel {
    handle: Option<ClientHandle>,
    config: ClientConfig,
    pub lines: SimulatedLines,
}

impl TestPanel {
    pub fn connect(addr: SocketAddr) -> Self {
        Self::start_with(test_client_config(addr))
    }

    pub fn start_with(config: ClientConfig) -> Self {
        let lines = SimulatedLines::new();
        let handle = start_client(config.clone(), Box::new(lines.clone()), Box::new(lines.clone()))
            .expect("TestPanel::start failed");
        Self {
            handle: Some(handle),
            config,
            lines,
        }
    }

    fn button_pin(&self, n: u8) -> u8 {
        self.config.button_pins[usize::from(n) - 1]
    }

    /// Hold button `n` (1-based) down.
    pub fn press(&self, n: u8) {
        let pin = self.button_pin(n);
        self.lines.set_level(pin, !self.config.active_low);
    }

    pub fn release(&self, n: u8) {
        let pin = self.button_pin(n);
        self.lines.set_level(pin, self.config.active_low);
    }

    pub fn status_led(&self) -> bool {
        self.lines.is_high(self.config.status_led_pin)
    }

    pub fn network_led(&self) -> bool {
        self.config
            .network_led_pin
            .is_some_and(|pin| self.lines.is_high(pin))
    }

    /// Block until the network LED shows the link is up.
    pub fn wait_connected(&self) -> bool {
        wait_until(WAIT_TIMEOUT, || self.network_led())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(ClientHandle::is_finished)
    }

    /// Send CLOSE and wait for the client to exit.
    pub fn stop(mut self) -> Result<(), ClientError> {
        self.handle.take().map_or(Ok(()), ClientHandle::stop)
    }

    /// Wait for the client to exit on its own.
    pub fn join(mut self) -> Result<(), ClientError> {
        self.handle.take().map_or(Ok(()), ClientHandle::join)
    }
}

impl Drop for TestPanel {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.stop();
        }
    }
}

/// Scripted server end speaking raw frames.
pub struct FakeRelayServer {
    listener: TcpListener,
}

impl FakeRelayServer {
    pub fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").expect("bind failed"),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("local_addr failed")
    }

    /// Wait for the next client connection.
    pub fn accept(&self) -> RawPeer {
        let (stream, _) = self.listener.accept().expect("accept failed");
        RawPeer::new(stream)
    }
}

/// One raw framed TCP connection.
pub struct RawPeer {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl RawPeer {
    pub fn connect(addr: SocketAddr) -> Self {
        RawPeer::new(TcpStream::connect(addr).expect("connect failed"))
    }

    fn new(stream: TcpStream) -> Self {
        stream
            .set_read_timeout(Some(WAIT_TIMEOUT))
            .expect("set_read_timeout failed");
        Self {
            reader: BufReader::new(stream.try_clone().expect("clone failed")),
            writer: BufWriter::new(stream),
        }
    }

    pub fn send(&mut self, token: &str) {
        write_message(&mut self.writer, token.as_bytes()).expect("send failed");
        self.writer.flush().expect("flush failed");
    }

    /// Next frame as text; panics on timeout or EOF.
    pub fn recv(&mut self) -> String {
        self.try_recv().expect("recv failed")
    }

    /// Next frame as text, or `None` on timeout or EOF.
    pub fn try_recv(&mut self) -> Option<String> {
        let bytes = read_message(&mut self.reader).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Wait for a specific token, answering any `PING` along the way.
    pub fn recv_answering(&mut self, expected: &str) -> String {
        loop {
            let token = self.recv();
            if token == "PING" && expected != "PING" {
                self.send("OK");
                continue;
            }
            assert_eq!(token, expected);
            return token;
        }
    }

    /// Change how long `recv` waits.
    pub fn set_timeout(&self, timeout: Duration) {
        self.writer
            .get_ref()
            .set_read_timeout(Some(timeout))
            .expect("set_read_timeout failed");
    }
}
