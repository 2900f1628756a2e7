// One framed TCP connection, shared by the server session and the client.
//
// Architecture (same on both ends):
// - A background reader thread calls `read_message()` in a loop, decodes
//   each frame into a `Message`, and pushes an `Inbound` event into an
//   `mpsc` channel. On EOF or any read error it pushes `Inbound::Closed`
//   and exits.
// - The owning loop holds the write half (`BufWriter<TcpStream>`) and
//   drains the channel with `recv_timeout`. That call is the readiness
//   mechanism: it returns as soon as a frame arrives or when the timeout
//   (the next timer deadline) expires, so the loops never busy-poll the
//   socket.
//
// Only the owning loop writes to the stream; the reader thread only reads.
// `close()` (also run on drop) shuts the socket down in both directions,
// which unblocks the reader thread's pending read so it exits.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace};
use relay_panel_protocol::{Message, read_message, write_message};

/// Something that came in from the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Message(Message),
    /// A well-framed payload that is not part of the vocabulary.
    Unknown(String),
    /// The peer hung up or the stream failed.
    Closed,
}

pub struct Link {
    peer: SocketAddr,
    writer: BufWriter<TcpStream>,
    inbox: Receiver<Inbound>,
    _reader_thread: Option<JoinHandle<()>>,
}

impl Link {
    /// Open a fresh TCP connection.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Self::from_stream(stream)
    }

    /// Wrap an accepted or connected stream and spawn its reader thread.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || {
            reader_loop(reader, peer, tx);
        });

        Ok(Self {
            peer,
            writer: BufWriter::new(stream),
            inbox: rx,
            _reader_thread: Some(reader_thread),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send(&mut self, msg: &Message) -> io::Result<()> {
        debug!("-> {} {msg}", self.peer);
        write_message(&mut self.writer, &msg.encode())
    }

    /// Send free-form text (the `HELP` usage answer).
    pub fn send_text(&mut self, text: &str) -> io::Result<()> {
        debug!("-> {} {text:?}", self.peer);
        write_message(&mut self.writer, text.as_bytes())
    }

    /// Wait up to `timeout` for the next inbound event. `None` means the
    /// timeout expired with nothing to read.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Inbound> {
        match self.inbox.recv_timeout(timeout) {
            Ok(inbound) => Some(inbound),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Inbound::Closed),
        }
    }

    /// Non-blocking variant of `recv_timeout`.
    pub fn try_recv(&self) -> Option<Inbound> {
        match self.inbox.try_recv() {
            Ok(inbound) => Some(inbound),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Inbound::Closed),
        }
    }

    /// Flush and shut the socket down in both directions.
    pub fn close(&mut self) {
        let _ = self.writer.flush();
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader thread: read framed messages in a loop, push to channel.
fn reader_loop(mut reader: BufReader<TcpStream>, peer: SocketAddr, tx: Sender<Inbound>) {
    loop {
        let inbound = match read_message(&mut reader) {
            Ok(bytes) => match Message::decode(&bytes) {
                Ok(msg) => {
                    trace!("<- {peer} {msg}");
                    Inbound::Message(msg)
                }
                Err(_) => Inbound::Unknown(String::from_utf8_lossy(&bytes).into_owned()),
            },
            Err(e) => {
                debug!("link to {peer} closed: {e}");
                let _ = tx.send(Inbound::Closed);
                break;
            }
        };
        if tx.send(inbound).is_err() {
            break; // Owner dropped the link.
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use relay_panel_protocol::{RelayId, RelayState};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    /// Create a connected (client, server) link pair on localhost.
    fn link_pair() -> (Link, Link) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Link::connect(addr, WAIT).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, Link::from_stream(server).unwrap())
    }

    #[test]
    fn messages_cross_in_order() {
        let (mut client, server) = link_pair();
        let relay = RelayId::new(2).unwrap();
        client
            .send(&Message::Switch {
                relay,
                state: RelayState::On,
            })
            .unwrap();
        client.send(&Message::ClientPing).unwrap();

        assert_eq!(
            server.recv_timeout(WAIT),
            Some(Inbound::Message(Message::Switch {
                relay,
                state: RelayState::On
            }))
        );
        assert_eq!(
            server.recv_timeout(WAIT),
            Some(Inbound::Message(Message::ClientPing))
        );
        assert_eq!(server.try_recv(), None);
    }

    #[test]
    fn unknown_payloads_are_surfaced_verbatim() {
        let (mut client, server) = link_pair();
        client.send_text("FOO").unwrap();
        assert_eq!(
            server.recv_timeout(WAIT),
            Some(Inbound::Unknown("FOO".into()))
        );
    }

    #[test]
    fn idle_link_times_out_quietly() {
        let (_client, server) = link_pair();
        assert_eq!(server.recv_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn peer_close_is_reported() {
        let (client, server) = link_pair();
        drop(client);
        assert_eq!(server.recv_timeout(WAIT), Some(Inbound::Closed));
        // Stays closed once the reader thread is gone.
        assert_eq!(server.recv_timeout(WAIT), Some(Inbound::Closed));
    }
}
