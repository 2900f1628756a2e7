// Protocol messages exchanged between the panel client and the relay server.
//
// One enum covers the whole vocabulary in both directions. Each variant has
// exactly one wire token:
//
//   server -> client   READY, PING, ok, rNon, rNoff
//   client -> server   OK, ping, relayN_ON, relayN_OFF, CLOSE, HELP
//
// `Display` renders the token and `FromStr` parses it back. Matching is exact
// and case-sensitive (`PING` and `ping` are different messages) after
// trimming surrounding whitespace, so older peers that terminate tokens with
// a newline still parse. Prefix matching is deliberately not supported:
// frames already delimit messages (see `framing.rs`).

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::types::{RelayId, RelayState};

/// Text the server sends back in answer to `HELP`.
pub const USAGE_TEXT: &str = "relay#_ON/relay#_OFF w/#=1-4";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message {
    /// Handshake sent by the server once a connection is accepted.
    Ready,
    /// Server-initiated liveness probe.
    Ping,
    /// Client answer to `Ping` (`OK`).
    PingReply,
    /// Client-initiated liveness probe (lowercase `ping`).
    ClientPing,
    /// Server answer to `ClientPing` (lowercase `ok`).
    ClientPingReply,
    /// Drive a relay (`relayN_ON` / `relayN_OFF`).
    Switch { relay: RelayId, state: RelayState },
    /// Server confirmation that a relay was driven (`rNon` / `rNoff`).
    Ack { relay: RelayId, state: RelayState },
    /// Graceful session teardown requested by the client.
    Close,
    /// Request for the usage text.
    Help,
}

impl Message {
    /// Encode as a frame payload.
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Decode a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if !payload.is_ascii() {
            return Err(ProtocolError::NotText);
        }
        std::str::from_utf8(payload)
            .map_err(|_| ProtocolError::NotText)?
            .parse()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("READY"),
            Self::Ping => f.write_str("PING"),
            Self::PingReply => f.write_str("OK"),
            Self::ClientPing => f.write_str("ping"),
            Self::ClientPingReply => f.write_str("ok"),
            Self::Switch { relay, state } => write!(f, "relay{relay}_{state}"),
            Self::Ack {
                relay,
                state: RelayState::On,
            } => write!(f, "r{relay}on"),
            Self::Ack {
                relay,
                state: RelayState::Off,
            } => write!(f, "r{relay}off"),
            Self::Close => f.write_str("CLOSE"),
            Self::Help => f.write_str("HELP"),
        }
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        let message = match token {
            "READY" => Self::Ready,
            "PING" => Self::Ping,
            "OK" => Self::PingReply,
            "ping" => Self::ClientPing,
            "ok" => Self::ClientPingReply,
            "CLOSE" => Self::Close,
            "HELP" => Self::Help,
            _ => parse_switch(token)
                .or_else(|| parse_ack(token))
                .ok_or_else(|| ProtocolError::UnknownToken(token.to_string()))?,
        };
        Ok(message)
    }
}

/// `relayN_ON` / `relayN_OFF`.
fn parse_switch(token: &str) -> Option<Message> {
    let (index, state) = token.strip_prefix("relay")?.split_once('_')?;
    let state = match state {
        "ON" => RelayState::On,
        "OFF" => RelayState::Off,
        _ => return None,
    };
    Some(Message::Switch {
        relay: parse_index(index)?,
        state,
    })
}

/// `rNon` / `rNoff`.
fn parse_ack(token: &str) -> Option<Message> {
    let rest = token.strip_prefix('r')?;
    let (index, state) = if let Some(index) = rest.strip_suffix("off") {
        (index, RelayState::Off)
    } else {
        (rest.strip_suffix("on")?, RelayState::On)
    };
    Some(Message::Ack {
        relay: parse_index(index)?,
        state,
    })
}

/// A single decimal digit naming a configured relay.
fn parse_index(digits: &str) -> Option<RelayId> {
    if digits.len() != 1 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    RelayId::new(digits.parse().ok()?).ok()
}
