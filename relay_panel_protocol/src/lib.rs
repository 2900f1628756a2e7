// relay_panel_protocol: wire protocol for the remote relay panel link.
//
// This crate defines the token vocabulary and framing used between the
// panel client (buttons + status LEDs) and the relay server (relay output
// lines). It is shared by both sides and has no I/O of its own beyond the
// generic `Read`/`Write` framing helpers.
//
// Module overview:
// - `types.rs`:    `RelayId` (1..=4) and `RelayState` (ON/OFF).
// - `message.rs`:  `Message`, one variant per wire token, with `Display`
//                  and `FromStr` for the exact ASCII text.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream:
//                  4-byte big-endian length prefix, then the token.
// - `error.rs`:    `ProtocolError` for tokens that do not decode.
//
// Design decisions:
// - **Plain ASCII tokens.** The payload of each frame is the same short text
//   the panel hardware has always spoken (`READY`, `relay1_ON`, `r1on`, ...),
//   so a capture of the link stays human-readable.
// - **Explicit framing.** TCP has no message boundaries; the length prefix
//   makes one frame exactly one message regardless of how the bytes were
//   segmented.
// - **No async runtime.** Framing uses `std::io::Read`/`Write`, compatible
//   with blocking TCP streams and buffered wrappers.

pub mod error;
pub mod framing;
pub mod message;
pub mod types;

pub use error::ProtocolError;
pub use framing::{MAX_MESSAGE_SIZE, read_message, write_message};
pub use message::{Message, USAGE_TEXT};
pub use types::{MAX_RELAYS, RelayId, RelayState};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Frame a sequence of messages, then read and decode them back.
    fn through_wire(messages: &[Message]) -> Vec<Message> {
        let mut wire = Vec::new();
        for msg in messages {
            write_message(&mut wire, &msg.encode()).unwrap();
        }
        let mut cursor = Cursor::new(&wire);
        messages
            .iter()
            .map(|_| Message::decode(&read_message(&mut cursor).unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn button_press_conversation() {
        let relay1 = RelayId::new(1).unwrap();
        let conversation = [
            Message::Ready,
            Message::Switch {
                relay: relay1,
                state: RelayState::On,
            },
            Message::Ack {
                relay: relay1,
                state: RelayState::On,
            },
            Message::Ping,
            Message::PingReply,
            Message::Switch {
                relay: relay1,
                state: RelayState::Off,
            },
            Message::Ack {
                relay: relay1,
                state: RelayState::Off,
            },
            Message::Close,
        ];
        assert_eq!(through_wire(&conversation), conversation);
    }

    #[test]
    fn usage_text_fits_in_a_frame() {
        let mut wire = Vec::new();
        write_message(&mut wire, USAGE_TEXT.as_bytes()).unwrap();
        let payload = read_message(&mut Cursor::new(&wire)).unwrap();
        assert_eq!(payload, USAGE_TEXT.as_bytes());
        // The usage text is informational, not a protocol message.
        assert!(Message::decode(&payload).is_err());
    }
}
