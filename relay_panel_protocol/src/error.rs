// Errors raised while decoding wire tokens.

use thiserror::Error;

use crate::types::MAX_RELAYS;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame held text that is not part of the vocabulary.
    #[error("unknown token {0:?}")]
    UnknownToken(String),
    #[error("relay index {0} out of range (1..={MAX_RELAYS})")]
    RelayOutOfRange(u8),
    #[error("frame payload is not ASCII text")]
    NotText,
}
