// Core value types for the relay panel protocol.
//
// `RelayId` is the 1-based relay index carried inside `relayN_ON` commands
// and `rNon` acknowledgments. Buttons map onto relays by convention (button
// N drives relay N), so the client side reuses `RelayId` to name its button
// lines as well. `RelayState` is the ON/OFF half of those tokens.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Highest relay index the wire vocabulary can address.
pub const MAX_RELAYS: u8 = 4;

/// A relay index in `1..=MAX_RELAYS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct RelayId(u8);

impl RelayId {
    pub fn new(index: u8) -> Result<Self, ProtocolError> {
        if (1..=MAX_RELAYS).contains(&index) {
            Ok(Self(index))
        } else {
            Err(ProtocolError::RelayOutOfRange(index))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Zero-based position, for indexing pin tables.
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }

    /// The relay addressed by the `index`-th entry of a pin table.
    pub fn from_index(index: usize) -> Result<Self, ProtocolError> {
        let index = index
            .checked_add(1)
            .and_then(|i| u8::try_from(i).ok())
            .unwrap_or(u8::MAX);
        Self::new(index)
    }
}

impl TryFrom<u8> for RelayId {
    type Error = ProtocolError;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        Self::new(index)
    }
}

impl From<RelayId> for u8 {
    fn from(id: RelayId) -> Self {
        id.0
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical state of a relay line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayState {
    #[default]
    Off,
    On,
}

impl RelayState {
    pub fn is_on(self) -> bool {
        self == Self::On
    }

    /// Output level that realizes this state (relays are driven active-high).
    pub fn level(self) -> bool {
        self.is_on()
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "OFF",
            Self::On => "ON",
        })
    }
}
