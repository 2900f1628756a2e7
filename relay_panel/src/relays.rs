// Relay output lines owned by the server.
//
// `RelayBank` maps each configured `RelayId` to an output pin and remembers
// the state it last drove. The server's session loop is the only caller, so
// there is no locking. Two operations matter:
//
// - `switch`: drive one relay in response to a `relayN_ON/OFF` command.
// - `all_off`: the fail-safe. Every session teardown calls it before the
//   server goes back to listening, so no relay stays energised without a
//   live client. It drives every line LOW regardless of the recorded state
//   and keeps going past individual write failures.

use std::io;

use log::{error, info};
use relay_panel_protocol::{MAX_RELAYS, RelayId, RelayState};
use thiserror::Error;

use crate::lines::OutputLines;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay {0} is not configured on this server")]
    Unconfigured(RelayId),
    #[error("expected 1..={MAX_RELAYS} relay pins, got {0}")]
    BadPinCount(usize),
    #[error("driving relay {relay} (pin {pin}): {source}")]
    Io {
        relay: RelayId,
        pin: u8,
        #[source]
        source: io::Error,
    },
}

/// One relay output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayLine {
    pub id: RelayId,
    pub pin: u8,
    pub state: RelayState,
}

pub struct RelayBank {
    lines: Vec<RelayLine>,
    outputs: Box<dyn OutputLines + Send>,
}

impl RelayBank {
    /// Build a bank from a pin table (entry N-1 drives relay N) and force
    /// every line OFF.
    pub fn new(pins: &[u8], outputs: Box<dyn OutputLines + Send>) -> Result<Self, RelayError> {
        if pins.is_empty() || pins.len() > usize::from(MAX_RELAYS) {
            return Err(RelayError::BadPinCount(pins.len()));
        }
        let lines = pins
            .iter()
            .enumerate()
            .map(|(i, &pin)| {
                RelayId::from_index(i)
                    .map(|id| RelayLine {
                        id,
                        pin,
                        state: RelayState::Off,
                    })
                    .map_err(|_| RelayError::BadPinCount(pins.len()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut bank = Self { lines, outputs };
        for i in 0..bank.lines.len() {
            bank.drive(i, RelayState::Off)?;
        }
        Ok(bank)
    }

    /// Drive one relay and record its new state.
    pub fn switch(&mut self, relay: RelayId, state: RelayState) -> Result<(), RelayError> {
        let i = self
            .position(relay)
            .ok_or(RelayError::Unconfigured(relay))?;
        self.drive(i, state)?;
        info!("relay {relay} {state}");
        Ok(())
    }

    /// Force every relay OFF. Returns the relays that were ON.
    pub fn all_off(&mut self) -> Vec<RelayId> {
        let mut released = Vec::new();
        for i in 0..self.lines.len() {
            let was_on = self.lines[i].state.is_on();
            match self.drive(i, RelayState::Off) {
                Ok(()) => {
                    if was_on {
                        info!("relay {} OFF (fail-safe)", self.lines[i].id);
                        released.push(self.lines[i].id);
                    }
                }
                Err(e) => error!("fail-safe shutoff: {e}"),
            }
        }
        released
    }

    pub fn state(&self, relay: RelayId) -> Option<RelayState> {
        self.position(relay).map(|i| self.lines[i].state)
    }

    pub fn lines(&self) -> &[RelayLine] {
        &self.lines
    }

    fn position(&self, relay: RelayId) -> Option<usize> {
        self.lines.iter().position(|line| line.id == relay)
    }

    fn drive(&mut self, i: usize, state: RelayState) -> Result<(), RelayError> {
        let line = &mut self.lines[i];
        self.outputs
            .write_line(line.pin, state.level())
            .map_err(|source| RelayError::Io {
                relay: line.id,
                pin: line.pin,
                source,
            })?;
        line.state = state;
        Ok(())
    }
}
