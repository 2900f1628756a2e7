// Digital line I/O collaborators.
//
// The relay server and the panel client only ever need two things from the
// hardware: read a digital input line and write a digital output line. Those
// two capabilities are the `InputLines` and `OutputLines` traits; everything
// above them (relay bank, edge detector, status LEDs) is hardware-agnostic.
//
// `SimulatedLines` is an in-memory implementation of both traits. It backs
// the binaries (hardware bring-up lives outside this crate) and every test.
// Clones share the same pin table, so a test can hold one clone to press
// buttons or inspect relay outputs while the server/client owns another.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use log::trace;

/// A source of digital input levels (`true` = HIGH).
pub trait InputLines {
    fn read_line(&mut self, pin: u8) -> io::Result<bool>;
}

/// A sink for digital output levels (`true` = HIGH).
pub trait OutputLines {
    fn write_line(&mut self, pin: u8, high: bool) -> io::Result<()>;
}

/// Shared in-memory pin table.
///
/// Pins that were never written read HIGH, matching inputs configured with
/// a pull-up resistor.
#[derive(Clone, Debug, Default)]
pub struct SimulatedLines {
    levels: Arc<Mutex<BTreeMap<u8, bool>>>,
}

impl SimulatedLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a pin to a level, as an external circuit would.
    pub fn set_level(&self, pin: u8, high: bool) {
        self.levels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pin, high);
    }

    /// Last level written to (or forced on) a pin, if any.
    pub fn level(&self, pin: u8) -> Option<bool> {
        self.levels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pin)
            .copied()
    }

    /// True if the pin was driven HIGH.
    pub fn is_high(&self, pin: u8) -> bool {
        self.level(pin) == Some(true)
    }
}

impl InputLines for SimulatedLines {
    fn read_line(&mut self, pin: u8) -> io::Result<bool> {
        Ok(self.level(pin).unwrap_or(true))
    }
}

impl OutputLines for SimulatedLines {
    fn write_line(&mut self, pin: u8, high: bool) -> io::Result<()> {
        trace!("pin {pin} -> {}", if high { "HIGH" } else { "LOW" });
        self.set_level(pin, high);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_inputs_read_high() {
        let mut lines = SimulatedLines::new();
        assert!(lines.read_line(4).unwrap());
        assert_eq!(lines.level(4), None);
    }

    #[test]
    fn clones_share_pins() {
        let mut owner = SimulatedLines::new();
        let observer = owner.clone();
        owner.write_line(27, true).unwrap();
        assert!(observer.is_high(27));

        observer.set_level(5, false);
        assert!(!owner.read_line(5).unwrap());
    }
}
