// Button edge detection with a confirm-step debounce.
//
// A mechanical button bounces for a few milliseconds on every press and
// release. `EdgeDetector` remembers the last level it *acted on* (`acked`)
// and only reports a transition when:
//
//   1. a raw sample disagrees with `acked`, and
//   2. a second sample taken one debounce window later agrees with the first.
//
// A second sample that contradicts the first is a glitch and is dropped.
// A confirmed transition flips `acked` and is reported exactly once; the
// detector stays silent until the opposite transition is confirmed, so a
// held button produces one `Pressed` no matter how long it is held.
//
// The sampling closure is the only I/O, which keeps the detector testable
// with scripted sample sequences. `ButtonLine` binds a detector to a pin,
// its polarity, and the relay it controls.

use std::io;
use std::thread;
use std::time::Duration;

use relay_panel_protocol::{RelayId, RelayState};

use crate::lines::InputLines;

/// Debounced logical level of a button.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Level {
    #[default]
    Released,
    Pressed,
}

/// A confirmed transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Pressed,
    Released,
}

impl Edge {
    /// The relay state this edge requests (button N held = relay N on).
    pub fn relay_state(self) -> RelayState {
        match self {
            Self::Pressed => RelayState::On,
            Self::Released => RelayState::Off,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EdgeDetector {
    acked: Level,
    window: Duration,
}

impl EdgeDetector {
    pub fn new(window: Duration) -> Self {
        Self {
            acked: Level::Released,
            window,
        }
    }

    /// The last level reported to the caller.
    pub fn acked(&self) -> Level {
        self.acked
    }

    /// Forget the acknowledged level. The next sample that reads `Pressed`
    /// is reported again as a fresh press.
    pub fn rearm(&mut self) {
        self.acked = Level::Released;
    }

    /// Sample once and, on a disagreement, confirm after the debounce window.
    pub fn poll<F>(&mut self, mut sample: F) -> io::Result<Option<Edge>>
    where
        F: FnMut() -> io::Result<Level>,
    {
        let first = sample()?;
        if first == self.acked {
            return Ok(None);
        }
        if !self.window.is_zero() {
            thread::sleep(self.window);
        }
        if sample()? != first {
            return Ok(None);
        }
        self.acked = first;
        Ok(Some(match first {
            Level::Pressed => Edge::Pressed,
            Level::Released => Edge::Released,
        }))
    }
}

/// A physical button wired to one input pin, controlling one relay.
#[derive(Clone, Debug)]
pub struct ButtonLine {
    relay: RelayId,
    pin: u8,
    active_low: bool,
    detector: EdgeDetector,
}

impl ButtonLine {
    pub fn new(relay: RelayId, pin: u8, active_low: bool, debounce: Duration) -> Self {
        Self {
            relay,
            pin,
            active_low,
            detector: EdgeDetector::new(debounce),
        }
    }

    pub fn relay(&self) -> RelayId {
        self.relay
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn level(&self) -> Level {
        self.detector.acked()
    }

    pub fn rearm(&mut self) {
        self.detector.rearm();
    }

    pub fn poll(&mut self, inputs: &mut dyn InputLines) -> io::Result<Option<Edge>> {
        let (pin, active_low) = (self.pin, self.active_low);
        self.detector.poll(|| {
            let high = inputs.read_line(pin)?;
            Ok(if high != active_low {
                Level::Pressed
            } else {
                Level::Released
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::lines::SimulatedLines;

    use Level::{Pressed as P, Released as R};

    /// Feed a scripted sequence of raw samples to `poll` until it runs out,
    /// collecting every edge reported.
    fn run_script(detector: &mut EdgeDetector, script: &[Level]) -> Vec<Edge> {
        let mut samples: VecDeque<Level> = script.iter().copied().collect();
        let mut edges = Vec::new();
        while !samples.is_empty() {
            let edge = detector
                .poll(|| Ok(samples.pop_front().unwrap_or(Level::Released)))
                .unwrap();
            edges.extend(edge);
        }
        edges
    }

    #[test]
    fn steady_release_reports_nothing() {
        let mut detector = EdgeDetector::new(Duration::ZERO);
        assert!(run_script(&mut detector, &[R, R, R]).is_empty());
        assert_eq!(detector.acked(), Level::Released);
    }

    #[test]
    fn confirmed_press_reported_once() {
        let mut detector = EdgeDetector::new(Duration::ZERO);
        // Press confirmed, then held for a while.
        let edges = run_script(&mut detector, &[P, P, P, P, P]);
        assert_eq!(edges, vec![Edge::Pressed]);
        assert_eq!(detector.acked(), Level::Pressed);
    }

    #[test]
    fn bounce_within_window_yields_one_press() {
        let mut detector = EdgeDetector::new(Duration::ZERO);
        // press, release (contradicting confirm sample), press, press (confirmed).
        let edges = run_script(&mut detector, &[P, R, P, P, P]);
        assert_eq!(edges, vec![Edge::Pressed]);
    }

    #[test]
    fn glitch_is_discarded() {
        let mut detector = EdgeDetector::new(Duration::ZERO);
        let edges = run_script(&mut detector, &[P, R, R, R]);
        assert!(edges.is_empty());
        assert_eq!(detector.acked(), Level::Released);
    }

    #[test]
    fn press_then_release_alternates() {
        let mut detector = EdgeDetector::new(Duration::ZERO);
        let edges = run_script(&mut detector, &[P, P, P, R, P, R, R, R]);
        // The release bounce (R then P) is dropped; the second release sticks.
        assert_eq!(edges, vec![Edge::Pressed, Edge::Released]);
    }

    #[test]
    fn confirm_sample_waits_for_window() {
        let window = Duration::from_millis(15);
        let mut detector = EdgeDetector::new(window);
        let start = std::time::Instant::now();
        let edges = run_script(&mut detector, &[P, P]);
        assert_eq!(edges, vec![Edge::Pressed]);
        assert!(start.elapsed() >= window);
    }

    #[test]
    fn rearm_reports_held_button_again() {
        let mut detector = EdgeDetector::new(Duration::ZERO);
        assert_eq!(run_script(&mut detector, &[P, P]), vec![Edge::Pressed]);
        detector.rearm();
        assert_eq!(run_script(&mut detector, &[P, P]), vec![Edge::Pressed]);
    }

    #[test]
    fn sample_errors_propagate() {
        let mut detector = EdgeDetector::new(Duration::ZERO);
        let err = detector
            .poll(|| Err(io::Error::other("line unreadable")))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(detector.acked(), Level::Released);
    }

    #[test]
    fn active_low_button_reads_low_as_pressed() {
        let mut lines = SimulatedLines::new();
        let relay = RelayId::new(1).unwrap();
        let mut button = ButtonLine::new(relay, 4, true, Duration::ZERO);

        // Pull-up: idle line reads HIGH = released.
        assert_eq!(button.poll(&mut lines).unwrap(), None);

        lines.set_level(4, false);
        assert_eq!(button.poll(&mut lines).unwrap(), Some(Edge::Pressed));
        assert_eq!(button.poll(&mut lines).unwrap(), None);
        assert_eq!(button.level(), Level::Pressed);

        lines.set_level(4, true);
        assert_eq!(button.poll(&mut lines).unwrap(), Some(Edge::Released));
    }

    #[test]
    fn active_high_button_reads_high_as_pressed() {
        let mut lines = SimulatedLines::new();
        lines.set_level(6, false);
        let relay = RelayId::new(3).unwrap();
        let mut button = ButtonLine::new(relay, 6, false, Duration::ZERO);
        assert_eq!(button.poll(&mut lines).unwrap(), None);

        lines.set_level(6, true);
        assert_eq!(button.poll(&mut lines).unwrap(), Some(Edge::Pressed));
        assert_eq!(Edge::Pressed.relay_state(), RelayState::On);
    }
}
