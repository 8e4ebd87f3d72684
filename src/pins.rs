//! Pin status polling.
//!
//! The firmware answers `IOSTATUS` with one or more lines of the form
//! `IO:P0=HIGH,P1=LOW,...`. Only the 38 pins `P0`..`P37` are tracked; any
//! other identifier is ignored, as are malformed tokens.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::link::{LinkManager, CMD_IOSTATUS};

pub const PIN_COUNT: usize = 38;

pub const IO_PREFIX: &str = "IO:";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Time the device is given to answer before the response is drained.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinLevel {
    High,
    #[default]
    Low,
}

impl PinLevel {
    /// `HIGH` in any case is high; everything else is low.
    pub fn parse(text: &str) -> Self {
        if text.trim().eq_ignore_ascii_case("HIGH") {
            PinLevel::High
        } else {
            PinLevel::Low
        }
    }
}

impl fmt::Display for PinLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinLevel::High => f.write_str("HIGH"),
            PinLevel::Low => f.write_str("LOW"),
        }
    }
}

/// Levels of the fixed pin set, all `Low` until the first response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinState {
    levels: [PinLevel; PIN_COUNT],
}

impl Default for PinState {
    fn default() -> Self {
        Self {
            levels: [PinLevel::Low; PIN_COUNT],
        }
    }
}

impl PinState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of a pin identifier such as `P12`, if it belongs to the set.
    pub fn index_of(pin: &str) -> Option<usize> {
        let digits = pin.strip_prefix('P')?;
        if digits.is_empty() || digits.len() > 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // `P05` is not a member of the set; only canonical spellings are.
        if digits.len() > 1 && digits.starts_with('0') {
            return None;
        }
        let idx: usize = digits.parse().ok()?;
        (idx < PIN_COUNT).then_some(idx)
    }

    pub fn get(&self, pin: &str) -> Option<PinLevel> {
        Self::index_of(pin).map(|i| self.levels[i])
    }

    pub fn level(&self, index: usize) -> Option<PinLevel> {
        self.levels.get(index).copied()
    }

    /// Set a known pin. Returns false for identifiers outside the set.
    pub fn set(&mut self, pin: &str, level: PinLevel) -> bool {
        match Self::index_of(pin) {
            Some(i) => {
                self.levels[i] = level;
                true
            }
            None => false,
        }
    }

    /// Iterate `(name, level)` in pin order.
    pub fn iter(&self) -> impl Iterator<Item = (String, PinLevel)> + '_ {
        self.levels
            .iter()
            .enumerate()
            .map(|(i, level)| (format!("P{i}"), *level))
    }

    /// Apply one response line. Returns the number of pins updated, or
    /// `None` if the line is not an `IO:` status line.
    pub fn apply_response(&mut self, line: &str) -> Option<usize> {
        let body = line.trim().strip_prefix(IO_PREFIX)?;
        let mut updated = 0;
        for token in body.split(',') {
            let Some((pin, level)) = token.split_once('=') else {
                if !token.trim().is_empty() {
                    debug!("ignoring malformed pin token {:?}", token);
                }
                continue;
            };
            if self.set(pin.trim(), PinLevel::parse(level)) {
                updated += 1;
            } else {
                debug!("ignoring unknown pin {:?}", pin.trim());
            }
        }
        Some(updated)
    }
}

impl fmt::Display for PinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, level) in self.levels.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "P{i}={level}")?;
        }
        Ok(())
    }
}

/// Result of a single poll cycle.
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// Number of pin tokens applied.
    pub updated: usize,
    /// Number of `IO:` lines seen.
    pub status_lines: usize,
    /// Lines drained during the poll that were not status lines.
    pub other_lines: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct PinPoller {
    interval: Duration,
    settle_delay: Duration,
}

impl Default for PinPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_SETTLE_DELAY)
    }
}

impl PinPoller {
    pub fn new(interval: Duration, settle_delay: Duration) -> Self {
        Self {
            interval,
            settle_delay,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Request a status snapshot and apply whatever the device answered.
    ///
    /// Takes the link exclusively, so two polls can never overlap.
    pub fn poll(&self, link: &mut LinkManager, pins: &mut PinState) -> Result<PollOutcome> {
        link.write_line(CMD_IOSTATUS)?;
        thread::sleep(self.settle_delay);

        let mut outcome = PollOutcome::default();
        for raw in link.drain_lines()? {
            let line = String::from_utf8_lossy(&raw);
            match pins.apply_response(&line) {
                Some(n) => {
                    outcome.updated += n;
                    outcome.status_lines += 1;
                }
                None => outcome.other_lines.push(raw),
            }
        }
        debug!(
            "pin poll: {} status lines, {} pins updated",
            outcome.status_lines, outcome.updated
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::DEFAULT_BAUD_RATE;
    use crate::mock::{MockConnector, MockWire};

    #[test]
    fn all_pins_start_low() {
        let pins = PinState::new();
        assert_eq!(pins.iter().count(), PIN_COUNT);
        assert!(pins.iter().all(|(_, l)| l == PinLevel::Low));
    }

    #[test]
    fn pin_identifiers() {
        assert_eq!(PinState::index_of("P0"), Some(0));
        assert_eq!(PinState::index_of("P37"), Some(37));
        assert_eq!(PinState::index_of("P38"), None);
        assert_eq!(PinState::index_of("P99"), None);
        assert_eq!(PinState::index_of("P05"), None);
        assert_eq!(PinState::index_of("p1"), None);
        assert_eq!(PinState::index_of("P"), None);
        assert_eq!(PinState::index_of("P-1"), None);
    }

    #[test]
    fn response_updates_known_pins_only() {
        let mut pins = PinState::new();
        pins.set("P5", PinLevel::High);
        assert_eq!(pins.apply_response("IO:P0=HIGH,P1=LOW,P99=HIGH"), Some(2));
        assert_eq!(pins.get("P0"), Some(PinLevel::High));
        assert_eq!(pins.get("P1"), Some(PinLevel::Low));
        assert_eq!(pins.get("P5"), Some(PinLevel::High));
        assert_eq!(pins.get("P99"), None);
        assert_eq!(
            pins.iter().filter(|(_, l)| *l == PinLevel::High).count(),
            2
        );
    }

    #[test]
    fn level_by_index_matches_name() {
        let mut pins = PinState::new();
        pins.set("P37", PinLevel::High);
        assert_eq!(pins.level(37), Some(PinLevel::High));
        assert_eq!(pins.level(0), pins.get("P0"));
        assert_eq!(pins.level(PIN_COUNT), None);
    }

    #[test]
    fn levels_are_case_insensitive() {
        let mut pins = PinState::new();
        pins.apply_response("IO:P2=high, P3 = High ,P4=on");
        assert_eq!(pins.get("P2"), Some(PinLevel::High));
        assert_eq!(pins.get("P3"), Some(PinLevel::High));
        assert_eq!(pins.get("P4"), Some(PinLevel::Low));
    }

    #[test]
    fn non_status_lines_and_bad_tokens_are_ignored() {
        let mut pins = PinState::new();
        assert_eq!(pins.apply_response("P0=HIGH"), None);
        assert_eq!(pins.apply_response("IO:garbage,,P1=HIGH"), Some(1));
        assert_eq!(pins.get("P0"), Some(PinLevel::Low));
        assert_eq!(pins.get("P1"), Some(PinLevel::High));
    }

    #[test]
    fn display_lists_every_pin() {
        let text = PinState::new().to_string();
        assert!(text.starts_with("P0=LOW,P1=LOW"));
        assert!(text.ends_with("P37=LOW"));
    }

    #[test]
    fn poll_sends_request_and_applies_reply() {
        let wire = MockWire::new();
        wire.reply_to(CMD_IOSTATUS, "IO:P0=HIGH,P7=HIGH\n12,34\n");
        let mut link = LinkManager::new(
            Box::new(MockConnector::new(wire.clone())),
            Duration::from_millis(10),
        );
        link.connect("COM3", DEFAULT_BAUD_RATE).unwrap();

        let poller = PinPoller::new(Duration::from_secs(2), Duration::from_millis(1));
        let mut pins = PinState::new();
        let outcome = poller.poll(&mut link, &mut pins).unwrap();

        assert_eq!(wire.written_lines(), vec!["IOSTATUS"]);
        assert_eq!(outcome.updated, 2);
        assert_eq!(outcome.status_lines, 1);
        assert_eq!(outcome.other_lines, vec![b"12,34".to_vec()]);
        assert_eq!(pins.get("P7"), Some(PinLevel::High));
    }

    #[test]
    fn poll_without_connection_fails() {
        let wire = MockWire::new();
        let mut link = LinkManager::new(
            Box::new(MockConnector::new(wire.clone())),
            Duration::from_millis(10),
        );
        let mut pins = PinState::new();
        assert!(PinPoller::default().poll(&mut link, &mut pins).is_err());
        assert!(wire.written().is_empty());
    }
}
