//! Engine configuration.
//!
//! Every field has a default matching the stock plotter firmware, so an
//! empty TOML file (or no file at all) gives a working engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::link::{DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT};
use crate::pins::{DEFAULT_POLL_INTERVAL, DEFAULT_SETTLE_DELAY};
use crate::ports::DEFAULT_PORT_KEYWORDS;
use crate::store::DedupPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    /// Interval between `IOSTATUS` requests.
    pub poll_interval_ms: u64,
    /// Wait after `IOSTATUS` before draining the reply.
    pub settle_delay_ms: u64,
    /// Period of the idle/active/fault status computation.
    pub status_tick_ms: u64,
    /// How long the worker waits for commands when no input is pending.
    pub worker_tick_ms: u64,
    pub dedup: DedupPolicy,
    pub port_keywords: Vec<String>,
    pub pin_polling: bool,
    pub clear_on_disconnect: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            settle_delay_ms: DEFAULT_SETTLE_DELAY.as_millis() as u64,
            status_tick_ms: 100,
            worker_tick_ms: 10,
            dedup: DedupPolicy::default(),
            port_keywords: DEFAULT_PORT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            pin_polling: true,
            clear_on_disconnect: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn status_tick(&self) -> Duration {
        Duration::from_millis(self.status_tick_ms.max(1))
    }

    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.baud_rate, 115_200);
        assert_eq!(cfg.read_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.poll_interval(), Duration::from_secs(2));
        assert_eq!(cfg.settle_delay(), Duration::from_millis(100));
        assert_eq!(cfg.dedup, DedupPolicy::SuppressDuplicates);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            baud_rate = 9600
            dedup = "always_append"
            port_keywords = ["CP210"]
            pin_polling = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.baud_rate, 9600);
        assert_eq!(cfg.dedup, DedupPolicy::AlwaysAppend);
        assert_eq!(cfg.port_keywords, vec!["CP210"]);
        assert!(!cfg.pin_polling);
        assert_eq!(cfg.poll_interval_ms, 2000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            EngineConfig::from_toml_str("baud = 9600"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaf.toml");
        std::fs::write(&path, "settle_delay_ms = 250\n").unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.settle_delay(), Duration::from_millis(250));
        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
