//! Testbench configuration
//!
//! Timing bounds for observation and execution, the capture channel size,
//! and the directory the namespace files live in. Loadable from JSON; every
//! field has a default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Directory `ip netns` keeps its bind mounts in
pub const DEFAULT_NETNS_DIR: &str = "/var/run/netns";

/// Slack on top of the exchange timeout before a stuck driver is abandoned
const DRIVE_GRACE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ConfigFileError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbenchConfig {
    /// Longest an assertion waits for the events it needs
    pub observation_window_ms: u64,
    /// Pause between applying impairments and starting the exchange
    pub settle_ms: u64,
    /// Bound on the protocol exchange itself
    pub exchange_timeout_ms: u64,
    /// How long capture keeps running after the exchange finished
    pub linger_ms: u64,
    /// Bound on waiting for a capture to become live
    pub capture_ready_timeout_ms: u64,
    /// Capacity of the channel between the capture reader and its consumer
    pub capture_buffer: usize,
    /// Namespace file directory (`IP_NETNS_DIR`)
    pub netns_dir: PathBuf,
}

impl Default for TestbenchConfig {
    fn default() -> Self {
        Self {
            observation_window_ms: 5_000,
            settle_ms: 1_000,
            exchange_timeout_ms: 3_000,
            linger_ms: 250,
            capture_ready_timeout_ms: 2_000,
            capture_buffer: 1024,
            netns_dir: PathBuf::from(DEFAULT_NETNS_DIR),
        }
    }
}

impl TestbenchConfig {
    /// Defaults, with `IP_NETNS_DIR` honoured when set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os("IP_NETNS_DIR") {
            config.netns_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let text = std::fs::read_to_string(path)?;
        let config: TestbenchConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Near-zero timings for in-memory runs
    pub fn fast() -> Self {
        Self {
            observation_window_ms: 500,
            settle_ms: 0,
            exchange_timeout_ms: 500,
            linger_ms: 10,
            capture_ready_timeout_ms: 100,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigFileError> {
        if self.observation_window_ms == 0 {
            return Err(ConfigFileError::Invalid(
                "observation_window_ms must be positive".to_string(),
            ));
        }
        if self.capture_buffer == 0 {
            return Err(ConfigFileError::Invalid(
                "capture_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn observation_window(&self) -> Duration {
        Duration::from_millis(self.observation_window_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn capture_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_ready_timeout_ms)
    }

    /// Longest Execute waits on the exchange task: its own timeout, the
    /// linger, and a grace period for the driver to notice it
    pub fn drive_bound(&self) -> Duration {
        self.exchange_timeout() + self.linger() + DRIVE_GRACE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"observation_window_ms": 750}"#).unwrap();

        let config = TestbenchConfig::from_path(file.path()).unwrap();
        assert_eq!(config.observation_window(), Duration::from_millis(750));
        assert_eq!(config.capture_buffer, 1024);
        assert_eq!(config.netns_dir, PathBuf::from(DEFAULT_NETNS_DIR));
    }

    #[test]
    fn test_drive_bound_covers_exchange_and_linger() {
        let config = TestbenchConfig::fast();
        assert!(config.drive_bound() > config.exchange_timeout() + config.linger());
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"observation_window_ms": 0}"#).unwrap();
        assert!(matches!(
            TestbenchConfig::from_path(file.path()),
            Err(ConfigFileError::Invalid(_))
        ));
    }
}
