//! Sink configuration
//!
//! Loaded from TOML; every field has a default so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::DELAY_HISTORY_CAPACITY;
use crate::error::{Error, Result};

/// Tuning knobs for a sink session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Number of delay observations in the moving average window
    pub smoothing_window: usize,

    /// Refresh the cached hardware timestamp every N delay queries
    pub timestamp_refresh_calls: u32,

    /// ... or once this many milliseconds have passed since the last poll
    pub timestamp_refresh_ms: u64,

    /// Backward jumps of at most this many frames are treated as jitter
    pub discontinuity_tolerance_frames: u64,

    /// Upper bound on how long `drain` blocks
    pub drain_timeout_ms: u64,

    /// Interval between device position polls while draining
    pub drain_poll_ms: u64,

    /// Device buffer is the backend minimum times this factor
    pub buffer_multiplier: u32,

    /// ... but never shorter than this
    pub min_buffer_ms: u32,

    /// Number of periods the device buffer is split into
    pub periods: u32,

    /// Block the producer for the pause duration in `add_pause`
    pub sleep_on_pause: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            smoothing_window: DELAY_HISTORY_CAPACITY,
            timestamp_refresh_calls: 2,
            timestamp_refresh_ms: 100,
            discontinuity_tolerance_frames: 0,
            drain_timeout_ms: 2000,
            drain_poll_ms: 10,
            buffer_multiplier: 2,
            min_buffer_ms: 100,
            periods: 4,
            sleep_on_pause: true,
        }
    }
}

impl SinkConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Load from the per-user config location, falling back to defaults
    /// when no file exists there
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading sink config from {}", path.display());
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/audiotrack-sink/sink.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "audiotrack", "audiotrack-sink")
            .map(|dirs| dirs.config_dir().join("sink.toml"))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.smoothing_window == 0 {
            return Err(Error::Config("smoothing_window must be at least 1".into()));
        }
        if self.timestamp_refresh_calls == 0 {
            return Err(Error::Config(
                "timestamp_refresh_calls must be at least 1".into(),
            ));
        }
        if self.buffer_multiplier == 0 {
            return Err(Error::Config("buffer_multiplier must be at least 1".into()));
        }
        if self.periods == 0 {
            return Err(Error::Config("periods must be at least 1".into()));
        }
        if self.drain_poll_ms == 0 {
            return Err(Error::Config("drain_poll_ms must be at least 1".into()));
        }
        Ok(())
    }

    pub fn timestamp_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.timestamp_refresh_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SinkConfig::from_toml_str("drain_timeout_ms = 500\nperiods = 2\n").unwrap();
        assert_eq!(config.drain_timeout_ms, 500);
        assert_eq!(config.periods, 2);
        assert_eq!(config.smoothing_window, 20);
        assert!(config.sleep_on_pause);
    }

    #[test]
    fn test_rejects_empty_window() {
        let err = SinkConfig::from_toml_str("smoothing_window = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_toml_round_trip_keeps_values() {
        let config = SinkConfig {
            min_buffer_ms: 250,
            sleep_on_pause: false,
            ..Default::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(SinkConfig::from_toml_str(&text).unwrap(), config);
    }
}
