//! Engine configuration.
//!
//! JSON with per-field defaults. A broken config never stops the engine from
//! booting: callers that want that use [`EngineConfig::from_json_or_default`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Position clock tick interval.
    pub tick_interval_ms: u64,
    /// How long a single `play` keeps the wake resource.
    pub wake_lock_timeout_ms: u64,
    /// Songs shorter than this are left out of the "all songs" list.
    pub min_song_duration_ms: u64,
    /// Playback speed stamped on every snapshot.
    pub speed: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            wake_lock_timeout_ms: 10 * 60 * 1000,
            min_song_duration_ms: 5000,
            speed: 1.0,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.sanitized())
    }

    pub fn from_json_or_default(json: &str) -> Self {
        Self::from_json(json).unwrap_or_else(|e| {
            log::warn!("sonata: {}, using defaults", e);
            Self::default()
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn wake_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.wake_lock_timeout_ms)
    }

    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.tick_interval_ms == 0 {
            log::warn!("sonata: tick_interval_ms must be positive, using {}", defaults.tick_interval_ms);
            self.tick_interval_ms = defaults.tick_interval_ms;
        }
        if !self.speed.is_finite() || self.speed < 0.0 {
            log::warn!("sonata: speed must be a non-negative number, using {}", defaults.speed);
            self.speed = defaults.speed;
        }
        self
    }
}
