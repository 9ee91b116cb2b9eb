//! EMM configuration
//!
//! Loaded from the `emm` section of the daemon's YAML file. Every value has
//! a default so a missing file or section still yields a usable engine.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{EmmError, EmmResult};

// ============================================================================
// Timer Configuration
// ============================================================================

/// Retransmission timer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// Total attempts (initial send included) before the procedure aborts
    pub max_count: u32,
    /// Timer duration
    pub duration: Duration,
}

impl TimerConfig {
    /// Create a new timer configuration
    pub fn new(max_count: u32, duration_secs: u64) -> Self {
        Self {
            max_count,
            duration: Duration::from_secs(duration_secs),
        }
    }

    /// Create a configuration with a sub-second duration
    pub fn from_millis(max_count: u32, duration_ms: u64) -> Self {
        Self {
            max_count,
            duration: Duration::from_millis(duration_ms),
        }
    }
}

/// T3470: 6 seconds, 5 attempts
pub const DEFAULT_T3470: TimerConfig = TimerConfig {
    max_count: 5,
    duration: Duration::from_secs(6),
};

/// Short retry timer used by an owning procedure waiting for a stale
/// context to be cleaned up
pub const DEFAULT_SPECIFIC_RETRY: TimerConfig = TimerConfig {
    max_count: 5,
    duration: Duration::from_millis(200),
};

// ============================================================================
// EMM Configuration
// ============================================================================

/// EMM engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmmConfig {
    /// Identification procedure retransmission timer
    pub t3470: TimerConfig,
    /// Owning procedure retry timer
    pub specific_retry: TimerConfig,
}

impl Default for EmmConfig {
    fn default() -> Self {
        Self {
            t3470: DEFAULT_T3470,
            specific_retry: DEFAULT_SPECIFIC_RETRY,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RootSection {
    #[serde(default)]
    emm: Option<EmmSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EmmSection {
    t3470: Option<TimerSection>,
    specific_retry: Option<TimerSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TimerSection {
    max_count: Option<u32>,
    duration_secs: Option<u64>,
    duration_ms: Option<u64>,
}

impl TimerSection {
    fn apply(&self, name: &str, base: TimerConfig) -> EmmResult<TimerConfig> {
        let max_count = self.max_count.unwrap_or(base.max_count);
        if max_count == 0 {
            return Err(EmmError::Config(format!("{}.max_count must be at least 1", name)));
        }

        let duration = match (self.duration_ms, self.duration_secs) {
            (Some(ms), _) => Duration::from_millis(ms),
            (None, Some(secs)) => Duration::from_secs(secs),
            (None, None) => base.duration,
        };
        if duration.is_zero() {
            return Err(EmmError::Config(format!("{} duration must be non-zero", name)));
        }

        Ok(TimerConfig { max_count, duration })
    }
}

impl EmmConfig {
    /// Parse configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> EmmResult<Self> {
        let root: RootSection = serde_yaml::from_str(yaml)
            .map_err(|e| EmmError::Config(format!("Failed to parse YAML config: {}", e)))?;

        let mut config = EmmConfig::default();
        let Some(emm) = root.emm else {
            log::warn!("No 'emm' section in config file");
            return Ok(config);
        };

        if let Some(t3470) = &emm.t3470 {
            config.t3470 = t3470.apply("t3470", config.t3470)?;
        }
        if let Some(retry) = &emm.specific_retry {
            config.specific_retry = retry.apply("specific_retry", config.specific_retry)?;
        }

        Ok(config)
    }

    /// Load configuration from a YAML file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> EmmResult<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration from: {}", path.display());

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!(
                    "Could not read config file '{}': {}. Using defaults.",
                    path.display(),
                    e
                );
                return Ok(EmmConfig::default());
            }
        };

        let config = Self::from_yaml_str(&content)?;
        log::info!(
            "T3470: {} attempts every {:?}, specific retry: {} attempts every {:?}",
            config.t3470.max_count,
            config.t3470.duration,
            config.specific_retry.max_count,
            config.specific_retry.duration
        );
        Ok(config)
    }
}
