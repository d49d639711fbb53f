//! Stream configuration, loadable from JSON. Every field has a default so a
//! config file only needs to name what it changes.

use crate::metadata::FrameMetadata;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What the renderer may show while the exact target is still decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayPolicy {
    /// Show progressive passes and coarser cached tiles, replaced in place.
    #[default]
    BestAvailable,
    /// Show only complete tiles of the target request; playback holds on
    /// frames whose target is not complete.
    TargetOnly,
}

/// How fast timed playback advances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackSpeed {
    /// A fixed number of frames per wall-clock second.
    Relative { frames_per_second: f64 },
    /// Observation time per wall-clock second: gaps between frame timestamps
    /// are played back scaled by this factor.
    Absolute { observation_seconds_per_second: f64 },
}

impl Default for PlaybackSpeed {
    fn default() -> Self {
        PlaybackSpeed::Relative { frames_per_second: 20.0 }
    }
}

impl PlaybackSpeed {
    /// Wall-clock time to stay on `from` before showing `to`.
    pub fn interval(&self, from: &FrameMetadata, to: &FrameMetadata) -> Duration {
        let seconds = match *self {
            PlaybackSpeed::Relative { frames_per_second } => 1.0 / frames_per_second,
            PlaybackSpeed::Absolute {
                observation_seconds_per_second,
            } => {
                let gap = (to.timestamp - from.timestamp).num_milliseconds().unsigned_abs() as f64 / 1000.0;
                gap / observation_seconds_per_second
            }
        };
        // A zero speed never advances.
        if seconds.is_nan() || seconds <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub speed: PlaybackSpeed,
    /// Timed playback never enters a frame past the leading run of frames
    /// that already have something decoded.
    pub hold_at_cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total decode attempts per request, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1 = first retry): doubles each
    /// time, capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// Quality layers fetched per decode; each one is a progressive pass.
    pub quality_layers: u32,
    /// Byte budget for responses fetched ahead of playback.
    pub prefetch_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            quality_layers: 3,
            prefetch_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub display_policy: DisplayPolicy,
    pub retry: RetryConfig,
    /// Byte budget of the decoded tile cache.
    pub tile_cache_bytes: usize,
    /// Levels synthesized per frame by the local and remote backends.
    pub resolution_levels: usize,
    pub http: HttpConfig,
    pub playback: PlaybackConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            display_policy: DisplayPolicy::default(),
            retry: RetryConfig::default(),
            tile_cache_bytes: 256 * 1024 * 1024,
            resolution_levels: 5,
            http: HttpConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: StreamConfig = serde_json::from_str(&text)?;
        log::info!("Loaded stream config from {:?}", path);
        Ok(config)
    }
}
