//! # Configuration Module
//!
//! Configuration structures and validation for the capture pipeline. These
//! are the common interface between the CLI, the monitor and library users.
//!
//! ## Configuration Parameters
//!
//! | Structure | Parameter | Default | Description |
//! |-----------|-----------|---------|-------------|
//! | `PoolConfig` | `max_frame_bytes` | 8K BGRA | Largest single buffer |
//! | `PoolConfig` | `max_outstanding` | 8 | Buffers checked out at once |
//! | `PoolConfig` | `max_idle_per_shape` | 4 | Free-list depth per shape |
//! | `PoolConfig` | `row_alignment` | 1 | Stride rounding in bytes |
//! | `LoopConfig` | `interval` | 1/30 s | Capture cadence |
//! | `LoopConfig` | `capture_timeout` | 1 s | Bound on one backend call |
//! | `LoopConfig` | `max_retries` | 5 | Consecutive failures before stopping |
//! | `LoopConfig` | `backoff_base` / `backoff_max` | 50 ms / 2 s | Retry backoff |
//! | `LoopConfig` | `max_in_flight` | 1 | Overlap for reentrant processors |
//!
//! ## Duration Formats
//!
//! [`parse_duration`] accepts raw seconds (`30`) or a suffixed value:
//! `500ms`, `30s`, `2m`, `1h`.
//!
//! ## Examples
//!
//! ```rust
//! use std::time::Duration;
//! use screenwatch::config::LoopConfig;
//!
//! let config = LoopConfig {
//!     interval: Duration::from_secs(2),
//!     ..LoopConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.backoff_delay(1), config.backoff_base);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, CaptureResult};

/// Limits for a [`BufferPool`](crate::core::BufferPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Largest byte size a single buffer may have.
    ///
    /// Guards against a misbehaving source reporting an absurd geometry.
    pub max_frame_bytes: usize,

    /// Maximum buffers checked out at once, across every loop sharing the pool.
    ///
    /// Frames held by processors beyond their call count against this limit.
    pub max_outstanding: usize,

    /// Idle buffers kept per shape; surplus returns are freed.
    pub max_idle_per_shape: usize,

    /// Row stride is rounded up to a multiple of this many bytes.
    pub row_alignment: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 7680 * 4320 * 4,
            max_outstanding: 8,
            max_idle_per_shape: 4,
            row_alignment: 1,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> CaptureResult<()> {
        if self.max_frame_bytes == 0 {
            return Err(CaptureError::config(
                "pool.max_frame_bytes",
                "0",
                "must be greater than 0",
            ));
        }
        if self.max_outstanding == 0 {
            return Err(CaptureError::config(
                "pool.max_outstanding",
                "0",
                "must allow at least one buffer",
            ));
        }
        if self.row_alignment == 0 || !self.row_alignment.is_power_of_two() {
            return Err(CaptureError::config(
                "pool.row_alignment",
                self.row_alignment.to_string(),
                "must be a power of two",
            ));
        }
        Ok(())
    }
}

/// Cadence, retry and backpressure settings for a
/// [`CaptureLoop`](crate::session::CaptureLoop).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Target interval between successive capture attempts.
    pub interval: Duration,

    /// Upper bound on a single backend call; exceeding it counts as a
    /// transient capture failure.
    pub capture_timeout: Duration,

    /// Consecutive transient failures that end the loop with `CaptureFailed`.
    pub max_retries: u32,

    /// Backoff after the first failure; doubles with each further failure.
    pub backoff_base: Duration,

    /// Cap on the exponential backoff.
    pub backoff_max: Duration,

    /// Frames processed concurrently when the processor is reentrant.
    ///
    /// Ignored (treated as 1) for processors that are not.
    pub max_in_flight: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_micros(1_000_000 / 30),
            capture_timeout: Duration::from_secs(1),
            max_retries: 5,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(2),
            max_in_flight: 1,
        }
    }
}

impl LoopConfig {
    /// Defaults with the cadence derived from a frame rate.
    pub fn from_fps(fps: u32) -> Self {
        Self {
            interval: Duration::from_micros(1_000_000 / fps.max(1) as u64),
            ..Self::default()
        }
    }

    /// Backoff before retrying after the `attempt`-th consecutive failure.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.interval.is_zero() {
            return Err(CaptureError::config(
                "interval",
                "0",
                "must be greater than 0",
            ));
        }
        if self.capture_timeout.is_zero() {
            return Err(CaptureError::config(
                "capture_timeout",
                "0",
                "must be greater than 0",
            ));
        }
        if self.max_retries == 0 {
            return Err(CaptureError::config(
                "max_retries",
                "0",
                "must allow at least one attempt",
            ));
        }
        if self.backoff_base > self.backoff_max {
            return Err(CaptureError::config(
                "backoff_base",
                format!("{:?}", self.backoff_base),
                format!("must not exceed backoff_max ({:?})", self.backoff_max),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(CaptureError::config(
                "max_in_flight",
                "0",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Settings for the screenshot-utility backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBackendConfig {
    /// Screenshot program, looked up on `PATH`.
    pub program: String,

    /// Wait bound for one invocation, in milliseconds.
    pub timeout_ms: u64,

    /// Restrict capture to a named compositor output.
    pub output: Option<String>,

    /// Ask the utility to composite the cursor into the image.
    pub include_cursor: bool,

    /// Output scale factor passed to the utility.
    pub scale: Option<f64>,
}

impl Default for EventBackendConfig {
    fn default() -> Self {
        Self {
            program: "grim".to_string(),
            timeout_ms: 2000,
            output: None,
            include_cursor: false,
            scale: None,
        }
    }
}

impl EventBackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.program.trim().is_empty() {
            return Err(CaptureError::config(
                "event.program",
                "",
                "must name an executable",
            ));
        }
        if self.timeout_ms == 0 {
            return Err(CaptureError::config(
                "event.timeout_ms",
                "0",
                "must be greater than 0",
            ));
        }
        if let Some(scale) = self.scale {
            if !(scale.is_finite() && scale > 0.0) {
                return Err(CaptureError::config(
                    "event.scale",
                    scale.to_string(),
                    "must be a positive number",
                ));
            }
        }
        Ok(())
    }
}

/// Parse a duration string like `"500ms"`, `"30s"`, `"2m"`, `"1h"`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(duration: &str) -> CaptureResult<Duration> {
    let duration = duration.trim();
    if let Ok(seconds) = duration.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let invalid = |reason: &str| CaptureError::validation("duration", reason, duration);

    let split = duration
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid("expected a number"))?;
    let (num_str, unit) = duration.split_at(split);
    let num: u64 = num_str
        .parse()
        .map_err(|_| invalid("expected a number before the unit"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => Ok(Duration::from_secs(num)),
        "m" => Ok(Duration::from_secs(num * 60)),
        "h" => Ok(Duration::from_secs(num * 3600)),
        _ => Err(invalid("unit must be one of ms, s, m, h")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_validate() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(LoopConfig::default().validate().is_ok());
        assert!(EventBackendConfig::default().validate().is_ok());
    }

    #[test]
    fn test_loop_config_validation() {
        let mut config = LoopConfig::default();

        config.interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.interval = Duration::from_millis(10);

        config.max_retries = 0;
        assert!(config.validate().is_err());
        config.max_retries = 3;

        config.backoff_base = Duration::from_secs(10);
        assert!(config.validate().is_err());
        config.backoff_base = Duration::from_millis(10);

        config.max_in_flight = 0;
        assert!(config.validate().is_err());
        config.max_in_flight = 2;

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = LoopConfig {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(350),
            ..LoopConfig::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(350));
        assert_eq!(config.backoff_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_pool_alignment_must_be_power_of_two() {
        let config = PoolConfig {
            row_alignment: 12,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_from_fps() {
        assert_eq!(LoopConfig::from_fps(50).interval, Duration::from_millis(20));
        assert!(LoopConfig::from_fps(0).validate().is_ok());
    }
}
