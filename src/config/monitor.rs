//! # Monitor Configuration
//!
//! The JSON document driving `screenwatch watch`. Every field has a default,
//! so an empty object `{}` is a valid configuration that watches the two
//! status-bar regions below against `modern.png`.
//!
//! ```json
//! {
//!   "reference": "modern.png",
//!   "regions": [
//!     { "left": 56,   "top": 834, "width": 35, "height": 31 },
//!     { "left": 1830, "top": 835, "width": 35, "height": 31 }
//!   ],
//!   "interval_ms": 2000,
//!   "cooldown_ms": 20000,
//!   "threshold": 0.98,
//!   "backend": "auto",
//!   "alert_command": ["ffplay", "-nodisp", "-autoexit", "-loglevel", "quiet", "audio.mp3"]
//! }
//! ```
//!
//! A relative `reference` path is resolved against the directory of the
//! configuration file it was loaded from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{EventBackendConfig, LoopConfig, PoolConfig};
use crate::capture::BackendChoice;
use crate::core::Rect;
use crate::error::{CaptureError, CaptureResult};

/// One watched screen region, in display coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    /// Label used in logs; defaults to `region-<n>`.
    #[serde(default)]
    pub name: Option<String>,
}

impl RegionConfig {
    pub fn rect(&self) -> Rect {
        Rect::new(self.left, self.top, self.width, self.height)
    }

    pub fn label(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("region-{}", index + 1))
    }
}

/// Settings for the region monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Reference image every region is compared against.
    pub reference: PathBuf,
    pub regions: Vec<RegionConfig>,
    /// Index into the backend's display list.
    pub display: usize,
    pub backend: BackendChoice,
    pub interval_ms: u64,
    /// Minimum time between two alerts, across all regions.
    pub cooldown_ms: u64,
    /// Similarity in `[0, 1]` at or above which a region counts as a match.
    pub threshold: f64,
    /// Program and arguments spawned on a match; empty means log only.
    pub alert_command: Vec<String>,
    pub capture_timeout_ms: u64,
    pub max_retries: u32,
    pub pool: PoolConfig,
    pub event: EventBackendConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reference: PathBuf::from("modern.png"),
            regions: vec![
                RegionConfig {
                    left: 56,
                    top: 834,
                    width: 35,
                    height: 31,
                    name: None,
                },
                RegionConfig {
                    left: 1830,
                    top: 835,
                    width: 35,
                    height: 31,
                    name: None,
                },
            ],
            display: 0,
            backend: BackendChoice::Auto,
            interval_ms: 2000,
            cooldown_ms: 20_000,
            threshold: 0.98,
            alert_command: [
                "ffplay",
                "-nodisp",
                "-autoexit",
                "-loglevel",
                "quiet",
                "audio.mp3",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            capture_timeout_ms: 2500,
            max_retries: 5,
            pool: PoolConfig::default(),
            event: EventBackendConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> CaptureResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CaptureError::io_at("read config", path.display().to_string(), e))?;
        let mut config: MonitorConfig = serde_json::from_str(&text).map_err(|e| {
            CaptureError::config(path.display().to_string(), e.to_string(), "invalid JSON")
        })?;

        if config.reference.is_relative() {
            if let Some(dir) = path.parent() {
                config.reference = dir.join(&config.reference);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Loop settings shared by every region.
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            interval: self.interval(),
            capture_timeout: Duration::from_millis(self.capture_timeout_ms),
            max_retries: self.max_retries,
            // Template matching is stateless, so regions may overlap work
            max_in_flight: 2,
            ..LoopConfig::default()
        }
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.regions.is_empty() {
            return Err(CaptureError::config(
                "regions",
                "[]",
                "at least one region is required",
            ));
        }
        for (i, region) in self.regions.iter().enumerate() {
            if region.rect().is_empty() {
                return Err(CaptureError::config(
                    format!("regions[{}]", i),
                    format!("{}x{}", region.width, region.height),
                    "width and height must be greater than 0",
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(CaptureError::config(
                "threshold",
                self.threshold.to_string(),
                "must be between 0 and 1",
            ));
        }
        if let Some(program) = self.alert_command.first() {
            if program.trim().is_empty() {
                return Err(CaptureError::config(
                    "alert_command",
                    "",
                    "first element must name a program",
                ));
            }
        }
        self.loop_config().validate()?;
        self.pool.validate()?;
        self.event.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.regions.len(), 2);
        assert_eq!(config.interval(), Duration::from_secs(2));
        assert_eq!(config.cooldown(), Duration::from_secs(20));
        assert_eq!(config.regions[1].rect(), Rect::new(1830, 835, 35, 31));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = MonitorConfig::default();

        config.threshold = 1.5;
        assert!(config.validate().is_err());
        config.threshold = 0.9;

        config.interval_ms = 0;
        assert!(config.validate().is_err());
        config.interval_ms = 500;

        config.regions[0].width = 0;
        assert!(config.validate().is_err());
        config.regions.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_document_resolves_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watch.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "reference": "icons/target.png",
                "regions": [{{ "left": 1, "top": 2, "width": 3, "height": 4, "name": "tray" }}],
                "backend": "event",
                "threshold": 0.5
            }}"#
        )
        .unwrap();

        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config.reference, dir.path().join("icons/target.png"));
        assert_eq!(config.backend, BackendChoice::Event);
        assert_eq!(config.regions[0].label(0), "tray");
        assert_eq!(config.interval_ms, 2000);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ regions: ").unwrap();
        let err = MonitorConfig::load(&path).unwrap_err();
        assert_eq!(err.category(), "config");

        let missing = MonitorConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert_eq!(missing.category(), "io");
    }
}
