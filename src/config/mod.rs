//! # Configuration Module
//!
//! Pool, loop and backend settings, plus the JSON document for the region monitor.

pub mod config;
pub mod monitor;

pub use config::{EventBackendConfig, LoopConfig, PoolConfig, parse_duration};
pub use monitor::{MonitorConfig, RegionConfig};
