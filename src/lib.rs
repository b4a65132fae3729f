//! # screenwatch
//!
//! Real-time screen region capture with pluggable backends, recycled frame
//! buffers and a processing pipeline that keeps up with the capture cadence
//! by dropping frames instead of queueing them.
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//! - `capture`: capture backends (`scrap` polling, `grim` subprocess) and selection
//! - `core`: frame buffers, the shape-keyed buffer pool and the reorder buffer
//! - `session`: the capture loop state machine, its stats and observer events
//! - `processing`: processor and sink traits, template matching, alert sinks
//! - `config`: configuration structures and validation
//! - `monitor`: the region monitor built from all of the above
//!
//! ## Data Flow
//!
//! ```text
//! CaptureBackend ──▶ CaptureLoop (pool + pacing + backpressure) ──▶ FrameProcessor ──▶ PresentationSink
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use screenwatch::capture::{BackendChoice, select_backend, find_target};
//! use screenwatch::config::{EventBackendConfig, LoopConfig};
//! use screenwatch::core::Rect;
//! use screenwatch::processing::{LogSink, TemplateMatcher};
//! use screenwatch::session::CaptureLoop;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut backend = select_backend(BackendChoice::Auto, &EventBackendConfig::default())?;
//! let target = find_target(backend.enumerate_displays().await?, 0)?;
//!
//! let mut capture = CaptureLoop::builder()
//!     .with_backend(backend)
//!     .with_processor(TemplateMatcher::from_path("modern.png", 0.98)?)
//!     .with_sink(LogSink::new("tray"))
//!     .with_target(target)
//!     .with_region(Rect::new(56, 834, 35, 31))
//!     .with_config(LoopConfig::from_fps(2))
//!     .build()?;
//!
//! capture.start()?;
//! tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//! capture.stop();
//! let report = capture.join().await?;
//! println!("presented {} results", report.stats.presented);
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod core;
pub mod error;
pub mod monitor;
pub mod processing;
pub mod session;

/// Re-export error types for convenience
pub use error::{
    CaptureError, CaptureResult, ErrorSeverity, HasRecoverySuggestion, HasSeverity, Retryable,
};

pub use capture::{CaptureBackend, DisplayTarget};
pub use crate::core::{BufferPool, FrameBuffer, PixelFormat, Rect, SharedFrame};
pub use processing::{FrameProcessor, PresentationSink, Processed};
pub use session::{CaptureLoop, LoopReport, LoopState, LoopStats};
