//! # Processing Module
//!
//! The two pluggable stages downstream of capture:
//!
//! ```text
//! SharedFrame ──▶ FrameProcessor::process ──▶ Processed<Output> ──▶ PresentationSink::present
//!                 (blocking worker)            (sequence order)      (loop task)
//! ```
//!
//! Processors run on tokio's blocking pool and receive the frame as a
//! [`SharedFrame`]. Dropping it returns the buffer to the pool; keeping a
//! clone holds the buffer out of the pool for as long as the clone lives.

pub mod matcher;
pub mod sinks;

use std::time::SystemTime;

use anyhow::Result;

use crate::core::SharedFrame;

pub use matcher::{MatchReport, TemplateMatcher};
pub use sinks::{AlertGate, AlertSink, ChannelSink, LogSink};

/// Transforms captured frames into an output.
///
/// Errors and panics are reported to the loop's observer and take the
/// frame's slot in the presentation order; they never stop the loop.
pub trait FrameProcessor: Send + Sync + 'static {
    type Output: Send + 'static;

    fn process(&self, frame: SharedFrame) -> Result<Self::Output>;

    /// Whether [`process`](Self::process) may run on several frames at once.
    ///
    /// Only then does the loop honour `LoopConfig::max_in_flight > 1`.
    fn is_reentrant(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A processor output tagged with the frame it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed<O> {
    pub sequence: u64,
    pub captured_at: SystemTime,
    pub output: O,
}

/// Consumes processor outputs in sequence order on the loop task.
pub trait PresentationSink<O>: Send {
    fn present(&mut self, item: Processed<O>) -> Result<()>;

    /// Called once while the loop drains, after the last `present`.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<O, F> PresentationSink<O> for F
where
    F: FnMut(Processed<O>) -> Result<()> + Send,
{
    fn present(&mut self, item: Processed<O>) -> Result<()> {
        self(item)
    }
}
