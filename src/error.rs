//! # Error Handling
//!
//! Structured errors for the capture pipeline. Every variant carries an
//! [`ErrorContext`]: when it happened, an optional context line, a recovery
//! hint and a severity.
//!
//! ## Classification
//!
//! The capture loop never matches on message text. It asks the error:
//!
//! - [`Retryable`]: may the failed call be attempted again?
//! - [`HasSeverity`]: how loudly should the failure be reported?
//! - [`classify`]: is it a transient capture failure or a fatal one?
//!
//! ## Taxonomy
//!
//! | Variant | Meaning | Loop reaction |
//! |---------|---------|---------------|
//! | `Allocation` | pool exhausted or oversized request | skip the cycle |
//! | `CaptureUnavailable` | display server rejected the capture | retry with backoff |
//! | `CaptureTimeout` | backend call exceeded its deadline | retry with backoff |
//! | `CaptureFailed` | retry budget exhausted | drain and stop |
//! | `Processing` / `Presentation` | processor or sink failure | report only |
//!
//! ## Usage
//!
//! ```rust
//! use screenwatch::error::{CaptureError, Retryable, classify};
//!
//! let error = CaptureError::capture_unavailable("grim", "exit status 1")
//!     .with_context("capturing region 56,834 35x31");
//!
//! assert!(error.is_retryable());
//! assert!(classify::is_transient(&error));
//! ```

use std::{error::Error as StdError, fmt, time::SystemTime};

/// How serious a failure is, from least to most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Debug,
    Info,
    /// Degrades a cycle; the loop carries on
    Warning,
    Error,
    /// Needs someone to fix the environment
    Critical,
    /// Ends the loop
    Fatal,
}

/// Details attached to every [`CaptureError`].
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub timestamp: SystemTime,
    /// Free-form line naming what was being attempted
    pub context: Option<String>,
    pub recovery_suggestion: Option<String>,
    pub severity: ErrorSeverity,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            timestamp: SystemTime::now(),
            context: None,
            recovery_suggestion: None,
            severity: ErrorSeverity::Error,
        }
    }
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// Every failure the pipeline can report.
#[derive(Debug)]
pub enum CaptureError {
    /// A setting is missing or out of range
    Config {
        field: String,
        value: String,
        reason: String,
        context: ErrorContext,
    },
    /// A runtime argument violates a constraint
    Validation {
        field: String,
        constraint: String,
        value: String,
        context: ErrorContext,
    },
    /// Buffer pool exhaustion or an oversized shape request
    Allocation {
        requested_bytes: usize,
        reason: String,
        context: ErrorContext,
    },
    /// A backend could not be constructed at all
    CaptureInit {
        backend: String,
        reason: String,
        context: ErrorContext,
    },
    /// The display server rejected a capture; retryable
    CaptureUnavailable {
        backend: String,
        reason: String,
        context: ErrorContext,
    },
    /// A backend call did not complete in time; retryable
    CaptureTimeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },
    /// Consecutive capture failures exhausted the retry budget
    CaptureFailed {
        attempts: u32,
        last: Box<CaptureError>,
        context: ErrorContext,
    },
    /// Invalid lifecycle transition
    State {
        current_state: String,
        attempted_operation: String,
        reason: String,
        context: ErrorContext,
    },
    Io {
        operation: String,
        path: Option<String>,
        source: std::io::Error,
        context: ErrorContext,
    },
    /// Image decoding or loading errors
    Image {
        operation: String,
        source: image::ImageError,
        context: ErrorContext,
    },
    /// A frame processor failed or panicked
    Processing {
        processor: String,
        reason: String,
        context: ErrorContext,
    },
    /// A presentation sink rejected a result
    Presentation {
        sink: String,
        reason: String,
        context: ErrorContext,
    },
}

impl CaptureError {
    pub fn config(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Config {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Fatal),
        }
    }

    pub fn validation(
        field: impl Into<String>,
        constraint: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field: field.into(),
            constraint: constraint.into(),
            value: value.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn allocation(requested_bytes: usize, reason: impl Into<String>) -> Self {
        Self::Allocation {
            requested_bytes,
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Warning),
        }
    }

    pub fn capture_init(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CaptureInit {
            backend: backend.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Critical),
        }
    }

    pub fn capture_unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CaptureUnavailable {
            backend: backend.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Warning),
        }
    }

    pub fn capture_timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::CaptureTimeout {
            operation: operation.into(),
            duration_ms,
            context: ErrorContext::new().with_severity(ErrorSeverity::Warning),
        }
    }

    /// Wrap the last transient failure once the retry budget is spent.
    pub fn capture_failed(attempts: u32, last: CaptureError) -> Self {
        Self::CaptureFailed {
            attempts,
            last: Box::new(last),
            context: ErrorContext::new().with_severity(ErrorSeverity::Fatal),
        }
    }

    pub fn state(
        current_state: impl Into<String>,
        attempted_operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::State {
            current_state: current_state.into(),
            attempted_operation: attempted_operation.into(),
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: None,
            source,
            context: ErrorContext::new(),
        }
    }

    /// An I/O error tied to a filesystem path.
    pub fn io_at(
        operation: impl Into<String>,
        path: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            operation: operation.into(),
            path: Some(path.into()),
            source,
            context: ErrorContext::new(),
        }
    }

    pub fn image(operation: impl Into<String>, source: image::ImageError) -> Self {
        Self::Image {
            operation: operation.into(),
            source,
            context: ErrorContext::new(),
        }
    }

    pub fn processing(processor: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Processing {
            processor: processor.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Warning),
        }
    }

    pub fn presentation(sink: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Presentation {
            sink: sink.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Warning),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context_mut().context = Some(context.into());
        self
    }

    pub fn with_recovery_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.context_mut().recovery_suggestion = Some(suggestion.into());
        self
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Config { context, .. }
            | Self::Validation { context, .. }
            | Self::Allocation { context, .. }
            | Self::CaptureInit { context, .. }
            | Self::CaptureUnavailable { context, .. }
            | Self::CaptureTimeout { context, .. }
            | Self::CaptureFailed { context, .. }
            | Self::State { context, .. }
            | Self::Io { context, .. }
            | Self::Image { context, .. }
            | Self::Processing { context, .. }
            | Self::Presentation { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::Config { context, .. }
            | Self::Validation { context, .. }
            | Self::Allocation { context, .. }
            | Self::CaptureInit { context, .. }
            | Self::CaptureUnavailable { context, .. }
            | Self::CaptureTimeout { context, .. }
            | Self::CaptureFailed { context, .. }
            | Self::State { context, .. }
            | Self::Io { context, .. }
            | Self::Image { context, .. }
            | Self::Processing { context, .. }
            | Self::Presentation { context, .. } => context,
        }
    }

    /// Stable snake_case name of the variant, for logs and tests.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Validation { .. } => "validation",
            Self::Allocation { .. } => "allocation",
            Self::CaptureInit { .. } => "capture_init",
            Self::CaptureUnavailable { .. } => "capture_unavailable",
            Self::CaptureTimeout { .. } => "capture_timeout",
            Self::CaptureFailed { .. } => "capture_failed",
            Self::State { .. } => "state",
            Self::Io { .. } => "io",
            Self::Image { .. } => "image",
            Self::Processing { .. } => "processing",
            Self::Presentation { .. } => "presentation",
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config {
                field,
                value,
                reason,
                ..
            } => write!(f, "Invalid setting '{}' = {}: {}", field, value, reason),
            Self::Validation {
                field,
                constraint,
                value,
                ..
            } => write!(f, "'{}' must be {} (got {})", field, constraint, value),
            Self::Allocation {
                requested_bytes,
                reason,
                ..
            } => write!(
                f,
                "Buffer allocation of {} bytes refused: {}",
                requested_bytes, reason
            ),
            Self::CaptureInit {
                backend, reason, ..
            } => write!(f, "Failed to initialize {} capture: {}", backend, reason),
            Self::CaptureUnavailable {
                backend, reason, ..
            } => write!(f, "Capture unavailable on {}: {}", backend, reason),
            Self::CaptureTimeout {
                operation,
                duration_ms,
                ..
            } => write!(f, "{} timed out after {}ms", operation, duration_ms),
            Self::CaptureFailed { attempts, last, .. } => write!(
                f,
                "Capture failed after {} consecutive attempts: {}",
                attempts, last
            ),
            Self::State {
                current_state,
                attempted_operation,
                reason,
                ..
            } => write!(
                f,
                "Cannot {} while {}: {}",
                attempted_operation, current_state, reason
            ),
            Self::Io {
                operation,
                path: Some(path),
                source,
                ..
            } => write!(f, "Failed to {} '{}': {}", operation, path, source),
            Self::Io {
                operation, source, ..
            } => write!(f, "Failed to {}: {}", operation, source),
            Self::Image {
                operation, source, ..
            } => write!(f, "Image error during {}: {}", operation, source),
            Self::Processing {
                processor, reason, ..
            } => write!(f, "{} failed: {}", processor, reason),
            Self::Presentation { sink, reason, .. } => {
                write!(f, "Presentation to {} failed: {}", sink, reason)
            }
        }
    }
}

impl StdError for CaptureError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Image { source, .. } => Some(source),
            Self::CaptureFailed { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;

/// Whether the operation that produced an error may be attempted again.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for CaptureError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CaptureUnavailable { .. } | Self::CaptureTimeout { .. } | Self::Allocation { .. }
        )
    }
}

pub trait HasSeverity {
    fn severity(&self) -> ErrorSeverity;
}

impl HasSeverity for CaptureError {
    fn severity(&self) -> ErrorSeverity {
        self.context().severity
    }
}

pub trait HasRecoverySuggestion {
    fn recovery_suggestion(&self) -> Option<&str>;
}

impl HasRecoverySuggestion for CaptureError {
    fn recovery_suggestion(&self) -> Option<&str> {
        self.context().recovery_suggestion.as_deref()
    }
}

/// Error classification used by the capture loop
pub mod classify {
    use super::*;

    /// Counts against the retry budget and is otherwise absorbed.
    pub fn is_transient(error: &CaptureError) -> bool {
        error.is_retryable() && !matches!(error, CaptureError::Allocation { .. })
    }

    /// Ends a loop immediately.
    pub fn is_fatal(error: &CaptureError) -> bool {
        matches!(
            error,
            CaptureError::Config { .. }
                | CaptureError::Validation { .. }
                | CaptureError::CaptureInit { .. }
                | CaptureError::CaptureFailed { .. }
        ) || error.severity() == ErrorSeverity::Fatal
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(error: std::io::Error) -> Self {
        Self::io("complete I/O", error)
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(error: image::ImageError) -> Self {
        Self::image("decode", error)
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(error: serde_json::Error) -> Self {
        Self::config("json", error.to_string(), "invalid configuration document")
    }
}
