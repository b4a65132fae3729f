// # Capture Module
//
// Screen capture backends behind one async interface.
//
// ```text
// ┌──────────────────┐  Grab request   ┌──────────────────┐
// │  CaptureLoop     │────────────────▶│  PollingBackend  │──▶ scrap grabber thread
// │  (tokio task)    │                 └──────────────────┘
// │                  │  spawn + PNG    ┌──────────────────┐
// │                  │────────────────▶│  EventBackend    │──▶ grim -g "x,y wxh" -
// └──────────────────┘                 └──────────────────┘
// ```
//
// The backend is chosen once from the display-server family and never
// switches while a loop runs.

#[cfg(feature = "polling-capture")]
pub mod scrap;
pub mod wayland;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EventBackendConfig;
use crate::core::{FrameBuffer, PixelFormat, Rect};
use crate::error::{CaptureError, CaptureResult};

#[cfg(feature = "polling-capture")]
pub use self::scrap::PollingBackend;
pub use self::wayland::EventBackend;

/// One capturable display as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayTarget {
    pub id: String,
    /// Position in the backend's enumeration order.
    pub index: usize,
    /// Offset of the display in the global desktop layout.
    pub origin: (i32, i32),
    pub width: u32,
    pub height: u32,
    pub refresh_hz: Option<u32>,
}

impl DisplayTarget {
    pub fn bounds(&self) -> Rect {
        Rect::full(self.width, self.height)
    }

    pub fn contains(&self, rect: &Rect) -> bool {
        !rect.is_empty() && rect.fits_within(self.width, self.height)
    }
}

/// A source of frames.
///
/// Implementations fill a caller-supplied buffer whose shape is
/// `rect.width × rect.height` in [`pixel_format`](Self::pixel_format).
#[async_trait]
pub trait CaptureBackend: Send {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// The format this backend writes into buffers.
    fn pixel_format(&self) -> PixelFormat;

    async fn enumerate_displays(&mut self) -> CaptureResult<Vec<DisplayTarget>>;

    /// Capture `rect` of `target` into `buffer` and hand the buffer back.
    ///
    /// # Errors
    ///
    /// `CaptureUnavailable` or `CaptureTimeout` for conditions a retry may
    /// clear; anything else is treated as fatal by the loop.
    async fn capture_region(
        &mut self,
        target: &DisplayTarget,
        rect: Rect,
        buffer: FrameBuffer,
    ) -> CaptureResult<FrameBuffer>;

    /// Capture the whole target.
    async fn capture_once(
        &mut self,
        target: &DisplayTarget,
        buffer: FrameBuffer,
    ) -> CaptureResult<FrameBuffer> {
        self.capture_region(target, target.bounds(), buffer).await
    }
}

#[async_trait]
impl<B: CaptureBackend + ?Sized> CaptureBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn pixel_format(&self) -> PixelFormat {
        (**self).pixel_format()
    }

    async fn enumerate_displays(&mut self) -> CaptureResult<Vec<DisplayTarget>> {
        (**self).enumerate_displays().await
    }

    async fn capture_region(
        &mut self,
        target: &DisplayTarget,
        rect: Rect,
        buffer: FrameBuffer,
    ) -> CaptureResult<FrameBuffer> {
        (**self).capture_region(target, rect, buffer).await
    }
}

/// The display-server family of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayServer {
    X11,
    Wayland,
    /// Windows or macOS.
    Native,
}

impl DisplayServer {
    /// Inspect `XDG_SESSION_TYPE` and `WAYLAND_DISPLAY`.
    pub fn detect() -> Self {
        let session_type = std::env::var("XDG_SESSION_TYPE").ok();
        let wayland_display = std::env::var("WAYLAND_DISPLAY").ok();
        Self::from_env_vars(session_type.as_deref(), wayland_display.as_deref())
    }

    pub fn from_env_vars(session_type: Option<&str>, wayland_display: Option<&str>) -> Self {
        match session_type.map(str::trim) {
            Some(kind) if kind.eq_ignore_ascii_case("wayland") => return DisplayServer::Wayland,
            Some(kind) if kind.eq_ignore_ascii_case("x11") => return DisplayServer::X11,
            _ => {}
        }
        if wayland_display.is_some_and(|d| !d.trim().is_empty()) {
            return DisplayServer::Wayland;
        }
        if cfg!(any(target_os = "windows", target_os = "macos")) {
            DisplayServer::Native
        } else {
            DisplayServer::X11
        }
    }
}

/// A concrete backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Polling,
    Event,
}

/// Backend requested by configuration or the command line.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Pick from the display-server family.
    #[default]
    Auto,
    Polling,
    Event,
}

impl BackendChoice {
    pub fn resolve(self, server: DisplayServer) -> BackendKind {
        match self {
            BackendChoice::Polling => BackendKind::Polling,
            BackendChoice::Event => BackendKind::Event,
            BackendChoice::Auto => match server {
                DisplayServer::Wayland => BackendKind::Event,
                DisplayServer::X11 | DisplayServer::Native => BackendKind::Polling,
            },
        }
    }
}

/// Construct the backend for `kind`.
///
/// # Errors
///
/// `CaptureInit` when the backend cannot be constructed, including the
/// polling backend in a build without the `polling-capture` feature.
pub fn open_backend(
    kind: BackendKind,
    event: &EventBackendConfig,
) -> CaptureResult<Box<dyn CaptureBackend>> {
    match kind {
        BackendKind::Event => Ok(Box::new(EventBackend::new(event.clone())?)),
        BackendKind::Polling => open_polling(),
    }
}

#[cfg(feature = "polling-capture")]
fn open_polling() -> CaptureResult<Box<dyn CaptureBackend>> {
    Ok(Box::new(PollingBackend::new()?))
}

#[cfg(not(feature = "polling-capture"))]
fn open_polling() -> CaptureResult<Box<dyn CaptureBackend>> {
    Err(CaptureError::capture_init(
        "scrap",
        "built without the 'polling-capture' feature",
    )
    .with_recovery_suggestion("rebuild with --features polling-capture or use the event backend"))
}

/// Resolve `choice` against the current session and open the backend.
pub fn select_backend(
    choice: BackendChoice,
    event: &EventBackendConfig,
) -> CaptureResult<Box<dyn CaptureBackend>> {
    let server = DisplayServer::detect();
    let kind = choice.resolve(server);
    tracing::info!(?server, ?kind, "selected capture backend");
    open_backend(kind, event)
}

/// Pick display `index` out of an enumeration.
pub fn find_target(targets: Vec<DisplayTarget>, index: usize) -> CaptureResult<DisplayTarget> {
    let count = targets.len();
    targets.into_iter().nth(index).ok_or_else(|| {
        CaptureError::config(
            "display",
            index.to_string(),
            format!("backend reported {} display(s)", count),
        )
    })
}
