// # Event Capture Backend
//
// Wayland compositors do not let clients read the framebuffer directly. This
// backend asks a screenshot utility (`grim` by default) for each region and
// decodes the PNG it writes to stdout.
//
// ```text
// ┌──────────────┐  grim -g "x,y wxh" -t png -  ┌──────────────┐
// │ EventBackend │─────────────────────────────▶│ child        │
// │              │◀─────────────────────────────│ process      │
// └──────────────┘        PNG on stdout         └──────────────┘
//        │
//        ▼
//   image decode → RGBA8 → resample on HiDPI → FrameBuffer
// ```
//
// Each invocation is bounded by `EventBackendConfig::timeout_ms`; a child
// that overruns is killed.

use std::io::Cursor;
use std::process::Stdio;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{ImageFormat, ImageReader};
use tokio::process::Command;
use tracing::debug;

use super::{CaptureBackend, DisplayTarget};
use crate::config::EventBackendConfig;
use crate::core::{FrameBuffer, PixelFormat, Rect};
use crate::error::{CaptureError, CaptureResult};

const BACKEND: &str = "grim";

/// Capture backend that shells out to a screenshot utility per frame.
#[derive(Debug, Clone)]
pub struct EventBackend {
    config: EventBackendConfig,
}

impl EventBackend {
    pub fn new(config: EventBackendConfig) -> CaptureResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EventBackendConfig {
        &self.config
    }

    /// Command-line arguments for one invocation, without the program.
    fn arguments(&self, geometry: Option<String>) -> Vec<String> {
        let mut args = Vec::new();
        match geometry {
            Some(geometry) => {
                args.push("-g".to_string());
                args.push(geometry);
            }
            None => {
                if let Some(output) = &self.config.output {
                    args.push("-o".to_string());
                    args.push(output.clone());
                }
            }
        }
        if self.config.include_cursor {
            args.push("-c".to_string());
        }
        if let Some(scale) = self.config.scale {
            args.push("-s".to_string());
            args.push(scale.to_string());
        }
        args.extend(["-t", "png", "-"].map(String::from));
        args
    }

    /// Run the utility and return its stdout.
    async fn invoke(&self, geometry: Option<String>) -> CaptureResult<Vec<u8>> {
        let args = self.arguments(geometry);
        debug!(program = %self.config.program, ?args, "invoking screenshot utility");

        let child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CaptureError::capture_unavailable(
                    BACKEND,
                    format!("failed to start {}: {}", self.config.program, e),
                )
                .with_recovery_suggestion("install grim or set event.program")
            })?;

        // Dropping the future on timeout drops the child, which kills it
        let output = tokio::time::timeout(self.config.timeout(), child.wait_with_output())
            .await
            .map_err(|_| {
                CaptureError::capture_timeout(
                    format!("{} invocation", self.config.program),
                    self.config.timeout_ms,
                )
            })?
            .map_err(|e| {
                CaptureError::capture_unavailable(
                    BACKEND,
                    format!("waiting for {}: {}", self.config.program, e),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::capture_unavailable(
                BACKEND,
                format!(
                    "{} exited with {}: {}",
                    self.config.program,
                    output.status,
                    stderr.trim()
                ),
            ));
        }
        Ok(output.stdout)
    }
}

/// `x,y wxh` in global layout coordinates.
fn geometry(target: &DisplayTarget, rect: Rect) -> String {
    format!(
        "{},{} {}x{}",
        target.origin.0 + rect.x as i32,
        target.origin.1 + rect.y as i32,
        rect.width,
        rect.height
    )
}

fn malformed(e: image::ImageError) -> CaptureError {
    CaptureError::capture_unavailable(BACKEND, format!("malformed output: {}", e))
}

/// Decode a PNG into `buffer`, resampling when the utility returned a
/// different size than requested (HiDPI outputs).
fn decode_into(png: &[u8], buffer: &mut FrameBuffer) -> CaptureResult<()> {
    let decoded = image::load_from_memory_with_format(png, ImageFormat::Png)
        .map_err(malformed)?
        .to_rgba8();
    let (width, height) = (buffer.width(), buffer.height());
    let image = if decoded.dimensions() == (width, height) {
        decoded
    } else {
        debug!(
            from = ?decoded.dimensions(),
            to = ?(width, height),
            "resampling screenshot"
        );
        image::imageops::resize(&decoded, width, height, FilterType::Triangle)
    };
    buffer.copy_from_rows(image.as_raw(), width as usize * 4)
}

#[async_trait]
impl CaptureBackend for EventBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Rgba8
    }

    /// Takes one full screenshot and reports its size as the only target.
    async fn enumerate_displays(&mut self) -> CaptureResult<Vec<DisplayTarget>> {
        let png = self.invoke(None).await?;
        let (width, height) = ImageReader::new(Cursor::new(png))
            .with_guessed_format()
            .map_err(|e| CaptureError::io("read screenshot", e))?
            .into_dimensions()
            .map_err(malformed)?;
        Ok(vec![DisplayTarget {
            id: self
                .config
                .output
                .clone()
                .unwrap_or_else(|| "wayland".to_string()),
            index: 0,
            origin: (0, 0),
            width,
            height,
            refresh_hz: None,
        }])
    }

    async fn capture_region(
        &mut self,
        target: &DisplayTarget,
        rect: Rect,
        mut buffer: FrameBuffer,
    ) -> CaptureResult<FrameBuffer> {
        if buffer.width() != rect.width
            || buffer.height() != rect.height
            || buffer.format() != PixelFormat::Rgba8
        {
            return Err(CaptureError::validation(
                "buffer",
                format!("{}x{} rgba8", rect.width, rect.height),
                format!("{}x{} {:?}", buffer.width(), buffer.height(), buffer.format()),
            ));
        }
        let png = self.invoke(Some(geometry(target, rect))).await?;
        decode_into(&png, &mut buffer)?;
        Ok(buffer)
    }
}
