// # Polling Capture Backend
//
// Blocking frame reads through the `scrap` library (X11, Windows, macOS).
//
// `scrap::Capturer` is not `Send`, so it lives on a dedicated grabber thread
// and the async side talks to it over a channel:
//
// ```text
// ┌────────────────┐  Request::Grab   ┌────────────────┐
// │ PollingBackend │─────────────────▶│ scrap-grabber  │  Capturer::frame()
// │ (async)        │◀─────────────────│ thread         │  WouldBlock → 2ms nap
// └────────────────┘  oneshot reply   └────────────────┘
// ```
//
// The capturer is opened on first use and dropped after any failure, so the
// next request reopens it against the current display geometry.

use std::io::ErrorKind;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use scrap::{Capturer, Display};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{CaptureBackend, DisplayTarget};
use crate::core::{FrameBuffer, PixelFormat, Rect};
use crate::error::{CaptureError, CaptureResult};

const BACKEND: &str = "scrap";

/// How long the grabber keeps napping on `WouldBlock` for one request.
const DEFAULT_FRAME_WAIT: Duration = Duration::from_secs(1);

enum Request {
    Enumerate {
        reply: oneshot::Sender<CaptureResult<Vec<DisplayTarget>>>,
    },
    Grab {
        display: usize,
        rect: Rect,
        buffer: FrameBuffer,
        deadline: Instant,
        reply: oneshot::Sender<CaptureResult<FrameBuffer>>,
    },
}

/// Capture backend that polls the platform capturer for new frames.
#[derive(Debug)]
pub struct PollingBackend {
    requests: mpsc::Sender<Request>,
    frame_wait: Duration,
}

impl PollingBackend {
    pub fn new() -> CaptureResult<Self> {
        Self::with_frame_wait(DEFAULT_FRAME_WAIT)
    }

    /// A backend whose grabber waits at most `frame_wait` for a fresh frame.
    pub fn with_frame_wait(frame_wait: Duration) -> CaptureResult<Self> {
        Ok(Self {
            requests: spawn_grabber()?,
            frame_wait,
        })
    }

    fn submit(&mut self, request: Request) -> CaptureResult<()> {
        match self.requests.send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::SendError(request)) => {
                warn!("scrap grabber thread exited, restarting it");
                self.requests = spawn_grabber()?;
                self.requests.send(request).map_err(|_| {
                    CaptureError::capture_unavailable(BACKEND, "grabber thread exited")
                })
            }
        }
    }
}

fn spawn_grabber() -> CaptureResult<mpsc::Sender<Request>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("scrap-grabber".into())
        .spawn(move || Grabber::default().run(rx))
        .map_err(|e| CaptureError::capture_init(BACKEND, format!("cannot spawn grabber: {}", e)))?;
    Ok(tx)
}

fn dropped_reply() -> CaptureError {
    CaptureError::capture_unavailable(BACKEND, "grabber dropped the request")
}

#[async_trait]
impl CaptureBackend for PollingBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Bgra8
    }

    async fn enumerate_displays(&mut self) -> CaptureResult<Vec<DisplayTarget>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Enumerate { reply })?;
        rx.await.map_err(|_| dropped_reply())?
    }

    async fn capture_region(
        &mut self,
        target: &DisplayTarget,
        rect: Rect,
        buffer: FrameBuffer,
    ) -> CaptureResult<FrameBuffer> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Grab {
            display: target.index,
            rect,
            buffer,
            deadline: Instant::now() + self.frame_wait,
            reply,
        })?;
        rx.await.map_err(|_| dropped_reply())?
    }
}

#[derive(Default)]
struct Grabber {
    active: Option<(usize, Capturer)>,
}

impl Grabber {
    fn run(mut self, requests: mpsc::Receiver<Request>) {
        while let Ok(request) = requests.recv() {
            match request {
                Request::Enumerate { reply } => {
                    let _ = reply.send(enumerate());
                }
                Request::Grab {
                    display,
                    rect,
                    buffer,
                    deadline,
                    reply,
                } => {
                    let result = self.grab(display, rect, buffer, deadline);
                    if let Err(e) = &result {
                        debug!(error = %e, "dropping scrap capturer after failure");
                        self.active = None;
                    }
                    let _ = reply.send(result);
                }
            }
        }
        debug!("scrap grabber thread exiting");
    }

    fn capturer(&mut self, index: usize) -> CaptureResult<&mut Capturer> {
        if self.active.as_ref().map(|(i, _)| *i) != Some(index) {
            self.active = None;
            let display = Display::all()
                .map_err(|e| {
                    CaptureError::capture_unavailable(BACKEND, format!("cannot list displays: {}", e))
                })?
                .into_iter()
                .nth(index)
                .ok_or_else(|| {
                    CaptureError::capture_unavailable(BACKEND, format!("display {} is gone", index))
                })?;
            let capturer = Capturer::new(display).map_err(|e| {
                CaptureError::capture_unavailable(BACKEND, format!("capture rejected: {}", e))
            })?;
            self.active = Some((index, capturer));
        }
        match self.active.as_mut() {
            Some((_, capturer)) => Ok(capturer),
            None => Err(CaptureError::capture_unavailable(BACKEND, "capturer not open")),
        }
    }

    fn grab(
        &mut self,
        display: usize,
        rect: Rect,
        mut buffer: FrameBuffer,
        deadline: Instant,
    ) -> CaptureResult<FrameBuffer> {
        if buffer.width() != rect.width
            || buffer.height() != rect.height
            || buffer.format() != PixelFormat::Bgra8
        {
            return Err(CaptureError::validation(
                "buffer",
                format!("{}x{} bgra8", rect.width, rect.height),
                format!("{}x{} {:?}", buffer.width(), buffer.height(), buffer.format()),
            ));
        }

        let started = Instant::now();
        let capturer = self.capturer(display)?;
        let (width, height) = (capturer.width(), capturer.height());

        loop {
            match capturer.frame() {
                Ok(frame) => {
                    if !rect.fits_within(width as u32, height as u32) {
                        return Err(CaptureError::capture_unavailable(
                            BACKEND,
                            format!(
                                "display geometry changed: region {:?} outside {}x{}",
                                rect, width, height
                            ),
                        ));
                    }
                    // scrap pads rows on some platforms
                    let stride = frame.len() / height.max(1);
                    crop_into(&frame, stride, rect, &mut buffer)?;
                    return Ok(buffer);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(CaptureError::capture_timeout(
                            "scrap frame",
                            started.elapsed().as_millis() as u64,
                        ));
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                Err(e) => {
                    return Err(CaptureError::capture_unavailable(
                        BACKEND,
                        format!("frame error: {}", e),
                    ));
                }
            }
        }
    }
}

/// Copy `rect` out of a packed BGRA frame with the given stride.
fn crop_into(frame: &[u8], stride: usize, rect: Rect, buffer: &mut FrameBuffer) -> CaptureResult<()> {
    let bpp = PixelFormat::Bgra8.bytes_per_pixel();
    let row_bytes = rect.width as usize * bpp;
    let x_offset = rect.x as usize * bpp;
    let needed = (rect.y + rect.height) as usize * stride;
    if stride < x_offset + row_bytes || frame.len() < needed {
        return Err(CaptureError::capture_unavailable(
            BACKEND,
            format!("truncated frame: {} bytes, stride {}", frame.len(), stride),
        ));
    }
    for row in 0..rect.height {
        let start = (rect.y + row) as usize * stride + x_offset;
        buffer
            .row_mut(row)
            .copy_from_slice(&frame[start..start + row_bytes]);
    }
    Ok(())
}

fn enumerate() -> CaptureResult<Vec<DisplayTarget>> {
    let displays = Display::all().map_err(|e| {
        CaptureError::capture_unavailable(BACKEND, format!("cannot list displays: {}", e))
    })?;
    Ok(displays
        .iter()
        .enumerate()
        .map(|(index, display)| DisplayTarget {
            id: format!("display-{}", index),
            index,
            origin: (0, 0),
            width: display.width() as u32,
            height: display.height() as u32,
            refresh_hz: None,
        })
        .collect())
}
