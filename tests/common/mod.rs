//! Common test utilities and helpers for the screenwatch tests
//!
//! Scripted capture backends, processors with controllable behaviour, and a
//! shared timeline that sinks and observers write to so tests can check the
//! order in which things happened.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use screenwatch::capture::{CaptureBackend, DisplayTarget};
use screenwatch::config::LoopConfig;
use screenwatch::core::{FrameBuffer, PixelFormat, Rect, SharedFrame};
use screenwatch::error::{CaptureError, CaptureResult};
use screenwatch::processing::{FrameProcessor, PresentationSink, Processed};
use screenwatch::session::{LoopEvent, LoopObserver, LoopState};

pub const WIDTH: u32 = 16;
pub const HEIGHT: u32 = 8;

pub fn target() -> DisplayTarget {
    DisplayTarget {
        id: "mock-0".into(),
        index: 0,
        origin: (0, 0),
        width: WIDTH,
        height: HEIGHT,
        refresh_hz: Some(60),
    }
}

/// A fast loop config suitable for tests.
pub fn fast_config(interval_ms: u64) -> LoopConfig {
    LoopConfig {
        interval: Duration::from_millis(interval_ms),
        capture_timeout: Duration::from_millis(200),
        max_retries: 3,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        max_in_flight: 1,
    }
}

/// What the scripted backend does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Fill the buffer with this byte.
    Frame(u8),
    /// Return the buffer without writing to it.
    Keep,
    Unavailable,
    Timeout,
    /// A non-transient failure.
    Fatal,
    /// A failure that skips the cycle without ending the loop.
    Io,
    /// Sleep before returning a frame.
    Hang(Duration),
}

/// Capture backend that follows a script, then repeats a fallback step.
pub struct ScriptedBackend {
    script: VecDeque<Step>,
    fallback: Step,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(script: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always delivers frames filled with `value`.
    pub fn frames(value: u8) -> Self {
        Self::new([], Step::Frame(value))
    }

    /// Every call takes at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl CaptureBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Gray8
    }

    async fn enumerate_displays(&mut self) -> CaptureResult<Vec<DisplayTarget>> {
        Ok(vec![target()])
    }

    async fn capture_region(
        &mut self,
        _target: &DisplayTarget,
        rect: Rect,
        mut buffer: FrameBuffer,
    ) -> CaptureResult<FrameBuffer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        assert_eq!((buffer.width(), buffer.height()), (rect.width, rect.height));

        let step = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            Step::Frame(value) => {
                for y in 0..buffer.height() {
                    buffer.row_mut(y).fill(value);
                }
                Ok(buffer)
            }
            Step::Keep => Ok(buffer),
            Step::Unavailable => Err(CaptureError::capture_unavailable(
                "scripted",
                "display asleep",
            )),
            Step::Timeout => Err(CaptureError::capture_timeout("scripted frame", 1)),
            Step::Fatal => Err(CaptureError::capture_init("scripted", "no such display")),
            Step::Io => Err(CaptureError::io(
                "read screenshot",
                std::io::Error::other("short read"),
            )),
            Step::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(buffer)
            }
        }
    }
}

/// One entry on the shared timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Mark {
    Presented(u64),
    Flushed,
    Event(LoopEvent),
}

#[derive(Debug, Clone, Default)]
pub struct Timeline(Arc<Mutex<Vec<Mark>>>);

impl Timeline {
    pub fn push(&self, mark: Mark) {
        self.0.lock().unwrap().push(mark);
    }

    pub fn marks(&self) -> Vec<Mark> {
        self.0.lock().unwrap().clone()
    }

    pub fn presented(&self) -> Vec<u64> {
        self.marks()
            .into_iter()
            .filter_map(|m| match m {
                Mark::Presented(seq) => Some(seq),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<LoopEvent> {
        self.marks()
            .into_iter()
            .filter_map(|m| match m {
                Mark::Event(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Position of the transition into `Stopped`, if it happened.
    pub fn stopped_at(&self) -> Option<usize> {
        self.marks().iter().position(|m| {
            matches!(
                m,
                Mark::Event(LoopEvent::StateChanged {
                    to: LoopState::Stopped,
                    ..
                })
            )
        })
    }

    pub fn sink<O>(&self) -> RecordingSink<O> {
        RecordingSink {
            timeline: self.clone(),
            outputs: Arc::new(Mutex::new(Vec::new())),
            fail_on: None,
        }
    }

    pub fn observer(&self) -> Arc<RecordingObserver> {
        Arc::new(RecordingObserver {
            timeline: self.clone(),
        })
    }
}

/// Sink that records presented outputs and marks the timeline.
pub struct RecordingSink<O> {
    timeline: Timeline,
    outputs: Arc<Mutex<Vec<Processed<O>>>>,
    fail_on: Option<u64>,
}

impl<O> RecordingSink<O> {
    /// Reject the result with this sequence number.
    pub fn failing_on(mut self, sequence: u64) -> Self {
        self.fail_on = Some(sequence);
        self
    }

    pub fn outputs(&self) -> Arc<Mutex<Vec<Processed<O>>>> {
        Arc::clone(&self.outputs)
    }
}

impl<O: Send> PresentationSink<O> for RecordingSink<O> {
    fn present(&mut self, item: Processed<O>) -> anyhow::Result<()> {
        if self.fail_on == Some(item.sequence) {
            anyhow::bail!("sink rejected frame {}", item.sequence);
        }
        self.timeline.push(Mark::Presented(item.sequence));
        self.outputs.lock().unwrap().push(item);
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.timeline.push(Mark::Flushed);
        Ok(())
    }
}

pub struct RecordingObserver {
    timeline: Timeline,
}

impl LoopObserver for RecordingObserver {
    fn on_event(&self, event: &LoopEvent) {
        self.timeline.push(Mark::Event(event.clone()));
    }
}

/// Returns the first byte of every frame.
pub struct FirstByte;

impl FrameProcessor for FirstByte {
    type Output = u8;

    fn process(&self, frame: SharedFrame) -> anyhow::Result<u8> {
        Ok(frame.data()[0])
    }
}

/// Sleeps for a fixed or sequence-dependent time.
pub struct SlowProcessor {
    pub delay: Duration,
    /// Odd sequences sleep this long instead.
    pub odd_delay: Option<Duration>,
    pub reentrant: bool,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl SlowProcessor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            odd_delay: None,
            reentrant: false,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn reentrant(mut self, odd_delay: Duration) -> Self {
        self.reentrant = true;
        self.odd_delay = Some(odd_delay);
        self
    }
}

impl FrameProcessor for SlowProcessor {
    type Output = u64;

    fn process(&self, frame: SharedFrame) -> anyhow::Result<u64> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let delay = match self.odd_delay {
            Some(odd) if frame.sequence() % 2 == 1 => odd,
            _ => self.delay,
        };
        std::thread::sleep(delay);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(frame.sequence())
    }

    fn is_reentrant(&self) -> bool {
        self.reentrant
    }
}

/// Fails on one sequence number and panics on another.
pub struct FlakyProcessor {
    pub fail_on: u64,
    pub panic_on: u64,
}

impl FrameProcessor for FlakyProcessor {
    type Output = u64;

    fn process(&self, frame: SharedFrame) -> anyhow::Result<u64> {
        let sequence = frame.sequence();
        if sequence == self.fail_on {
            anyhow::bail!("cannot process frame {}", sequence);
        }
        if sequence == self.panic_on {
            panic!("processor blew up on frame {}", sequence);
        }
        Ok(sequence)
    }
}

/// Keeps the first frame it sees and reports each frame's data address.
#[derive(Default)]
pub struct HoldingProcessor {
    pub held: Mutex<Option<SharedFrame>>,
}

impl FrameProcessor for HoldingProcessor {
    type Output = usize;

    fn process(&self, frame: SharedFrame) -> anyhow::Result<usize> {
        let address = frame.data().as_ptr() as usize;
        let mut held = self.held.lock().unwrap();
        if held.is_none() {
            *held = Some(frame);
        }
        Ok(address)
    }
}

/// Strictly increasing check used across tests.
pub fn assert_strictly_increasing(sequences: &[u64]) {
    for pair in sequences.windows(2) {
        assert!(
            pair[0] < pair[1],
            "sequence went from {} to {}",
            pair[0],
            pair[1]
        );
    }
}
