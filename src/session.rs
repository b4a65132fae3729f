//! # Capture Loop
//!
//! A [`CaptureLoop`] drives one backend against one display region at a fixed
//! cadence, recycles buffers through a shared [`BufferPool`], and feeds a
//! processor and a sink.
//!
//! ## Architecture
//!
//! ```text
//!            tick (interval, missed ticks skipped)
//!                 │
//!                 ▼
//! ┌──────────┐ acquire ┌────────────────┐ capture_region ┌──────────────┐
//! │BufferPool│────────▶│  loop task     │───────────────▶│CaptureBackend│
//! └──────────┘         │  (tokio)       │◀───────────────└──────────────┘
//!      ▲               │                │   FrameBuffer
//!      │ drop          │  backpressure: │
//!      │               │  busy → drop   │ spawn_blocking ┌──────────────┐
//!      └───────────────│                │───────────────▶│FrameProcessor│
//!                      │  ReorderBuffer │◀───────────────└──────────────┘
//!                      │       │        │   Output
//!                      └───────┼────────┘
//!                              ▼
//!                     PresentationSink (sequence order)
//! ```
//!
//! ## Lifecycle
//!
//! `Idle → Running → Draining → Stopped`. [`CaptureLoop::stop`] is
//! cooperative: it takes effect at the next suspension point and never
//! interrupts a backend call, which is bounded by `capture_timeout`.
//! Draining waits for in-flight processing, presents what is ready in order
//! and flushes the sink; nothing is presented after `Stopped`.
//!
//! ## Failure Policy
//!
//! Transient capture errors (`CaptureUnavailable`, `CaptureTimeout`) are
//! retried with exponential backoff until `max_retries` consecutive failures,
//! which end the loop with `CaptureFailed`. Other capture errors end it at
//! once. Allocation, processor and sink errors are reported to the observer
//! and the loop carries on.

mod observer;
mod state;

pub use observer::{LoopEvent, LoopObserver, TracingObserver};
pub use state::{LoopReport, LoopState, LoopStats};

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::capture::{CaptureBackend, DisplayTarget};
use crate::config::{LoopConfig, PoolConfig};
use crate::core::{BufferPool, FrameBuffer, Rect, ReorderBuffer, SharedFrame};
use crate::error::{CaptureError, CaptureResult, classify};
use crate::processing::{FrameProcessor, PresentationSink, Processed};
use state::StatsCounters;

type RunnerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State visible to both the handle and the loop task.
struct LoopShared {
    label: String,
    state: Mutex<LoopState>,
    stats: StatsCounters,
    last_error: Mutex<Option<Arc<CaptureError>>>,
    observer: Arc<dyn LoopObserver>,
}

impl LoopShared {
    fn state(&self) -> LoopState {
        *lock(&self.state)
    }

    /// Move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[LoopState], to: LoopState) -> bool {
        let previous = {
            let mut state = lock(&self.state);
            if !from.contains(&*state) {
                return false;
            }
            std::mem::replace(&mut *state, to)
        };
        self.emit(LoopEvent::StateChanged { from: previous, to });
        true
    }

    fn emit(&self, event: LoopEvent) {
        self.observer.on_event(&event);
    }
}

/// Handle to one capture loop.
///
/// Dropping the handle cancels a running loop; it still drains on its task.
pub struct CaptureLoop {
    shared: Arc<LoopShared>,
    cancel: CancellationToken,
    runner: Option<RunnerFuture>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CaptureLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureLoop")
            .field("label", &self.shared.label)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl CaptureLoop {
    pub fn builder<P: FrameProcessor>() -> CaptureLoopBuilder<P> {
        CaptureLoopBuilder::new()
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    pub fn stats(&self) -> LoopStats {
        self.shared.stats.snapshot()
    }

    /// The error that ended the loop, once it has stopped.
    pub fn last_error(&self) -> Option<Arc<CaptureError>> {
        lock(&self.shared.last_error).clone()
    }

    /// `Idle → Running`: spawn the loop task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// [`CaptureError::State`] when the loop is not idle or no runtime is
    /// available.
    pub fn start(&mut self) -> CaptureResult<()> {
        let state = self.state();
        if state != LoopState::Idle {
            return Err(CaptureError::state(
                state.to_string(),
                "start",
                "a loop can only be started once",
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            CaptureError::state(state.to_string(), "start", format!("no tokio runtime: {}", e))
        })?;
        let runner = self.runner.take().ok_or_else(|| {
            CaptureError::state(state.to_string(), "start", "loop task already consumed")
        })?;

        self.shared.transition(&[LoopState::Idle], LoopState::Running);
        self.handle = Some(runtime.spawn(runner));
        Ok(())
    }

    /// Request a cooperative stop.
    ///
    /// `Running → Draining`, or straight to `Stopped` from `Idle`. A no-op
    /// once draining or stopped.
    pub fn stop(&self) {
        if self
            .shared
            .transition(&[LoopState::Idle], LoopState::Stopped)
        {
            return;
        }
        if self
            .shared
            .transition(&[LoopState::Running], LoopState::Draining)
        {
            debug!(label = %self.shared.label, "stop requested");
        }
        self.cancel.cancel();
    }

    /// Wait for the loop to reach `Stopped` and report how it went.
    ///
    /// # Errors
    ///
    /// [`CaptureError::State`] when the loop was never started nor stopped.
    pub async fn join(&mut self) -> CaptureResult<LoopReport> {
        match self.handle.take() {
            Some(handle) => {
                if let Err(e) = handle.await {
                    let error = CaptureError::state(
                        self.state().to_string(),
                        "join",
                        format!("loop task failed: {}", e),
                    );
                    *lock(&self.shared.last_error) = Some(Arc::new(error));
                    self.shared.transition(
                        &[LoopState::Idle, LoopState::Running, LoopState::Draining],
                        LoopState::Stopped,
                    );
                }
            }
            None if self.state() == LoopState::Stopped => {}
            None => {
                return Err(CaptureError::state(
                    self.state().to_string(),
                    "join",
                    "loop was never started",
                ));
            }
        }
        Ok(self.report())
    }

    pub fn report(&self) -> LoopReport {
        LoopReport {
            label: self.shared.label.clone(),
            state: self.state(),
            stats: self.stats(),
            error: self.last_error(),
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builder for [`CaptureLoop`].
///
/// Backend, processor, sink and target are required. The region defaults to
/// the whole target, the pool to a private one with default limits and the
/// observer to a [`TracingObserver`] labelled like the loop.
pub struct CaptureLoopBuilder<P: FrameProcessor> {
    label: String,
    backend: Option<Box<dyn CaptureBackend>>,
    processor: Option<Arc<P>>,
    sink: Option<Box<dyn PresentationSink<P::Output>>>,
    observer: Option<Arc<dyn LoopObserver>>,
    pool: Option<BufferPool>,
    target: Option<DisplayTarget>,
    region: Option<Rect>,
    config: LoopConfig,
}

impl<P: FrameProcessor> Default for CaptureLoopBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: FrameProcessor> CaptureLoopBuilder<P> {
    pub fn new() -> Self {
        Self {
            label: "capture".to_string(),
            backend: None,
            processor: None,
            sink: None,
            observer: None,
            pool: None,
            target: None,
            region: None,
            config: LoopConfig::default(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_backend<B: CaptureBackend + 'static>(mut self, backend: B) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn with_processor(self, processor: P) -> Self {
        self.with_shared_processor(Arc::new(processor))
    }

    /// Share one processor between several loops.
    pub fn with_shared_processor(mut self, processor: Arc<P>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_sink<S: PresentationSink<P::Output> + 'static>(mut self, sink: S) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_pool(mut self, pool: BufferPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_target(mut self, target: DisplayTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// Sub-region of the target to capture, in target coordinates.
    pub fn with_region(mut self, region: Rect) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> CaptureResult<CaptureLoop> {
        self.config.validate()?;
        let missing = |field: &str| CaptureError::config(field, "unset", "required by CaptureLoop");
        let backend = self.backend.ok_or_else(|| missing("backend"))?;
        let processor = self.processor.ok_or_else(|| missing("processor"))?;
        let sink = self.sink.ok_or_else(|| missing("sink"))?;
        let target = self.target.ok_or_else(|| missing("target"))?;

        let rect = self.region.unwrap_or_else(|| target.bounds());
        if !target.contains(&rect) {
            return Err(CaptureError::validation(
                "region",
                format!("non-empty and within {}x{}", target.width, target.height),
                format!("{:?}", rect),
            ));
        }

        let label = self.label;
        let observer = self
            .observer
            .unwrap_or_else(|| Arc::new(TracingObserver::new(label.clone())));
        let pool = self
            .pool
            .unwrap_or_else(|| BufferPool::new(PoolConfig::default()));
        let in_flight_limit = if processor.is_reentrant() {
            self.config.max_in_flight
        } else {
            1
        };

        let shared = Arc::new(LoopShared {
            label,
            state: Mutex::new(LoopState::Idle),
            stats: StatsCounters::default(),
            last_error: Mutex::new(None),
            observer,
        });
        let cancel = CancellationToken::new();

        let runner = Runner {
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
            backend,
            processor,
            sink,
            pool,
            target,
            rect,
            config: self.config,
            in_flight_limit,
            sequence: 0,
            failures: 0,
            jobs: JoinSet::new(),
            tasks: HashMap::new(),
            order: ReorderBuffer::new(),
        };

        Ok(CaptureLoop {
            shared,
            cancel,
            runner: Some(Box::pin(runner.run())),
            handle: None,
        })
    }
}

type Outcome<O> = Result<O, String>;

enum Wake<O> {
    Stop,
    Joined(Result<(Id, Outcome<O>), JoinError>),
    Tick,
}

/// The loop task. Owns everything the cycle touches.
struct Runner<P: FrameProcessor> {
    shared: Arc<LoopShared>,
    cancel: CancellationToken,
    backend: Box<dyn CaptureBackend>,
    processor: Arc<P>,
    sink: Box<dyn PresentationSink<P::Output>>,
    pool: BufferPool,
    target: DisplayTarget,
    rect: Rect,
    config: LoopConfig,
    in_flight_limit: usize,
    sequence: u64,
    failures: u32,
    jobs: JoinSet<Outcome<P::Output>>,
    tasks: HashMap<Id, (u64, SystemTime)>,
    order: ReorderBuffer<(SystemTime, Outcome<P::Output>)>,
}

impl<P: FrameProcessor> Runner<P> {
    async fn run(mut self) {
        info!(
            label = %self.shared.label,
            backend = self.backend.name(),
            target = %self.target.id,
            region = ?self.rect,
            processor = self.processor.name(),
            "capture loop started"
        );
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let fatal = loop {
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Stop,
                Some(joined) = self.jobs.join_next_with_id(), if !self.jobs.is_empty() => {
                    Wake::Joined(joined)
                }
                _ = ticker.tick() => Wake::Tick,
            };
            match wake {
                Wake::Stop => break None,
                Wake::Joined(joined) => self.settle(joined),
                Wake::Tick => {
                    let outcome = self.cycle().await;
                    self.pool.sweep();
                    if let Err(error) = outcome {
                        break Some(error);
                    }
                }
            }
        };
        self.finish(fatal).await;
    }

    async fn cycle(&mut self) -> CaptureResult<()> {
        let format = self.backend.pixel_format();
        let buffer = match self.pool.acquire(self.rect.width, self.rect.height, format) {
            Ok(buffer) => buffer,
            Err(error) => {
                StatsCounters::bump(&self.shared.stats.allocation_failures);
                self.shared.emit(LoopEvent::AllocationFailed {
                    error: error.to_string(),
                });
                return Ok(());
            }
        };

        let timeout = self.config.capture_timeout;
        let call = self.backend.capture_region(&self.target, self.rect, buffer);
        let captured = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::capture_timeout(
                "capture_region",
                timeout.as_millis() as u64,
            )),
        };

        match captured {
            Ok(buffer) => {
                self.failures = 0;
                self.accept(buffer);
                Ok(())
            }
            Err(error) if classify::is_transient(&error) => self.retry(error).await,
            Err(error) if classify::is_fatal(&error) => Err(error),
            Err(error) => self.skip(error),
        }
    }

    /// Give up on this cycle without backoff. Still counts toward the
    /// consecutive failure limit so a persistent error ends the loop.
    fn skip(&mut self, error: CaptureError) -> CaptureResult<()> {
        self.failures += 1;
        StatsCounters::bump(&self.shared.stats.capture_failures);
        if self.failures >= self.config.max_retries {
            return Err(CaptureError::capture_failed(self.failures, error));
        }
        self.shared.emit(LoopEvent::CaptureSkipped {
            error: error.to_string(),
        });
        Ok(())
    }

    async fn retry(&mut self, error: CaptureError) -> CaptureResult<()> {
        self.failures += 1;
        StatsCounters::bump(&self.shared.stats.capture_failures);
        if self.failures >= self.config.max_retries {
            return Err(CaptureError::capture_failed(self.failures, error));
        }

        let delay = self.config.backoff_delay(self.failures);
        self.shared.emit(LoopEvent::CaptureRetry {
            attempt: self.failures,
            max: self.config.max_retries,
            delay,
            error: error.to_string(),
        });
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        Ok(())
    }

    /// Stamp a captured frame and either dispatch or drop it.
    fn accept(&mut self, mut buffer: FrameBuffer) {
        self.sequence += 1;
        let sequence = self.sequence;
        let captured_at = SystemTime::now();
        buffer.stamp(sequence, captured_at);
        StatsCounters::bump(&self.shared.stats.captured);
        self.shared
            .stats
            .last_sequence
            .store(sequence, Ordering::Relaxed);

        while let Some(joined) = self.jobs.try_join_next_with_id() {
            self.settle(joined);
        }

        if self.jobs.len() >= self.in_flight_limit {
            drop(buffer);
            let total = StatsCounters::bump(&self.shared.stats.dropped);
            self.shared
                .emit(LoopEvent::FrameDropped { sequence, total });
            return;
        }

        debug!(label = %self.shared.label, sequence, "frame captured");
        StatsCounters::bump(&self.shared.stats.dispatched);
        self.order.dispatched(sequence);

        let processor = Arc::clone(&self.processor);
        let frame: SharedFrame = Arc::new(buffer);
        let handle = self
            .jobs
            .spawn_blocking(move || run_processor(&*processor, frame));
        self.tasks.insert(handle.id(), (sequence, captured_at));
    }

    /// Record a finished job and present whatever is now in order.
    fn settle(&mut self, joined: Result<(Id, Outcome<P::Output>), JoinError>) {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(error) => (error.id(), Err(format!("processing task failed: {}", error))),
        };
        let Some((sequence, captured_at)) = self.tasks.remove(&id) else {
            return;
        };
        let released = self.order.complete(sequence, (captured_at, outcome));
        for (sequence, (captured_at, outcome)) in released {
            self.deliver(sequence, captured_at, outcome);
        }
    }

    fn deliver(&mut self, sequence: u64, captured_at: SystemTime, outcome: Outcome<P::Output>) {
        let stats = &self.shared.stats;
        match outcome {
            Ok(output) => {
                let item = Processed {
                    sequence,
                    captured_at,
                    output,
                };
                match self.sink.present(item) {
                    Ok(()) => {
                        StatsCounters::bump(&stats.presented);
                    }
                    Err(error) => {
                        StatsCounters::bump(&stats.presentation_errors);
                        let error =
                            CaptureError::presentation(&self.shared.label, format!("{:#}", error));
                        self.shared.emit(LoopEvent::PresentationFailed {
                            sequence: Some(sequence),
                            error: error.to_string(),
                        });
                    }
                }
            }
            Err(reason) => {
                StatsCounters::bump(&stats.processor_errors);
                let error = CaptureError::processing(self.processor.name(), reason);
                self.shared.emit(LoopEvent::ProcessorFailed {
                    sequence,
                    error: error.to_string(),
                });
            }
        }
    }

    async fn finish(mut self, fatal: Option<CaptureError>) {
        if let Some(error) = &fatal {
            self.shared.emit(LoopEvent::CaptureFailed {
                error: error.to_string(),
            });
        }
        self.shared
            .transition(&[LoopState::Running], LoopState::Draining);

        while let Some(joined) = self.jobs.join_next_with_id().await {
            self.settle(joined);
        }
        if let Err(error) = self.sink.flush() {
            StatsCounters::bump(&self.shared.stats.presentation_errors);
            let error = CaptureError::presentation(&self.shared.label, format!("flush: {:#}", error));
            self.shared.emit(LoopEvent::PresentationFailed {
                sequence: None,
                error: error.to_string(),
            });
        }
        self.pool.sweep();

        *lock(&self.shared.last_error) = fatal.map(Arc::new);
        self.shared
            .transition(&[LoopState::Draining], LoopState::Stopped);

        let stats = self.shared.stats.snapshot();
        info!(
            label = %self.shared.label,
            captured = stats.captured,
            dropped = stats.dropped,
            presented = stats.presented,
            "capture loop finished"
        );
    }
}

fn run_processor<P: FrameProcessor>(processor: &P, frame: SharedFrame) -> Outcome<P::Output> {
    match catch_unwind(AssertUnwindSafe(|| processor.process(frame))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => Err(format!("{:#}", error)),
        Err(payload) => Err(format!("processor panicked: {}", panic_message(&*payload))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PixelFormat;
    use async_trait::async_trait;

    struct NullBackend;

    #[async_trait]
    impl CaptureBackend for NullBackend {
        fn name(&self) -> &'static str {
            "null"
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
            _rect: Rect,
            buffer: FrameBuffer,
        ) -> CaptureResult<FrameBuffer> {
            Ok(buffer)
        }
    }

    struct Sum;

    impl FrameProcessor for Sum {
        type Output = u64;

        fn process(&self, frame: SharedFrame) -> anyhow::Result<u64> {
            Ok(frame.data().iter().map(|&b| b as u64).sum())
        }
    }

    fn target() -> DisplayTarget {
        DisplayTarget {
            id: "null".into(),
            index: 0,
            origin: (0, 0),
            width: 64,
            height: 48,
            refresh_hz: None,
        }
    }

    fn builder() -> CaptureLoopBuilder<Sum> {
        CaptureLoop::builder()
            .with_backend(NullBackend)
            .with_processor(Sum)
            .with_sink(|_: Processed<u64>| -> anyhow::Result<()> { Ok(()) })
            .with_target(target())
    }

    #[test]
    fn test_build_requires_parts() {
        let err = CaptureLoop::builder::<Sum>()
            .with_target(target())
            .build()
            .unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_build_rejects_region_outside_target() {
        let err = builder()
            .with_region(Rect::new(60, 0, 10, 10))
            .build()
            .unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = LoopConfig {
            max_retries: 0,
            ..LoopConfig::default()
        };
        assert!(builder().with_config(config).build().is_err());
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let mut capture = builder().build().unwrap();
        let err = capture.start().unwrap_err();
        assert_eq!(err.category(), "state");
        assert_eq!(capture.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_stop_from_idle_is_terminal() {
        let mut capture = builder().build().unwrap();
        capture.stop();
        assert_eq!(capture.state(), LoopState::Stopped);
        assert!(capture.start().is_err());

        let report = capture.join().await.unwrap();
        assert_eq!(report.state, LoopState::Stopped);
        assert_eq!(report.stats, LoopStats::default());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_join_before_start_is_an_error() {
        let mut capture = builder().build().unwrap();
        assert_eq!(capture.join().await.unwrap_err().category(), "state");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }
}
