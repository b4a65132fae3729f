//! # Region Monitor
//!
//! Watches a handful of small screen regions and raises an alert when one of
//! them looks like a reference image.
//!
//! ```text
//!                  ┌──────────────── shared ────────────────┐
//!                  │  BufferPool   TemplateMatcher  AlertGate│
//!                  └────────────────────────────────────────┘
//! region-1 ──▶ CaptureLoop ──▶ TemplateMatcher ──▶ AlertSink ─┐
//! region-2 ──▶ CaptureLoop ──▶ TemplateMatcher ──▶ AlertSink ─┼─▶ alert command
//!    ...                                                      ┘   (cooldown-gated)
//! ```
//!
//! Every loop has its own backend instance; the pool, matcher and cooldown
//! are shared. The monitor runs until the shutdown future resolves or every
//! loop has stopped on its own.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::capture::{self, BackendChoice, CaptureBackend, DisplayTarget};
use crate::config::{EventBackendConfig, MonitorConfig};
use crate::core::BufferPool;
use crate::error::CaptureResult;
use crate::processing::{AlertGate, AlertSink, TemplateMatcher};
use crate::session::{
    CaptureLoop, LoopEvent, LoopObserver, LoopReport, LoopState, TracingObserver,
};

/// Logs through `tracing` and reports the loop's label once it stops.
struct MonitorObserver {
    label: String,
    tracing: TracingObserver,
    stopped: mpsc::UnboundedSender<String>,
}

impl LoopObserver for MonitorObserver {
    fn on_event(&self, event: &LoopEvent) {
        self.tracing.on_event(event);
        if let LoopEvent::StateChanged {
            to: LoopState::Stopped,
            ..
        } = event
        {
            let _ = self.stopped.send(self.label.clone());
        }
    }
}

/// List the displays the selected backend can capture.
pub async fn list_displays(
    choice: BackendChoice,
    event: &EventBackendConfig,
) -> CaptureResult<Vec<DisplayTarget>> {
    let mut backend = capture::select_backend(choice, event)?;
    backend.enumerate_displays().await
}

/// Run the monitor with backends chosen from the current session.
pub async fn run(
    config: MonitorConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<Vec<LoopReport>> {
    let choice = config.backend;
    let event = config.event.clone();
    run_with(config, || capture::select_backend(choice, &event), shutdown).await
}

/// Run the monitor, calling `open_backend` once per region.
///
/// The first backend opened also enumerates the displays.
pub async fn run_with<F>(
    config: MonitorConfig,
    mut open_backend: F,
    shutdown: impl Future<Output = ()>,
) -> Result<Vec<LoopReport>>
where
    F: FnMut() -> CaptureResult<Box<dyn CaptureBackend>>,
{
    config.validate()?;
    let matcher = Arc::new(
        TemplateMatcher::from_path(&config.reference, config.threshold)
            .context("failed to load the reference image")?,
    );

    let mut first = open_backend().context("failed to open the capture backend")?;
    let targets = first
        .enumerate_displays()
        .await
        .context("failed to enumerate displays")?;
    let target = capture::find_target(targets, config.display)?;
    info!(
        backend = first.name(),
        display = %target.id,
        width = target.width,
        height = target.height,
        regions = config.regions.len(),
        "starting region monitor"
    );

    let pool = BufferPool::new(config.pool.clone());
    let gate = AlertGate::new(config.cooldown());
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();

    let mut first = Some(first);
    let mut loops = Vec::with_capacity(config.regions.len());
    for (index, region) in config.regions.iter().enumerate() {
        let label = region.label(index);
        let backend = match first.take() {
            Some(backend) => backend,
            None => open_backend().context("failed to open the capture backend")?,
        };
        let observer = Arc::new(MonitorObserver {
            label: label.clone(),
            tracing: TracingObserver::new(label.clone()),
            stopped: stopped_tx.clone(),
        });
        let mut capture = CaptureLoop::builder()
            .with_label(label.clone())
            .with_backend(backend)
            .with_shared_processor(Arc::clone(&matcher))
            .with_sink(AlertSink::new(
                label.clone(),
                gate.clone(),
                config.alert_command.clone(),
            ))
            .with_observer(observer)
            .with_pool(pool.clone())
            .with_target(target.clone())
            .with_region(region.rect())
            .with_config(config.loop_config())
            .build()
            .with_context(|| format!("invalid region {}", label))?;
        capture.start()?;
        loops.push(capture);
    }
    drop(stopped_tx);

    tokio::pin!(shutdown);
    let mut running = loops.len();
    while running > 0 {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested, stopping capture loops");
                break;
            }
            label = stopped_rx.recv() => match label {
                Some(label) => {
                    running -= 1;
                    warn!(region = %label, remaining = running, "capture loop stopped");
                }
                None => break,
            },
        }
    }

    for capture in &loops {
        capture.stop();
    }
    let mut reports = Vec::with_capacity(loops.len());
    for capture in &mut loops {
        reports.push(capture.join().await?);
    }
    Ok(reports)
}
