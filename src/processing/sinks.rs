//! Presentation sinks shipped with the crate.

use std::fmt::Debug;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{MatchReport, PresentationSink, Processed};

/// Logs every result at `info`.
#[derive(Debug, Clone)]
pub struct LogSink {
    label: String,
}

impl LogSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl<O: Debug> PresentationSink<O> for LogSink {
    fn present(&mut self, item: Processed<O>) -> Result<()> {
        info!(
            label = %self.label,
            sequence = item.sequence,
            output = ?item.output,
            "frame processed"
        );
        Ok(())
    }
}

/// Forwards results to a bounded channel, dropping them when it is full.
#[derive(Debug)]
pub struct ChannelSink<O> {
    tx: mpsc::Sender<Processed<O>>,
    dropped: u64,
}

impl<O> ChannelSink<O> {
    pub fn new(tx: mpsc::Sender<Processed<O>>) -> Self {
        Self { tx, dropped: 0 }
    }

    /// A sink and the receiving end of a channel holding `capacity` results.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Processed<O>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Results discarded because the receiver fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl<O: Send> PresentationSink<O> for ChannelSink<O> {
    fn present(&mut self, item: Processed<O>) -> Result<()> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item)) => {
                self.dropped += 1;
                debug!(sequence = item.sequence, dropped = self.dropped, "channel full, result dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(anyhow!("result receiver closed")),
        }
    }
}

/// Outcome of asking an [`AlertGate`] to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Fire,
    Cooling { remaining: Duration },
}

/// A cooldown shared by every region: at most one alert per period.
#[derive(Debug, Clone)]
pub struct AlertGate {
    cooldown: Duration,
    last_fired: Arc<Mutex<Option<Instant>>>,
}

impl AlertGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fired: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn try_fire(&self) -> GateDecision {
        self.try_fire_at(Instant::now())
    }

    pub fn try_fire_at(&self, now: Instant) -> GateDecision {
        let mut last = self
            .last_fired
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(fired) = *last {
            let elapsed = now.saturating_duration_since(fired);
            if elapsed < self.cooldown {
                return GateDecision::Cooling {
                    remaining: self.cooldown - elapsed,
                };
            }
        }
        *last = Some(now);
        GateDecision::Fire
    }
}

/// Logs per-region similarity and runs the alert command on a match.
#[derive(Debug)]
pub struct AlertSink {
    label: String,
    gate: AlertGate,
    command: Vec<String>,
    alerts: u64,
}

impl AlertSink {
    pub fn new(label: impl Into<String>, gate: AlertGate, command: Vec<String>) -> Self {
        Self {
            label: label.into(),
            gate,
            command,
            alerts: 0,
        }
    }

    /// Alerts this sink has fired.
    pub fn alerts(&self) -> u64 {
        self.alerts
    }

    fn alert(&mut self) -> Result<()> {
        self.alerts += 1;
        let Some((program, args)) = self.command.split_first() else {
            warn!(region = %self.label, "match detected");
            return Ok(());
        };
        // The child is reaped in the background once dropped
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start alert command '{}'", program))?;
        warn!(region = %self.label, command = %program, "match detected, alert started");
        Ok(())
    }
}

impl PresentationSink<MatchReport> for AlertSink {
    fn present(&mut self, item: Processed<MatchReport>) -> Result<()> {
        let report = item.output;
        info!(
            region = %self.label,
            sequence = item.sequence,
            similarity = %format!("{:.4}", report.similarity),
            matched = report.matched,
            "region checked"
        );
        if !report.matched {
            return Ok(());
        }
        match self.gate.try_fire() {
            GateDecision::Fire => self.alert(),
            GateDecision::Cooling { remaining } => {
                debug!(region = %self.label, ?remaining, "alert suppressed by cooldown");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn processed<O>(sequence: u64, output: O) -> Processed<O> {
        Processed {
            sequence,
            captured_at: SystemTime::now(),
            output,
        }
    }

    fn report(matched: bool) -> MatchReport {
        MatchReport {
            similarity: if matched { 0.99 } else { 0.5 },
            matched,
        }
    }

    #[test]
    fn test_gate_cooldown() {
        let gate = AlertGate::new(Duration::from_secs(20));
        let start = Instant::now();
        assert_eq!(gate.try_fire_at(start), GateDecision::Fire);
        assert_eq!(
            gate.try_fire_at(start + Duration::from_secs(5)),
            GateDecision::Cooling {
                remaining: Duration::from_secs(15)
            }
        );
        assert_eq!(
            gate.try_fire_at(start + Duration::from_secs(20)),
            GateDecision::Fire
        );
    }

    #[test]
    fn test_gate_is_shared_between_clones() {
        let gate = AlertGate::new(Duration::from_secs(60));
        let other = gate.clone();
        let now = Instant::now();
        assert_eq!(gate.try_fire_at(now), GateDecision::Fire);
        assert!(matches!(
            other.try_fire_at(now + Duration::from_secs(1)),
            GateDecision::Cooling { .. }
        ));
    }

    #[test]
    fn test_alert_sink_without_command_counts_alerts() {
        let gate = AlertGate::new(Duration::from_secs(60));
        let mut sink = AlertSink::new("left", gate, Vec::new());
        sink.present(processed(1, report(false))).unwrap();
        assert_eq!(sink.alerts(), 0);
        sink.present(processed(2, report(true))).unwrap();
        sink.present(processed(3, report(true))).unwrap();
        assert_eq!(sink.alerts(), 1);
    }

    #[tokio::test]
    async fn test_alert_spawn_failure_is_an_error() {
        let gate = AlertGate::new(Duration::ZERO);
        let mut sink = AlertSink::new(
            "right",
            gate,
            vec!["screenwatch-no-such-player".to_string(), "audio.mp3".to_string()],
        );
        assert!(sink.present(processed(1, report(true))).is_err());
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (mut sink, mut rx) = ChannelSink::channel(1);
        sink.present(processed(1, "a")).unwrap();
        sink.present(processed(2, "b")).unwrap();
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.recv().await.unwrap().sequence, 1);

        drop(rx);
        assert!(sink.present(processed(3, "c")).is_err());
    }
}
