//! Capture loop ordering and processing tests
//!
//! Sequence numbers, result ordering under overlapped processing, and how
//! processor and sink failures are reported without stopping the loop.

mod common;

use std::time::Duration;

use common::*;
use screenwatch::session::{CaptureLoop, LoopEvent, LoopState};

#[tokio::test(flavor = "multi_thread")]
async fn test_sequences_strictly_increase_and_all_results_presented() {
    let timeline = Timeline::default();
    let mut capture = CaptureLoop::builder()
        .with_label("ordering")
        .with_backend(ScriptedBackend::frames(42))
        .with_processor(FirstByte)
        .with_sink(timeline.sink())
        .with_observer(timeline.observer())
        .with_target(target())
        .with_config(fast_config(5))
        .build()
        .unwrap();

    capture.start().unwrap();
    assert_eq!(capture.state(), LoopState::Running);
    tokio::time::sleep(Duration::from_millis(200)).await;
    capture.stop();
    let report = capture.join().await.unwrap();

    assert_eq!(report.state, LoopState::Stopped);
    assert!(report.is_clean());

    let presented = timeline.presented();
    assert!(!presented.is_empty(), "nothing was presented");
    assert_strictly_increasing(&presented);
    assert_eq!(report.stats.presented, presented.len() as u64);
    assert_eq!(
        report.stats.captured,
        report.stats.dispatched + report.stats.dropped
    );
    assert_eq!(report.stats.last_sequence, report.stats.captured);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_outputs_carry_frame_contents() {
    let timeline = Timeline::default();
    let sink = timeline.sink::<u8>();
    let outputs = sink.outputs();
    let mut capture = CaptureLoop::builder()
        .with_backend(ScriptedBackend::new(
            [Step::Frame(1), Step::Frame(2), Step::Frame(3)],
            Step::Frame(9),
        ))
        .with_processor(FirstByte)
        .with_sink(sink)
        .with_target(target())
        .with_config(fast_config(20))
        .build()
        .unwrap();

    capture.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    capture.stop();
    capture.join().await.unwrap();

    let outputs = outputs.lock().unwrap();
    let by_sequence: Vec<(u64, u8)> = outputs.iter().map(|p| (p.sequence, p.output)).collect();
    assert_eq!(&by_sequence[..3], &[(1, 1), (2, 2), (3, 3)]);
    assert!(by_sequence[3..].iter().all(|&(_, byte)| byte == 9));

    for pair in outputs.windows(2) {
        assert!(pair[0].captured_at <= pair[1].captured_at);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reentrant_processor_results_presented_in_order() {
    let timeline = Timeline::default();
    // Odd frames take much longer, so later frames finish first
    let processor = SlowProcessor::new(Duration::from_millis(2))
        .reentrant(Duration::from_millis(40));
    let mut capture = CaptureLoop::builder()
        .with_backend(ScriptedBackend::frames(0))
        .with_processor(processor)
        .with_sink(timeline.sink())
        .with_observer(timeline.observer())
        .with_target(target())
        .with_config(screenwatch::config::LoopConfig {
            max_in_flight: 4,
            ..fast_config(5)
        })
        .build()
        .unwrap();

    capture.start().unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    capture.stop();
    let report = capture.join().await.unwrap();

    let presented = timeline.presented();
    assert!(presented.len() > 4);
    assert_strictly_increasing(&presented);
    assert_eq!(report.stats.presented, report.stats.dispatched);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_reentrant_processor_never_overlaps() {
    let processor = std::sync::Arc::new(SlowProcessor::new(Duration::from_millis(15)));
    let mut capture = CaptureLoop::builder()
        .with_backend(ScriptedBackend::frames(0))
        .with_shared_processor(std::sync::Arc::clone(&processor))
        .with_sink(|_: screenwatch::Processed<u64>| -> anyhow::Result<()> { Ok(()) })
        .with_target(target())
        .with_config(screenwatch::config::LoopConfig {
            max_in_flight: 4,
            ..fast_config(2)
        })
        .build()
        .unwrap();

    capture.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    capture.stop();
    capture.join().await.unwrap();

    assert_eq!(
        processor
            .max_active
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_processor_error_and_panic_are_reported() {
    let timeline = Timeline::default();
    let mut capture = CaptureLoop::builder()
        .with_backend(ScriptedBackend::frames(0))
        .with_processor(FlakyProcessor {
            fail_on: 2,
            panic_on: 3,
        })
        .with_sink(timeline.sink())
        .with_observer(timeline.observer())
        .with_target(target())
        .with_config(fast_config(10))
        .build()
        .unwrap();

    capture.start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(capture.state(), LoopState::Running);
    capture.stop();
    let report = capture.join().await.unwrap();
    assert!(report.is_clean());

    let presented = timeline.presented();
    assert!(!presented.contains(&2));
    assert!(!presented.contains(&3));
    assert!(presented.iter().any(|&seq| seq > 3));
    assert_eq!(report.stats.processor_errors, 2);

    let failures: Vec<(u64, String)> = timeline
        .events()
        .into_iter()
        .filter_map(|event| match event {
            LoopEvent::ProcessorFailed { sequence, error } => Some((sequence, error)),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].0, 2);
    assert!(failures[0].1.contains("cannot process frame 2"));
    assert_eq!(failures[1].0, 3);
    assert!(failures[1].1.contains("panicked"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sink_error_does_not_stop_loop() {
    let timeline = Timeline::default();
    let mut capture = CaptureLoop::builder()
        .with_backend(ScriptedBackend::frames(0))
        .with_processor(FirstByte)
        .with_sink(timeline.sink().failing_on(1))
        .with_observer(timeline.observer())
        .with_target(target())
        .with_config(fast_config(10))
        .build()
        .unwrap();

    capture.start().unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    capture.stop();
    let report = capture.join().await.unwrap();

    assert_eq!(report.stats.presentation_errors, 1);
    assert!(timeline.events().iter().any(|event| matches!(
        event,
        LoopEvent::PresentationFailed {
            sequence: Some(1),
            ..
        }
    )));
    let presented = timeline.presented();
    assert!(!presented.contains(&1));
    assert!(presented.contains(&2));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_state_transitions_are_observed_in_order() {
    let timeline = Timeline::default();
    let mut capture = CaptureLoop::builder()
        .with_backend(ScriptedBackend::frames(0))
        .with_processor(FirstByte)
        .with_sink(timeline.sink())
        .with_observer(timeline.observer())
        .with_target(target())
        .with_config(fast_config(10))
        .build()
        .unwrap();

    capture.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    capture.stop();
    capture.join().await.unwrap();

    let transitions: Vec<(LoopState, LoopState)> = timeline
        .events()
        .into_iter()
        .filter_map(|event| match event {
            LoopEvent::StateChanged { from, to } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (LoopState::Idle, LoopState::Running),
            (LoopState::Running, LoopState::Draining),
            (LoopState::Draining, LoopState::Stopped),
        ]
    );
}
