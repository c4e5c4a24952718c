//! Integration tests for RunRecorder
//!
//! These tests verify:
//! - The run lifecycle and its invalid-state errors
//! - Distance, pace and score derivation on the simulated clock path
//! - Live telemetry from a sensor link, including loss of signal
//! - Pause/resume invariants under arbitrary command sequences

use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use stridelink::Metrics;
use stridelink::models::{
    CorePolicy, RunConfiguration, RunMode, RunPhase, SensorId, Terrain, format_pace,
};
use stridelink::services::{
    RecorderError, RunChange, RunCommand, RunRecorder, SensorLink, SimulatedTransport,
};

fn create_recorder() -> (RunRecorder, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    let recorder = RunRecorder::new(CorePolicy::default(), Arc::clone(&metrics));
    (recorder, metrics)
}

fn road_run() -> RunConfiguration {
    RunConfiguration::without_sensor(RunMode::Run, Terrain::Road)
}

#[test]
fn test_simulated_run_distance_and_pace() {
    let (recorder, metrics) = create_recorder();
    recorder.start_run(road_run()).unwrap();

    for _ in 0..600 {
        assert!(recorder.advance_clock(Duration::from_secs(1)).unwrap());
    }

    assert_eq!(recorder.elapsed(), Duration::from_secs(600));
    assert!((recorder.distance_km() - 1.5).abs() < 1e-9);
    let pace = recorder.pace_secs_per_unit().unwrap();
    assert!((pace - 400.0).abs() < 1e-6);
    assert_eq!(format_pace(Some(pace)), "6:40");

    // Paused time never counts
    recorder.pause_run().unwrap();
    for _ in 0..600 {
        assert!(!recorder.advance_clock(Duration::from_secs(1)).unwrap());
    }
    assert_eq!(recorder.elapsed(), Duration::from_secs(600));
    assert!((recorder.distance_km() - 1.5).abs() < 1e-9);

    let run = recorder.end_run().unwrap();
    assert!((run.distance_km - 1.5).abs() < 1e-9);
    assert_eq!(run.duration, Duration::from_secs(600));
    assert_eq!(run.sample_count, 600);
    assert!(!run.link_lost);
    assert_eq!(run.configuration, road_run());
    assert_eq!(metrics.runs_completed.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.samples_ingested.load(Ordering::Relaxed), 600);
}

#[test]
fn test_pace_undefined_before_any_distance() {
    let (recorder, _metrics) = create_recorder();
    recorder.start_run(road_run()).unwrap();

    assert_eq!(recorder.pace_secs_per_unit(), None);
    assert_eq!(format_pace(recorder.pace_secs_per_unit()), "--:--");
}

#[test]
fn test_walk_mode_uses_walk_profile() {
    let (recorder, _metrics) = create_recorder();
    recorder
        .start_run(RunConfiguration::without_sensor(RunMode::Walk, Terrain::Trail))
        .unwrap();

    for _ in 0..100 {
        recorder.advance_clock(Duration::from_secs(1)).unwrap();
    }

    assert!((recorder.distance_km() - 0.125).abs() < 1e-9);
}

#[test]
fn test_scores_stay_in_range_and_move_gradually() {
    let (recorder, _metrics) = create_recorder();
    recorder.start_run(road_run()).unwrap();
    let baseline = recorder.scores();
    assert_eq!(baseline.efficiency, 50);

    let mut previous = baseline;
    for _ in 0..50 {
        recorder.advance_clock(Duration::from_secs(1)).unwrap();
        let scores = recorder.scores();
        for (before, after) in [
            (previous.efficiency, scores.efficiency),
            (previous.impact, scores.impact),
            (previous.sway, scores.sway),
            (previous.braking, scores.braking),
        ] {
            assert!(after <= 100);
            assert!(before.abs_diff(after) <= 5);
        }
        previous = scores;
    }
}

#[test]
fn test_end_run_twice_is_invalid_state() {
    let (recorder, metrics) = create_recorder();
    recorder.start_run(road_run()).unwrap();
    recorder.advance_clock(Duration::from_secs(5)).unwrap();

    let first = recorder.end_run().unwrap();
    let second = recorder.end_run();

    assert_eq!(
        second,
        Err(RecorderError::InvalidState {
            command: RunCommand::End,
            phase: RunPhase::Ended
        })
    );
    assert_eq!(recorder.finalized_run(), Some(first));
    assert_eq!(metrics.runs_completed.load(Ordering::Relaxed), 1);
}

#[test]
fn test_end_run_from_idle_is_invalid_state() {
    let (recorder, _metrics) = create_recorder();

    assert!(matches!(
        recorder.end_run(),
        Err(RecorderError::InvalidState {
            phase: RunPhase::Idle,
            ..
        })
    ));
    assert_eq!(recorder.finalized_run(), None);
}

#[test]
fn test_illegal_transitions_rejected() {
    let (recorder, _metrics) = create_recorder();

    assert!(recorder.pause_run().is_err());
    assert!(recorder.resume_run().is_err());

    recorder.start_run(road_run()).unwrap();
    assert!(recorder.start_run(road_run()).is_err());
    assert!(recorder.resume_run().is_err());

    recorder.pause_run().unwrap();
    assert!(recorder.pause_run().is_err());

    recorder.end_run().unwrap();
    assert!(recorder.resume_run().is_err());
    assert!(recorder.advance_clock(Duration::from_secs(1)).is_err());
    assert_eq!(recorder.phase(), RunPhase::Ended);
}

#[test]
fn test_phase_change_events() {
    let (recorder, _metrics) = create_recorder();
    let mut rx = recorder.subscribe();

    recorder.start_run(road_run()).unwrap();
    recorder.pause_run().unwrap();
    recorder.resume_run().unwrap();

    let mut phases = Vec::new();
    while let Ok(change) = rx.try_recv() {
        if let RunChange::PhaseChanged { from, to } = change {
            phases.push((from, to));
        }
    }

    assert_eq!(
        phases,
        vec![
            (RunPhase::Idle, RunPhase::Running),
            (RunPhase::Running, RunPhase::Paused),
            (RunPhase::Paused, RunPhase::Running),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_clock_drives_run_until_guard_dropped() {
    let (recorder, _metrics) = create_recorder();
    recorder.start_run(road_run()).unwrap();

    let clock = recorder.start_clock();
    tokio::time::sleep(Duration::from_millis(10_500)).await;
    assert_eq!(recorder.elapsed(), Duration::from_secs(10));

    drop(clock);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(recorder.elapsed(), Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_clock_pauses_with_run() {
    let (recorder, _metrics) = create_recorder();
    recorder.start_run(road_run()).unwrap();
    let _clock = recorder.start_clock();

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    recorder.pause_run().unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    recorder.resume_run().unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(recorder.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_live_telemetry_then_link_lost() {
    let transport = SimulatedTransport::demo();
    let metrics = Arc::new(Metrics::new());
    let link = SensorLink::new(
        Arc::new(transport.clone()),
        &CorePolicy::default(),
        Arc::clone(&metrics),
    )
    .unwrap();
    let id = SensorId::new("SL-0001");

    link.start_scanning().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    link.stop_scanning();
    link.connect(&id).await.unwrap();

    let recorder = RunRecorder::new(CorePolicy::default(), Arc::clone(&metrics));
    recorder
        .start_run(RunConfiguration::with_sensor(
            RunMode::Run,
            Terrain::Road,
            id.clone(),
            Some(80),
        ))
        .unwrap();
    let _telemetry = recorder.attach_telemetry(link.subscribe_telemetry().unwrap());

    tokio::time::sleep(Duration::from_millis(5_500)).await;
    let before_loss = recorder.snapshot();
    assert!((4..=6).contains(&before_loss.sample_count));
    assert!(before_loss.distance_m > 0.0);

    transport.drop_link(&id);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let frozen = recorder.snapshot();
    assert!(frozen.link_frozen);
    assert_eq!(recorder.phase(), RunPhase::Running);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(recorder.snapshot().sample_count, frozen.sample_count);

    // Frozen runs can still be paused, resumed and ended
    recorder.pause_run().unwrap();
    recorder.resume_run().unwrap();
    let run = recorder.end_run().unwrap();
    assert!(run.link_lost);
    assert_eq!(run.sample_count, frozen.sample_count);
}

#[derive(Clone, Debug)]
enum Op {
    Tick(u64),
    Pause,
    Resume,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..5).prop_map(Op::Tick),
        Just(Op::Pause),
        Just(Op::Resume),
    ]
}

proptest! {
    #[test]
    fn prop_elapsed_counts_only_running_ticks(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let (recorder, _metrics) = create_recorder();
        recorder.start_run(road_run()).unwrap();

        let mut expected = Duration::ZERO;
        let mut last_distance = 0.0;

        for op in ops {
            match op {
                Op::Tick(secs) => {
                    let running = recorder.phase() == RunPhase::Running;
                    let applied = recorder.advance_clock(Duration::from_secs(secs)).unwrap();
                    prop_assert_eq!(applied, running);
                    if running {
                        expected += Duration::from_secs(secs);
                    }
                }
                Op::Pause => {
                    let was_running = recorder.phase() == RunPhase::Running;
                    prop_assert_eq!(recorder.pause_run().is_ok(), was_running);
                }
                Op::Resume => {
                    let was_paused = recorder.phase() == RunPhase::Paused;
                    prop_assert_eq!(recorder.resume_run().is_ok(), was_paused);
                }
            }

            let distance = recorder.distance_km();
            prop_assert!(distance >= last_distance);
            last_distance = distance;
            prop_assert_eq!(recorder.elapsed(), expected);
        }

        let run = recorder.end_run().unwrap();
        prop_assert_eq!(run.duration, expected);
    }
}
