//! Integration tests for StateManager
//!
//! Exercises the generic manager with a small local state type and with the
//! recorder's published `RunSessionState`.

use std::sync::Arc;
use std::time::Duration;
use stridelink::models::{RunConfiguration, RunMode, RunPhase, RunSessionState, Terrain};
use stridelink::services::RunChange;
use stridelink::{Observable, StateManager};
use tokio::sync::broadcast;
use tokio::time::timeout;

#[derive(Clone, Debug, Default, PartialEq)]
struct Tally {
    count: u64,
    closed: bool,
}

#[derive(Clone, Debug, PartialEq)]
enum TallyChange {
    Counted(u64),
    Closed,
}

impl Observable for Tally {
    type Change = TallyChange;

    fn detect_changes(old: &Self, new: &Self) -> Vec<TallyChange> {
        let mut changes = Vec::new();
        if old.count != new.count {
            changes.push(TallyChange::Counted(new.count));
        }
        if !old.closed && new.closed {
            changes.push(TallyChange::Closed);
        }
        changes
    }
}

#[tokio::test]
async fn test_every_subscriber_sees_each_change() {
    let state = StateManager::new(Tally::default());
    let mut first = state.subscribe();
    let mut second = state.subscribe();

    state.update(|s| s.count = 1);
    state.update(|s| s.closed = true);

    for rx in [&mut first, &mut second] {
        let a = timeout(Duration::from_secs(1), rx.recv()).await;
        let b = timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(a.unwrap().unwrap(), TallyChange::Counted(1));
        assert_eq!(b.unwrap().unwrap(), TallyChange::Closed);
    }
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_changes() {
    let state = StateManager::new(Tally::default());
    state.update(|s| s.count = 5);

    let mut rx = state.subscribe();
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(state.snapshot().count, 5);
}

#[test]
fn test_concurrent_updates_from_threads() {
    let state = Arc::new(StateManager::new(Tally::default()));
    let mut rx = state.subscribe();

    let mut handles = vec![];
    for _ in 0..8 {
        let state = Arc::clone(&state);
        handles.push(std::thread::spawn(move || {
            for _ in 0..10 {
                state.update(|s| s.count += 1);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(state.snapshot().count, 80);

    // Events arrive in commit order, so the counts are strictly increasing
    let mut seen = Vec::new();
    while let Ok(TallyChange::Counted(n)) = rx.try_recv() {
        seen.push(n);
    }
    assert_eq!(seen, (1..=80).collect::<Vec<_>>());
}

#[test]
fn test_failed_try_update_commits_nothing() {
    let state = StateManager::new(Tally::default());
    let mut rx = state.subscribe();

    let result: Result<(Vec<TallyChange>, u64), String> = state.try_update(|s| {
        s.count = 42;
        s.closed = true;
        Err("closed tallies cannot count".to_string())
    });

    assert!(result.is_err());
    assert_eq!(state.snapshot(), Tally::default());
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_successful_try_update_returns_value_and_changes() {
    let state = StateManager::new(Tally::default());

    let (changes, previous) = state
        .try_update(|s| {
            let previous = s.count;
            s.count += 3;
            Ok::<_, String>(previous)
        })
        .unwrap();

    assert_eq!(previous, 0);
    assert_eq!(changes, vec![TallyChange::Counted(3)]);
}

#[test]
fn test_small_capacity_reports_lag() {
    let state = StateManager::with_capacity(Tally::default(), 2);
    let mut rx = state.subscribe();

    for n in 1..=5 {
        state.update(|s| s.count = n);
    }

    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Lagged(_))
    ));
    // The newest events are still delivered after the lag notice
    assert_eq!(rx.try_recv().unwrap(), TallyChange::Counted(4));
    assert_eq!(rx.try_recv().unwrap(), TallyChange::Counted(5));
}

#[test]
fn test_run_session_phase_changes() {
    let state = StateManager::new(RunSessionState::default());
    let mut rx = state.subscribe();

    state.update(|s| {
        s.phase = RunPhase::Running;
        s.configuration = Some(RunConfiguration::without_sensor(
            RunMode::Run,
            Terrain::Road,
        ));
    });

    let change = rx.try_recv().unwrap();
    assert!(matches!(
        change,
        RunChange::PhaseChanged {
            from: RunPhase::Idle,
            to: RunPhase::Running
        }
    ));
    assert_eq!(state.read(|s| s.phase), RunPhase::Running);
}
