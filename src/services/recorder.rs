//! Run-session recorder.
//!
//! [`RunRecorder`] owns the `Idle → Running ⇄ Paused → Ended` lifecycle and
//! derives distance, pace and the four biomechanical scores from telemetry
//! samples. When no sensor is connected, an internal fixed-interval clock
//! feeds simulated samples for the configured run mode instead.
//!
//! # Score smoothing
//!
//! Each sample yields a target score per metric. The published score moves
//! toward the target by at most `max_score_step` points per sample and always
//! stays within `0..=100`.

use crate::metrics::Metrics;
use crate::models::{
    CorePolicy, MetricScores, Run, RunConfiguration, RunPhase, RunSessionState, TelemetryEvent,
    TelemetrySample, pace_secs_per_unit,
};
use crate::services::task::TaskGuard;
use crate::state::{Observable, StateManager};
use chrono::Utc;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

/// Cadence that scores full marks for efficiency, in steps per minute.
const IDEAL_CADENCE_SPM: f64 = 175.0;

/// Simulated biomechanics used on the clock path.
const SIMULATED_IMPACT_G: f64 = 2.0;
const SIMULATED_SWAY_CM: f64 = 4.0;
const SIMULATED_BRAKING_G: f64 = 0.15;

/// Commands accepted by the recorder, named in errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunCommand {
    Start,
    Pause,
    Resume,
    End,
    Ingest,
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunCommand::Start => "start",
            RunCommand::Pause => "pause",
            RunCommand::Resume => "resume",
            RunCommand::End => "end",
            RunCommand::Ingest => "ingest samples",
        };
        f.write_str(text)
    }
}

/// Errors returned by [`RunRecorder`] commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("Invalid state: cannot {command} while run is {phase}")]
    InvalidState { command: RunCommand, phase: RunPhase },
}

/// Change events emitted by a [`RunRecorder`]
#[derive(Clone, Debug, PartialEq)]
pub enum RunChange {
    PhaseChanged { from: RunPhase, to: RunPhase },
    ProgressUpdated { elapsed: Duration, distance_km: f64 },
    ScoresUpdated(MetricScores),
    /// The sensor link dropped; metrics hold their last values.
    LinkFrozen,
}

impl Observable for RunSessionState {
    type Change = RunChange;

    fn detect_changes(old: &Self, new: &Self) -> Vec<RunChange> {
        let mut changes = Vec::new();

        if old.phase != new.phase {
            changes.push(RunChange::PhaseChanged {
                from: old.phase,
                to: new.phase,
            });
        }

        if old.elapsed != new.elapsed || old.distance_m != new.distance_m {
            changes.push(RunChange::ProgressUpdated {
                elapsed: new.elapsed,
                distance_km: new.distance_km(),
            });
        }

        if old.scores != new.scores {
            changes.push(RunChange::ScoresUpdated(new.scores));
        }

        if !old.link_frozen && new.link_frozen {
            changes.push(RunChange::LinkFrozen);
        }

        changes
    }
}

/// Move `current` toward `target` by at most `max_step`.
pub fn smooth_toward(current: u8, target: u8, max_step: u8) -> u8 {
    let current = current.min(100);
    let target = target.min(100);
    if target >= current {
        current + (target - current).min(max_step)
    } else {
        current - (current - target).min(max_step)
    }
}

fn clamp_score(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}

/// Target scores implied by a single sample's raw values.
pub fn target_scores(sample: &TelemetrySample) -> MetricScores {
    MetricScores {
        efficiency: clamp_score(100.0 - (sample.cadence_spm - IDEAL_CADENCE_SPM).abs() * 1.5),
        impact: clamp_score(100.0 - (sample.impact_g - 1.5).max(0.0) * 30.0),
        sway: clamp_score(100.0 - sample.sway_cm.max(0.0) * 8.0),
        braking: clamp_score(100.0 - sample.braking_g.max(0.0) * 150.0),
    }
}

struct RecorderInner {
    state: StateManager<RunSessionState>,
    policy: CorePolicy,
    metrics: Arc<Metrics>,
    finalized: Mutex<Option<Run>>,
}

/// Records one run from configuration to finalized [`Run`].
///
/// Cloning is cheap and shares the same run.
#[derive(Clone)]
pub struct RunRecorder {
    inner: Arc<RecorderInner>,
}

impl RunRecorder {
    pub fn new(policy: CorePolicy, metrics: Arc<Metrics>) -> Self {
        let state =
            StateManager::with_capacity(RunSessionState::default(), policy.state_channel_capacity);
        Self {
            inner: Arc::new(RecorderInner {
                state,
                policy,
                metrics,
                finalized: Mutex::new(None),
            }),
        }
    }

    /// `Idle → Running`. Scores start from the policy baseline.
    pub fn start_run(&self, configuration: RunConfiguration) -> Result<(), RecorderError> {
        let baseline = MetricScores::uniform(self.inner.policy.score_baseline);

        self.transition(RunCommand::Start, |state| {
            if state.phase != RunPhase::Idle {
                return false;
            }
            tracing::info!(
                "Run started: mode={:?}, terrain={:?}, sensor={}",
                configuration.mode,
                configuration.terrain,
                configuration.sensor_connected
            );
            state.phase = RunPhase::Running;
            state.configuration = Some(configuration);
            state.started_at = Some(Utc::now());
            state.scores = baseline;
            true
        })
    }

    /// `Running → Paused`. Counters freeze until resumed.
    pub fn pause_run(&self) -> Result<(), RecorderError> {
        self.transition(RunCommand::Pause, |state| {
            if state.phase != RunPhase::Running {
                return false;
            }
            state.phase = RunPhase::Paused;
            true
        })?;
        tracing::info!("Run paused");
        Ok(())
    }

    /// `Paused → Running`.
    pub fn resume_run(&self) -> Result<(), RecorderError> {
        self.transition(RunCommand::Resume, |state| {
            if state.phase != RunPhase::Paused {
                return false;
            }
            state.phase = RunPhase::Running;
            true
        })?;
        tracing::info!("Run resumed");
        Ok(())
    }

    /// Seal the run and return the finalized record.
    ///
    /// # Errors
    /// `InvalidState` from `Idle` or `Ended`. A second call never changes the
    /// run returned by the first.
    pub fn end_run(&self) -> Result<Run, RecorderError> {
        let (_, run) = self.inner.state.try_update(|state| {
            if !matches!(state.phase, RunPhase::Running | RunPhase::Paused) {
                return Err(RecorderError::InvalidState {
                    command: RunCommand::End,
                    phase: state.phase,
                });
            }
            state.phase = RunPhase::Ended;

            let configuration = state
                .configuration
                .clone()
                .ok_or(RecorderError::InvalidState {
                    command: RunCommand::End,
                    phase: RunPhase::Idle,
                })?;
            let ended_at = Utc::now();

            Ok(Run {
                id: Uuid::new_v4(),
                configuration,
                started_at: state.started_at.unwrap_or(ended_at),
                ended_at,
                duration: state.elapsed,
                distance_km: state.distance_km(),
                pace_secs_per_unit: state.pace_secs_per_unit(),
                scores: state.scores,
                sample_count: state.sample_count,
                link_lost: state.link_frozen,
            })
        })?;

        *self.inner.finalized.lock().unwrap() = Some(run.clone());
        self.inner.metrics.record_run_completed();
        tracing::info!(
            "Run ended: {:.3} km in {:?} ({} samples)",
            run.distance_km,
            run.duration,
            run.sample_count
        );

        Ok(run)
    }

    /// Apply one telemetry sample.
    ///
    /// Returns `Ok(false)` when the sample was ignored: the run is paused or
    /// its metrics are frozen after a lost link.
    ///
    /// # Errors
    /// `InvalidState` before the run starts or after it ended.
    pub fn ingest_sample(&self, sample: &TelemetrySample) -> Result<bool, RecorderError> {
        let max_step = self.inner.policy.max_score_step;
        let targets = target_scores(sample);

        let (_, applied) = self.inner.state.try_update(|state| match state.phase {
            RunPhase::Idle | RunPhase::Ended => Err(RecorderError::InvalidState {
                command: RunCommand::Ingest,
                phase: state.phase,
            }),
            RunPhase::Paused => Ok(false),
            RunPhase::Running if state.link_frozen => Ok(false),
            RunPhase::Running => {
                state.elapsed += sample.interval;
                state.distance_m += sample.distance_m();
                state.scores = MetricScores {
                    efficiency: smooth_toward(
                        state.scores.efficiency,
                        targets.efficiency,
                        max_step,
                    ),
                    impact: smooth_toward(state.scores.impact, targets.impact, max_step),
                    sway: smooth_toward(state.scores.sway, targets.sway, max_step),
                    braking: smooth_toward(state.scores.braking, targets.braking, max_step),
                };
                state.sample_count += 1;
                Ok(true)
            }
        })?;

        if applied {
            self.inner.metrics.record_sample();
        }
        Ok(applied)
    }

    /// Advance the run by `dt` on the simulated-cadence path.
    pub fn advance_clock(&self, dt: Duration) -> Result<bool, RecorderError> {
        let sample = self.simulated_sample(dt)?;
        self.ingest_sample(&sample)
    }

    /// Freeze metrics at their last values after the sensor link dropped.
    pub fn mark_link_lost(&self) {
        self.inner.state.update(|state| {
            if matches!(state.phase, RunPhase::Running | RunPhase::Paused) {
                state.link_frozen = true;
            }
        });
        tracing::warn!("Sensor link lost; run metrics frozen at last known values");
    }

    /// Feed samples from a sensor link into this run.
    ///
    /// The returned guard owns the consumer task; dropping it detaches the
    /// recorder from the stream.
    pub fn attach_telemetry(
        &self,
        mut telemetry: broadcast::Receiver<TelemetryEvent>,
    ) -> TaskGuard {
        let recorder = self.clone();

        TaskGuard::spawn(async move {
            loop {
                match telemetry.recv().await {
                    Ok(TelemetryEvent::Sample(sample)) => {
                        if recorder.ingest_sample(&sample).is_err() {
                            return;
                        }
                    }
                    Ok(TelemetryEvent::LinkLost) | Err(RecvError::Closed) => {
                        if recorder.phase() != RunPhase::Ended {
                            recorder.mark_link_lost();
                        }
                        return;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Recorder lagged behind telemetry, skipped {} samples",
                            skipped
                        );
                    }
                }
            }
        })
    }

    /// Drive this run from the internal clock at the policy tick.
    pub fn start_clock(&self) -> TaskGuard {
        let recorder = self.clone();
        let period = self.inner.policy.clock_tick();

        TaskGuard::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                if recorder.advance_clock(period).is_err() {
                    return;
                }
            }
        })
    }

    pub fn snapshot(&self) -> RunSessionState {
        self.inner.state.snapshot()
    }

    pub fn phase(&self) -> RunPhase {
        self.inner.state.read(|s| s.phase)
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.state.read(|s| s.elapsed)
    }

    pub fn distance_km(&self) -> f64 {
        self.inner.state.read(RunSessionState::distance_km)
    }

    pub fn scores(&self) -> MetricScores {
        self.inner.state.read(|s| s.scores)
    }

    /// Seconds per kilometer; `None` while no distance has been covered.
    pub fn pace_secs_per_unit(&self) -> Option<f64> {
        self.inner
            .state
            .read(|s| pace_secs_per_unit(s.elapsed, s.distance_km()))
    }

    /// The run returned by [`end_run`](Self::end_run), once it exists.
    pub fn finalized_run(&self) -> Option<Run> {
        self.inner.finalized.lock().unwrap().clone()
    }

    /// Subscribe to run state changes
    pub fn subscribe(&self) -> broadcast::Receiver<RunChange> {
        self.inner.state.subscribe()
    }

    fn transition<F>(&self, command: RunCommand, apply: F) -> Result<(), RecorderError>
    where
        F: FnOnce(&mut RunSessionState) -> bool,
    {
        self.inner
            .state
            .try_update(|state| {
                let phase = state.phase;
                if apply(state) {
                    Ok(())
                } else {
                    Err(RecorderError::InvalidState { command, phase })
                }
            })
            .map(|_| ())
    }

    fn simulated_sample(&self, dt: Duration) -> Result<TelemetrySample, RecorderError> {
        let mode = self.inner.state.read(|s| {
            s.configuration
                .as_ref()
                .map(|c| c.mode)
                .ok_or(RecorderError::InvalidState {
                    command: RunCommand::Ingest,
                    phase: s.phase,
                })
        })?;
        let motion = self.inner.policy.simulation.for_mode(mode);

        Ok(TelemetrySample {
            interval: dt,
            speed_mps: motion.speed_mps,
            cadence_spm: motion.cadence_spm,
            impact_g: SIMULATED_IMPACT_G,
            sway_cm: SIMULATED_SWAY_CM,
            braking_g: SIMULATED_BRAKING_G,
        })
    }
}
