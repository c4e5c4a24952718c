//! Recovery of buffered sensor data after an interrupted run.
//!
//! [`RecoveryCoordinator`] walks the recovery wizard:
//!
//! ```text
//! CrashDetected ──request_recovery──▶ ResetNotice ──acknowledge_reset──▶ SensorSelection
//!       │                                  ◀── back ──                        │ select_sensor
//!    decline                                                                  ▼
//!       ▼                          SensorSelection ◀── try_again ── Result ◀── Recovering
//!   Dismissed ◀──────────────── dismiss ──────────────────────────────┘
//! ```
//!
//! `back` also cancels an in-flight retrieval, and `abandon` ends the wizard
//! from any step. Retrieval runs as a spawned task that connects through the
//! shared [`SensorLink`], checks the retention window and battery, then pulls
//! buffered data under the policy retrieval timeout. No automatic retries.

use crate::metrics::Metrics;
use crate::models::{
    CorePolicy, CrashedRunInfo, RecoveryErrorKind, RecoveryResult, RecoverySensor, RecoveryStep,
    RecoveryStepKind, SensorId, rank_candidates,
};
use crate::services::sensor_link::{LinkChange, LinkError, SensorLink};
use crate::services::task::TaskGuard;
use crate::services::transport::TransportError;
use crate::state::{Observable, StateManager};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Errors returned by [`RecoveryCoordinator`] commands
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecoveryError {
    #[error("Invalid step: cannot {command} during {step}")]
    InvalidStep {
        command: &'static str,
        step: RecoveryStepKind,
    },

    #[error("Sensor {0} is not a recovery candidate")]
    UnknownSensor(SensorId),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Published state of a recovery session.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveryState {
    pub crashed: CrashedRunInfo,
    pub step: RecoveryStep,
}

/// Change events emitted by a [`RecoveryCoordinator`]
#[derive(Clone, Debug, PartialEq)]
pub enum RecoveryChange {
    StepChanged {
        from: RecoveryStepKind,
        to: RecoveryStepKind,
    },
    CandidatesUpdated {
        count: usize,
    },
    ResultReady {
        success: bool,
        error: Option<RecoveryErrorKind>,
    },
}

impl Observable for RecoveryState {
    type Change = RecoveryChange;

    fn detect_changes(old: &Self, new: &Self) -> Vec<RecoveryChange> {
        let mut changes = Vec::new();
        let (from, to) = (old.step.kind(), new.step.kind());

        if from != to {
            changes.push(RecoveryChange::StepChanged { from, to });
        }

        match (&old.step, &new.step) {
            (
                RecoveryStep::SensorSelection { candidates: before },
                RecoveryStep::SensorSelection { candidates: after },
            ) if before != after => {
                changes.push(RecoveryChange::CandidatesUpdated { count: after.len() });
            }
            (_, RecoveryStep::Result { result, .. }) if from != to => {
                changes.push(RecoveryChange::ResultReady {
                    success: result.success(),
                    error: result.error(),
                });
            }
            _ => {}
        }

        changes
    }
}

#[derive(Default)]
struct RecoveryTasks {
    generation: u64,
    watcher: Option<TaskGuard>,
    retrieval: Option<TaskGuard>,
}

struct RecoveryInner {
    link: SensorLink,
    state: StateManager<RecoveryState>,
    /// Last-connected times as of opening the session: the caller's history
    /// (e.g. from the run library) merged with the link's. Connections the
    /// session makes itself never land here.
    history: IndexMap<SensorId, DateTime<Utc>>,
    retention_window: chrono::Duration,
    retrieval_timeout: Duration,
    metrics: Arc<Metrics>,
    // Lock order: tasks before state.
    tasks: Mutex<RecoveryTasks>,
}

impl Drop for RecoveryInner {
    fn drop(&mut self) {
        match self.state.read(|s| s.step.kind()) {
            RecoveryStepKind::SensorSelection => self.link.stop_scanning(),
            RecoveryStepKind::Recovering => self.link.disconnect(),
            _ => {}
        }
    }
}

/// Drives one recovery session for one crashed run.
///
/// Cloning is cheap and shares the session. Dropping the last clone cancels
/// any scan or retrieval it started.
#[derive(Clone)]
pub struct RecoveryCoordinator {
    inner: Arc<RecoveryInner>,
}

impl RecoveryCoordinator {
    pub fn new(
        link: SensorLink,
        crashed: CrashedRunInfo,
        known_history: IndexMap<SensorId, DateTime<Utc>>,
        policy: &CorePolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        tracing::info!(
            "Recovery session opened for run started at {}",
            crashed.started_at
        );

        let history = merge_history(known_history, link.connection_history());

        let state = StateManager::with_capacity(
            RecoveryState {
                crashed,
                step: RecoveryStep::CrashDetected,
            },
            policy.state_channel_capacity,
        );

        Self {
            inner: Arc::new(RecoveryInner {
                link,
                state,
                history,
                retention_window: policy.retention_window(),
                retrieval_timeout: policy.retrieval_timeout(),
                metrics,
                tasks: Mutex::new(RecoveryTasks::default()),
            }),
        }
    }

    /// `CrashDetected → ResetNotice`.
    pub fn request_recovery(&self) -> Result<(), RecoveryError> {
        let _tasks = self.inner.tasks.lock().unwrap();
        self.expect_step("request_recovery", &[RecoveryStepKind::CrashDetected])?;
        self.inner.set_step(RecoveryStep::ResetNotice);
        Ok(())
    }

    /// `CrashDetected → Dismissed`.
    pub fn decline(&self) -> Result<(), RecoveryError> {
        let _tasks = self.inner.tasks.lock().unwrap();
        self.expect_step("decline", &[RecoveryStepKind::CrashDetected])?;
        self.inner.set_step(RecoveryStep::Dismissed);
        tracing::info!("Recovery declined");
        Ok(())
    }

    /// `ResetNotice → SensorSelection` and start scanning.
    ///
    /// # Errors
    /// [`RecoveryError::Link`] if the scan could not start. The step still
    /// moves to `SensorSelection` (with no candidates) so the user can fix the
    /// radio and [`rescan`](Self::rescan).
    pub fn acknowledge_reset(&self) -> Result<(), RecoveryError> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        self.expect_step("acknowledge_reset", &[RecoveryStepKind::ResetNotice])?;
        self.inner.set_step(RecoveryStep::SensorSelection {
            candidates: Vec::new(),
        });
        self.begin_selection(&mut tasks)
    }

    /// Step back one screen.
    ///
    /// - `ResetNotice → CrashDetected`
    /// - `SensorSelection → ResetNotice`, stopping the scan
    /// - `Recovering → SensorSelection`, cancelling the retrieval and
    ///   disconnecting before scanning again
    pub fn back(&self) -> Result<(), RecoveryError> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let step = self.expect_step(
            "back",
            &[
                RecoveryStepKind::ResetNotice,
                RecoveryStepKind::SensorSelection,
                RecoveryStepKind::Recovering,
            ],
        )?;

        match step {
            RecoveryStepKind::ResetNotice => {
                self.inner.set_step(RecoveryStep::CrashDetected);
                Ok(())
            }
            RecoveryStepKind::SensorSelection => {
                tasks.generation += 1;
                tasks.watcher = None;
                self.inner.link.stop_scanning();
                self.inner.set_step(RecoveryStep::ResetNotice);
                Ok(())
            }
            _ => {
                tasks.generation += 1;
                tasks.retrieval = None;
                self.inner.link.disconnect();
                tracing::info!("Recovery cancelled by user");
                self.inner.set_step(RecoveryStep::SensorSelection {
                    candidates: Vec::new(),
                });
                self.begin_selection(&mut tasks)
            }
        }
    }

    /// Restart the scan while choosing a sensor.
    pub fn rescan(&self) -> Result<(), RecoveryError> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        self.expect_step("rescan", &[RecoveryStepKind::SensorSelection])?;
        self.begin_selection(&mut tasks)
    }

    /// Rebuild and rank the candidate list from the link's discovered sensors.
    pub fn refresh_candidates(&self) -> Result<Vec<RecoverySensor>, RecoveryError> {
        let _tasks = self.inner.tasks.lock().unwrap();
        self.expect_step("refresh_candidates", &[RecoveryStepKind::SensorSelection])?;
        Ok(self.inner.refresh_candidates())
    }

    /// `SensorSelection → Recovering` for a listed candidate.
    ///
    /// # Errors
    /// [`RecoveryError::UnknownSensor`] if `id` is not a current candidate;
    /// the step does not change.
    pub fn select_sensor(&self, id: &SensorId) -> Result<(), RecoveryError> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        self.expect_step("select_sensor", &[RecoveryStepKind::SensorSelection])?;

        let sensor = self
            .inner
            .state
            .read(|s| match &s.step {
                RecoveryStep::SensorSelection { candidates } => {
                    candidates.iter().find(|c| c.id() == id).cloned()
                }
                _ => None,
            })
            .ok_or_else(|| RecoveryError::UnknownSensor(id.clone()))?;

        tasks.generation += 1;
        tasks.watcher = None;
        self.inner.link.stop_scanning();

        self.inner.set_step(RecoveryStep::Recovering {
            sensor: sensor.clone(),
        });
        tracing::info!("Recovering buffered data from {}", sensor.id());

        let attempt = RetrievalAttempt {
            link: self.inner.link.clone(),
            retention_window: self.inner.retention_window,
            retrieval_timeout: self.inner.retrieval_timeout,
            crashed_started_at: self.inner.state.read(|s| s.crashed.started_at),
        };
        tasks.retrieval = Some(TaskGuard::spawn(retrieve(
            Arc::downgrade(&self.inner),
            tasks.generation,
            attempt,
            sensor,
        )));

        Ok(())
    }

    /// `Result → SensorSelection` after a failed attempt.
    pub fn try_again(&self) -> Result<(), RecoveryError> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let failed = self.inner.state.read(|s| {
            matches!(&s.step, RecoveryStep::Result { result, .. } if !result.success())
        });
        if !failed {
            return Err(RecoveryError::InvalidStep {
                command: "try_again",
                step: self.step_kind(),
            });
        }

        self.inner.set_step(RecoveryStep::SensorSelection {
            candidates: Vec::new(),
        });
        self.begin_selection(&mut tasks)
    }

    /// `Result → Dismissed`.
    pub fn dismiss(&self) -> Result<(), RecoveryError> {
        let _tasks = self.inner.tasks.lock().unwrap();
        self.expect_step("dismiss", &[RecoveryStepKind::Result])?;
        self.inner.set_step(RecoveryStep::Dismissed);
        Ok(())
    }

    /// Leave the wizard from any step, cancelling whatever is in flight.
    pub fn abandon(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        tasks.generation += 1;
        tasks.watcher = None;
        tasks.retrieval = None;

        match self.step_kind() {
            RecoveryStepKind::Dismissed => return,
            RecoveryStepKind::SensorSelection => self.inner.link.stop_scanning(),
            RecoveryStepKind::Recovering => self.inner.link.disconnect(),
            _ => {}
        }

        self.inner.set_step(RecoveryStep::Dismissed);
        tracing::info!("Recovery abandoned");
    }

    /// Wait until no retrieval is in flight and return the current step.
    pub async fn settled(&self) -> RecoveryStep {
        let mut changes = self.inner.state.subscribe();

        loop {
            let step = self.step();
            if step.kind() != RecoveryStepKind::Recovering {
                return step;
            }

            match changes.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return self.step(),
            }
        }
    }

    pub fn step(&self) -> RecoveryStep {
        self.inner.state.read(|s| s.step.clone())
    }

    pub fn step_kind(&self) -> RecoveryStepKind {
        self.inner.state.read(|s| s.step.kind())
    }

    pub fn crashed(&self) -> CrashedRunInfo {
        self.inner.state.read(|s| s.crashed.clone())
    }

    /// Current candidates; empty outside `SensorSelection`.
    pub fn candidates(&self) -> Vec<RecoverySensor> {
        self.inner.state.read(|s| match &s.step {
            RecoveryStep::SensorSelection { candidates } => candidates.clone(),
            _ => Vec::new(),
        })
    }

    /// Outcome of the last attempt while on the `Result` step.
    pub fn result(&self) -> Option<RecoveryResult> {
        self.inner.state.read(|s| match &s.step {
            RecoveryStep::Result { result, .. } => Some(result.clone()),
            _ => None,
        })
    }

    pub fn snapshot(&self) -> RecoveryState {
        self.inner.state.snapshot()
    }

    /// Subscribe to recovery state changes
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryChange> {
        self.inner.state.subscribe()
    }

    fn expect_step(
        &self,
        command: &'static str,
        allowed: &[RecoveryStepKind],
    ) -> Result<RecoveryStepKind, RecoveryError> {
        let step = self.step_kind();
        if allowed.contains(&step) {
            Ok(step)
        } else {
            tracing::warn!("Rejected {} during {}", command, step);
            Err(RecoveryError::InvalidStep { command, step })
        }
    }

    /// Start a fresh scan and a watcher that keeps candidates current.
    fn begin_selection(&self, tasks: &mut RecoveryTasks) -> Result<(), RecoveryError> {
        tasks.generation += 1;
        let changes = self.inner.link.subscribe();
        tasks.watcher = Some(TaskGuard::spawn(watch_candidates(
            Arc::downgrade(&self.inner),
            tasks.generation,
            changes,
        )));

        let scan = self.inner.link.start_scanning();
        self.inner.refresh_candidates();

        if let Err(err) = &scan {
            tracing::warn!("Recovery scan could not start: {}", err);
        }
        scan.map_err(RecoveryError::from)
    }
}

impl RecoveryInner {
    fn set_step(&self, next: RecoveryStep) {
        let changes = self.state.update(|s| s.step = next);
        for change in changes {
            if let RecoveryChange::StepChanged { from, to } = change {
                tracing::info!("Recovery step: {} -> {}", from, to);
            }
        }
    }

    fn refresh_candidates(&self) -> Vec<RecoverySensor> {
        let history = &self.history;
        let previous = self.state.read(|s| s.crashed.sensor_id.clone());

        let mut candidates: Vec<RecoverySensor> = self
            .link
            .sensors()
            .into_iter()
            .map(|descriptor| RecoverySensor {
                previously_connected: previous.as_ref() == Some(&descriptor.id),
                last_connected: history.get(&descriptor.id).copied(),
                descriptor,
            })
            .collect();
        rank_candidates(&mut candidates);

        self.state.update(|s| {
            if let RecoveryStep::SensorSelection { candidates: current } = &mut s.step {
                *current = candidates.clone();
            }
        });

        candidates
    }

    /// Refresh candidates unless a newer selection superseded `generation`.
    fn refresh_if_current(&self, generation: u64) -> bool {
        let tasks = self.tasks.lock().unwrap();
        if tasks.generation != generation {
            return false;
        }
        self.refresh_candidates();
        true
    }

    fn finish_retrieval(
        &self,
        generation: u64,
        sensor: RecoverySensor,
        result: RecoveryResult,
        elapsed: Duration,
    ) {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.generation != generation {
            tracing::debug!("Discarding superseded retrieval from {}", sensor.id());
            return;
        }
        if let Some(task) = tasks.retrieval.take() {
            // The retrieval task is the caller; let it return on its own.
            let _ = task.disarm();
        }

        self.metrics.record_recovery(result.success(), elapsed);
        match &result {
            RecoveryResult::Recovered {
                distance_km,
                data_points,
                ..
            } => tracing::info!(
                "Recovered {} points ({:.3} km) from {}",
                data_points,
                distance_km,
                sensor.id()
            ),
            RecoveryResult::Failed { error } => {
                tracing::warn!("Recovery from {} failed: {}", sensor.id(), error)
            }
        }

        self.set_step(RecoveryStep::Result { sensor, result });
    }
}

/// Inputs of one retrieval, owned by the retrieval task.
struct RetrievalAttempt {
    link: SensorLink,
    retention_window: chrono::Duration,
    retrieval_timeout: Duration,
    crashed_started_at: DateTime<Utc>,
}

impl RetrievalAttempt {
    async fn run(&self, sensor: &RecoverySensor) -> RecoveryResult {
        let result = self.classify(sensor).await;
        self.link.disconnect();
        result
    }

    async fn classify(&self, sensor: &RecoverySensor) -> RecoveryResult {
        let id = sensor.id();

        if let Err(err) = self.link.connect(id).await {
            tracing::warn!("Recovery connect to {} failed: {}", id, err);
            return failed(RecoveryErrorKind::SensorUnreachable);
        }

        let reference = sensor.last_connected.unwrap_or(self.crashed_started_at);
        if Utc::now() - reference > self.retention_window {
            tracing::info!("Buffered data on {} is older than the retention window", id);
            return failed(RecoveryErrorKind::WindowExpired);
        }

        match self.link.refresh_battery().await {
            Ok(0) => return failed(RecoveryErrorKind::BatteryDied),
            Ok(_) => {}
            Err(err) => return failed(classify_link_error(&err)),
        }

        match tokio::time::timeout(self.retrieval_timeout, self.link.fetch_buffered()).await {
            Err(_elapsed) => {
                tracing::warn!(
                    "Retrieval from {} timed out after {:?}",
                    id,
                    self.retrieval_timeout
                );
                failed(RecoveryErrorKind::ConnectionInterrupted)
            }
            Ok(Err(err)) => failed(classify_link_error(&err)),
            Ok(Ok(session)) if session.points.is_empty() => failed(RecoveryErrorKind::DataCleared),
            Ok(Ok(session)) => RecoveryResult::Recovered {
                distance_km: session.distance_km(),
                duration: session.duration(),
                data_points: u32::try_from(session.points.len()).unwrap_or(u32::MAX),
            },
        }
    }
}

/// Union of two histories, keeping the later time for sensors in both.
fn merge_history(
    mut history: IndexMap<SensorId, DateTime<Utc>>,
    other: IndexMap<SensorId, DateTime<Utc>>,
) -> IndexMap<SensorId, DateTime<Utc>> {
    for (id, at) in other {
        history
            .entry(id)
            .and_modify(|known| *known = (*known).max(at))
            .or_insert(at);
    }
    history
}

fn failed(error: RecoveryErrorKind) -> RecoveryResult {
    RecoveryResult::Failed { error }
}

/// Map a link failure after connecting to a recovery error.
pub fn classify_link_error(err: &LinkError) -> RecoveryErrorKind {
    match err {
        LinkError::Transport(TransportError::PowerLost) => RecoveryErrorKind::BatteryDied,
        LinkError::Transport(TransportError::Unreachable(_)) | LinkError::UnknownSensor(_) => {
            RecoveryErrorKind::SensorUnreachable
        }
        _ => RecoveryErrorKind::ConnectionInterrupted,
    }
}

async fn retrieve(
    coordinator: Weak<RecoveryInner>,
    generation: u64,
    attempt: RetrievalAttempt,
    sensor: RecoverySensor,
) {
    let started = tokio::time::Instant::now();
    let result = attempt.run(&sensor).await;

    if let Some(inner) = coordinator.upgrade() {
        inner.finish_retrieval(generation, sensor, result, started.elapsed());
    }
}

async fn watch_candidates(
    coordinator: Weak<RecoveryInner>,
    generation: u64,
    mut changes: broadcast::Receiver<LinkChange>,
) {
    loop {
        let refresh = match changes.recv().await {
            Ok(
                LinkChange::SensorDiscovered { .. }
                | LinkChange::SensorUpdated { .. }
                | LinkChange::BatteryUpdated { .. }
                | LinkChange::SensorsCleared,
            ) => true,
            Ok(_) => false,
            Err(RecvError::Lagged(_)) => true,
            Err(RecvError::Closed) => return,
        };
        if !refresh {
            continue;
        }

        let Some(inner) = coordinator.upgrade() else {
            return;
        };
        if !inner.refresh_if_current(generation) {
            return;
        }
    }
}
