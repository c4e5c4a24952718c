//! Data models shared by the sensor link, run recorder and recovery coordinator.
//!
//! - [`sensor`]: sensor identity, connection state, telemetry samples
//! - [`run`]: run configuration, live session counters, finalized [`Run`]
//! - [`recovery`]: crashed-run info, recovery candidates, [`RecoveryResult`], [`RecoveryStep`]
//! - [`journal`]: persisted run records scanned by crash detection
//! - [`config`]: [`CorePolicy`], the policy constants loaded from YAML
//!
//! # Architecture Note
//!
//! Published state types derive `Clone` so the [`StateManager`](crate::state::StateManager)
//! can diff snapshots; handoff artifacts derive `Serialize` for the persistence collaborator.

pub mod config;
pub mod journal;
pub mod recovery;
pub mod run;
pub mod sensor;

pub use config::{CorePolicy, MotionProfile, SimulationProfiles};
pub use journal::{PersistedRunRecord, PersistedStatus, RunJournal};
pub use recovery::{
    CrashedRunInfo, RecoveryErrorKind, RecoveryResult, RecoverySensor, RecoveryStep,
    RecoveryStepKind, rank_candidates,
};
pub use run::{
    METERS_PER_UNIT, MetricScores, Run, RunConfiguration, RunMode, RunPhase, RunSessionState,
    Terrain, format_pace, pace_secs_per_unit,
};
pub use sensor::{
    Advertisement, BufferedSession, ConnectionState, LinkCondition, RadioState, SensorDescriptor,
    SensorId, TelemetryEvent, TelemetrySample,
};
