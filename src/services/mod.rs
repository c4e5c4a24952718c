//! Services module - the three cooperating state machines of the core.
//!
//! Nothing here knows about screens. Collaborators issue intents through the
//! managers' commands and observe published state through
//! [`StateManager`](crate::state::StateManager) subscriptions.
//!
//! # Components
//!
//! - [`SensorLink`]: discovery, connection, battery and telemetry over a
//!   [`SensorTransport`]. One scan and one connection attempt at a time; newer
//!   requests supersede older ones.
//!
//! - [`RunRecorder`]: the `Idle → Running ⇄ Paused → Ended` run lifecycle.
//!   Derives distance, pace and the four biomechanical scores from telemetry,
//!   or from an internal clock when no sensor is connected.
//!
//! - [`RecoveryCoordinator`]: the recovery wizard for a crashed run. Re-acquires
//!   a sensor through the link and classifies the retrieval outcome into a
//!   [`RecoveryResult`](crate::models::RecoveryResult).
//!
//! - [`detect_crashed_run`]: finds the run left in progress by an unexpected
//!   termination.
//!
//! # Data flow
//!
//! ```text
//! SensorTransport ──▶ SensorLink ──telemetry──▶ RunRecorder ──▶ Run
//!                          │
//!                          └──connect/fetch──▶ RecoveryCoordinator ──▶ RecoveryResult
//! ```
//!
//! Only one consumer drives a sensor at a time: the recorder during a run, or
//! the coordinator during recovery.
//!
//! # Task ownership
//!
//! Every spawned task (discovery, telemetry pump, clock, candidate watcher,
//! retrieval) is held by a [`TaskGuard`]. Dropping the owning manager or
//! replacing the guard aborts the task.

pub mod crash_detection;
pub mod recorder;
pub mod recovery;
pub mod sensor_link;
pub mod task;
pub mod transport;

pub use crash_detection::detect_crashed_run;
pub use recorder::{RecorderError, RunChange, RunCommand, RunRecorder};
pub use recovery::{RecoveryChange, RecoveryCoordinator, RecoveryError, RecoveryState};
pub use sensor_link::{LinkChange, LinkError, LinkState, SensorLink};
pub use task::TaskGuard;
pub use transport::{
    RetrievalFault, SensorTransport, SimulatedSensor, SimulatedTransport, TransportError,
    TransportFuture,
};
