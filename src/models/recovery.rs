use crate::models::{SensorDescriptor, SensorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Best-effort description of a run that never finished cleanly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrashedRunInfo {
    pub started_at: DateTime<Utc>,
    pub estimated_distance_km: Option<f64>,
    pub estimated_duration: Option<Duration>,
    /// Sensor the interrupted run was recording from, if any.
    pub sensor_id: Option<SensorId>,
}

/// A recovery candidate.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoverySensor {
    pub descriptor: SensorDescriptor,
    /// The interrupted run was recorded from this sensor.
    pub previously_connected: bool,
    pub last_connected: Option<DateTime<Utc>>,
}

impl RecoverySensor {
    pub fn id(&self) -> &SensorId {
        &self.descriptor.id
    }
}

/// Sort candidates: previously connected first, then strongest signal, then name.
pub fn rank_candidates(candidates: &mut [RecoverySensor]) {
    candidates.sort_by(|a, b| {
        b.previously_connected
            .cmp(&a.previously_connected)
            .then_with(|| b.descriptor.rssi.cmp(&a.descriptor.rssi))
            .then_with(|| a.descriptor.name.cmp(&b.descriptor.name))
    });
}

/// Why a recovery attempt failed. Surfaced verbatim to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryErrorKind {
    DataCleared,
    WindowExpired,
    BatteryDied,
    ConnectionInterrupted,
    SensorUnreachable,
}

impl RecoveryErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryErrorKind::DataCleared => "data_cleared",
            RecoveryErrorKind::WindowExpired => "window_expired",
            RecoveryErrorKind::BatteryDied => "battery_died",
            RecoveryErrorKind::ConnectionInterrupted => "connection_interrupted",
            RecoveryErrorKind::SensorUnreachable => "sensor_unreachable",
        }
    }

    /// User-facing explanation of why this might happen.
    pub fn explanation(&self) -> &'static str {
        match self {
            RecoveryErrorKind::DataCleared => {
                "The sensor no longer holds data for this run. It may have been reset or started a new session."
            }
            RecoveryErrorKind::WindowExpired => {
                "Sensors only keep buffered data for a limited time, and this run is older than that window."
            }
            RecoveryErrorKind::BatteryDied => {
                "The sensor ran out of battery, which clears its buffered data."
            }
            RecoveryErrorKind::ConnectionInterrupted => {
                "The connection dropped while data was being transferred. Keep the sensor close and try again."
            }
            RecoveryErrorKind::SensorUnreachable => {
                "The sensor could not be reached. Make sure it is awake and nearby."
            }
        }
    }
}

impl fmt::Display for RecoveryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one recovery attempt.
///
/// The variants make it impossible to build a success without its metrics or a
/// failure without a classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RecoveryResult {
    Recovered {
        distance_km: f64,
        duration: Duration,
        data_points: u32,
    },
    Failed {
        error: RecoveryErrorKind,
    },
}

impl RecoveryResult {
    pub fn success(&self) -> bool {
        matches!(self, RecoveryResult::Recovered { .. })
    }

    pub fn distance_km(&self) -> Option<f64> {
        match self {
            RecoveryResult::Recovered { distance_km, .. } => Some(*distance_km),
            RecoveryResult::Failed { .. } => None,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            RecoveryResult::Recovered { duration, .. } => Some(*duration),
            RecoveryResult::Failed { .. } => None,
        }
    }

    pub fn data_points(&self) -> Option<u32> {
        match self {
            RecoveryResult::Recovered { data_points, .. } => Some(*data_points),
            RecoveryResult::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<RecoveryErrorKind> {
        match self {
            RecoveryResult::Recovered { .. } => None,
            RecoveryResult::Failed { error } => Some(*error),
        }
    }
}

/// Step of the recovery wizard. Each case holds only the data valid in it.
#[derive(Clone, Debug, PartialEq)]
pub enum RecoveryStep {
    CrashDetected,
    ResetNotice,
    SensorSelection {
        candidates: Vec<RecoverySensor>,
    },
    Recovering {
        sensor: RecoverySensor,
    },
    Result {
        sensor: RecoverySensor,
        result: RecoveryResult,
    },
    Dismissed,
}

impl RecoveryStep {
    pub fn kind(&self) -> RecoveryStepKind {
        match self {
            RecoveryStep::CrashDetected => RecoveryStepKind::CrashDetected,
            RecoveryStep::ResetNotice => RecoveryStepKind::ResetNotice,
            RecoveryStep::SensorSelection { .. } => RecoveryStepKind::SensorSelection,
            RecoveryStep::Recovering { .. } => RecoveryStepKind::Recovering,
            RecoveryStep::Result { .. } => RecoveryStepKind::Result,
            RecoveryStep::Dismissed => RecoveryStepKind::Dismissed,
        }
    }
}

/// Data-free discriminant of [`RecoveryStep`], used in change events and errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryStepKind {
    CrashDetected,
    ResetNotice,
    SensorSelection,
    Recovering,
    Result,
    Dismissed,
}

impl fmt::Display for RecoveryStepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RecoveryStepKind::CrashDetected => "crash_detected",
            RecoveryStepKind::ResetNotice => "reset_notice",
            RecoveryStepKind::SensorSelection => "sensor_selection",
            RecoveryStepKind::Recovering => "recovering",
            RecoveryStepKind::Result => "result",
            RecoveryStepKind::Dismissed => "dismissed",
        };
        f.write_str(text)
    }
}
