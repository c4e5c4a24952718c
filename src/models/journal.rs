use crate::models::SensorId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted status of a run as last written by the library collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedStatus {
    InProgress,
    Completed,
    Discarded,
}

/// The slice of persisted run state that crash detection looks at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRunRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub status: PersistedStatus,
    #[serde(default)]
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub sensor_id: Option<SensorId>,
}

/// Run journal file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunJournal {
    #[serde(default)]
    pub runs: Vec<PersistedRunRecord>,
}
