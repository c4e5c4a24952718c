//! Detection of runs that never finished cleanly.

use crate::models::{CrashedRunInfo, PersistedRunRecord, PersistedStatus};
use std::time::Duration;

/// Find the most recent run still marked in progress.
///
/// A run is only ever left `InProgress` when the app or sensor terminated
/// before the run reached `Completed` or `Discarded`. The estimates come from
/// the run's last checkpoint; duration falls back to the span between start
/// and checkpoint when no duration was recorded.
pub fn detect_crashed_run(records: &[PersistedRunRecord]) -> Option<CrashedRunInfo> {
    let record = records
        .iter()
        .filter(|r| r.status == PersistedStatus::InProgress)
        .max_by_key(|r| r.started_at)?;

    let estimated_duration = record.duration_secs.map(Duration::from_secs).or_else(|| {
        record
            .last_checkpoint_at
            .and_then(|checkpoint| (checkpoint - record.started_at).to_std().ok())
    });

    tracing::info!(
        "Found interrupted run {} started at {}",
        record.id,
        record.started_at
    );

    Some(CrashedRunInfo {
        started_at: record.started_at,
        estimated_distance_km: record.distance_km,
        estimated_duration,
        sensor_id: record.sensor_id.clone(),
    })
}
