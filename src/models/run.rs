use crate::models::SensorId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Meters per reported distance unit (kilometers).
pub const METERS_PER_UNIT: f64 = 1000.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunMode {
    #[default]
    Run,
    Walk,
    Treadmill,
    Trail,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terrain {
    #[default]
    Road,
    Track,
    Trail,
    Treadmill,
    Mixed,
}

/// Immutable snapshot of the setup confirmed before a run starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub mode: RunMode,
    pub terrain: Terrain,
    pub sensor_connected: bool,
    pub sensor_id: Option<SensorId>,
    pub sensor_battery: Option<u8>,
}

impl RunConfiguration {
    /// Configuration for a run recorded without a sensor.
    pub fn without_sensor(mode: RunMode, terrain: Terrain) -> Self {
        Self {
            mode,
            terrain,
            sensor_connected: false,
            sensor_id: None,
            sensor_battery: None,
        }
    }

    pub fn with_sensor(
        mode: RunMode,
        terrain: Terrain,
        sensor_id: SensorId,
        sensor_battery: Option<u8>,
    ) -> Self {
        Self {
            mode,
            terrain,
            sensor_connected: true,
            sensor_id: Some(sensor_id),
            sensor_battery,
        }
    }
}

/// Lifecycle phase of a recorded run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Paused,
    Ended,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunPhase::Idle => "idle",
            RunPhase::Running => "running",
            RunPhase::Paused => "paused",
            RunPhase::Ended => "ended",
        };
        f.write_str(text)
    }
}

/// Instantaneous biomechanical scores, each in `0..=100`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricScores {
    pub efficiency: u8,
    pub impact: u8,
    pub sway: u8,
    pub braking: u8,
}

impl MetricScores {
    pub fn uniform(value: u8) -> Self {
        let value = value.min(100);
        Self {
            efficiency: value,
            impact: value,
            sway: value,
            braking: value,
        }
    }
}

/// Mutable counters of the run being recorded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSessionState {
    pub phase: RunPhase,
    pub configuration: Option<RunConfiguration>,
    pub started_at: Option<DateTime<Utc>>,
    /// Active time only; paused time is excluded.
    pub elapsed: Duration,
    pub distance_m: f64,
    pub scores: MetricScores,
    pub sample_count: u64,
    /// Set when the sensor link dropped; metrics hold their last values.
    pub link_frozen: bool,
}

impl RunSessionState {
    pub fn distance_km(&self) -> f64 {
        self.distance_m / METERS_PER_UNIT
    }

    /// Seconds per distance unit, `None` while no distance was covered.
    pub fn pace_secs_per_unit(&self) -> Option<f64> {
        pace_secs_per_unit(self.elapsed, self.distance_km())
    }
}

pub fn pace_secs_per_unit(elapsed: Duration, distance_km: f64) -> Option<f64> {
    if distance_km <= 0.0 {
        None
    } else {
        Some(elapsed.as_secs_f64() / distance_km)
    }
}

/// Render a pace as `m:ss`, or `--:--` when undefined.
pub fn format_pace(pace: Option<f64>) -> String {
    match pace {
        Some(secs) if secs.is_finite() => {
            let total = secs.round() as u64;
            format!("{}:{:02}", total / 60, total % 60)
        }
        _ => "--:--".to_string(),
    }
}

/// A finalized run handed to the survey and library collaborators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub configuration: RunConfiguration,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
    pub distance_km: f64,
    pub pace_secs_per_unit: Option<f64>,
    pub scores: MetricScores,
    pub sample_count: u64,
    pub link_lost: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pace_undefined_at_zero_distance() {
        assert_eq!(pace_secs_per_unit(Duration::from_secs(30), 0.0), None);
        assert_eq!(format_pace(None), "--:--");
    }

    #[test]
    fn test_pace_formatting() {
        let pace = pace_secs_per_unit(Duration::from_secs(600), 1.5);
        assert_eq!(pace, Some(400.0));
        assert_eq!(format_pace(pace), "6:40");
    }

    #[test]
    fn test_uniform_scores_clamped() {
        assert_eq!(MetricScores::uniform(150).efficiency, 100);
        assert_eq!(MetricScores::uniform(42).braking, 42);
    }
}
