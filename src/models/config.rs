use crate::models::RunMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Policy constants for the link, recorder and recovery managers.
///
/// Loaded from `StrideLink Policy.yaml` by [`crate::config::ConfigManager`].
/// Every field has a default, so a partial file (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorePolicy {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_retrieval_timeout_secs")]
    pub retrieval_timeout_secs: u64,

    /// How long a sensor keeps buffered data after a session.
    #[serde(default = "default_retention_window_hours")]
    pub retention_window_hours: u64,

    /// Largest change a single sample may apply to any score.
    #[serde(default = "default_max_score_step")]
    pub max_score_step: u8,

    /// Score every metric starts from when a run begins.
    #[serde(default = "default_score_baseline")]
    pub score_baseline: u8,

    /// Period of the internal clock used when no sensor drives the run.
    #[serde(default = "default_clock_tick_ms")]
    pub clock_tick_ms: u64,

    /// Regex an advertised name must match to be listed. Empty accepts all.
    #[serde(default)]
    pub sensor_name_pattern: String,

    #[serde(default = "default_state_channel_capacity")]
    pub state_channel_capacity: usize,

    #[serde(default)]
    pub simulation: SimulationProfiles,
}

/// Simulated motion used when a run has no sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionProfile {
    pub speed_mps: f64,
    pub cadence_spm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationProfiles {
    #[serde(default = "default_run_profile")]
    pub run: MotionProfile,

    #[serde(default = "default_walk_profile")]
    pub walk: MotionProfile,

    #[serde(default = "default_run_profile")]
    pub treadmill: MotionProfile,

    #[serde(default = "default_trail_profile")]
    pub trail: MotionProfile,
}

impl SimulationProfiles {
    pub fn for_mode(&self, mode: RunMode) -> MotionProfile {
        match mode {
            RunMode::Run => self.run,
            RunMode::Walk => self.walk,
            RunMode::Treadmill => self.treadmill,
            RunMode::Trail => self.trail,
        }
    }
}

impl Default for SimulationProfiles {
    fn default() -> Self {
        Self {
            run: default_run_profile(),
            walk: default_walk_profile(),
            treadmill: default_run_profile(),
            trail: default_trail_profile(),
        }
    }
}

impl Default for CorePolicy {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            retrieval_timeout_secs: default_retrieval_timeout_secs(),
            retention_window_hours: default_retention_window_hours(),
            max_score_step: default_max_score_step(),
            score_baseline: default_score_baseline(),
            clock_tick_ms: default_clock_tick_ms(),
            sensor_name_pattern: String::new(),
            state_channel_capacity: default_state_channel_capacity(),
            simulation: SimulationProfiles::default(),
        }
    }
}

impl CorePolicy {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieval_timeout_secs)
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_window_hours as i64)
    }

    pub fn clock_tick(&self) -> Duration {
        Duration::from_millis(self.clock_tick_ms.max(1))
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_retrieval_timeout_secs() -> u64 {
    30
}

fn default_retention_window_hours() -> u64 {
    24
}

fn default_max_score_step() -> u8 {
    5
}

fn default_score_baseline() -> u8 {
    50
}

fn default_clock_tick_ms() -> u64 {
    1000
}

fn default_state_channel_capacity() -> usize {
    100
}

// 2.5 m/s covers 1.5 km in 600 s.
fn default_run_profile() -> MotionProfile {
    MotionProfile {
        speed_mps: 2.5,
        cadence_spm: 170.0,
    }
}

fn default_walk_profile() -> MotionProfile {
    MotionProfile {
        speed_mps: 1.25,
        cadence_spm: 110.0,
    }
}

fn default_trail_profile() -> MotionProfile {
    MotionProfile {
        speed_mps: 2.0,
        cadence_spm: 165.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = CorePolicy::default();
        assert_eq!(policy.connect_timeout(), Duration::from_secs(10));
        assert_eq!(policy.retrieval_timeout(), Duration::from_secs(30));
        assert_eq!(policy.retention_window(), chrono::Duration::hours(24));
        assert_eq!(policy.max_score_step, 5);
        assert_eq!(policy.clock_tick(), Duration::from_secs(1));
        assert!(policy.sensor_name_pattern.is_empty());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let policy: CorePolicy = serde_yaml_ng::from_str("connect_timeout_secs: 4\n").unwrap();
        assert_eq!(policy.connect_timeout_secs, 4);
        assert_eq!(policy.retrieval_timeout_secs, 30);
        assert_eq!(policy.simulation.for_mode(RunMode::Walk).speed_mps, 1.25);
    }

    #[test]
    fn test_zero_clock_tick_is_clamped() {
        let policy = CorePolicy {
            clock_tick_ms: 0,
            ..CorePolicy::default()
        };
        assert_eq!(policy.clock_tick(), Duration::from_millis(1));
    }
}
