use crate::models::METERS_PER_UNIT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable identity of a physical sensor, as reported by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorId(pub String);

impl SensorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SensorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SensorId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Connection state of a single sensor or of a whole link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform radio status, combining power and permission state.
///
/// The core never assumes the radio is usable; the transport reports this on
/// every scan request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    #[default]
    Enabled,
    PoweredOff,
    Unauthorized,
}

impl RadioState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, RadioState::Enabled)
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RadioState::Enabled => "enabled",
            RadioState::PoweredOff => "powered off",
            RadioState::Unauthorized => "permission denied",
        };
        f.write_str(text)
    }
}

/// Last non-fatal condition reported by a sensor link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkCondition {
    /// Scan refused because the radio is off or not permitted.
    TransportDisabled(RadioState),
    /// A connection attempt hit the connect ceiling.
    ConnectionTimeout,
    /// An established connection dropped.
    LinkLost,
}

/// A sensor seen during discovery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub id: SensorId,
    pub name: String,
    /// Signal strength in dBm; higher is stronger.
    pub rssi: i16,
    /// Battery percentage, unknown until queried.
    pub battery: Option<u8>,
    pub state: ConnectionState,
}

impl SensorDescriptor {
    pub fn new(id: impl Into<SensorId>, name: impl Into<String>, rssi: i16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rssi,
            battery: None,
            state: ConnectionState::Disconnected,
        }
    }
}

/// One advertisement packet received during discovery.
#[derive(Clone, Debug, PartialEq)]
pub struct Advertisement {
    pub id: SensorId,
    pub name: String,
    pub rssi: i16,
}

/// One unit of raw motion data emitted by a connected sensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Time covered by this sample (since the previous one).
    pub interval: Duration,
    /// Ground speed in meters per second.
    pub speed_mps: f64,
    /// Steps per minute.
    pub cadence_spm: f64,
    /// Peak vertical impact in g.
    pub impact_g: f64,
    /// Lateral sway in centimeters.
    pub sway_cm: f64,
    /// Braking deceleration at foot strike in g.
    pub braking_g: f64,
}

impl TelemetrySample {
    /// Distance covered by this sample in meters.
    pub fn distance_m(&self) -> f64 {
        self.speed_mps.max(0.0) * self.interval.as_secs_f64()
    }
}

/// Events carried by a connected sensor's telemetry stream.
#[derive(Clone, Debug, PartialEq)]
pub enum TelemetryEvent {
    Sample(TelemetrySample),
    LinkLost,
}

/// Data a sensor kept in its buffer for an interrupted session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferedSession {
    pub points: Vec<TelemetrySample>,
}

impl BufferedSession {
    pub fn distance_km(&self) -> f64 {
        self.points.iter().map(TelemetrySample::distance_m).sum::<f64>() / METERS_PER_UNIT
    }

    pub fn duration(&self) -> Duration {
        self.points.iter().map(|p| p.interval).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(secs: u64, speed: f64) -> TelemetrySample {
        TelemetrySample {
            interval: Duration::from_secs(secs),
            speed_mps: speed,
            cadence_spm: 170.0,
            impact_g: 2.0,
            sway_cm: 4.0,
            braking_g: 0.2,
        }
    }

    #[test]
    fn test_sensor_id_conversions() {
        let from_str: SensorId = "SL-0001".into();
        let from_string: SensorId = String::from("SL-0001").into();
        assert_eq!(from_str, from_string);
        assert_eq!(from_string.as_str(), "SL-0001");
        assert_eq!(from_string.to_string(), "SL-0001");
    }

    #[test]
    fn test_sample_distance_ignores_negative_speed() {
        assert_eq!(sample(2, 3.0).distance_m(), 6.0);
        assert_eq!(sample(2, -1.0).distance_m(), 0.0);
    }

    #[test]
    fn test_buffered_session_totals() {
        let session = BufferedSession {
            points: vec![sample(1, 2.5), sample(1, 2.5), sample(2, 2.5)],
        };

        assert_eq!(session.duration(), Duration::from_secs(4));
        assert!((session.distance_km() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_radio_state_display() {
        assert!(RadioState::Enabled.is_enabled());
        assert!(!RadioState::PoweredOff.is_enabled());
        assert_eq!(RadioState::Unauthorized.to_string(), "permission denied");
    }
}
