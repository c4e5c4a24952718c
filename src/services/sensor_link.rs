//! Sensor connectivity manager.
//!
//! [`SensorLink`] owns discovery, connection, battery and telemetry for one
//! physical transport. Its published state is a [`LinkState`] behind a
//! [`StateManager`]; observers subscribe to [`LinkChange`] events.
//!
//! # Supersession
//!
//! Only one scan and one connection attempt exist at a time. Each new scan or
//! connect bumps a generation counter under the slot's lock; work started under
//! an older generation is aborted and, if it still completes, discarded
//! without touching state.

use crate::metrics::Metrics;
use crate::models::{
    Advertisement, BufferedSession, ConnectionState, CorePolicy, LinkCondition, RadioState,
    SensorDescriptor, SensorId, TelemetryEvent,
};
use crate::services::task::TaskGuard;
use crate::services::transport::{SensorTransport, TransportError};
use crate::state::{Observable, StateManager};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use regex::Regex;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

const TELEMETRY_CHANNEL_CAPACITY: usize = 256;

/// Errors returned by [`SensorLink`] commands
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Transport disabled: radio {0}")]
    TransportDisabled(RadioState),

    #[error("Connection timed out after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Link lost")]
    LinkLost,

    #[error("Invalid state: no sensor is connected")]
    NotConnected,

    #[error("Sensor {0} has not been discovered")]
    UnknownSensor(SensorId),

    #[error("Connection attempt superseded")]
    Superseded,

    #[error("Invalid sensor name pattern: {0}")]
    NamePattern(#[from] regex::Error),

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for LinkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::RadioDisabled(radio) => LinkError::TransportDisabled(radio),
            other => LinkError::Transport(other),
        }
    }
}

/// Published state of a sensor link.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinkState {
    pub scanning: bool,
    /// Connection axis only: `Disconnected`, `Connecting` or `Connected`.
    pub connection: ConnectionState,
    /// Target of the pending or established connection.
    pub active: Option<SensorId>,
    /// Discovered sensors in discovery order.
    pub sensors: IndexMap<SensorId, SensorDescriptor>,
    pub condition: Option<LinkCondition>,
    /// Last successful connection time per sensor.
    pub history: IndexMap<SensorId, DateTime<Utc>>,
}

impl LinkState {
    /// Single state reported to observers; connection activity wins over scanning.
    pub fn published_state(&self) -> ConnectionState {
        match self.connection {
            ConnectionState::Disconnected if self.scanning => ConnectionState::Scanning,
            other => other,
        }
    }

    fn set_sensor_state(&mut self, id: &SensorId, state: ConnectionState) {
        if let Some(sensor) = self.sensors.get_mut(id) {
            sensor.state = state;
        }
    }

    fn release_active(&mut self) {
        if let Some(id) = self.active.take() {
            self.set_sensor_state(&id, ConnectionState::Disconnected);
        }
        self.connection = ConnectionState::Disconnected;
    }
}

/// Change events emitted by a [`SensorLink`]
#[derive(Clone, Debug, PartialEq)]
pub enum LinkChange {
    ConnectionChanged {
        state: ConnectionState,
        sensor: Option<SensorId>,
    },
    ScanningChanged {
        scanning: bool,
    },
    SensorDiscovered {
        id: SensorId,
    },
    SensorUpdated {
        id: SensorId,
    },
    BatteryUpdated {
        id: SensorId,
        percent: u8,
    },
    SensorsCleared,
    ConditionReported(LinkCondition),
}

impl Observable for LinkState {
    type Change = LinkChange;

    fn detect_changes(old: &Self, new: &Self) -> Vec<LinkChange> {
        let mut changes = Vec::new();

        if old.published_state() != new.published_state() || old.active != new.active {
            changes.push(LinkChange::ConnectionChanged {
                state: new.published_state(),
                sensor: new.active.clone(),
            });
        }

        if old.scanning != new.scanning {
            changes.push(LinkChange::ScanningChanged {
                scanning: new.scanning,
            });
        }

        if !old.sensors.is_empty() && new.sensors.is_empty() {
            changes.push(LinkChange::SensorsCleared);
        }

        for (id, sensor) in &new.sensors {
            match old.sensors.get(id) {
                None => changes.push(LinkChange::SensorDiscovered { id: id.clone() }),
                Some(previous) if previous.battery != sensor.battery => {
                    if let Some(percent) = sensor.battery {
                        changes.push(LinkChange::BatteryUpdated {
                            id: id.clone(),
                            percent,
                        });
                    }
                }
                Some(previous) if previous != sensor => {
                    changes.push(LinkChange::SensorUpdated { id: id.clone() });
                }
                Some(_) => {}
            }
        }

        if old.condition != new.condition {
            if let Some(condition) = new.condition {
                changes.push(LinkChange::ConditionReported(condition));
            }
        }

        changes
    }
}

#[derive(Default)]
struct ScanSlot {
    generation: u64,
    task: Option<TaskGuard>,
}

#[derive(Default)]
struct ConnectionSlot {
    generation: u64,
    /// Cancels the pending attempt when a newer command arrives.
    cancel: Option<watch::Sender<bool>>,
    pump: Option<TaskGuard>,
    telemetry: Option<broadcast::Sender<TelemetryEvent>>,
}

struct LinkInner {
    transport: Arc<dyn SensorTransport>,
    connect_timeout: Duration,
    name_filter: Option<Regex>,
    state: StateManager<LinkState>,
    metrics: Arc<Metrics>,
    // Lock order: slot before state.
    scan: Mutex<ScanSlot>,
    connection: Mutex<ConnectionSlot>,
}

impl Drop for LinkInner {
    fn drop(&mut self) {
        self.transport.stop_discovery();
        if let Some(id) = self.state.read(|s| s.active.clone()) {
            self.transport.disconnect(id);
        }
    }
}

/// Discovery, connection and telemetry for one sensor transport.
///
/// Cloning is cheap and shares the same link. All commands that spawn work
/// must be called from within a tokio runtime.
#[derive(Clone)]
pub struct SensorLink {
    inner: Arc<LinkInner>,
}

impl SensorLink {
    /// Create a link over `transport`.
    ///
    /// # Errors
    /// Returns [`LinkError::NamePattern`] if the policy's sensor name pattern
    /// is not a valid regex.
    pub fn new(
        transport: Arc<dyn SensorTransport>,
        policy: &CorePolicy,
        metrics: Arc<Metrics>,
    ) -> Result<Self, LinkError> {
        let name_filter = if policy.sensor_name_pattern.is_empty() {
            None
        } else {
            Some(Regex::new(&policy.sensor_name_pattern)?)
        };

        Ok(Self {
            inner: Arc::new(LinkInner {
                transport,
                connect_timeout: policy.connect_timeout(),
                name_filter,
                state: StateManager::with_capacity(
                    LinkState::default(),
                    policy.state_channel_capacity,
                ),
                metrics,
                scan: Mutex::new(ScanSlot::default()),
                connection: Mutex::new(ConnectionSlot::default()),
            }),
        })
    }

    /// Start discovery, superseding any scan already running.
    ///
    /// The discovered list is cleared (except for the sensor currently being
    /// connected or connected) and refilled as advertisements arrive.
    ///
    /// # Errors
    /// [`LinkError::TransportDisabled`] when the radio is off or not permitted.
    /// The list then stays empty and the link does not report `Scanning`.
    pub fn start_scanning(&self) -> Result<(), LinkError> {
        let inner = &self.inner;
        let radio = inner.transport.radio_state();

        let mut slot = inner.scan.lock().unwrap();
        slot.generation += 1;
        slot.task = None;

        if !radio.is_enabled() {
            tracing::warn!("Scan refused: radio {}", radio);
            inner.state.update(|s| {
                let active = s.active.clone();
                s.sensors.retain(|id, _| Some(id) == active.as_ref());
                s.scanning = false;
                s.condition = Some(LinkCondition::TransportDisabled(radio));
            });
            return Err(LinkError::TransportDisabled(radio));
        }

        let advertisements = match inner.transport.start_discovery() {
            Ok(rx) => rx,
            Err(err) => {
                let err = LinkError::from(err);
                if let LinkError::TransportDisabled(radio) = err {
                    inner.state.update(|s| {
                        s.scanning = false;
                        s.condition = Some(LinkCondition::TransportDisabled(radio));
                    });
                }
                tracing::warn!("Failed to start discovery: {}", err);
                return Err(err);
            }
        };

        inner.state.update(|s| {
            let active = s.active.clone();
            s.sensors.retain(|id, _| Some(id) == active.as_ref());
            s.scanning = true;
            s.condition = None;
        });
        inner.metrics.record_scan_started();

        let generation = slot.generation;
        let weak = Arc::downgrade(&self.inner);
        slot.task = Some(TaskGuard::spawn(discovery_loop(
            weak,
            generation,
            advertisements,
        )));

        tracing::info!("Scanning started (generation {})", generation);
        Ok(())
    }

    /// Stop discovery. Any connection is left untouched.
    pub fn stop_scanning(&self) {
        let inner = &self.inner;
        let mut slot = inner.scan.lock().unwrap();
        slot.generation += 1;
        let was_running = slot.task.take().is_some();
        inner.transport.stop_discovery();
        inner.state.update(|s| s.scanning = false);

        if was_running {
            tracing::info!("Scanning stopped");
        }
    }

    /// Connect to a discovered sensor.
    ///
    /// The target moves to `Connecting`, then to `Connected` on success or back
    /// to `Disconnected` on failure. A newer `connect` or a `disconnect`
    /// preempts this attempt, which then returns [`LinkError::Superseded`]
    /// without touching state.
    ///
    /// # Errors
    /// - [`LinkError::UnknownSensor`] if `id` was never discovered
    /// - [`LinkError::ConnectionTimeout`] after the policy connect timeout
    /// - [`LinkError::Superseded`] if preempted
    /// - [`LinkError::Transport`] for transport failures
    pub async fn connect(&self, id: &SensorId) -> Result<(), LinkError> {
        let inner = &self.inner;

        let (generation, mut cancel_rx, replaced) = {
            let mut slot = inner.connection.lock().unwrap();

            if !inner.state.read(|s| s.sensors.contains_key(id)) {
                return Err(LinkError::UnknownSensor(id.clone()));
            }

            if let Some(cancel) = slot.cancel.take() {
                let _ = cancel.send(true);
            }
            slot.generation += 1;
            slot.pump = None;
            slot.telemetry = None;

            let (cancel_tx, cancel_rx) = watch::channel(false);
            slot.cancel = Some(cancel_tx);

            let mut replaced = None;
            inner.state.update(|s| {
                if s.connection == ConnectionState::Connected {
                    replaced = s.active.clone();
                }
                s.release_active();
                s.active = Some(id.clone());
                s.connection = ConnectionState::Connecting;
                s.set_sensor_state(id, ConnectionState::Connecting);
                s.condition = None;
            });

            (slot.generation, cancel_rx, replaced)
        };

        if let Some(previous) = replaced {
            tracing::info!("Dropping connection to {} for {}", previous, id);
            inner.transport.disconnect(previous);
        }

        inner.metrics.record_connect_attempt();
        tracing::info!("Connecting to {} (generation {})", id, generation);

        // Reverts `Connecting` if this future is dropped before it resolves.
        let pending = PendingConnect {
            link: inner,
            generation,
            id: id.clone(),
            armed: true,
        };

        let attempt =
            tokio::time::timeout(inner.connect_timeout, inner.transport.connect(id.clone()));
        let outcome = tokio::select! {
            result = attempt => Some(result),
            _ = cancel_rx.changed() => None,
        };
        pending.disarm();

        let mut slot = inner.connection.lock().unwrap();
        if slot.generation != generation {
            tracing::debug!("Discarding superseded connect to {}", id);
            return Err(LinkError::Superseded);
        }
        slot.cancel = None;

        let Some(outcome) = outcome else {
            return Err(LinkError::Superseded);
        };

        match outcome {
            Err(_elapsed) => {
                inner.metrics.record_connect_timeout();
                tracing::warn!(
                    "Connection to {} timed out after {:?}",
                    id,
                    inner.connect_timeout
                );
                inner.transport.disconnect(id.clone());
                inner.state.update(|s| {
                    s.release_active();
                    s.condition = Some(LinkCondition::ConnectionTimeout);
                });
                Err(LinkError::ConnectionTimeout(inner.connect_timeout))
            }
            Ok(Err(err)) => {
                tracing::warn!("Connection to {} failed: {}", id, err);
                inner.state.update(|s| s.release_active());
                Err(LinkError::from(err))
            }
            Ok(Ok(events)) => {
                let (telemetry_tx, _) = broadcast::channel(TELEMETRY_CHANNEL_CAPACITY);
                slot.telemetry = Some(telemetry_tx.clone());
                slot.pump = Some(TaskGuard::spawn(telemetry_pump(
                    Arc::downgrade(&self.inner),
                    generation,
                    events,
                    telemetry_tx,
                )));

                inner.state.update(|s| {
                    s.connection = ConnectionState::Connected;
                    s.set_sensor_state(id, ConnectionState::Connected);
                    s.history.insert(id.clone(), Utc::now());
                });
                inner.metrics.record_connect_success();
                tracing::info!("Connected to {}", id);
                Ok(())
            }
        }
    }

    /// Drop the current connection and cancel any pending attempt.
    ///
    /// Idempotent; always ends disconnected. The telemetry stream closes.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let mut slot = inner.connection.lock().unwrap();
        slot.generation += 1;
        if let Some(cancel) = slot.cancel.take() {
            let _ = cancel.send(true);
        }
        slot.pump = None;
        slot.telemetry = None;

        let mut released = None;
        inner.state.update(|s| {
            released = s.active.clone();
            s.release_active();
        });

        if let Some(id) = released {
            inner.transport.disconnect(id.clone());
            tracing::info!("Disconnected from {}", id);
        }
    }

    /// Read the connected sensor's battery and publish it.
    ///
    /// # Errors
    /// [`LinkError::NotConnected`] when no sensor is connected; the request is
    /// reported, not queued.
    pub async fn refresh_battery(&self) -> Result<u8, LinkError> {
        let inner = &self.inner;
        let id = self.require_connected("refresh_battery")?;

        let percent = tokio::time::timeout(
            inner.connect_timeout,
            inner.transport.read_battery(id.clone()),
        )
        .await
        .map_err(|_| LinkError::ConnectionTimeout(inner.connect_timeout))??
        .min(100);

        inner.state.update(|s| {
            if let Some(sensor) = s.sensors.get_mut(&id) {
                sensor.battery = Some(percent);
            }
        });
        tracing::debug!("Battery for {}: {}%", id, percent);

        Ok(percent)
    }

    /// Pull buffered session data from the connected sensor.
    ///
    /// No ceiling is applied here; the caller races it against its own timeout.
    pub async fn fetch_buffered(&self) -> Result<BufferedSession, LinkError> {
        let id = self.require_connected("fetch_buffered")?;
        let session = self.inner.transport.fetch_buffered(id.clone()).await?;
        tracing::info!("Fetched {} buffered points from {}", session.points.len(), id);
        Ok(session)
    }

    /// Subscribe to the connected sensor's telemetry.
    ///
    /// The receiver reports `Closed` once the link is disconnected or lost.
    pub fn subscribe_telemetry(&self) -> Result<broadcast::Receiver<TelemetryEvent>, LinkError> {
        self.inner
            .connection
            .lock()
            .unwrap()
            .telemetry
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(LinkError::NotConnected)
    }

    /// Subscribe to link state changes
    pub fn subscribe(&self) -> broadcast::Receiver<LinkChange> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> LinkState {
        self.inner.state.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.read(LinkState::published_state)
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.state.read(|s| s.scanning)
    }

    pub fn sensors(&self) -> Vec<SensorDescriptor> {
        self.inner.state.read(|s| s.sensors.values().cloned().collect())
    }

    pub fn sensor(&self, id: &SensorId) -> Option<SensorDescriptor> {
        self.inner.state.read(|s| s.sensors.get(id).cloned())
    }

    pub fn connected_sensor(&self) -> Option<SensorDescriptor> {
        self.inner.state.read(|s| {
            if s.connection != ConnectionState::Connected {
                return None;
            }
            s.active.as_ref().and_then(|id| s.sensors.get(id)).cloned()
        })
    }

    pub fn condition(&self) -> Option<LinkCondition> {
        self.inner.state.read(|s| s.condition)
    }

    pub fn connection_history(&self) -> IndexMap<SensorId, DateTime<Utc>> {
        self.inner.state.read(|s| s.history.clone())
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    fn require_connected(&self, command: &str) -> Result<SensorId, LinkError> {
        let active = self.inner.state.read(|s| {
            if s.connection == ConnectionState::Connected {
                s.active.clone()
            } else {
                None
            }
        });

        active.ok_or_else(|| {
            tracing::warn!("{} rejected: no sensor connected", command);
            LinkError::NotConnected
        })
    }
}

impl LinkInner {
    fn accepts(&self, advertisement: &Advertisement) -> bool {
        self.name_filter
            .as_ref()
            .is_none_or(|filter| filter.is_match(&advertisement.name))
    }

    /// Apply one advertisement if it belongs to the current scan.
    fn apply_advertisement(&self, generation: u64, advertisement: Advertisement) -> bool {
        let slot = self.scan.lock().unwrap();
        if slot.generation != generation {
            return false;
        }

        if !self.accepts(&advertisement) {
            tracing::debug!(
                "Ignoring {} ({}): name filtered",
                advertisement.id,
                advertisement.name
            );
            return true;
        }

        self.state.update(|s| {
            let sensor = s
                .sensors
                .entry(advertisement.id.clone())
                .or_insert_with(|| {
                    SensorDescriptor::new(
                        advertisement.id.clone(),
                        advertisement.name.clone(),
                        advertisement.rssi,
                    )
                });
            sensor.rssi = advertisement.rssi;
            sensor.name = advertisement.name.clone();
        });
        self.metrics.record_advertisement();
        drop(slot);

        true
    }

    /// Tear down the link after the transport reported loss of signal.
    fn handle_link_lost(&self, generation: u64, telemetry: &broadcast::Sender<TelemetryEvent>) {
        let mut slot = self.connection.lock().unwrap();
        if slot.generation != generation {
            return;
        }

        slot.telemetry = None;
        if let Some(pump) = slot.pump.take() {
            // The pump is the caller; let it return on its own.
            let _ = pump.disarm();
        }

        let _ = telemetry.send(TelemetryEvent::LinkLost);

        let mut lost = None;
        self.state.update(|s| {
            lost = s.active.clone();
            s.release_active();
            s.condition = Some(LinkCondition::LinkLost);
        });
        self.metrics.record_link_lost();

        if let Some(id) = lost {
            tracing::warn!("Link to {} lost", id);
        }
    }
}

/// Outstanding connect attempt owned by a `connect` future.
struct PendingConnect<'a> {
    link: &'a LinkInner,
    generation: u64,
    id: SensorId,
    armed: bool,
}

impl PendingConnect<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut slot = self.link.connection.lock().unwrap();
        if slot.generation != self.generation {
            return;
        }
        slot.generation += 1;
        slot.cancel = None;

        tracing::info!("Connect to {} abandoned by caller", self.id);
        self.link.transport.disconnect(self.id.clone());
        self.link.state.update(|s| s.release_active());
    }
}

async fn discovery_loop(
    link: Weak<LinkInner>,
    generation: u64,
    mut advertisements: mpsc::Receiver<Advertisement>,
) {
    while let Some(advertisement) = advertisements.recv().await {
        let Some(inner) = link.upgrade() else {
            return;
        };
        tracing::debug!(
            "Advertisement from {} ({} dBm)",
            advertisement.id,
            advertisement.rssi
        );
        if !inner.apply_advertisement(generation, advertisement) {
            return;
        }
    }
}

async fn telemetry_pump(
    link: Weak<LinkInner>,
    generation: u64,
    mut events: mpsc::Receiver<TelemetryEvent>,
    telemetry: broadcast::Sender<TelemetryEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TelemetryEvent::Sample(sample) => {
                // No subscribers is fine; the recorder may not be attached yet.
                let _ = telemetry.send(TelemetryEvent::Sample(sample));
            }
            TelemetryEvent::LinkLost => break,
        }
    }

    // Either an explicit loss or the transport closed the stream under us.
    if let Some(inner) = link.upgrade() {
        inner.handle_link_lost(generation, &telemetry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, rssi: i16) -> SensorDescriptor {
        SensorDescriptor::new(id, format!("Sensor {}", id), rssi)
    }

    #[test]
    fn test_published_state_prefers_connection() {
        let mut state = LinkState {
            scanning: true,
            ..LinkState::default()
        };
        assert_eq!(state.published_state(), ConnectionState::Scanning);

        state.connection = ConnectionState::Connecting;
        assert_eq!(state.published_state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_detect_discovery_and_battery_changes() {
        let old = LinkState::default();
        let mut new = old.clone();
        new.sensors.insert(SensorId::new("a"), descriptor("a", -50));

        let changes = LinkState::detect_changes(&old, &new);
        assert_eq!(
            changes,
            vec![LinkChange::SensorDiscovered {
                id: SensorId::new("a")
            }]
        );

        let mut battery = new.clone();
        battery
            .sensors
            .get_mut(&SensorId::new("a"))
            .unwrap()
            .battery = Some(77);
        let changes = LinkState::detect_changes(&new, &battery);
        assert_eq!(
            changes,
            vec![LinkChange::BatteryUpdated {
                id: SensorId::new("a"),
                percent: 77
            }]
        );
    }

    #[test]
    fn test_detect_cleared_and_condition() {
        let mut old = LinkState::default();
        old.sensors.insert(SensorId::new("a"), descriptor("a", -50));
        let new = LinkState {
            condition: Some(LinkCondition::LinkLost),
            ..LinkState::default()
        };

        let changes = LinkState::detect_changes(&old, &new);
        assert!(changes.contains(&LinkChange::SensorsCleared));
        assert!(changes.contains(&LinkChange::ConditionReported(LinkCondition::LinkLost)));
    }

    #[test]
    fn test_transport_radio_error_maps_to_disabled() {
        let err = LinkError::from(TransportError::RadioDisabled(RadioState::Unauthorized));
        assert_eq!(err, LinkError::TransportDisabled(RadioState::Unauthorized));
    }
}
