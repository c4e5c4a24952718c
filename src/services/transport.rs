//! Sensor transport seam and a simulated implementation.
//!
//! [`SensorTransport`] is everything the core needs from the radio stack:
//! discovery, connect, battery reads and buffered-data retrieval. The real BLE
//! adapter lives outside this crate; [`SimulatedTransport`] stands in for it in
//! tests and in the headless demo, emitting a simulated cadence.

use crate::models::{
    Advertisement, BufferedSession, MotionProfile, RadioState, SensorId, TelemetryEvent,
    TelemetrySample,
};
use indexmap::IndexMap;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Boxed future returned by transport operations.
pub type TransportFuture<T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send>>;

/// Errors reported by a transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Radio unavailable: {0}")]
    RadioDisabled(RadioState),

    #[error("Sensor {0} is not reachable")]
    Unreachable(SensorId),

    #[error("Link dropped during transfer")]
    LinkDropped,

    #[error("Sensor lost power")]
    PowerLost,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Physical sensor transport.
///
/// Futures returned here own everything they need (`'static`), so callers can
/// race them against timeouts and cancellation freely. Dropping a returned
/// future abandons the operation.
pub trait SensorTransport: Send + Sync {
    /// Current platform radio and permission status.
    fn radio_state(&self) -> RadioState;

    /// Begin discovery. Advertisements arrive until the receiver is dropped or
    /// [`stop_discovery`](Self::stop_discovery) is called.
    fn start_discovery(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError>;

    fn stop_discovery(&self);

    /// Open a link. On success the receiver yields telemetry until the link
    /// ends; a dropped link sends [`TelemetryEvent::LinkLost`] before closing.
    fn connect(&self, id: SensorId) -> TransportFuture<mpsc::Receiver<TelemetryEvent>>;

    fn disconnect(&self, id: SensorId);

    fn read_battery(&self, id: SensorId) -> TransportFuture<u8>;

    /// Pull the data the sensor buffered for an interrupted session.
    fn fetch_buffered(&self, id: SensorId) -> TransportFuture<BufferedSession>;
}

/// Fault injected into a simulated buffered-data retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalFault {
    DropLink,
    PowerLoss,
    /// Never answers; the caller's timeout decides.
    Stall,
}

/// Behaviour of one simulated sensor.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    pub id: SensorId,
    pub name: String,
    pub rssi: i16,
    pub battery: u8,
    /// Unreachable sensors advertise but never answer a connect.
    pub reachable: bool,
    pub connect_latency: Duration,
    pub sample_interval: Duration,
    pub motion: MotionProfile,
    pub buffered: Vec<TelemetrySample>,
    pub retrieval_latency: Duration,
    pub retrieval_fault: Option<RetrievalFault>,
}

impl SimulatedSensor {
    pub fn new(id: &str, name: &str, rssi: i16) -> Self {
        Self {
            id: SensorId::new(id),
            name: name.to_string(),
            rssi,
            battery: 80,
            reachable: true,
            connect_latency: Duration::from_millis(200),
            sample_interval: Duration::from_secs(1),
            motion: MotionProfile {
                speed_mps: 2.8,
                cadence_spm: 172.0,
            },
            buffered: Vec::new(),
            retrieval_latency: Duration::from_millis(500),
            retrieval_fault: None,
        }
    }

    /// Fill the buffer with `seconds` one-second samples at the sensor's motion.
    pub fn with_buffered_seconds(mut self, seconds: u32) -> Self {
        self.buffered = (0..seconds)
            .map(|_| steady_sample(self.motion, Duration::from_secs(1)))
            .collect();
        self
    }
}

fn steady_sample(motion: MotionProfile, interval: Duration) -> TelemetrySample {
    TelemetrySample {
        interval,
        speed_mps: motion.speed_mps,
        cadence_spm: motion.cadence_spm,
        impact_g: 2.1,
        sway_cm: 4.5,
        braking_g: 0.18,
    }
}

fn jittered_sample(motion: MotionProfile, interval: Duration) -> TelemetrySample {
    let mut rng = rand::thread_rng();
    TelemetrySample {
        interval,
        speed_mps: (motion.speed_mps + rng.gen_range(-0.15..=0.15)).max(0.0),
        cadence_spm: motion.cadence_spm + rng.gen_range(-4.0..=4.0),
        impact_g: rng.gen_range(1.6..=2.6),
        sway_cm: rng.gen_range(3.0..=6.0),
        braking_g: rng.gen_range(0.1..=0.3),
    }
}

struct SimulatedLink {
    events: mpsc::Sender<TelemetryEvent>,
    generator: JoinHandle<()>,
}

struct SimulatedInner {
    radio: Mutex<RadioState>,
    sensors: Mutex<IndexMap<SensorId, SimulatedSensor>>,
    advertise_interval: Duration,
    discovery: Mutex<Option<JoinHandle<()>>>,
    links: Mutex<HashMap<SensorId, SimulatedLink>>,
}

impl Drop for SimulatedInner {
    fn drop(&mut self) {
        if let Ok(discovery) = self.discovery.get_mut() {
            if let Some(task) = discovery.take() {
                task.abort();
            }
        }
        if let Ok(links) = self.links.get_mut() {
            for (_, link) in links.drain() {
                link.generator.abort();
            }
        }
    }
}

/// In-process transport that simulates discovery, telemetry and retrieval.
///
/// Cloning shares the same simulated radio.
#[derive(Clone)]
pub struct SimulatedTransport {
    inner: Arc<SimulatedInner>,
}

impl SimulatedTransport {
    pub fn new(sensors: Vec<SimulatedSensor>) -> Self {
        Self::with_advertise_interval(sensors, Duration::from_millis(500))
    }

    pub fn with_advertise_interval(sensors: Vec<SimulatedSensor>, interval: Duration) -> Self {
        let sensors = sensors.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self {
            inner: Arc::new(SimulatedInner {
                radio: Mutex::new(RadioState::Enabled),
                sensors: Mutex::new(sensors),
                advertise_interval: interval,
                discovery: Mutex::new(None),
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Two nearby sensors with a few minutes of buffered data on the first.
    pub fn demo() -> Self {
        Self::new(vec![
            SimulatedSensor::new("SL-0001", "StrideSensor 0001", -48).with_buffered_seconds(420),
            SimulatedSensor::new("SL-0002", "StrideSensor 0002", -67),
        ])
    }

    pub fn set_radio_state(&self, state: RadioState) {
        *self.inner.radio.lock().unwrap() = state;
    }

    pub fn add_sensor(&self, sensor: SimulatedSensor) {
        self.inner
            .sensors
            .lock()
            .unwrap()
            .insert(sensor.id.clone(), sensor);
    }

    /// Mutate a simulated sensor in place. Returns false for unknown ids.
    pub fn update_sensor<F>(&self, id: &SensorId, f: F) -> bool
    where
        F: FnOnce(&mut SimulatedSensor),
    {
        match self.inner.sensors.lock().unwrap().get_mut(id) {
            Some(sensor) => {
                f(sensor);
                true
            }
            None => false,
        }
    }

    /// Simulate loss of signal on an open link.
    pub fn drop_link(&self, id: &SensorId) -> bool {
        let link = self.inner.links.lock().unwrap().remove(id);
        match link {
            Some(link) => {
                link.generator.abort();
                let _ = link.events.try_send(TelemetryEvent::LinkLost);
                tracing::debug!("Simulated link drop for {}", id);
                true
            }
            None => false,
        }
    }

    pub fn is_linked(&self, id: &SensorId) -> bool {
        self.inner.links.lock().unwrap().contains_key(id)
    }

    fn sensor(&self, id: &SensorId) -> Option<SimulatedSensor> {
        self.inner.sensors.lock().unwrap().get(id).cloned()
    }
}

impl SensorTransport for SimulatedTransport {
    fn radio_state(&self) -> RadioState {
        *self.inner.radio.lock().unwrap()
    }

    fn start_discovery(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        let radio = self.radio_state();
        if !radio.is_enabled() {
            return Err(TransportError::RadioDisabled(radio));
        }

        let (tx, rx) = mpsc::channel(64);
        let inner = Arc::downgrade(&self.inner);
        let interval = self.inner.advertise_interval;

        let task = tokio::spawn(async move {
            loop {
                let batch: Vec<Advertisement> = {
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    let sensors = inner.sensors.lock().unwrap();
                    let mut rng = rand::thread_rng();
                    sensors
                        .values()
                        .map(|s| Advertisement {
                            id: s.id.clone(),
                            name: s.name.clone(),
                            rssi: s.rssi + rng.gen_range(-2..=2),
                        })
                        .collect()
                };

                for advertisement in batch {
                    if tx.send(advertisement).await.is_err() {
                        return;
                    }
                }

                tokio::time::sleep(interval).await;
            }
        });

        if let Some(previous) = self.inner.discovery.lock().unwrap().replace(task) {
            previous.abort();
        }

        Ok(rx)
    }

    fn stop_discovery(&self) {
        if let Some(task) = self.inner.discovery.lock().unwrap().take() {
            task.abort();
        }
    }

    fn connect(&self, id: SensorId) -> TransportFuture<mpsc::Receiver<TelemetryEvent>> {
        let transport = self.clone();

        Box::pin(async move {
            let Some(sensor) = transport.sensor(&id) else {
                return Err(TransportError::Unreachable(id));
            };

            if !sensor.reachable {
                // Silent sensor: the caller's connect timeout decides.
                std::future::pending::<()>().await;
            }

            tokio::time::sleep(sensor.connect_latency).await;

            let (tx, rx) = mpsc::channel(64);
            let generator_tx = tx.clone();
            let generator = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(sensor.sample_interval).await;
                    let sample = jittered_sample(sensor.motion, sensor.sample_interval);
                    if generator_tx
                        .send(TelemetryEvent::Sample(sample))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });

            let previous = transport.inner.links.lock().unwrap().insert(
                id.clone(),
                SimulatedLink {
                    events: tx,
                    generator,
                },
            );
            if let Some(previous) = previous {
                previous.generator.abort();
            }

            tracing::debug!("Simulated link opened to {}", id);
            Ok(rx)
        })
    }

    fn disconnect(&self, id: SensorId) {
        if let Some(link) = self.inner.links.lock().unwrap().remove(&id) {
            link.generator.abort();
            tracing::debug!("Simulated link closed to {}", id);
        }
    }

    fn read_battery(&self, id: SensorId) -> TransportFuture<u8> {
        let transport = self.clone();

        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if !transport.is_linked(&id) {
                return Err(TransportError::Unreachable(id));
            }
            transport
                .sensor(&id)
                .map(|s| s.battery.min(100))
                .ok_or(TransportError::Unreachable(id))
        })
    }

    fn fetch_buffered(&self, id: SensorId) -> TransportFuture<BufferedSession> {
        let transport = self.clone();

        Box::pin(async move {
            let Some(sensor) = transport.sensor(&id) else {
                return Err(TransportError::Unreachable(id));
            };

            tokio::time::sleep(sensor.retrieval_latency).await;

            match sensor.retrieval_fault {
                Some(RetrievalFault::DropLink) => {
                    transport.drop_link(&id);
                    Err(TransportError::LinkDropped)
                }
                Some(RetrievalFault::PowerLoss) => {
                    transport.drop_link(&id);
                    Err(TransportError::PowerLost)
                }
                Some(RetrievalFault::Stall) => std::future::pending().await,
                None => Ok(BufferedSession {
                    points: sensor.buffered,
                }),
            }
        })
    }
}
