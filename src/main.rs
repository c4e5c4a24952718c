//! StrideLink - headless demo driver.
//!
//! # Overview
//!
//! Exercises the three core managers against the simulated transport:
//! - [`SensorLink`] scans, connects to the strongest sensor and reads its battery
//! - [`RunRecorder`] records a short run from live telemetry, with a pause
//! - [`RecoveryCoordinator`] recovers buffered data for the interrupted run
//!   found in the run journal (a synthetic one if the journal has none)
//!
//! # Execution Flow
//!
//! 1. Initialize logging → logs/stridelink.<date>
//! 2. Create tokio runtime with 2 worker threads
//! 3. Load `StrideLink Policy.yaml` (plus `STRIDELINK__*` overrides) from StrideLink Data/
//! 4. Record a demo run, then walk the recovery wizard
//! 5. Log the session metrics summary and shut down

use anyhow::{Context, Result};
use chrono::Utc;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use stridelink::models::{
    CrashedRunInfo, RecoveryStep, RunConfiguration, RunMode, SensorId, Terrain, format_pace,
};
use stridelink::services::detect_crashed_run;
use stridelink::{
    APP_NAME, ConfigManager, CorePolicy, Metrics, RecoveryCoordinator, RunRecorder, SensorLink,
    SimulatedTransport, VERSION,
};

fn main() -> Result<()> {
    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard =
        stridelink::logging::setup_logging_with_console("logs", "stridelink", false, true)?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("stridelink-worker")
        .build()
        .context("Failed to build tokio runtime")?;

    let config_manager = ConfigManager::new("StrideLink Data")?;
    let policy = config_manager.load_policy()?;
    tracing::info!(
        "Policy: connect timeout {:?}, retrieval timeout {:?}, retention {}h",
        policy.connect_timeout(),
        policy.retrieval_timeout(),
        policy.retention_window_hours
    );

    let metrics = Arc::new(Metrics::new());
    let result = runtime.block_on(run_demo(&config_manager, policy, Arc::clone(&metrics)));

    metrics.log_summary();
    runtime.shutdown_timeout(Duration::from_secs(5));
    tracing::info!("Demo complete");

    result
}

async fn run_demo(config: &ConfigManager, policy: CorePolicy, metrics: Arc<Metrics>) -> Result<()> {
    let transport = Arc::new(SimulatedTransport::demo());
    let link = SensorLink::new(transport, &policy, Arc::clone(&metrics))
        .context("Failed to create sensor link")?;

    record_demo_run(&link, &policy, &metrics).await?;
    recover_demo_run(config, &link, &policy, &metrics).await
}

async fn record_demo_run(
    link: &SensorLink,
    policy: &CorePolicy,
    metrics: &Arc<Metrics>,
) -> Result<()> {
    link.start_scanning().context("Failed to start scanning")?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    link.stop_scanning();

    let recorder = RunRecorder::new(policy.clone(), Arc::clone(metrics));

    let strongest = link.sensors().into_iter().max_by_key(|s| s.rssi);
    let _driver = match strongest {
        Some(sensor) => {
            link.connect(&sensor.id).await?;
            let battery = link.refresh_battery().await.ok();
            tracing::info!("Using {} ({} dBm, battery {:?}%)", sensor.name, sensor.rssi, battery);

            recorder.start_run(RunConfiguration::with_sensor(
                RunMode::Run,
                Terrain::Road,
                sensor.id.clone(),
                battery,
            ))?;
            recorder.attach_telemetry(link.subscribe_telemetry()?)
        }
        None => {
            tracing::warn!("No sensor found, recording with the simulated clock");
            recorder.start_run(RunConfiguration::without_sensor(RunMode::Run, Terrain::Road))?;
            recorder.start_clock()
        }
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    recorder.pause_run()?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    recorder.resume_run()?;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let run = recorder.end_run()?;
    link.disconnect();

    tracing::info!(
        "Run {}: {:.3} km in {}s, pace {} /km, scores {:?}",
        run.id,
        run.distance_km,
        run.duration.as_secs(),
        format_pace(run.pace_secs_per_unit),
        run.scores
    );
    Ok(())
}

async fn recover_demo_run(
    config: &ConfigManager,
    link: &SensorLink,
    policy: &CorePolicy,
    metrics: &Arc<Metrics>,
) -> Result<()> {
    let journal = config.load_run_journal()?;
    let crashed = detect_crashed_run(&journal.runs).unwrap_or_else(demo_crashed_run);

    let coordinator = RecoveryCoordinator::new(
        link.clone(),
        crashed,
        IndexMap::new(),
        policy,
        Arc::clone(metrics),
    );

    coordinator.request_recovery()?;
    coordinator.acknowledge_reset()?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let Some(candidate) = coordinator.candidates().into_iter().next() else {
        tracing::warn!("No recovery candidates in range");
        coordinator.abandon();
        return Ok(());
    };
    coordinator.select_sensor(candidate.id())?;

    match coordinator.settled().await {
        RecoveryStep::Result { sensor, result } => {
            match result.error() {
                None => tracing::info!(
                    "Recovered {:?} points from {}: {:.3} km over {:?}",
                    result.data_points(),
                    sensor.descriptor.name,
                    result.distance_km().unwrap_or_default(),
                    result.duration().unwrap_or_default()
                ),
                Some(error) => {
                    tracing::warn!("Recovery failed ({}): {}", error, error.explanation())
                }
            }
            coordinator.dismiss()?;
        }
        other => tracing::warn!("Recovery ended at {}", other.kind()),
    }

    Ok(())
}

/// An interrupted run twelve minutes ago on the demo's primary sensor.
fn demo_crashed_run() -> CrashedRunInfo {
    tracing::info!("Run journal has no interrupted run; using a synthetic one");
    CrashedRunInfo {
        started_at: Utc::now() - chrono::Duration::minutes(12),
        estimated_distance_km: Some(1.2),
        estimated_duration: Some(Duration::from_secs(7 * 60)),
        sensor_id: Some(SensorId::new("SL-0001")),
    }
}
