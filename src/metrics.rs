// Activity metrics module
//
// Provides lightweight counters for sensor link, recorder and recovery activity

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Activity counters shared by the core managers
///
/// Uses atomic operations for thread-safe metric tracking without locks.
/// A single `Arc<Metrics>` is usually handed to the link, recorder and
/// recovery coordinator so one summary covers a whole session.
#[derive(Debug)]
pub struct Metrics {
    /// Number of discovery scans started
    pub scans_started: AtomicU64,

    /// Advertisements accepted into the discovered list
    pub advertisements_seen: AtomicU64,

    /// Connection attempts issued
    pub connect_attempts: AtomicU64,

    /// Connection attempts that reached `connected`
    pub connect_successes: AtomicU64,

    /// Connection attempts that hit the connect ceiling
    pub connect_timeouts: AtomicU64,

    /// Established links that dropped
    pub links_lost: AtomicU64,

    /// Telemetry samples (real or simulated) applied to a run
    pub samples_ingested: AtomicU64,

    /// Runs finalized by the recorder
    pub runs_completed: AtomicU64,

    /// Recovery attempts that returned data
    pub recoveries_succeeded: AtomicU64,

    /// Recovery attempts that failed
    pub recoveries_failed: AtomicU64,

    /// Total time spent in buffered-data retrieval in milliseconds
    pub total_retrieval_time_ms: AtomicU64,

    /// Metrics start time
    start_time: Instant,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self {
            scans_started: AtomicU64::new(0),
            advertisements_seen: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            connect_successes: AtomicU64::new(0),
            connect_timeouts: AtomicU64::new(0),
            links_lost: AtomicU64::new(0),
            samples_ingested: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            recoveries_succeeded: AtomicU64::new(0),
            recoveries_failed: AtomicU64::new(0),
            total_retrieval_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_scan_started(&self) {
        self.scans_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_advertisement(&self) {
        self.advertisements_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_success(&self) {
        self.connect_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_timeout(&self) {
        self.connect_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_lost(&self) {
        self.links_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample(&self) {
        self.samples_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome and duration of a recovery attempt
    pub fn record_recovery(&self, success: bool, duration: Duration) {
        if success {
            self.recoveries_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.recoveries_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_retrieval_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Get total uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Share of connection attempts that succeeded, in `0.0..=1.0`
    pub fn connect_success_rate(&self) -> f64 {
        let attempts = self.connect_attempts.load(Ordering::Relaxed);
        if attempts > 0 {
            self.connect_successes.load(Ordering::Relaxed) as f64 / attempts as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Session Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Link: {} scans, {} advertisements, {} connects ({} ok, {} timed out), {} links lost",
            self.scans_started.load(Ordering::Relaxed),
            self.advertisements_seen.load(Ordering::Relaxed),
            self.connect_attempts.load(Ordering::Relaxed),
            self.connect_successes.load(Ordering::Relaxed),
            self.connect_timeouts.load(Ordering::Relaxed),
            self.links_lost.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Recorder: {} samples, {} runs completed",
            self.samples_ingested.load(Ordering::Relaxed),
            self.runs_completed.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Recovery: {} succeeded, {} failed, {:.2}s retrieving",
            self.recoveries_succeeded.load(Ordering::Relaxed),
            self.recoveries_failed.load(Ordering::Relaxed),
            self.total_retrieval_time_ms.load(Ordering::Relaxed) as f64 / 1000.0
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.connect_attempts.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.samples_ingested.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_connect_success_rate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.connect_success_rate(), 0.0);

        metrics.record_connect_attempt();
        metrics.record_connect_attempt();
        metrics.record_connect_success();
        metrics.record_connect_timeout();

        assert_eq!(metrics.connect_success_rate(), 0.5);
        assert_eq!(metrics.connect_timeouts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_record_recovery() {
        let metrics = Metrics::new();

        metrics.record_recovery(true, Duration::from_millis(100));
        metrics.record_recovery(false, Duration::from_millis(200));

        assert_eq!(metrics.recoveries_succeeded.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.recoveries_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_retrieval_time_ms.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_uptime() {
        let metrics = Metrics::new();
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.uptime().as_millis() >= 10);
    }
}
