use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Options for [`setup_logging_with_settings`].
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Directory for log files (e.g., "logs")
    pub log_dir: Utf8PathBuf,
    /// Prefix for log files (e.g., "stridelink")
    pub log_prefix: String,
    /// Use debug level instead of info when `RUST_LOG` is not set
    pub debug_mode: bool,
    /// Also log to the console
    pub console_output: bool,
    /// Write the file log as JSON lines
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            log_dir: Utf8PathBuf::from("logs"),
            log_prefix: "stridelink".to_string(),
            debug_mode: false,
            console_output: true,
            json: false,
        }
    }
}

/// Setup logging with rotating file appender.
///
/// Logs are written to the specified directory with daily rotation.
///
/// # Returns
/// A guard that must be held for the duration of the program to keep logging active
pub fn setup_logging(log_dir: &str, log_prefix: &str, debug_mode: bool) -> Result<WorkerGuard> {
    setup_logging_with_settings(&LogSettings {
        log_dir: Utf8PathBuf::from(log_dir),
        log_prefix: log_prefix.to_string(),
        debug_mode,
        console_output: false,
        json: false,
    })
}

/// Setup logging with optional console output for debugging.
///
/// This is useful for development and the headless demo.
pub fn setup_logging_with_console(
    log_dir: &str,
    log_prefix: &str,
    debug_mode: bool,
    console_output: bool,
) -> Result<WorkerGuard> {
    setup_logging_with_settings(&LogSettings {
        log_dir: Utf8PathBuf::from(log_dir),
        log_prefix: log_prefix.to_string(),
        debug_mode,
        console_output,
        json: false,
    })
}

/// Install the global subscriber described by `settings`.
///
/// `RUST_LOG` takes precedence over `debug_mode` when set.
///
/// # Errors
/// Fails if the log directory cannot be created or a global subscriber is
/// already installed.
pub fn setup_logging_with_settings(settings: &LogSettings) -> Result<WorkerGuard> {
    ensure_log_dir(&settings.log_dir)?;

    // Create daily rotating file appender
    let file_appender = rolling::daily(&settings.log_dir, &settings.log_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if settings.debug_mode { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_current_span(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false) // No ANSI codes in log files
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    // Also log to console with ANSI colors for better readability
    let console_layer = settings.console_output.then(|| {
        tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!(
        "Logging initialized: dir={}, prefix={}, debug={}, console={}, json={}",
        settings.log_dir,
        settings.log_prefix,
        settings.debug_mode,
        settings.console_output,
        settings.json
    );

    Ok(guard)
}

fn ensure_log_dir(log_dir: &Utf8PathBuf) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir))?;
    }
    Ok(())
}
