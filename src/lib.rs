// StrideLink - sensor link, run recorder and crash recovery for running sessions
//
// This is the library crate containing the core state machines and data structures.
// The binary crate (main.rs) provides a headless demo driver over a simulated sensor.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use metrics::Metrics;
pub use models::{CorePolicy, RecoveryResult, Run, RunConfiguration};
pub use services::{
    RecoveryCoordinator, RunRecorder, SensorLink, SensorTransport, SimulatedTransport,
};
pub use state::{Observable, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
