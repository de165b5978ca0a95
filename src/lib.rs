// Bedside monitor core - Public API

// Re-export error types
pub mod error;
pub use error::{BedsideError, Result};

// Module declarations
pub mod commands;
pub mod core;
pub mod platform;
pub mod ui;

// Re-export commonly used types
pub use crate::core::config::MonitorConfig;
pub use crate::core::monitor::{MonitorEvent, MonitorRuntime, OperatorHandle};

// Initialize logging
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
