// Stressforge - stress-testing engine core

// Re-export error types
pub mod error;
pub use error::{EngineError, Result};

// Module declarations
pub mod core;
pub mod probe;
pub mod workloads;

// Re-export commonly used types
pub use crate::core::config::EngineConfig;
pub use crate::core::engine::StressEngine;
pub use crate::core::events::{EngineEvent, EventBus};
pub use crate::core::models::{
    ExecutionRecord, ExecutionStatus, SafetyLimits, TestConfiguration, TestParams,
};

// Initialize logging
pub fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
}
