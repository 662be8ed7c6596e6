use std::io;
use thiserror::Error;

use crate::core::safety::Violation;

/// Error type shared by every engine subsystem.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("execution not found: {0}")]
    NotFound(String),

    #[error("plugin not found: {0}")]
    UnknownPlugin(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("execution is not running: {0}")]
    NotRunning(String),

    #[error("execution already finished: {0}")]
    AlreadyFinished(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("safety violation: {}", .0.message)]
    SafetyViolation(Box<Violation>),

    #[error("cancelled")]
    Cancelled,

    #[error("plugin fault: {0}")]
    PluginFault(String),

    #[error("probe failure: {0}")]
    ProbeFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create a not-found error for an execution id
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        EngineError::NotFound(id.into())
    }

    /// Create an unknown-plugin error
    pub fn unknown_plugin<S: Into<String>>(name: S) -> Self {
        EngineError::UnknownPlugin(name.into())
    }

    /// Create an invalid-config error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        EngineError::InvalidConfig(msg.into())
    }

    /// Create a resource-unavailable error
    pub fn resource_unavailable<S: Into<String>>(msg: S) -> Self {
        EngineError::ResourceUnavailable(msg.into())
    }

    /// Create a plugin-fault error
    pub fn plugin_fault<S: Into<String>>(msg: S) -> Self {
        EngineError::PluginFault(msg.into())
    }

    /// Create a probe-failure error
    pub fn probe_failure<S: Into<String>>(msg: S) -> Self {
        EngineError::ProbeFailure(msg.into())
    }

    /// True when the error is a cooperative cancellation rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
