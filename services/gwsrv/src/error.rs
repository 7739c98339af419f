//! Error handling for the gateway service

use thiserror::Error;

/// Gateway service error type
#[derive(Error, Debug, Clone)]
pub enum GwSrvError {
    /// Configuration-related errors (files, env, missing transport fields)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Protocol communication errors (Modbus exceptions, malformed replies)
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Connection establishment and maintenance errors (includes NotConnected)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Command execution failures (no transport accepted the command)
    #[error("Command error: {0}")]
    CommandError(String),

    /// Validation errors (bad parameters, unknown actions, invalid values)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Device lookup errors
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Message bus errors (publish, subscribe, payload encoding)
    #[error("Bus error: {0}")]
    BusError(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the gateway service
pub type Result<T> = std::result::Result<T, GwSrvError>;

impl GwSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        GwSrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        GwSrvError::IoError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        GwSrvError::ProtocolError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        GwSrvError::ConnectionError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        GwSrvError::TimeoutError(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        GwSrvError::CommandError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        GwSrvError::ValidationError(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        GwSrvError::BusError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        GwSrvError::InternalError(msg.into())
    }

    // Convenience constructors for specific cases
    pub fn device_not_found(serial: impl std::fmt::Display) -> Self {
        GwSrvError::DeviceError(format!("Device not found: {}", serial))
    }

    pub fn not_connected() -> Self {
        GwSrvError::ConnectionError("Not connected".to_string())
    }

    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GwSrvError::IoError(_)
                | GwSrvError::TimeoutError(_)
                | GwSrvError::ConnectionError(_)
                | GwSrvError::BusError(_)
        )
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for GwSrvError {
    fn from(err: std::io::Error) -> Self {
        GwSrvError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for GwSrvError {
    fn from(err: serde_json::Error) -> Self {
        GwSrvError::ValidationError(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for GwSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        GwSrvError::ConfigError(format!("YAML: {err}"))
    }
}

impl From<figment::Error> for GwSrvError {
    fn from(err: figment::Error) -> Self {
        GwSrvError::ConfigError(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GwSrvError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        GwSrvError::TimeoutError(err.to_string())
    }
}
