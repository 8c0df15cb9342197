//! Error handling for the line orchestration service
//!
//! Variants follow the failure taxonomy the workflow distinguishes: transport
//! failures are recovered by reconnecting, protocol failures drop the
//! offending message, persistence and reporting failures are logged and
//! never reverse a workflow transition.

use errors::LineError;
use thiserror::Error;

/// Line Service Error Type
#[derive(Error, Debug, Clone)]
pub enum LineSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Socket-level failures (dial, read, write)
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Send attempted while the peer connection is down
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Malformed or unrecognized payloads
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Durable logging failures
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// EMS submission failures
    #[error("Reporting error: {0}")]
    ReportingError(String),

    /// Serialization and parsing errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal errors (task join, closed queues)
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the line service
pub type Result<T> = std::result::Result<T, LineSrvError>;

impl LineSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        LineSrvError::ConfigError(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        LineSrvError::TransportError(msg.into())
    }

    pub fn not_connected(peer: impl Into<String>) -> Self {
        LineSrvError::NotConnected(peer.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        LineSrvError::ProtocolError(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        LineSrvError::PersistenceError(msg.into())
    }

    pub fn reporting(msg: impl Into<String>) -> Self {
        LineSrvError::ReportingError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        LineSrvError::InternalError(msg.into())
    }

    /// Whether the failure came from the socket layer
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LineSrvError::TransportError(_) | LineSrvError::NotConnected(_)
        )
    }
}

impl From<std::io::Error> for LineSrvError {
    fn from(err: std::io::Error) -> Self {
        LineSrvError::TransportError(err.to_string())
    }
}

impl From<serde_json::Error> for LineSrvError {
    fn from(err: serde_json::Error) -> Self {
        LineSrvError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for LineSrvError {
    fn from(err: reqwest::Error) -> Self {
        LineSrvError::ReportingError(err.to_string())
    }
}

impl From<figment::Error> for LineSrvError {
    fn from(err: figment::Error) -> Self {
        LineSrvError::ConfigError(err.to_string())
    }
}

impl From<tokio_serial::Error> for LineSrvError {
    fn from(err: tokio_serial::Error) -> Self {
        LineSrvError::TransportError(format!("serial: {}", err))
    }
}

impl From<LineSrvError> for LineError {
    fn from(err: LineSrvError) -> Self {
        match err {
            LineSrvError::ConfigError(msg) => LineError::Configuration(msg),
            LineSrvError::TransportError(msg) | LineSrvError::NotConnected(msg) => {
                LineError::ConnectionFailed {
                    endpoint: "peer".to_string(),
                    reason: msg,
                }
            },
            LineSrvError::ProtocolError(msg) => LineError::Protocol {
                peer: "peer".to_string(),
                message: msg,
            },
            LineSrvError::ReportingError(msg) => LineError::ExternalService {
                service: "ems".to_string(),
                message: msg,
            },
            LineSrvError::SerializationError(msg) => LineError::Serialization(msg),
            LineSrvError::PersistenceError(msg) | LineSrvError::InternalError(msg) => {
                LineError::Internal(msg)
            },
        }
    }
}
