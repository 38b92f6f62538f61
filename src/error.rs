use std::time::Duration;

use thiserror::Error;

/// Errors resolving a device id into a live connection.
///
/// Clone, because every caller waiting on the same creation attempt receives
/// the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("missing device id")]
    MissingDeviceId,

    /// The connection factory refused or failed to open the connection.
    #[error("failed to connect device '{device_id}': {reason}")]
    Factory { device_id: String, reason: String },

    /// The connection factory did not finish within the operation timeout.
    #[error("timed out connecting device '{device_id}' after {timeout:?}")]
    Timeout { device_id: String, timeout: Duration },

    /// The credential's expiry had already passed.
    #[error("credential for device '{device_id}' has expired")]
    CredentialExpired { device_id: String },

    /// The creation attempt ended without an outcome (task aborted or entry discarded).
    #[error("connection attempt for device '{device_id}' was aborted")]
    Aborted { device_id: String },
}

impl ConnectionError {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            ConnectionError::MissingDeviceId => None,
            ConnectionError::Factory { device_id, .. }
            | ConnectionError::Timeout { device_id, .. }
            | ConnectionError::CredentialExpired { device_id }
            | ConnectionError::Aborted { device_id } => Some(device_id),
        }
    }
}

/// Errors reported by a live connection handle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandleError {
    /// The connection is no longer usable; the entry holding it should be replaced.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation failed but the connection remains usable.
    #[error("operation rejected: {0}")]
    Rejected(String),
}

impl HandleError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, HandleError::ConnectionLost(_))
    }
}

/// Errors from a gateway operation (send message, update properties, fetch twin).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("{operation} failed for device '{device_id}'")]
    Operation {
        device_id: String,
        operation: &'static str,
        #[source]
        source: HandleError,
    },
}

impl GatewayError {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            GatewayError::Connection(e) => e.device_id(),
            GatewayError::Operation { device_id, .. } => Some(device_id),
        }
    }
}

/// Errors reading the gateway configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("shared access is enabled but {0} is not set")]
    MissingAccessPolicy(&'static str),
}
