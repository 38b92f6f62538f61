use std::time::Duration;

use thiserror::Error;

/// A broadcast path or device id that cannot be used on the relay.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LinkPathError {
    #[error("invalid link path: {0}")]
    Invalid(String),
}

/// Why a device link could not be opened.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LinkError {
    /// The relay URL could not be built for this device.
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    /// No pool permit became available within the operation timeout.
    #[error("connection pool exhausted ({max_pool_size} links open)")]
    PoolExhausted { max_pool_size: usize },

    /// The WebTransport handshake with the relay failed.
    #[error("failed to connect to relay: {0}")]
    Connect(String),

    /// The MoQ session setup failed after the transport was established.
    #[error("failed to establish MoQ session: {0}")]
    Session(String),

    #[error("failed to create broadcast: {0}")]
    BroadcastCreate(String),

    /// The relay subscription for cloud traffic was refused.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Opening the link took longer than the operation timeout.
    #[error("timed out opening link after {0:?}")]
    Timeout(Duration),
}

/// Failures of send and read operations on an open link.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LinkOpError {
    /// The link was closed and can no longer be used.
    #[error("device link closed")]
    Closed,

    #[error("failed to encode message")]
    Encode(#[from] prost::EncodeError),

    #[error("malformed message on track")]
    Decode(#[from] prost::DecodeError),

    /// No twin document arrived within the operation timeout.
    #[error("twin unavailable after {0:?}")]
    TwinUnavailable(Duration),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LinkWireError {
    #[error("track transport failed")]
    Transport(#[source] moq_lite::Error),
}

impl From<moq_lite::Error> for LinkWireError {
    fn from(err: moq_lite::Error) -> Self {
        LinkWireError::Transport(err)
    }
}
