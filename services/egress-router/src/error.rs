//! Error types for the egress router.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors that stop a listener or the whole router.
///
/// Per-connection failures never surface here; they are classified and
/// reported through the observer instead.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listening address could not be bound.
    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Every listener of a [`serve`](crate::relay::serve) call has stopped.
    #[error("all listeners stopped")]
    AllListenersStopped,

    /// IO error outside of a bridged connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Bind { .. } => "bind_failed",
            RelayError::AllListenersStopped => "all_listeners_stopped",
            RelayError::Io(_) => "io_error",
        }
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
