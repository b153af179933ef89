//! Error types for backend client operations.

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by session management and operation aggregation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The wire transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The session-creation handshake did not complete.
    #[error("session handshake failed: {message}")]
    Handshake {
        /// Description of the handshake failure.
        message: String,
    },

    /// The backend exchange did not reach a terminal frame in time.
    ///
    /// Distinct from an evaluation fault: the caller's code did not finish,
    /// it did not necessarily fail.
    #[error("operation timed out after {waited:?}")]
    Timeout {
        /// Wall-clock time spent waiting.
        waited: Duration,
    },

    /// An operation was attempted without a live session.
    #[error("no live backend session")]
    NoSession,
}

impl ClientError {
    /// Creates a handshake error.
    #[must_use]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }
}
