//! Error types for talking to the coordination service.
//!
//! "Not found" is never an error here: an absent key is `None` and an unknown
//! service is an empty instance list. Everything below is a failure the caller
//! has to react to.

use thiserror::Error;

/// Errors that can occur while talking to the coordination service.
#[derive(Error, Debug, Clone)]
pub enum CoordinationError {
    /// The backend could not be reached (connection refused, reset, DNS...).
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// A lock acquisition lost against another session.
    #[error("Lock on key '{key}' is held by another session")]
    Contention {
        /// The contested key.
        key: String,
    },

    /// The session or health check no longer exists on the server.
    #[error("Lease '{id}' expired or is no longer valid")]
    LeaseInvalid {
        /// Session id or check id that was rejected.
        id: String,
    },

    /// Invalid settings detected before any request was made.
    #[error("Configuration error: {message}")]
    Configuration {
        /// What was wrong with the configuration.
        message: String,
    },

    /// The backend answered with an unexpected status.
    #[error("Backend returned {status}: {message}")]
    Backend {
        /// HTTP-style status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The backend answered with a body we could not decode.
    #[error("Decode error: {message}")]
    Decode {
        /// Description of the decode failure.
        message: String,
    },
}

impl CoordinationError {
    /// Creates a `Transport` error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a `Contention` error.
    pub fn contention(key: impl Into<String>) -> Self {
        Self::Contention { key: key.into() }
    }

    /// Creates a `LeaseInvalid` error.
    pub fn lease_invalid(id: impl Into<String>) -> Self {
        Self::LeaseInvalid { id: id.into() }
    }

    /// Creates a `Configuration` error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a `Backend` error.
    pub fn backend(status: u16, message: impl Into<String>) -> Self {
        Self::Backend {
            status,
            message: message.into(),
        }
    }

    /// Creates a `Decode` error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Returns `true` for failures a background loop should log and retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Backend { .. } | Self::Decode { .. }
        )
    }

    /// Returns `true` if the lease or check is gone and must be re-created.
    pub fn is_lease_invalid(&self) -> bool {
        matches!(self, Self::LeaseInvalid { .. })
    }

    /// Returns `true` if a lock was lost to another session.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }

    /// Returns `true` for startup errors that must not be retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

impl From<reqwest::Error> for CoordinationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::decode(err.to_string())
        } else {
            Self::transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(err: serde_json::Error) -> Self {
        Self::decode(err.to_string())
    }
}
