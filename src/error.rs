//! Error taxonomy shared by every component of the bridge.
//!
//! All fallible public operations return [`BridgeError`]; panics are reserved
//! for internal invariant violations.

use std::time::Duration;
use thiserror::Error;

/// Typed errors surfaced to callers of the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// An adapter was asked to do work before being given a host/credentials.
    /// Non-fatal, never retried internally.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// No connection is currently established.
    #[error("not connected")]
    NotConnected,

    /// The transport dropped while a request was pending. The next call may
    /// trigger a reconnect.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// A request-level timeout expired. No internal retry.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Unparseable wire data or an unexpected element.
    #[error("malformed protocol data: {0}")]
    ProtocolMalformed(String),

    /// The targeted adapter does not implement this capability.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// No zone / item / adapter matches the given identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// An adapter exhausted its restart budget and stays stopped until
    /// reconfigured.
    #[error("adapter failed permanently: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl BridgeError {
    /// True for errors that map to a 4xx-equivalent at the HTTP boundary
    /// (caller mistakes rather than bridge failures).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotConfigured(_) | Self::Unsupported(_) | Self::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_flagged() {
        assert!(BridgeError::NotFound("zone".into()).is_client_error());
        assert!(BridgeError::Unsupported("images").is_client_error());
        assert!(!BridgeError::NotConnected.is_client_error());
        assert!(!BridgeError::Timeout(Duration::from_secs(10)).is_client_error());
    }

    #[test]
    fn display_names_the_duration() {
        let msg = BridgeError::Timeout(Duration::from_secs(10)).to_string();
        assert!(msg.contains("10s"));
    }
}
