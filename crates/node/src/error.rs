//! Error taxonomy for the hub-binding layer.
//!
//! Validation errors fail fast before any network call; connectivity and
//! publish errors degrade functionality but never stop the control loop.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TopicError {
    /// The derived topic would exceed the 150-character bound. Detected
    /// before any segment past the budget is appended, so no partial topic
    /// ever reaches the transport.
    #[error("derived topic would be {would_be} chars, exceeding the 150 char bound")]
    TooLong { would_be: usize },
}

// ---------------------------------------------------------------------------
// Connectivity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("network link unavailable")]
    LinkUnavailable,
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),
    #[error("broker rejected credentials")]
    AuthFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("not connected to the broker")]
    NotConnected,
    #[error("broker rejected the request: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Binding operations
// ---------------------------------------------------------------------------

/// Failure of a single binding operation (announce, state publish, command
/// subscription). Connectivity variants are retryable; `NotCommandable` is
/// a configuration mistake caught at setup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error("could not reach the broker within the retry budget")]
    Unreachable,
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("device is not commandable")]
    NotCommandable,
}
