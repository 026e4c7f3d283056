use thiserror::Error;

use crate::dao::storage::StorageError;

/// Errors raised by the push transport and the connection layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport could not be established.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The transport was closed by the peer or by a network failure.
    #[error("connection closed: {0}")]
    Closed(String),
    /// A frame could not be serialised or parsed.
    #[error("invalid frame: {0}")]
    Codec(#[from] serde_json::Error),
    /// An outbound message was emitted while no transport is connected.
    #[error("not connected")]
    NotConnected,
}

/// Errors raised while evaluating an override record.
///
/// They never escape the override managers: a record that fails to evaluate simply does
/// not apply and resolution falls down the precedence chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// The record has no start or no end date.
    #[error("override `{id}` has no date window")]
    MissingDateWindow {
        /// Identifier of the offending record.
        id: String,
    },
    /// A date could not be parsed as a calendar date or an RFC 3339 timestamp.
    #[error("override `{id}` has a malformed date `{value}`")]
    MalformedDate {
        /// Identifier of the offending record.
        id: String,
        /// Raw value received from the backend.
        value: String,
    },
}

/// Errors surfaced while bootstrapping or tearing down the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No application key was configured, so no transport can be authenticated.
    #[error("application key is required to connect")]
    MissingApplicationKey,
    /// Durable analytics storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// The transport layer failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
