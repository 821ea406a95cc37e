//! Contract decoding errors.

use thiserror::Error;

/// Errors raised while decoding a stored or transported message.
///
/// All of these are permanent for a given payload: retrying the same bytes
/// cannot succeed, so callers quarantine the message instead.
#[derive(Debug, Error)]
pub enum ContractError {
    /// The short type name is not in the registry.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// The full type name does not belong to the short type name.
    #[error("Type name mismatch: {message_type} is not {full_type_name}")]
    TypeNameMismatch {
        message_type: String,
        full_type_name: String,
    },

    /// The payload was written with a schema version this build cannot read.
    #[error("Unsupported schema version {version} for {message_type} (current {current})")]
    UnsupportedSchemaVersion {
        message_type: &'static str,
        version: i32,
        current: i32,
    },

    /// The payload does not match the contract shape.
    #[error("Invalid {message_type} payload: {source}")]
    Payload {
        message_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for contract operations.
pub type Result<T> = std::result::Result<T, ContractError>;
