//! Dispatcher and transport error types.

use thiserror::Error;

/// Errors raised by a transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The broker could not accept the message right now.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// The transport has been shut down.
    #[error("Transport closed")]
    Closed,
}

/// Errors that can occur while dispatching the outbox.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// An error occurred in the message store.
    #[error("Message store error: {0}")]
    Store(#[from] message_store::StoreError),

    /// An error occurred in the transport.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
