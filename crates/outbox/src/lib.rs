//! Publishing side of the transactional outbox.
//!
//! - [`OutboxDispatcher`] polls due rows and hands them to a [`Transport`],
//!   applying backoff and poison quarantine on failure
//! - [`Transport`] / [`MessageSource`] abstract the broker, with
//!   [`InMemoryTransport`] implementing both for tests and single-process runs
//! - [`DeadLetterService`] exposes operator actions on poisoned rows

pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod transport;

pub use dead_letter::DeadLetterService;
pub use dispatcher::{DispatchReport, DispatcherConfig, OutboxDispatcher};
pub use error::{DispatchError, Result, TransportError};
pub use transport::{
    DEFAULT_PUBLISHED_LOG_CAPACITY, InMemoryTransport, MessageSource, Transport,
};
