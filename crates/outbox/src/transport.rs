//! Broker abstraction.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use contracts::MessageEnvelope;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::TransportError;

/// Outbound side of the broker.
///
/// A successful `publish` means the broker accepted the message; delivery to
/// consumers is at-least-once from that point on.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, envelope: &MessageEnvelope) -> Result<(), TransportError>;
}

/// Inbound side of the broker.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for the next message. `None` once the source is exhausted.
    async fn receive(&self) -> Option<MessageEnvelope>;

    /// Hands a message back for redelivery after `delay`.
    async fn nack(&self, envelope: MessageEnvelope, delay: Duration) -> Result<(), TransportError>;
}

/// Envelopes kept for inspection by [`InMemoryTransport::new`].
pub const DEFAULT_PUBLISHED_LOG_CAPACITY: usize = 1024;

struct Inner {
    sender: mpsc::UnboundedSender<MessageEnvelope>,
    receiver: Mutex<mpsc::UnboundedReceiver<MessageEnvelope>>,
    published: RwLock<VecDeque<MessageEnvelope>>,
    log_capacity: usize,
    published_total: AtomicUsize,
    fail_next: AtomicU32,
    unavailable: AtomicBool,
}

/// In-process broker backed by an unbounded channel.
///
/// The most recent published envelopes are also kept in a bounded log for
/// inspection; a capacity of zero keeps none. Publish failures can be
/// injected with [`fail_next`](Self::fail_next) and
/// [`set_unavailable`](Self::set_unavailable).
///
/// Nothing survives a restart: neither queued messages nor pending
/// redeliveries.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_PUBLISHED_LOG_CAPACITY)
    }

    /// Keeps at most `capacity` published envelopes for inspection.
    pub fn with_log_capacity(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                sender,
                receiver: Mutex::new(receiver),
                published: RwLock::new(VecDeque::with_capacity(capacity.min(64))),
                log_capacity: capacity,
                published_total: AtomicUsize::new(0),
                fail_next: AtomicU32::new(0),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next(&self, count: u32) {
        self.inner.fail_next.store(count, Ordering::SeqCst);
    }

    /// Makes every publish fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The most recently accepted envelopes, oldest first.
    pub async fn published(&self) -> Vec<MessageEnvelope> {
        self.inner.published.read().await.iter().cloned().collect()
    }

    /// Envelopes accepted since creation, including those no longer logged.
    pub async fn published_count(&self) -> usize {
        self.inner.published_total.load(Ordering::SeqCst)
    }

    /// Injects an envelope on the inbound side without publishing it.
    pub fn deliver(&self, envelope: MessageEnvelope) -> Result<(), TransportError> {
        self.inner
            .sender
            .send(envelope)
            .map_err(|_| TransportError::Closed)
    }

    /// Returns the next inbound envelope if one is already queued.
    pub async fn try_receive(&self) -> Option<MessageEnvelope> {
        self.inner.receiver.lock().await.try_recv().ok()
    }

    fn take_injected_failure(&self) -> bool {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return true;
        }
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, envelope: &MessageEnvelope) -> Result<(), TransportError> {
        if self.take_injected_failure() {
            return Err(TransportError::Unavailable(
                "in-memory broker rejected the message".to_string(),
            ));
        }

        self.deliver(envelope.clone())?;
        self.inner.published_total.fetch_add(1, Ordering::SeqCst);
        if self.inner.log_capacity > 0 {
            let mut log = self.inner.published.write().await;
            if log.len() == self.inner.log_capacity {
                log.pop_front();
            }
            log.push_back(envelope.clone());
        }
        tracing::debug!(
            message_id = %envelope.message_id,
            message_type = %envelope.message_type,
            "published"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageSource for InMemoryTransport {
    async fn receive(&self) -> Option<MessageEnvelope> {
        self.inner.receiver.lock().await.recv().await
    }

    async fn nack(&self, envelope: MessageEnvelope, delay: Duration) -> Result<(), TransportError> {
        if delay.is_zero() {
            return self.deliver(envelope);
        }

        let sender = self.inner.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(envelope).is_err() {
                tracing::warn!("dropped redelivery: transport closed");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use contracts::{IntegrationMessage, WalletChargeSucceededEventMessage};
    use uuid::Uuid;

    use super::*;

    fn envelope() -> MessageEnvelope {
        let message = IntegrationMessage::from(WalletChargeSucceededEventMessage {
            wallet_deposit_id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            charged_at: chrono::Utc::now(),
        });
        MessageEnvelope::wrap(&message).unwrap()
    }

    #[tokio::test]
    async fn published_envelope_is_received() {
        let transport = InMemoryTransport::new();
        let sent = envelope();

        transport.publish(&sent).await.unwrap();

        assert_eq!(transport.receive().await, Some(sent));
        assert_eq!(transport.published_count().await, 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let transport = InMemoryTransport::new();
        transport.fail_next(2);

        assert!(transport.publish(&envelope()).await.is_err());
        assert!(transport.publish(&envelope()).await.is_err());
        assert!(transport.publish(&envelope()).await.is_ok());
        assert_eq!(transport.published_count().await, 1);
    }

    #[tokio::test]
    async fn unavailable_rejects_until_restored() {
        let transport = InMemoryTransport::new();
        transport.set_unavailable(true);
        assert!(matches!(
            transport.publish(&envelope()).await,
            Err(TransportError::Unavailable(_))
        ));

        transport.set_unavailable(false);
        assert!(transport.publish(&envelope()).await.is_ok());
    }

    #[tokio::test]
    async fn nack_redelivers_after_delay() {
        let transport = InMemoryTransport::new();
        let sent = envelope();

        transport
            .nack(sent.clone(), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(transport.try_receive().await.is_none());

        let redelivered = tokio::time::timeout(Duration::from_secs(2), transport.receive())
            .await
            .unwrap();
        assert_eq!(redelivered, Some(sent));
    }

    #[tokio::test]
    async fn published_log_keeps_only_the_latest_envelopes() {
        let transport = InMemoryTransport::with_log_capacity(2);
        let sent: Vec<_> = (0..3).map(|_| envelope()).collect();
        for e in &sent {
            transport.publish(e).await.unwrap();
        }

        assert_eq!(transport.published_count().await, 3);
        assert_eq!(transport.published().await, sent[1..].to_vec());
    }

    #[tokio::test]
    async fn zero_capacity_logs_nothing_but_still_delivers() {
        let transport = InMemoryTransport::with_log_capacity(0);
        let sent = envelope();
        transport.publish(&sent).await.unwrap();

        assert!(transport.published().await.is_empty());
        assert_eq!(transport.published_count().await, 1);
        assert_eq!(transport.try_receive().await, Some(sent));
    }
}
