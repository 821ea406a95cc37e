//! Transport envelope.

use chrono::{DateTime, Utc};
use common::{AggregateId, CorrelationId, MessageId};
use serde::{Deserialize, Serialize};

use crate::error::{ContractError, Result};
use crate::message::{IntegrationMessage, MessageKind};

/// What travels on the transport: one outbox row's payload plus the
/// descriptors a consumer needs to decode and deduplicate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Id of the outbox row; stable across republishes of the same row.
    pub message_id: MessageId,
    pub message_type: String,
    pub full_type_name: String,
    pub schema_version: i32,
    pub content: serde_json::Value,
    pub occurred_on: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub aggregate_id: Option<AggregateId>,
    pub correlation_id: Option<CorrelationId>,
}

impl MessageEnvelope {
    /// Wraps a message in a fresh envelope with the current schema version.
    pub fn wrap(message: &IntegrationMessage) -> std::result::Result<Self, serde_json::Error> {
        let kind = message.kind();
        Ok(Self {
            message_id: MessageId::new(),
            message_type: kind.type_name().to_string(),
            full_type_name: kind.full_type_name().to_string(),
            schema_version: kind.schema_version(),
            content: message.to_content()?,
            occurred_on: Utc::now(),
            idempotency_key: None,
            aggregate_id: None,
            correlation_id: None,
        })
    }

    /// Resolves the envelope's kind through the registry.
    pub fn kind(&self) -> Result<MessageKind> {
        let kind = MessageKind::from_type_name(&self.message_type)
            .ok_or_else(|| ContractError::UnknownMessageType(self.message_type.clone()))?;

        if !self.full_type_name.is_empty() && self.full_type_name != kind.full_type_name() {
            return Err(ContractError::TypeNameMismatch {
                message_type: self.message_type.clone(),
                full_type_name: self.full_type_name.clone(),
            });
        }

        Ok(kind)
    }

    /// Decodes the payload into a typed message.
    pub fn decode(&self) -> Result<IntegrationMessage> {
        self.kind()?
            .decode(self.schema_version, self.content.clone())
    }

    /// Key used to detect redelivery of the same logical message.
    ///
    /// The producer-supplied idempotency key when present, otherwise the
    /// outbox row id.
    pub fn deduplication_key(&self) -> String {
        self.idempotency_key
            .clone()
            .unwrap_or_else(|| self.message_id.to_string())
    }
}
