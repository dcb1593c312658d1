//! Retained message store
//!
//! Per-topic last-message persistence with new-subscriber replay. Two
//! interchangeable implementations share one contract: an in-memory map and a
//! shared-store variant with a per-process read-through cache kept coherent
//! across nodes by an invalidation channel.

mod local;
mod shared;

pub use local::LocalRetainStore;
pub use shared::SharedRetainStore;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol::QoS;
use crate::shared::StoreError;

/// A retained message, keyed by its exact publish topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Epoch milliseconds at store time
    pub timestamp: u64,
}

/// Serialized form kept in the shared store
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredRetainedMessage {
    pub topic: String,
    /// base64-encoded payload (binary-safe across the store)
    pub payload: String,
    pub qos: u8,
    pub timestamp: u64,
}

impl From<&RetainedMessage> for StoredRetainedMessage {
    fn from(msg: &RetainedMessage) -> Self {
        Self {
            topic: msg.topic.clone(),
            payload: BASE64.encode(&msg.payload),
            qos: msg.qos as u8,
            timestamp: msg.timestamp,
        }
    }
}

impl TryFrom<StoredRetainedMessage> for RetainedMessage {
    type Error = StoreError;

    fn try_from(stored: StoredRetainedMessage) -> Result<Self, StoreError> {
        let payload = BASE64
            .decode(&stored.payload)
            .map_err(|e| StoreError::Command(format!("invalid retained payload: {}", e)))?;
        Ok(Self {
            topic: stored.topic,
            payload: Bytes::from(payload),
            qos: QoS::from_u8(stored.qos).unwrap_or(QoS::AtMostOnce),
            timestamp: stored.timestamp,
        })
    }
}

/// Contract shared by the local and shared retained stores
#[async_trait]
pub trait RetainStore: Send + Sync {
    /// Upsert the retained message for a topic. An empty payload deletes.
    async fn store(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), StoreError>;

    /// At most one message per topic
    async fn get(&self, topic: &str) -> Result<Option<RetainedMessage>, StoreError>;

    async fn remove(&self, topic: &str) -> Result<(), StoreError>;

    /// Every stored message whose topic matches the MQTT filter
    async fn get_matching(&self, filter: &str) -> Result<Vec<RetainedMessage>, StoreError>;

    /// Number of retained topics (approximate for the shared variant)
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_roundtrip() {
        let msg = RetainedMessage {
            topic: "lamp/1".to_string(),
            payload: Bytes::from_static(&[0x00, 0xFF, b'o', b'n']),
            qos: QoS::AtLeastOnce,
            timestamp: 1_700_000_000_000,
        };

        let stored = StoredRetainedMessage::from(&msg);
        let json = serde_json::to_string(&stored).unwrap();
        let parsed: StoredRetainedMessage = serde_json::from_str(&json).unwrap();
        let back = RetainedMessage::try_from(parsed).unwrap();

        assert_eq!(back, msg);
    }
}
