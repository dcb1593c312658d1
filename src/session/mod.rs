//! Client session management
//!
//! A session tracks everything the broker knows about one client id: the
//! clean-session flag, keep-alive, will message, subscription grants, the
//! in-flight QoS 1/2 tables and the wrapping message-id counter. Sessions are
//! owned by their connection handler while attached and survive detachment
//! when `cleanSession=false`.

mod local;
mod shared;

pub use local::LocalSessionManager;
pub use shared::SharedSessionManager;

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::protocol::QoS;
use crate::shared::StoreError;

/// Shared handle to a session's mutable state
pub type SessionHandle = Arc<RwLock<ClientSession>>;

/// A message awaiting acknowledgement from a subscriber (QoS 1/2 outbound)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub message_id: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Epoch millis of the last transmission
    pub sent_at: u64,
    pub retry_count: u32,
}

/// Will message recorded at CONNECT time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Per-client session state
pub struct ClientSession {
    pub client_id: Arc<str>,
    pub username: Option<String>,
    pub clean_session: bool,
    pub keep_alive_seconds: u16,
    /// Epoch millis of the accepted CONNECT
    pub connected_at: u64,
    /// Epoch millis of the last packet from the client
    pub last_activity_at: u64,
    /// Node currently owning this session
    pub node_id: String,
    /// Whether a transport is currently attached on this node
    pub connected: bool,
    /// topic filter -> granted QoS
    pub subscriptions: AHashMap<String, QoS>,
    pub will: Option<WillMessage>,
    /// Outbound QoS 1 messages awaiting PUBACK
    pub pending_qos1: AHashMap<u16, PendingMessage>,
    /// Outbound QoS 2 messages awaiting PUBREC/PUBCOMP
    pub pending_qos2: AHashMap<u16, PendingMessage>,
    /// Inbound QoS 2 message ids between PUBLISH and PUBREL, for
    /// at-most-once fan-out of duplicate transmissions
    pub inbound_qos2: AHashSet<u16>,
    /// Last allocated message id (1..=65535, never 0)
    pub last_message_id: u16,
}

impl ClientSession {
    pub fn new(client_id: Arc<str>, clean_session: bool, node_id: &str) -> Self {
        let now = now_millis();
        Self {
            client_id,
            username: None,
            clean_session,
            keep_alive_seconds: 60,
            connected_at: now,
            last_activity_at: now,
            node_id: node_id.to_string(),
            connected: false,
            subscriptions: AHashMap::with_capacity(8),
            will: None,
            pending_qos1: AHashMap::with_capacity(16),
            pending_qos2: AHashMap::with_capacity(16),
            inbound_qos2: AHashSet::with_capacity(16),
            last_message_id: 0,
        }
    }

    /// Next message id, cycling through 1..=65535 and never returning 0
    pub fn next_message_id(&mut self) -> u16 {
        self.last_message_id = (self.last_message_id % 65535) + 1;
        self.last_message_id
    }

    /// Update the last-activity timestamp
    pub fn touch(&mut self) {
        self.last_activity_at = now_millis();
    }

    pub fn add_subscription(&mut self, filter: &str, qos: QoS) {
        self.subscriptions.insert(filter.to_string(), qos);
    }

    pub fn remove_subscription(&mut self, filter: &str) {
        self.subscriptions.remove(filter);
    }

    /// Record an outbound QoS > 0 message awaiting acknowledgement
    pub fn track_pending(&mut self, message: PendingMessage) {
        match message.qos {
            QoS::AtLeastOnce => {
                self.pending_qos1.insert(message.message_id, message);
            }
            QoS::ExactlyOnce => {
                self.pending_qos2.insert(message.message_id, message);
            }
            QoS::AtMostOnce => {}
        }
    }
}

/// Wall-clock epoch milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Epoch-millis timestamps that tolerate the three shapes older session
/// records were written in: a plain number (millis), an ISO-8601 string, or
/// a `{epochSecond, nano}` object. Writes are always a plain number.
pub(crate) mod epoch_millis {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().map(|f| f as u64))
                .ok_or_else(|| D::Error::custom("invalid numeric timestamp")),
            serde_json::Value::String(s) => s
                .parse::<chrono::DateTime<chrono::Utc>>()
                .map(|dt| dt.timestamp_millis() as u64)
                .map_err(|e| D::Error::custom(format!("invalid ISO-8601 timestamp: {}", e))),
            serde_json::Value::Object(map) => {
                let second = map
                    .get("epochSecond")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| D::Error::custom("timestamp object missing epochSecond"))?;
                let nano = map.get("nano").and_then(|v| v.as_u64()).unwrap_or(0);
                Ok(second * 1000 + nano / 1_000_000)
            }
            _ => Err(D::Error::custom("unsupported timestamp shape")),
        }
    }
}

/// Serialized pending message (payload crosses the store as base64)
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredPendingMessage {
    pub message_id: u16,
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub sent_at: u64,
    pub retry_count: u32,
}

impl From<&PendingMessage> for StoredPendingMessage {
    fn from(msg: &PendingMessage) -> Self {
        Self {
            message_id: msg.message_id,
            topic: msg.topic.clone(),
            payload: BASE64.encode(&msg.payload),
            qos: msg.qos as u8,
            sent_at: msg.sent_at,
            retry_count: msg.retry_count,
        }
    }
}

impl From<StoredPendingMessage> for PendingMessage {
    fn from(stored: StoredPendingMessage) -> Self {
        Self {
            message_id: stored.message_id,
            topic: stored.topic,
            payload: Bytes::from(BASE64.decode(&stored.payload).unwrap_or_default()),
            qos: QoS::from_u8(stored.qos).unwrap_or(QoS::AtMostOnce),
            sent_at: stored.sent_at,
            retry_count: stored.retry_count,
        }
    }
}

/// Serialized will message
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredWillMessage {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

/// Serialized session record, as written under `dynamq:session:{clientId}`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredSession {
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    pub clean_session: bool,
    #[serde(default)]
    pub keep_alive_seconds: u16,
    #[serde(with = "epoch_millis")]
    pub connected_at: u64,
    #[serde(with = "epoch_millis")]
    pub last_activity_at: u64,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub subscriptions: std::collections::HashMap<String, u8>,
    #[serde(default)]
    pub will_message: Option<StoredWillMessage>,
    #[serde(default)]
    pub pending_qo_s1: std::collections::HashMap<u16, StoredPendingMessage>,
    #[serde(default)]
    pub pending_qo_s2: std::collections::HashMap<u16, StoredPendingMessage>,
    #[serde(default)]
    pub last_message_id: u16,
}

impl StoredSession {
    pub fn from_session(session: &ClientSession) -> Self {
        Self {
            client_id: session.client_id.to_string(),
            username: session.username.clone(),
            clean_session: session.clean_session,
            keep_alive_seconds: session.keep_alive_seconds,
            connected_at: session.connected_at,
            last_activity_at: session.last_activity_at,
            node_id: session.node_id.clone(),
            subscriptions: session
                .subscriptions
                .iter()
                .map(|(filter, qos)| (filter.clone(), *qos as u8))
                .collect(),
            will_message: session.will.as_ref().map(|will| StoredWillMessage {
                topic: will.topic.clone(),
                payload: BASE64.encode(&will.payload),
                qos: will.qos as u8,
                retain: will.retain,
            }),
            pending_qo_s1: session
                .pending_qos1
                .iter()
                .map(|(id, msg)| (*id, StoredPendingMessage::from(msg)))
                .collect(),
            pending_qo_s2: session
                .pending_qos2
                .iter()
                .map(|(id, msg)| (*id, StoredPendingMessage::from(msg)))
                .collect(),
            last_message_id: session.last_message_id,
        }
    }

    pub fn into_session(self, node_id: &str) -> ClientSession {
        ClientSession {
            client_id: Arc::from(self.client_id.as_str()),
            username: self.username,
            clean_session: self.clean_session,
            keep_alive_seconds: self.keep_alive_seconds,
            connected_at: self.connected_at,
            last_activity_at: self.last_activity_at,
            node_id: node_id.to_string(),
            connected: false,
            subscriptions: self
                .subscriptions
                .into_iter()
                .map(|(filter, qos)| (filter, QoS::from_u8(qos).unwrap_or(QoS::AtMostOnce)))
                .collect(),
            will: self.will_message.map(|will| WillMessage {
                topic: will.topic,
                payload: Bytes::from(BASE64.decode(&will.payload).unwrap_or_default()),
                qos: QoS::from_u8(will.qos).unwrap_or(QoS::AtMostOnce),
                retain: will.retain,
            }),
            pending_qos1: self
                .pending_qo_s1
                .into_iter()
                .map(|(id, msg)| (id, PendingMessage::from(msg)))
                .collect(),
            pending_qos2: self
                .pending_qo_s2
                .into_iter()
                .map(|(id, msg)| (id, PendingMessage::from(msg)))
                .collect(),
            inbound_qos2: AHashSet::new(),
            last_message_id: self.last_message_id,
        }
    }
}

/// Contract shared by the local and shared session managers
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Create or restore a session. `cleanSession=true` deletes any stored
    /// state and returns a fresh session; otherwise the stored session is
    /// restored when present.
    async fn create_session(
        &self,
        client_id: &str,
        clean_session: bool,
    ) -> Result<SessionHandle, StoreError>;

    async fn get_session(&self, client_id: &str) -> Result<Option<SessionHandle>, StoreError>;

    /// Persist the session's current state
    async fn update_session(&self, session: &SessionHandle) -> Result<(), StoreError>;

    /// Remove the connection record; `permanent=true` also removes the
    /// session record itself
    async fn remove_session(&self, client_id: &str, permanent: bool) -> Result<(), StoreError>;

    async fn is_client_connected(&self, client_id: &str) -> Result<bool, StoreError>;

    /// Which node currently owns the client's connection, if any
    async fn get_client_node(&self, client_id: &str) -> Result<Option<String>, StoreError>;

    /// Evict the client's connection wherever it lives
    async fn force_disconnect(&self, client_id: &str) -> Result<(), StoreError>;

    async fn session_count(&self) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_cycles_and_never_zero() {
        let mut session = ClientSession::new(Arc::from("c"), true, "n1");

        assert_eq!(session.next_message_id(), 1);
        assert_eq!(session.next_message_id(), 2);

        session.last_message_id = 65534;
        assert_eq!(session.next_message_id(), 65535);
        // Wraps back to 1, skipping 0
        assert_eq!(session.next_message_id(), 1);
    }

    #[test]
    fn test_stored_session_roundtrip() {
        let mut session = ClientSession::new(Arc::from("dev-1"), false, "node-a");
        session.username = Some("alice".to_string());
        session.keep_alive_seconds = 30;
        session.add_subscription("a/+/c", QoS::AtLeastOnce);
        session.will = Some(WillMessage {
            topic: "status/dev-1".to_string(),
            payload: Bytes::from("down"),
            qos: QoS::AtLeastOnce,
            retain: true,
        });
        session.track_pending(PendingMessage {
            message_id: 7,
            topic: "a/b/c".to_string(),
            payload: Bytes::from("payload"),
            qos: QoS::AtLeastOnce,
            sent_at: 1_700_000_000_000,
            retry_count: 1,
        });
        session.last_message_id = 7;

        let json = serde_json::to_string(&StoredSession::from_session(&session)).unwrap();
        let stored: StoredSession = serde_json::from_str(&json).unwrap();
        let restored = stored.into_session("node-b");

        assert_eq!(restored.client_id.as_ref(), "dev-1");
        assert_eq!(restored.username.as_deref(), Some("alice"));
        assert!(!restored.clean_session);
        assert_eq!(restored.node_id, "node-b");
        assert_eq!(
            restored.subscriptions.get("a/+/c"),
            Some(&QoS::AtLeastOnce)
        );
        let will = restored.will.as_ref().unwrap();
        assert_eq!(will.payload, Bytes::from("down"));
        assert!(will.retain);
        let pending = restored.pending_qos1.get(&7).unwrap();
        assert_eq!(pending.payload, Bytes::from("payload"));
        assert_eq!(pending.retry_count, 1);
        assert_eq!(restored.last_message_id, 7);
    }

    #[test]
    fn test_connected_at_accepts_number_millis() {
        let json = r#"{
            "clientId": "c", "cleanSession": false,
            "connectedAt": 1700000000000,
            "lastActivityAt": 1700000001000
        }"#;
        let stored: StoredSession = serde_json::from_str(json).unwrap();
        assert_eq!(stored.connected_at, 1_700_000_000_000);
    }

    #[test]
    fn test_connected_at_accepts_iso_string() {
        let json = r#"{
            "clientId": "c", "cleanSession": false,
            "connectedAt": "2023-11-14T22:13:20Z",
            "lastActivityAt": 1700000001000
        }"#;
        let stored: StoredSession = serde_json::from_str(json).unwrap();
        assert_eq!(stored.connected_at, 1_700_000_000_000);
    }

    #[test]
    fn test_connected_at_accepts_epoch_second_object() {
        let json = r#"{
            "clientId": "c", "cleanSession": false,
            "connectedAt": {"epochSecond": 1700000000, "nano": 500000000},
            "lastActivityAt": {"epochSecond": 1700000001}
        }"#;
        let stored: StoredSession = serde_json::from_str(json).unwrap();
        assert_eq!(stored.connected_at, 1_700_000_000_500);
        assert_eq!(stored.last_activity_at, 1_700_000_001_000);
    }

    #[test]
    fn test_canonical_write_is_number() {
        let session = ClientSession::new(Arc::from("c"), true, "n1");
        let json = serde_json::to_value(StoredSession::from_session(&session)).unwrap();
        assert!(json["connectedAt"].is_u64());
    }
}
