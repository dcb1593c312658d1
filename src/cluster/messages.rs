//! Cluster channel envelopes
//!
//! Every message crossing the shared store's pub/sub channels is a JSON
//! envelope with binary payloads carried as base64, keyed camelCase so the
//! records stay readable from the store's CLI.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Broadcast of a publication to every node (`dynamq:cluster:publish`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub topic: String,
    /// base64-encoded payload
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
    /// The original publisher, skipped during remote fan-out
    #[serde(default)]
    pub exclude_client_id: Option<String>,
    pub source_node: String,
}

/// Addressed unicast for one client (`dynamq:node:{nodeId}`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnicastMessage {
    pub client_id: String,
    pub topic: String,
    /// base64-encoded payload
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
    pub source_node: String,
}

/// Duplicate-client eviction command (`dynamq:cluster:kick`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickCommand {
    /// Always "kick"
    pub action: String,
    pub client_id: String,
    /// Only the targeted node acts on the command
    pub target_node: String,
    pub source_node: String,
}

impl KickCommand {
    pub fn new(client_id: &str, target_node: &str, source_node: &str) -> Self {
        Self {
            action: "kick".to_string(),
            client_id: client_id.to_string(),
            target_node: target_node.to_string(),
            source_node: source_node.to_string(),
        }
    }
}

/// Subscription-cache invalidation (`dynamq:subscriptions:channel`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSyncMessage {
    pub client_id: String,
    pub source_node: String,
}

/// Route-table invalidation (`dynamq:routes:sync`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSyncMessage {
    pub source_node: String,
}

pub fn encode_payload(payload: &Bytes) -> String {
    BASE64.encode(payload)
}

pub fn decode_payload(payload: &str) -> Bytes {
    Bytes::from(BASE64.decode(payload).unwrap_or_default())
}
