//! Shared-store retained message store
//!
//! Persists retained messages under `dynamq:retain:{topic}` for cluster-wide
//! access and keeps a per-process read-through cache. Coherence is by
//! broadcast: every store/remove publishes `{action, topic, sourceNode}` on
//! `dynamq:retain:sync`, and peers drop the named cache entry. The source
//! node never invalidates its own cache.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{now_millis, RetainStore, RetainedMessage, StoredRetainedMessage};
use crate::protocol::QoS;
use crate::shared::{SharedStore, StoreError};
use crate::topic::topic_matches_filter;

const RETAIN_KEY_PREFIX: &str = "dynamq:retain:";
const RETAIN_SYNC_CHANNEL: &str = "dynamq:retain:sync";

/// Cache invalidation notice published on the sync channel
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetainSyncMessage {
    action: String,
    topic: String,
    source_node: String,
    timestamp: u64,
}

/// Cluster-wide retained store
pub struct SharedRetainStore {
    store: Arc<SharedStore>,
    node_id: String,
    cache: Arc<DashMap<String, RetainedMessage>>,
}

impl SharedRetainStore {
    pub fn new(store: Arc<SharedStore>, node_id: &str) -> Self {
        Self {
            store,
            node_id: node_id.to_string(),
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Subscribe to invalidation notices from peer nodes
    pub fn start_sync(&self) -> tokio::task::JoinHandle<()> {
        let cache = self.cache.clone();
        let node_id = self.node_id.clone();

        self.store.subscribe(
            vec![RETAIN_SYNC_CHANNEL.to_string()],
            Arc::new(move |_channel, payload| {
                let msg: RetainSyncMessage = match serde_json::from_str(payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Failed to parse retain sync message: {}", e);
                        return;
                    }
                };

                // The source node keeps its own (already-correct) entry
                if msg.source_node == node_id {
                    return;
                }

                debug!(
                    "Retain sync: action={}, topic={}, from={}",
                    msg.action, msg.topic, msg.source_node
                );
                cache.remove(&msg.topic);
            }),
        )
    }

    async fn publish_sync(&self, action: &str, topic: &str) {
        let msg = RetainSyncMessage {
            action: action.to_string(),
            topic: topic.to_string(),
            source_node: self.node_id.clone(),
            timestamp: now_millis(),
        };

        match serde_json::to_string(&msg) {
            Ok(json) => {
                if let Err(e) = self.store.publish(RETAIN_SYNC_CHANNEL, &json).await {
                    error!("Failed to publish retain sync: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize retain sync: {}", e),
        }
    }

    fn key(topic: &str) -> String {
        format!("{}{}", RETAIN_KEY_PREFIX, topic)
    }
}

#[async_trait]
impl RetainStore for SharedRetainStore {
    async fn store(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), StoreError> {
        if payload.is_empty() {
            return self.remove(topic).await;
        }

        let message = RetainedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            timestamp: now_millis(),
        };

        let json = serde_json::to_string(&StoredRetainedMessage::from(&message))
            .map_err(|e| StoreError::Command(e.to_string()))?;

        self.store.set(&Self::key(topic), &json).await?;

        self.cache.insert(topic.to_string(), message);
        self.publish_sync("store", topic).await;
        debug!("Stored retained message for topic: {}", topic);

        Ok(())
    }

    async fn get(&self, topic: &str) -> Result<Option<RetainedMessage>, StoreError> {
        if let Some(cached) = self.cache.get(topic) {
            return Ok(Some(cached.clone()));
        }

        // Cache miss: read the authoritative record and repopulate
        match self.store.get(&Self::key(topic)).await? {
            Some(json) => {
                let stored: StoredRetainedMessage = serde_json::from_str(&json)
                    .map_err(|e| StoreError::Command(e.to_string()))?;
                let message = RetainedMessage::try_from(stored)?;
                self.cache.insert(topic.to_string(), message.clone());
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, topic: &str) -> Result<(), StoreError> {
        self.cache.remove(topic);
        self.store.del(&[&Self::key(topic)]).await?;
        self.publish_sync("remove", topic).await;
        debug!("Removed retained message for topic: {}", topic);
        Ok(())
    }

    async fn get_matching(&self, filter: &str) -> Result<Vec<RetainedMessage>, StoreError> {
        // Enumerate keys under the prefix and filter in memory; MQTT
        // wildcards don't map onto store key patterns
        let keys = self.store.keys(&format!("{}*", RETAIN_KEY_PREFIX)).await?;

        let matching_keys: Vec<String> = keys
            .into_iter()
            .filter(|key| {
                key.strip_prefix(RETAIN_KEY_PREFIX)
                    .map(|topic| topic_matches_filter(topic, filter))
                    .unwrap_or(false)
            })
            .collect();

        if matching_keys.is_empty() {
            return Ok(Vec::new());
        }

        let values = self.store.mget(&matching_keys).await?;

        let mut result = Vec::with_capacity(values.len());
        for value in values.into_iter().flatten() {
            match serde_json::from_str::<StoredRetainedMessage>(&value) {
                Ok(stored) => match RetainedMessage::try_from(stored) {
                    Ok(message) => result.push(message),
                    Err(e) => warn!("Skipping undecodable retained message: {}", e),
                },
                Err(e) => warn!("Skipping unparsable retained record: {}", e),
            }
        }

        debug!(
            "Found {} retained messages matching filter: {}",
            result.len(),
            filter
        );
        Ok(result)
    }

    fn len(&self) -> usize {
        self.cache.len()
    }
}
