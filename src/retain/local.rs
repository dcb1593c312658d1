//! In-memory retained message store

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::{now_millis, RetainStore, RetainedMessage};
use crate::protocol::QoS;
use crate::shared::StoreError;
use crate::topic::topic_matches_filter;

/// Single-node retained store backed by a concurrent map
#[derive(Default)]
pub struct LocalRetainStore {
    messages: DashMap<String, RetainedMessage>,
}

impl LocalRetainStore {
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
        }
    }
}

#[async_trait]
impl RetainStore for LocalRetainStore {
    async fn store(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), StoreError> {
        if payload.is_empty() {
            return self.remove(topic).await;
        }

        self.messages.insert(
            topic.to_string(),
            RetainedMessage {
                topic: topic.to_string(),
                payload,
                qos,
                timestamp: now_millis(),
            },
        );
        Ok(())
    }

    async fn get(&self, topic: &str) -> Result<Option<RetainedMessage>, StoreError> {
        Ok(self.messages.get(topic).map(|entry| entry.clone()))
    }

    async fn remove(&self, topic: &str) -> Result<(), StoreError> {
        self.messages.remove(topic);
        Ok(())
    }

    async fn get_matching(&self, filter: &str) -> Result<Vec<RetainedMessage>, StoreError> {
        Ok(self
            .messages
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.clone())
            .collect())
    }

    fn len(&self) -> usize {
        self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_get() {
        let store = LocalRetainStore::new();

        store
            .store("lamp/1", Bytes::from("on"), QoS::AtMostOnce)
            .await
            .unwrap();

        let msg = store.get("lamp/1").await.unwrap().unwrap();
        assert_eq!(msg.payload, Bytes::from("on"));
        assert_eq!(msg.qos, QoS::AtMostOnce);

        assert!(store.get("lamp/2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_payload_deletes() {
        let store = LocalRetainStore::new();

        store
            .store("lamp/1", Bytes::from("on"), QoS::AtMostOnce)
            .await
            .unwrap();
        store
            .store("lamp/1", Bytes::new(), QoS::AtMostOnce)
            .await
            .unwrap();

        assert!(store.get("lamp/1").await.unwrap().is_none());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_get_matching_wildcards() {
        let store = LocalRetainStore::new();

        store
            .store("lamp/1", Bytes::from("on"), QoS::AtMostOnce)
            .await
            .unwrap();
        store
            .store("lamp/2", Bytes::from("off"), QoS::AtMostOnce)
            .await
            .unwrap();
        store
            .store("door/1", Bytes::from("open"), QoS::AtMostOnce)
            .await
            .unwrap();

        let mut matching = store.get_matching("lamp/#").await.unwrap();
        matching.sort_by(|a, b| a.topic.cmp(&b.topic));
        assert_eq!(matching.len(), 2);
        assert_eq!(matching[0].topic, "lamp/1");
        assert_eq!(matching[1].topic, "lamp/2");

        assert_eq!(store.get_matching("#").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let store = LocalRetainStore::new();

        store
            .store("t", Bytes::from("v1"), QoS::AtMostOnce)
            .await
            .unwrap();
        store
            .store("t", Bytes::from("v2"), QoS::AtLeastOnce)
            .await
            .unwrap();

        let msg = store.get("t").await.unwrap().unwrap();
        assert_eq!(msg.payload, Bytes::from("v2"));
        assert_eq!(msg.qos, QoS::AtLeastOnce);
        assert_eq!(store.len(), 1);
    }
}
