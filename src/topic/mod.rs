//! Subscription index
//!
//! Maintains the set of active subscriptions and answers, for any concrete
//! topic, which clients are subscribed and at what granted QoS. Built on a
//! topic trie whose nodes carry `clientId -> grantedQoS` maps, plus a reverse
//! map for per-client enumeration.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::collections::HashSet;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::protocol::QoS;

#[derive(Default)]
struct IndexInner {
    /// filter -> (clientId -> grantedQoS)
    trie: TopicTrie<AHashMap<Arc<str>, QoS>>,
    /// clientId -> set of filters, for removeAll and enumeration
    by_client: AHashMap<Arc<str>, HashSet<Arc<str>>>,
}

/// Thread-safe subscription index
pub struct SubscriptionIndex {
    inner: RwLock<IndexInner>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner {
                trie: TopicTrie::new(),
                by_client: AHashMap::new(),
            }),
        }
    }

    /// Add a subscription. Idempotent: a repeat subscribe to the same exact
    /// filter replaces the granted QoS.
    pub fn add(&self, client_id: &Arc<str>, filter: &str, qos: QoS) {
        let mut inner = self.inner.write();

        if let Some(subs) = inner.trie.get_mut(filter) {
            subs.insert(client_id.clone(), qos);
        } else {
            let mut subs = AHashMap::with_capacity(1);
            subs.insert(client_id.clone(), qos);
            inner.trie.insert(filter, subs);
        }

        inner
            .by_client
            .entry(client_id.clone())
            .or_default()
            .insert(Arc::from(filter));
    }

    /// Remove one subscription. No-op if absent.
    pub fn remove(&self, client_id: &str, filter: &str) {
        let mut inner = self.inner.write();

        let now_empty = if let Some(subs) = inner.trie.get_mut(filter) {
            subs.remove(client_id);
            subs.is_empty()
        } else {
            false
        };
        if now_empty {
            inner.trie.remove(filter);
        }

        let client_empty = if let Some(filters) = inner.by_client.get_mut(client_id) {
            filters.remove(filter);
            filters.is_empty()
        } else {
            false
        };
        if client_empty {
            inner.by_client.remove(client_id);
        }
    }

    /// Remove every subscription owned by the client
    pub fn remove_all(&self, client_id: &str) {
        let mut inner = self.inner.write();

        if inner.by_client.remove(client_id).is_some() {
            inner.trie.remove_by_predicate(|subs| {
                subs.remove(client_id);
                subs.is_empty()
            });
        }
    }

    /// Compute the subscriber set for a published topic.
    /// When a client appears under multiple matching filters, the highest
    /// granted QoS wins.
    pub fn matches(&self, topic: &str) -> AHashMap<Arc<str>, QoS> {
        let inner = self.inner.read();
        let mut result: AHashMap<Arc<str>, QoS> = AHashMap::new();

        inner.trie.matches(topic, |subs| {
            for (client_id, qos) in subs {
                let entry = result.entry(client_id.clone()).or_insert(*qos);
                if *qos > *entry {
                    *entry = *qos;
                }
            }
        });

        result
    }

    /// Enumerate the filters a client subscribes to
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<Arc<str>> {
        let inner = self.inner.read();
        inner
            .by_client
            .get(client_id)
            .map(|filters| filters.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of (client, filter) subscription pairs
    pub fn subscription_count(&self) -> usize {
        let inner = self.inner.read();
        inner.by_client.values().map(|f| f.len()).sum()
    }
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str) -> Arc<str> {
        Arc::from(id)
    }

    #[test]
    fn test_add_and_match() {
        let index = SubscriptionIndex::new();
        let a = client("a");

        index.add(&a, "sensors/+/temp", QoS::AtLeastOnce);

        let matches = index.matches("sensors/room1/temp");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches.get("a"), Some(&QoS::AtLeastOnce));

        assert!(index.matches("sensors/room1/humidity").is_empty());
    }

    #[test]
    fn test_repeat_subscribe_replaces_grant() {
        let index = SubscriptionIndex::new();
        let a = client("a");

        index.add(&a, "t/1", QoS::AtMostOnce);
        index.add(&a, "t/1", QoS::ExactlyOnce);

        assert_eq!(index.subscriptions_of("a").len(), 1);
        assert_eq!(index.matches("t/1").get("a"), Some(&QoS::ExactlyOnce));
    }

    #[test]
    fn test_highest_qos_wins_across_filters() {
        let index = SubscriptionIndex::new();
        let a = client("a");

        index.add(&a, "t/#", QoS::AtMostOnce);
        index.add(&a, "t/1", QoS::ExactlyOnce);

        let matches = index.matches("t/1");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches.get("a"), Some(&QoS::ExactlyOnce));
    }

    #[test]
    fn test_add_remove_is_identity() {
        let index = SubscriptionIndex::new();
        let a = client("a");

        index.add(&a, "x/y", QoS::AtLeastOnce);
        index.remove("a", "x/y");

        assert!(index.matches("x/y").is_empty());
        assert!(index.subscriptions_of("a").is_empty());
        assert_eq!(index.subscription_count(), 0);

        // Removing again is a no-op
        index.remove("a", "x/y");
    }

    #[test]
    fn test_remove_all() {
        let index = SubscriptionIndex::new();
        let a = client("a");
        let b = client("b");

        index.add(&a, "x/1", QoS::AtMostOnce);
        index.add(&a, "x/2", QoS::AtLeastOnce);
        index.add(&b, "x/1", QoS::AtLeastOnce);

        index.remove_all("a");

        assert!(index.subscriptions_of("a").is_empty());
        let matches = index.matches("x/1");
        assert_eq!(matches.len(), 1);
        assert!(matches.contains_key("b"));
    }

    #[test]
    fn test_multiple_clients_same_filter() {
        let index = SubscriptionIndex::new();
        let a = client("a");
        let b = client("b");

        index.add(&a, "shared/topic", QoS::AtMostOnce);
        index.add(&b, "shared/topic", QoS::ExactlyOnce);

        let matches = index.matches("shared/topic");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches.get("a"), Some(&QoS::AtMostOnce));
        assert_eq!(matches.get("b"), Some(&QoS::ExactlyOnce));
    }

    #[test]
    fn test_hash_filter_matches_everything() {
        let index = SubscriptionIndex::new();
        let a = client("a");

        index.add(&a, "#", QoS::AtMostOnce);

        assert!(index.matches("x").contains_key("a"));
        assert!(index.matches("x/y/z").contains_key("a"));
        // but not $-topics
        assert!(!index.matches("$SYS/uptime").contains_key("a"));
    }
}
