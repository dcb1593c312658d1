//! External sink seam
//!
//! Publications can be handed to an external event-stream system. The core
//! only defines the contract and the route table deciding which topics are
//! forwarded; concrete integrations live outside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::messages::RouteSyncMessage;
use crate::shared::SharedStore;
use crate::topic::topic_matches_filter;

const ROUTES_KEY: &str = "dynamq:routes";
const ROUTES_SYNC_CHANNEL: &str = "dynamq:routes:sync";

/// External system publications are forwarded to
#[async_trait]
pub trait Sink: Send + Sync {
    async fn publish(&self, client_id: &str, topic: &str, payload: &Bytes) -> Result<(), String>;
}

/// Sink that drops everything (forwarding disabled)
pub struct NoopSink;

#[async_trait]
impl Sink for NoopSink {
    async fn publish(&self, _: &str, _: &str, _: &Bytes) -> Result<(), String> {
        Ok(())
    }
}

/// A data-routing rule: which published topics reach the sink, and under
/// what target name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRoute {
    pub id: String,
    /// MQTT topic pattern with `+`/`#` wildcards
    pub mqtt_topic_pattern: String,
    /// Target name in the external system
    pub target_topic: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

impl DataRoute {
    pub fn matches(&self, topic: &str) -> bool {
        self.enabled && topic_matches_filter(topic, &self.mqtt_topic_pattern)
    }
}

/// Route table shared across the cluster under `dynamq:routes`, with change
/// notifications on `dynamq:routes:sync`
pub struct RouteTable {
    node_id: String,
    routes: Arc<DashMap<String, DataRoute>>,
}

impl RouteTable {
    pub fn new(node_id: &str, initial: Vec<DataRoute>) -> Self {
        let routes = Arc::new(DashMap::new());
        for route in initial {
            routes.insert(route.id.clone(), route);
        }
        info!("Route table initialized ({} routes)", routes.len());
        Self {
            node_id: node_id.to_string(),
            routes,
        }
    }

    /// Does any enabled route forward this topic? An empty table forwards
    /// everything.
    pub fn should_forward(&self, topic: &str) -> bool {
        if self.routes.is_empty() {
            return true;
        }
        self.routes.iter().any(|route| route.matches(topic))
    }

    /// The first matching route's target name, if any
    pub fn target_for(&self, topic: &str) -> Option<String> {
        self.routes
            .iter()
            .find(|route| route.matches(topic))
            .map(|route| route.target_topic.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Replace the table from the shared-store hash
    pub async fn load_from_store(&self, store: &SharedStore) {
        match store.hgetall(ROUTES_KEY).await {
            Ok(entries) => {
                self.routes.clear();
                for (id, json) in entries {
                    match serde_json::from_str::<DataRoute>(&json) {
                        Ok(route) => {
                            self.routes.insert(id, route);
                        }
                        Err(e) => warn!("Skipping unparsable route {}: {}", id, e),
                    }
                }
                info!("Loaded {} routes from shared store", self.routes.len());
            }
            Err(e) => warn!("Failed to load routes: {}", e),
        }
    }

    /// Reload the table whenever a peer announces a change
    pub fn start_sync(
        self: &Arc<Self>,
        store: Arc<SharedStore>,
    ) -> tokio::task::JoinHandle<()> {
        let node_id = self.node_id.clone();
        let table = self.clone();
        let reload_store = store.clone();

        store.subscribe(
            vec![ROUTES_SYNC_CHANNEL.to_string()],
            Arc::new(move |_channel, payload| {
                let msg: RouteSyncMessage = match serde_json::from_str(payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Failed to parse route sync: {}", e);
                        return;
                    }
                };

                if msg.source_node == node_id {
                    return;
                }

                debug!("Route sync from {}, reloading table", msg.source_node);
                let table = table.clone();
                let store = reload_store.clone();
                tokio::spawn(async move {
                    table.load_from_store(&store).await;
                });
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, pattern: &str, enabled: bool) -> DataRoute {
        DataRoute {
            id: id.to_string(),
            mqtt_topic_pattern: pattern.to_string(),
            target_topic: format!("stream-{}", id),
            enabled,
            description: None,
        }
    }

    #[test]
    fn test_empty_table_forwards_everything() {
        let table = RouteTable::new("n1", vec![]);
        assert!(table.should_forward("any/topic"));
    }

    #[test]
    fn test_routes_filter_topics() {
        let table = RouteTable::new(
            "n1",
            vec![route("a", "sensors/#", true), route("b", "alarms/+", false)],
        );

        assert!(table.should_forward("sensors/room1/temp"));
        assert_eq!(
            table.target_for("sensors/room1/temp"),
            Some("stream-a".to_string())
        );

        // Disabled route does not forward
        assert!(!table.should_forward("alarms/fire"));
        assert!(!table.should_forward("other/topic"));
    }

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoopSink;
        assert!(sink
            .publish("c1", "t", &Bytes::from("payload"))
            .await
            .is_ok());
    }
}
