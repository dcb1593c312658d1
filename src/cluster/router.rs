//! Cluster message router
//!
//! Routes publications between broker nodes. Broadcasts go to every node;
//! targeted deliveries resolve the owning node first and either short-circuit
//! onto the in-process bus or cross the store on the peer's channel. With
//! cluster mode disabled the router collapses to local delivery only.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use super::messages::{decode_payload, encode_payload, BroadcastMessage, UnicastMessage};
use crate::bus::{Delivery, LocalBus};
use crate::protocol::QoS;
use crate::session::SessionManager;
use crate::shared::{SharedStore, StoreError};

const CLUSTER_PUBLISH_CHANNEL: &str = "dynamq:cluster:publish";
const NODE_CHANNEL_PREFIX: &str = "dynamq:node:";

/// Invoked for every broadcast received from a peer node:
/// (topic, payload, qos, retain, excludeClientId)
pub type ClusterInboundCallback =
    Arc<dyn Fn(Arc<str>, Bytes, QoS, bool, Option<String>) + Send + Sync>;

pub struct ClusterRouter {
    node_id: String,
    enabled: bool,
    store: Option<Arc<SharedStore>>,
    sessions: Arc<dyn SessionManager>,
    bus: Arc<LocalBus>,
}

impl ClusterRouter {
    pub fn new(
        node_id: &str,
        store: Option<Arc<SharedStore>>,
        sessions: Arc<dyn SessionManager>,
        bus: Arc<LocalBus>,
    ) -> Self {
        let enabled = store.is_some();
        if enabled {
            info!("Cluster message router initialized for node: {}", node_id);
        } else {
            info!("Cluster mode disabled, router running local-only");
        }

        Self {
            node_id: node_id.to_string(),
            enabled,
            store,
            sessions,
            bus,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Subscribe to the broadcast channel and this node's unicast channel.
    /// `inbound` repeats local fan-out for peer broadcasts.
    pub fn start(&self, inbound: ClusterInboundCallback) -> Option<tokio::task::JoinHandle<()>> {
        let store = self.store.as_ref()?;

        let node_id = self.node_id.clone();
        let node_channel = format!("{}{}", NODE_CHANNEL_PREFIX, node_id);
        let bus = self.bus.clone();

        Some(store.subscribe(
            vec![CLUSTER_PUBLISH_CHANNEL.to_string(), node_channel.clone()],
            Arc::new(move |channel, payload| {
                if channel == CLUSTER_PUBLISH_CHANNEL {
                    let msg: BroadcastMessage = match serde_json::from_str(payload) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("Failed to parse cluster broadcast: {}", e);
                            return;
                        }
                    };

                    // Skip our own broadcasts
                    if msg.source_node == node_id {
                        return;
                    }

                    debug!(
                        "Cluster broadcast from {}: topic={}",
                        msg.source_node, msg.topic
                    );
                    let qos = QoS::from_u8(msg.qos).unwrap_or(QoS::AtMostOnce);
                    inbound(
                        Arc::from(msg.topic.as_str()),
                        decode_payload(&msg.payload),
                        qos,
                        msg.retain,
                        msg.exclude_client_id,
                    );
                } else {
                    let msg: UnicastMessage = match serde_json::from_str(payload) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("Failed to parse unicast delivery: {}", e);
                            return;
                        }
                    };

                    debug!(
                        "Unicast from {} for client {}: topic={}",
                        msg.source_node, msg.client_id, msg.topic
                    );
                    let qos = QoS::from_u8(msg.qos).unwrap_or(QoS::AtMostOnce);
                    bus.deliver(
                        &msg.client_id,
                        Delivery {
                            topic: Arc::from(msg.topic.as_str()),
                            payload: decode_payload(&msg.payload),
                            qos,
                            retain: msg.retain,
                        },
                    );
                }
            }),
        ))
    }

    /// Broadcast a publication to every peer node. No-op when cluster mode
    /// is disabled.
    pub async fn broadcast(
        &self,
        topic: &str,
        payload: &Bytes,
        qos: QoS,
        retain: bool,
        exclude_client_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let store = match (&self.store, self.enabled) {
            (Some(store), true) => store,
            _ => return Ok(()),
        };

        let msg = BroadcastMessage {
            topic: topic.to_string(),
            payload: encode_payload(payload),
            qos: qos as u8,
            retain,
            exclude_client_id: exclude_client_id.map(|s| s.to_string()),
            source_node: self.node_id.clone(),
        };
        let json = serde_json::to_string(&msg).map_err(|e| StoreError::Command(e.to_string()))?;

        store.publish(CLUSTER_PUBLISH_CHANNEL, &json).await?;
        debug!("Broadcast to cluster channel: topic={}", topic);
        Ok(())
    }

    /// Route a message to a client wherever it is connected
    pub async fn route_to_client(
        &self,
        client_id: &str,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), StoreError> {
        if !self.enabled {
            self.deliver_locally(client_id, topic, payload, qos, retain);
            return Ok(());
        }

        let target = match self.sessions.get_client_node(client_id).await? {
            Some(node) => node,
            None => {
                debug!("Client {} not found in cluster", client_id);
                return Ok(());
            }
        };

        if target == self.node_id {
            self.deliver_locally(client_id, topic, payload, qos, retain);
            return Ok(());
        }

        self.forward_to_node(&target, client_id, topic, payload, qos, retain)
            .await
    }

    fn deliver_locally(&self, client_id: &str, topic: &str, payload: Bytes, qos: QoS, retain: bool) {
        let delivered = self.bus.deliver(
            client_id,
            Delivery {
                topic: Arc::from(topic),
                payload,
                qos,
                retain,
            },
        );
        if delivered {
            debug!("Delivered message to {}: topic={}", client_id, topic);
        }
    }

    async fn forward_to_node(
        &self,
        target_node: &str,
        client_id: &str,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), StoreError> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(()),
        };

        let msg = UnicastMessage {
            client_id: client_id.to_string(),
            topic: topic.to_string(),
            payload: encode_payload(&payload),
            qos: qos as u8,
            retain,
            source_node: self.node_id.clone(),
        };
        let json = serde_json::to_string(&msg).map_err(|e| StoreError::Command(e.to_string()))?;

        let channel = format!("{}{}", NODE_CHANNEL_PREFIX, target_node);
        match store.publish(&channel, &json).await {
            Ok(()) => {
                debug!("Forwarded to {}: clientId={}", channel, client_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to forward to node {}: {}", target_node, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ClientCommand;
    use crate::session::LocalSessionManager;

    fn local_router(bus: Arc<LocalBus>) -> ClusterRouter {
        let sessions = Arc::new(LocalSessionManager::new("n1", bus.clone()));
        ClusterRouter::new("n1", None, sessions, bus)
    }

    #[tokio::test]
    async fn test_local_fallback_delivers_via_bus() {
        let bus = Arc::new(LocalBus::new());
        let router = local_router(bus.clone());
        assert!(!router.is_enabled());

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        bus.register(Arc::from("c1"), tx);

        router
            .route_to_client("c1", "a/b", Bytes::from("x"), QoS::AtLeastOnce, false)
            .await
            .unwrap();

        match rx.recv().await {
            Some(ClientCommand::Deliver(d)) => {
                assert_eq!(d.topic.as_ref(), "a/b");
                assert_eq!(d.payload, Bytes::from("x"));
                assert_eq!(d.qos, QoS::AtLeastOnce);
            }
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_fallback_broadcast_is_noop() {
        let bus = Arc::new(LocalBus::new());
        let router = local_router(bus);

        // With cluster mode off a broadcast simply succeeds
        router
            .broadcast("t", &Bytes::from("x"), QoS::AtMostOnce, false, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_client_is_dropped() {
        let bus = Arc::new(LocalBus::new());
        let router = local_router(bus);

        router
            .route_to_client("ghost", "t", Bytes::new(), QoS::AtMostOnce, false)
            .await
            .unwrap();
    }
}
