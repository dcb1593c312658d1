//! Node health and membership
//!
//! Every node writes a heartbeat key with a short TTL and registers itself in
//! the active-nodes set. A second ticker reads peer heartbeats: a missing key
//! marks the peer failed (removed from the set, `Left` event), an unknown
//! live peer produces a `Joined` event.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::session::now_millis;
use crate::shared::SharedStore;

const NODE_HEARTBEAT_KEY_PREFIX: &str = "dynamq:node:";
const NODE_METRICS_KEY_PREFIX: &str = "dynamq:node:metrics:";
const ACTIVE_NODES_KEY: &str = "dynamq:nodes:active";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Heartbeat TTL is about three tick intervals
const NODE_TIMEOUT_SECS: u64 = 15;

/// Membership change observed by this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Joined(String),
    Left(String),
}

pub struct NodeHealthMonitor {
    store: Arc<SharedStore>,
    node_id: String,
    events: broadcast::Sender<NodeEvent>,
    /// Peer id -> last seen epoch millis
    known_nodes: Arc<DashMap<String, u64>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl NodeHealthMonitor {
    pub fn new(store: Arc<SharedStore>, node_id: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        info!("Node health monitor initialized for node: {}", node_id);
        Self {
            store,
            node_id: node_id.to_string(),
            events,
            known_nodes: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Subscribe to membership events
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Start the heartbeat and peer-check tickers
    pub async fn start(&self) {
        // Register immediately so peers see us before the first tick
        Self::publish_heartbeat(&self.store, &self.node_id).await;

        let store = self.store.clone();
        let node_id = self.node_id.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // skip the immediate tick
            loop {
                ticker.tick().await;
                Self::publish_heartbeat(&store, &node_id).await;
            }
        });

        let store = self.store.clone();
        let node_id = self.node_id.clone();
        let known = self.known_nodes.clone();
        let events = self.events.clone();
        let check_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECK_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                Self::check_nodes(&store, &node_id, &known, &events).await;
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(heartbeat_task);
        tasks.push(check_task);

        info!("Node health monitor started for node: {}", self.node_id);
    }

    /// Cancel the tickers and unregister this node
    pub async fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let node_key = format!("{}{}", NODE_HEARTBEAT_KEY_PREFIX, self.node_id);
        let metrics_key = format!("{}{}", NODE_METRICS_KEY_PREFIX, self.node_id);
        if let Err(e) = self.store.del(&[&node_key, &metrics_key]).await {
            error!("Failed to delete heartbeat key: {}", e);
        }
        if let Err(e) = self.store.srem(ACTIVE_NODES_KEY, &self.node_id).await {
            error!("Failed to leave active-nodes set: {}", e);
        }

        info!("Node health monitor stopped for node: {}", self.node_id);
    }

    /// Every node currently in the active set
    pub async fn active_nodes(&self) -> Vec<String> {
        self.store
            .smembers(ACTIVE_NODES_KEY)
            .await
            .unwrap_or_default()
    }

    pub async fn is_node_alive(&self, target_node_id: &str) -> bool {
        let node_key = format!("{}{}", NODE_HEARTBEAT_KEY_PREFIX, target_node_id);
        self.store.exists(&node_key).await.unwrap_or(false)
    }

    async fn publish_heartbeat(store: &SharedStore, node_id: &str) {
        let node_key = format!("{}{}", NODE_HEARTBEAT_KEY_PREFIX, node_id);
        let timestamp = now_millis();

        if let Err(e) = store
            .set_ex(&node_key, &timestamp.to_string(), NODE_TIMEOUT_SECS)
            .await
        {
            error!("Failed to publish heartbeat: {}", e);
            return;
        }
        trace!("Heartbeat published for node: {}", node_id);

        // Memory snapshot rides a sibling key with the same TTL
        let metrics_key = format!("{}{}", NODE_METRICS_KEY_PREFIX, node_id);
        let metrics = json!({
            "rssBytes": rss_bytes(),
            "timestamp": timestamp,
        });
        if let Err(e) = store
            .set_ex(&metrics_key, &metrics.to_string(), NODE_TIMEOUT_SECS)
            .await
        {
            error!("Failed to store node metrics: {}", e);
        }

        if let Err(e) = store.sadd(ACTIVE_NODES_KEY, node_id).await {
            error!("Failed to join active-nodes set: {}", e);
        }
    }

    async fn check_nodes(
        store: &SharedStore,
        node_id: &str,
        known: &DashMap<String, u64>,
        events: &broadcast::Sender<NodeEvent>,
    ) {
        let registered = match store.smembers(ACTIVE_NODES_KEY).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!("Failed to get registered nodes: {}", e);
                return;
            }
        };

        // A peer another node already pruned from the active set still needs
        // its Left event here
        let vanished: Vec<String> = known
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|peer| !registered.contains(peer))
            .collect();
        for peer in vanished {
            warn!("Node left: {}", peer);
            known.remove(&peer);
            let _ = events.send(NodeEvent::Left(peer));
        }

        for peer in registered {
            if peer == node_id {
                continue;
            }

            let peer_key = format!("{}{}", NODE_HEARTBEAT_KEY_PREFIX, peer);
            match store.get(&peer_key).await {
                Ok(Some(_)) => {
                    let is_new = !known.contains_key(&peer);
                    known.insert(peer.clone(), now_millis());
                    if is_new {
                        info!("Node discovered: {}", peer);
                        let _ = events.send(NodeEvent::Joined(peer));
                    }
                }
                Ok(None) => {
                    // Heartbeat expired: the peer is considered dead
                    warn!("Node failure detected: {}", peer);
                    known.remove(&peer);
                    if let Err(e) = store.srem(ACTIVE_NODES_KEY, &peer).await {
                        error!("Failed to remove failed node from active set: {}", e);
                    } else {
                        debug!("Removed failed node from active set: {}", peer);
                    }
                    let _ = events.send(NodeEvent::Left(peer));
                }
                Err(e) => error!("Failed to check node health: {}: {}", peer, e),
            }
        }
    }
}

/// Resident set size of this process, best effort
fn rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    let kb: u64 = rest
                        .trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse()
                        .unwrap_or(0);
                    return kb * 1024;
                }
            }
        }
    }
    0
}
