//! Per-process broker context
//!
//! One `BrokerContext` exists per process; it owns the shared-store handle
//! and the component graph and is threaded into every connection handler.
//! When the shared store is unreachable at startup the context degrades to
//! the local single-node variants.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::admission::AdmissionControl;
use crate::auth::{AllowAllPermissions, PermissionProvider, StaticPermissions};
use crate::bus::LocalBus;
use crate::cluster::{ClusterRouter, NodeHealthMonitor};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::retain::{LocalRetainStore, RetainStore, SharedRetainStore};
use crate::session::{LocalSessionManager, SessionManager, SharedSessionManager};
use crate::shared::SharedStore;
use crate::sink::{NoopSink, RouteTable, Sink};

const CLUSTER_START_TIME_KEY: &str = "dynamq:cluster:start-time";

pub struct BrokerContext {
    pub config: Config,
    pub node_id: String,
    pub shared: Option<Arc<SharedStore>>,
    pub sessions: Arc<dyn SessionManager>,
    pub subscriptions: Arc<crate::topic::SubscriptionIndex>,
    pub retained: Arc<dyn RetainStore>,
    pub router: Arc<ClusterRouter>,
    pub bus: Arc<LocalBus>,
    pub permissions: Arc<dyn PermissionProvider>,
    pub sink: Arc<dyn Sink>,
    pub routes: Arc<RouteTable>,
    pub admission: AdmissionControl,
    pub metrics: Arc<Metrics>,
    pub health: Option<Arc<NodeHealthMonitor>>,
    /// Store-listener and ticker tasks, aborted at shutdown
    background_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BrokerContext {
    /// Wire the component graph from configuration. Falls back to the local
    /// store variants when the shared store is unreachable.
    pub async fn initialize(config: Config) -> Arc<Self> {
        Self::initialize_with_sink(config, Arc::new(NoopSink)).await
    }

    pub async fn initialize_with_sink(config: Config, sink: Arc<dyn Sink>) -> Arc<Self> {
        let node_id = config.node.resolve_id();
        let bus = Arc::new(LocalBus::new());
        let metrics = Arc::new(Metrics::new());

        // Shared store, with single-node degradation on failure
        let shared = if config.redis.enabled {
            match SharedStore::connect(&config.redis.url).await {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    error!(
                        "Shared store unavailable at startup, degrading to single-node: {}",
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut background_tasks = Vec::new();

        // Session manager
        let sessions: Arc<dyn SessionManager> = match &shared {
            Some(store) => {
                let manager = SharedSessionManager::new(
                    store.clone(),
                    &node_id,
                    config.session.expiry,
                    config.session.max_keep_alive as u64,
                    bus.clone(),
                );
                background_tasks.push(manager.start_kick_listener());
                background_tasks.push(manager.start_subscription_sync());
                Arc::new(manager)
            }
            None => Arc::new(LocalSessionManager::new(&node_id, bus.clone())),
        };

        // Retained store
        let retained: Arc<dyn RetainStore> = match &shared {
            Some(store) => {
                let retain = SharedRetainStore::new(store.clone(), &node_id);
                background_tasks.push(retain.start_sync());
                Arc::new(retain)
            }
            None => Arc::new(LocalRetainStore::new()),
        };

        // Cluster router (local-only fallback without a store)
        let router = Arc::new(ClusterRouter::new(
            &node_id,
            shared.clone(),
            sessions.clone(),
            bus.clone(),
        ));

        // Permissions
        let permissions: Arc<dyn PermissionProvider> =
            if config.auth.enabled || config.acl.enabled {
                let provider = StaticPermissions::new(&config.auth, &config.acl);
                if let Some(store) = &shared {
                    provider.load_rules_from_store(store).await;
                }
                info!(
                    "Permissions: auth={}, acl={} ({} rules)",
                    config.auth.enabled,
                    config.acl.enabled,
                    provider.rule_count()
                );
                Arc::new(provider)
            } else {
                Arc::new(AllowAllPermissions)
            };

        // Sink routes
        let routes = Arc::new(RouteTable::new(&node_id, config.routes.clone()));
        if let Some(store) = &shared {
            routes.load_from_store(store).await;
            background_tasks.push(routes.start_sync(store.clone()));
        }

        // Node health (cluster mode only)
        let health = shared
            .as_ref()
            .map(|store| Arc::new(NodeHealthMonitor::new(store.clone(), &node_id)));

        // Record the first node's startup instant, once per cluster
        if let Some(store) = &shared {
            let now = crate::session::now_millis();
            match store.set_nx(CLUSTER_START_TIME_KEY, &now.to_string()).await {
                Ok(true) => info!("Recorded cluster start time"),
                Ok(false) => {}
                Err(e) => warn!("Failed to record cluster start time: {}", e),
            }
            background_tasks.push(metrics.start_store_flush(store.clone()));
        }

        let admission = AdmissionControl::new(
            config.limits.rate_limit_enabled,
            config.limits.max_connections_per_ip,
            config.limits.connect_rate_per_second,
        );

        info!(
            "Broker context initialized: node={}, cluster={}",
            node_id,
            shared.is_some()
        );

        Arc::new(Self {
            config,
            node_id,
            shared,
            sessions,
            subscriptions: Arc::new(crate::topic::SubscriptionIndex::new()),
            retained,
            router,
            bus,
            permissions,
            sink,
            routes,
            admission,
            metrics,
            health,
            background_tasks: Mutex::new(background_tasks),
        })
    }

    /// Track a background task for shutdown
    pub fn track_task(&self, task: tokio::task::JoinHandle<()>) {
        self.background_tasks.lock().push(task);
    }

    /// Abort every tracked background task
    pub fn abort_background_tasks(&self) {
        for task in self.background_tasks.lock().drain(..) {
            task.abort();
        }
    }
}
