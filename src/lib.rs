//! DynaMQ - clustered MQTT 3.1.1 broker
//!
//! Broker nodes coordinate through a shared Redis store: session ownership,
//! retained messages and node membership live in keys, broker-to-broker
//! traffic rides pub/sub channels. A single node runs fine without the
//! store, degrading to local-only routing.

pub mod admission;
pub mod auth;
pub mod broker;
pub mod buffer_pool;
pub mod bus;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod context;
pub mod metrics;
pub mod protocol;
pub mod retain;
pub mod session;
pub mod shared;
pub mod sink;
pub mod topic;
pub mod transport;

pub use admission::{AdmissionControl, AdmissionDenied};
pub use auth::{Action, AllowAllPermissions, PermissionProvider, StaticPermissions};
pub use broker::{Broker, Connection, ConnectionError};
pub use cluster::{ClusterRouter, NodeEvent, NodeHealthMonitor};
pub use config::Config;
pub use context::BrokerContext;
pub use metrics::{Metrics, MetricsServer};
pub use protocol::QoS;
pub use retain::{LocalRetainStore, RetainStore, SharedRetainStore};
pub use session::{ClientSession, LocalSessionManager, SessionManager, SharedSessionManager};
pub use shared::{SharedStore, StoreError};
pub use sink::{NoopSink, RouteTable, Sink};
pub use topic::SubscriptionIndex;
