//! Cluster coordination
//!
//! Broker-to-broker traffic rides the shared store's pub/sub channels:
//!
//! - **Broadcast** (`dynamq:cluster:publish`): every publication, repeated by
//!   each node against its local subscribers
//! - **Per-node** (`dynamq:node:{nodeId}`): addressed unicast deliveries
//! - **Eviction** (`dynamq:cluster:kick`): duplicate-client kick commands
//!
//! Node liveness is tracked separately through heartbeat keys and the
//! active-nodes set.

pub mod messages;

mod health;
mod router;

pub use health::{NodeEvent, NodeHealthMonitor};
pub use router::{ClusterInboundCallback, ClusterRouter};
