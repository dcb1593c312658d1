//! Prometheus metrics
//!
//! Exposes broker counters at /metrics and periodically persists fleet-level
//! deltas into the shared store for the admin surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use tracing::{debug, error};

use crate::shared::SharedStore;

mod server;

pub use server::MetricsServer;

const METRICS_KEY_PREFIX: &str = "dynamq:metrics:";
const FLUSH_INTERVAL: Duration = Duration::from_secs(15);

/// All broker metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_current: IntGauge,
    pub connections_rejected_total: IntCounter,

    // Message metrics
    pub messages_received_total: IntCounter,
    pub messages_sent_total: IntCounter,
    pub bytes_received_total: IntCounter,
    pub bytes_sent_total: IntCounter,
    pub messages_dropped_total: IntCounter,

    // Subscription metrics
    pub subscriptions_current: IntGauge,

    // Retained messages
    pub retained_messages_current: IntGauge,

    // QoS metrics
    pub retransmits_total: IntCounter,

    // Cluster metrics
    pub cluster_broadcasts_sent: IntCounter,
    pub cluster_messages_received: IntCounter,
}

macro_rules! register {
    ($registry:expr, $metric:expr) => {{
        let metric = $metric.unwrap();
        $registry.register(Box::new(metric.clone())).unwrap();
        metric
    }};
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = register!(
            registry,
            IntCounter::with_opts(Opts::new(
                "dynamq_connections_total",
                "Total client connections since startup",
            ))
        );
        let connections_current = register!(
            registry,
            IntGauge::with_opts(Opts::new(
                "dynamq_connections_current",
                "Currently connected clients",
            ))
        );
        let connections_rejected_total = register!(
            registry,
            IntCounter::with_opts(Opts::new(
                "dynamq_connections_rejected_total",
                "Connections refused by admission control",
            ))
        );
        let messages_received_total = register!(
            registry,
            IntCounter::with_opts(Opts::new(
                "dynamq_messages_received_total",
                "Total PUBLISH packets received",
            ))
        );
        let messages_sent_total = register!(
            registry,
            IntCounter::with_opts(Opts::new(
                "dynamq_messages_sent_total",
                "Total PUBLISH packets sent",
            ))
        );
        let bytes_received_total = register!(
            registry,
            IntCounter::with_opts(Opts::new(
                "dynamq_bytes_received_total",
                "Total payload bytes received",
            ))
        );
        let bytes_sent_total = register!(
            registry,
            IntCounter::with_opts(Opts::new(
                "dynamq_bytes_sent_total",
                "Total payload bytes sent",
            ))
        );
        let messages_dropped_total = register!(
            registry,
            IntCounter::with_opts(Opts::new(
                "dynamq_messages_dropped_total",
                "Messages dropped after retry exhaustion or full channels",
            ))
        );
        let subscriptions_current = register!(
            registry,
            IntGauge::with_opts(Opts::new(
                "dynamq_subscriptions_current",
                "Active subscription count",
            ))
        );
        let retained_messages_current = register!(
            registry,
            IntGauge::with_opts(Opts::new(
                "dynamq_retained_messages_current",
                "Retained messages currently stored",
            ))
        );
        let retransmits_total = register!(
            registry,
            IntCounter::with_opts(Opts::new(
                "dynamq_retransmits_total",
                "QoS 1/2 retransmissions",
            ))
        );
        let cluster_broadcasts_sent = register!(
            registry,
            IntCounter::with_opts(Opts::new(
                "dynamq_cluster_broadcasts_sent_total",
                "Publications broadcast to peer nodes",
            ))
        );
        let cluster_messages_received = register!(
            registry,
            IntCounter::with_opts(Opts::new(
                "dynamq_cluster_messages_received_total",
                "Publications received from peer nodes",
            ))
        );

        Self {
            registry,
            connections_total,
            connections_current,
            connections_rejected_total,
            messages_received_total,
            messages_sent_total,
            bytes_received_total,
            bytes_sent_total,
            messages_dropped_total,
            subscriptions_current,
            retained_messages_current,
            retransmits_total,
            cluster_broadcasts_sent,
            cluster_messages_received,
        }
    }

    /// Spawn the periodic delta flush into `dynamq:metrics:{name}` counters
    pub fn start_store_flush(
        self: &Arc<Self>,
        store: Arc<SharedStore>,
    ) -> tokio::task::JoinHandle<()> {
        let metrics = self.clone();
        tokio::spawn(async move {
            let mut flushed = FlushedState::default();
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                flushed.flush(&metrics, &store).await;
            }
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the last flushed counter values so only deltas hit the store
#[derive(Default)]
struct FlushedState {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    connections: AtomicU64,
}

impl FlushedState {
    async fn flush(&self, metrics: &Metrics, store: &SharedStore) {
        let pairs = [
            (
                "messages.received",
                metrics.messages_received_total.get(),
                &self.messages_received,
            ),
            (
                "messages.sent",
                metrics.messages_sent_total.get(),
                &self.messages_sent,
            ),
            (
                "connections.total",
                metrics.connections_total.get(),
                &self.connections,
            ),
        ];

        for (name, current, last) in pairs {
            let previous = last.swap(current, Ordering::Relaxed);
            let delta = current.saturating_sub(previous);
            if delta == 0 {
                continue;
            }
            let key = format!("{}{}", METRICS_KEY_PREFIX, name);
            if let Err(e) = store.incr_by(&key, delta as i64).await {
                error!("Failed to persist metric {}: {}", name, e);
                // Delta lost for this interval
            } else {
                debug!("Flushed metric {} (+{})", name, delta);
            }
        }
    }
}
