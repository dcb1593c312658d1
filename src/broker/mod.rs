//! Broker core
//!
//! Owns the listeners, the accept loops and graceful shutdown, and provides
//! the publication pipeline shared by client publishes, will messages and
//! cluster-inbound broadcasts.

mod connection;
pub mod tls;

pub use connection::{Connection, ConnectionError};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::context::BrokerContext;
use crate::protocol::QoS;
use crate::transport::WsStream;

/// How long shutdown may take before the process force-exits
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Fan a publication out to this node's local subscribers.
/// `exclude` skips the original publisher when repeating a peer broadcast.
pub(crate) async fn fan_out_local(
    ctx: &Arc<BrokerContext>,
    topic: &str,
    payload: &Bytes,
    publish_qos: QoS,
    exclude: Option<&str>,
) {
    let matches = ctx.subscriptions.matches(topic);

    for (client_id, granted_qos) in matches {
        if exclude == Some(client_id.as_ref()) {
            continue;
        }

        let effective_qos = publish_qos.min(granted_qos);
        let delivery = crate::bus::Delivery {
            topic: Arc::from(topic),
            payload: payload.clone(),
            qos: effective_qos,
            retain: false,
        };

        if ctx.bus.deliver(&client_id, delivery) {
            continue;
        }

        // Not attached here: resolve ownership and forward
        if let Err(e) = ctx
            .router
            .route_to_client(&client_id, topic, payload.clone(), effective_qos, false)
            .await
        {
            warn!("Failed to route to {}: {}", client_id, e);
        }
    }
}

/// The full publication pipeline: retained store, local fan-out, cluster
/// broadcast, external sink. Runs for client publishes and will messages.
pub(crate) async fn publish_message(
    ctx: &Arc<BrokerContext>,
    source_client: &str,
    topic: &str,
    payload: &Bytes,
    qos: QoS,
    retain: bool,
) {
    if retain {
        if let Err(e) = ctx.retained.store(topic, payload.clone(), qos).await {
            error!("Failed to update retained store for {}: {}", topic, e);
        }
        ctx.metrics
            .retained_messages_current
            .set(ctx.retained.len() as i64);
    }

    fan_out_local(ctx, topic, payload, qos, None).await;

    if let Err(e) = ctx
        .router
        .broadcast(topic, payload, qos, retain, Some(source_client))
        .await
    {
        warn!("Cluster broadcast failed for {}: {}", topic, e);
    } else if ctx.router.is_enabled() {
        ctx.metrics.cluster_broadcasts_sent.inc();
    }

    if ctx.routes.should_forward(topic) {
        if let Err(e) = ctx.sink.publish(source_client, topic, payload).await {
            warn!("Sink publish failed for {}: {}", topic, e);
        }
    }
}

/// The MQTT broker
pub struct Broker {
    ctx: Arc<BrokerContext>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(ctx: Arc<BrokerContext>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self { ctx, shutdown }
    }

    pub fn context(&self) -> &Arc<BrokerContext> {
        &self.ctx
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Run until shutdown is signalled, then tear down
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let mut shutdown_rx = self.shutdown.subscribe();

        // Peer broadcasts repeat local fan-out, skipping the original
        // publisher
        let inbound_ctx = self.ctx.clone();
        if let Some(task) = self.ctx.router.start(Arc::new(move |topic, payload, qos, _retain, exclude| {
            let ctx = inbound_ctx.clone();
            ctx.metrics.cluster_messages_received.inc();
            tokio::spawn(async move {
                fan_out_local(&ctx, &topic, &payload, qos, exclude.as_deref()).await;
            });
        })) {
            self.ctx.track_task(task);
        }

        if let Some(health) = &self.ctx.health {
            health.start().await;
        }

        // Plain TCP listener
        let listener = TcpListener::bind(self.ctx.config.server.bind).await?;
        info!("MQTT/TCP listening on {}", self.ctx.config.server.bind);
        let tcp_task = self.spawn_tcp_accept_loop(listener);
        self.ctx.track_task(tcp_task);

        // TLS listener
        if let Some(tls_bind) = self.ctx.config.server.tls_bind {
            let tls_config = self
                .ctx
                .config
                .server
                .tls
                .as_ref()
                .expect("validated at config load");
            let acceptor = tls::load_tls_config(tls_config)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            let listener = TcpListener::bind(tls_bind).await?;
            info!("MQTT/TLS listening on {}", tls_bind);
            let task = self.spawn_tls_accept_loop(listener, acceptor);
            self.ctx.track_task(task);
        }

        // WebSocket listener
        if let Some(ws_bind) = self.ctx.config.server.ws_bind {
            let listener = TcpListener::bind(ws_bind).await?;
            info!(
                "MQTT/WebSocket listening on {} (path: {})",
                ws_bind, self.ctx.config.server.ws_path
            );
            let task = self.spawn_ws_accept_loop(listener);
            self.ctx.track_task(task);
        }

        // Metrics endpoint
        if self.ctx.config.metrics.enabled {
            let server =
                crate::metrics::MetricsServer::new(self.ctx.metrics.clone(), self.ctx.config.metrics.bind);
            let task = tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!("Metrics server error: {}", e);
                }
            });
            self.ctx.track_task(task);
        }

        // Block until shutdown
        let _ = shutdown_rx.recv().await;

        self.teardown().await;
        Ok(())
    }

    /// Stop accepting, close live sessions without frames, cancel tickers,
    /// unregister from the cluster
    async fn teardown(&self) {
        info!("Broker shutting down");

        // Close each live session; handlers see Kick and exit silently
        for client_id in self.ctx.bus.client_ids() {
            self.ctx.bus.kick(&client_id);
        }

        // Give handlers a moment to drain before tickers die
        tokio::time::sleep(Duration::from_millis(100)).await;

        if let Some(health) = &self.ctx.health {
            health.stop().await;
        }

        self.ctx.abort_background_tasks();
        info!("Broker stopped");
    }

    fn spawn_tcp_accept_loop(&self, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        spawn_connection(ctx.clone(), shutdown.subscribe(), stream, addr);
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                }
            }
        })
    }

    fn spawn_tls_accept_loop(
        &self,
        listener: TcpListener,
        acceptor: tokio_rustls::TlsAcceptor,
    ) -> tokio::task::JoinHandle<()> {
        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("New TLS connection from {}", addr);
                        let acceptor = acceptor.clone();
                        let ctx = ctx.clone();
                        let shutdown_rx = shutdown.subscribe();

                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    run_connection(ctx, shutdown_rx, tls_stream, addr).await;
                                }
                                Err(e) => {
                                    debug!("TLS handshake failed for {}: {}", addr, e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept TLS connection: {}", e);
                    }
                }
            }
        })
    }

    fn spawn_ws_accept_loop(&self, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("New WebSocket connection from {}", addr);
                        let ctx = ctx.clone();
                        let shutdown_rx = shutdown.subscribe();
                        let ws_path = ctx.config.server.ws_path.clone();

                        tokio::spawn(async move {
                            match WsStream::accept_with_path(stream, &ws_path).await {
                                Ok(ws_stream) => {
                                    run_connection(ctx, shutdown_rx, ws_stream, addr).await;
                                }
                                Err(e) => {
                                    debug!("WebSocket handshake failed for {}: {}", addr, e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept WebSocket connection: {}", e);
                    }
                }
            }
        })
    }
}

fn spawn_connection(
    ctx: Arc<BrokerContext>,
    shutdown_rx: broadcast::Receiver<()>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    tokio::spawn(async move {
        run_connection(ctx, shutdown_rx, stream, addr).await;
    });
}

async fn run_connection<S>(
    ctx: Arc<BrokerContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
    stream: S,
    addr: SocketAddr,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let admission = ctx.admission.try_acquire(addr.ip());
    if admission.is_err() {
        ctx.metrics.connections_rejected_total.inc();
    }

    let mut conn = Connection::new(stream, addr, ctx, admission.ok());

    {
        let conn_fut = conn.run();
        tokio::pin!(conn_fut);

        loop {
            tokio::select! {
                biased;

                result = &mut conn_fut => {
                    if let Err(e) = result {
                        debug!("Connection error from {}: {}", addr, e);
                    }
                    break;
                }
                result = shutdown_rx.recv() => {
                    match result {
                        Ok(()) => {
                            debug!("Connection {} shutting down", addr);
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
    }

    conn.return_buffers();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ClientCommand;
    use crate::config::Config;
    use crate::protocol::QoS;

    async fn test_context() -> Arc<BrokerContext> {
        let mut config = Config::default();
        config.redis.enabled = false;
        config.limits.rate_limit_enabled = false;
        BrokerContext::initialize(config).await
    }

    #[tokio::test]
    async fn test_fan_out_reaches_matching_subscribers() {
        let ctx = test_context().await;

        let a: Arc<str> = Arc::from("sub-a");
        let b: Arc<str> = Arc::from("sub-b");
        let (tx_a, mut rx_a) = tokio::sync::mpsc::channel(4);
        let (tx_b, mut rx_b) = tokio::sync::mpsc::channel(4);
        ctx.bus.register(a.clone(), tx_a);
        ctx.bus.register(b.clone(), tx_b);

        ctx.subscriptions.add(&a, "t/#", QoS::AtLeastOnce);
        ctx.subscriptions.add(&b, "other", QoS::AtMostOnce);

        fan_out_local(&ctx, "t/1", &Bytes::from("x"), QoS::AtLeastOnce, None).await;

        match rx_a.try_recv() {
            Ok(ClientCommand::Deliver(d)) => {
                assert_eq!(d.topic.as_ref(), "t/1");
                assert_eq!(d.qos, QoS::AtLeastOnce);
            }
            other => panic!("expected delivery for sub-a, got {:?}", other),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fan_out_skips_excluded_publisher() {
        let ctx = test_context().await;

        let a: Arc<str> = Arc::from("origin");
        let b: Arc<str> = Arc::from("peer-sub");
        let (tx_a, mut rx_a) = tokio::sync::mpsc::channel(4);
        let (tx_b, mut rx_b) = tokio::sync::mpsc::channel(4);
        ctx.bus.register(a.clone(), tx_a);
        ctx.bus.register(b.clone(), tx_b);

        ctx.subscriptions.add(&a, "t/#", QoS::AtMostOnce);
        ctx.subscriptions.add(&b, "t/#", QoS::AtMostOnce);

        // A peer broadcast excludes the original publisher
        fan_out_local(&ctx, "t/1", &Bytes::from("x"), QoS::AtMostOnce, Some("origin")).await;

        assert!(rx_a.try_recv().is_err());
        assert!(matches!(
            rx_b.try_recv(),
            Ok(ClientCommand::Deliver(_))
        ));
    }

    #[tokio::test]
    async fn test_fan_out_downgrades_qos() {
        let ctx = test_context().await;

        let a: Arc<str> = Arc::from("low-sub");
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        ctx.bus.register(a.clone(), tx);
        ctx.subscriptions.add(&a, "q/t", QoS::AtMostOnce);

        fan_out_local(&ctx, "q/t", &Bytes::from("x"), QoS::ExactlyOnce, None).await;

        match rx.try_recv() {
            Ok(ClientCommand::Deliver(d)) => assert_eq!(d.qos, QoS::AtMostOnce),
            other => panic!("expected delivery, got {:?}", other),
        }
    }
}
