//! DynaMQ - clustered MQTT 3.1.1 broker
//!
//! Usage:
//!   dynamq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (TOML)
//!   -b, --bind <ADDR>      MQTT/TCP bind address (default: 0.0.0.0:1883)
//!   -n, --node-id <ID>     Node id (default: generated)
//!   --redis <URL>          Shared store URL, enables cluster mode
//!   -l, --log-level        Log level (error, warn, info, debug, trace)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use dynamq::broker::{Broker, SHUTDOWN_DEADLINE};
use dynamq::config::Config;
use dynamq::context::BrokerContext;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// DynaMQ - clustered MQTT 3.1.1 broker
#[derive(Parser, Debug)]
#[command(name = "dynamq")]
#[command(version)]
#[command(about = "Clustered MQTT 3.1.1 broker coordinated through Redis")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT/TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// MQTT/WebSocket bind address
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Node id (generated when absent)
    #[arg(short, long)]
    node_id: Option<String>,

    /// Shared store URL (redis://...); enables cluster mode
    #[arg(long)]
    redis: Option<String>,

    /// Worker threads (0 = CPU count)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // CLI overrides file config
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(ws_bind) = args.ws_bind {
        config.server.ws_bind = Some(ws_bind);
    }
    if let Some(node_id) = args.node_id {
        config.node.id = Some(node_id);
    }
    if let Some(redis_url) = args.redis {
        config.redis.enabled = true;
        config.redis.url = redis_url;
    }
    if let Some(workers) = args.workers {
        config.server.workers = workers;
    }

    let log_level = args
        .log_level
        .map(LogLevel::to_tracing_level)
        .unwrap_or_else(|| match config.log.level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let workers = if config.server.workers == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        config.server.workers
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        info!("Starting DynaMQ broker");
        info!("  Bind address: {}", config.server.bind);
        if let Some(tls) = &config.server.tls_bind {
            info!("  TLS address: {}", tls);
        }
        if let Some(ws) = &config.server.ws_bind {
            info!("  WebSocket address: {}", ws);
        }
        info!("  Workers: {}", workers);
        info!(
            "  Cluster: {}",
            if config.redis.enabled {
                format!("enabled ({})", config.redis.url)
            } else {
                "disabled".to_string()
            }
        );
        if config.metrics.enabled {
            info!("  Metrics: enabled (http://{}/metrics)", config.metrics.bind);
        }

        let ctx = BrokerContext::initialize(config).await;
        info!("  Node id: {}", ctx.node_id);

        let broker = Arc::new(Broker::new(ctx));

        // Ctrl+C triggers graceful shutdown; a second deadline forces exit
        let signal_broker = broker.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                signal_broker.shutdown();

                tokio::time::sleep(SHUTDOWN_DEADLINE).await;
                error!("Shutdown deadline exceeded, forcing exit");
                std::process::exit(1);
            }
        });

        if let Err(e) = broker.run().await {
            error!("Broker error: {}", e);
            std::process::exit(1);
        }
    });

    Ok(())
}
