//! Shared store client
//!
//! A resilient handle to the Redis instance the cluster coordinates through.
//! Commands run over a multiplexed connection; each `subscribe` call owns a
//! dedicated pub/sub connection driven by a reconnect loop with exponential
//! backoff, so a dropped Redis connection degrades service instead of killing
//! the node.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, error, info, warn};

/// Error surfaced by every shared-store operation
#[derive(Debug)]
pub enum StoreError {
    /// Failed to open or re-open a connection
    Connect(String),
    /// A command failed or timed out
    Command(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Connect(msg) => write!(f, "store connect error: {}", msg),
            StoreError::Command(msg) => write!(f, "store command error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Command(e.to_string())
    }
}

/// Handler invoked for every message received on a subscribed channel:
/// (channel, payload)
pub type MessageHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Reconnect backoff: 500ms doubling up to 30s
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: Duration::from_millis(500),
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Duration::from_secs(30));
        delay
    }

    fn reset(&mut self) {
        self.current = Duration::from_millis(500);
    }
}

/// Shared key-value + pub/sub store client
pub struct SharedStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    url: String,
}

impl SharedStore {
    /// Open a connection to the shared store
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connect(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        info!("Connected to shared store at {}", url);

        Ok(Self {
            client,
            conn,
            url: url.to_string(),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.conn().get(key).await?)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _: () = self.conn().set(key, value).await?;
        Ok(())
    }

    /// SET with a TTL in seconds
    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let _: () = self.conn().set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    /// SETNX: returns true if the key was absent and has been set
    pub async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        Ok(self.conn().set_nx(key, value).await?)
    }

    pub async fn del(&self, keys: &[&str]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let _: () = self.conn().del(keys).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.conn().exists(key).await?)
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let _: () = self.conn().sadd(key, member).await?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let _: () = self.conn().srem(key, member).await?;
        Ok(())
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.conn().smembers(key).await?)
    }

    /// KEYS: enumerate keys by pattern
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.conn().keys(pattern).await?)
    }

    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if keys.len() == 1 {
            // redis-rs collapses single-key MGET replies
            let value: Option<String> = self.conn().get(&keys[0]).await?;
            return Ok(vec![value]);
        }
        Ok(self.conn().mget(keys).await?)
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.conn().hgetall(key).await?)
    }

    pub async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        Ok(self.conn().incr(key, delta).await?)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let _: () = self.conn().publish(channel, payload).await?;
        Ok(())
    }

    /// Subscribe to channels on a dedicated connection. The handler runs for
    /// every message until the returned task is aborted; connection loss
    /// triggers reconnect with backoff.
    pub fn subscribe(
        &self,
        channels: Vec<String>,
        handler: MessageHandler,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::new();

            loop {
                match Self::subscribe_and_run(&client, &channels, &handler).await {
                    Ok(()) => {
                        // Stream ended after a working subscription
                        warn!("Shared store subscription stream ended, reconnecting");
                        backoff.reset();
                    }
                    Err(e) => {
                        warn!("Shared store subscription error: {}", e);
                    }
                }

                let delay = backoff.next_delay();
                debug!(
                    "Reconnecting subscription to {} in {:.1}s",
                    url,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
        })
    }

    async fn subscribe_and_run(
        client: &redis::Client,
        channels: &[String],
        handler: &MessageHandler,
    ) -> Result<(), StoreError> {
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        debug!("Subscribed to shared store channels: {:?}", channels);

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => handler(&channel, &payload),
                Err(e) => error!("Failed to read pub/sub payload on {}: {}", channel, e),
            }
        }

        Ok(())
    }
}
