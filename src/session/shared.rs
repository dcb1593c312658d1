//! Shared-store session manager
//!
//! Persists two records per client: the session record under
//! `dynamq:session:{clientId}` (TTL-bounded by session expiry for persistent
//! sessions) and the connection record `dynamq:connection:{clientId}` naming
//! the owning node with a short TTL refreshed on every save. A per-node
//! read-through cache accelerates `get_session`; subscription state is
//! mirrored under its own key with an invalidation channel.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::{now_millis, ClientSession, SessionHandle, SessionManager, StoredSession};
use crate::bus::LocalBus;
use crate::cluster::messages::{KickCommand, SubscriptionSyncMessage};
use crate::shared::{SharedStore, StoreError};

const SESSION_KEY_PREFIX: &str = "dynamq:session:";
const CONNECTION_KEY_PREFIX: &str = "dynamq:connection:";
const SUBSCRIPTIONS_KEY_PREFIX: &str = "dynamq:subscriptions:";
const KICK_CHANNEL: &str = "dynamq:cluster:kick";
const SUBSCRIPTIONS_CHANNEL: &str = "dynamq:subscriptions:channel";

pub struct SharedSessionManager {
    store: Arc<SharedStore>,
    node_id: String,
    /// TTL for persistent session records, seconds
    session_expiry_secs: u64,
    /// Connection record TTL is about twice the largest keep-alive
    connection_ttl_secs: u64,
    cache: Arc<DashMap<String, SessionHandle>>,
    bus: Arc<LocalBus>,
}

impl SharedSessionManager {
    pub fn new(
        store: Arc<SharedStore>,
        node_id: &str,
        session_expiry_secs: u64,
        max_keep_alive_secs: u64,
        bus: Arc<LocalBus>,
    ) -> Self {
        info!("Shared session manager initialized for node: {}", node_id);
        Self {
            store,
            node_id: node_id.to_string(),
            session_expiry_secs,
            connection_ttl_secs: max_keep_alive_secs * 2,
            cache: Arc::new(DashMap::new()),
            bus,
        }
    }

    fn session_key(client_id: &str) -> String {
        format!("{}{}", SESSION_KEY_PREFIX, client_id)
    }

    fn connection_key(client_id: &str) -> String {
        format!("{}{}", CONNECTION_KEY_PREFIX, client_id)
    }

    fn subscriptions_key(client_id: &str) -> String {
        format!("{}{}", SUBSCRIPTIONS_KEY_PREFIX, client_id)
    }

    /// Listen for eviction commands addressed to this node
    pub fn start_kick_listener(&self) -> tokio::task::JoinHandle<()> {
        let node_id = self.node_id.clone();
        let bus = self.bus.clone();
        let cache = self.cache.clone();

        self.store.subscribe(
            vec![KICK_CHANNEL.to_string()],
            Arc::new(move |_channel, payload| {
                let cmd: KickCommand = match serde_json::from_str(payload) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        warn!("Failed to parse kick command: {}", e);
                        return;
                    }
                };

                // Only the targeted node acts
                if cmd.target_node != node_id {
                    return;
                }

                info!(
                    "Received kick command for client {} from node {}",
                    cmd.client_id, cmd.source_node
                );
                bus.kick(&cmd.client_id);
                cache.remove(&cmd.client_id);
            }),
        )
    }

    /// Listen for subscription-cache invalidations from peer nodes
    pub fn start_subscription_sync(&self) -> tokio::task::JoinHandle<()> {
        let node_id = self.node_id.clone();
        let cache = self.cache.clone();

        self.store.subscribe(
            vec![SUBSCRIPTIONS_CHANNEL.to_string()],
            Arc::new(move |_channel, payload| {
                let msg: SubscriptionSyncMessage = match serde_json::from_str(payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Failed to parse subscription sync: {}", e);
                        return;
                    }
                };

                if msg.source_node == node_id {
                    return;
                }

                cache.remove(&msg.client_id);
            }),
        )
    }

    async fn save_session(&self, session: &SessionHandle) -> Result<(), StoreError> {
        let (client_id, clean_session, json, subs_json) = {
            let s = session.read();
            let stored = StoredSession::from_session(&s);
            let subs: std::collections::HashMap<&String, u8> = s
                .subscriptions
                .iter()
                .map(|(filter, qos)| (filter, *qos as u8))
                .collect();
            (
                s.client_id.to_string(),
                s.clean_session,
                serde_json::to_string(&stored).map_err(|e| StoreError::Command(e.to_string()))?,
                serde_json::to_string(&subs).map_err(|e| StoreError::Command(e.to_string()))?,
            )
        };

        // Session record: persistent sessions carry the expiry TTL. A clean
        // session's record is only meaningful while its connection lives,
        // so it shares the connection TTL and self-expires when the owning
        // node dies without running disconnect cleanup.
        if clean_session {
            self.store
                .set_ex(&Self::session_key(&client_id), &json, self.connection_ttl_secs)
                .await?;
        } else if self.session_expiry_secs == 0 {
            self.store.set(&Self::session_key(&client_id), &json).await?;
        } else {
            self.store
                .set_ex(&Self::session_key(&client_id), &json, self.session_expiry_secs)
                .await?;
        }

        // Connection record: which node owns this client right now
        self.store
            .set_ex(
                &Self::connection_key(&client_id),
                &self.node_id,
                self.connection_ttl_secs,
            )
            .await?;

        // Subscription mirror + peer cache invalidation
        self.store
            .set(&Self::subscriptions_key(&client_id), &subs_json)
            .await?;
        let sync = SubscriptionSyncMessage {
            client_id: client_id.clone(),
            source_node: self.node_id.clone(),
        };
        if let Ok(payload) = serde_json::to_string(&sync) {
            if let Err(e) = self.store.publish(SUBSCRIPTIONS_CHANNEL, &payload).await {
                error!("Failed to publish subscription sync: {}", e);
            }
        }

        Ok(())
    }

    fn cache_handle(&self, client_id: &str, session: ClientSession) -> SessionHandle {
        let handle = Arc::new(RwLock::new(session));
        self.cache.insert(client_id.to_string(), handle.clone());
        handle
    }
}

#[async_trait]
impl SessionManager for SharedSessionManager {
    async fn create_session(
        &self,
        client_id: &str,
        clean_session: bool,
    ) -> Result<SessionHandle, StoreError> {
        if clean_session {
            // Clean session: delete any stored state and start fresh
            self.cache.remove(client_id);
            let session_key = Self::session_key(client_id);
            let connection_key = Self::connection_key(client_id);
            let subscriptions_key = Self::subscriptions_key(client_id);
            self.store
                .del(&[&session_key, &connection_key, &subscriptions_key])
                .await?;
        } else {
            // Try to restore the stored session
            match self.store.get(&Self::session_key(client_id)).await? {
                Some(json) => match serde_json::from_str::<StoredSession>(&json) {
                    Ok(stored) => {
                        let mut session = stored.into_session(&self.node_id);
                        session.connected_at = now_millis();
                        session.touch();
                        debug!("Restored session from shared store for: {}", client_id);
                        let handle = self.cache_handle(client_id, session);
                        self.save_session(&handle).await?;
                        return Ok(handle);
                    }
                    Err(e) => {
                        warn!(
                            "Failed to deserialize session, creating new: {} ({})",
                            client_id, e
                        );
                    }
                },
                None => {}
            }
        }

        let session = ClientSession::new(Arc::from(client_id), clean_session, &self.node_id);
        let handle = self.cache_handle(client_id, session);
        self.save_session(&handle).await?;
        debug!("Created new session in shared store for: {}", client_id);
        Ok(handle)
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<SessionHandle>, StoreError> {
        if let Some(cached) = self.cache.get(client_id) {
            return Ok(Some(cached.clone()));
        }

        match self.store.get(&Self::session_key(client_id)).await? {
            Some(json) => match serde_json::from_str::<StoredSession>(&json) {
                Ok(stored) => {
                    let session = stored.into_session(&self.node_id);
                    Ok(Some(self.cache_handle(client_id, session)))
                }
                Err(e) => {
                    warn!("Failed to deserialize session {}: {}", client_id, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn update_session(&self, session: &SessionHandle) -> Result<(), StoreError> {
        let client_id = session.read().client_id.to_string();
        self.cache.insert(client_id, session.clone());
        self.save_session(session).await
    }

    async fn remove_session(&self, client_id: &str, permanent: bool) -> Result<(), StoreError> {
        self.cache.remove(client_id);

        if permanent {
            self.store
                .del(&[
                    &Self::session_key(client_id),
                    &Self::connection_key(client_id),
                    &Self::subscriptions_key(client_id),
                ])
                .await
        } else {
            self.store.del(&[&Self::connection_key(client_id)]).await
        }
    }

    async fn is_client_connected(&self, client_id: &str) -> Result<bool, StoreError> {
        self.store.exists(&Self::connection_key(client_id)).await
    }

    async fn get_client_node(&self, client_id: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&Self::connection_key(client_id)).await
    }

    async fn force_disconnect(&self, client_id: &str) -> Result<(), StoreError> {
        let target = match self.get_client_node(client_id).await? {
            Some(node) => node,
            None => {
                debug!("Client {} not connected, nothing to disconnect", client_id);
                return Ok(());
            }
        };

        if target == self.node_id {
            debug!("Client {} is on this node, disconnecting locally", client_id);
            self.bus.kick(client_id);
        } else {
            info!(
                "Client {} is on node {}, sending cluster kick command",
                client_id, target
            );
            let cmd = KickCommand::new(client_id, &target, &self.node_id);
            let payload =
                serde_json::to_string(&cmd).map_err(|e| StoreError::Command(e.to_string()))?;
            self.store.publish(KICK_CHANNEL, &payload).await?;
        }

        // Drop the connection record so the client reads as disconnected
        // immediately
        self.store.del(&[&Self::connection_key(client_id)]).await
    }

    async fn session_count(&self) -> Result<usize, StoreError> {
        let keys = self
            .store
            .keys(&format!("{}*", SESSION_KEY_PREFIX))
            .await?;
        Ok(keys.len())
    }
}
