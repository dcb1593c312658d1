//! In-memory session manager
//!
//! Single-node fallback used when the shared store is unavailable or cluster
//! mode is disabled. Ownership questions collapse to "is the client attached
//! to this process".

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::{ClientSession, SessionHandle, SessionManager};
use crate::bus::LocalBus;
use crate::shared::StoreError;

pub struct LocalSessionManager {
    node_id: String,
    sessions: DashMap<String, SessionHandle>,
    bus: Arc<LocalBus>,
}

impl LocalSessionManager {
    pub fn new(node_id: &str, bus: Arc<LocalBus>) -> Self {
        Self {
            node_id: node_id.to_string(),
            sessions: DashMap::new(),
            bus,
        }
    }
}

#[async_trait]
impl SessionManager for LocalSessionManager {
    async fn create_session(
        &self,
        client_id: &str,
        clean_session: bool,
    ) -> Result<SessionHandle, StoreError> {
        if clean_session {
            self.sessions.remove(client_id);
        } else if let Some(existing) = self.sessions.get(client_id) {
            debug!("Restored local session for: {}", client_id);
            return Ok(existing.clone());
        }

        let session = Arc::new(RwLock::new(ClientSession::new(
            Arc::from(client_id),
            clean_session,
            &self.node_id,
        )));
        self.sessions.insert(client_id.to_string(), session.clone());
        debug!("Created local session for: {}", client_id);
        Ok(session)
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<SessionHandle>, StoreError> {
        Ok(self.sessions.get(client_id).map(|entry| entry.clone()))
    }

    async fn update_session(&self, session: &SessionHandle) -> Result<(), StoreError> {
        let client_id = session.read().client_id.to_string();
        self.sessions.insert(client_id, session.clone());
        Ok(())
    }

    async fn remove_session(&self, client_id: &str, permanent: bool) -> Result<(), StoreError> {
        if permanent {
            self.sessions.remove(client_id);
        } else if let Some(session) = self.sessions.get(client_id) {
            session.write().connected = false;
        }
        Ok(())
    }

    async fn is_client_connected(&self, client_id: &str) -> Result<bool, StoreError> {
        Ok(self.bus.contains(client_id))
    }

    async fn get_client_node(&self, client_id: &str) -> Result<Option<String>, StoreError> {
        if self.bus.contains(client_id) {
            Ok(Some(self.node_id.clone()))
        } else {
            Ok(None)
        }
    }

    async fn force_disconnect(&self, client_id: &str) -> Result<(), StoreError> {
        if self.bus.kick(client_id) {
            debug!("Kicked local connection for: {}", client_id);
        }
        Ok(())
    }

    async fn session_count(&self) -> Result<usize, StoreError> {
        Ok(self.sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    fn manager() -> LocalSessionManager {
        LocalSessionManager::new("n1", Arc::new(LocalBus::new()))
    }

    #[tokio::test]
    async fn test_clean_session_discards_state() {
        let mgr = manager();

        let session = mgr.create_session("c1", false).await.unwrap();
        session.write().add_subscription("a/b", QoS::AtLeastOnce);
        mgr.update_session(&session).await.unwrap();

        // Reconnect with cleanSession=true wipes the stored state
        let fresh = mgr.create_session("c1", true).await.unwrap();
        assert!(fresh.read().subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_persistent_session_restores() {
        let mgr = manager();

        let session = mgr.create_session("c1", false).await.unwrap();
        session.write().add_subscription("a/b", QoS::ExactlyOnce);

        let restored = mgr.create_session("c1", false).await.unwrap();
        assert_eq!(
            restored.read().subscriptions.get("a/b"),
            Some(&QoS::ExactlyOnce)
        );
    }

    #[tokio::test]
    async fn test_remove_permanent() {
        let mgr = manager();

        mgr.create_session("c1", false).await.unwrap();
        mgr.remove_session("c1", true).await.unwrap();
        assert!(mgr.get_session("c1").await.unwrap().is_none());
        assert_eq!(mgr.session_count().await.unwrap(), 0);
    }
}
