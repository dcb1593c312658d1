//! Disconnect and eviction cleanup

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use super::Connection;
use crate::session::SessionHandle;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Tear down after DISCONNECT or transport loss.
    ///
    /// An abnormal close publishes the will; a clean session is deleted
    /// outright while a persistent one is detached and saved for restore
    /// within its expiry window.
    pub(crate) async fn handle_disconnect(
        &mut self,
        client_id: &Arc<str>,
        session: &SessionHandle,
        abnormal: bool,
    ) {
        info!("Client disconnected: {} (abnormal: {})", client_id, abnormal);

        if abnormal {
            let will = session.write().will.take();
            if let Some(will) = will {
                info!(
                    "Publishing will message for {}: topic={}",
                    client_id, will.topic
                );
                crate::broker::publish_message(
                    &self.ctx,
                    client_id,
                    &will.topic,
                    &will.payload,
                    will.qos,
                    will.retain,
                )
                .await;
            }
        }

        // Local index entries belong to the attachment, not the stored
        // session. Drop them only while this handler still owns the
        // registry slot: after a takeover the same client id keys the new
        // attachment's re-seeded subscriptions.
        if self.ctx.bus.unregister(client_id, &self.cmd_tx) {
            self.ctx.subscriptions.remove_all(client_id);
        }

        let clean_session = {
            let mut s = session.write();
            s.connected = false;
            s.clean_session
        };

        let result = if clean_session {
            self.ctx.sessions.remove_session(client_id, true).await
        } else {
            // Detach the transport but keep the record restorable
            match self.ctx.sessions.update_session(session).await {
                Ok(()) => self.ctx.sessions.remove_session(client_id, false).await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            warn!("Session cleanup failed for {}: {}", client_id, e);
        }

        self.ctx.metrics.connections_current.dec();
        self.ctx
            .metrics
            .subscriptions_current
            .set(self.ctx.subscriptions.subscription_count() as i64);
    }

    /// Eviction by a newer connection for the same client id. The new owner
    /// holds the session and ownership records, so no will is published and
    /// no record is deleted. Index entries follow the registry slot: a
    /// same-node takeover has already replaced it (and re-seeds the index
    /// under this client id), while a cross-node eviction leaves this
    /// handler as the last owner, whose entries must not outlive it.
    pub(crate) async fn handle_eviction(&mut self, client_id: &Arc<str>) {
        if self.ctx.bus.unregister(client_id, &self.cmd_tx) {
            self.ctx.subscriptions.remove_all(client_id);
            self.ctx
                .metrics
                .subscriptions_current
                .set(self.ctx.subscriptions.subscription_count() as i64);
        }
        self.ctx.metrics.connections_current.dec();
    }
}
