//! SUBSCRIBE and UNSUBSCRIBE handling

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{Connection, ConnectionError};
use crate::auth::Action;
use crate::protocol::{Packet, SubAck, Subscribe, SubscribeReturnCode, UnsubAck, Unsubscribe};
use crate::session::SessionHandle;
use crate::topic::validate_topic_filter;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Process each requested filter in order, send a SUBACK whose return
    /// codes match the request order, then replay retained messages for the
    /// successful filters
    pub(crate) async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &SessionHandle,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut granted = Vec::new();

        for request in &subscribe.subscriptions {
            if let Err(e) = validate_topic_filter(&request.filter) {
                warn!(
                    "Invalid topic filter from {}: {} ({})",
                    client_id, request.filter, e
                );
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let allowed = self
                .ctx
                .permissions
                .check(
                    client_id,
                    self.username.as_deref(),
                    Action::Subscribe,
                    &request.filter,
                )
                .await;
            if !allowed {
                warn!(
                    "SUBSCRIBE denied: client={}, filter={}",
                    client_id, request.filter
                );
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            // Grant the requested QoS
            self.ctx
                .subscriptions
                .add(client_id, &request.filter, request.qos);
            session.write().add_subscription(&request.filter, request.qos);
            return_codes.push(SubscribeReturnCode::granted(request.qos));
            granted.push((request.filter.clone(), request.qos));

            debug!(
                "Subscription added: client={}, filter={}, qos={:?}",
                client_id, request.filter, request.qos
            );
        }

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await?;

        self.ctx
            .metrics
            .subscriptions_current
            .set(self.ctx.subscriptions.subscription_count() as i64);

        // Retained replay after the SUBACK, with the retain flag set
        for (filter, granted_qos) in &granted {
            match self.ctx.retained.get_matching(filter).await {
                Ok(messages) => {
                    for retained in messages {
                        let effective_qos = retained.qos.min(*granted_qos);
                        self.send_publish(
                            session,
                            Arc::from(retained.topic.as_str()),
                            retained.payload,
                            effective_qos,
                            true,
                        )
                        .await?;
                    }
                }
                Err(e) => warn!(
                    "Failed to read retained messages for {}: {}",
                    filter, e
                ),
            }
        }

        if !granted.is_empty() {
            if let Err(e) = self.ctx.sessions.update_session(session).await {
                warn!("Failed to persist subscriptions for {}: {}", client_id, e);
            }
        }

        Ok(())
    }

    pub(crate) async fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &SessionHandle,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            self.ctx.subscriptions.remove(client_id, filter);
            session.write().remove_subscription(filter);
            debug!(
                "Subscription removed: client={}, filter={}",
                client_id, filter
            );
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))
        .await?;

        self.ctx
            .metrics
            .subscriptions_current
            .set(self.ctx.subscriptions.subscription_count() as i64);

        if let Err(e) = self.ctx.sessions.update_session(session).await {
            warn!("Failed to persist unsubscribe for {}: {}", client_id, e);
        }

        Ok(())
    }
}
