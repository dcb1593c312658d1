//! Inbound PUBLISH handling

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError};
use crate::auth::Action;
use crate::protocol::{Packet, PubAck, PubRec, Publish, QoS};
use crate::session::SessionHandle;
use crate::topic::validate_topic_name;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle a PUBLISH from the client.
    ///
    /// The QoS acknowledgement goes out before any side effect; a permission
    /// denial still gets its acknowledgement but produces no fan-out.
    pub(crate) async fn handle_publish(
        &mut self,
        client_id: &Arc<str>,
        session: &SessionHandle,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        if let Err(e) = validate_topic_name(&publish.topic) {
            warn!("Invalid topic name from {}: {}", client_id, e);
            return Err(ConnectionError::Protocol(
                crate::protocol::ProtocolError::ProtocolViolation("invalid topic name"),
            ));
        }

        trace!(
            "PUBLISH from {} to {} (QoS {:?})",
            client_id,
            publish.topic,
            publish.qos
        );
        self.ctx.metrics.messages_received_total.inc();
        self.ctx
            .metrics
            .bytes_received_total
            .inc_by(publish.payload.len() as u64);

        // Inbound QoS 2 de-duplication: a second transmission of the same
        // message id before PUBREL is re-acknowledged but not fanned out
        // again
        if publish.qos == QoS::ExactlyOnce {
            let message_id = publish.packet_id.expect("decoder enforces packet id");
            let duplicate = !session.write().inbound_qos2.insert(message_id);

            self.write_packet(&Packet::PubRec(PubRec::new(message_id)))
                .await?;

            if duplicate {
                debug!(
                    "Duplicate QoS 2 publish {} from {}, suppressing fan-out",
                    message_id, client_id
                );
                return Ok(());
            }
        } else if publish.qos == QoS::AtLeastOnce {
            let message_id = publish.packet_id.expect("decoder enforces packet id");
            self.write_packet(&Packet::PubAck(PubAck::new(message_id)))
                .await?;
        }

        // Publish permission; the acknowledgement above stands either way
        let allowed = self
            .ctx
            .permissions
            .check(
                client_id,
                self.username.as_deref(),
                Action::Publish,
                &publish.topic,
            )
            .await;
        if !allowed {
            warn!(
                "PUBLISH denied for {} to topic {} (ACL)",
                client_id, publish.topic
            );
            return Ok(());
        }

        crate::broker::publish_message(
            &self.ctx,
            client_id,
            &publish.topic,
            &publish.payload,
            publish.qos,
            publish.retain,
        )
        .await;

        Ok(())
    }
}
