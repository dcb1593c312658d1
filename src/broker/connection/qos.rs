//! QoS acknowledgement flows (PUBACK, PUBREC, PUBREL, PUBCOMP)

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel};
use crate::session::SessionHandle;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// PUBACK: terminal ack of an outbound QoS 1 message
    pub(crate) async fn handle_puback(
        &mut self,
        session: &SessionHandle,
        puback: PubAck,
    ) -> Result<(), ConnectionError> {
        trace!("PUBACK for message {}", puback.packet_id);
        session.write().pending_qos1.remove(&puback.packet_id);
        Ok(())
    }

    /// PUBREC: the subscriber holds the QoS 2 message; answer with PUBREL.
    /// The pending entry stays in its table until PUBCOMP.
    pub(crate) async fn handle_pubrec(
        &mut self,
        _session: &SessionHandle,
        pubrec: PubRec,
    ) -> Result<(), ConnectionError> {
        trace!("PUBREC for message {}", pubrec.packet_id);
        self.write_packet(&Packet::PubRel(PubRel::new(pubrec.packet_id)))
            .await
    }

    /// PUBREL: release of an inbound QoS 2 publish this broker accepted
    pub(crate) async fn handle_pubrel(
        &mut self,
        session: &SessionHandle,
        pubrel: PubRel,
    ) -> Result<(), ConnectionError> {
        trace!("PUBREL for message {}", pubrel.packet_id);
        session.write().inbound_qos2.remove(&pubrel.packet_id);
        self.write_packet(&Packet::PubComp(PubComp::new(pubrel.packet_id)))
            .await
    }

    /// PUBCOMP: terminal ack of an outbound QoS 2 message
    pub(crate) async fn handle_pubcomp(
        &mut self,
        session: &SessionHandle,
        pubcomp: PubComp,
    ) -> Result<(), ConnectionError> {
        trace!("PUBCOMP for message {}", pubcomp.packet_id);
        session.write().pending_qos2.remove(&pubcomp.packet_id);
        Ok(())
    }
}
