//! CONNECT handling

use std::sync::Arc;

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use super::{Connection, ConnectionError, State};
use crate::auth::Action;
use crate::bus::ClientCommand;
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Packet, QoS};
use crate::session::{now_millis, WillMessage};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read and process the CONNECT packet
    pub(crate) async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);

                    match packet {
                        Packet::Connect(connect) => {
                            return self.handle_connect(*connect).await;
                        }
                        _ => {
                            debug!("First packet from {} was not CONNECT", self.addr);
                            return Err(ConnectionError::Protocol(
                                crate::protocol::ProtocolError::ProtocolViolation(
                                    "first packet must be CONNECT",
                                ),
                            ));
                        }
                    }
                }
                Ok(None) => {
                    // Need more data
                }
                Err(e) => return Err(e.into()),
            }

            use tokio::io::AsyncReadExt;
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
        }
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        // Admission refused at accept: answer and close before any session
        // exists
        if self.permit.is_none() {
            debug!("Admission denied for {}, refusing CONNECT", self.addr);
            return self
                .refuse(ConnectReturnCode::ServerUnavailable, "admission denied")
                .await;
        }

        // [MQTT-3.1.3-7] A zero-byte client id requires cleanSession=1
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!(
                "Rejecting empty client id with clean_session=false from {}",
                self.addr
            );
            return self
                .refuse(
                    ConnectReturnCode::IdentifierRejected,
                    "empty client id with clean_session=false",
                )
                .await;
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            format!(
                "dynamq-{}",
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            )
            .into()
        } else {
            connect.client_id.as_str().into()
        };

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        // Authenticate
        let authenticated = self
            .ctx
            .permissions
            .authenticate(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await;
        if !authenticated {
            warn!("Authentication failed for {}", client_id);
            return self
                .refuse(
                    ConnectReturnCode::BadUserNameOrPassword,
                    "authentication failed",
                )
                .await;
        }

        // Connect permission
        let allowed = self
            .ctx
            .permissions
            .check(&client_id, connect.username.as_deref(), Action::Connect, "")
            .await;
        if !allowed {
            warn!("Connect denied for {} (ACL)", client_id);
            return self
                .refuse(ConnectReturnCode::NotAuthorized, "connect denied")
                .await;
        }

        // Process-wide connection cap; a takeover does not add a connection
        let is_takeover = self.ctx.bus.contains(&client_id);
        if !is_takeover && self.ctx.bus.len() >= self.ctx.config.limits.max_connections {
            warn!(
                "Max connections ({}) reached, rejecting {}",
                self.ctx.config.limits.max_connections, client_id
            );
            return self
                .refuse(
                    ConnectReturnCode::ServerUnavailable,
                    "max connections reached",
                )
                .await;
        }

        self.username = connect.username.clone();

        // Single-owner enforcement: evict any existing holder of this id,
        // wherever it is connected
        match self.ctx.sessions.is_client_connected(&client_id).await {
            Ok(true) => {
                info!(
                    "Client {} already connected, disconnecting existing",
                    client_id
                );
                if let Err(e) = self.ctx.sessions.force_disconnect(&client_id).await {
                    warn!("Failed to evict previous owner of {}: {}", client_id, e);
                }
            }
            Ok(false) => {}
            Err(e) => {
                // Stale reads are survivable; eviction resolves duplicates
                warn!("Ownership lookup failed for {}: {}", client_id, e);
            }
        }

        // Create or restore the session
        let session = match self
            .ctx
            .sessions
            .create_session(&client_id, connect.clean_session)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create session for {}: {}", client_id, e);
                return self
                    .refuse(ConnectReturnCode::ServerUnavailable, "session store failed")
                    .await;
            }
        };

        // A clean session also clears any index entries left behind
        if connect.clean_session {
            self.ctx.subscriptions.remove_all(&client_id);
        }

        let session_present;
        {
            let mut s = session.write();
            s.clean_session = connect.clean_session;
            s.keep_alive_seconds = if connect.keep_alive == 0 {
                self.ctx.config.session.default_keep_alive
            } else {
                connect
                    .keep_alive
                    .min(self.ctx.config.session.max_keep_alive)
            };
            s.username = connect.username.clone();
            s.connected_at = now_millis();
            s.connected = true;
            s.will = connect.will.map(|will| WillMessage {
                topic: will.topic,
                payload: will.payload,
                qos: will.qos,
                retain: will.retain,
            });
            s.touch();

            session_present = !connect.clean_session && !s.subscriptions.is_empty();
        }

        // Attach to the local bus; a same-node duplicate not visible in the
        // ownership record is kicked directly
        if let Some(previous) = self.ctx.bus.register(client_id.clone(), self.cmd_tx.clone()) {
            let _ = previous.try_send(ClientCommand::Kick);
        }

        self.write_packet(&Packet::ConnAck(ConnAck::accepted(session_present)))
            .await?;
        info!(
            "Client connected: {} (sessionPresent: {})",
            client_id, session_present
        );

        // Restored sessions re-seed the subscription index
        if session_present {
            let subs: Vec<(String, QoS)> = {
                let s = session.read();
                s.subscriptions
                    .iter()
                    .map(|(filter, qos)| (filter.clone(), *qos))
                    .collect()
            };
            for (filter, qos) in subs {
                self.ctx.subscriptions.add(&client_id, &filter, qos);
            }
            self.ctx
                .metrics
                .subscriptions_current
                .set(self.ctx.subscriptions.subscription_count() as i64);
        }

        self.state = State::Connected {
            client_id: client_id.clone(),
            session: session.clone(),
        };

        self.ctx.metrics.connections_total.inc();
        self.ctx.metrics.connections_current.inc();

        // A failed store write must not tear down an accepted connection
        if let Err(e) = self.ctx.sessions.update_session(&session).await {
            warn!("Failed to persist session for {}: {}", client_id, e);
        }

        Ok(())
    }

    /// Reply with a CONNACK refusal and fail the connection
    async fn refuse(
        &mut self,
        return_code: ConnectReturnCode,
        reason: &'static str,
    ) -> Result<(), ConnectionError> {
        self.write_packet(&Packet::ConnAck(ConnAck::rejected(return_code)))
            .await?;
        Err(ConnectionError::Protocol(
            crate::protocol::ProtocolError::ProtocolViolation(reason),
        ))
    }
}
