//! MQTT connection handler
//!
//! One handler owns one transport endpoint for the session's lifetime. The
//! state machine is `AwaitingConnect -> Connected -> Closing`; packet
//! processing is strictly sequential per connection, with deliveries from
//! other connections, the retry ticker and the keep-alive deadline
//! multiplexed into the same loop.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::admission::ConnectionPermit;
use crate::buffer_pool;
use crate::bus::{ClientCommand, Delivery};
use crate::codec::{Decoder, Encoder};
use crate::context::BrokerContext;
use crate::protocol::{Packet, Publish, QoS};
use crate::session::{now_millis, PendingMessage, SessionHandle};

/// How long a connection may sit without a CONNECT
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound command channel depth per connection
const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(crate::protocol::ProtocolError),
    Decode(crate::protocol::DecodeError),
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<crate::protocol::DecodeError> for ConnectionError {
    fn from(e: crate::protocol::DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<crate::protocol::EncodeError> for ConnectionError {
    fn from(e: crate::protocol::EncodeError) -> Self {
        ConnectionError::Protocol(e.into())
    }
}

/// Connection state
pub(crate) enum State {
    /// Waiting for CONNECT
    AwaitingConnect,
    /// CONNECT accepted, session attached
    Connected {
        client_id: Arc<str>,
        session: SessionHandle,
    },
}

/// Connection handler, generic over the transport
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) ctx: Arc<BrokerContext>,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) cmd_tx: mpsc::Sender<ClientCommand>,
    pub(crate) cmd_rx: mpsc::Receiver<ClientCommand>,
    /// None when admission control refused the connection
    pub(crate) permit: Option<ConnectionPermit>,
    pub(crate) username: Option<String>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        ctx: Arc<BrokerContext>,
        permit: Option<ConnectionPermit>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let max_packet_size = ctx.config.limits.max_packet_size;

        Self {
            stream,
            addr,
            ctx,
            state: State::AwaitingConnect,
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
            encoder: Encoder::new(),
            read_buf: buffer_pool::get_buffer(),
            write_buf: buffer_pool::get_buffer(),
            cmd_tx,
            cmd_rx,
            permit,
            username: None,
        }
    }

    /// Run the connection to completion
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        match timeout(CONNECT_TIMEOUT, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("Connect timeout from {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        }

        let result = self.run_connected().await;

        // Backstop for paths that did not run their own cleanup. A takeover
        // may already own the registry slot, and index entries follow it.
        if let State::Connected { client_id, .. } = &self.state {
            let client_id = client_id.clone();
            if self.ctx.bus.unregister(&client_id, &self.cmd_tx) {
                self.ctx.subscriptions.remove_all(&client_id);
            }
        }

        result
    }

    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        let (client_id, session) = match &self.state {
            State::Connected { client_id, session } => (client_id.clone(), session.clone()),
            State::AwaitingConnect => {
                return Err(ConnectionError::Protocol(
                    crate::protocol::ProtocolError::ProtocolViolation("not connected"),
                ))
            }
        };

        let keep_alive_secs = session.read().keep_alive_seconds;
        // Server may close after 1.5x the keep-alive (0 disables)
        let keep_alive = if keep_alive_secs > 0 {
            Duration::from_millis(keep_alive_secs as u64 * 1500)
        } else {
            Duration::from_secs(86400 * 365)
        };
        debug!(
            "Keep alive for {}: {}s -> timeout {:?}",
            client_id, keep_alive_secs, keep_alive
        );

        // Pending-message sweep for this session
        let retry_interval = Duration::from_secs(self.ctx.config.retry.interval);
        let mut retry_ticker = tokio::time::interval(retry_interval);
        retry_ticker.tick().await; // skip the immediate tick

        let mut keep_alive_deadline = tokio::time::Instant::now() + keep_alive;

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!("Connection closed from {}", self.addr);
                            self.handle_disconnect(&client_id, &session, true).await;
                            return Ok(());
                        }
                        Ok(_) => {
                            loop {
                                let (packet, consumed) = match self.decoder.decode(&self.read_buf) {
                                    Ok(Some(decoded)) => decoded,
                                    Ok(None) => break,
                                    Err(e) => {
                                        // Malformed packet: silent transport
                                        // close, with abnormal-close cleanup
                                        warn!("Decode error from {}: {}", client_id, e);
                                        self.handle_disconnect(&client_id, &session, true).await;
                                        return Err(e.into());
                                    }
                                };
                                self.read_buf.advance(consumed);

                                {
                                    let mut s = session.write();
                                    s.touch();
                                }
                                keep_alive_deadline = tokio::time::Instant::now() + keep_alive;

                                if let Err(e) = self.handle_packet(&client_id, &session, packet).await {
                                    match &e {
                                        ConnectionError::Shutdown => {
                                            // Clean close, cleanup already done
                                            return Err(e);
                                        }
                                        ConnectionError::Io(_) => {
                                            debug!("Connection error: {}", e);
                                            self.handle_disconnect(&client_id, &session, true).await;
                                            return Err(e);
                                        }
                                        _ => {
                                            warn!("Error handling packet from {}: {}", client_id, e);
                                            self.handle_disconnect(&client_id, &session, true).await;
                                            return Err(e);
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            debug!("Read error: {}", e);
                            self.handle_disconnect(&client_id, &session, true).await;
                            return Err(e.into());
                        }
                    }
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ClientCommand::Deliver(delivery)) => {
                            if let Err(e) = self.deliver_to_client(&session, delivery).await {
                                debug!("Delivery write failed for {}: {}", client_id, e);
                                self.handle_disconnect(&client_id, &session, true).await;
                                return Err(e);
                            }
                        }
                        Some(ClientCommand::Kick) => {
                            info!("Evicting connection for {}", client_id);
                            self.handle_eviction(&client_id).await;
                            return Err(ConnectionError::Shutdown);
                        }
                        None => {
                            self.handle_disconnect(&client_id, &session, true).await;
                            return Err(ConnectionError::Shutdown);
                        }
                    }
                }

                _ = retry_ticker.tick() => {
                    if let Err(e) = self.sweep_pending(&session).await {
                        debug!("Retry write failed for {}: {}", client_id, e);
                        self.handle_disconnect(&client_id, &session, true).await;
                        return Err(e);
                    }
                }

                _ = tokio::time::sleep_until(keep_alive_deadline) => {
                    info!("Keep alive timeout for {} - disconnecting", client_id);
                    self.handle_disconnect(&client_id, &session, true).await;
                    return Err(ConnectionError::Timeout);
                }
            }
        }
    }

    /// Dispatch one inbound packet
    async fn handle_packet(
        &mut self,
        client_id: &Arc<str>,
        session: &SessionHandle,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ConnectionError::Protocol(
                crate::protocol::ProtocolError::ProtocolViolation("duplicate CONNECT"),
            )),
            Packet::Publish(publish) => self.handle_publish(client_id, session, publish).await,
            Packet::PubAck(puback) => self.handle_puback(session, puback).await,
            Packet::PubRec(pubrec) => self.handle_pubrec(session, pubrec).await,
            Packet::PubRel(pubrel) => self.handle_pubrel(session, pubrel).await,
            Packet::PubComp(pubcomp) => self.handle_pubcomp(session, pubcomp).await,
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(client_id, session, subscribe).await
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, session, unsubscribe).await
            }
            Packet::PingReq => self.write_packet(&Packet::PingResp).await,
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", client_id);
                // A clean DISCONNECT discards the will
                session.write().will = None;
                self.handle_disconnect(client_id, session, false).await;
                Err(ConnectionError::Shutdown)
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                warn!(
                    "Unexpected packet type from {}: {}",
                    client_id,
                    packet.packet_type()
                );
                Ok(())
            }
        }
    }

    /// Encode and write a single packet
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Deliver an application message to this client, allocating a message
    /// id and tracking pending state for QoS > 0
    pub(crate) async fn deliver_to_client(
        &mut self,
        session: &SessionHandle,
        delivery: Delivery,
    ) -> Result<(), ConnectionError> {
        self.send_publish(
            session,
            delivery.topic,
            delivery.payload,
            delivery.qos,
            delivery.retain,
        )
        .await
    }

    /// Write a PUBLISH to this client. `qos` is the already-downgraded
    /// effective QoS.
    pub(crate) async fn send_publish(
        &mut self,
        session: &SessionHandle,
        topic: Arc<str>,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError> {
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            let mut s = session.write();
            let message_id = s.next_message_id();
            s.track_pending(PendingMessage {
                message_id,
                topic: topic.to_string(),
                payload: payload.clone(),
                qos,
                sent_at: now_millis(),
                retry_count: 0,
            });
            Some(message_id)
        };

        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic,
            packet_id,
            payload,
        };

        let result = self.write_packet(&Packet::Publish(publish)).await;
        if result.is_ok() {
            self.ctx.metrics.messages_sent_total.inc();
            self.ctx
                .metrics
                .bytes_sent_total
                .inc_by(self.write_buf.len() as u64);
        }
        result
    }

    /// Sweep both pending tables: retransmit stale entries with DUP set,
    /// drop entries past the retry budget
    pub(crate) async fn sweep_pending(
        &mut self,
        session: &SessionHandle,
    ) -> Result<(), ConnectionError> {
        let retry_interval_ms = self.ctx.config.retry.interval * 1000;
        let max_retries = self.ctx.config.retry.max_retries;
        let now = now_millis();

        fn sweep_table(
            pending: &mut ahash::AHashMap<u16, PendingMessage>,
            now: u64,
            retry_interval_ms: u64,
            max_retries: u32,
            to_resend: &mut Vec<(Arc<str>, Bytes, QoS, u16)>,
            dropped: &mut u64,
        ) {
            pending.retain(|message_id, entry| {
                if now.saturating_sub(entry.sent_at) < retry_interval_ms {
                    return true;
                }
                if entry.retry_count >= max_retries {
                    warn!(
                        "Max retries ({}) exceeded for message {}, dropping",
                        max_retries, message_id
                    );
                    *dropped += 1;
                    return false;
                }
                entry.retry_count += 1;
                entry.sent_at = now;
                to_resend.push((
                    Arc::from(entry.topic.as_str()),
                    entry.payload.clone(),
                    entry.qos,
                    *message_id,
                ));
                true
            });
        }

        let mut to_resend: Vec<(Arc<str>, Bytes, QoS, u16)> = Vec::new();
        let mut dropped = 0u64;

        {
            let mut s = session.write();
            sweep_table(
                &mut s.pending_qos1,
                now,
                retry_interval_ms,
                max_retries,
                &mut to_resend,
                &mut dropped,
            );
            sweep_table(
                &mut s.pending_qos2,
                now,
                retry_interval_ms,
                max_retries,
                &mut to_resend,
                &mut dropped,
            );
        }

        if dropped > 0 {
            self.ctx.metrics.messages_dropped_total.inc_by(dropped);
        }

        for (topic, payload, qos, message_id) in to_resend {
            let publish = Publish {
                dup: true,
                qos,
                retain: false,
                topic,
                packet_id: Some(message_id),
                payload,
            };
            self.write_packet(&Packet::Publish(publish)).await?;
            self.ctx.metrics.retransmits_total.inc();
        }

        Ok(())
    }

    /// Return buffers to the pool for reuse by other connections
    pub fn return_buffers(&mut self) {
        let read_buf = std::mem::take(&mut self.read_buf);
        let write_buf = std::mem::take(&mut self.write_buf);
        buffer_pool::put_buffer(read_buf);
        buffer_pool::put_buffer(write_buf);
    }
}
