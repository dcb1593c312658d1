//! MQTT 3.1.1 packet definitions

use std::sync::Arc;

use bytes::Bytes;

use super::{ConnectReturnCode, QoS, SubscribeReturnCode};

/// MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Get packet type as u8
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => 1,
            Packet::ConnAck(_) => 2,
            Packet::Publish(_) => 3,
            Packet::PubAck(_) => 4,
            Packet::PubRec(_) => 5,
            Packet::PubRel(_) => 6,
            Packet::PubComp(_) => 7,
            Packet::Subscribe(_) => 8,
            Packet::SubAck(_) => 9,
            Packet::Unsubscribe(_) => 10,
            Packet::UnsubAck(_) => 11,
            Packet::PingReq => 12,
            Packet::PingResp => 13,
            Packet::Disconnect => 14,
        }
    }
}

/// CONNECT packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Client identifier
    pub client_id: String,
    /// Clean session flag
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<Bytes>,
    /// Will message (optional)
    pub will: Option<Will>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
        }
    }
}

/// Will message configuration carried in CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnAck {
    /// Session present flag
    pub session_present: bool,
    /// Connect return code
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    pub fn accepted(session_present: bool) -> Self {
        Self {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        }
    }

    pub fn rejected(return_code: ConnectReturnCode) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }
}

/// PUBLISH packet (bidirectional)
///
/// The topic uses `Arc<str>` so cloning during fan-out is O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    /// Quality of service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Topic name
    pub topic: Arc<str>,
    /// Packet identifier (present only for QoS > 0)
    pub packet_id: Option<u16>,
    /// Payload
    pub payload: Bytes,
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(""),
            packet_id: None,
            payload: Bytes::new(),
        }
    }
}

/// PUBACK packet (bidirectional, QoS 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: u16,
}

impl PubAck {
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

/// PUBREC packet (bidirectional, QoS 2 step 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub packet_id: u16,
}

impl PubRec {
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

/// PUBREL packet (bidirectional, QoS 2 step 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub packet_id: u16,
}

impl PubRel {
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

/// PUBCOMP packet (bidirectional, QoS 2 step 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub packet_id: u16,
}

impl PubComp {
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

/// Single subscription request inside SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// Return codes matching the SUBSCRIBE request order
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// UNSUBACK packet (server -> client)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
}
