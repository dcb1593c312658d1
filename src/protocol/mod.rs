//! MQTT 3.1.1 protocol definitions and types

mod error;
mod packet;

pub use error::{DecodeError, EncodeError, ProtocolError};
pub use packet::*;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (effective delivery QoS)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// CONNACK return codes per MQTT 3.1.1 section 3.2.2.3
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectReturnCode {
    #[default]
    Accepted = 0x00,
    UnacceptableProtocolVersion = 0x01,
    IdentifierRejected = 0x02,
    ServerUnavailable = 0x03,
    BadUserNameOrPassword = 0x04,
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(ConnectReturnCode::Accepted),
            0x01 => Some(ConnectReturnCode::UnacceptableProtocolVersion),
            0x02 => Some(ConnectReturnCode::IdentifierRejected),
            0x03 => Some(ConnectReturnCode::ServerUnavailable),
            0x04 => Some(ConnectReturnCode::BadUserNameOrPassword),
            0x05 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }
}

/// SUBACK return codes: granted QoS 0-2 or 0x80 failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscribeReturnCode {
    GrantedQoS0 = 0x00,
    GrantedQoS1 = 0x01,
    GrantedQoS2 = 0x02,
    Failure = 0x80,
}

impl SubscribeReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(SubscribeReturnCode::GrantedQoS0),
            0x01 => Some(SubscribeReturnCode::GrantedQoS1),
            0x02 => Some(SubscribeReturnCode::GrantedQoS2),
            0x80 => Some(SubscribeReturnCode::Failure),
            _ => None,
        }
    }

    pub fn granted(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => SubscribeReturnCode::GrantedQoS0,
            QoS::AtLeastOnce => SubscribeReturnCode::GrantedQoS1,
            QoS::ExactlyOnce => SubscribeReturnCode::GrantedQoS2,
        }
    }
}

/// MQTT Packet Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }
}
