//! MQTT 3.1.1 packet encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck,
    Subscribe, UnsubAck, Unsubscribe,
};

/// Packet encoder
#[derive(Debug, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => Self::encode_ack(0x40, p.packet_id, buf),
            Packet::PubRec(p) => Self::encode_ack(0x50, p.packet_id, buf),
            Packet::PubRel(p) => Self::encode_ack(0x62, p.packet_id, buf),
            Packet::PubComp(p) => Self::encode_ack(0x70, p.packet_id, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => Self::encode_ack(0xB0, p.packet_id, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0);
                buf.put_u8(0x00);
                Ok(())
            }
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Protocol name "MQTT" (6) + level (1) + flags (1) + keep alive (2)
        let mut remaining_length = 10;

        remaining_length += 2 + packet.client_id.len();

        if let Some(ref will) = packet.will {
            remaining_length += 2 + will.topic.len();
            remaining_length += 2 + will.payload.len();
        }

        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }

        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;

        write_string(buf, "MQTT")?;
        buf.put_u8(4); // protocol level for v3.1.1

        let mut connect_flags: u8 = 0;
        if packet.clean_session {
            connect_flags |= 0x02;
        }
        if let Some(ref will) = packet.will {
            connect_flags |= 0x04;
            connect_flags |= (will.qos as u8) << 3;
            if will.retain {
                connect_flags |= 0x20;
            }
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);

        buf.put_u16(packet.keep_alive);

        write_string(buf, &packet.client_id)?;

        if let Some(ref will) = packet.will {
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }

        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }

        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x20);
        buf.put_u8(0x02);
        buf.put_u8(if packet.session_present { 0x01 } else { 0x00 });
        buf.put_u8(packet.return_code as u8);
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + packet.topic.len();

        if packet.qos != QoS::AtMostOnce {
            remaining_length += 2;
        }

        remaining_length += packet.payload.len();

        let mut first_byte: u8 = 0x30;
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;

        write_string(buf, &packet.topic)?;

        if let Some(packet_id) = packet.packet_id {
            buf.put_u16(packet_id);
        }

        buf.put_slice(&packet.payload);

        Ok(())
    }

    /// Encode the shared fixed-header + packet-id shape used by PUBACK,
    /// PUBREC, PUBREL, PUBCOMP and UNSUBACK
    fn encode_ack(first_byte: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(first_byte);
        buf.put_u8(0x02);
        buf.put_u16(packet_id);
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2;
        for sub in &packet.subscriptions {
            remaining_length += 2 + sub.filter.len() + 1;
        }

        buf.put_u8(0x82); // SUBSCRIBE with flags 0010
        write_variable_int(buf, remaining_length as u32)?;

        buf.put_u16(packet.packet_id);

        for sub in &packet.subscriptions {
            write_string(buf, &sub.filter)?;
            buf.put_u8(sub.qos as u8);
        }

        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let remaining_length = 2 + packet.return_codes.len();

        buf.put_u8(0x90);
        write_variable_int(buf, remaining_length as u32)?;

        buf.put_u16(packet.packet_id);

        for code in &packet.return_codes {
            buf.put_u8(*code as u8);
        }

        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let mut remaining_length = 2;
        for filter in &packet.filters {
            remaining_length += 2 + filter.len();
        }

        buf.put_u8(0xA2); // UNSUBSCRIBE with flags 0010
        write_variable_int(buf, remaining_length as u32)?;

        buf.put_u16(packet.packet_id);

        for filter in &packet.filters {
            write_string(buf, filter)?;
        }

        Ok(())
    }
}
