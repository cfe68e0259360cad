//! Device envelope decoding
//!
//! Turns a framed `FromRadio` buffer into an `Envelope` and splits mesh
//! packets into a routing header plus either a decoded or an encrypted
//! payload.

use prost::Message;

use super::schema::{self, from_radio, mesh_packet, Data, FromRadio, MeshPacket, ToRadio};
use crate::errors::{DecodeError, FrameError};
use crate::protocol::framing::encode_frame;
use crate::types::{hops_travelled, NodeNum};

/// Envelope received from the device
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Packet(MeshPacket),
    MyInfo(schema::MyNodeInfo),
    NodeInfo(schema::NodeInfo),
    ConfigComplete(u32),
    Rebooted,
    /// Envelope kinds the pipeline does not consume (config, channels, logs)
    Other,
}

impl Envelope {
    /// Decode one frame payload
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let message = FromRadio::decode(frame)?;
        Ok(match message.payload_variant {
            Some(from_radio::PayloadVariant::Packet(packet)) => Envelope::Packet(packet),
            Some(from_radio::PayloadVariant::MyInfo(info)) => Envelope::MyInfo(info),
            Some(from_radio::PayloadVariant::NodeInfo(info)) => Envelope::NodeInfo(info),
            Some(from_radio::PayloadVariant::ConfigCompleteId(id)) => Envelope::ConfigComplete(id),
            Some(from_radio::PayloadVariant::Rebooted(_)) => Envelope::Rebooted,
            None => Envelope::Other,
        })
    }
}

/// Encode an outbound request as a complete stream frame
pub fn encode_to_radio(message: &ToRadio) -> Result<Vec<u8>, FrameError> {
    encode_frame(&message.encode_to_vec())
}

/// Encode a device envelope as a complete stream frame
pub fn encode_from_radio(message: &FromRadio) -> Result<Vec<u8>, FrameError> {
    encode_frame(&message.encode_to_vec())
}

// ----------------------------------------------------------------------------
// Packet Header
// ----------------------------------------------------------------------------

/// Routing metadata of a mesh packet, independent of its payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketHeader {
    pub from: NodeNum,
    pub to: NodeNum,
    pub packet_id: u32,
    pub channel: u32,
    pub hop_start: u32,
    pub hop_limit: u32,
    pub rx_time: u32,
    pub rx_snr: f32,
    pub rx_rssi: i32,
    pub via_mqtt: bool,
    pub pki_encrypted: bool,
}

impl PacketHeader {
    pub fn hops(&self) -> Option<u8> {
        hops_travelled(self.hop_start, self.hop_limit)
    }

    /// Channel hash declared by an encrypted packet
    pub fn channel_hash(&self) -> u8 {
        (self.channel & 0xff) as u8
    }
}

impl From<&MeshPacket> for PacketHeader {
    fn from(packet: &MeshPacket) -> Self {
        Self {
            from: NodeNum::new(packet.from),
            to: NodeNum::new(packet.to),
            packet_id: packet.id,
            channel: packet.channel,
            hop_start: packet.hop_start,
            hop_limit: packet.hop_limit,
            rx_time: packet.rx_time,
            rx_snr: packet.rx_snr,
            rx_rssi: packet.rx_rssi,
            via_mqtt: packet.via_mqtt,
            pki_encrypted: packet.pki_encrypted,
        }
    }
}

/// Payload of a mesh packet as delivered by the device
#[derive(Debug, Clone, PartialEq)]
pub enum PacketPayload {
    /// The device decoded the payload itself
    Decoded(Data),
    /// Channel or PKI ciphertext the device could not decode
    Encrypted(Vec<u8>),
}

/// Split a mesh packet into header and payload
pub fn split_packet(packet: MeshPacket) -> Result<(PacketHeader, PacketPayload), DecodeError> {
    let header = PacketHeader::from(&packet);
    let payload = match packet.payload_variant {
        Some(mesh_packet::PayloadVariant::Decoded(data)) => PacketPayload::Decoded(data),
        Some(mesh_packet::PayloadVariant::Encrypted(bytes)) if !bytes.is_empty() => {
            PacketPayload::Encrypted(bytes)
        }
        _ => return Err(DecodeError::MissingPayload),
    };
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::decode_frame;

    #[test]
    fn test_decode_my_info_envelope() {
        let message = FromRadio {
            id: 1,
            payload_variant: Some(from_radio::PayloadVariant::MyInfo(schema::MyNodeInfo {
                my_node_num: 0xdeadbeef,
                ..Default::default()
            })),
        };
        let frame = encode_from_radio(&message).unwrap();
        let envelope = Envelope::decode(decode_frame(&frame).unwrap()).unwrap();
        match envelope {
            Envelope::MyInfo(info) => assert_eq!(info.my_node_num, 0xdeadbeef),
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn test_malformed_envelope() {
        assert!(matches!(
            Envelope::decode(&[0x12, 0x40, 0x01]),
            Err(DecodeError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_split_packet_requires_payload() {
        let packet = MeshPacket {
            from: 1,
            id: 5,
            ..Default::default()
        };
        assert!(matches!(split_packet(packet), Err(DecodeError::MissingPayload)));
    }

    #[test]
    fn test_header_hops_and_hash() {
        let packet = MeshPacket {
            from: 7,
            channel: 0x1_08,
            hop_start: 3,
            hop_limit: 1,
            payload_variant: Some(mesh_packet::PayloadVariant::Encrypted(vec![1, 2, 3])),
            ..Default::default()
        };
        let (header, payload) = split_packet(packet).unwrap();
        assert_eq!(header.hops(), Some(2));
        assert_eq!(header.channel_hash(), 0x08);
        assert_eq!(payload, PacketPayload::Encrypted(vec![1, 2, 3]));
    }

    #[test]
    fn test_to_radio_frames() {
        let frame = encode_to_radio(&ToRadio::want_config(42)).unwrap();
        let decoded = ToRadio::decode(decode_frame(&frame).unwrap()).unwrap();
        assert_eq!(decoded, ToRadio::want_config(42));
    }
}
