//! Test utilities
//!
//! Manual clock, mesh packet builders and frame helpers shared by unit
//! tests, integration tests and the runtime crate's tests.

use std::sync::atomic::{AtomicU64, Ordering};

use prost::Message;

use crate::crypto::{channel_hash, encrypt_payload, ChannelKey};
use crate::protocol::schema::{
    from_radio, mesh_packet, routing, Data, FromRadio, MeshPacket, MyNodeInfo, PortNum, Position,
    RouteDiscovery, Routing, RoutingError, User,
};
use crate::protocol::encode_from_radio;
use crate::types::{NodeNum, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Manual clock
// ----------------------------------------------------------------------------

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    millis: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicU64::new(start.as_millis()),
        }
    }

    pub fn set(&self, at: Timestamp) {
        self.millis.store(at.as_millis(), Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_millis(secs * 1000);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.millis.load(Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Keys
// ----------------------------------------------------------------------------

/// Deterministic 128-bit channel key
pub fn test_key(seed: u8) -> ChannelKey {
    let bytes: Vec<u8> = (0..16u8).map(|i| seed.wrapping_mul(31).wrapping_add(i)).collect();
    ChannelKey::from_psk(&bytes).expect("16-byte keys are valid")
}

/// Deterministic 256-bit channel key
pub fn test_key_256(seed: u8) -> ChannelKey {
    let bytes: Vec<u8> = (0..32u8).map(|i| seed.wrapping_mul(17).wrapping_add(i)).collect();
    ChannelKey::from_psk(&bytes).expect("32-byte keys are valid")
}

// ----------------------------------------------------------------------------
// Packet builder
// ----------------------------------------------------------------------------

/// Fluent builder for device-delivered mesh packets
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    packet: MeshPacket,
    data: Data,
    encrypt_with: Option<(String, ChannelKey)>,
    raw_ciphertext: Option<Vec<u8>>,
}

impl PacketBuilder {
    /// Decoded packet on `portnum` from `from` to broadcast
    pub fn data(from: u32, portnum: i32, payload: Vec<u8>) -> Self {
        Self {
            packet: MeshPacket {
                from,
                to: NodeNum::BROADCAST.value(),
                id: 1,
                ..Default::default()
            },
            data: Data {
                portnum,
                payload,
                ..Default::default()
            },
            encrypt_with: None,
            raw_ciphertext: None,
        }
    }

    pub fn text(from: u32, text: &str) -> Self {
        Self::data(from, PortNum::TextMessageApp as i32, text.as_bytes().to_vec())
    }

    pub fn position(from: u32, latitude: f64, longitude: f64) -> Self {
        let position = Position {
            latitude_i: Some((latitude * 1e7).round() as i32),
            longitude_i: Some((longitude * 1e7).round() as i32),
            ..Default::default()
        };
        Self::data(from, PortNum::PositionApp as i32, position.encode_to_vec())
    }

    pub fn node_info(from: u32, user: User) -> Self {
        Self::data(from, PortNum::NodeinfoApp as i32, user.encode_to_vec())
    }

    /// Traceroute reply answering our request `request_id`
    pub fn traceroute_reply(from: u32, route: Vec<u32>, request_id: u32) -> Self {
        let discovery = RouteDiscovery {
            route,
            ..Default::default()
        };
        let mut builder = Self::data(from, PortNum::TracerouteApp as i32, discovery.encode_to_vec());
        builder.data.request_id = request_id;
        builder
    }

    /// Routing nak for our request `request_id`
    pub fn routing_error(from: u32, reason: RoutingError, request_id: u32) -> Self {
        let routing = Routing {
            variant: Some(routing::Variant::ErrorReason(reason as i32)),
        };
        let mut builder = Self::data(from, PortNum::RoutingApp as i32, routing.encode_to_vec());
        builder.data.request_id = request_id;
        builder
    }

    pub fn id(mut self, id: u32) -> Self {
        self.packet.id = id;
        self
    }

    pub fn to(mut self, to: u32) -> Self {
        self.packet.to = to;
        self
    }

    /// Hop start and remaining hop limit
    pub fn hops(mut self, hop_start: u32, hop_limit: u32) -> Self {
        self.packet.hop_start = hop_start;
        self.packet.hop_limit = hop_limit;
        self
    }

    pub fn channel(mut self, channel: u32) -> Self {
        self.packet.channel = channel;
        self
    }

    /// Encrypt the payload under a channel key, declaring its channel hash
    pub fn encrypted(mut self, channel_name: &str, key: &ChannelKey) -> Self {
        self.encrypt_with = Some((channel_name.to_string(), key.clone()));
        self
    }

    /// Arbitrary ciphertext, for undecryptable packets
    pub fn ciphertext(mut self, bytes: Vec<u8>) -> Self {
        self.raw_ciphertext = Some(bytes);
        self
    }

    pub fn pki_encrypted(mut self) -> Self {
        self.packet.pki_encrypted = true;
        self
    }

    /// Plaintext `Data` bytes this builder would carry
    pub fn plaintext(&self) -> Vec<u8> {
        self.data.encode_to_vec()
    }

    pub fn build(self) -> MeshPacket {
        let mut packet = self.packet;
        let from = NodeNum::new(packet.from);
        packet.payload_variant = Some(if let Some(bytes) = self.raw_ciphertext {
            mesh_packet::PayloadVariant::Encrypted(bytes)
        } else if let Some((name, key)) = self.encrypt_with {
            packet.channel = u32::from(channel_hash(&name, &key));
            let ciphertext = encrypt_payload(&key, packet.id, from, &self.data.encode_to_vec())
                .expect("test payload encrypts");
            mesh_packet::PayloadVariant::Encrypted(ciphertext)
        } else {
            mesh_packet::PayloadVariant::Decoded(self.data)
        });
        packet
    }

    pub fn envelope(self) -> FromRadio {
        packet_envelope(self.build())
    }

    /// Complete stream frame carrying this packet
    pub fn frame(self) -> Vec<u8> {
        encode_envelope(&self.envelope())
    }
}

// ----------------------------------------------------------------------------
// Frames
// ----------------------------------------------------------------------------

pub fn packet_envelope(packet: MeshPacket) -> FromRadio {
    FromRadio {
        id: 0,
        payload_variant: Some(from_radio::PayloadVariant::Packet(packet)),
    }
}

pub fn my_info_envelope(node: u32) -> FromRadio {
    FromRadio {
        id: 0,
        payload_variant: Some(from_radio::PayloadVariant::MyInfo(MyNodeInfo {
            my_node_num: node,
            ..Default::default()
        })),
    }
}

pub fn config_complete_envelope(config_id: u32) -> FromRadio {
    FromRadio {
        id: 0,
        payload_variant: Some(from_radio::PayloadVariant::ConfigCompleteId(config_id)),
    }
}

pub fn encode_envelope(envelope: &FromRadio) -> Vec<u8> {
    encode_from_radio(envelope).expect("test envelope fits in one frame")
}
