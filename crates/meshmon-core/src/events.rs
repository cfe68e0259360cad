//! Events published on the automation bus
//!
//! Consumers only ever receive events; nothing on the bus can feed back into
//! the pipeline.

use uuid::Uuid;

use crate::favorites::FavoriteChange;
use crate::link_quality::LinkQualityRecord;
use crate::node_store::NodeChange;
use crate::packet_log::{DecryptionTag, LogId, PacketRecord};
use crate::protocol::{AppMessage, AppPort, PacketHeader};
use crate::registry::EntryId;
use crate::transport::ConnectionStatus;
use crate::types::{hops_travelled, NodeNum, Timestamp};

/// Header fields of a dispatched packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketSummary {
    pub log_id: LogId,
    pub received_at: Timestamp,
    pub from: NodeNum,
    pub to: NodeNum,
    pub packet_id: u32,
    pub channel: u32,
    pub hops: Option<u8>,
    pub tag: DecryptionTag,
}

impl PacketSummary {
    pub fn new(log_id: LogId, header: &PacketHeader, tag: DecryptionTag, received_at: Timestamp) -> Self {
        Self {
            log_id,
            received_at,
            from: header.from,
            to: header.to,
            packet_id: header.packet_id,
            channel: header.channel,
            hops: header.hops(),
            tag,
        }
    }

    pub fn from_record(record: &PacketRecord) -> Self {
        let packet = &record.packet;
        Self {
            log_id: record.log_id,
            received_at: packet.received_at,
            from: packet.from,
            to: packet.to,
            packet_id: packet.packet_id,
            channel: packet.channel,
            hops: hops_travelled(packet.hop_start, packet.hop_limit),
            tag: packet.tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Connection(ConnectionStatus),
    LocalNodeIdentified {
        node: NodeNum,
    },
    /// The device finished sending its configuration and node database
    ConfigComplete {
        config_id: u32,
    },
    /// Readable packet dispatched to its port handler
    Message {
        packet: PacketSummary,
        message: AppMessage,
    },
    /// Packet no registry key could decrypt
    Undecryptable {
        packet: PacketSummary,
    },
    /// Previously undecryptable packet recovered by reprocessing
    PacketRecovered {
        packet: PacketSummary,
        entry: EntryId,
        message: AppMessage,
    },
    /// Readable packet on a port outside the handler table
    UnknownPort {
        from: NodeNum,
        port: i32,
    },
    NodeCreated {
        node: NodeNum,
    },
    NodeUpdated {
        node: NodeNum,
        change: NodeChange,
    },
    KeyChanged {
        node: NodeNum,
    },
    LinkQuality(LinkQualityRecord),
    Favorite(FavoriteChange),
    TracerouteCompleted {
        destination: NodeNum,
        hops: u8,
    },
    TracerouteFailed {
        destination: NodeNum,
        reason: String,
    },
    SecurityScanCompleted {
        scan_id: Uuid,
        low_entropy: usize,
        duplicate_groups: usize,
        flags_changed: usize,
    },
}

impl MeshEvent {
    /// Node the event concerns, if any
    pub fn node(&self) -> Option<NodeNum> {
        match self {
            MeshEvent::Message { packet, .. }
            | MeshEvent::Undecryptable { packet }
            | MeshEvent::PacketRecovered { packet, .. } => Some(packet.from),
            MeshEvent::LocalNodeIdentified { node }
            | MeshEvent::NodeCreated { node }
            | MeshEvent::NodeUpdated { node, .. }
            | MeshEvent::KeyChanged { node } => Some(*node),
            MeshEvent::UnknownPort { from, .. } => Some(*from),
            MeshEvent::LinkQuality(record) => Some(record.node),
            MeshEvent::Favorite(change) => Some(change.node()),
            MeshEvent::TracerouteCompleted { destination, .. }
            | MeshEvent::TracerouteFailed { destination, .. } => Some(*destination),
            MeshEvent::Connection(_)
            | MeshEvent::ConfigComplete { .. }
            | MeshEvent::SecurityScanCompleted { .. } => None,
        }
    }

    pub fn port(&self) -> Option<AppPort> {
        match self {
            MeshEvent::Message { message, .. } | MeshEvent::PacketRecovered { message, .. } => {
                Some(message.port())
            }
            _ => None,
        }
    }
}
