//! Packet pipeline
//!
//! Per-frame processing in arrival order: envelope decode, duplicate
//! suppression, decryption, packet log append, node store update, link
//! quality scoring and port dispatch. Each call returns the events the frame
//! produced; publishing them is the caller's job.
//!
//! Locks on shared state are taken one at a time and never held across
//! another component's lock.

use std::sync::Arc;

use parking_lot::RwLock;
use prost::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::MeshmonConfig;
use crate::decryption::{DecryptionEngine, EncryptedPayload};
use crate::dedup::DuplicateFilter;
use crate::errors::DecodeError;
use crate::events::{MeshEvent, PacketSummary};
use crate::favorites::FavoriteChange;
use crate::hop_profile::HopSampleLog;
use crate::link_quality::LinkQualityScorer;
use crate::node_store::{NodeChange, NodeInfoUpdate, NodeStore, PositionOutcome, TextRecord};
use crate::packet_log::{DecryptionTag, MemoryPacketLog, NewPacketRecord, PacketLog};
use crate::protocol::schema::{self, mesh_packet, Data, MeshPacket, PortNum, RouteDiscovery, ToRadio};
use crate::protocol::{split_packet, AppMessage, AppPort, Envelope, PacketHeader, PacketPayload};
use crate::registry::ChannelKeyRegistry;
use crate::reprocess::RecoveredPacket;
use crate::requests::{PendingRequest, RequestKind, RequestTracker};
use crate::types::{NodeNum, TimeSource, Timestamp};

/// Hop limit for requests we originate
const REQUEST_HOP_LIMIT: u32 = 7;

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

/// Handles to the state shared between the pipeline, the scanner, the
/// reprocess runner and readers
#[derive(Clone)]
pub struct SharedState {
    pub registry: Arc<RwLock<ChannelKeyRegistry>>,
    pub nodes: Arc<RwLock<NodeStore>>,
    pub link_quality: Arc<RwLock<LinkQualityScorer>>,
    pub hop_samples: Arc<RwLock<HopSampleLog>>,
    pub packet_log: Arc<dyn PacketLog>,
}

impl SharedState {
    pub fn new(config: &MeshmonConfig) -> Self {
        Self {
            registry: Arc::new(RwLock::new(ChannelKeyRegistry::new())),
            nodes: Arc::new(RwLock::new(NodeStore::new(config.node_store.clone()))),
            link_quality: Arc::new(RwLock::new(LinkQualityScorer::new(
                config.link_quality.history_per_node,
            ))),
            hop_samples: Arc::new(RwLock::new(HopSampleLog::new(
                config.link_quality.hop_samples_per_node,
            ))),
            packet_log: Arc::new(MemoryPacketLog::new(config.decoder.packet_log_capacity)),
        }
    }

    pub fn with_registry(mut self, registry: ChannelKeyRegistry) -> Self {
        self.registry = Arc::new(RwLock::new(registry));
        self
    }

    pub fn with_packet_log(mut self, packet_log: Arc<dyn PacketLog>) -> Self {
        self.packet_log = packet_log;
        self
    }
}

impl core::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedState")
            .field("registry_entries", &self.registry.read().len())
            .field("nodes", &self.nodes.read().len())
            .field("packet_log_len", &self.packet_log.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub envelopes: u64,
    pub packets: u64,
    pub duplicates: u64,
    pub decrypted_by_registry: u64,
    pub undecryptable: u64,
    pub unknown_ports: u64,
    pub malformed: u64,
    pub storage_errors: u64,
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

pub struct PacketPipeline {
    state: SharedState,
    clock: Arc<dyn TimeSource>,
    duplicates: DuplicateFilter,
    requests: RequestTracker,
    stats: PipelineStats,
}

impl PacketPipeline {
    pub fn new(state: SharedState, config: &MeshmonConfig, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            state,
            clock,
            duplicates: DuplicateFilter::new(
                config.decoder.duplicate_window_secs,
                config.decoder.duplicate_capacity,
            ),
            requests: RequestTracker::new(config.link_quality.traceroute_timeout_secs),
            stats: PipelineStats::default(),
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn pending_requests(&self) -> &RequestTracker {
        &self.requests
    }

    /// Decode and process one frame payload
    pub fn process_frame(&mut self, frame: &[u8]) -> Result<Vec<MeshEvent>, DecodeError> {
        let envelope = Envelope::decode(frame).map_err(|e| {
            self.stats.malformed += 1;
            e
        })?;
        Ok(self.process_envelope(envelope))
    }

    pub fn process_envelope(&mut self, envelope: Envelope) -> Vec<MeshEvent> {
        self.stats.envelopes += 1;
        match envelope {
            Envelope::Packet(packet) => self.process_packet(packet),
            Envelope::MyInfo(info) => {
                let node = NodeNum::new(info.my_node_num);
                if self.state.nodes.write().set_local_node(node) {
                    vec![MeshEvent::LocalNodeIdentified { node }]
                } else {
                    Vec::new()
                }
            }
            Envelope::NodeInfo(info) => {
                let node = NodeNum::new(info.num);
                let update = self.state.nodes.write().apply_device_node_info(&info);
                node_info_events(node, &update)
            }
            Envelope::ConfigComplete(config_id) => {
                info!(config_id, nodes = self.state.nodes.read().len(), "Device configuration received");
                vec![MeshEvent::ConfigComplete { config_id }]
            }
            Envelope::Rebooted => {
                info!("Device reported a reboot");
                Vec::new()
            }
            Envelope::Other => Vec::new(),
        }
    }

    /// Process one mesh packet
    pub fn process_packet(&mut self, packet: MeshPacket) -> Vec<MeshEvent> {
        let (header, payload) = match split_packet(packet) {
            Ok(split) => split,
            Err(e) => {
                self.stats.malformed += 1;
                debug!(error = %e, "Dropping packet without payload");
                return Vec::new();
            }
        };
        self.stats.packets += 1;
        let now = self.clock.now();

        if self.duplicates.check_and_add(header.from, header.packet_id, now) {
            self.stats.duplicates += 1;
            trace!(from = %header.from, packet_id = header.packet_id, "Rebroadcast copy dropped");
            return Vec::new();
        }

        let (tag, data, stored_payload, encrypted) = self.resolve_payload(&header, payload);

        let record = NewPacketRecord {
            received_at: now,
            from: header.from,
            to: header.to,
            packet_id: header.packet_id,
            channel: header.channel,
            hop_start: header.hop_start,
            hop_limit: header.hop_limit,
            port: data.as_ref().map(|d| d.portnum),
            payload: stored_payload,
            encrypted,
            pki_encrypted: header.pki_encrypted,
            tag,
        };
        let log_id = match self.state.packet_log.append(record) {
            Ok(id) => id,
            Err(e) => {
                self.stats.storage_errors += 1;
                warn!(error = %e, "Packet log append failed, packet dropped");
                return Vec::new();
            }
        };

        // Credit only once the tag is committed to the log
        if let DecryptionTag::Registry(entry) = tag {
            self.stats.decrypted_by_registry += 1;
            self.state.registry.read().credit(entry, now);
        }

        let summary = PacketSummary::new(log_id, &header, tag, now);
        let mut events = self.observe_sender(&header, now);

        let Some(data) = data else {
            self.stats.undecryptable += 1;
            events.push(MeshEvent::Undecryptable { packet: summary });
            return events;
        };

        let port = AppPort::from_portnum(data.portnum);
        if let AppPort::Unrecognized(raw) = port {
            self.stats.unknown_ports += 1;
            debug!(from = %header.from, port = raw, "Unrecognized port, dropped");
            events.push(MeshEvent::UnknownPort {
                from: header.from,
                port: raw,
            });
            return events;
        }

        let message = match AppMessage::decode(port, &data.payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(from = %header.from, port = port.name(), error = %e, "Malformed payload dropped");
                return events;
            }
        };

        self.dispatch(&header, &data, &message, now, &mut events);
        events.push(MeshEvent::Message {
            packet: summary,
            message,
        });
        events
    }

    /// Decide the decryption tag and recover the payload where possible
    fn resolve_payload(
        &self,
        header: &PacketHeader,
        payload: PacketPayload,
    ) -> (DecryptionTag, Option<Data>, Vec<u8>, bool) {
        match payload {
            PacketPayload::Decoded(data) => {
                let local = self.state.nodes.read().local_node();
                let tag = if local == Some(header.from) {
                    DecryptionTag::NotEncrypted
                } else {
                    DecryptionTag::DecryptedBySource
                };
                let stored = data.payload.clone();
                (tag, Some(data), stored, false)
            }
            // Direct messages are sealed to a node key, channel keys cannot apply
            PacketPayload::Encrypted(ciphertext) if header.pki_encrypted => {
                (DecryptionTag::Undecryptable, None, ciphertext, true)
            }
            PacketPayload::Encrypted(ciphertext) => {
                let entries = self.state.registry.read().enabled_in_order();
                let outcome = DecryptionEngine::attempt(
                    &entries,
                    &EncryptedPayload {
                        from: header.from,
                        packet_id: header.packet_id,
                        channel_hash: header.channel_hash(),
                        ciphertext: &ciphertext,
                    },
                );
                let tag = outcome.tag();
                (tag, outcome.matched.map(|(_, data)| data), ciphertext, true)
            }
        }
    }

    /// Last-heard, signal, hop distance and link quality for the sender
    fn observe_sender(&mut self, header: &PacketHeader, now: Timestamp) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        let from = header.from;
        let hops = header.hops();

        let is_local = {
            let mut nodes = self.state.nodes.write();
            if nodes.touch(from, now) {
                events.push(MeshEvent::NodeCreated { node: from });
            }
            nodes.record_signal(from, header.rx_snr, header.rx_rssi, header.via_mqtt);
            if let Some(hops) = hops {
                if nodes.record_message_hops(from, hops) {
                    events.push(MeshEvent::NodeUpdated {
                        node: from,
                        change: NodeChange::HopDistance,
                    });
                }
            }
            if let Some(change) = nodes.evaluate_auto_favorite(from, now) {
                events.push(MeshEvent::Favorite(change));
            }
            nodes.local_node() == Some(from)
        };

        if let (Some(hops), false) = (hops, is_local) {
            self.state.hop_samples.write().record(from, hops, now);
            if let Some(record) = self.state.link_quality.write().observe_hops(from, hops, now) {
                events.push(MeshEvent::LinkQuality(record));
            }
        }
        events
    }

    /// Port handlers
    fn dispatch(
        &mut self,
        header: &PacketHeader,
        data: &Data,
        message: &AppMessage,
        now: Timestamp,
        events: &mut Vec<MeshEvent>,
    ) {
        let from = header.from;
        match message {
            AppMessage::Text { text } => {
                self.state.nodes.write().record_text(TextRecord {
                    at: now,
                    from,
                    to: header.to,
                    channel: header.channel,
                    packet_id: header.packet_id,
                    hops: header.hops(),
                    text: text.clone(),
                });
            }
            AppMessage::Position(position) => {
                if self.state.nodes.write().apply_position(from, position) == PositionOutcome::Updated {
                    events.push(MeshEvent::NodeUpdated {
                        node: from,
                        change: NodeChange::Position,
                    });
                }
            }
            AppMessage::NodeInfo(user) => {
                let update = self
                    .state
                    .nodes
                    .write()
                    .apply_node_info(from, user, header.hops(), now);
                events.extend(node_info_events(from, &update));
            }
            AppMessage::Telemetry(telemetry) => {
                if self.state.nodes.write().apply_telemetry(from, telemetry, now) {
                    events.push(MeshEvent::NodeUpdated {
                        node: from,
                        change: NodeChange::Telemetry,
                    });
                }
            }
            AppMessage::Traceroute(route) => self.handle_traceroute(from, data, route, now, events),
            AppMessage::Routing(_) => self.handle_routing(data, message, now, events),
            AppMessage::NeighborInfo(info) => {
                self.state.nodes.write().apply_neighbors(from, info);
                events.push(MeshEvent::NodeUpdated {
                    node: from,
                    change: NodeChange::Neighbors,
                });
            }
            AppMessage::Paxcounter(pax) => {
                self.state.nodes.write().apply_paxcount(from, pax, now);
                events.push(MeshEvent::NodeUpdated {
                    node: from,
                    change: NodeChange::Paxcount,
                });
            }
            AppMessage::CompressedText { .. }
            | AppMessage::Admin { .. }
            | AppMessage::Waypoint(_)
            | AppMessage::RangeTest { .. }
            | AppMessage::StoreForward { .. } => {}
        }
    }

    fn handle_traceroute(
        &mut self,
        from: NodeNum,
        data: &Data,
        route: &RouteDiscovery,
        now: Timestamp,
        events: &mut Vec<MeshEvent>,
    ) {
        // Requests passing through carry partial routes; only replies count
        if data.request_id == 0 {
            return;
        }
        if self.state.nodes.write().apply_traceroute(from, route, now) {
            events.push(MeshEvent::NodeUpdated {
                node: from,
                change: NodeChange::HopDistance,
            });
        }
        events.push(MeshEvent::NodeUpdated {
            node: from,
            change: NodeChange::Route,
        });
        if let Some(request) = self.requests.take(data.request_id) {
            let hops = u8::try_from(route.route.len()).unwrap_or(u8::MAX);
            info!(destination = %request.destination, hops, "Traceroute completed");
            events.push(MeshEvent::TracerouteCompleted {
                destination: request.destination,
                hops,
            });
        }
    }

    fn handle_routing(&mut self, data: &Data, message: &AppMessage, now: Timestamp, events: &mut Vec<MeshEvent>) {
        let Some(reason) = message.routing_error() else {
            return;
        };
        if reason == schema::RoutingError::None {
            return;
        }
        let Some(request) = self.requests.take(data.request_id) else {
            return;
        };

        let destination = request.destination;
        let record = match reason {
            schema::RoutingError::Timeout
            | schema::RoutingError::NoResponse
            | schema::RoutingError::MaxRetransmit => {
                Some(self.state.link_quality.write().record_traceroute_timeout(destination, now))
            }
            schema::RoutingError::PkiFailed | schema::RoutingError::PkiUnknownPubkey => {
                Some(self.state.link_quality.write().record_crypto_failure(destination, now))
            }
            _ => None,
        };
        warn!(destination = %destination, ?reason, "Traceroute failed");
        if let Some(record) = record {
            events.push(MeshEvent::LinkQuality(record));
        }
        events.push(MeshEvent::TracerouteFailed {
            destination,
            reason: format!("{:?}", reason),
        });
    }

    // ------------------------------------------------------------------------
    // Outbound requests and periodic work
    // ------------------------------------------------------------------------

    /// Build a traceroute request to `destination` and track it
    pub fn prepare_traceroute(&mut self, destination: NodeNum, packet_id: u32) -> ToRadio {
        let now = self.clock.now();
        self.requests
            .register(packet_id, destination, RequestKind::Traceroute, now);
        ToRadio::packet(MeshPacket {
            to: destination.value(),
            id: packet_id,
            hop_limit: REQUEST_HOP_LIMIT,
            want_ack: true,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
                portnum: PortNum::TracerouteApp as i32,
                payload: RouteDiscovery::default().encode_to_vec(),
                want_response: true,
                ..Default::default()
            })),
            ..Default::default()
        })
    }

    /// Forget a request that could not be sent
    pub fn cancel_request(&mut self, packet_id: u32) -> Option<PendingRequest> {
        self.requests.take(packet_id)
    }

    /// Penalise requests that went unanswered past their deadline
    pub fn expire_requests(&mut self) -> Vec<MeshEvent> {
        let now = self.clock.now();
        let mut events = Vec::new();
        for request in self.requests.expire(now) {
            let record = self
                .state
                .link_quality
                .write()
                .record_traceroute_timeout(request.destination, now);
            warn!(destination = %request.destination, "Traceroute timed out");
            events.push(MeshEvent::LinkQuality(record));
            events.push(MeshEvent::TracerouteFailed {
                destination: request.destination,
                reason: "timed out".to_string(),
            });
        }
        events
    }

    pub fn sweep_favorites(&mut self) -> Vec<MeshEvent> {
        let now = self.clock.now();
        let changes: Vec<FavoriteChange> = self.state.nodes.write().sweep_auto_favorites(now);
        changes.into_iter().map(MeshEvent::Favorite).collect()
    }

    /// Events for packets recovered by reprocessing
    pub fn recovered_events(recovered: &[RecoveredPacket]) -> Vec<MeshEvent> {
        recovered
            .iter()
            .filter_map(|packet| {
                let port = AppPort::from_portnum(packet.data.portnum);
                let message = AppMessage::decode(port, &packet.data.payload).ok()?;
                Some(MeshEvent::PacketRecovered {
                    packet: PacketSummary::from_record(&packet.record),
                    entry: packet.entry,
                    message,
                })
            })
            .collect()
    }
}

fn node_info_events(node: NodeNum, update: &NodeInfoUpdate) -> Vec<MeshEvent> {
    let mut events = Vec::new();
    if update.created {
        events.push(MeshEvent::NodeCreated { node });
    }
    if update.identity_changed {
        events.push(MeshEvent::NodeUpdated {
            node,
            change: NodeChange::Identity,
        });
    }
    if update.key_changed {
        events.push(MeshEvent::KeyChanged { node });
    }
    if update.hops_changed {
        events.push(MeshEvent::NodeUpdated {
            node,
            change: NodeChange::HopDistance,
        });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualTimeSource, PacketBuilder};

    fn pipeline() -> (PacketPipeline, Arc<ManualTimeSource>) {
        let config = MeshmonConfig::testing();
        let clock = Arc::new(ManualTimeSource::new(Timestamp::new(1_000_000)));
        let pipeline = PacketPipeline::new(SharedState::new(&config), &config, clock.clone());
        (pipeline, clock)
    }

    #[test]
    fn test_decoded_packet_tags() {
        let (mut pipeline, _) = pipeline();
        pipeline.process_envelope(Envelope::MyInfo(schema::MyNodeInfo {
            my_node_num: 1,
            ..Default::default()
        }));

        pipeline.process_packet(PacketBuilder::text(1, "from me").id(10).build());
        pipeline.process_packet(PacketBuilder::text(2, "from them").id(11).build());

        let counts = pipeline.state().packet_log.tag_counts();
        assert_eq!(counts.not_encrypted, 1);
        assert_eq!(counts.decrypted_by_source, 1);
    }

    #[test]
    fn test_duplicates_dropped() {
        let (mut pipeline, _) = pipeline();
        let packet = PacketBuilder::text(2, "hello").id(42).hops(3, 2).build();
        assert!(!pipeline.process_packet(packet.clone()).is_empty());
        assert!(pipeline.process_packet(packet).is_empty());
        assert_eq!(pipeline.stats().duplicates, 1);
        assert_eq!(pipeline.state().packet_log.len(), 1);
    }

    #[test]
    fn test_unknown_port_dropped_but_sender_tracked() {
        let (mut pipeline, _) = pipeline();
        let packet = PacketBuilder::data(5, 999, b"opaque".to_vec()).id(7).build();
        let events = pipeline.process_packet(packet);
        assert!(events.contains(&MeshEvent::UnknownPort {
            from: NodeNum::new(5),
            port: 999
        }));
        assert!(!events.iter().any(|e| matches!(e, MeshEvent::Message { .. })));
        assert!(pipeline.state().nodes.read().get(NodeNum::new(5)).is_some());
        assert_eq!(pipeline.stats().unknown_ports, 1);
    }

    #[test]
    fn test_traceroute_timeout_penalises_destination() {
        let (mut pipeline, clock) = pipeline();
        let dest = NodeNum::new(9);
        pipeline.process_packet(PacketBuilder::text(9, "hi").id(1).hops(3, 1).build());
        assert_eq!(pipeline.state().link_quality.read().score(dest), Some(8));

        pipeline.prepare_traceroute(dest, 500);
        clock.advance_secs(MeshmonConfig::testing().link_quality.traceroute_timeout_secs + 1);
        let events = pipeline.expire_requests();
        assert!(events
            .iter()
            .any(|e| matches!(e, MeshEvent::TracerouteFailed { destination, .. } if *destination == dest)));
        assert_eq!(pipeline.state().link_quality.read().score(dest), Some(6));
    }

    #[test]
    fn test_pki_routing_error_penalises_destination() {
        let (mut pipeline, _) = pipeline();
        let dest = NodeNum::new(9);
        pipeline.process_packet(PacketBuilder::text(9, "hi").id(1).hops(3, 3).build());
        pipeline.prepare_traceroute(dest, 600);

        let nak = PacketBuilder::routing_error(9, schema::RoutingError::PkiFailed, 600)
            .id(2)
            .build();
        pipeline.process_packet(nak);
        assert_eq!(pipeline.state().link_quality.read().score(dest), Some(5));
        assert!(pipeline.pending_requests().is_empty());
    }

    #[test]
    fn test_traceroute_reply_sets_route() {
        let (mut pipeline, _) = pipeline();
        let dest = NodeNum::new(9);
        pipeline.prepare_traceroute(dest, 700);
        let reply = PacketBuilder::traceroute_reply(9, vec![3, 4], 700).id(3).build();
        let events = pipeline.process_packet(reply);

        assert!(events.contains(&MeshEvent::TracerouteCompleted {
            destination: dest,
            hops: 2
        }));
        let nodes = pipeline.state().nodes.read();
        assert_eq!(nodes.get(dest).unwrap().last_route.as_ref().unwrap().towards.len(), 2);
    }
}
