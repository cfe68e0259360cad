//! Node state store
//!
//! Authoritative per-node records derived from received packets. Nodes are
//! created on first sighting and never deleted. `last_heard` only moves
//! forward, the local node's position is pinned while a fixed position is
//! configured, and the security flags are written only through
//! `NodeStore::apply_security_flags`, which the scanner owns.

use std::collections::VecDeque;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::config::{FixedPosition, HopPolicy, NodeStoreConfig};
use crate::protocol::schema::{self, telemetry, NeighborInfo, Paxcount, RouteDiscovery, Telemetry, User};
use crate::security::KeySnapshot;
use crate::types::{NodeNum, Timestamp};

// ----------------------------------------------------------------------------
// Node Role
// ----------------------------------------------------------------------------

/// Device role as reported in NodeInfo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Client,
    ClientMute,
    Router,
    RouterClient,
    Repeater,
    Tracker,
    Sensor,
    Tak,
    ClientHidden,
    LostAndFound,
    TakTracker,
    RouterLate,
    ClientBase,
    Unknown,
}

impl NodeRole {
    pub fn from_wire(role: i32) -> Self {
        match schema::Role::try_from(role) {
            Ok(schema::Role::Client) => NodeRole::Client,
            Ok(schema::Role::ClientMute) => NodeRole::ClientMute,
            Ok(schema::Role::Router) => NodeRole::Router,
            Ok(schema::Role::RouterClient) => NodeRole::RouterClient,
            Ok(schema::Role::Repeater) => NodeRole::Repeater,
            Ok(schema::Role::Tracker) => NodeRole::Tracker,
            Ok(schema::Role::Sensor) => NodeRole::Sensor,
            Ok(schema::Role::Tak) => NodeRole::Tak,
            Ok(schema::Role::ClientHidden) => NodeRole::ClientHidden,
            Ok(schema::Role::LostAndFound) => NodeRole::LostAndFound,
            Ok(schema::Role::TakTracker) => NodeRole::TakTracker,
            Ok(schema::Role::RouterLate) => NodeRole::RouterLate,
            Ok(schema::Role::ClientBase) => NodeRole::ClientBase,
            Err(_) => NodeRole::Unknown,
        }
    }

    /// Roles that rebroadcast traffic for the mesh
    pub fn is_relay_capable(&self) -> bool {
        matches!(
            self,
            NodeRole::Router | NodeRole::RouterLate | NodeRole::Repeater | NodeRole::RouterClient
        )
    }

    pub fn is_base_client(&self) -> bool {
        matches!(self, NodeRole::ClientBase)
    }
}

impl Default for NodeRole {
    fn default() -> Self {
        NodeRole::Unknown
    }
}

// ----------------------------------------------------------------------------
// Per-node detail records
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    pub time: Option<Timestamp>,
    pub precision_bits: u32,
}

impl NodePosition {
    /// Convert a wire position; `None` when the sender has no fix
    pub fn from_wire(position: &schema::Position) -> Option<Self> {
        let (lat, lon) = (position.latitude_i?, position.longitude_i?);
        if lat == 0 && lon == 0 {
            return None;
        }
        Some(Self {
            latitude: f64::from(lat) * 1e-7,
            longitude: f64::from(lon) * 1e-7,
            altitude: position.altitude,
            time: (position.time != 0).then(|| Timestamp::from_secs(u64::from(position.time))),
            precision_bits: position.precision_bits,
        })
    }

    pub fn from_fixed(fixed: &FixedPosition) -> Self {
        Self {
            latitude: fixed.latitude,
            longitude: fixed.longitude,
            altitude: fixed.altitude,
            time: None,
            precision_bits: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTelemetry {
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
}

impl From<&schema::DeviceMetrics> for DeviceTelemetry {
    fn from(m: &schema::DeviceMetrics) -> Self {
        Self {
            battery_level: m.battery_level,
            voltage: m.voltage,
            channel_utilization: m.channel_utilization,
            air_util_tx: m.air_util_tx,
            uptime_seconds: m.uptime_seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentTelemetry {
    pub temperature: Option<f32>,
    pub relative_humidity: Option<f32>,
    pub barometric_pressure: Option<f32>,
}

impl From<&schema::EnvironmentMetrics> for EnvironmentTelemetry {
    fn from(m: &schema::EnvironmentMetrics) -> Self {
        Self {
            temperature: m.temperature,
            relative_humidity: m.relative_humidity,
            barometric_pressure: m.barometric_pressure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TelemetrySample {
    Device { at: Timestamp, metrics: DeviceTelemetry },
    Environment { at: Timestamp, metrics: EnvironmentTelemetry },
}

/// Latest traceroute result for a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracerouteRoute {
    pub at: Timestamp,
    /// Intermediate hops from us towards the node
    pub towards: SmallVec<[NodeNum; 8]>,
    /// Intermediate hops on the way back, when reported
    pub back: SmallVec<[NodeNum; 8]>,
    /// SNR per hop in dB
    pub snr_towards: Vec<f32>,
}

impl TracerouteRoute {
    pub fn from_wire(route: &RouteDiscovery, at: Timestamp) -> Self {
        Self {
            at,
            towards: route.route.iter().copied().map(NodeNum::new).collect(),
            back: route.route_back.iter().copied().map(NodeNum::new).collect(),
            snr_towards: route.snr_towards.iter().map(|s| *s as f32 / 4.0).collect(),
        }
    }

    /// Hops between us and the node along the forward path
    pub fn hop_count(&self) -> u8 {
        u8::try_from(self.towards.len()).unwrap_or(u8::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub node: NodeNum,
    pub snr: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxcountSample {
    pub at: Timestamp,
    pub wifi: u32,
    pub ble: u32,
    pub uptime: u32,
}

/// Text message kept in the store's bounded message log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRecord {
    pub at: Timestamp,
    pub from: NodeNum,
    pub to: NodeNum,
    pub channel: u32,
    pub packet_id: u32,
    pub hops: Option<u8>,
    pub text: String,
}

/// Scanner-owned flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFlags {
    pub key_is_low_entropy: bool,
    pub duplicate_key_detected: bool,
    pub detail: Option<String>,
}

/// Hop distance as last reported by each source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct HopEstimates {
    node_info: Option<u8>,
    traceroute: Option<u8>,
    latest_message: Option<u8>,
}

impl HopEstimates {
    fn for_policy(&self, policy: HopPolicy) -> Option<u8> {
        match policy {
            HopPolicy::NodeInfo => self.node_info,
            HopPolicy::Traceroute => self.traceroute,
            HopPolicy::LatestMessage => self.latest_message,
        }
    }
}

// ----------------------------------------------------------------------------
// Node
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub num: NodeNum,
    /// User id string as broadcast by the node (normally `!xxxxxxxx`)
    pub user_id: String,
    pub long_name: String,
    pub short_name: String,
    pub hw_model: i32,
    pub role: NodeRole,
    pub public_key: Option<Vec<u8>>,
    pub hops_away: Option<u8>,
    pub last_heard: Option<Timestamp>,
    pub position: Option<NodePosition>,
    pub is_favorite: bool,
    /// Favourite set by auto-management rather than by an operator
    pub auto_favorite: bool,
    /// Operator removed the favourite; auto-management leaves it alone
    pub favorite_locked: bool,
    /// Public key changed since the last security scan
    pub needs_key_scan: bool,
    pub key_changed_at: Option<Timestamp>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub via_mqtt: bool,
    pub device_metrics: Option<DeviceTelemetry>,
    pub environment: Option<EnvironmentTelemetry>,
    pub telemetry_history: VecDeque<TelemetrySample>,
    pub last_route: Option<TracerouteRoute>,
    pub neighbors: Vec<NeighborEntry>,
    pub paxcount: Option<PaxcountSample>,
    security: SecurityFlags,
    hop_estimates: HopEstimates,
}

impl Node {
    pub fn new(num: NodeNum) -> Self {
        Self {
            num,
            user_id: num.display_id(),
            long_name: String::new(),
            short_name: String::new(),
            hw_model: 0,
            role: NodeRole::Unknown,
            public_key: None,
            hops_away: None,
            last_heard: None,
            position: None,
            is_favorite: false,
            auto_favorite: false,
            favorite_locked: false,
            needs_key_scan: false,
            key_changed_at: None,
            snr: None,
            rssi: None,
            via_mqtt: false,
            device_metrics: None,
            environment: None,
            telemetry_history: VecDeque::new(),
            last_route: None,
            neighbors: Vec::new(),
            paxcount: None,
            security: SecurityFlags::default(),
            hop_estimates: HopEstimates::default(),
        }
    }

    pub fn display_id(&self) -> String {
        self.num.display_id()
    }

    pub fn key_is_low_entropy(&self) -> bool {
        self.security.key_is_low_entropy
    }

    pub fn duplicate_key_detected(&self) -> bool {
        self.security.duplicate_key_detected
    }

    pub fn security_detail(&self) -> Option<&str> {
        self.security.detail.as_deref()
    }

    pub fn security_flags(&self) -> &SecurityFlags {
        &self.security
    }

    fn advance_last_heard(&mut self, at: Timestamp) {
        if self.last_heard.map_or(true, |prev| at > prev) {
            self.last_heard = Some(at);
        }
    }
}

// ----------------------------------------------------------------------------
// Update outcomes
// ----------------------------------------------------------------------------

/// Kind of change a store update made, published on the event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeChange {
    Identity,
    PublicKey,
    Position,
    Telemetry,
    Route,
    Neighbors,
    Paxcount,
    HopDistance,
    Favorite,
    SecurityFlags,
}

/// Result of applying a NodeInfo
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfoUpdate {
    pub created: bool,
    pub identity_changed: bool,
    pub key_changed: bool,
    pub hops_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionOutcome {
    Updated,
    /// Local node position is pinned to the configured fixed position
    IgnoredFixed,
    /// Position packet carried no fix
    NoFix,
}

// ----------------------------------------------------------------------------
// Node Store
// ----------------------------------------------------------------------------

/// In-memory node state store
#[derive(Debug)]
pub struct NodeStore {
    nodes: HashMap<NodeNum, Node>,
    local_node: Option<NodeNum>,
    fixed_position: Option<FixedPosition>,
    messages: VecDeque<TextRecord>,
    pub(crate) config: NodeStoreConfig,
}

impl NodeStore {
    pub fn new(config: NodeStoreConfig) -> Self {
        Self {
            nodes: HashMap::new(),
            local_node: None,
            fixed_position: config.fixed_position,
            messages: VecDeque::new(),
            config,
        }
    }

    pub fn config(&self) -> &NodeStoreConfig {
        &self.config
    }

    pub fn get(&self, num: NodeNum) -> Option<&Node> {
        self.nodes.get(&num)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All nodes sorted by node number
    pub fn node_list(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.num);
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn messages(&self) -> &VecDeque<TextRecord> {
        &self.messages
    }

    // ------------------------------------------------------------------------
    // Local node
    // ------------------------------------------------------------------------

    /// Record which node the connected device is; returns `true` if it changed
    pub fn set_local_node(&mut self, num: NodeNum) -> bool {
        if self.local_node == Some(num) {
            return false;
        }
        self.local_node = Some(num);
        let node = self.nodes.entry(num).or_insert_with(|| Node::new(num));
        node.hops_away = Some(0);
        if let Some(fixed) = &self.fixed_position {
            node.position = Some(NodePosition::from_fixed(fixed));
        }
        info!(node = %num, "Local node identified");
        true
    }

    pub fn local_node(&self) -> Option<NodeNum> {
        self.local_node
    }

    pub fn local_role(&self) -> NodeRole {
        self.local_node
            .and_then(|num| self.nodes.get(&num))
            .map_or(NodeRole::Unknown, |n| n.role)
    }

    pub fn fixed_position(&self) -> Option<FixedPosition> {
        self.fixed_position
    }

    /// Pin the local node's position; the only way to move it while pinned
    pub fn set_local_fixed_position(&mut self, fixed: FixedPosition) {
        self.fixed_position = Some(fixed);
        if let Some(node) = self.local_node.and_then(|num| self.nodes.get_mut(&num)) {
            node.position = Some(NodePosition::from_fixed(&fixed));
        }
        info!(
            latitude = fixed.latitude,
            longitude = fixed.longitude,
            "Local fixed position set"
        );
    }

    /// Stop pinning; the next position broadcast from the local node applies
    pub fn clear_local_fixed_position(&mut self) {
        self.fixed_position = None;
    }

    // ------------------------------------------------------------------------
    // Message-driven updates
    // ------------------------------------------------------------------------

    /// Ensure the node exists and advance `last_heard`; returns `true` when
    /// the node was created
    pub fn touch(&mut self, num: NodeNum, at: Timestamp) -> bool {
        let mut created = false;
        let node = self.nodes.entry(num).or_insert_with(|| {
            created = true;
            Node::new(num)
        });
        node.advance_last_heard(at);
        if created {
            debug!(node = %num, "Node created");
        }
        created
    }

    /// Radio metrics of the latest packet heard directly or via relays
    pub fn record_signal(&mut self, num: NodeNum, snr: f32, rssi: i32, via_mqtt: bool) {
        if let Some(node) = self.nodes.get_mut(&num) {
            if snr != 0.0 {
                node.snr = Some(snr);
            }
            if rssi != 0 {
                node.rssi = Some(rssi);
            }
            node.via_mqtt = via_mqtt;
        }
    }

    /// Hop count derived from any message; returns `true` if `hops_away` changed
    pub fn record_message_hops(&mut self, num: NodeNum, hops: u8) -> bool {
        self.update_estimate(num, |est| est.latest_message = Some(hops))
    }

    /// Authoritative identity update from a NodeInfo broadcast
    pub fn apply_node_info(
        &mut self,
        num: NodeNum,
        user: &User,
        hops: Option<u8>,
        at: Timestamp,
    ) -> NodeInfoUpdate {
        let created = self.touch(num, at);
        let mut update = NodeInfoUpdate {
            created,
            ..Default::default()
        };

        if let Some(node) = self.nodes.get_mut(&num) {
            update.identity_changed = apply_user(node, user);
            update.key_changed = apply_public_key(node, &user.public_key, at);
        }
        if let Some(hops) = hops {
            update.hops_changed = self.update_estimate(num, |est| est.node_info = Some(hops));
        }
        update
    }

    /// Seed from an entry of the device's node database
    pub fn apply_device_node_info(&mut self, info: &schema::NodeInfo) -> NodeInfoUpdate {
        let num = NodeNum::new(info.num);
        let mut created = false;
        let node = self.nodes.entry(num).or_insert_with(|| {
            created = true;
            Node::new(num)
        });
        if info.last_heard != 0 {
            node.advance_last_heard(Timestamp::from_secs(u64::from(info.last_heard)));
        }
        if info.snr != 0.0 {
            node.snr = Some(info.snr);
        }
        node.via_mqtt = info.via_mqtt;
        if let Some(metrics) = &info.device_metrics {
            node.device_metrics = Some(DeviceTelemetry::from(metrics));
        }

        let mut update = NodeInfoUpdate {
            created,
            ..Default::default()
        };
        let at = node.last_heard.unwrap_or(Timestamp::new(0));
        if let Some(user) = &info.user {
            update.identity_changed = apply_user(node, user);
            update.key_changed = apply_public_key(node, &user.public_key, at);
        }
        if let Some(position) = &info.position {
            self.apply_position(num, position);
        }
        if let Some(hops) = info.hops_away.and_then(|h| u8::try_from(h).ok()) {
            update.hops_changed = self.update_estimate(num, |est| est.node_info = Some(hops));
        }
        update
    }

    /// Position broadcast; ignored for the local node while a fixed position
    /// is configured
    pub fn apply_position(&mut self, num: NodeNum, position: &schema::Position) -> PositionOutcome {
        if self.fixed_position.is_some() && self.local_node == Some(num) {
            debug!(node = %num, "Ignoring local position broadcast, fixed position configured");
            return PositionOutcome::IgnoredFixed;
        }
        let Some(converted) = NodePosition::from_wire(position) else {
            return PositionOutcome::NoFix;
        };
        let node = self.nodes.entry(num).or_insert_with(|| Node::new(num));
        node.position = Some(converted);
        PositionOutcome::Updated
    }

    /// Store device or environment telemetry; returns `false` when empty
    pub fn apply_telemetry(&mut self, num: NodeNum, telemetry: &Telemetry, at: Timestamp) -> bool {
        let history_limit = self.config.telemetry_history;
        let Some(node) = self.nodes.get_mut(&num) else {
            return false;
        };
        let sample = match &telemetry.variant {
            Some(telemetry::Variant::DeviceMetrics(m)) => {
                let metrics = DeviceTelemetry::from(m);
                node.device_metrics = Some(metrics);
                TelemetrySample::Device { at, metrics }
            }
            Some(telemetry::Variant::EnvironmentMetrics(m)) => {
                let metrics = EnvironmentTelemetry::from(m);
                node.environment = Some(metrics);
                TelemetrySample::Environment { at, metrics }
            }
            None => return false,
        };
        node.telemetry_history.push_back(sample);
        while node.telemetry_history.len() > history_limit {
            node.telemetry_history.pop_front();
        }
        true
    }

    /// Traceroute result for `num`; returns `true` if `hops_away` changed
    pub fn apply_traceroute(&mut self, num: NodeNum, route: &RouteDiscovery, at: Timestamp) -> bool {
        let route = TracerouteRoute::from_wire(route, at);
        let hops = route.hop_count();
        let node = self.nodes.entry(num).or_insert_with(|| Node::new(num));
        node.last_route = Some(route);
        self.update_estimate(num, |est| est.traceroute = Some(hops))
    }

    pub fn apply_neighbors(&mut self, num: NodeNum, info: &NeighborInfo) {
        let node = self.nodes.entry(num).or_insert_with(|| Node::new(num));
        node.neighbors = info
            .neighbors
            .iter()
            .map(|n| NeighborEntry {
                node: NodeNum::new(n.node_id),
                snr: n.snr,
            })
            .collect();
    }

    pub fn apply_paxcount(&mut self, num: NodeNum, pax: &Paxcount, at: Timestamp) {
        let node = self.nodes.entry(num).or_insert_with(|| Node::new(num));
        node.paxcount = Some(PaxcountSample {
            at,
            wifi: pax.wifi,
            ble: pax.ble,
            uptime: pax.uptime,
        });
    }

    pub fn record_text(&mut self, record: TextRecord) {
        self.messages.push_back(record);
        while self.messages.len() > self.config.message_history {
            self.messages.pop_front();
        }
    }

    // ------------------------------------------------------------------------
    // Security flags
    // ------------------------------------------------------------------------

    /// Public keys of every node, as scanned by the security scanner
    pub fn key_snapshot(&self) -> Vec<KeySnapshot> {
        let mut snapshot: Vec<KeySnapshot> = self
            .nodes
            .values()
            .map(|n| KeySnapshot {
                node: n.num,
                public_key: n.public_key.clone(),
            })
            .collect();
        snapshot.sort_by_key(|s| s.node);
        snapshot
    }

    /// Replace a node's scanner flags; returns `true` if they changed
    ///
    /// Also clears `needs_key_scan` when the scanned key is still current.
    pub fn apply_security_flags(
        &mut self,
        num: NodeNum,
        flags: SecurityFlags,
        scanned_key: Option<&[u8]>,
    ) -> bool {
        let Some(node) = self.nodes.get_mut(&num) else {
            return false;
        };
        if node.public_key.as_deref() == scanned_key {
            node.needs_key_scan = false;
        }
        if node.security == flags {
            return false;
        }
        node.security = flags;
        true
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Replace the store's contents with restored nodes
    pub fn restore(&mut self, local_node: Option<NodeNum>, nodes: Vec<Node>) {
        self.nodes = nodes.into_iter().map(|n| (n.num, n)).collect();
        self.local_node = local_node;
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    pub(crate) fn node_mut(&mut self, num: NodeNum) -> Option<&mut Node> {
        self.nodes.get_mut(&num)
    }

    pub(crate) fn node_nums(&self) -> Vec<NodeNum> {
        let mut nums: Vec<NodeNum> = self.nodes.keys().copied().collect();
        nums.sort();
        nums
    }

    fn update_estimate<F: FnOnce(&mut HopEstimates)>(&mut self, num: NodeNum, apply: F) -> bool {
        let policy = self.config.hop_policy;
        let Some(node) = self.nodes.get_mut(&num) else {
            return false;
        };
        apply(&mut node.hop_estimates);
        let active = node.hop_estimates.for_policy(policy);
        if active.is_some() && active != node.hops_away {
            node.hops_away = active;
            return true;
        }
        false
    }
}

fn apply_user(node: &mut Node, user: &User) -> bool {
    let role = NodeRole::from_wire(user.role);
    let changed = node.long_name != user.long_name
        || node.short_name != user.short_name
        || node.hw_model != user.hw_model
        || node.role != role
        || (!user.id.is_empty() && node.user_id != user.id);
    if !user.id.is_empty() {
        node.user_id = user.id.clone();
    }
    node.long_name = user.long_name.clone();
    node.short_name = user.short_name.clone();
    node.hw_model = user.hw_model;
    node.role = role;
    changed
}

/// Record a broadcast public key; a different key marks the node for scanning
fn apply_public_key(node: &mut Node, key: &[u8], at: Timestamp) -> bool {
    if key.is_empty() || node.public_key.as_deref() == Some(key) {
        return false;
    }
    let replaced = node.public_key.is_some();
    node.public_key = Some(key.to_vec());
    node.needs_key_scan = true;
    node.key_changed_at = Some(at);
    if replaced {
        info!(node = %node.num, "Public key changed, queued for next security scan");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> NodeStore {
        NodeStore::new(NodeStoreConfig::default())
    }

    fn user(long: &str, role: schema::Role, key: &[u8]) -> User {
        User {
            id: String::new(),
            long_name: long.into(),
            short_name: long.chars().take(4).collect(),
            role: role as i32,
            public_key: key.to_vec(),
            ..Default::default()
        }
    }

    fn position(lat: f64, lon: f64) -> schema::Position {
        schema::Position {
            latitude_i: Some((lat * 1e7) as i32),
            longitude_i: Some((lon * 1e7) as i32),
            ..Default::default()
        }
    }

    #[test]
    fn test_last_heard_only_moves_forward() {
        let mut store = store();
        let node = NodeNum::new(1);
        assert!(store.touch(node, Timestamp::new(5_000)));
        assert!(!store.touch(node, Timestamp::new(3_000)));
        assert_eq!(store.get(node).unwrap().last_heard, Some(Timestamp::new(5_000)));
        store.touch(node, Timestamp::new(9_000));
        assert_eq!(store.get(node).unwrap().last_heard, Some(Timestamp::new(9_000)));
    }

    #[test]
    fn test_node_info_updates_identity_and_key() {
        let mut store = store();
        let node = NodeNum::new(0xabc);
        let at = Timestamp::new(1_000);

        let update = store.apply_node_info(node, &user("Alpha", schema::Role::Router, &[1; 32]), Some(1), at);
        assert!(update.created);
        assert!(update.key_changed);
        let record = store.get(node).unwrap();
        assert_eq!(record.long_name, "Alpha");
        assert_eq!(record.role, NodeRole::Router);
        assert!(record.needs_key_scan);

        let update = store.apply_node_info(node, &user("Alpha", schema::Role::Router, &[1; 32]), Some(1), at);
        assert!(!update.created);
        assert!(!update.key_changed);
        assert!(!update.identity_changed);

        let update = store.apply_node_info(node, &user("Alpha", schema::Role::Router, &[2; 32]), Some(1), at);
        assert!(update.key_changed);
    }

    #[test]
    fn test_fixed_position_pins_local_node() {
        let mut config = NodeStoreConfig::default();
        config.fixed_position = Some(FixedPosition {
            latitude: 10.0,
            longitude: 20.0,
            altitude: None,
        });
        let mut store = NodeStore::new(config);
        let local = NodeNum::new(1);
        store.set_local_node(local);

        assert_eq!(
            store.apply_position(local, &position(9.0, 19.0)),
            PositionOutcome::IgnoredFixed
        );
        let pos = store.get(local).unwrap().position.unwrap();
        assert_eq!((pos.latitude, pos.longitude), (10.0, 20.0));

        // Remote nodes are unaffected
        let remote = NodeNum::new(2);
        store.touch(remote, Timestamp::new(1));
        assert_eq!(store.apply_position(remote, &position(1.0, 2.0)), PositionOutcome::Updated);

        store.set_local_fixed_position(FixedPosition {
            latitude: 11.0,
            longitude: 21.0,
            altitude: Some(5),
        });
        let pos = store.get(local).unwrap().position.unwrap();
        assert_eq!((pos.latitude, pos.longitude), (11.0, 21.0));
    }

    #[test]
    fn test_position_without_fix_ignored() {
        let mut store = store();
        let node = NodeNum::new(3);
        store.touch(node, Timestamp::new(1));
        assert_eq!(
            store.apply_position(node, &schema::Position::default()),
            PositionOutcome::NoFix
        );
        assert!(store.get(node).unwrap().position.is_none());
    }

    #[test]
    fn test_hop_policy_selects_single_source() {
        let mut config = NodeStoreConfig::default();
        config.hop_policy = HopPolicy::Traceroute;
        let mut store = NodeStore::new(config);
        let node = NodeNum::new(4);
        store.touch(node, Timestamp::new(1));

        assert!(!store.record_message_hops(node, 2));
        assert_eq!(store.get(node).unwrap().hops_away, None);

        let route = RouteDiscovery {
            route: vec![10, 11, 12],
            ..Default::default()
        };
        assert!(store.apply_traceroute(node, &route, Timestamp::new(2)));
        assert_eq!(store.get(node).unwrap().hops_away, Some(3));

        store.record_message_hops(node, 1);
        assert_eq!(store.get(node).unwrap().hops_away, Some(3));
    }

    #[test]
    fn test_telemetry_history_bounded() {
        let mut config = NodeStoreConfig::default();
        config.telemetry_history = 2;
        let mut store = NodeStore::new(config);
        let node = NodeNum::new(5);
        store.touch(node, Timestamp::new(1));

        for i in 0..4u32 {
            let telemetry = Telemetry {
                time: i,
                variant: Some(telemetry::Variant::DeviceMetrics(schema::DeviceMetrics {
                    battery_level: Some(90 - i),
                    ..Default::default()
                })),
            };
            assert!(store.apply_telemetry(node, &telemetry, Timestamp::new(u64::from(i))));
        }
        let record = store.get(node).unwrap();
        assert_eq!(record.telemetry_history.len(), 2);
        assert_eq!(record.device_metrics.unwrap().battery_level, Some(87));
    }

    #[test]
    fn test_security_flags_and_scan_marker() {
        let mut store = store();
        let node = NodeNum::new(6);
        store.apply_node_info(node, &user("Six", schema::Role::Client, &[6; 32]), None, Timestamp::new(1));
        assert!(store.get(node).unwrap().needs_key_scan);

        let flags = SecurityFlags {
            key_is_low_entropy: true,
            duplicate_key_detected: false,
            detail: Some("weak".into()),
        };
        assert!(store.apply_security_flags(node, flags.clone(), Some(&[6; 32])));
        assert!(!store.apply_security_flags(node, flags, Some(&[6; 32])));
        let record = store.get(node).unwrap();
        assert!(record.key_is_low_entropy());
        assert!(!record.needs_key_scan);
        assert_eq!(record.security_detail(), Some("weak"));
    }

    #[test]
    fn test_message_log_bounded() {
        let mut config = NodeStoreConfig::default();
        config.message_history = 2;
        let mut store = NodeStore::new(config);
        for i in 0..3 {
            store.record_text(TextRecord {
                at: Timestamp::new(i),
                from: NodeNum::new(1),
                to: NodeNum::BROADCAST,
                channel: 0,
                packet_id: i as u32,
                hops: Some(0),
                text: format!("msg {}", i),
            });
        }
        assert_eq!(store.messages().len(), 2);
        assert_eq!(store.messages()[0].text, "msg 1");
    }
}
