//! JSON state snapshots
//!
//! Node records, the key registry and the packet log, saved so a restarted
//! monitor keeps its view of the mesh and can resume an interrupted reprocess
//! job against the same log ids. Keys are stored base64 encoded.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{MeshmonError, StorageError};
use crate::node_store::Node;
use crate::packet_log::PacketRecord;
use crate::pipeline::SharedState;
use crate::registry::{ChannelKeyRegistry, EntryRecord};
use crate::types::{NodeNum, Timestamp};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub saved_at: Timestamp,
    pub local_node: Option<NodeNum>,
    pub nodes: Vec<Node>,
    pub channel_keys: Vec<EntryRecord>,
    #[serde(default)]
    pub packet_log: Vec<PacketRecord>,
}

impl StateSnapshot {
    pub fn capture(state: &SharedState, now: Timestamp) -> Self {
        let (local_node, nodes) = {
            let store = state.nodes.read();
            (store.local_node(), store.node_list())
        };
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: now,
            local_node,
            nodes,
            channel_keys: state.registry.read().to_records(),
            packet_log: state.packet_log.records(),
        }
    }

    /// Replace the shared store, registry and packet log contents with this
    /// snapshot
    pub fn restore_into(self, state: &SharedState) -> Result<(), MeshmonError> {
        let registry = ChannelKeyRegistry::from_records(self.channel_keys)?;
        let node_count = self.nodes.len();
        let packet_count = self.packet_log.len();
        state.packet_log.restore(self.packet_log)?;
        *state.registry.write() = registry;
        state.nodes.write().restore(self.local_node, self.nodes);
        info!(nodes = node_count, packets = packet_count, "State restored from snapshot");
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let snapshot: Self = serde_json::from_slice(&fs::read(path)?)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StorageError::UnsupportedSnapshot {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshmonConfig;
    use crate::registry::NewChannelKey;
    use crate::testing::test_key;

    #[test]
    fn test_snapshot_roundtrip_through_file() {
        let config = MeshmonConfig::testing();
        let state = SharedState::new(&config);
        state
            .registry
            .write()
            .create(NewChannelKey::new("Ops", test_key(1)).with_name_validation())
            .unwrap();
        state.nodes.write().set_local_node(NodeNum::new(0x11));
        state.nodes.write().touch(NodeNum::new(0x22), Timestamp::new(5));

        let snapshot = StateSnapshot::capture(&state, Timestamp::new(10));
        let dir = std::env::temp_dir().join(format!("meshmon-snapshot-{}", uuid::Uuid::new_v4()));
        let path = dir.join("state.json");
        snapshot.save(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains(&test_key(1).to_base64()));

        let restored_state = SharedState::new(&config);
        StateSnapshot::load(&path).unwrap().restore_into(&restored_state).unwrap();
        assert_eq!(restored_state.nodes.read().len(), 2);
        assert_eq!(restored_state.nodes.read().local_node(), Some(NodeNum::new(0x11)));
        let registry = restored_state.registry.read();
        assert_eq!(registry.len(), 1);
        assert!(registry.entries()[0].enforce_name_validation);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let dir = std::env::temp_dir().join(format!("meshmon-snapshot-{}", uuid::Uuid::new_v4()));
        let path = dir.join("state.json");
        let mut snapshot = StateSnapshot::capture(&SharedState::new(&MeshmonConfig::testing()), Timestamp::new(0));
        snapshot.version = 99;
        snapshot.save(&path).unwrap();
        assert!(matches!(
            StateSnapshot::load(&path),
            Err(StorageError::UnsupportedSnapshot { found: 99, .. })
        ));
        let _ = fs::remove_dir_all(dir);
    }
}
