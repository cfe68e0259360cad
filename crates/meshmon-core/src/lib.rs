//! Meshmon Core
//!
//! Device stream framing, packet decoding and dispatch, channel key
//! registry and decryption, node state, link quality scoring and security
//! scanning for a mesh radio monitor. Everything here is synchronous; the
//! `meshmon-runtime` crate drives it from tokio tasks.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod crypto;
pub mod decryption;
pub mod dedup;
pub mod errors;
pub mod events;
pub mod favorites;
pub mod hop_profile;
pub mod link_quality;
pub mod node_store;
pub mod packet_log;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod reprocess;
pub mod requests;
pub mod security;
pub mod snapshot;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::MeshmonConfig;
pub use crypto::ChannelKey;
pub use decryption::{DecryptionEngine, DecryptionOutcome};
pub use events::{MeshEvent, PacketSummary};
pub use favorites::{FavoriteChange, FavoriteRemoval};
pub use hop_profile::{HopProfilePoint, HopSampleLog, ProfileShape};
pub use link_quality::{LinkQualityRecord, LinkQualityScorer, QualityEventKind};
pub use node_store::{Node, NodeChange, NodeRole, NodeStore};
pub use packet_log::{DecryptionTag, LogId, MemoryPacketLog, PacketLog, PacketRecord};
pub use pipeline::{PacketPipeline, PipelineStats, SharedState};
pub use registry::{ChannelKeyEntry, ChannelKeyRegistry, EntryId, NewChannelKey, RegistryChange};
pub use reprocess::{CursorStore, FileCursorStore, MemoryCursorStore, ReprocessJob};
pub use security::{SecurityScanResult, SecurityScanner, WeakKeyCorpus};
pub use snapshot::StateSnapshot;
pub use transport::{ConnectionEvent, ConnectionState, ConnectionStatus};
pub use types::{KeyFingerprint, NodeNum, SystemTimeSource, TimeSource, Timestamp};

pub use errors::{
    ConfigError, DecodeError, FrameError, MeshmonError, MeshmonResult, RegistryError, Result,
    StorageError, TransportError,
};
