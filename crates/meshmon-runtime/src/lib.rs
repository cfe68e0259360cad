//! Meshmon Runtime
//!
//! Async tasks around the `meshmon-core` pipeline:
//! - `Connector`: owns the device link, reconnects with backoff
//! - `IngestTask`: single writer that feeds frames through the pipeline
//! - `SecurityScanService`: scheduled and on-demand key scans
//! - `ReprocessRunner`: background retroactive decryption
//! - `MeshService`: builder and handle tying them together

pub mod connector;
pub mod ingest;
pub mod link;
pub mod reprocess;
pub mod scan;
pub mod service;

pub use connector::{Connector, ConnectorHandle};
pub use ingest::{IngestCommand, IngestTask};
pub use link::{opener_from_config, virtual_link, BoxedLink, LinkOpener, TcpLinkOpener, VirtualLinkOpener, VirtualRadio};
pub use reprocess::{ReprocessRunner, ReprocessStatus, ReprocessTrigger};
pub use scan::{ScanError, SecurityScanService};
pub use service::{MeshService, MeshServiceBuilder};

#[cfg(feature = "serial")]
pub use link::serial::SerialLinkOpener;

// Re-export core types for convenience
pub use meshmon_core::{
    ConnectionState, ConnectionStatus, MeshEvent, MeshmonConfig, MeshmonError, MeshmonResult, NodeNum,
    SharedState,
};
