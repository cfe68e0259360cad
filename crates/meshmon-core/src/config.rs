//! Centralized Configuration Management
//!
//! This module consolidates all configuration structures used by the
//! pipeline and its background tasks. Every section has sensible defaults,
//! a `testing()` preset with short timers, and is validated as a whole by
//! `MeshmonConfig::validate`.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

// ----------------------------------------------------------------------------
// Transport Configuration
// ----------------------------------------------------------------------------

/// Kind of link to the mesh device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Tcp,
    Serial,
}

/// Configuration for the transport connector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: LinkKind,
    /// Device host for TCP links
    pub host: String,
    /// Device port for TCP links
    pub port: u16,
    /// Device path for serial links
    pub serial_path: String,
    pub baud_rate: u32,
    /// Timeout for a single connection attempt
    pub connect_timeout_secs: u64,
    /// First reconnect delay
    pub initial_backoff_ms: u64,
    /// Upper bound on the reconnect delay
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Consecutive failed attempts before giving up (`None` retries forever)
    pub max_reconnect_attempts: Option<u32>,
    /// Heartbeat interval while connected
    pub heartbeat_interval_secs: u64,
    /// Frames buffered between the connector and the ingestion task
    pub frame_buffer_size: usize,
    /// Outbound requests buffered while connected
    pub outbound_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: LinkKind::Tcp,
            host: "127.0.0.1".to_string(),
            port: 4403,
            serial_path: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            connect_timeout_secs: 10,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            max_reconnect_attempts: Some(10),
            heartbeat_interval_secs: 300,
            frame_buffer_size: 256,
            outbound_buffer_size: 32,
        }
    }
}

impl TransportConfig {
    /// Fast retries for tests
    pub fn testing() -> Self {
        Self {
            connect_timeout_secs: 1,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            max_reconnect_attempts: Some(3),
            heartbeat_interval_secs: 5,
            frame_buffer_size: 16,
            outbound_buffer_size: 8,
            ..Self::default()
        }
    }

    /// Retry forever with a long ceiling, for unattended deployments
    pub fn persistent() -> Self {
        Self {
            max_backoff_ms: 300_000,
            max_reconnect_attempts: None,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Human-readable endpoint for logs
    pub fn endpoint(&self) -> String {
        match self.kind {
            LinkKind::Tcp => format!("{}:{}", self.host, self.port),
            LinkKind::Serial => self.serial_path.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Decoder Configuration
// ----------------------------------------------------------------------------

/// Configuration for the decoder and packet log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Window in which a repeated `(from, id)` pair is a rebroadcast copy
    pub duplicate_window_secs: u64,
    /// Maximum tracked `(from, id)` pairs
    pub duplicate_capacity: usize,
    /// Packet records retained in the in-memory log
    pub packet_log_capacity: usize,
    /// Event bus capacity
    pub event_buffer_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            duplicate_window_secs: 600,
            duplicate_capacity: 10_000,
            packet_log_capacity: 50_000,
            event_buffer_size: 1_024,
        }
    }
}

impl DecoderConfig {
    pub fn testing() -> Self {
        Self {
            duplicate_window_secs: 60,
            duplicate_capacity: 100,
            packet_log_capacity: 1_000,
            event_buffer_size: 256,
        }
    }
}

// ----------------------------------------------------------------------------
// Node Store Configuration
// ----------------------------------------------------------------------------

/// Which observation drives a node's hop distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopPolicy {
    /// Hop count of the latest NodeInfo (or the device's node database)
    NodeInfo,
    /// Path length of the latest traceroute
    Traceroute,
    /// Hop count derived from the latest message of any kind
    LatestMessage,
}

/// Configured fixed position for the local node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
}

/// Configuration for the node state store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStoreConfig {
    pub hop_policy: HopPolicy,
    /// Local node position that overrides its own position broadcasts
    pub fixed_position: Option<FixedPosition>,
    /// Manage favourites automatically based on local role
    pub auto_favorites: bool,
    /// Auto-favourites not heard within this window are removed
    pub favorite_stale_secs: u64,
    pub favorite_sweep_interval_secs: u64,
    /// Telemetry samples retained per node
    pub telemetry_history: usize,
    /// Text messages retained across all nodes
    pub message_history: usize,
}

impl Default for NodeStoreConfig {
    fn default() -> Self {
        Self {
            hop_policy: HopPolicy::LatestMessage,
            fixed_position: None,
            auto_favorites: true,
            favorite_stale_secs: 72 * 3600,
            favorite_sweep_interval_secs: 3600,
            telemetry_history: 64,
            message_history: 500,
        }
    }
}

impl NodeStoreConfig {
    pub fn testing() -> Self {
        Self {
            favorite_stale_secs: 60,
            favorite_sweep_interval_secs: 1,
            telemetry_history: 8,
            message_history: 16,
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Link Quality Configuration
// ----------------------------------------------------------------------------

/// Configuration for link quality scoring and hop profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkQualityConfig {
    /// Score records retained per node
    pub history_per_node: usize,
    /// Hop samples retained per node
    pub hop_samples_per_node: usize,
    pub bucket_minutes: u64,
    pub window_hours: u64,
    /// Sample spacing that is reported as a gap instead of bridged
    pub gap_threshold_minutes: u64,
    /// How long a traceroute request waits for its reply
    pub traceroute_timeout_secs: u64,
}

impl Default for LinkQualityConfig {
    fn default() -> Self {
        Self {
            history_per_node: 256,
            hop_samples_per_node: 2_048,
            bucket_minutes: 15,
            window_hours: 24,
            gap_threshold_minutes: 60,
            traceroute_timeout_secs: 60,
        }
    }
}

impl LinkQualityConfig {
    pub fn testing() -> Self {
        Self {
            history_per_node: 32,
            hop_samples_per_node: 128,
            traceroute_timeout_secs: 2,
            ..Self::default()
        }
    }

    pub fn bucket(&self) -> Duration {
        Duration::from_secs(self.bucket_minutes * 60)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_hours * 3600)
    }

    pub fn gap_threshold(&self) -> Duration {
        Duration::from_secs(self.gap_threshold_minutes * 60)
    }
}

// ----------------------------------------------------------------------------
// Security Scanner Configuration
// ----------------------------------------------------------------------------

/// Configuration for the duplicate and low-entropy key scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enabled: bool,
    pub scan_interval_secs: u64,
    /// Initial delay is drawn uniformly from this range
    pub initial_delay_min_secs: u64,
    pub initial_delay_max_secs: u64,
    /// Extra SHA-256 hashes (hex) of keys known to be weak
    pub extra_weak_key_hashes: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: 24 * 3600,
            initial_delay_min_secs: 60,
            initial_delay_max_secs: 600,
            extra_weak_key_hashes: Vec::new(),
        }
    }
}

impl SecurityConfig {
    pub fn testing() -> Self {
        Self {
            scan_interval_secs: 1,
            initial_delay_min_secs: 0,
            initial_delay_max_secs: 0,
            ..Self::default()
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

// ----------------------------------------------------------------------------
// Reprocess Configuration
// ----------------------------------------------------------------------------

/// Configuration for retroactive decryption jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReprocessConfig {
    /// Start a job automatically when a key is created or enabled
    pub auto_on_key_change: bool,
    /// Records examined per batch; the cursor is persisted after each batch
    pub batch_size: usize,
    /// File holding the job cursor (in-memory when unset)
    pub cursor_path: Option<std::path::PathBuf>,
}

impl Default for ReprocessConfig {
    fn default() -> Self {
        Self {
            auto_on_key_change: true,
            batch_size: 500,
            cursor_path: None,
        }
    }
}

impl ReprocessConfig {
    pub fn testing() -> Self {
        Self {
            batch_size: 4,
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `--verbose` is not given
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn testing() -> Self {
        Self {
            level: "debug".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Master Configuration
// ----------------------------------------------------------------------------

/// Master configuration struct that consolidates all meshmon configurations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshmonConfig {
    pub transport: TransportConfig,
    pub decoder: DecoderConfig,
    pub node_store: NodeStoreConfig,
    pub link_quality: LinkQualityConfig,
    pub security: SecurityConfig,
    pub reprocess: ReprocessConfig,
    pub logging: LoggingConfig,
}

impl MeshmonConfig {
    /// Create new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            transport: TransportConfig::testing(),
            decoder: DecoderConfig::testing(),
            node_store: NodeStoreConfig::testing(),
            link_quality: LinkQualityConfig::testing(),
            security: SecurityConfig::testing(),
            reprocess: ReprocessConfig::testing(),
            logging: LoggingConfig::testing(),
        }
    }

    /// Builder method for customizing transport configuration
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Builder method for customizing node store configuration
    pub fn with_node_store(mut self, node_store: NodeStoreConfig) -> Self {
        self.node_store = node_store;
        self
    }

    /// Builder method for customizing security scanner configuration
    pub fn with_security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    /// Validate the configuration for consistency and feasibility
    pub fn validate(&self) -> Result<(), ConfigError> {
        let transport = &self.transport;
        if transport.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "transport.backoff_multiplier",
                "must be at least 1.0",
            ));
        }
        if transport.initial_backoff_ms == 0 {
            return Err(ConfigError::invalid(
                "transport.initial_backoff_ms",
                "cannot be zero",
            ));
        }
        if transport.initial_backoff_ms > transport.max_backoff_ms {
            return Err(ConfigError::invalid(
                "transport.initial_backoff_ms",
                "cannot exceed max_backoff_ms",
            ));
        }
        if transport.max_reconnect_attempts == Some(0) {
            return Err(ConfigError::invalid(
                "transport.max_reconnect_attempts",
                "cannot be zero; omit it to retry forever",
            ));
        }
        if transport.heartbeat_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "transport.heartbeat_interval_secs",
                "cannot be zero",
            ));
        }
        if transport.frame_buffer_size == 0 || transport.outbound_buffer_size == 0 {
            return Err(ConfigError::invalid("transport", "buffer sizes cannot be zero"));
        }

        if self.decoder.packet_log_capacity == 0 {
            return Err(ConfigError::invalid(
                "decoder.packet_log_capacity",
                "cannot be zero",
            ));
        }
        if self.decoder.event_buffer_size == 0 {
            return Err(ConfigError::invalid(
                "decoder.event_buffer_size",
                "cannot be zero",
            ));
        }

        if let Some(fixed) = &self.node_store.fixed_position {
            if !(-90.0..=90.0).contains(&fixed.latitude)
                || !(-180.0..=180.0).contains(&fixed.longitude)
            {
                return Err(ConfigError::invalid(
                    "node_store.fixed_position",
                    "coordinates out of range",
                ));
            }
        }

        let quality = &self.link_quality;
        if quality.bucket_minutes == 0 || quality.window_hours == 0 {
            return Err(ConfigError::invalid(
                "link_quality",
                "bucket and window must be non-zero",
            ));
        }
        if quality.gap_threshold_minutes < quality.bucket_minutes {
            return Err(ConfigError::invalid(
                "link_quality.gap_threshold_minutes",
                "must be at least one bucket long",
            ));
        }

        let security = &self.security;
        if security.scan_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "security.scan_interval_secs",
                "cannot be zero",
            ));
        }
        if security.initial_delay_min_secs > security.initial_delay_max_secs {
            return Err(ConfigError::invalid(
                "security.initial_delay_min_secs",
                "cannot exceed initial_delay_max_secs",
            ));
        }

        if self.reprocess.batch_size == 0 {
            return Err(ConfigError::invalid("reprocess.batch_size", "cannot be zero"));
        }

        Ok(())
    }
}
