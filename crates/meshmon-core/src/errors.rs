//! Error types for meshmon
//!
//! This module contains the error types used throughout the packet pipeline:
//! stream framing, envelope decoding, transport, key registry, storage and
//! configuration errors, plus the `MeshmonError` type that unifies them all.
//!
//! Key material never appears in any error message. Registry errors carry
//! lengths and entry ids only.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Stream framing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Malformed frame length: {length} (max: {max})")]
    MalformedLength { length: usize, max: usize },
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Unknown envelope version: 0x{version:02x}")]
    UnknownVersion { version: u8 },
}

/// Envelope and application payload decoding errors
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] prost::DecodeError),
    #[error("Malformed {port} payload: {reason}")]
    MalformedPayload { port: &'static str, reason: String },
    #[error("Unrecognized port: {port}")]
    UnrecognizedPort { port: i32 },
    #[error("Packet carries no payload")]
    MissingPayload,
}

/// Transport connector errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
    #[error("Send failed: buffer full (capacity: {capacity})")]
    SendBufferFull { capacity: usize },
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Gave up after {attempts} connection attempts")]
    GaveUp { attempts: u32 },
    #[error("Transport shutdown: {reason}")]
    Shutdown { reason: String },
    #[error("Frame encoding failed: {0}")]
    Frame(#[from] FrameError),
}

/// Channel key registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid key length: {length} bytes (expected 1, 16 or 32)")]
    InvalidKeyLength { length: usize },
    #[error("Key disables encryption and cannot be registered")]
    NoEncryptionKey,
    #[error("Invalid key encoding")]
    InvalidKeyEncoding,
    #[error("Entry name must not be empty")]
    EmptyName,
    #[error("Sort order {sort_order} already used by entry {existing}")]
    DuplicateSortOrder { sort_order: i32, existing: u32 },
    #[error("Key entry not found: {id}")]
    EntryNotFound { id: u32 },
    #[error("Invalid reorder: {reason}")]
    InvalidReorder { reason: String },
}

/// Packet log, cursor and snapshot storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Packet record not found: {log_id}")]
    RecordNotFound { log_id: u64 },
    #[error("Invalid tag transition for record {log_id}: {reason}")]
    InvalidTagTransition { log_id: u64, reason: String },
    #[error("Snapshot version {found} is not supported (expected {expected})")]
    UnsupportedSnapshot { found: u32, expected: u32 },
    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("Corrupt stored data: {reason}")]
    Corrupt { reason: String },
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for meshmon
#[derive(Debug, thiserror::Error)]
pub enum MeshmonError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] crate::transport::StateTransitionError),

    #[error("Cryptographic error: {reason}")]
    Crypto { reason: String },

    /// Channel communication error between runtime tasks
    #[error("Channel error: {message}")]
    Channel { message: String },
}

impl From<FrameError> for MeshmonError {
    fn from(err: FrameError) -> Self {
        MeshmonError::Decode(DecodeError::Frame(err))
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl MeshmonError {
    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        MeshmonError::Channel {
            message: message.into(),
        }
    }

    /// Create a cryptographic error with a reason
    pub fn crypto_error<T: Into<String>>(reason: T) -> Self {
        MeshmonError::Crypto {
            reason: reason.into(),
        }
    }

    /// Create a configuration error for a field
    pub fn invalid_config<R: Into<String>>(field: &'static str, reason: R) -> Self {
        MeshmonError::Config(ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        })
    }
}

impl ConfigError {
    pub fn invalid<R: Into<String>>(field: &'static str, reason: R) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, MeshmonError>;
pub type MeshmonResult<T> = Result<T>;
