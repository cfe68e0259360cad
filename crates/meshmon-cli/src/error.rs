//! Error handling for the meshmon CLI

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Meshmon error: {0}")]
    Meshmon(#[from] meshmon_core::MeshmonError),

    #[error("State error: {0}")]
    Storage(#[from] meshmon_core::StorageError),

    #[error("Registry error: {0}")]
    Registry(#[from] meshmon_core::RegistryError),

    #[error("Security scan failed: {0}")]
    Scan(#[from] meshmon_runtime::ScanError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("Hex decoding error: {0}")]
    HexDecoding(#[from] hex::FromHexError),

    #[error("No channel key with id {0}")]
    UnknownKey(u32),

    #[error("Device did not connect: {0}")]
    NotConnected(String),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
