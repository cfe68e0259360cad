//! Configuration loading for the CLI
//!
//! Precedence: command-line flags, then the TOML file, then defaults. The
//! file is `--config` if given, else `meshmon.toml` in the user config
//! directory when it exists.

use std::path::{Path, PathBuf};

use meshmon_core::config::LinkKind;
use meshmon_core::MeshmonConfig;
use tracing::{debug, info};

use crate::cli::{Cli, LinkArgs};
use crate::error::{CliError, Result};

const CONFIG_FILE: &str = "meshmon.toml";
const SNAPSHOT_FILE: &str = "state.json";
const CURSOR_FILE: &str = "reprocess-cursor.json";

/// Resolved configuration plus CLI-only paths
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mesh: MeshmonConfig,
    pub data_dir: PathBuf,
}

impl AppConfig {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut mesh = match config_path(cli.config.as_deref()) {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration");
                load_file(&path)?
            }
            None => {
                debug!("No configuration file, using defaults");
                MeshmonConfig::default()
            }
        };
        apply_link_overrides(&mut mesh, &cli.link);

        let data_dir = match &cli.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir()?,
        };
        if mesh.reprocess.cursor_path.is_none() {
            mesh.reprocess.cursor_path = Some(data_dir.join(CURSOR_FILE));
        }

        mesh.validate().map_err(|e| CliError::Config(e.to_string()))?;
        Ok(Self { mesh, data_dir })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }
}

pub fn load_file(path: &Path) -> Result<MeshmonConfig> {
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let candidate = dirs::config_dir()?.join("meshmon").join(CONFIG_FILE);
    candidate.exists().then_some(candidate)
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("meshmon"))
        .ok_or_else(|| CliError::Config("no data directory; pass --data-dir".to_string()))
}

pub fn apply_link_overrides(config: &mut MeshmonConfig, link: &LinkArgs) {
    if let Some(host) = &link.host {
        config.transport.kind = LinkKind::Tcp;
        config.transport.host = host.clone();
    }
    if let Some(port) = link.port {
        config.transport.port = port;
    }
    if let Some(path) = &link.serial {
        config.transport.kind = LinkKind::Serial;
        config.transport.serial_path = path.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshmon_core::config::HopPolicy;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: MeshmonConfig = toml::from_str(
            r#"
            [transport]
            host = "radio.local"

            [node_store]
            hop_policy = "traceroute"
            "#,
        )
        .unwrap();
        assert_eq!(config.transport.host, "radio.local");
        assert_eq!(config.transport.port, 4403);
        assert_eq!(config.node_store.hop_policy, HopPolicy::Traceroute);
        assert!(config.reprocess.auto_on_key_change);
    }

    #[test]
    fn test_flags_override_file() {
        let mut config = MeshmonConfig::default();
        apply_link_overrides(
            &mut config,
            &LinkArgs {
                host: None,
                port: Some(5000),
                serial: Some("/dev/ttyACM0".to_string()),
            },
        );
        assert_eq!(config.transport.kind, LinkKind::Serial);
        assert_eq!(config.transport.serial_path, "/dev/ttyACM0");
        assert_eq!(config.transport.port, 5000);
    }
}
