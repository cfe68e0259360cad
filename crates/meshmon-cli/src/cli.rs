//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use meshmon_core::registry::EntryId;
use meshmon_core::NodeNum;

#[derive(Parser, Debug)]
#[command(name = "meshmon", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the state snapshot and reprocess cursor
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(flatten)]
    pub link: LinkArgs,
}

/// Overrides for the transport section of the configuration
#[derive(Args, Debug, Default, Clone)]
pub struct LinkArgs {
    /// Device host for a TCP link
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Device port for a TCP link
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Serial device path; selects a serial link
    #[arg(long, global = true)]
    pub serial: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to the device and print mesh events until interrupted
    Run {
        /// Retry every enabled key against stored packets on start
        #[arg(long)]
        reprocess: bool,
    },
    /// Send a traceroute and wait for the outcome
    Traceroute {
        /// Node id (!aabbccdd, 0xaabbccdd or decimal)
        node: NodeNum,
    },
    /// Scan the saved node keys for weak and shared keys
    Scan,
    /// Manage channel keys
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// List known nodes
    Nodes {
        /// Only nodes with a security flag
        #[arg(long)]
        flagged: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum KeyAction {
    /// List keys with usage counters
    List,
    /// Add a key
    Add {
        /// Channel name
        #[arg(short, long)]
        name: String,
        /// Key as base64 (or hex with --hex)
        psk: String,
        /// Parse the key as hex
        #[arg(long)]
        hex: bool,
        /// Only try this key on packets declaring this channel name
        #[arg(long)]
        validate_name: bool,
        /// Position in trial order (lower first)
        #[arg(long)]
        order: Option<i32>,
    },
    Enable {
        id: u32,
    },
    Disable {
        id: u32,
    },
    Remove {
        id: u32,
    },
}

impl KeyAction {
    pub fn entry_id(&self) -> Option<EntryId> {
        match self {
            KeyAction::Enable { id } | KeyAction::Disable { id } | KeyAction::Remove { id } => {
                Some(EntryId::new(*id))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_traceroute_with_overrides() {
        let cli = Cli::parse_from(["meshmon", "--host", "10.0.0.5", "traceroute", "!0000abcd"]);
        assert_eq!(cli.link.host.as_deref(), Some("10.0.0.5"));
        assert!(matches!(cli.command, Commands::Traceroute { node } if node == NodeNum::new(0xabcd)));
    }

    #[test]
    fn test_parse_key_add() {
        let cli = Cli::parse_from([
            "meshmon", "keys", "add", "--name", "Ops", "AQ==", "--validate-name", "--order", "3",
        ]);
        let Commands::Keys {
            action: KeyAction::Add {
                name,
                validate_name,
                order,
                hex,
                ..
            },
        } = cli.command
        else {
            panic!("expected keys add");
        };
        assert_eq!(name, "Ops");
        assert!(validate_name);
        assert!(!hex);
        assert_eq!(order, Some(3));
    }
}
