//! Command dispatch

use std::sync::Arc;
use std::time::Duration;

use meshmon_core::registry::{NewChannelKey, RegistryChange};
use meshmon_core::security::{SecurityScanner, WeakKeyCorpus};
use meshmon_core::{ChannelKey, EntryId, MeshEvent, Node, NodeNum, SharedState, SystemTimeSource};
use meshmon_runtime::{MeshService, SecurityScanService};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::{Commands, KeyAction};
use crate::config::AppConfig;
use crate::error::{CliError, Result};
use crate::state::{load_state, save_state};

pub struct CommandDispatcher;

impl CommandDispatcher {
    pub async fn execute(command: Commands, config: AppConfig) -> Result<()> {
        let state = load_state(&config)?;
        match command {
            Commands::Run { reprocess } => run(&config, state, reprocess).await,
            Commands::Traceroute { node } => traceroute(&config, state, node).await,
            Commands::Scan => scan(&config, state),
            Commands::Keys { action } => keys(&config, state, action),
            Commands::Nodes { flagged } => {
                nodes(&state, flagged);
                Ok(())
            }
        }
    }
}

async fn start(config: &AppConfig, state: SharedState) -> Result<MeshService> {
    Ok(MeshService::builder(config.mesh.clone())
        .with_state(state)
        .build_and_start()
        .await?)
}

async fn stop(mut service: MeshService, config: &AppConfig) -> Result<()> {
    service.shutdown().await?;
    save_state(service.state(), &config.snapshot_path())
}

// ----------------------------------------------------------------------------
// Live commands
// ----------------------------------------------------------------------------

async fn run(config: &AppConfig, state: SharedState, reprocess: bool) -> Result<()> {
    let service = start(config, state).await?;
    let mut events = service.subscribe();
    if reprocess {
        info!(trigger = ?service.reprocess_all(), "Reprocessing stored packets");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event consumer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    stop(service, config).await
}

async fn traceroute(config: &AppConfig, state: SharedState, node: NodeNum) -> Result<()> {
    let service = start(config, state).await?;
    let mut events = service.subscribe();

    let mut status = service.status_watch();
    let connect_wait = config.mesh.transport.connect_timeout() * 3;
    let connected = tokio::time::timeout(connect_wait, async {
        loop {
            let current = status.borrow_and_update().state;
            if current.is_connected() || current.is_terminal() {
                return current.is_connected();
            }
            if status.changed().await.is_err() {
                return false;
            }
        }
    })
    .await
    .unwrap_or(false);
    if !connected {
        let reason = service.status().last_error.unwrap_or_else(|| "timed out".to_string());
        stop(service, config).await?;
        return Err(CliError::NotConnected(reason));
    }

    let packet_id = service.request_traceroute(node).await?;
    println!("traceroute to {node} sent (packet {packet_id:#010x})");

    let deadline = Duration::from_secs(config.mesh.link_quality.traceroute_timeout_secs + 5);
    match tokio::time::timeout(deadline, wait_for_route(&mut events, node)).await {
        Ok(Some(line)) => println!("{line}"),
        _ => println!("no answer from {node}"),
    }
    if let Some(node) = service.node(node) {
        if let Some(route) = &node.last_route {
            let hops: Vec<String> = route.towards.iter().map(NodeNum::display_id).collect();
            println!("route: {}", hops.join(" -> "));
        }
    }

    stop(service, config).await
}

async fn wait_for_route(events: &mut broadcast::Receiver<MeshEvent>, node: NodeNum) -> Option<String> {
    loop {
        match events.recv().await {
            Ok(MeshEvent::TracerouteCompleted { destination, hops }) if destination == node => {
                return Some(format!("{node} answered over {hops} hop(s)"));
            }
            Ok(MeshEvent::TracerouteFailed { destination, reason }) if destination == node => {
                return Some(format!("traceroute to {node} failed: {reason}"));
            }
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

// ----------------------------------------------------------------------------
// Offline commands
// ----------------------------------------------------------------------------

fn scan(config: &AppConfig, state: SharedState) -> Result<()> {
    let corpus = WeakKeyCorpus::with_extra_hashes(&config.mesh.security.extra_weak_key_hashes)
        .map_err(|e| CliError::Config(e.to_string()))?;
    let (events, _) = broadcast::channel(1);
    let service = SecurityScanService::new(
        state.nodes.clone(),
        state.nodes.clone(),
        SecurityScanner::new(corpus),
        Arc::new(SystemTimeSource),
        events,
    );
    let result = service.run_now()?;

    println!(
        "scanned {} node(s), {} key(s)",
        result.nodes_scanned, result.keys_scanned
    );
    for node in &result.low_entropy {
        println!("  low-entropy key: {node}");
    }
    for group in &result.duplicate_groups {
        let ids: Vec<String> = group.nodes.iter().map(NodeNum::display_id).collect();
        println!("  shared key {}: {}", group.fingerprint, ids.join(", "));
    }
    save_state(&state, &config.snapshot_path())
}

fn keys(config: &AppConfig, state: SharedState, action: KeyAction) -> Result<()> {
    if let Some(id) = action.entry_id() {
        if state.registry.read().get(id).is_none() {
            return Err(CliError::UnknownKey(id.value()));
        }
    }

    let change = match action {
        KeyAction::List => {
            for entry in state.registry.read().summaries() {
                println!(
                    "{:>4}  {:<16} {:>3}-bit  {:<8} order={:<4} decrypted={}{}",
                    entry.id.value(),
                    entry.name,
                    entry.key_bits,
                    if entry.enabled { "enabled" } else { "disabled" },
                    entry.sort_order,
                    entry.decrypted_count,
                    if entry.enforce_name_validation { "  (name checked)" } else { "" },
                );
            }
            return Ok(());
        }
        KeyAction::Add {
            name,
            psk,
            hex,
            validate_name,
            order,
        } => {
            let key = if hex {
                ChannelKey::from_psk(&::hex::decode(psk.trim())?)?
            } else {
                ChannelKey::from_base64(&psk)?
            };
            let mut new = NewChannelKey::new(name, key);
            if validate_name {
                new = new.with_name_validation();
            }
            if let Some(order) = order {
                new = new.with_sort_order(order);
            }
            state.registry.write().create(new)?
        }
        KeyAction::Enable { id } => state.registry.write().set_enabled(EntryId::new(id), true)?,
        KeyAction::Disable { id } => state.registry.write().set_enabled(EntryId::new(id), false)?,
        KeyAction::Remove { id } => state.registry.write().delete(EntryId::new(id))?,
    };

    match change {
        RegistryChange::Created { id, .. } => println!("added {id}"),
        other => println!("{other:?}"),
    }
    if change.warrants_reprocess().is_some() {
        println!("stored packets will be retried on the next `meshmon run --reprocess`");
    }
    save_state(&state, &config.snapshot_path())
}

fn nodes(state: &SharedState, flagged: bool) {
    let store = state.nodes.read();
    let local = store.local_node();
    for node in store.nodes() {
        let flags = node.key_is_low_entropy() || node.duplicate_key_detected();
        if flagged && !flags {
            continue;
        }
        println!("{}", node_line(node, local == Some(node.num)));
        if let Some(detail) = node.security_detail() {
            println!("           ! {detail}");
        }
    }
}

fn node_line(node: &Node, local: bool) -> String {
    let hops = node
        .hops_away
        .map(|h| h.to_string())
        .unwrap_or_else(|| "?".to_string());
    format!(
        "{} {:<5} {:<24} hops={:<2} role={:?}{}{}",
        node.num,
        node.short_name,
        node.long_name,
        hops,
        node.role,
        if node.is_favorite { " *" } else { "" },
        if local { " (local)" } else { "" },
    )
}

// ----------------------------------------------------------------------------
// Event output
// ----------------------------------------------------------------------------

fn print_event(event: &MeshEvent) {
    match event {
        MeshEvent::Connection(status) => println!("[link] {} {}", status.endpoint, status.state),
        MeshEvent::LocalNodeIdentified { node } => println!("[link] local node {node}"),
        MeshEvent::ConfigComplete { .. } => println!("[link] device configuration received"),
        MeshEvent::Message { packet, message } => {
            println!("[{}] {:?} via {:?}: {:?}", packet.from, packet.tag, packet.hops, message)
        }
        MeshEvent::Undecryptable { packet } => {
            println!("[{}] undecryptable on channel {:#04x}", packet.from, packet.channel)
        }
        MeshEvent::PacketRecovered { packet, entry, message } => {
            println!("[{}] recovered with {entry}: {:?}", packet.from, message)
        }
        MeshEvent::UnknownPort { from, port } => println!("[{from}] unhandled port {port}"),
        MeshEvent::NodeCreated { node } => println!("[node] new {node}"),
        MeshEvent::NodeUpdated { .. } => {}
        MeshEvent::KeyChanged { node } => println!("[node] {node} changed its public key"),
        MeshEvent::LinkQuality(record) => {
            println!("[quality] {} {} ({:?})", record.node, record.score, record.kind)
        }
        MeshEvent::Favorite(change) => println!("[favorite] {change:?}"),
        MeshEvent::TracerouteCompleted { destination, hops } => {
            println!("[trace] {destination} reached in {hops} hop(s)")
        }
        MeshEvent::TracerouteFailed { destination, reason } => {
            println!("[trace] {destination} failed: {reason}")
        }
        MeshEvent::SecurityScanCompleted {
            low_entropy,
            duplicate_groups,
            flags_changed,
            ..
        } => println!(
            "[security] low-entropy={low_entropy} duplicate-groups={duplicate_groups} changed={flags_changed}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::KeyAction;
    use meshmon_core::MeshmonConfig;

    fn app_config(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            mesh: MeshmonConfig::testing(),
            data_dir: dir.to_path_buf(),
        }
    }

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("meshmon-cli-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_added_key_survives_in_snapshot() {
        let dir = temp_dir("keys");
        let config = app_config(&dir);

        let state = load_state(&config).unwrap();
        keys(
            &config,
            state,
            KeyAction::Add {
                name: "Ops".to_string(),
                psk: "AQ==".to_string(),
                hex: false,
                validate_name: true,
                order: Some(2),
            },
        )
        .unwrap();

        let reloaded = load_state(&config).unwrap();
        let summaries = reloaded.registry.read().summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "Ops");
        assert!(summaries[0].enforce_name_validation);
        assert_eq!(summaries[0].sort_order, 2);

        let err = keys(&config, reloaded, KeyAction::Remove { id: 99 }).unwrap_err();
        assert!(matches!(err, CliError::UnknownKey(99)));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
