//! Mesh service
//!
//! Builder and handle for a running monitor: the connector, the ingestion
//! task, the scheduled security scan and the reprocess runner, plus the
//! administrative surface for channel keys, favourites and traceroutes.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashSet;
use meshmon_core::config::MeshmonConfig;
use meshmon_core::favorites::FavoriteChange;
use meshmon_core::hop_profile::{HopProfilePoint, ProfileShape};
use meshmon_core::link_quality::LinkQualityRecord;
use meshmon_core::node_store::Node;
use meshmon_core::pipeline::{PacketPipeline, PipelineStats, SharedState};
use meshmon_core::registry::{ChannelKeyUpdate, EntryId, EntrySummary, NewChannelKey, RegistryChange};
use meshmon_core::reprocess::{CursorStore, FileCursorStore, MemoryCursorStore};
use meshmon_core::security::{NodeKeySource, SecurityScanResult, SecurityScanner, WeakKeyCorpus};
use meshmon_core::snapshot::StateSnapshot;
use meshmon_core::transport::{AuditEntry, ConnectionState, ConnectionStatus};
use meshmon_core::types::{NodeNum, SystemTimeSource, TimeSource};
use meshmon_core::{MeshEvent, MeshmonError, MeshmonResult};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connector::{Connector, ConnectorHandle};
use crate::ingest::{IngestCommand, IngestTask};
use crate::link::{opener_from_config, LinkOpener};
use crate::reprocess::{ReprocessRunner, ReprocessStatus, ReprocessTrigger};
use crate::scan::{ScanError, SecurityScanService};

const COMMAND_BUFFER: usize = 32;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

pub struct MeshServiceBuilder {
    config: MeshmonConfig,
    opener: Option<Arc<dyn LinkOpener>>,
    state: Option<SharedState>,
    cursors: Option<Arc<dyn CursorStore>>,
    clock: Arc<dyn TimeSource>,
    corpus: Option<WeakKeyCorpus>,
    key_source: Option<Arc<dyn NodeKeySource>>,
}

impl MeshServiceBuilder {
    pub fn new(config: MeshmonConfig) -> Self {
        Self {
            config,
            opener: None,
            state: None,
            cursors: None,
            clock: Arc::new(SystemTimeSource),
            corpus: None,
            key_source: None,
        }
    }

    /// Use this link instead of the one named in the configuration
    pub fn with_link_opener(mut self, opener: Arc<dyn LinkOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Start from existing state, e.g. restored from a snapshot
    pub fn with_state(mut self, state: SharedState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_cursor_store(mut self, cursors: Arc<dyn CursorStore>) -> Self {
        self.cursors = Some(cursors);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_weak_key_corpus(mut self, corpus: WeakKeyCorpus) -> Self {
        self.corpus = Some(corpus);
        self
    }

    /// Read node keys for scanning from somewhere other than the node store
    pub fn with_key_source(mut self, source: Arc<dyn NodeKeySource>) -> Self {
        self.key_source = Some(source);
        self
    }

    /// Validate the configuration, wire the tasks and spawn them
    pub async fn build_and_start(self) -> MeshmonResult<MeshService> {
        let config = self.config;
        config.validate()?;
        info!(endpoint = %config.transport.endpoint(), "Starting mesh service");

        let opener = match self.opener {
            Some(opener) => opener,
            None => opener_from_config(&config.transport)?,
        };
        let state = self.state.unwrap_or_else(|| SharedState::new(&config));
        let cursors: Arc<dyn CursorStore> = match (self.cursors, &config.reprocess.cursor_path) {
            (Some(cursors), _) => cursors,
            (None, Some(path)) => Arc::new(FileCursorStore::new(path.clone())),
            (None, None) => Arc::new(MemoryCursorStore::new()),
        };
        let corpus = match self.corpus {
            Some(corpus) => corpus,
            None => WeakKeyCorpus::with_extra_hashes(&config.security.extra_weak_key_hashes)?,
        };
        let clock = self.clock;

        let (events, _) = broadcast::channel(config.decoder.event_buffer_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (frames_tx, frames_rx) = mpsc::channel(config.transport.frame_buffer_size.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let stats = Arc::new(Mutex::new(PipelineStats::default()));

        let (connector, connector_handle) = Connector::new(
            opener,
            config.transport.clone(),
            clock.clone(),
            frames_tx,
            shutdown_rx.clone(),
        );

        let sweep_interval = config
            .node_store
            .auto_favorites
            .then(|| Duration::from_secs(config.node_store.favorite_sweep_interval_secs.max(1)));
        let ingest = IngestTask::new(
            PacketPipeline::new(state.clone(), &config, clock.clone()),
            frames_rx,
            commands_rx,
            events.clone(),
            connector_handle.clone(),
            shutdown_rx.clone(),
            stats.clone(),
            sweep_interval,
        );

        let key_source: Arc<dyn NodeKeySource> = match self.key_source {
            Some(source) => source,
            None => state.nodes.clone(),
        };
        let scanner = Arc::new(SecurityScanService::new(
            key_source,
            state.nodes.clone(),
            SecurityScanner::new(corpus),
            clock.clone(),
            events.clone(),
        ));

        let reprocess = ReprocessRunner::new(
            state.registry.clone(),
            state.packet_log.clone(),
            cursors,
            clock.clone(),
            events.clone(),
            shutdown_rx.clone(),
            config.reprocess.batch_size,
        );

        // Ingestion subscribes to status before the connector publishes anything
        let ingest_task = tokio::spawn(ingest.run());
        let connector_task = tokio::spawn(connector.run());
        let mut tasks = vec![ingest_task];
        if config.security.enabled {
            tasks.push(tokio::spawn(
                scanner.clone().run_schedule(config.security.clone(), shutdown_rx.clone()),
            ));
        }
        match reprocess.resume_interrupted() {
            Ok(true) => info!("Resumed interrupted reprocess job"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Interrupted reprocess job could not be resumed"),
        }

        info!("Mesh service started");
        Ok(MeshService {
            config,
            clock,
            state,
            connector: connector_handle,
            commands: commands_tx,
            events,
            shutdown: shutdown_tx,
            stats,
            scanner,
            reprocess,
            connector_task: Some(connector_task),
            tasks,
        })
    }
}

// ----------------------------------------------------------------------------
// Service Handle
// ----------------------------------------------------------------------------

pub struct MeshService {
    config: MeshmonConfig,
    clock: Arc<dyn TimeSource>,
    state: SharedState,
    connector: ConnectorHandle,
    commands: mpsc::Sender<IngestCommand>,
    events: broadcast::Sender<MeshEvent>,
    shutdown: watch::Sender<bool>,
    stats: Arc<Mutex<PipelineStats>>,
    scanner: Arc<SecurityScanService>,
    reprocess: ReprocessRunner,
    connector_task: Option<JoinHandle<ConnectionState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshService {
    pub fn builder(config: MeshmonConfig) -> MeshServiceBuilder {
        MeshServiceBuilder::new(config)
    }

    pub fn config(&self) -> &MeshmonConfig {
        &self.config
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connector.status()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.connector.subscribe_status()
    }

    pub fn audit_trail(&self) -> Vec<AuditEntry> {
        self.connector.audit_trail()
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.stats.lock().clone()
    }

    // ------------------------------------------------------------------------
    // Channel keys
    // ------------------------------------------------------------------------

    pub fn create_key(&self, new: NewChannelKey) -> MeshmonResult<RegistryChange> {
        let change = self.state.registry.write().create(new)?;
        self.after_key_change(&change);
        Ok(change)
    }

    pub fn update_key(&self, id: EntryId, update: ChannelKeyUpdate) -> MeshmonResult<RegistryChange> {
        let change = self.state.registry.write().update(id, update)?;
        self.after_key_change(&change);
        Ok(change)
    }

    pub fn set_key_enabled(&self, id: EntryId, enabled: bool) -> MeshmonResult<RegistryChange> {
        let change = self.state.registry.write().set_enabled(id, enabled)?;
        self.after_key_change(&change);
        Ok(change)
    }

    pub fn delete_key(&self, id: EntryId) -> MeshmonResult<RegistryChange> {
        Ok(self.state.registry.write().delete(id)?)
    }

    pub fn reorder_keys(&self, ordered: &[EntryId]) -> MeshmonResult<RegistryChange> {
        Ok(self.state.registry.write().reorder(ordered)?)
    }

    pub fn list_keys(&self) -> Vec<EntrySummary> {
        self.state.registry.read().summaries()
    }

    /// Entries visible to a caller allowed to see `visible`
    pub fn list_visible_keys(&self, visible: &HashSet<EntryId>) -> Vec<EntrySummary> {
        self.state.registry.read().list_visible(visible)
    }

    pub fn key_usage(&self, id: EntryId) -> Option<EntrySummary> {
        self.state.registry.read().get(id).map(|entry| entry.summary())
    }

    fn after_key_change(&self, change: &RegistryChange) {
        let Some(entry) = change.warrants_reprocess() else {
            return;
        };
        if self.config.reprocess.auto_on_key_change {
            let trigger = self.reprocess.trigger(Some(entry));
            info!(entry = %entry, ?trigger, "Reprocessing stored packets for new key");
        }
    }

    // ------------------------------------------------------------------------
    // Background jobs
    // ------------------------------------------------------------------------

    /// Try every enabled key against all undecryptable packets
    pub fn reprocess_all(&self) -> ReprocessTrigger {
        self.reprocess.trigger(None)
    }

    pub fn reprocess_for(&self, entry: EntryId) -> ReprocessTrigger {
        self.reprocess.trigger(Some(entry))
    }

    pub fn reprocess_status(&self) -> ReprocessStatus {
        self.reprocess.status()
    }

    pub async fn wait_reprocess_idle(&self) {
        self.reprocess.wait_idle().await
    }

    pub async fn run_security_scan(&self) -> Result<SecurityScanResult, ScanError> {
        let scanner = self.scanner.clone();
        match tokio::task::spawn_blocking(move || scanner.run_now()).await {
            Ok(result) => result,
            Err(e) => Err(ScanError::Source(meshmon_core::StorageError::Unavailable {
                reason: e.to_string(),
            })),
        }
    }

    pub fn last_security_scan(&self) -> Option<SecurityScanResult> {
        self.scanner.last_result()
    }

    // ------------------------------------------------------------------------
    // Device requests
    // ------------------------------------------------------------------------

    /// Send a traceroute; returns the request's packet id
    pub async fn request_traceroute(&self, destination: NodeNum) -> MeshmonResult<u32> {
        let (reply, response) = oneshot::channel();
        self.send_command(IngestCommand::Traceroute { destination, reply })
            .await?;
        let result = response
            .await
            .map_err(|_| MeshmonError::channel_error("ingestion task stopped"))?;
        Ok(result?)
    }

    pub async fn set_favorite(&self, node: NodeNum, favorite: bool) -> MeshmonResult<Option<FavoriteChange>> {
        let (reply, response) = oneshot::channel();
        self.send_command(IngestCommand::SetFavorite { node, favorite, reply })
            .await?;
        response
            .await
            .map_err(|_| MeshmonError::channel_error("ingestion task stopped"))
    }

    async fn send_command(&self, command: IngestCommand) -> MeshmonResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MeshmonError::channel_error("ingestion task stopped"))
    }

    // ------------------------------------------------------------------------
    // Read access
    // ------------------------------------------------------------------------

    pub fn nodes(&self) -> Vec<Node> {
        self.state.nodes.read().node_list()
    }

    pub fn node(&self, num: NodeNum) -> Option<Node> {
        self.state.nodes.read().get(num).cloned()
    }

    pub fn local_node(&self) -> Option<NodeNum> {
        self.state.nodes.read().local_node()
    }

    pub fn link_quality(&self, node: NodeNum) -> Vec<LinkQualityRecord> {
        self.state.link_quality.read().history(node)
    }

    pub fn link_scores(&self) -> Vec<(NodeNum, u8)> {
        self.state.link_quality.read().scores()
    }

    pub fn hop_profile(&self, node: NodeNum) -> Vec<HopProfilePoint> {
        let shape = ProfileShape::from_config(&self.config.link_quality);
        self.state
            .hop_samples
            .read()
            .profile(node, self.clock.now(), &shape)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::capture(&self.state, self.clock.now())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Signal every task to stop and wait briefly for them
    pub async fn shutdown(&mut self) -> MeshmonResult<()> {
        info!("Shutting down mesh service");
        let _ = self.shutdown.send(true);

        if let Some(task) = self.connector_task.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(state)) => info!(state = %state, "Connector finished"),
                Ok(Err(e)) => warn!(error = %e, "Connector task failed"),
                Err(_) => warn!("Connector did not stop in time"),
            }
        }
        // A running reprocess job stops after its current batch
        if let Some(task) = self.reprocess.take_task() {
            self.tasks.push(task);
        }
        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }

        info!("Mesh service stopped");
        Ok(())
    }
}
