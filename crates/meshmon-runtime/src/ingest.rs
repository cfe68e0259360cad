//! Ingestion task
//!
//! Sole owner of the `PacketPipeline`. Frames are processed strictly in
//! arrival order and every resulting event is published on the broadcast
//! bus. Commands from the service (traceroutes, operator favourites) are
//! serialized through the same loop so the node store has one writer.

use std::sync::Arc;
use std::time::Duration;

use meshmon_core::errors::TransportError;
use meshmon_core::favorites::FavoriteChange;
use meshmon_core::pipeline::{PacketPipeline, PipelineStats};
use meshmon_core::transport::ConnectionStatus;
use meshmon_core::types::NodeNum;
use meshmon_core::MeshEvent;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connector::ConnectorHandle;

const EXPIRY_TICK: Duration = Duration::from_secs(1);

/// Work the service hands to the ingestion task
#[derive(Debug)]
pub enum IngestCommand {
    Traceroute {
        destination: NodeNum,
        reply: oneshot::Sender<Result<u32, TransportError>>,
    },
    SetFavorite {
        node: NodeNum,
        favorite: bool,
        reply: oneshot::Sender<Option<FavoriteChange>>,
    },
}

pub struct IngestTask {
    pipeline: PacketPipeline,
    frames: mpsc::Receiver<Vec<u8>>,
    commands: mpsc::Receiver<IngestCommand>,
    events: broadcast::Sender<MeshEvent>,
    connector: ConnectorHandle,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<PipelineStats>>,
    sweep_interval: Option<Duration>,
}

impl IngestTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: PacketPipeline,
        frames: mpsc::Receiver<Vec<u8>>,
        commands: mpsc::Receiver<IngestCommand>,
        events: broadcast::Sender<MeshEvent>,
        connector: ConnectorHandle,
        shutdown: watch::Receiver<bool>,
        stats: Arc<Mutex<PipelineStats>>,
        sweep_interval: Option<Duration>,
    ) -> Self {
        let status = connector.subscribe_status();
        Self {
            pipeline,
            frames,
            commands,
            events,
            connector,
            status,
            shutdown,
            stats,
            sweep_interval,
        }
    }

    pub async fn run(mut self) {
        info!("Ingestion task starting");

        let mut frames_open = true;
        let mut status_open = true;
        let mut expiry = tokio::time::interval(EXPIRY_TICK);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweep_enabled = self.sweep_interval.is_some();
        let mut sweep = tokio::time::interval(self.sweep_interval.unwrap_or(Duration::from_secs(3600)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,

                frame = self.frames.recv(), if frames_open => match frame {
                    Some(frame) => self.handle_frame(&frame),
                    None => {
                        frames_open = false;
                        info!("Frame stream closed");
                    }
                },

                Some(command) = self.commands.recv() => self.handle_command(command),

                changed = self.status.changed(), if status_open => match changed {
                    Ok(()) => {
                        let status = self.status.borrow_and_update().clone();
                        self.publish(vec![MeshEvent::Connection(status)]);
                    }
                    Err(_) => status_open = false,
                },

                _ = expiry.tick() => {
                    let events = self.pipeline.expire_requests();
                    self.publish(events);
                }

                _ = sweep.tick(), if sweep_enabled => {
                    let events = self.pipeline.sweep_favorites();
                    if !events.is_empty() {
                        debug!(removed = events.len(), "Auto favourites swept");
                    }
                    self.publish(events);
                }
            }
        }

        *self.stats.lock() = self.pipeline.stats().clone();
        info!("Ingestion task stopped");
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        match self.pipeline.process_frame(frame) {
            Ok(events) => self.publish(events),
            Err(e) => debug!(error = %e, "Malformed frame dropped"),
        }
        *self.stats.lock() = self.pipeline.stats().clone();
    }

    fn handle_command(&mut self, command: IngestCommand) {
        match command {
            IngestCommand::Traceroute { destination, reply } => {
                let packet_id = fastrand::u32(1..);
                let message = self.pipeline.prepare_traceroute(destination, packet_id);
                let result = self.connector.send(message).map(|()| packet_id);
                match &result {
                    Ok(_) => info!(destination = %destination, packet_id, "Traceroute sent"),
                    Err(e) => {
                        self.pipeline.cancel_request(packet_id);
                        warn!(destination = %destination, error = %e, "Traceroute not sent");
                    }
                }
                let _ = reply.send(result);
            }
            IngestCommand::SetFavorite { node, favorite, reply } => {
                let change = self.pipeline.state().nodes.write().set_favorite(node, favorite);
                if let Some(change) = &change {
                    self.publish(vec![MeshEvent::Favorite(*change)]);
                }
                let _ = reply.send(change);
            }
        }
    }

    /// Publishing never blocks; a bus with no subscribers is fine
    fn publish(&self, events: Vec<MeshEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }
}
