//! Transport Connector Task
//!
//! Owns the link to the device and drives the core `ConnectionState`
//! machine: connect with a timeout, request the device configuration, pump
//! frames to the ingestion task, write outbound messages and heartbeats, and
//! reconnect with exponential backoff until the attempt limit is reached.
//!
//! Status is published on a watch channel. Frame counters are folded into the
//! status without waking watchers; only state changes notify.

use std::collections::VecDeque;
use std::sync::Arc;

use meshmon_core::config::TransportConfig;
use meshmon_core::errors::TransportError;
use meshmon_core::protocol::schema::ToRadio;
use meshmon_core::protocol::{encode_to_radio, StreamFramer};
use meshmon_core::transport::{AuditEntry, BackoffPolicy, ConnectionEvent, ConnectionState, ConnectionStatus};
use meshmon_core::types::TimeSource;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::link::{BoxedLink, LinkOpener};

const READ_BUFFER: usize = 1024;
const AUDIT_LIMIT: usize = 256;

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Cloneable handle for sending to the device and observing the connection
#[derive(Debug, Clone)]
pub struct ConnectorHandle {
    outbound: mpsc::Sender<ToRadio>,
    capacity: usize,
    status: watch::Receiver<ConnectionStatus>,
    audit: Arc<Mutex<VecDeque<AuditEntry>>>,
}

impl ConnectorHandle {
    /// Queue a message for the device; fails immediately unless connected
    pub fn send(&self, message: ToRadio) -> Result<(), TransportError> {
        if !self.status.borrow().can_send() {
            return Err(TransportError::NotConnected);
        }
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::SendBufferFull {
                capacity: self.capacity,
            },
            TrySendError::Closed(_) => TransportError::Shutdown {
                reason: "connector stopped".to_string(),
            },
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Most recent state transitions, oldest first
    pub fn audit_trail(&self) -> Vec<AuditEntry> {
        self.audit.lock().iter().cloned().collect()
    }
}

// ----------------------------------------------------------------------------
// Connector
// ----------------------------------------------------------------------------

enum SessionEnd {
    Shutdown,
    Lost(String),
}

pub struct Connector {
    opener: Arc<dyn LinkOpener>,
    config: TransportConfig,
    policy: BackoffPolicy,
    clock: Arc<dyn TimeSource>,
    state: ConnectionState,
    framer: StreamFramer,
    status: watch::Sender<ConnectionStatus>,
    frames: mpsc::Sender<Vec<u8>>,
    outbound: mpsc::Receiver<ToRadio>,
    shutdown: watch::Receiver<bool>,
    audit: Arc<Mutex<VecDeque<AuditEntry>>>,
}

impl Connector {
    /// Build a connector and its handle; frames are delivered on `frames`
    pub fn new(
        opener: Arc<dyn LinkOpener>,
        config: TransportConfig,
        clock: Arc<dyn TimeSource>,
        frames: mpsc::Sender<Vec<u8>>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, ConnectorHandle) {
        let capacity = config.outbound_buffer_size.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::new(opener.endpoint()));
        let audit = Arc::new(Mutex::new(VecDeque::new()));

        let connector = Self {
            policy: BackoffPolicy::from_config(&config),
            opener,
            config,
            clock,
            state: ConnectionState::initial(),
            framer: StreamFramer::new(),
            status: status_tx,
            frames,
            outbound: outbound_rx,
            shutdown,
            audit: audit.clone(),
        };
        let handle = ConnectorHandle {
            outbound: outbound_tx,
            capacity,
            status: status_rx,
            audit,
        };
        (connector, handle)
    }

    /// Run until shutdown or until reconnect attempts are exhausted
    pub async fn run(mut self) -> ConnectionState {
        info!(endpoint = %self.opener.endpoint(), "Connector starting");
        self.apply(ConnectionEvent::Connect);

        loop {
            if *self.shutdown.borrow() && !matches!(self.state, ConnectionState::Disconnected { .. }) {
                self.apply(ConnectionEvent::Shutdown);
            }
            match self.state {
                ConnectionState::Connecting { attempt } => self.attempt(attempt).await,
                ConnectionState::Reconnecting { failures, .. } => {
                    let delay = self.policy.delay_for(failures);
                    debug!(failures, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                    tokio::select! {
                        _ = self.shutdown.changed() => self.apply(ConnectionEvent::Shutdown),
                        _ = tokio::time::sleep(delay) => self.apply(ConnectionEvent::RetryDue),
                    }
                }
                ConnectionState::Connected { .. } => {
                    self.apply(ConnectionEvent::ConnectionLost {
                        reason: "session ended".to_string(),
                    });
                }
                ConnectionState::Disconnected { .. } => break,
            }
        }

        info!(state = %self.state, "Connector stopped");
        self.state
    }

    async fn attempt(&mut self, attempt: u32) {
        let opener = self.opener.clone();
        let open = tokio::time::timeout(self.config.connect_timeout(), opener.open());
        let result = tokio::select! {
            _ = self.shutdown.changed() => {
                self.apply(ConnectionEvent::Shutdown);
                return;
            }
            result = open => result,
        };

        let reason = match result {
            Ok(Ok(link)) => {
                self.apply(ConnectionEvent::Established);
                info!(endpoint = %self.opener.endpoint(), attempt, "Connected to device");
                match self.session(link).await {
                    SessionEnd::Shutdown => self.apply(ConnectionEvent::Shutdown),
                    SessionEnd::Lost(reason) => {
                        warn!(reason = %reason, "Connection lost");
                        self.note_error(&reason);
                        self.apply(ConnectionEvent::ConnectionLost { reason });
                    }
                }
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => TransportError::Timeout {
                duration_ms: self.config.connect_timeout().as_millis() as u64,
            }
            .to_string(),
        };

        warn!(attempt, reason = %reason, "Connection attempt failed");
        self.note_error(&reason);
        self.apply(ConnectionEvent::ConnectFailed { reason });
        if self.state.is_terminal() {
            let gave_up = TransportError::GaveUp { attempts: attempt };
            error!(error = %gave_up, "Giving up on the device connection");
            self.note_error(&gave_up.to_string());
        }
    }

    async fn session(&mut self, link: BoxedLink) -> SessionEnd {
        let (mut reader, mut writer) = tokio::io::split(link);
        self.framer.reset();

        let config_id = fastrand::u32(1..);
        if let Err(e) = self.write_message(&mut writer, &ToRadio::want_config(config_id)).await {
            return SessionEnd::Lost(e.to_string());
        }
        debug!(config_id, "Requested device configuration");

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let mut buf = vec![0u8; READ_BUFFER];
        let end = loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = self.write_message(&mut writer, &ToRadio::disconnect()).await;
                    break SessionEnd::Shutdown;
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break SessionEnd::Lost("link closed by device".to_string()),
                    Ok(n) => {
                        self.framer.push(&buf[..n]);
                        if !self.forward_frames().await {
                            break SessionEnd::Shutdown;
                        }
                    }
                    Err(e) => break SessionEnd::Lost(e.to_string()),
                },
                message = self.outbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.write_message(&mut writer, &message).await {
                            break SessionEnd::Lost(e.to_string());
                        }
                    }
                    None => break SessionEnd::Shutdown,
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.write_message(&mut writer, &ToRadio::heartbeat()).await {
                        break SessionEnd::Lost(e.to_string());
                    }
                    trace!("Heartbeat sent");
                }
            }
        };

        if let Some(e) = self.framer.finish() {
            debug!(error = %e, "Partial frame discarded at end of session");
        }
        // Requests queued for this session are not replayed on the next one
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded unsent outbound messages");
        }
        end
    }

    /// Hand complete frames to ingestion; `false` once ingestion is gone
    async fn forward_frames(&mut self) -> bool {
        while let Some(result) = self.framer.next_frame() {
            match result {
                Ok(frame) => {
                    self.status.send_if_modified(|status| {
                        status.frames_received += 1;
                        false
                    });
                    if self.frames.send(frame).await.is_err() {
                        return false;
                    }
                }
                Err(e) => debug!(error = %e, "Frame header error, resynchronising"),
            }
        }
        true
    }

    async fn write_message<W>(&mut self, writer: &mut W, message: &ToRadio) -> Result<(), TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = encode_to_radio(message)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        self.status.send_if_modified(|status| {
            status.frames_sent += 1;
            false
        });
        Ok(())
    }

    fn note_error(&mut self, reason: &str) {
        self.status.send_if_modified(|status| {
            status.last_error = Some(reason.to_string());
            false
        });
    }

    fn apply(&mut self, event: ConnectionEvent) {
        let now = self.clock.now();
        match self.state.transition(event, &self.policy, now) {
            Ok(transition) => {
                debug!(
                    from = %transition.audit_entry.from_state,
                    to = %transition.audit_entry.to_state,
                    event = %transition.audit_entry.event,
                    "Connection state transition"
                );
                {
                    let mut audit = self.audit.lock();
                    audit.push_back(transition.audit_entry);
                    while audit.len() > AUDIT_LIMIT {
                        audit.pop_front();
                    }
                }
                self.state = transition.new_state;
                let state = self.state;
                self.status.send_modify(|status| {
                    status.state = state;
                    if state.is_connected() {
                        status.last_error = None;
                    }
                });
            }
            Err(e) => warn!(error = %e, "Ignoring connection event"),
        }
    }
}
