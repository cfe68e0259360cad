//! Reprocess runner
//!
//! Runs retroactive decryption jobs in the background, one batch at a time,
//! yielding between batches so live ingestion keeps flowing. Only one job runs
//! at a time; a trigger that arrives mid-job queues exactly one follow-up run.
//! Shutdown stops a job between batches with its cursor saved, and a cursor
//! left behind by an interrupted process is resumed on start.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use meshmon_core::errors::StorageError;
use meshmon_core::registry::{ChannelKeyRegistry, EntryId};
use meshmon_core::reprocess::{resume_from_store, CursorStore, ReprocessJob};
use meshmon_core::types::TimeSource;
use meshmon_core::{MeshEvent, PacketLog, PacketPipeline};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprocessTrigger {
    Started,
    /// A job is running; another pass will follow it
    Queued,
    /// The service is shutting down; nothing was started
    Stopped,
}

enum JobEnd {
    Completed,
    /// Stopped between batches; the cursor stays persisted
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReprocessStatus {
    pub running: bool,
    pub rerun_pending: bool,
    pub jobs_completed: u64,
    pub packets_recovered: u64,
    pub last_error: Option<String>,
}

struct Inner {
    registry: Arc<RwLock<ChannelKeyRegistry>>,
    log: Arc<dyn PacketLog>,
    cursors: Arc<dyn CursorStore>,
    clock: Arc<dyn TimeSource>,
    events: broadcast::Sender<MeshEvent>,
    shutdown: watch::Receiver<bool>,
    batch_size: usize,
    running: AtomicBool,
    rerun: Mutex<Option<Option<EntryId>>>,
    jobs_completed: AtomicU64,
    packets_recovered: AtomicU64,
    last_error: Mutex<Option<String>>,
    idle: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ReprocessRunner {
    inner: Arc<Inner>,
}

impl ReprocessRunner {
    pub fn new(
        registry: Arc<RwLock<ChannelKeyRegistry>>,
        log: Arc<dyn PacketLog>,
        cursors: Arc<dyn CursorStore>,
        clock: Arc<dyn TimeSource>,
        events: broadcast::Sender<MeshEvent>,
        shutdown: watch::Receiver<bool>,
        batch_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                log,
                cursors,
                clock,
                events,
                shutdown,
                batch_size: batch_size.max(1),
                running: AtomicBool::new(false),
                rerun: Mutex::new(None),
                jobs_completed: AtomicU64::new(0),
                packets_recovered: AtomicU64::new(0),
                last_error: Mutex::new(None),
                idle: Notify::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Start a job for `entry`, or queue one behind the running job
    pub fn trigger(&self, entry: Option<EntryId>) -> ReprocessTrigger {
        if self.stopping() {
            debug!(?entry, "Reprocess not started, shutting down");
            return ReprocessTrigger::Stopped;
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            *self.inner.rerun.lock() = Some(entry);
            debug!(?entry, "Reprocess queued behind the running job");
            return ReprocessTrigger::Queued;
        }
        let job = ReprocessJob::new(entry, self.inner.batch_size, self.inner.clock.now());
        self.spawn(job);
        ReprocessTrigger::Started
    }

    /// Pick up a job interrupted by a previous shutdown
    pub fn resume_interrupted(&self) -> Result<bool, StorageError> {
        if self.stopping() {
            return Ok(false);
        }
        let Some(job) = resume_from_store(self.inner.cursors.as_ref(), self.inner.batch_size)? else {
            return Ok(false);
        };
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        self.spawn(job);
        Ok(true)
    }

    /// Handle of the job task, for the service to await on shutdown
    pub fn take_task(&self) -> Option<JoinHandle<()>> {
        self.inner.task.lock().take()
    }

    pub fn status(&self) -> ReprocessStatus {
        ReprocessStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            rerun_pending: self.inner.rerun.lock().is_some(),
            jobs_completed: self.inner.jobs_completed.load(Ordering::SeqCst),
            packets_recovered: self.inner.packets_recovered.load(Ordering::SeqCst),
            last_error: self.inner.last_error.lock().clone(),
        }
    }

    /// Wait until no job is running or queued
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.inner.running.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn stopping(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn spawn(&self, job: ReprocessJob) {
        let handle = tokio::spawn(self.clone().drive(job));
        *self.inner.task.lock() = Some(handle);
    }

    async fn drive(self, mut job: ReprocessJob) {
        loop {
            info!(job_id = %job.cursor().job_id, trigger = ?job.cursor().trigger, "Reprocess job starting");
            match self.run_job(&mut job).await {
                Ok(JobEnd::Completed) => {
                    self.inner.jobs_completed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(JobEnd::Cancelled) => {
                    info!(
                        job_id = %job.cursor().job_id,
                        scanned = job.cursor().scanned,
                        "Reprocess job stopped for shutdown, cursor kept"
                    );
                    self.inner.rerun.lock().take();
                    break;
                }
                Err(e) => {
                    warn!(job_id = %job.cursor().job_id, error = %e, "Reprocess job failed");
                    *self.inner.last_error.lock() = Some(e.to_string());
                }
            }

            let next = self.inner.rerun.lock().take();
            match next {
                Some(entry) => {
                    job = ReprocessJob::new(entry, self.inner.batch_size, self.inner.clock.now());
                }
                None => break,
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        // A trigger that raced the flag reset would otherwise be lost
        if let Some(entry) = self.inner.rerun.lock().take() {
            let _ = self.trigger(entry);
        }
        self.inner.idle.notify_waiters();
    }

    async fn run_job(&self, job: &mut ReprocessJob) -> Result<JobEnd, StorageError> {
        loop {
            // Entries are re-read per batch so edits made mid-job apply
            let entries = self.inner.registry.read().enabled_in_order();
            let report = job.run_batch(
                self.inner.log.as_ref(),
                &entries,
                self.inner.cursors.as_ref(),
                self.inner.clock.now(),
            )?;

            if !report.recovered.is_empty() {
                self.inner
                    .packets_recovered
                    .fetch_add(report.recovered.len() as u64, Ordering::SeqCst);
                for event in PacketPipeline::recovered_events(&report.recovered) {
                    let _ = self.inner.events.send(event);
                }
            }
            if report.done {
                return Ok(JobEnd::Completed);
            }
            // The batch's cursor is saved; a resumed job continues after it
            if self.stopping() {
                return Ok(JobEnd::Cancelled);
            }
            tokio::task::yield_now().await;
        }
    }
}

impl std::fmt::Debug for ReprocessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReprocessRunner").field("status", &self.status()).finish()
    }
}
