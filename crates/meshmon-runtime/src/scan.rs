//! Security scan service
//!
//! Runs the key scanner on a schedule (a random initial delay, then a fixed
//! interval) and on demand. At most one scan runs at a time; a request made
//! while a scan is in flight is rejected. A failed scan is logged and the
//! schedule carries on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meshmon_core::config::SecurityConfig;
use meshmon_core::errors::StorageError;
use meshmon_core::node_store::NodeStore;
use meshmon_core::security::{apply_scan, NodeKeySource, SecurityScanResult, SecurityScanner};
use meshmon_core::types::TimeSource;
use meshmon_core::MeshEvent;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("A security scan is already running")]
    AlreadyRunning,

    #[error("Could not read node keys: {0}")]
    Source(#[from] StorageError),
}

/// Releases the single-flight flag when dropped
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SecurityScanService {
    source: Arc<dyn NodeKeySource>,
    nodes: Arc<RwLock<NodeStore>>,
    scanner: SecurityScanner,
    clock: Arc<dyn TimeSource>,
    events: broadcast::Sender<MeshEvent>,
    running: AtomicBool,
    last_result: Mutex<Option<SecurityScanResult>>,
}

impl SecurityScanService {
    pub fn new(
        source: Arc<dyn NodeKeySource>,
        nodes: Arc<RwLock<NodeStore>>,
        scanner: SecurityScanner,
        clock: Arc<dyn TimeSource>,
        events: broadcast::Sender<MeshEvent>,
    ) -> Self {
        Self {
            source,
            nodes,
            scanner,
            clock,
            events,
            running: AtomicBool::new(false),
            last_result: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_result(&self) -> Option<SecurityScanResult> {
        self.last_result.lock().clone()
    }

    /// Scan now, unless a scan is already in flight
    pub fn run_now(&self) -> Result<SecurityScanResult, ScanError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Security scan skipped, one is already running");
            return Err(ScanError::AlreadyRunning);
        }
        let _guard = InFlight(&self.running);

        let snapshot = self.source.key_snapshot()?;
        let result = self.scanner.scan(&snapshot, self.clock.as_ref());
        let changed = apply_scan(&mut self.nodes.write(), &snapshot, &result);

        info!(
            scan_id = %result.scan_id,
            nodes = result.nodes_scanned,
            low_entropy = result.low_entropy.len(),
            duplicate_groups = result.duplicate_groups.len(),
            flags_changed = changed.len(),
            "Security scan complete"
        );
        let _ = self.events.send(MeshEvent::SecurityScanCompleted {
            scan_id: result.scan_id,
            low_entropy: result.low_entropy.len(),
            duplicate_groups: result.duplicate_groups.len(),
            flags_changed: changed.len(),
        });
        *self.last_result.lock() = Some(result.clone());
        Ok(result)
    }

    /// Scheduled scans until shutdown
    pub async fn run_schedule(self: Arc<Self>, config: SecurityConfig, mut shutdown: watch::Receiver<bool>) {
        let low = config.initial_delay_min_secs;
        let high = config.initial_delay_max_secs.max(low);
        let initial = Duration::from_secs(fastrand::u64(low..=high));
        info!(initial_delay_secs = initial.as_secs(), "Security scan schedule starting");

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(initial) => {}
        }

        let mut interval = tokio::time::interval(config.scan_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let service = self.clone();
                    match tokio::task::spawn_blocking(move || service.run_now()).await {
                        Ok(Ok(_)) | Ok(Err(ScanError::AlreadyRunning)) => {}
                        Ok(Err(e)) => warn!(error = %e, "Scheduled security scan failed"),
                        Err(e) => warn!(error = %e, "Scheduled security scan panicked"),
                    }
                }
            }
        }
        info!("Security scan schedule stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshmon_core::config::NodeStoreConfig;
    use meshmon_core::security::KeySnapshot;
    use meshmon_core::types::{NodeNum, SystemTimeSource};
    use std::sync::atomic::AtomicUsize;

    struct FlakySource {
        calls: AtomicUsize,
        inner: Arc<RwLock<NodeStore>>,
    }

    impl NodeKeySource for FlakySource {
        fn key_snapshot(&self) -> Result<Vec<KeySnapshot>, StorageError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StorageError::Unavailable {
                    reason: "node store offline".to_string(),
                });
            }
            self.inner.key_snapshot()
        }
    }

    /// Blocks inside the snapshot until released
    struct GateSource {
        entered: std::sync::mpsc::Sender<()>,
        release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl NodeKeySource for GateSource {
        fn key_snapshot(&self) -> Result<Vec<KeySnapshot>, StorageError> {
            let _ = self.entered.send(());
            let _ = self.release.lock().map(|rx| rx.recv());
            Ok(vec![KeySnapshot {
                node: NodeNum::new(1),
                public_key: Some(vec![0u8; 32]),
            }])
        }
    }

    fn service(source: Arc<dyn NodeKeySource>, nodes: Arc<RwLock<NodeStore>>) -> SecurityScanService {
        let (events, _) = broadcast::channel(16);
        SecurityScanService::new(
            source,
            nodes,
            SecurityScanner::default(),
            Arc::new(SystemTimeSource),
            events,
        )
    }

    #[test]
    fn test_failed_scan_does_not_block_the_next() {
        let nodes = Arc::new(RwLock::new(NodeStore::new(NodeStoreConfig::testing())));
        let source = Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
            inner: nodes.clone(),
        });
        let service = service(source, nodes);

        assert!(matches!(service.run_now(), Err(ScanError::Source(_))));
        assert!(!service.is_running());
        let result = service.run_now().unwrap();
        assert_eq!(result.nodes_scanned, 0);
        assert!(service.last_result().is_some());
    }

    #[test]
    fn test_concurrent_request_is_rejected() {
        let nodes = Arc::new(RwLock::new(NodeStore::new(NodeStoreConfig::testing())));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let source = Arc::new(GateSource {
            entered: entered_tx,
            release: std::sync::Mutex::new(release_rx),
        });
        let service = Arc::new(service(source, nodes));

        let background = {
            let service = service.clone();
            std::thread::spawn(move || service.run_now())
        };
        entered_rx.recv().unwrap();
        assert!(matches!(service.run_now(), Err(ScanError::AlreadyRunning)));

        release_tx.send(()).unwrap();
        let result = background.join().unwrap().unwrap();
        assert_eq!(result.low_entropy, vec![NodeNum::new(1)]);
        assert!(!service.is_running());
    }
}
