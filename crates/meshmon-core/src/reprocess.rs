//! Retroactive reprocessing
//!
//! When a key becomes usable, packets already logged as undecryptable are
//! run through the decryption engine again in batches. After every batch the
//! job's cursor (last log id examined) is persisted, so an interrupted job
//! resumes where it stopped. Tags change through the log's compare-and-set,
//! and an entry is credited only when that CAS succeeds; two jobs racing over
//! the same records cannot double count.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::decryption::{DecryptionEngine, EncryptedPayload};
use crate::errors::StorageError;
use crate::packet_log::{LogId, PacketLog, PacketRecord};
use crate::protocol::schema::Data;
use crate::registry::{ChannelKeyEntry, EntryId};
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Cursor
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReprocessCursor {
    pub job_id: Uuid,
    /// Entry whose creation or enabling started the job
    pub trigger: Option<EntryId>,
    /// Last log id examined; the next batch starts after it
    pub last_log_id: Option<LogId>,
    pub scanned: u64,
    pub recovered: u64,
    pub started_at: Timestamp,
}

impl ReprocessCursor {
    pub fn new(trigger: Option<EntryId>, now: Timestamp) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            trigger,
            last_log_id: None,
            scanned: 0,
            recovered: 0,
            started_at: now,
        }
    }
}

/// Durable home for the cursor of the job in progress
pub trait CursorStore: Send + Sync {
    fn load(&self) -> Result<Option<ReprocessCursor>, StorageError>;
    fn save(&self, cursor: &ReprocessCursor) -> Result<(), StorageError>;
    /// Forget the cursor once a job completes
    fn clear(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursor: Mutex<Option<ReprocessCursor>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self) -> Result<Option<ReprocessCursor>, StorageError> {
        Ok(self.cursor.lock().clone())
    }

    fn save(&self, cursor: &ReprocessCursor) -> Result<(), StorageError> {
        *self.cursor.lock() = Some(cursor.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.cursor.lock() = None;
        Ok(())
    }
}

/// JSON file cursor store; writes go to a temporary file that is renamed
/// over the target
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> Result<Option<ReprocessCursor>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, cursor: &ReprocessCursor) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(cursor)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ----------------------------------------------------------------------------
// Job
// ----------------------------------------------------------------------------

/// Packet resolved by a batch
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredPacket {
    /// Record with its updated tag
    pub record: PacketRecord,
    pub entry: EntryId,
    pub data: Data,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub scanned: usize,
    pub recovered: Vec<RecoveredPacket>,
    /// No undecryptable records remain past the cursor
    pub done: bool,
}

/// Resumable batch job over undecryptable packets
#[derive(Debug, Clone)]
pub struct ReprocessJob {
    cursor: ReprocessCursor,
    batch_size: usize,
}

impl ReprocessJob {
    pub fn new(trigger: Option<EntryId>, batch_size: usize, now: Timestamp) -> Self {
        Self::resume(ReprocessCursor::new(trigger, now), batch_size)
    }

    pub fn resume(cursor: ReprocessCursor, batch_size: usize) -> Self {
        Self {
            cursor,
            batch_size: batch_size.max(1),
        }
    }

    pub fn cursor(&self) -> &ReprocessCursor {
        &self.cursor
    }

    /// Process the next batch and persist the cursor
    ///
    /// `entries` is the enabled registry snapshot in priority order. The
    /// cursor is saved after the batch, or cleared when the job is done.
    pub fn run_batch(
        &mut self,
        log: &dyn PacketLog,
        entries: &[ChannelKeyEntry],
        cursors: &dyn CursorStore,
        now: Timestamp,
    ) -> Result<BatchReport, StorageError> {
        let batch = log.undecryptable_after(self.cursor.last_log_id, self.batch_size);
        let mut recovered = Vec::new();

        for record in &batch {
            self.cursor.last_log_id = Some(record.log_id);
            self.cursor.scanned += 1;
            if !record.awaits_channel_key() {
                continue;
            }

            let payload = EncryptedPayload {
                from: record.packet.from,
                packet_id: record.packet.packet_id,
                channel_hash: (record.packet.channel & 0xff) as u8,
                ciphertext: &record.packet.payload,
            };
            let outcome = DecryptionEngine::attempt(entries, &payload);
            let Some((entry_id, data)) = outcome.matched else {
                continue;
            };

            match log.resolve(record.log_id, entry_id) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(log_id = record.log_id.value(), "Record already resolved elsewhere");
                    continue;
                }
                // Evicted by live appends since the batch was read
                Err(StorageError::RecordNotFound { log_id }) => {
                    debug!(log_id, "Record evicted before it could be resolved");
                    continue;
                }
                Err(e) => return Err(e),
            }
            if let Some(entry) = entries.iter().find(|e| e.id == entry_id) {
                entry.usage().credit(now);
            }
            self.cursor.recovered += 1;

            recovered.push(RecoveredPacket {
                record: log.get(record.log_id).unwrap_or_else(|| record.clone()),
                entry: entry_id,
                data,
            });
        }

        let done = batch.len() < self.batch_size;
        if done {
            cursors.clear()?;
            info!(
                job_id = %self.cursor.job_id,
                scanned = self.cursor.scanned,
                recovered = self.cursor.recovered,
                "Reprocess job complete"
            );
        } else {
            cursors.save(&self.cursor)?;
            debug!(
                job_id = %self.cursor.job_id,
                scanned = self.cursor.scanned,
                "Reprocess batch persisted"
            );
        }

        Ok(BatchReport {
            scanned: batch.len(),
            recovered,
            done,
        })
    }

    /// Run batches until the job completes
    pub fn run_to_completion(
        &mut self,
        log: &dyn PacketLog,
        entries: &[ChannelKeyEntry],
        cursors: &dyn CursorStore,
        now: Timestamp,
    ) -> Result<Vec<RecoveredPacket>, StorageError> {
        let mut recovered = Vec::new();
        loop {
            let report = self.run_batch(log, entries, cursors, now)?;
            recovered.extend(report.recovered);
            if report.done {
                return Ok(recovered);
            }
        }
    }
}

/// Resume an interrupted job from `cursors`, if one was persisted
pub fn resume_from_store(
    cursors: &dyn CursorStore,
    batch_size: usize,
) -> Result<Option<ReprocessJob>, StorageError> {
    match cursors.load() {
        Ok(Some(cursor)) => {
            info!(job_id = %cursor.job_id, scanned = cursor.scanned, "Resuming reprocess job");
            Ok(Some(ReprocessJob::resume(cursor, batch_size)))
        }
        Ok(None) => Ok(None),
        Err(e) => {
            warn!(error = %e, "Could not load reprocess cursor");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{channel_hash, encrypt_payload, ChannelKey};
    use crate::packet_log::{DecryptionTag, MemoryPacketLog, NewPacketRecord};
    use crate::protocol::schema::PortNum;
    use crate::registry::{ChannelKeyRegistry, NewChannelKey};
    use crate::types::NodeNum;
    use prost::Message;

    fn undecryptable(log: &MemoryPacketLog, key: &ChannelKey, packet_id: u32) -> LogId {
        let from = NodeNum::new(0x42);
        let data = Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: format!("packet {}", packet_id).into_bytes(),
            ..Default::default()
        };
        let ciphertext = encrypt_payload(key, packet_id, from, &data.encode_to_vec()).unwrap();
        log.append(NewPacketRecord {
            received_at: Timestamp::new(0),
            from,
            to: NodeNum::BROADCAST,
            packet_id,
            channel: u32::from(channel_hash("Secret", key)),
            hop_start: 3,
            hop_limit: 2,
            port: None,
            payload: ciphertext,
            encrypted: true,
            pki_encrypted: false,
            tag: DecryptionTag::Undecryptable,
        })
        .unwrap()
    }

    #[test]
    fn test_batches_persist_cursor_and_resume() {
        let key = ChannelKey::from_psk(&[0x5a; 16]).unwrap();
        let log = MemoryPacketLog::new(100);
        let ids: Vec<LogId> = (1..=5).map(|i| undecryptable(&log, &key, i)).collect();

        let mut registry = ChannelKeyRegistry::new();
        registry.create(NewChannelKey::new("Secret", key)).unwrap();
        let entries = registry.enabled_in_order();
        let cursors = MemoryCursorStore::new();
        let now = Timestamp::new(10);

        let mut job = ReprocessJob::new(Some(EntryId::new(1)), 2, now);
        let report = job.run_batch(&log, &entries, &cursors, now).unwrap();
        assert_eq!(report.recovered.len(), 2);
        assert!(!report.done);
        assert_eq!(cursors.load().unwrap().unwrap().last_log_id, Some(ids[1]));

        // Simulate a restart from the persisted cursor
        let mut resumed = resume_from_store(&cursors, 2).unwrap().unwrap();
        let rest = resumed.run_to_completion(&log, &entries, &cursors, now).unwrap();
        assert_eq!(rest.len(), 3);
        assert!(cursors.load().unwrap().is_none());

        assert_eq!(log.tag_counts().registry, 5);
        assert_eq!(registry.get(EntryId::new(1)).unwrap().usage().decrypted_count(), 5);
    }

    #[test]
    fn test_second_run_changes_nothing() {
        let key = ChannelKey::from_psk(&[0x5b; 32]).unwrap();
        let log = MemoryPacketLog::new(100);
        for i in 1..=3 {
            undecryptable(&log, &key, i);
        }
        let mut registry = ChannelKeyRegistry::new();
        registry.create(NewChannelKey::new("Secret", key)).unwrap();
        let entries = registry.enabled_in_order();
        let cursors = MemoryCursorStore::new();
        let now = Timestamp::new(10);

        ReprocessJob::new(None, 10, now)
            .run_to_completion(&log, &entries, &cursors, now)
            .unwrap();
        let before = log.records();
        let again = ReprocessJob::new(None, 10, now)
            .run_to_completion(&log, &entries, &cursors, now)
            .unwrap();

        assert!(again.is_empty());
        assert_eq!(log.records(), before);
        assert_eq!(registry.get(EntryId::new(1)).unwrap().usage().decrypted_count(), 3);
    }

    /// Log whose first `resolve` lets a live append land first, evicting
    /// the oldest record
    struct LiveAppendLog {
        inner: MemoryPacketLog,
        live: Mutex<Option<NewPacketRecord>>,
    }

    impl PacketLog for LiveAppendLog {
        fn append(&self, record: NewPacketRecord) -> Result<LogId, StorageError> {
            self.inner.append(record)
        }

        fn get(&self, log_id: LogId) -> Option<PacketRecord> {
            self.inner.get(log_id)
        }

        fn undecryptable_after(&self, after: Option<LogId>, limit: usize) -> Vec<PacketRecord> {
            self.inner.undecryptable_after(after, limit)
        }

        fn resolve(&self, log_id: LogId, entry: EntryId) -> Result<bool, StorageError> {
            if let Some(record) = self.live.lock().take() {
                self.inner.append(record)?;
            }
            self.inner.resolve(log_id, entry)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn tag_counts(&self) -> crate::packet_log::TagCounts {
            self.inner.tag_counts()
        }

        fn records(&self) -> Vec<PacketRecord> {
            self.inner.records()
        }

        fn restore(&self, records: Vec<PacketRecord>) -> Result<(), StorageError> {
            self.inner.restore(records)
        }
    }

    #[test]
    fn test_eviction_mid_batch_skips_only_the_lost_record() {
        let key = ChannelKey::from_psk(&[0x5c; 16]).unwrap();
        let full = MemoryPacketLog::new(3);
        for i in 1..=3 {
            undecryptable(&full, &key, i);
        }
        let live = full.records()[0].packet.clone();
        let log = LiveAppendLog {
            inner: MemoryPacketLog::new(3),
            live: Mutex::new(Some(NewPacketRecord {
                tag: DecryptionTag::NotEncrypted,
                ..live
            })),
        };
        log.restore(full.records()).unwrap();

        let mut registry = ChannelKeyRegistry::new();
        registry.create(NewChannelKey::new("Secret", key)).unwrap();
        let entries = registry.enabled_in_order();
        let cursors = MemoryCursorStore::new();
        let now = Timestamp::new(10);

        let recovered = ReprocessJob::new(None, 10, now)
            .run_to_completion(&log, &entries, &cursors, now)
            .unwrap();

        assert_eq!(
            recovered.iter().map(|r| r.record.log_id).collect::<Vec<_>>(),
            vec![LogId::new(2), LogId::new(3)]
        );
        assert_eq!(log.tag_counts().registry, 2);
        assert_eq!(log.tag_counts().undecryptable, 0);
        assert_eq!(entries[0].usage().decrypted_count(), 2);
    }

    #[test]
    fn test_direct_messages_are_skipped() {
        let key = ChannelKey::from_psk(&[0x5d; 16]).unwrap();
        let log = MemoryPacketLog::new(10);
        let mut sealed = {
            let scratch = MemoryPacketLog::new(1);
            undecryptable(&scratch, &key, 9);
            scratch.records()[0].packet.clone()
        };
        sealed.pki_encrypted = true;
        log.append(sealed).unwrap();

        let mut registry = ChannelKeyRegistry::new();
        registry.create(NewChannelKey::new("Secret", key)).unwrap();
        let entries = registry.enabled_in_order();
        let now = Timestamp::new(10);
        let recovered = ReprocessJob::new(None, 10, now)
            .run_to_completion(&log, &entries, &MemoryCursorStore::new(), now)
            .unwrap();

        assert!(recovered.is_empty());
        assert_eq!(log.tag_counts().undecryptable, 1);
        assert_eq!(entries[0].usage().decrypted_count(), 0);
    }

    #[test]
    fn test_file_cursor_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("meshmon-cursor-{}", Uuid::new_v4()));
        let store = FileCursorStore::new(dir.join("cursor.json"));
        assert!(store.load().unwrap().is_none());

        let mut cursor = ReprocessCursor::new(Some(EntryId::new(3)), Timestamp::new(5));
        cursor.last_log_id = Some(LogId::new(40));
        store.save(&cursor).unwrap();
        assert_eq!(store.load().unwrap(), Some(cursor));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        let _ = fs::remove_dir_all(dir);
    }
}
