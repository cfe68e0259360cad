//! Append-only packet log
//!
//! Every packet that reaches the pipeline is recorded with its decryption
//! tag. The tag is fixed at append time except for one transition:
//! `Undecryptable -> Registry(entry)`, applied by compare-and-set during
//! retroactive reprocessing.

use std::collections::VecDeque;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::StorageError;
use crate::registry::EntryId;
use crate::types::{NodeNum, Timestamp};

// ----------------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------------

/// Monotonic log identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(u64);

impl LogId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

/// How a packet's payload became readable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecryptionTag {
    /// Produced by the local node; never encrypted on the way to us
    NotEncrypted,
    /// The device decrypted it before handing it over
    DecryptedBySource,
    /// Decrypted server-side with a registry entry
    Registry(EntryId),
    Undecryptable,
}

impl DecryptionTag {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, DecryptionTag::Undecryptable)
    }
}

/// Packet as it is appended to the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPacketRecord {
    pub received_at: Timestamp,
    pub from: NodeNum,
    pub to: NodeNum,
    pub packet_id: u32,
    /// Channel index, or the channel hash for encrypted packets
    pub channel: u32,
    pub hop_start: u32,
    pub hop_limit: u32,
    /// Application port, when the payload is readable
    pub port: Option<i32>,
    /// Decoded application payload, or the ciphertext when encrypted
    pub payload: Vec<u8>,
    pub encrypted: bool,
    /// Direct message sealed to a node key; channel keys never apply
    #[serde(default)]
    pub pki_encrypted: bool,
    pub tag: DecryptionTag,
}

/// Stored packet record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub log_id: LogId,
    #[serde(flatten)]
    pub packet: NewPacketRecord,
}

impl PacketRecord {
    pub fn tag(&self) -> DecryptionTag {
        self.packet.tag
    }

    /// Still undecryptable and encrypted under a channel key
    pub fn awaits_channel_key(&self) -> bool {
        self.packet.tag == DecryptionTag::Undecryptable && !self.packet.pki_encrypted
    }
}

/// Count of records per tag kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCounts {
    pub not_encrypted: u64,
    pub decrypted_by_source: u64,
    pub registry: u64,
    pub undecryptable: u64,
}

// ----------------------------------------------------------------------------
// Packet Log Trait
// ----------------------------------------------------------------------------

/// Storage for packet records
///
/// Implementations must hand out strictly increasing log ids and make
/// `resolve` an atomic compare-and-set.
pub trait PacketLog: Send + Sync {
    fn append(&self, record: NewPacketRecord) -> Result<LogId, StorageError>;

    fn get(&self, log_id: LogId) -> Option<PacketRecord>;

    /// Up to `limit` undecryptable channel-encrypted records with ids
    /// greater than `after`
    fn undecryptable_after(&self, after: Option<LogId>, limit: usize) -> Vec<PacketRecord>;

    /// Set a registry tag on a record that is still undecryptable
    ///
    /// Returns `Ok(true)` when the tag changed and `Ok(false)` when the
    /// record was already resolved, so the caller credits an entry only for
    /// a packet it actually resolved.
    fn resolve(&self, log_id: LogId, entry: EntryId) -> Result<bool, StorageError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tag_counts(&self) -> TagCounts;

    /// Every retained record, oldest first
    fn records(&self) -> Vec<PacketRecord>;

    /// Replace the contents with previously exported records, keeping their
    /// ids; later appends continue after the highest restored id
    fn restore(&self, records: Vec<PacketRecord>) -> Result<(), StorageError>;
}

// ----------------------------------------------------------------------------
// In-memory implementation
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct MemoryLogInner {
    records: VecDeque<PacketRecord>,
    next_id: u64,
    capacity: usize,
}

/// Bounded in-memory packet log; the oldest records are evicted first
#[derive(Debug)]
pub struct MemoryPacketLog {
    inner: RwLock<MemoryLogInner>,
}

impl MemoryPacketLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(MemoryLogInner {
                records: VecDeque::new(),
                next_id: 1,
                capacity: capacity.max(1),
            }),
        }
    }
}

impl MemoryLogInner {
    fn index_of(&self, log_id: LogId) -> Option<usize> {
        let first = self.records.front()?.log_id.0;
        let index = log_id.0.checked_sub(first)? as usize;
        (index < self.records.len()).then_some(index)
    }
}

impl PacketLog for MemoryPacketLog {
    fn append(&self, record: NewPacketRecord) -> Result<LogId, StorageError> {
        let mut inner = self.inner.write();
        let log_id = LogId(inner.next_id);
        inner.next_id += 1;
        if inner.records.len() >= inner.capacity {
            inner.records.pop_front();
        }
        inner.records.push_back(PacketRecord {
            log_id,
            packet: record,
        });
        Ok(log_id)
    }

    fn get(&self, log_id: LogId) -> Option<PacketRecord> {
        let inner = self.inner.read();
        inner.index_of(log_id).map(|i| inner.records[i].clone())
    }

    fn undecryptable_after(&self, after: Option<LogId>, limit: usize) -> Vec<PacketRecord> {
        let inner = self.inner.read();
        let start = match after {
            None => 0,
            Some(after) => inner.records.partition_point(|r| r.log_id <= after),
        };
        inner
            .records
            .iter()
            .skip(start)
            .filter(|r| r.awaits_channel_key())
            .take(limit)
            .cloned()
            .collect()
    }

    fn resolve(&self, log_id: LogId, entry: EntryId) -> Result<bool, StorageError> {
        let mut inner = self.inner.write();
        let index = inner
            .index_of(log_id)
            .ok_or(StorageError::RecordNotFound { log_id: log_id.0 })?;
        let record = &mut inner.records[index];
        if record.packet.tag != DecryptionTag::Undecryptable {
            return Ok(false);
        }
        record.packet.tag = DecryptionTag::Registry(entry);
        Ok(true)
    }

    fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    fn tag_counts(&self) -> TagCounts {
        let inner = self.inner.read();
        let mut counts = TagCounts::default();
        for record in &inner.records {
            match record.packet.tag {
                DecryptionTag::NotEncrypted => counts.not_encrypted += 1,
                DecryptionTag::DecryptedBySource => counts.decrypted_by_source += 1,
                DecryptionTag::Registry(_) => counts.registry += 1,
                DecryptionTag::Undecryptable => counts.undecryptable += 1,
            }
        }
        counts
    }

    fn records(&self) -> Vec<PacketRecord> {
        self.inner.read().records.iter().cloned().collect()
    }

    fn restore(&self, mut records: Vec<PacketRecord>) -> Result<(), StorageError> {
        records.sort_by_key(|r| r.log_id);
        if records.windows(2).any(|w| w[0].log_id == w[1].log_id) {
            return Err(StorageError::Corrupt {
                reason: "duplicate log id in restored records".to_string(),
            });
        }
        let mut inner = self.inner.write();
        let excess = records.len().saturating_sub(inner.capacity);
        records.drain(..excess);
        let next = records.last().map_or(1, |r| r.log_id.0 + 1);
        inner.next_id = inner.next_id.max(next);
        inner.records = records.into();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tag: DecryptionTag) -> NewPacketRecord {
        NewPacketRecord {
            received_at: Timestamp::new(1_000),
            from: NodeNum::new(1),
            to: NodeNum::BROADCAST,
            packet_id: 7,
            channel: 8,
            hop_start: 3,
            hop_limit: 3,
            port: None,
            payload: vec![1, 2, 3],
            encrypted: tag == DecryptionTag::Undecryptable,
            pki_encrypted: false,
            tag,
        }
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let log = MemoryPacketLog::new(10);
        let a = log.append(record(DecryptionTag::DecryptedBySource)).unwrap();
        let b = log.append(record(DecryptionTag::Undecryptable)).unwrap();
        assert!(b > a);
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(b).unwrap().tag(), DecryptionTag::Undecryptable);
    }

    #[test]
    fn test_resolve_is_compare_and_set() {
        let log = MemoryPacketLog::new(10);
        let id = log.append(record(DecryptionTag::Undecryptable)).unwrap();
        let entry = EntryId::new(3);

        assert!(log.resolve(id, entry).unwrap());
        assert!(!log.resolve(id, EntryId::new(4)).unwrap());
        assert_eq!(log.get(id).unwrap().tag(), DecryptionTag::Registry(entry));

        let other = log.append(record(DecryptionTag::DecryptedBySource)).unwrap();
        assert!(!log.resolve(other, entry).unwrap());
        assert!(matches!(
            log.resolve(LogId::new(99), entry),
            Err(StorageError::RecordNotFound { log_id: 99 })
        ));
    }

    #[test]
    fn test_undecryptable_after_cursor() {
        let log = MemoryPacketLog::new(10);
        let ids: Vec<_> = (0..6)
            .map(|i| {
                let tag = if i % 2 == 0 {
                    DecryptionTag::Undecryptable
                } else {
                    DecryptionTag::NotEncrypted
                };
                log.append(record(tag)).unwrap()
            })
            .collect();

        let first = log.undecryptable_after(None, 2);
        assert_eq!(
            first.iter().map(|r| r.log_id).collect::<Vec<_>>(),
            vec![ids[0], ids[2]]
        );
        let rest = log.undecryptable_after(Some(ids[2]), 10);
        assert_eq!(rest.iter().map(|r| r.log_id).collect::<Vec<_>>(), vec![ids[4]]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let log = MemoryPacketLog::new(2);
        let first = log.append(record(DecryptionTag::Undecryptable)).unwrap();
        log.append(record(DecryptionTag::Undecryptable)).unwrap();
        log.append(record(DecryptionTag::Undecryptable)).unwrap();

        assert_eq!(log.len(), 2);
        assert!(log.get(first).is_none());
        assert_eq!(log.tag_counts().undecryptable, 2);
    }

    #[test]
    fn test_direct_messages_are_not_offered_for_reprocessing() {
        let log = MemoryPacketLog::new(10);
        let mut sealed = record(DecryptionTag::Undecryptable);
        sealed.pki_encrypted = true;
        log.append(sealed).unwrap();
        let channel = log.append(record(DecryptionTag::Undecryptable)).unwrap();

        let pending = log.undecryptable_after(None, 10);
        assert_eq!(pending.iter().map(|r| r.log_id).collect::<Vec<_>>(), vec![channel]);
        assert_eq!(log.tag_counts().undecryptable, 2);
    }

    #[test]
    fn test_restore_keeps_ids_and_continues_after_them() {
        let log = MemoryPacketLog::new(10);
        for _ in 0..3 {
            log.append(record(DecryptionTag::Undecryptable)).unwrap();
        }
        let exported = log.records();

        let restarted = MemoryPacketLog::new(2);
        restarted.restore(exported).unwrap();
        assert_eq!(
            restarted.records().iter().map(|r| r.log_id).collect::<Vec<_>>(),
            vec![LogId::new(2), LogId::new(3)]
        );
        let next = restarted.append(record(DecryptionTag::NotEncrypted)).unwrap();
        assert_eq!(next, LogId::new(4));
    }
}
