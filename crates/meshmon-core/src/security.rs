//! Public key security scanner
//!
//! Two checks over a snapshot of node public keys:
//!
//! - **Low entropy**: the SHA-256 of each key is looked up in a corpus of
//!   known weak keys (degenerate byte patterns plus configured hashes).
//! - **Duplicates**: nodes are grouped by key fingerprint; every member of a
//!   group of two or more is flagged and told who its siblings are.
//!
//! The scanner never reads the live store. It works on a `KeySnapshot` list
//! taken at scan start, and its result is applied back in one step, which
//! also clears flags on nodes that no longer match.

use std::collections::BTreeMap;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{ConfigError, StorageError};
use crate::node_store::{NodeStore, SecurityFlags};
use crate::types::{KeyFingerprint, NodeNum, TimeSource, Timestamp};

const KEY_LEN: usize = 32;

/// A node's public key at snapshot time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySnapshot {
    pub node: NodeNum,
    pub public_key: Option<Vec<u8>>,
}

/// Where the scanner reads its snapshot from
pub trait NodeKeySource: Send + Sync {
    fn key_snapshot(&self) -> Result<Vec<KeySnapshot>, StorageError>;
}

impl NodeKeySource for parking_lot::RwLock<NodeStore> {
    fn key_snapshot(&self) -> Result<Vec<KeySnapshot>, StorageError> {
        Ok(self.read().key_snapshot())
    }
}

// ----------------------------------------------------------------------------
// Weak key corpus
// ----------------------------------------------------------------------------

/// Fingerprints of keys known to be weak
#[derive(Debug, Clone)]
pub struct WeakKeyCorpus {
    hashes: HashSet<KeyFingerprint>,
}

impl WeakKeyCorpus {
    /// Built-in degenerate keys
    pub fn builtin() -> Self {
        let mut keys: Vec<[u8; KEY_LEN]> = Vec::new();

        for byte in [0x00u8, 0x01, 0x02, 0x09, 0x11, 0x42, 0x55, 0x7f, 0x80, 0xaa, 0xfe, 0xff] {
            keys.push([byte; KEY_LEN]);
        }

        let mut ascending = [0u8; KEY_LEN];
        let mut from_one = [0u8; KEY_LEN];
        let mut descending = [0u8; KEY_LEN];
        for i in 0..KEY_LEN {
            ascending[i] = i as u8;
            from_one[i] = i as u8 + 1;
            descending[i] = (KEY_LEN - 1 - i) as u8;
        }
        keys.extend([ascending, from_one, descending]);

        for pattern in [[0x00u8, 0xff], [0xaa, 0x55], [0xde, 0xad]] {
            let mut key = [0u8; KEY_LEN];
            for (i, b) in key.iter_mut().enumerate() {
                *b = pattern[i % 2];
            }
            keys.push(key);
        }

        // Curve25519 basepoint and small scalars
        for value in [1u8, 9] {
            let mut key = [0u8; KEY_LEN];
            key[0] = value;
            keys.push(key);
        }

        Self {
            hashes: keys.iter().map(|k| KeyFingerprint::of_key(k)).collect(),
        }
    }

    /// Built-in corpus plus hex-encoded SHA-256 hashes from configuration
    pub fn with_extra_hashes<S: AsRef<str>>(extra: &[S]) -> Result<Self, ConfigError> {
        let mut corpus = Self::builtin();
        for hash in extra {
            let fingerprint = hash.as_ref().parse::<KeyFingerprint>().map_err(|_| {
                ConfigError::invalid("security.extra_weak_key_hashes", "expected 64 hex characters")
            })?;
            corpus.hashes.insert(fingerprint);
        }
        Ok(corpus)
    }

    pub fn contains(&self, fingerprint: &KeyFingerprint) -> bool {
        self.hashes.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

impl Default for WeakKeyCorpus {
    fn default() -> Self {
        Self::builtin()
    }
}

// ----------------------------------------------------------------------------
// Scan results
// ----------------------------------------------------------------------------

/// Nodes sharing one public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub fingerprint: KeyFingerprint,
    pub nodes: Vec<NodeNum>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityScanResult {
    pub scan_id: Uuid,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub nodes_scanned: usize,
    pub keys_scanned: usize,
    pub low_entropy: Vec<NodeNum>,
    pub duplicate_groups: Vec<DuplicateGroup>,
}

impl SecurityScanResult {
    pub fn duplicate_node_count(&self) -> usize {
        self.duplicate_groups.iter().map(|g| g.nodes.len()).sum()
    }

    /// Flags the scan assigns to `node`
    pub fn flags_for(&self, node: NodeNum) -> SecurityFlags {
        let low_entropy = self.low_entropy.contains(&node);
        let siblings: Vec<NodeNum> = self
            .duplicate_groups
            .iter()
            .find(|g| g.nodes.contains(&node))
            .map(|g| g.nodes.iter().copied().filter(|n| *n != node).collect())
            .unwrap_or_default();

        let mut details = Vec::new();
        if low_entropy {
            details.push("Public key matches a known low-entropy key".to_string());
        }
        if !siblings.is_empty() {
            let ids: Vec<String> = siblings.iter().map(NodeNum::display_id).collect();
            details.push(format!("Public key shared with {}", ids.join(", ")));
        }

        SecurityFlags {
            key_is_low_entropy: low_entropy,
            duplicate_key_detected: !siblings.is_empty(),
            detail: (!details.is_empty()).then(|| details.join("; ")),
        }
    }
}

// ----------------------------------------------------------------------------
// Scanner
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SecurityScanner {
    corpus: WeakKeyCorpus,
}

impl SecurityScanner {
    pub fn new(corpus: WeakKeyCorpus) -> Self {
        Self { corpus }
    }

    pub fn corpus(&self) -> &WeakKeyCorpus {
        &self.corpus
    }

    /// Run both checks over `snapshot`
    pub fn scan(&self, snapshot: &[KeySnapshot], clock: &dyn TimeSource) -> SecurityScanResult {
        let started_at = clock.now();
        let mut low_entropy = Vec::new();
        let mut by_key: BTreeMap<KeyFingerprint, Vec<NodeNum>> = BTreeMap::new();
        let mut keys_scanned = 0;

        for entry in snapshot {
            let Some(key) = entry.public_key.as_deref().filter(|k| !k.is_empty()) else {
                continue;
            };
            keys_scanned += 1;
            let fingerprint = KeyFingerprint::of_key(key);
            if self.corpus.contains(&fingerprint) {
                low_entropy.push(entry.node);
            }
            by_key.entry(fingerprint).or_default().push(entry.node);
        }

        let duplicate_groups: Vec<DuplicateGroup> = by_key
            .into_iter()
            .filter(|(_, nodes)| nodes.len() > 1)
            .map(|(fingerprint, mut nodes)| {
                nodes.sort();
                DuplicateGroup { fingerprint, nodes }
            })
            .collect();
        low_entropy.sort();

        let result = SecurityScanResult {
            scan_id: Uuid::new_v4(),
            started_at,
            finished_at: clock.now(),
            nodes_scanned: snapshot.len(),
            keys_scanned,
            low_entropy,
            duplicate_groups,
        };

        for group in &result.duplicate_groups {
            warn!(
                fingerprint = %group.fingerprint.short(),
                nodes = group.nodes.len(),
                "Public key shared by multiple nodes"
            );
        }
        info!(
            scan_id = %result.scan_id,
            nodes = result.nodes_scanned,
            low_entropy = result.low_entropy.len(),
            duplicate_groups = result.duplicate_groups.len(),
            "Security scan finished"
        );
        result
    }
}

/// Write scan flags back to the store; returns nodes whose flags changed
///
/// Every node in the snapshot gets the flags this scan computed, so nodes
/// that stopped matching are cleared. Nodes added after the snapshot keep
/// their flags until the next scan.
pub fn apply_scan(store: &mut NodeStore, snapshot: &[KeySnapshot], result: &SecurityScanResult) -> Vec<NodeNum> {
    snapshot
        .iter()
        .filter(|entry| {
            store.apply_security_flags(
                entry.node,
                result.flags_for(entry.node),
                entry.public_key.as_deref(),
            )
        })
        .map(|entry| entry.node)
        .collect()
}
