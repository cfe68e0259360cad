//! Channel key registry
//!
//! Administrator-maintained, priority-ordered collection of channel keys.
//! Entries are kept sorted by `sort_order`, which is a strict total order.
//! Usage counters live behind an `Arc` of atomics so snapshots handed to the
//! decryption engine credit the same counters as the registry itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::ChannelKey;
use crate::errors::RegistryError;
use crate::types::Timestamp;

type RegistryResult<T> = core::result::Result<T, RegistryError>;

// ----------------------------------------------------------------------------
// Entry Identifier
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(u32);

impl EntryId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for EntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "key#{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Usage Counters
// ----------------------------------------------------------------------------

/// Per-entry usage statistics, updated atomically
#[derive(Debug, Default)]
pub struct KeyUsage {
    decrypted: AtomicU64,
    last_decrypted_ms: AtomicU64,
}

impl KeyUsage {
    fn with_values(decrypted: u64, last: Option<Timestamp>) -> Self {
        Self {
            decrypted: AtomicU64::new(decrypted),
            last_decrypted_ms: AtomicU64::new(last.map_or(0, |t| t.as_millis())),
        }
    }

    /// Count one decrypted packet
    pub fn credit(&self, at: Timestamp) {
        self.decrypted.fetch_add(1, Ordering::SeqCst);
        self.last_decrypted_ms
            .fetch_max(at.as_millis(), Ordering::SeqCst);
    }

    pub fn decrypted_count(&self) -> u64 {
        self.decrypted.load(Ordering::SeqCst)
    }

    pub fn last_decrypted(&self) -> Option<Timestamp> {
        match self.last_decrypted_ms.load(Ordering::SeqCst) {
            0 => None,
            millis => Some(Timestamp::new(millis)),
        }
    }
}

// ----------------------------------------------------------------------------
// Entries
// ----------------------------------------------------------------------------

/// One named channel key
#[derive(Debug, Clone)]
pub struct ChannelKeyEntry {
    pub id: EntryId,
    pub name: String,
    key: ChannelKey,
    pub enabled: bool,
    /// Only try this key when the packet's channel hash matches name + key
    pub enforce_name_validation: bool,
    pub sort_order: i32,
    usage: Arc<KeyUsage>,
}

impl ChannelKeyEntry {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn usage(&self) -> &KeyUsage {
        &self.usage
    }

    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            id: self.id,
            name: self.name.clone(),
            enabled: self.enabled,
            enforce_name_validation: self.enforce_name_validation,
            sort_order: self.sort_order,
            key_bits: self.key.bits(),
            decrypted_count: self.usage.decrypted_count(),
            last_decrypted: self.usage.last_decrypted(),
        }
    }
}

/// Key-free view of an entry for listings and status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub id: EntryId,
    pub name: String,
    pub enabled: bool,
    pub enforce_name_validation: bool,
    pub sort_order: i32,
    pub key_bits: usize,
    pub decrypted_count: u64,
    pub last_decrypted: Option<Timestamp>,
}

/// Persisted form of an entry, including key material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub id: EntryId,
    pub name: String,
    pub key: ChannelKey,
    pub enabled: bool,
    pub enforce_name_validation: bool,
    pub sort_order: i32,
    #[serde(default)]
    pub decrypted_count: u64,
    #[serde(default)]
    pub last_decrypted: Option<Timestamp>,
}

/// Input for creating an entry
#[derive(Debug, Clone)]
pub struct NewChannelKey {
    pub name: String,
    pub key: ChannelKey,
    pub enabled: bool,
    pub enforce_name_validation: bool,
    /// Explicit priority; appended after the last entry when `None`
    pub sort_order: Option<i32>,
}

impl NewChannelKey {
    pub fn new<N: Into<String>>(name: N, key: ChannelKey) -> Self {
        Self {
            name: name.into(),
            key,
            enabled: true,
            enforce_name_validation: false,
            sort_order: None,
        }
    }

    pub fn with_name_validation(mut self) -> Self {
        self.enforce_name_validation = true;
        self
    }

    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = Some(sort_order);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial update of an entry; `None` fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct ChannelKeyUpdate {
    pub name: Option<String>,
    pub key: Option<ChannelKey>,
    pub enabled: Option<bool>,
    pub enforce_name_validation: Option<bool>,
    pub sort_order: Option<i32>,
}

/// What an administrative change did, used to decide on reprocessing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    Created { id: EntryId, enabled: bool },
    Updated { id: EntryId, newly_usable: bool },
    Deleted { id: EntryId },
    Reordered,
}

impl RegistryChange {
    /// Whether the change can make previously undecryptable packets readable
    pub fn warrants_reprocess(&self) -> Option<EntryId> {
        match *self {
            RegistryChange::Created { id, enabled: true } => Some(id),
            RegistryChange::Updated {
                id,
                newly_usable: true,
            } => Some(id),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Ordered channel key registry
#[derive(Debug, Default)]
pub struct ChannelKeyRegistry {
    entries: Vec<ChannelKeyEntry>,
    next_id: u32,
}

impl ChannelKeyRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Add an entry; invalid names and duplicate sort orders are rejected
    pub fn create(&mut self, new: NewChannelKey) -> RegistryResult<RegistryChange> {
        let name = validate_name(&new.name)?;
        let sort_order = match new.sort_order {
            Some(order) => {
                self.ensure_sort_order_free(order, None)?;
                order
            }
            None => self.entries.last().map_or(0, |e| e.sort_order.saturating_add(10)),
        };

        let id = EntryId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        self.entries.push(ChannelKeyEntry {
            id,
            name,
            key: new.key,
            enabled: new.enabled,
            enforce_name_validation: new.enforce_name_validation,
            sort_order,
            usage: Arc::new(KeyUsage::default()),
        });
        self.sort();

        info!(entry = %id, sort_order, enabled = new.enabled, "Channel key created");
        Ok(RegistryChange::Created {
            id,
            enabled: new.enabled,
        })
    }

    /// Apply a partial update
    pub fn update(&mut self, id: EntryId, update: ChannelKeyUpdate) -> RegistryResult<RegistryChange> {
        let name = update.name.as_deref().map(validate_name).transpose()?;
        if let Some(order) = update.sort_order {
            self.ensure_sort_order_free(order, Some(id))?;
        }

        let entry = self.entry_mut(id)?;
        let was_enabled = entry.enabled;
        let key_changed = update.key.as_ref().is_some_and(|k| *k != entry.key);

        if let Some(name) = name {
            entry.name = name;
        }
        if let Some(key) = update.key {
            entry.key = key;
        }
        if let Some(enabled) = update.enabled {
            entry.enabled = enabled;
        }
        if let Some(enforce) = update.enforce_name_validation {
            entry.enforce_name_validation = enforce;
        }
        if let Some(order) = update.sort_order {
            entry.sort_order = order;
        }
        let newly_usable = entry.enabled && (!was_enabled || key_changed);
        self.sort();

        debug!(entry = %id, newly_usable, "Channel key updated");
        Ok(RegistryChange::Updated { id, newly_usable })
    }

    pub fn set_enabled(&mut self, id: EntryId, enabled: bool) -> RegistryResult<RegistryChange> {
        self.update(
            id,
            ChannelKeyUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
    }

    pub fn delete(&mut self, id: EntryId) -> RegistryResult<RegistryChange> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(RegistryError::EntryNotFound { id: id.0 })?;
        self.entries.remove(index);
        info!(entry = %id, "Channel key deleted");
        Ok(RegistryChange::Deleted { id })
    }

    /// Reassign priorities so entries are tried in the given order
    ///
    /// `ordered` must list every entry exactly once.
    pub fn reorder(&mut self, ordered: &[EntryId]) -> RegistryResult<RegistryChange> {
        if ordered.len() != self.entries.len() {
            return Err(RegistryError::InvalidReorder {
                reason: format!(
                    "expected {} entries, got {}",
                    self.entries.len(),
                    ordered.len()
                ),
            });
        }
        let unique: HashSet<EntryId> = ordered.iter().copied().collect();
        if unique.len() != ordered.len() {
            return Err(RegistryError::InvalidReorder {
                reason: "entry listed more than once".to_string(),
            });
        }
        if let Some(missing) = ordered.iter().find(|id| self.get(**id).is_none()) {
            return Err(RegistryError::EntryNotFound { id: missing.0 });
        }

        for (position, id) in ordered.iter().enumerate() {
            if let Some(entry) = self.entries.iter_mut().find(|e| e.id == *id) {
                entry.sort_order = (position as i32).saturating_mul(10);
            }
        }
        self.sort();
        Ok(RegistryChange::Reordered)
    }

    pub fn get(&self, id: EntryId) -> Option<&ChannelKeyEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// All entries in priority order
    pub fn entries(&self) -> &[ChannelKeyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the enabled entries in the order the engine tries them
    pub fn enabled_in_order(&self) -> Vec<ChannelKeyEntry> {
        self.entries.iter().filter(|e| e.enabled).cloned().collect()
    }

    pub fn summaries(&self) -> Vec<EntrySummary> {
        self.entries.iter().map(ChannelKeyEntry::summary).collect()
    }

    /// Listing restricted to entries the caller may see
    pub fn list_visible(&self, visible: &HashSet<EntryId>) -> Vec<EntrySummary> {
        self.entries
            .iter()
            .filter(|e| visible.contains(&e.id))
            .map(ChannelKeyEntry::summary)
            .collect()
    }

    /// Credit a decrypted packet to an entry
    pub fn credit(&self, id: EntryId, at: Timestamp) -> bool {
        match self.get(id) {
            Some(entry) => {
                entry.usage.credit(at);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    pub fn to_records(&self) -> Vec<EntryRecord> {
        self.entries
            .iter()
            .map(|e| EntryRecord {
                id: e.id,
                name: e.name.clone(),
                key: e.key.clone(),
                enabled: e.enabled,
                enforce_name_validation: e.enforce_name_validation,
                sort_order: e.sort_order,
                decrypted_count: e.usage.decrypted_count(),
                last_decrypted: e.usage.last_decrypted(),
            })
            .collect()
    }

    /// Rebuild a registry from persisted records, re-checking its invariants
    pub fn from_records(records: Vec<EntryRecord>) -> RegistryResult<Self> {
        let mut registry = Self::new();
        let mut seen_orders: HashSet<i32> = HashSet::new();
        let mut seen_ids: HashSet<EntryId> = HashSet::new();

        for record in records {
            let name = validate_name(&record.name)?;
            if !seen_orders.insert(record.sort_order) {
                let existing = registry
                    .entries
                    .iter()
                    .find(|e| e.sort_order == record.sort_order)
                    .map_or(0, |e| e.id.0);
                return Err(RegistryError::DuplicateSortOrder {
                    sort_order: record.sort_order,
                    existing,
                });
            }
            if !seen_ids.insert(record.id) {
                return Err(RegistryError::InvalidReorder {
                    reason: format!("duplicate entry id {}", record.id.0),
                });
            }
            registry.next_id = registry.next_id.max(record.id.0 + 1);
            registry.entries.push(ChannelKeyEntry {
                id: record.id,
                name,
                key: record.key,
                enabled: record.enabled,
                enforce_name_validation: record.enforce_name_validation,
                sort_order: record.sort_order,
                usage: Arc::new(KeyUsage::with_values(
                    record.decrypted_count,
                    record.last_decrypted,
                )),
            });
        }
        registry.sort();
        Ok(registry)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn entry_mut(&mut self, id: EntryId) -> RegistryResult<&mut ChannelKeyEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(RegistryError::EntryNotFound { id: id.0 })
    }

    fn ensure_sort_order_free(&self, order: i32, except: Option<EntryId>) -> RegistryResult<()> {
        match self
            .entries
            .iter()
            .find(|e| e.sort_order == order && Some(e.id) != except)
        {
            Some(existing) => Err(RegistryError::DuplicateSortOrder {
                sort_order: order,
                existing: existing.id.0,
            }),
            None => Ok(()),
        }
    }

    fn sort(&mut self) {
        self.entries.sort_by_key(|e| e.sort_order);
    }
}

fn validate_name(name: &str) -> RegistryResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::EmptyName);
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> ChannelKey {
        ChannelKey::from_psk(&[seed; 16]).unwrap()
    }

    #[test]
    fn test_create_assigns_ids_and_appends() {
        let mut registry = ChannelKeyRegistry::new();
        registry.create(NewChannelKey::new("alpha", key(1))).unwrap();
        registry.create(NewChannelKey::new("beta", key(2))).unwrap();

        let names: Vec<_> = registry.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(registry.entries()[0].id, EntryId::new(1));
        assert!(registry.entries()[0].sort_order < registry.entries()[1].sort_order);
    }

    #[test]
    fn test_duplicate_sort_order_rejected() {
        let mut registry = ChannelKeyRegistry::new();
        registry
            .create(NewChannelKey::new("alpha", key(1)).with_sort_order(5))
            .unwrap();
        let err = registry
            .create(NewChannelKey::new("beta", key(2)).with_sort_order(5))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateSortOrder {
                sort_order: 5,
                existing: 1
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut registry = ChannelKeyRegistry::new();
        assert_eq!(
            registry.create(NewChannelKey::new("   ", key(1))).unwrap_err(),
            RegistryError::EmptyName
        );
    }

    #[test]
    fn test_enabled_in_order_skips_disabled() {
        let mut registry = ChannelKeyRegistry::new();
        registry
            .create(NewChannelKey::new("late", key(1)).with_sort_order(20))
            .unwrap();
        registry
            .create(NewChannelKey::new("off", key(2)).with_sort_order(0).disabled())
            .unwrap();
        registry
            .create(NewChannelKey::new("early", key(3)).with_sort_order(10))
            .unwrap();

        let names: Vec<_> = registry
            .enabled_in_order()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["early", "late"]);
    }

    #[test]
    fn test_update_reports_newly_usable() {
        let mut registry = ChannelKeyRegistry::new();
        let id = match registry
            .create(NewChannelKey::new("alpha", key(1)).disabled())
            .unwrap()
        {
            RegistryChange::Created { id, enabled } => {
                assert!(!enabled);
                id
            }
            other => panic!("unexpected change {:?}", other),
        };

        let change = registry.set_enabled(id, true).unwrap();
        assert_eq!(change.warrants_reprocess(), Some(id));

        let change = registry
            .update(
                id,
                ChannelKeyUpdate {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(change.warrants_reprocess(), None);

        let change = registry
            .update(
                id,
                ChannelKeyUpdate {
                    key: Some(key(9)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(change.warrants_reprocess(), Some(id));
    }

    #[test]
    fn test_reorder_requires_permutation() {
        let mut registry = ChannelKeyRegistry::new();
        registry.create(NewChannelKey::new("a", key(1))).unwrap();
        registry.create(NewChannelKey::new("b", key(2))).unwrap();
        registry.create(NewChannelKey::new("c", key(3))).unwrap();

        let (a, b, c) = (EntryId::new(1), EntryId::new(2), EntryId::new(3));
        assert!(registry.reorder(&[a, b]).is_err());
        assert!(registry.reorder(&[a, a, b]).is_err());
        assert!(registry.reorder(&[a, b, EntryId::new(9)]).is_err());

        registry.reorder(&[c, a, b]).unwrap();
        let ids: Vec<_> = registry.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![c, a, b]);
    }

    #[test]
    fn test_visible_listing_and_usage() {
        let mut registry = ChannelKeyRegistry::new();
        registry.create(NewChannelKey::new("a", key(1))).unwrap();
        registry.create(NewChannelKey::new("b", key(2))).unwrap();

        let b = EntryId::new(2);
        assert!(registry.credit(b, Timestamp::new(5_000)));
        // A snapshot shares counters with the registry
        let snapshot = registry.enabled_in_order();
        snapshot[1].usage().credit(Timestamp::new(4_000));

        let visible: HashSet<_> = [b].into_iter().collect();
        let listing = registry.list_visible(&visible);
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].decrypted_count, 2);
        assert_eq!(listing[0].last_decrypted, Some(Timestamp::new(5_000)));
    }

    #[test]
    fn test_records_roundtrip_preserves_usage() {
        let mut registry = ChannelKeyRegistry::new();
        registry.create(NewChannelKey::new("a", key(1))).unwrap();
        registry.credit(EntryId::new(1), Timestamp::new(1_000));

        let restored = ChannelKeyRegistry::from_records(registry.to_records()).unwrap();
        assert_eq!(restored.summaries(), registry.summaries());

        let mut restored = restored;
        restored.create(NewChannelKey::new("b", key(2))).unwrap();
        assert_eq!(restored.entries()[1].id, EntryId::new(2));
    }
}
