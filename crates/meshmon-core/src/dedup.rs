//! Rebroadcast suppression
//!
//! Mesh nodes rebroadcast every packet, so the device can hand us several
//! copies of the same `(from, id)` pair. The filter remembers pairs for a
//! configurable window and reports later copies as duplicates. Matching is
//! exact; a probabilistic filter would silently drop distinct packets.

use std::collections::VecDeque;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::types::{NodeNum, Timestamp};

/// Statistics for duplicate suppression
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuplicateStats {
    pub packets_checked: u64,
    pub duplicates_detected: u64,
    pub evictions: u64,
}

impl DuplicateStats {
    pub fn duplicate_rate(&self) -> f64 {
        if self.packets_checked == 0 {
            0.0
        } else {
            (self.duplicates_detected as f64) / (self.packets_checked as f64)
        }
    }
}

type PacketKey = (NodeNum, u32);

/// Time-windowed set of recently seen packets
#[derive(Debug)]
pub struct DuplicateFilter {
    seen: HashMap<PacketKey, Timestamp>,
    order: VecDeque<(PacketKey, Timestamp)>,
    window_ms: u64,
    capacity: usize,
    stats: DuplicateStats,
}

impl DuplicateFilter {
    pub fn new(window_secs: u64, capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            window_ms: window_secs.saturating_mul(1000),
            capacity: capacity.max(1),
            stats: DuplicateStats::default(),
        }
    }

    /// Check a packet and remember it; returns `true` for a duplicate
    ///
    /// Packet id 0 is never treated as a duplicate since some firmware
    /// leaves it unset.
    pub fn check_and_add(&mut self, from: NodeNum, packet_id: u32, now: Timestamp) -> bool {
        self.stats.packets_checked += 1;
        self.maintain(now);

        if packet_id == 0 {
            return false;
        }

        let key = (from, packet_id);
        if self.seen.contains_key(&key) {
            self.stats.duplicates_detected += 1;
            return true;
        }

        if self.seen.len() >= self.capacity {
            self.evict_oldest();
        }
        self.seen.insert(key, now);
        self.order.push_back((key, now));
        false
    }

    /// Forget pairs older than the window
    pub fn maintain(&mut self, now: Timestamp) {
        while let Some((_, seen_at)) = self.order.front() {
            if now - *seen_at <= self.window_ms {
                break;
            }
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((key, seen_at)) = self.order.pop_front() {
            if self.seen.get(&key) == Some(&seen_at) {
                self.seen.remove(&key);
            }
            self.stats.evictions += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn stats(&self) -> &DuplicateStats {
        &self.stats
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
        self.stats = DuplicateStats::default();
    }
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self::new(600, 10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_rebroadcast_copy() {
        let mut filter = DuplicateFilter::default();
        let now = Timestamp::new(1_000);
        assert!(!filter.check_and_add(NodeNum::new(1), 42, now));
        assert!(filter.check_and_add(NodeNum::new(1), 42, now + 500));
        // Same id from another node is a different packet
        assert!(!filter.check_and_add(NodeNum::new(2), 42, now + 500));
        assert_eq!(filter.stats().duplicates_detected, 1);
        assert!((filter.stats().duplicate_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_expiry() {
        let mut filter = DuplicateFilter::new(10, 100);
        let start = Timestamp::new(0);
        assert!(!filter.check_and_add(NodeNum::new(1), 7, start));
        assert!(filter.check_and_add(NodeNum::new(1), 7, start.add_seconds(10)));
        assert!(!filter.check_and_add(NodeNum::new(1), 7, start.add_seconds(11)));
    }

    #[test]
    fn test_zero_id_never_duplicate() {
        let mut filter = DuplicateFilter::default();
        let now = Timestamp::new(0);
        assert!(!filter.check_and_add(NodeNum::new(1), 0, now));
        assert!(!filter.check_and_add(NodeNum::new(1), 0, now));
    }

    #[test]
    fn test_capacity_bound() {
        let mut filter = DuplicateFilter::new(600, 2);
        let now = Timestamp::new(0);
        filter.check_and_add(NodeNum::new(1), 1, now);
        filter.check_and_add(NodeNum::new(1), 2, now);
        filter.check_and_add(NodeNum::new(1), 3, now);
        assert_eq!(filter.len(), 2);
        assert!(!filter.check_and_add(NodeNum::new(1), 1, now));
    }
}
