//! Outbound request tracking
//!
//! Requests we send to the mesh (currently traceroutes) are remembered by
//! packet id until a reply, a routing error or the deadline settles them.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{NodeNum, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Traceroute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub packet_id: u32,
    pub destination: NodeNum,
    pub kind: RequestKind,
    pub sent_at: Timestamp,
    pub deadline: Timestamp,
}

#[derive(Debug)]
pub struct RequestTracker {
    pending: HashMap<u32, PendingRequest>,
    timeout_ms: u64,
}

impl RequestTracker {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            pending: HashMap::new(),
            timeout_ms: timeout_secs.saturating_mul(1000),
        }
    }

    pub fn register(
        &mut self,
        packet_id: u32,
        destination: NodeNum,
        kind: RequestKind,
        now: Timestamp,
    ) -> PendingRequest {
        let request = PendingRequest {
            packet_id,
            destination,
            kind,
            sent_at: now,
            deadline: now + self.timeout_ms,
        };
        self.pending.insert(packet_id, request);
        debug!(packet_id, destination = %destination, ?kind, "Request pending");
        request
    }

    /// Settle the request a reply or routing error refers to
    pub fn take(&mut self, request_id: u32) -> Option<PendingRequest> {
        if request_id == 0 {
            return None;
        }
        self.pending.remove(&request_id)
    }

    /// Remove and return requests whose deadline has passed
    pub fn expire(&mut self, now: Timestamp) -> Vec<PendingRequest> {
        let mut expired: Vec<PendingRequest> = self
            .pending
            .values()
            .filter(|r| now > r.deadline)
            .copied()
            .collect();
        expired.sort_by_key(|r| r.deadline);
        for request in &expired {
            self.pending.remove(&request.packet_id);
        }
        expired
    }

    pub fn get(&self, packet_id: u32) -> Option<&PendingRequest> {
        self.pending.get(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new(60)
    }
}
