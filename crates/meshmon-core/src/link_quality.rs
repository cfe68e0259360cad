//! Link quality scoring
//!
//! Each remote node carries a score in `[0, 10]`. The first message with a
//! known hop count seeds it at `10 - hops`; later messages nudge it up when
//! the route holds or shortens and down when it lengthens by two or more.
//! Traceroute timeouts and PKI failures apply fixed penalties. Every applied
//! event is clamped immediately and appended to a bounded per-node history.
//! Penalties that arrive before any hop count score from a neutral value and
//! are replayed on top of the seed once the first hop count is seen.

use std::collections::VecDeque;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{NodeNum, Timestamp};

pub const MIN_SCORE: u8 = 0;
pub const MAX_SCORE: u8 = 10;

/// Provisional score base when a penalty arrives before any hop count
pub const NEUTRAL_SCORE: u8 = 5;

const STABLE_DELTA: i16 = 1;
const DEGRADED_DELTA: i16 = -1;
const TRACEROUTE_TIMEOUT_DELTA: i16 = -2;
const CRYPTO_FAILURE_DELTA: i16 = -5;

/// What produced a score sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityEventKind {
    Seed,
    StableRouting,
    DegradedRouting,
    /// Traceroute went unanswered
    FailedVerification,
    /// PKI or key validation failed for the node
    FailedCryptographicValidation,
}

/// Timestamped score sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkQualityRecord {
    pub at: Timestamp,
    pub node: NodeNum,
    pub score: u8,
    pub kind: QualityEventKind,
    /// Hop count that triggered a routing event
    pub hops: Option<u8>,
}

#[derive(Debug, Clone, Default)]
struct NodeQuality {
    score: Option<u8>,
    last_hops: Option<u8>,
    /// Penalties applied before the first hop count
    unseeded_penalty: i16,
    history: VecDeque<LinkQualityRecord>,
}

/// Per-node link quality state
#[derive(Debug)]
pub struct LinkQualityScorer {
    nodes: HashMap<NodeNum, NodeQuality>,
    history_limit: usize,
}

impl LinkQualityScorer {
    pub fn new(history_limit: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Feed the hop count of a message from `node`
    ///
    /// Returns the applied record, or `None` when the hop count left the
    /// score unchanged (an increase of exactly one hop).
    pub fn observe_hops(&mut self, node: NodeNum, hops: u8, at: Timestamp) -> Option<LinkQualityRecord> {
        let state = self.nodes.entry(node).or_default();
        let previous = state.last_hops.replace(hops);

        let (kind, delta) = match (state.score, previous) {
            (None, _) => {
                let seed = MAX_SCORE.saturating_sub(hops);
                state.score = Some(seed);
                return Some(push_record(
                    state,
                    self.history_limit,
                    node,
                    seed,
                    QualityEventKind::Seed,
                    Some(hops),
                    at,
                ));
            }
            (Some(_), None) => {
                let seed = (i16::from(MAX_SCORE.saturating_sub(hops)) + state.unseeded_penalty)
                    .clamp(i16::from(MIN_SCORE), i16::from(MAX_SCORE)) as u8;
                state.unseeded_penalty = 0;
                state.score = Some(seed);
                return Some(push_record(
                    state,
                    self.history_limit,
                    node,
                    seed,
                    QualityEventKind::Seed,
                    Some(hops),
                    at,
                ));
            }
            (Some(_), Some(prev)) if hops <= prev => (QualityEventKind::StableRouting, STABLE_DELTA),
            (Some(_), Some(prev)) if u16::from(hops) >= u16::from(prev) + 2 => {
                (QualityEventKind::DegradedRouting, DEGRADED_DELTA)
            }
            (Some(_), Some(_)) => return None,
        };

        Some(self.apply(node, kind, delta, Some(hops), at))
    }

    pub fn record_traceroute_timeout(&mut self, node: NodeNum, at: Timestamp) -> LinkQualityRecord {
        self.apply(node, QualityEventKind::FailedVerification, TRACEROUTE_TIMEOUT_DELTA, None, at)
    }

    pub fn record_crypto_failure(&mut self, node: NodeNum, at: Timestamp) -> LinkQualityRecord {
        self.apply(
            node,
            QualityEventKind::FailedCryptographicValidation,
            CRYPTO_FAILURE_DELTA,
            None,
            at,
        )
    }

    pub fn score(&self, node: NodeNum) -> Option<u8> {
        self.nodes.get(&node).and_then(|s| s.score)
    }

    /// Score history, oldest first
    pub fn history(&self, node: NodeNum) -> Vec<LinkQualityRecord> {
        self.nodes
            .get(&node)
            .map(|s| s.history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Current score of every scored node
    pub fn scores(&self) -> Vec<(NodeNum, u8)> {
        let mut scores: Vec<_> = self
            .nodes
            .iter()
            .filter_map(|(node, s)| s.score.map(|score| (*node, score)))
            .collect();
        scores.sort_by_key(|(node, _)| *node);
        scores
    }

    fn apply(
        &mut self,
        node: NodeNum,
        kind: QualityEventKind,
        delta: i16,
        hops: Option<u8>,
        at: Timestamp,
    ) -> LinkQualityRecord {
        let state = self.nodes.entry(node).or_default();
        if state.last_hops.is_none() {
            state.unseeded_penalty += delta;
        }
        let current = i16::from(state.score.unwrap_or(NEUTRAL_SCORE));
        let next = (current + delta).clamp(i16::from(MIN_SCORE), i16::from(MAX_SCORE)) as u8;
        state.score = Some(next);
        debug!(node = %node, ?kind, score = next, "Link quality updated");
        push_record(state, self.history_limit, node, next, kind, hops, at)
    }
}

impl Default for LinkQualityScorer {
    fn default() -> Self {
        Self::new(256)
    }
}

fn push_record(
    state: &mut NodeQuality,
    limit: usize,
    node: NodeNum,
    score: u8,
    kind: QualityEventKind,
    hops: Option<u8>,
    at: Timestamp,
) -> LinkQualityRecord {
    let record = LinkQualityRecord {
        at,
        node,
        score,
        kind,
        hops,
    };
    state.history.push_back(record);
    while state.history.len() > limit {
        state.history.pop_front();
    }
    record
}
