//! Rolling hop profile
//!
//! Raw per-message hop counts grouped into epoch-aligned buckets over a
//! trailing window. Silence longer than the gap threshold is reported as an
//! explicit gap point so consumers never draw a line across it.

use std::collections::VecDeque;
use core::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::config::LinkQualityConfig;
use crate::types::{NodeNum, Timestamp};

/// Hop statistics for one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HopBucket {
    pub start: Timestamp,
    pub min: u8,
    pub max: u8,
    pub avg: f64,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HopProfilePoint {
    Bucket(HopBucket),
    /// No samples between `from` and `to`
    Gap { from: Timestamp, to: Timestamp },
}

/// Bucket geometry for a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileShape {
    pub bucket: Duration,
    pub window: Duration,
    pub gap_threshold: Duration,
}

impl ProfileShape {
    pub fn from_config(config: &LinkQualityConfig) -> Self {
        Self {
            bucket: config.bucket(),
            window: config.window(),
            gap_threshold: config.gap_threshold(),
        }
    }
}

/// Bounded per-node log of hop samples
#[derive(Debug)]
pub struct HopSampleLog {
    samples: HashMap<NodeNum, VecDeque<(Timestamp, u8)>>,
    per_node: usize,
}

impl HopSampleLog {
    pub fn new(per_node: usize) -> Self {
        Self {
            samples: HashMap::new(),
            per_node: per_node.max(1),
        }
    }

    pub fn record(&mut self, node: NodeNum, hops: u8, at: Timestamp) {
        let samples = self.samples.entry(node).or_default();
        samples.push_back((at, hops));
        while samples.len() > self.per_node {
            samples.pop_front();
        }
    }

    pub fn sample_count(&self, node: NodeNum) -> usize {
        self.samples.get(&node).map_or(0, VecDeque::len)
    }

    /// Profile for `node` over the window ending at `now`
    pub fn profile(&self, node: NodeNum, now: Timestamp, shape: &ProfileShape) -> Vec<HopProfilePoint> {
        match self.samples.get(&node) {
            Some(samples) => build_profile(samples.iter().copied(), now, shape),
            None => Vec::new(),
        }
    }
}

/// Aggregate `(time, hops)` samples into buckets and gap markers
pub fn build_profile<I>(samples: I, now: Timestamp, shape: &ProfileShape) -> Vec<HopProfilePoint>
where
    I: IntoIterator<Item = (Timestamp, u8)>,
{
    let bucket_ms = (shape.bucket.as_millis() as u64).max(1);
    let gap_ms = shape.gap_threshold.as_millis() as u64;
    let window_start = Timestamp::new(now.as_millis().saturating_sub(shape.window.as_millis() as u64));

    let mut in_window: Vec<(Timestamp, u8)> = samples
        .into_iter()
        .filter(|(at, _)| *at >= window_start && *at <= now)
        .collect();
    in_window.sort_by_key(|(at, _)| *at);

    let mut points = Vec::new();
    let mut current: Option<BucketAccumulator> = None;
    let mut previous: Option<Timestamp> = None;

    for (at, hops) in in_window {
        if let Some(prev) = previous {
            if at - prev > gap_ms {
                if let Some(acc) = current.take() {
                    points.push(HopProfilePoint::Bucket(acc.finish()));
                }
                points.push(HopProfilePoint::Gap { from: prev, to: at });
            }
        }
        previous = Some(at);

        let start = Timestamp::new(at.as_millis() - at.as_millis() % bucket_ms);
        match current.as_mut() {
            Some(acc) if acc.start == start => acc.add(hops),
            _ => {
                if let Some(acc) = current.replace(BucketAccumulator::new(start, hops)) {
                    points.push(HopProfilePoint::Bucket(acc.finish()));
                }
            }
        }
    }

    if let Some(acc) = current {
        points.push(HopProfilePoint::Bucket(acc.finish()));
    }
    points
}

struct BucketAccumulator {
    start: Timestamp,
    min: u8,
    max: u8,
    sum: u64,
    count: u32,
}

impl BucketAccumulator {
    fn new(start: Timestamp, hops: u8) -> Self {
        Self {
            start,
            min: hops,
            max: hops,
            sum: u64::from(hops),
            count: 1,
        }
    }

    fn add(&mut self, hops: u8) {
        self.min = self.min.min(hops);
        self.max = self.max.max(hops);
        self.sum += u64::from(hops);
        self.count += 1;
    }

    fn finish(self) -> HopBucket {
        HopBucket {
            start: self.start,
            min: self.min,
            max: self.max,
            avg: self.sum as f64 / f64::from(self.count),
            count: self.count,
        }
    }
}
