//! The weighted consistent-hash ring.
//!
//! Each dataset with two or more partitions derives a continuum from its
//! partition weights: every partition claims `num_partitions * 160 * weight /
//! total_weight` virtual points, each placed at the CRC of
//! "partitionKey:virtualPointIndex". A shard key routes to the partition
//! owning the smallest continuum point at or after the key's own CRC, wrapping
//! to the first point past the top of the hash space.
//!
//! Construction iterates partitions in sorted key order and lookups break
//! ties deterministically, so every node that loads the same catalog routes
//! every key identically. That property is what lets any node plan for the
//! whole cluster.

use std::collections::BTreeMap;

use rand::Rng as _;
use serde_derive::{Deserialize, Serialize};

use crate::message::Address;

use super::dataset::Partition;

/// The number of virtual continuum points per partition at weight parity.
const POINTS_PER_PARTITION: usize = 160;

/// How a request is routed across a dataset's partitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    /// Route to every partition's selected replicas.
    #[default]
    Broadcast,
    /// Route to the one partition owning the shard key.
    Scatter,
}

/// How replicas are picked from each selected slice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaPolicy {
    /// Every replica. Used by writes, which must reach all copies.
    #[default]
    All,
    /// One replica chosen uniformly at random, spreading read load.
    Random,
    /// The first replica. Deterministic, used where reproducibility matters
    /// more than balance.
    Top,
}

/// A date range restricting which time slices of a partition are routed to.
/// Bounds are inclusive ISO 8601 strings; an empty range selects everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl DateRange {
    /// Returns true if the range has no bounds.
    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

/// One continuum entry: a virtual point hash and the partition that owns it.
#[derive(Clone, Debug, PartialEq)]
struct Point {
    hash: u32,
    partition: String,
}

/// A consistent-hash continuum over a dataset's partitions.
#[derive(Clone, Debug, PartialEq)]
pub struct Ring {
    points: Vec<Point>,
}

impl Ring {
    /// Builds the continuum for the given partitions. Partition keys are
    /// iterated in sorted order and points are sorted by (hash, partition),
    /// so the result is identical on every node for identical input.
    pub fn build(num_partitions: usize, partitions: &BTreeMap<String, Partition>) -> Self {
        let total_weight: u64 = partitions.values().map(|p| u64::from(p.weight)).sum();
        let mut points = Vec::new();
        for (key, partition) in partitions {
            let count = (num_partitions as u64)
                .saturating_mul(POINTS_PER_PARTITION as u64)
                .saturating_mul(u64::from(partition.weight))
                / total_weight.max(1);
            for index in 0..count {
                points.push(Point {
                    hash: crc32c::crc32c(format!("{key}:{index}").as_bytes()),
                    partition: key.clone(),
                });
            }
        }
        points.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.partition.cmp(&b.partition)));
        Self { points }
    }

    /// Returns the partition key owning the given shard key: the first
    /// continuum point with hash >= the key hash, wrapping to the lowest
    /// point. An exact hash match returns that point's partition.
    pub fn locate(&self, key: &str) -> &str {
        let hash = crc32c::crc32c(key.as_bytes());
        let index = self.points.partition_point(|point| point.hash < hash);
        let point = if index == self.points.len() { &self.points[0] } else { &self.points[index] };
        &point.partition
    }

    /// The number of continuum points, for diagnostics.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns true if the continuum has no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Selects the replica addresses of a partition for a date range and replica
/// policy. Slices are filtered to those whose covered interval intersects the
/// range: a slice labeled with its inclusive start date covers up to the next
/// slice's start. Within each selected slice, the policy picks every replica,
/// a random one, or the first. Slice order is preserved in the result.
pub fn select_replicas(
    partition: &Partition,
    range: &DateRange,
    policy: ReplicaPolicy,
) -> Vec<Address> {
    let starts: Vec<&String> = partition.slices.keys().collect();
    let mut selected = Vec::new();
    for (index, (start, replicas)) in partition.slices.iter().enumerate() {
        let next_start = starts.get(index + 1).copied();
        if !slice_in_range(start, next_start, range) {
            continue;
        }
        match policy {
            ReplicaPolicy::All => selected.extend(replicas.iter().cloned()),
            ReplicaPolicy::Top => selected.extend(replicas.first().cloned()),
            ReplicaPolicy::Random => {
                let index = rand::thread_rng().gen_range(0..replicas.len());
                selected.push(replicas[index].clone());
            }
        }
    }
    selected
}

/// Returns true if the slice starting at `start` (covering until
/// `next_start`, or forever for the last slice) intersects the range. ISO
/// 8601 labels compare lexicographically in chronological order.
fn slice_in_range(start: &str, next_start: Option<&String>, range: &DateRange) -> bool {
    if let Some(to) = &range.to {
        if start > to.as_str() {
            return false;
        }
    }
    if let (Some(from), Some(next_start)) = (&range.from, next_start) {
        if next_start.as_str() <= from.as_str() {
            return false;
        }
    }
    true
}
