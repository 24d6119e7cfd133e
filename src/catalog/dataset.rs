use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::error::Result;
use crate::message::Address;
use crate::{errinput, errnotfound};

use super::ring::Ring;

/// A dataset: a named, partitioned, replicated collection that commands
/// execute against. Immutable once loaded; catalog reloads swap in a whole
/// new snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    /// The dataset name.
    pub name: String,
    /// The number of ring partitions, used to scale virtual point counts.
    pub num_partitions: usize,
    /// The number of handler workers the storage layer should run for this
    /// dataset. 0 means handlers run inline.
    pub workers: usize,
    /// The ordered plugin list. Order matters: adapters run in list order.
    pub plugins: Vec<String>,
    /// The dataset schema. Opaque to the engine core; handed to the storage
    /// layer as-is.
    pub schema: Json,
    /// Ring partitions by partition key. A BTreeMap so iteration order is
    /// deterministic across nodes, which ring construction depends on.
    pub partitions: BTreeMap<String, Partition>,
    /// The consistent-hash ring over the partitions, or None for single
    /// partition datasets, which route trivially.
    pub ring: Option<Ring>,
}

/// One ring partition: a weighted set of time-sliced replica groups.
#[derive(Clone, Debug, PartialEq)]
pub struct Partition {
    /// The partition weight. Higher weights claim more of the hash space.
    pub weight: u32,
    /// Time-ordered sub-partitions: each key is the inclusive start date of
    /// the slice (ISO 8601, so lexicographic order is chronological), each
    /// value the replica addresses holding that slice.
    pub slices: BTreeMap<String, Vec<Address>>,
}

impl Dataset {
    /// Builds a dataset from its parts, constructing the ring when there are
    /// two or more partitions.
    pub fn new(
        name: String,
        num_partitions: usize,
        workers: usize,
        plugins: Vec<String>,
        schema: Json,
        partitions: BTreeMap<String, Partition>,
    ) -> Result<Self> {
        if partitions.is_empty() {
            return errinput!("dataset {name} has no partitions");
        }
        for (key, partition) in &partitions {
            if partition.weight == 0 {
                return errinput!("dataset {name} partition {key} has zero weight");
            }
            if partition.slices.is_empty() {
                return errinput!("dataset {name} partition {key} has no replica slices");
            }
            if partition.slices.values().any(|replicas| replicas.is_empty()) {
                return errinput!("dataset {name} partition {key} has an empty replica set");
            }
        }
        let ring = (partitions.len() >= 2).then(|| Ring::build(num_partitions, &partitions));
        Ok(Self { name, num_partitions, workers, plugins, schema, partitions, ring })
    }

    /// Returns the partition for a key, or an error if it doesn't exist.
    pub fn partition(&self, key: &str) -> Result<&Partition> {
        match self.partitions.get(key) {
            Some(partition) => Ok(partition),
            None => errnotfound!("partition {key}"),
        }
    }

    /// Returns the single partition of a ringless dataset.
    pub fn sole_partition(&self) -> (&String, &Partition) {
        debug_assert_eq!(self.partitions.len(), 1);
        self.partitions.iter().next().expect("dataset has no partitions")
    }
}
