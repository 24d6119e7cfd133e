//! The catalog: which datasets exist, how each is partitioned and replicated,
//! and which plugins serve it.
//!
//! The catalog is loaded from a versioned JSON file. It is immutable once
//! loaded; the server polls the file's mtime and swaps in a freshly loaded
//! snapshot when it changes, so concurrent readers never observe a
//! half-updated catalog. Every node in a cluster loads the same file, and
//! ring construction is deterministic, so any node can compute routes for the
//! whole cluster.
//!
//! Routing combines two layers:
//!
//! * the ring (see ring) maps a shard key to one partition, or a broadcast to
//!   all partitions;
//! * each partition's time-sliced replica sets yield concrete shard
//!   addresses, filtered by date range and replica policy.

pub mod dataset;
pub mod ring;

pub use dataset::{Dataset, Partition};
pub use ring::{select_replicas, DateRange, ReplicaPolicy, Ring, RouteMode};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::info;
use serde_derive::Deserialize;
use serde_json::Value as Json;

use crate::error::Result;
use crate::message::Address;
use crate::{errinput, errnotfound};

/// The catalog: all datasets this cluster serves.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Catalog {
    /// Datasets by name.
    pub datasets: BTreeMap<String, Dataset>,
}

impl Catalog {
    /// Loads a catalog from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let catalog = Self::parse(&raw)?;
        info!(
            "Loaded catalog from {} with {} dataset(s)",
            path.display(),
            catalog.datasets.len()
        );
        Ok(catalog)
    }

    /// Parses a catalog from JSON, dispatching on its version field. An
    /// unknown or missing version is a fatal load error.
    pub fn parse(raw: &str) -> Result<Self> {
        let file: RawCatalog = serde_json::from_str(raw)?;
        match file.version {
            Some(1) => Self::from_raw(file, true),
            Some(2) => Self::from_raw(file, false),
            Some(version) => errinput!("unsupported catalog version {version}"),
            None => errinput!("catalog has no version field"),
        }
    }

    /// Builds the catalog from its raw form. Version 1 files may omit
    /// numPartitions, which then defaults to the ring size; version 2
    /// requires it.
    fn from_raw(file: RawCatalog, lenient: bool) -> Result<Self> {
        let mut datasets = BTreeMap::new();
        for (name, raw) in file.datasets {
            let num_partitions = match (raw.num_partitions, lenient) {
                (Some(n), _) => n,
                (None, true) => raw.ring.len(),
                (None, false) => return errinput!("dataset {name} has no numPartitions"),
            };
            let mut partitions = BTreeMap::new();
            for (key, raw_partition) in raw.ring {
                let mut slices = BTreeMap::new();
                for (start, replicas) in raw_partition.partitions {
                    let replicas =
                        replicas.iter().map(|r| Address::parse(r)).collect::<Result<Vec<_>>>()?;
                    slices.insert(start, replicas);
                }
                partitions.insert(key, Partition { weight: raw_partition.weight, slices });
            }
            let dataset = Dataset::new(
                name.clone(),
                num_partitions,
                raw.workers,
                raw.plugins,
                raw.schema,
                partitions,
            )?;
            datasets.insert(name, dataset);
        }
        Ok(Self { datasets })
    }

    /// Returns a dataset by name, or a NotFound error.
    pub fn dataset(&self, name: &str) -> Result<&Dataset> {
        match self.datasets.get(name) {
            Some(dataset) => Ok(dataset),
            None => errnotfound!("dataset {name}"),
        }
    }

    /// Computes the route for a request against a dataset: the ordered shard
    /// replica addresses selected by the routing mode, shard key, date range,
    /// and replica policy.
    pub fn route(
        &self,
        dataset: &str,
        mode: RouteMode,
        key: Option<&str>,
        range: &DateRange,
        policy: ReplicaPolicy,
    ) -> Result<Vec<Address>> {
        let dataset = self.dataset(dataset)?;
        match mode {
            RouteMode::Broadcast => Ok(dataset
                .partitions
                .values()
                .flat_map(|partition| select_replicas(partition, range, policy))
                .collect()),
            RouteMode::Scatter => {
                let Some(key) = key else {
                    return errinput!("missing key for scatter against {}", dataset.name);
                };
                let partition = match &dataset.ring {
                    Some(ring) => dataset.partition(ring.locate(key))?,
                    None => dataset.sole_partition().1,
                };
                Ok(select_replicas(partition, range, policy))
            }
        }
    }
}

/// The raw catalog file shape.
#[derive(Debug, Deserialize)]
struct RawCatalog {
    version: Option<u32>,
    #[serde(default)]
    datasets: BTreeMap<String, RawDataset>,
}

/// The raw shape of one dataset entry.
#[derive(Debug, Deserialize)]
struct RawDataset {
    #[serde(rename = "numPartitions")]
    num_partitions: Option<usize>,
    #[serde(rename = "nWorkers", default)]
    workers: usize,
    #[serde(default)]
    plugins: Vec<String>,
    #[serde(default)]
    schema: Json,
    ring: BTreeMap<String, RawPartition>,
}

/// The raw shape of one ring partition.
#[derive(Debug, Deserialize)]
struct RawPartition {
    #[serde(default = "default_weight")]
    weight: u32,
    partitions: BTreeMap<String, Vec<String>>,
}

fn default_weight() -> u32 {
    1
}

/// Watches a file's mtime, for catalog and cluster-state hot reload. Polling
/// rather than notification: staleness up to the poll interval is accepted.
pub struct FileWatcher {
    path: PathBuf,
    mtime: Option<SystemTime>,
}

impl FileWatcher {
    /// Creates a watcher primed with the file's current mtime, so the initial
    /// load isn't reported as a change.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mtime = Self::mtime(&path);
        Self { path, mtime }
    }

    /// Returns true if the file's mtime changed since the last poll,
    /// including appearing or disappearing.
    pub fn poll(&mut self) -> bool {
        let mtime = Self::mtime(&self.path);
        if mtime != self.mtime {
            self.mtime = mtime;
            return true;
        }
        false
    }

    fn mtime(path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }
}
