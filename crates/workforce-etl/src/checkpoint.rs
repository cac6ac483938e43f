//! Resume state for interrupted runs.
//!
//! Each partition keeps a progress blob that is rewritten after every completed
//! unit of work and removed once the partition succeeds. A run-level manifest,
//! stored under [`RUN_MANIFEST_KEY`], lists the partitions that already
//! finished so a restarted run can skip them.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::warehouse::StoreError;

pub const RUN_MANIFEST_KEY: &str = "__run__";

pub trait CheckpointStore {
    fn save(&self, run_id: &str, partition_key: &str, state: &Value) -> Result<(), StoreError>;
    fn load(&self, run_id: &str, partition_key: &str) -> Result<Option<Value>, StoreError>;
    fn clear(&self, run_id: &str, partition_key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionProgress {
    #[serde(default)]
    pub completed_phases: Vec<String>,
    #[serde(default)]
    pub completed_windows: Vec<String>,
    #[serde(default)]
    pub records_processed: u64,
    #[serde(default)]
    pub records_failed: u64,
}

impl PartitionProgress {
    pub fn phase_done(&self, phase: &str) -> bool {
        self.completed_phases.iter().any(|done| done == phase)
    }

    pub fn window_done(&self, window: &str) -> bool {
        self.completed_windows.iter().any(|done| done == window)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    #[serde(default)]
    pub completed_partitions: BTreeSet<String>,
}

/// Typed view over a [`CheckpointStore`] for one run.
pub struct RunCheckpoints<'a, S: CheckpointStore + ?Sized> {
    store: &'a S,
    run_id: &'a str,
}

impl<'a, S: CheckpointStore + ?Sized> RunCheckpoints<'a, S> {
    pub fn new(store: &'a S, run_id: &'a str) -> Self {
        Self { store, run_id }
    }

    pub fn progress(&self, partition_key: &str) -> Result<PartitionProgress, StoreError> {
        self.read(partition_key)
    }

    pub fn save_progress(
        &self,
        partition_key: &str,
        progress: &PartitionProgress,
    ) -> Result<(), StoreError> {
        self.write(partition_key, progress, "partition progress")
    }

    pub fn clear_progress(&self, partition_key: &str) -> Result<(), StoreError> {
        self.store.clear(self.run_id, partition_key)
    }

    pub fn manifest(&self) -> Result<RunManifest, StoreError> {
        self.read(RUN_MANIFEST_KEY)
    }

    pub fn save_manifest(&self, manifest: &RunManifest) -> Result<(), StoreError> {
        self.write(RUN_MANIFEST_KEY, manifest, "run manifest")
    }

    pub fn clear_manifest(&self) -> Result<(), StoreError> {
        self.store.clear(self.run_id, RUN_MANIFEST_KEY)
    }

    fn read<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, StoreError> {
        let Some(state) = self.store.load(self.run_id, key)? else {
            return Ok(T::default());
        };
        match serde_json::from_value(state) {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::warn!(
                    run_id = self.run_id,
                    partition = key,
                    error = %err,
                    "ignoring unreadable checkpoint"
                );
                Ok(T::default())
            }
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T, what: &'static str) -> Result<(), StoreError> {
        let state = serde_json::to_value(value)
            .map_err(|source| StoreError::Serialization { what, source })?;
        self.store.save(self.run_id, key, &state)
    }
}
