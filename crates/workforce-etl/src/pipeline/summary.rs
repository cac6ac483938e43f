use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::warehouse::{BatchId, BatchStatus, FactLoadReport, UpsertStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionOutcome {
    Completed,
    /// Already finished by an earlier attempt of the same run.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionSummary {
    pub partition: String,
    pub region_id: i64,
    pub outcome: PartitionOutcome,
    pub dimensions: BTreeMap<String, UpsertStats>,
    pub facts: FactLoadReport,
    pub records_processed: u64,
    pub records_failed: u64,
    pub error: Option<String>,
}

impl PartitionSummary {
    pub fn new(partition: impl Into<String>, region_id: i64) -> Self {
        Self {
            partition: partition.into(),
            region_id,
            outcome: PartitionOutcome::Completed,
            dimensions: BTreeMap::new(),
            facts: FactLoadReport::default(),
            records_processed: 0,
            records_failed: 0,
            error: None,
        }
    }

    pub fn skipped(partition: impl Into<String>, region_id: i64) -> Self {
        Self {
            outcome: PartitionOutcome::Skipped,
            ..Self::new(partition, region_id)
        }
    }
}

/// What a run did, returned to the caller and printed by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub batch_id: BatchId,
    pub run_id: String,
    pub status: BatchStatus,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub regions: UpsertStats,
    pub partitions: Vec<PartitionSummary>,
    pub records_processed: u64,
    pub records_failed: u64,
    pub errors: Vec<String>,
}

impl RunSummary {
    pub fn new(batch_id: BatchId, run_id: String, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            batch_id,
            run_id,
            status: BatchStatus::Running,
            start,
            end,
            regions: UpsertStats::default(),
            partitions: Vec::new(),
            records_processed: 0,
            records_failed: 0,
            errors: Vec::new(),
        }
    }

    pub fn count(&self, outcome: PartitionOutcome) -> usize {
        self.partitions
            .iter()
            .filter(|partition| partition.outcome == outcome)
            .count()
    }

    /// Recomputes the run totals from the region load and every partition.
    pub fn tally(&mut self) {
        self.records_processed = self.regions.processed()
            + self
                .partitions
                .iter()
                .map(|partition| partition.records_processed)
                .sum::<u64>();
        self.records_failed = self.regions.rejected
            + self
                .partitions
                .iter()
                .map(|partition| partition.records_failed)
                .sum::<u64>();
    }
}
