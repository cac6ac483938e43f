use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::batch::{BatchStatus, EtlBatch};
use super::periods::{BillingPeriod, PeriodId};
use super::schema::{DimensionSpec, FactSpec};
use crate::checkpoint::CheckpointStore;
use crate::transform::Record;

/// Identifier of an `etl_batches` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub i64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type SurrogateKey = i64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Database {
        context: String,
        #[source]
        source: postgres::Error,
    },
    #[error("no current {table} row for natural key {natural_key}")]
    StaleVersion { table: String, natural_key: i64 },
    #[error("malformed {table} row: {reason}")]
    MalformedRow { table: String, reason: String },
    #[error("constraint violated: {0}")]
    Conflict(String),
    #[error("invalid sql identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("could not encode {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("warehouse connection lock poisoned")]
    LockPoisoned,
    #[error("warehouse unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn database(context: impl Into<String>) -> impl FnOnce(postgres::Error) -> Self {
        let context = context.into();
        move |source| StoreError::Database { context, source }
    }
}

/// One row of a dimension table.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionVersion {
    pub surrogate_key: SurrogateKey,
    pub natural_key: i64,
    /// Tracked attribute values keyed by column name.
    pub attributes: Record,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub is_current: bool,
    pub batch_id: BatchId,
}

/// A record that could not be loaded, kept for later inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityIssue {
    pub entity: String,
    pub natural_key: Option<String>,
    pub reason: String,
    pub payload: Value,
}

pub trait DimensionStore {
    fn current_version(
        &self,
        spec: &DimensionSpec,
        natural_key: i64,
    ) -> Result<Option<DimensionVersion>, StoreError>;

    fn insert_version(
        &self,
        spec: &DimensionSpec,
        natural_key: i64,
        attributes: &Record,
        valid_from: DateTime<Utc>,
        batch_id: BatchId,
    ) -> Result<SurrogateKey, StoreError>;

    /// Closes `current` at `at` and inserts its successor starting at the same
    /// instant, both or neither. Fails with [`StoreError::StaleVersion`] when
    /// `current` is no longer the current row.
    fn replace_version(
        &self,
        spec: &DimensionSpec,
        natural_key: i64,
        current: SurrogateKey,
        attributes: &Record,
        at: DateTime<Utc>,
        batch_id: BatchId,
    ) -> Result<SurrogateKey, StoreError>;

    /// Re-tags an unchanged row with the batch that last saw it.
    fn touch_version(
        &self,
        spec: &DimensionSpec,
        surrogate_key: SurrogateKey,
        batch_id: BatchId,
    ) -> Result<(), StoreError>;

    /// Every version of `natural_key`, oldest first.
    fn history(
        &self,
        spec: &DimensionSpec,
        natural_key: i64,
    ) -> Result<Vec<DimensionVersion>, StoreError>;
}

pub trait FactStore {
    /// Upserts `rows` into one partition inside a single transaction and returns
    /// the number of rows written. Rows must be unique on the natural id.
    fn upsert_partition(
        &self,
        spec: &FactSpec,
        partition: PeriodId,
        rows: &[Record],
        chunk_size: usize,
        batch_id: BatchId,
        loaded_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

pub trait BatchStore {
    fn insert_batch(
        &self,
        batch_type: &str,
        metadata: &Value,
        started_at: DateTime<Utc>,
    ) -> Result<BatchId, StoreError>;

    /// Moves a RUNNING batch to `status`. Returns `false` when the batch was not
    /// RUNNING, in which case nothing is written.
    fn finish_batch(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        completed_at: DateTime<Utc>,
        records_processed: u64,
        records_failed: u64,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError>;

    fn get_batch(&self, batch_id: BatchId) -> Result<Option<EtlBatch>, StoreError>;
}

pub trait QualityLog {
    fn record_issues(
        &self,
        batch_id: BatchId,
        issues: &[DataQualityIssue],
        recorded_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

pub trait PeriodStore {
    fn load_periods(&self) -> Result<Vec<BillingPeriod>, StoreError>;
    /// Inserts or updates periods by id. Returns how many were written.
    fn save_periods(&self, periods: &[BillingPeriod]) -> Result<usize, StoreError>;
}

/// Everything the loader needs from the warehouse.
pub trait Warehouse:
    DimensionStore + FactStore + BatchStore + QualityLog + PeriodStore + CheckpointStore + Send + Sync
{
}

impl<T> Warehouse for T where
    T: DimensionStore
        + FactStore
        + BatchStore
        + QualityLog
        + PeriodStore
        + CheckpointStore
        + Send
        + Sync
{
}
