use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::batch::{BatchStatus, EtlBatch};
use super::periods::{BillingPeriod, PeriodId};
use super::schema::{DimensionSpec, FactSpec};
use super::store::{
    BatchId, BatchStore, DataQualityIssue, DimensionStore, DimensionVersion, FactStore,
    PeriodStore, QualityLog, StoreError, SurrogateKey,
};
use crate::checkpoint::CheckpointStore;
use crate::transform::{IdRef, Record};

#[derive(Debug, Default)]
struct MemoryState {
    next_surrogate: SurrogateKey,
    next_batch: i64,
    dimensions: HashMap<String, Vec<DimensionVersion>>,
    facts: HashMap<String, BTreeMap<(PeriodId, i64), Record>>,
    batches: BTreeMap<BatchId, EtlBatch>,
    issues: Vec<(BatchId, DataQualityIssue)>,
    periods: BTreeMap<PeriodId, BillingPeriod>,
    checkpoints: BTreeMap<(String, String), Value>,
    fact_failures: Vec<(String, Value)>,
    checkpoint_failures: Vec<String>,
}

/// Warehouse kept entirely in memory, used for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_periods(periods: &[BillingPeriod]) -> Self {
        let warehouse = Self::new();
        if let Ok(mut state) = warehouse.state.lock() {
            for period in periods {
                state.periods.insert(period.period_id, *period);
            }
        }
        warehouse
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Makes every fact upsert touching a row with `column == value` fail.
    #[cfg(any(test, feature = "testing"))]
    pub fn fail_fact_loads_where(&self, column: &str, value: Value) {
        if let Ok(mut state) = self.lock() {
            state.fact_failures.push((column.to_string(), value));
        }
    }

    /// Makes every checkpoint save under `partition_key` fail, for any run.
    #[cfg(any(test, feature = "testing"))]
    pub fn fail_checkpoint_saves_for(&self, partition_key: &str) {
        if let Ok(mut state) = self.lock() {
            state.checkpoint_failures.push(partition_key.to_string());
        }
    }

    pub fn dimension_rows(&self, table: &str) -> Vec<DimensionVersion> {
        self.lock()
            .map(|state| state.dimensions.get(table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn current_rows(&self, table: &str) -> Vec<DimensionVersion> {
        self.dimension_rows(table)
            .into_iter()
            .filter(|row| row.is_current)
            .collect()
    }

    pub fn fact_rows(&self, table: &str) -> Vec<Record> {
        self.lock()
            .map(|state| {
                state
                    .facts
                    .get(table)
                    .map(|rows| rows.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn fact(&self, table: &str, partition: PeriodId, natural_id: i64) -> Option<Record> {
        self.lock()
            .ok()?
            .facts
            .get(table)?
            .get(&(partition, natural_id))
            .cloned()
    }

    pub fn issues(&self) -> Vec<(BatchId, DataQualityIssue)> {
        self.lock()
            .map(|state| state.issues.clone())
            .unwrap_or_default()
    }

    pub fn batches(&self) -> Vec<EtlBatch> {
        self.lock()
            .map(|state| state.batches.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn find_current(rows: &[DimensionVersion], natural_key: i64) -> Option<usize> {
    rows.iter()
        .position(|row| row.natural_key == natural_key && row.is_current)
}

impl DimensionStore for MemoryWarehouse {
    fn current_version(
        &self,
        spec: &DimensionSpec,
        natural_key: i64,
    ) -> Result<Option<DimensionVersion>, StoreError> {
        let state = self.lock()?;
        Ok(state.dimensions.get(spec.table).and_then(|rows| {
            find_current(rows, natural_key).map(|index| rows[index].clone())
        }))
    }

    fn insert_version(
        &self,
        spec: &DimensionSpec,
        natural_key: i64,
        attributes: &Record,
        valid_from: DateTime<Utc>,
        batch_id: BatchId,
    ) -> Result<SurrogateKey, StoreError> {
        let mut state = self.lock()?;
        state.next_surrogate += 1;
        let surrogate_key = state.next_surrogate;
        let rows = state.dimensions.entry(spec.table.to_string()).or_default();
        if find_current(rows, natural_key).is_some() {
            return Err(StoreError::Conflict(format!(
                "{} already has a current row for {natural_key}",
                spec.table
            )));
        }
        rows.push(DimensionVersion {
            surrogate_key,
            natural_key,
            attributes: attributes.clone(),
            valid_from,
            valid_to: None,
            is_current: true,
            batch_id,
        });
        Ok(surrogate_key)
    }

    fn replace_version(
        &self,
        spec: &DimensionSpec,
        natural_key: i64,
        current: SurrogateKey,
        attributes: &Record,
        at: DateTime<Utc>,
        batch_id: BatchId,
    ) -> Result<SurrogateKey, StoreError> {
        let mut state = self.lock()?;
        state.next_surrogate += 1;
        let surrogate_key = state.next_surrogate;
        let rows = state.dimensions.entry(spec.table.to_string()).or_default();
        let index = rows
            .iter()
            .position(|row| row.surrogate_key == current && row.is_current)
            .ok_or_else(|| StoreError::StaleVersion {
                table: spec.table.to_string(),
                natural_key,
            })?;

        rows[index].valid_to = Some(at);
        rows[index].is_current = false;
        rows.push(DimensionVersion {
            surrogate_key,
            natural_key,
            attributes: attributes.clone(),
            valid_from: at,
            valid_to: None,
            is_current: true,
            batch_id,
        });
        Ok(surrogate_key)
    }

    fn touch_version(
        &self,
        spec: &DimensionSpec,
        surrogate_key: SurrogateKey,
        batch_id: BatchId,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if let Some(row) = state
            .dimensions
            .get_mut(spec.table)
            .and_then(|rows| rows.iter_mut().find(|row| row.surrogate_key == surrogate_key))
        {
            row.batch_id = batch_id;
        }
        Ok(())
    }

    fn history(
        &self,
        spec: &DimensionSpec,
        natural_key: i64,
    ) -> Result<Vec<DimensionVersion>, StoreError> {
        let state = self.lock()?;
        let mut versions: Vec<DimensionVersion> = state
            .dimensions
            .get(spec.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.natural_key == natural_key)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        versions.sort_by_key(|row| (row.valid_from, row.surrogate_key));
        Ok(versions)
    }
}

impl FactStore for MemoryWarehouse {
    fn upsert_partition(
        &self,
        spec: &FactSpec,
        partition: PeriodId,
        rows: &[Record],
        _chunk_size: usize,
        batch_id: BatchId,
        loaded_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let poisoned = rows.iter().any(|row| {
            state
                .fact_failures
                .iter()
                .any(|(column, value)| row.get(column) == Some(value))
        });
        if poisoned {
            return Err(StoreError::Unavailable(format!(
                "{} partition {partition} rejected the load",
                spec.table
            )));
        }

        let table = state.facts.entry(spec.table.to_string()).or_default();
        let stamp = Value::String(loaded_at.to_rfc3339());
        for row in rows {
            let natural_id = IdRef::from_value(row.get(spec.natural_id))
                .id()
                .ok_or_else(|| {
                    StoreError::Conflict(format!("{} row without {}", spec.table, spec.natural_id))
                })?;
            match table.get_mut(&(partition, natural_id)) {
                Some(existing) => {
                    for field in spec.mutable_fields {
                        let value = row.get(*field).cloned().unwrap_or(Value::Null);
                        existing.insert((*field).to_string(), value);
                    }
                    existing.insert("etl_batch_id".to_string(), Value::from(batch_id.0));
                    existing.insert("updated_at".to_string(), stamp.clone());
                }
                None => {
                    let mut stored = Record::new();
                    for column in spec.record_columns() {
                        let value = row.get(column).cloned().unwrap_or(Value::Null);
                        stored.insert(column.to_string(), value);
                    }
                    stored.insert(spec.partition_key.to_string(), Value::from(partition.0));
                    stored.insert("etl_batch_id".to_string(), Value::from(batch_id.0));
                    stored.insert("first_loaded_at".to_string(), stamp.clone());
                    stored.insert("updated_at".to_string(), stamp.clone());
                    table.insert((partition, natural_id), stored);
                }
            }
        }
        Ok(rows.len() as u64)
    }
}

impl BatchStore for MemoryWarehouse {
    fn insert_batch(
        &self,
        batch_type: &str,
        metadata: &Value,
        started_at: DateTime<Utc>,
    ) -> Result<BatchId, StoreError> {
        let mut state = self.lock()?;
        state.next_batch += 1;
        let batch_id = BatchId(state.next_batch);
        state.batches.insert(
            batch_id,
            EtlBatch {
                batch_id,
                batch_type: batch_type.to_string(),
                status: BatchStatus::Running,
                started_at,
                completed_at: None,
                records_processed: 0,
                records_failed: 0,
                metadata: metadata.clone(),
                error_message: None,
            },
        );
        Ok(batch_id)
    }

    fn finish_batch(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        completed_at: DateTime<Utc>,
        records_processed: u64,
        records_failed: u64,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.batches.get_mut(&batch_id) {
            Some(batch) if batch.status == BatchStatus::Running => {
                batch.status = status;
                batch.completed_at = Some(completed_at);
                batch.records_processed = records_processed;
                batch.records_failed = records_failed;
                batch.error_message = error_message.map(str::to_string);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get_batch(&self, batch_id: BatchId) -> Result<Option<EtlBatch>, StoreError> {
        Ok(self.lock()?.batches.get(&batch_id).cloned())
    }
}

impl QualityLog for MemoryWarehouse {
    fn record_issues(
        &self,
        batch_id: BatchId,
        issues: &[DataQualityIssue],
        _recorded_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state
            .issues
            .extend(issues.iter().cloned().map(|issue| (batch_id, issue)));
        Ok(())
    }
}

impl PeriodStore for MemoryWarehouse {
    fn load_periods(&self) -> Result<Vec<BillingPeriod>, StoreError> {
        Ok(self.lock()?.periods.values().copied().collect())
    }

    fn save_periods(&self, periods: &[BillingPeriod]) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        for period in periods {
            state.periods.insert(period.period_id, *period);
        }
        Ok(periods.len())
    }
}

impl CheckpointStore for MemoryWarehouse {
    fn save(&self, run_id: &str, partition_key: &str, state: &Value) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        if guard.checkpoint_failures.iter().any(|key| key == partition_key) {
            return Err(StoreError::Unavailable(format!(
                "checkpoint {partition_key} of {run_id} is locked"
            )));
        }
        guard
            .checkpoints
            .insert((run_id.to_string(), partition_key.to_string()), state.clone());
        Ok(())
    }

    fn load(&self, run_id: &str, partition_key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .lock()?
            .checkpoints
            .get(&(run_id.to_string(), partition_key.to_string()))
            .cloned())
    }

    fn clear(&self, run_id: &str, partition_key: &str) -> Result<(), StoreError> {
        self.lock()?
            .checkpoints
            .remove(&(run_id.to_string(), partition_key.to_string()));
        Ok(())
    }
}
