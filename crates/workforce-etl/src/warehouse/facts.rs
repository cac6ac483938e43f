use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::periods::PeriodId;
use super::schema::FactSpec;
use super::store::{BatchId, DataQualityIssue, FactStore, QualityLog, StoreError};
use crate::clock::Clock;
use crate::transform::{IdRef, Record};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactLoadReport {
    pub written: u64,
    pub rejected: u64,
    /// Records dropped because a later record in the same call had the same key.
    pub duplicates: u64,
    pub partitions: u64,
}

impl FactLoadReport {
    pub fn absorb(&mut self, other: FactLoadReport) {
        self.written += other.written;
        self.rejected += other.rejected;
        self.duplicates += other.duplicates;
        self.partitions += other.partitions;
    }
}

/// Bulk upserts fact records, one transaction per partition.
pub struct FactLoader<S: FactStore + QualityLog + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    chunk_size: usize,
}

impl<S: FactStore + QualityLog + ?Sized> FactLoader<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, chunk_size: usize) -> Self {
        Self {
            store,
            clock,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn load_batch(
        &self,
        spec: &FactSpec,
        records: Vec<Record>,
        batch_id: BatchId,
    ) -> Result<FactLoadReport, StoreError> {
        spec.validate()?;
        let mut report = FactLoadReport::default();
        let mut rejected = Vec::new();
        let mut partitions: BTreeMap<PeriodId, BTreeMap<i64, Record>> = BTreeMap::new();

        for record in records {
            match check_record(spec, &record) {
                Ok((partition, natural_id)) => {
                    let previous = partitions
                        .entry(partition)
                        .or_default()
                        .insert(natural_id, record);
                    if previous.is_some() {
                        report.duplicates += 1;
                    }
                }
                Err(reason) => {
                    let natural_key = record.get(spec.natural_id).and_then(|value| match value {
                        Value::Null => None,
                        Value::String(text) => Some(text.clone()),
                        other => Some(other.to_string()),
                    });
                    rejected.push(DataQualityIssue {
                        entity: spec.entity.to_string(),
                        natural_key,
                        reason,
                        payload: Value::Object(record),
                    });
                }
            }
        }

        if !rejected.is_empty() {
            report.rejected = rejected.len() as u64;
            tracing::warn!(
                table = spec.table,
                rejected = rejected.len(),
                "fact records quarantined"
            );
            self.store
                .record_issues(batch_id, &rejected, self.clock.utc_now())?;
        }

        let loaded_at = self.clock.utc_now();
        for (partition, rows) in partitions {
            let rows: Vec<Record> = rows.into_values().collect();
            let written = self.store.upsert_partition(
                spec,
                partition,
                &rows,
                self.chunk_size,
                batch_id,
                loaded_at,
            )?;
            tracing::debug!(
                table = spec.table,
                partition = partition.0,
                rows = rows.len(),
                written,
                "fact partition loaded"
            );
            report.written += written;
            report.partitions += 1;
        }

        Ok(report)
    }
}

fn check_record(spec: &FactSpec, record: &Record) -> Result<(PeriodId, i64), String> {
    let partition = IdRef::from_value(record.get(spec.partition_key))
        .id()
        .ok_or_else(|| format!("missing partition key `{}`", spec.partition_key))?;
    let natural_id = IdRef::from_value(record.get(spec.natural_id))
        .id()
        .ok_or_else(|| format!("missing natural id `{}`", spec.natural_id))?;
    let missing: Vec<&str> = spec
        .required_fields
        .iter()
        .copied()
        .filter(|field| record.get(*field).map_or(true, Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required fields: {}", missing.join(", ")));
    }
    Ok((PeriodId(partition), natural_id))
}
