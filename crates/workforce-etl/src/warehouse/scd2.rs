use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use super::schema::DimensionSpec;
use super::store::{BatchId, DataQualityIssue, DimensionStore, QualityLog, StoreError};
use crate::clock::Clock;
use crate::transform::{parse_timestamp, IdRef, Record};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertStats {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub rejected: u64,
}

impl UpsertStats {
    pub fn processed(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }

    pub fn absorb(&mut self, other: UpsertStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.rejected += other.rejected;
    }
}

/// Applies SCD Type 2 versioning to dimension records.
pub struct DimensionUpserter<S: DimensionStore + QualityLog + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: DimensionStore + QualityLog + ?Sized> DimensionUpserter<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Records are applied in order; each one re-reads the current row so a
    /// later duplicate of the same key simply becomes the next version.
    pub fn upsert(
        &self,
        spec: &DimensionSpec,
        records: Vec<Record>,
        batch_id: BatchId,
    ) -> Result<UpsertStats, StoreError> {
        spec.validate()?;
        let mut stats = UpsertStats::default();
        let mut rejected = Vec::new();

        for record in records {
            let natural_key = match IdRef::from_value(record.get(spec.natural_key)) {
                IdRef::Id(id) => id,
                IdRef::Missing => {
                    rejected.push(DataQualityIssue {
                        entity: spec.entity.to_string(),
                        natural_key: None,
                        reason: format!("missing natural key `{}`", spec.natural_key),
                        payload: Value::Object(record),
                    });
                    continue;
                }
            };
            let attributes = tracked_attributes(spec, &record);
            let now = self.clock.utc_now();

            match self.store.current_version(spec, natural_key)? {
                None => {
                    self.store
                        .insert_version(spec, natural_key, &attributes, now, batch_id)?;
                    stats.inserted += 1;
                }
                Some(current) if attributes_differ(spec, &current.attributes, &attributes) => {
                    let at = now.max(current.valid_from);
                    self.store.replace_version(
                        spec,
                        natural_key,
                        current.surrogate_key,
                        &attributes,
                        at,
                        batch_id,
                    )?;
                    tracing::debug!(table = spec.table, natural_key, "dimension version replaced");
                    stats.updated += 1;
                }
                Some(current) => {
                    if current.batch_id != batch_id {
                        self.store
                            .touch_version(spec, current.surrogate_key, batch_id)?;
                    }
                    stats.unchanged += 1;
                }
            }
        }

        if !rejected.is_empty() {
            stats.rejected = rejected.len() as u64;
            tracing::warn!(
                table = spec.table,
                rejected = rejected.len(),
                "dimension records without natural key quarantined"
            );
            self.store
                .record_issues(batch_id, &rejected, self.clock.utc_now())?;
        }

        tracing::info!(
            table = spec.table,
            batch_id = batch_id.0,
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            "dimension upsert finished"
        );
        Ok(stats)
    }
}

fn tracked_attributes(spec: &DimensionSpec, record: &Record) -> Record {
    spec.tracked_fields
        .iter()
        .map(|field| {
            (
                (*field).to_string(),
                record.get(*field).cloned().unwrap_or(Value::Null),
            )
        })
        .collect()
}

fn attributes_differ(spec: &DimensionSpec, current: &Record, incoming: &Record) -> bool {
    spec.tracked_fields.iter().any(|field| {
        let left = current.get(*field).unwrap_or(&Value::Null);
        let right = incoming.get(*field).unwrap_or(&Value::Null);
        !values_equal(left, right)
    })
}

/// Null-aware equality. Null equals only null. Two JSON numbers compare
/// exactly when both are integers and within a small tolerance otherwise.
/// Strings compare as trimmed text, or by instant when both are timestamps.
/// Values of different JSON types fall back to their exact text, so `42`
/// matches `"42"` but not `"0042"`.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::String(a), Value::String(b)) => {
            let (a, b) = (a.trim(), b.trim());
            if a == b {
                return true;
            }
            match (parse_timestamp(a), parse_timestamp(b)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Value::Null, _) | (_, Value::Null) => false,
        _ => canonical_text(left) == canonical_text(right),
    }
}

fn canonical_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        other => other.to_string(),
    }
}

const RATE_TOLERANCE: f64 = 1e-9;

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return a == b;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => (a - b).abs() < RATE_TOLERANCE,
        _ => false,
    }
}
