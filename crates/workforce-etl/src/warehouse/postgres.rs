//! `PostgreSQL` implementation of the warehouse store traits.
//!
//! Uses the sync `postgres` crate behind one `Mutex<Client>`. Dimension and fact
//! rows travel as JSON and are expanded with `jsonb_populate_record(set)`, so the
//! column types declared in [`SCHEMA_SQL`] drive every conversion.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use postgres::{Client, NoTls};
use serde_json::Value;

use super::batch::{BatchStatus, EtlBatch};
use super::periods::{BillingPeriod, PeriodId};
use super::schema::{DimensionSpec, FactSpec, SCHEMA_SQL};
use super::store::{
    BatchId, BatchStore, DataQualityIssue, DimensionStore, DimensionVersion, FactStore,
    PeriodStore, QualityLog, StoreError, SurrogateKey,
};
use crate::checkpoint::CheckpointStore;
use crate::transform::{parse_timestamp, Record};

pub struct PostgresWarehouse {
    client: Mutex<Client>,
}

impl PostgresWarehouse {
    /// Connects with a libpq-style connection string or `postgres://` URI.
    /// Tables are not created here; call [`PostgresWarehouse::migrate`].
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::connect(url, NoTls).map_err(StoreError::database("connect"))?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Applies the idempotent warehouse DDL.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.lock_client()?
            .batch_execute(SCHEMA_SQL)
            .map_err(StoreError::database("apply schema"))
    }

    fn lock_client(&self) -> Result<MutexGuard<'_, Client>, StoreError> {
        self.client.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn insert_version_sql(spec: &DimensionSpec) -> String {
        let columns = dimension_columns(spec);
        format!(
            "INSERT INTO {table} ({columns}, valid_from, valid_to, is_current, batch_id) \
             SELECT {columns}, $2, NULL, TRUE, $3 \
             FROM jsonb_populate_record(NULL::{table}, $1::jsonb) \
             RETURNING {surrogate}",
            table = spec.table,
            surrogate = spec.surrogate_key,
        )
    }
}

impl std::fmt::Debug for PostgresWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresWarehouse").finish_non_exhaustive()
    }
}

fn dimension_columns(spec: &DimensionSpec) -> String {
    std::iter::once(spec.natural_key)
        .chain(spec.tracked_fields.iter().copied())
        .collect::<Vec<_>>()
        .join(", ")
}

fn version_payload(spec: &DimensionSpec, natural_key: i64, attributes: &Record) -> Value {
    let mut payload = attributes.clone();
    payload.insert(spec.natural_key.to_string(), Value::from(natural_key));
    Value::Object(payload)
}

fn version_from_json(spec: &DimensionSpec, row: Value) -> Result<DimensionVersion, StoreError> {
    let malformed = |reason: &str| StoreError::MalformedRow {
        table: spec.table.to_string(),
        reason: reason.to_string(),
    };
    let Value::Object(mut object) = row else {
        return Err(malformed("row is not an object"));
    };

    let surrogate_key = object
        .get(spec.surrogate_key)
        .and_then(Value::as_i64)
        .ok_or_else(|| malformed("missing surrogate key"))?;
    let natural_key = object
        .get(spec.natural_key)
        .and_then(Value::as_i64)
        .ok_or_else(|| malformed("missing natural key"))?;
    let valid_from = object
        .get("valid_from")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .ok_or_else(|| malformed("missing valid_from"))?;
    let valid_to = object
        .get("valid_to")
        .and_then(Value::as_str)
        .and_then(parse_timestamp);
    let is_current = object
        .get("is_current")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let batch_id = object
        .get("batch_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| malformed("missing batch_id"))?;

    let attributes = spec
        .tracked_fields
        .iter()
        .map(|field| {
            let value = object.remove(*field).unwrap_or(Value::Null);
            ((*field).to_string(), value)
        })
        .collect();

    Ok(DimensionVersion {
        surrogate_key,
        natural_key,
        attributes,
        valid_from,
        valid_to,
        is_current,
        batch_id: BatchId(batch_id),
    })
}

impl DimensionStore for PostgresWarehouse {
    fn current_version(
        &self,
        spec: &DimensionSpec,
        natural_key: i64,
    ) -> Result<Option<DimensionVersion>, StoreError> {
        spec.validate()?;
        let sql = format!(
            "SELECT to_jsonb(t) FROM {table} t WHERE {key} = $1 AND is_current",
            table = spec.table,
            key = spec.natural_key,
        );
        let row = self
            .lock_client()?
            .query_opt(&sql, &[&natural_key])
            .map_err(StoreError::database(format!("read current {}", spec.table)))?;
        row.map(|row| version_from_json(spec, row.get(0)))
            .transpose()
    }

    fn insert_version(
        &self,
        spec: &DimensionSpec,
        natural_key: i64,
        attributes: &Record,
        valid_from: DateTime<Utc>,
        batch_id: BatchId,
    ) -> Result<SurrogateKey, StoreError> {
        spec.validate()?;
        let payload = version_payload(spec, natural_key, attributes);
        let row = self
            .lock_client()?
            .query_one(
                &Self::insert_version_sql(spec),
                &[&payload, &valid_from, &batch_id.0],
            )
            .map_err(StoreError::database(format!("insert {}", spec.table)))?;
        Ok(row.get(0))
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
        spec.validate()?;
        let close_sql = format!(
            "UPDATE {table} SET valid_to = $1, is_current = FALSE \
             WHERE {surrogate} = $2 AND is_current",
            table = spec.table,
            surrogate = spec.surrogate_key,
        );
        let payload = version_payload(spec, natural_key, attributes);

        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(StoreError::database("begin version replace"))?;
        let closed = tx
            .execute(&close_sql, &[&at, &current])
            .map_err(StoreError::database(format!("close {}", spec.table)))?;
        if closed != 1 {
            tx.rollback()
                .map_err(StoreError::database("rollback version replace"))?;
            return Err(StoreError::StaleVersion {
                table: spec.table.to_string(),
                natural_key,
            });
        }
        let row = tx
            .query_one(&Self::insert_version_sql(spec), &[&payload, &at, &batch_id.0])
            .map_err(StoreError::database(format!("insert {}", spec.table)))?;
        tx.commit()
            .map_err(StoreError::database("commit version replace"))?;
        Ok(row.get(0))
    }

    fn touch_version(
        &self,
        spec: &DimensionSpec,
        surrogate_key: SurrogateKey,
        batch_id: BatchId,
    ) -> Result<(), StoreError> {
        spec.validate()?;
        let sql = format!(
            "UPDATE {table} SET batch_id = $1 WHERE {surrogate} = $2",
            table = spec.table,
            surrogate = spec.surrogate_key,
        );
        self.lock_client()?
            .execute(&sql, &[&batch_id.0, &surrogate_key])
            .map_err(StoreError::database(format!("touch {}", spec.table)))?;
        Ok(())
    }

    fn history(
        &self,
        spec: &DimensionSpec,
        natural_key: i64,
    ) -> Result<Vec<DimensionVersion>, StoreError> {
        spec.validate()?;
        let sql = format!(
            "SELECT to_jsonb(t) FROM {table} t WHERE {key} = $1 ORDER BY valid_from, {surrogate}",
            table = spec.table,
            key = spec.natural_key,
            surrogate = spec.surrogate_key,
        );
        let rows = self
            .lock_client()?
            .query(&sql, &[&natural_key])
            .map_err(StoreError::database(format!("read {} history", spec.table)))?;
        rows.into_iter()
            .map(|row| version_from_json(spec, row.get(0)))
            .collect()
    }
}

impl FactStore for PostgresWarehouse {
    fn upsert_partition(
        &self,
        spec: &FactSpec,
        partition: PeriodId,
        rows: &[Record],
        chunk_size: usize,
        batch_id: BatchId,
        loaded_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        spec.validate()?;
        let columns = spec.record_columns().join(", ");
        let updates = spec
            .mutable_fields
            .iter()
            .map(|field| format!("{field} = EXCLUDED.{field}"))
            .chain([
                "etl_batch_id = EXCLUDED.etl_batch_id".to_string(),
                "updated_at = EXCLUDED.updated_at".to_string(),
            ])
            .collect::<Vec<_>>()
            .join(", ");
        let create_partition = format!(
            "CREATE TABLE IF NOT EXISTS {partition_table} PARTITION OF {table} FOR VALUES IN ({value})",
            partition_table = spec.partition_table(partition.0),
            table = spec.table,
            value = partition.0,
        );
        let upsert = format!(
            "INSERT INTO {table} ({columns}, etl_batch_id, first_loaded_at, updated_at) \
             SELECT {columns}, $2, $3, $3 \
             FROM jsonb_populate_recordset(NULL::{table}, $1::jsonb) \
             ON CONFLICT ({partition_key}, {natural_id}) DO UPDATE SET {updates}",
            table = spec.table,
            partition_key = spec.partition_key,
            natural_id = spec.natural_id,
        );

        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(StoreError::database("begin fact load"))?;
        tx.batch_execute(&create_partition)
            .map_err(StoreError::database(format!("create partition {partition}")))?;

        let mut written = 0;
        for chunk in rows.chunks(chunk_size.max(1)) {
            let payload = Value::Array(
                chunk
                    .iter()
                    .map(|row| {
                        let mut row = row.clone();
                        row.insert(spec.partition_key.to_string(), Value::from(partition.0));
                        Value::Object(row)
                    })
                    .collect(),
            );
            written += tx
                .execute(&upsert, &[&payload, &batch_id.0, &loaded_at])
                .map_err(StoreError::database(format!(
                    "upsert {} partition {partition}",
                    spec.table
                )))?;
        }
        tx.commit()
            .map_err(StoreError::database("commit fact load"))?;
        Ok(written)
    }
}

impl BatchStore for PostgresWarehouse {
    fn insert_batch(
        &self,
        batch_type: &str,
        metadata: &Value,
        started_at: DateTime<Utc>,
    ) -> Result<BatchId, StoreError> {
        let row = self
            .lock_client()?
            .query_one(
                "INSERT INTO etl_batches (batch_type, status, started_at, metadata) \
                 VALUES ($1, $2, $3, $4) RETURNING batch_id",
                &[
                    &batch_type,
                    &BatchStatus::Running.as_str(),
                    &started_at,
                    metadata,
                ],
            )
            .map_err(StoreError::database("insert batch"))?;
        Ok(BatchId(row.get(0)))
    }

    #[allow(clippy::cast_possible_wrap)]
    fn finish_batch(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        completed_at: DateTime<Utc>,
        records_processed: u64,
        records_failed: u64,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let updated = self
            .lock_client()?
            .execute(
                "UPDATE etl_batches SET status = $1, completed_at = $2, \
                 records_processed = $3, records_failed = $4, error_message = $5 \
                 WHERE batch_id = $6 AND status = 'RUNNING'",
                &[
                    &status.as_str(),
                    &completed_at,
                    &(records_processed as i64),
                    &(records_failed as i64),
                    &error_message,
                    &batch_id.0,
                ],
            )
            .map_err(StoreError::database("finish batch"))?;
        Ok(updated == 1)
    }

    #[allow(clippy::cast_sign_loss)]
    fn get_batch(&self, batch_id: BatchId) -> Result<Option<EtlBatch>, StoreError> {
        let row = self
            .lock_client()?
            .query_opt(
                "SELECT batch_id, batch_type, status, started_at, completed_at, \
                 records_processed, records_failed, metadata, error_message \
                 FROM etl_batches WHERE batch_id = $1",
                &[&batch_id.0],
            )
            .map_err(StoreError::database("read batch"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status_text: String = row.get(2);
        let status = BatchStatus::parse(&status_text).ok_or_else(|| StoreError::MalformedRow {
            table: "etl_batches".to_string(),
            reason: format!("unknown status {status_text}"),
        })?;
        let processed: i64 = row.get(5);
        let failed: i64 = row.get(6);
        Ok(Some(EtlBatch {
            batch_id: BatchId(row.get(0)),
            batch_type: row.get(1),
            status,
            started_at: row.get(3),
            completed_at: row.get(4),
            records_processed: processed.max(0) as u64,
            records_failed: failed.max(0) as u64,
            metadata: row.get(7),
            error_message: row.get(8),
        }))
    }
}

impl QualityLog for PostgresWarehouse {
    fn record_issues(
        &self,
        batch_id: BatchId,
        issues: &[DataQualityIssue],
        recorded_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if issues.is_empty() {
            return Ok(());
        }
        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(StoreError::database("begin quality log"))?;
        let stmt = tx
            .prepare(
                "INSERT INTO data_quality_issues \
                 (batch_id, entity, natural_key, reason, payload, recorded_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .map_err(StoreError::database("prepare quality log"))?;
        for issue in issues {
            tx.execute(
                &stmt,
                &[
                    &batch_id.0,
                    &issue.entity,
                    &issue.natural_key,
                    &issue.reason,
                    &issue.payload,
                    &recorded_at,
                ],
            )
            .map_err(StoreError::database("insert quality issue"))?;
        }
        tx.commit()
            .map_err(StoreError::database("commit quality log"))
    }
}

impl PeriodStore for PostgresWarehouse {
    fn load_periods(&self) -> Result<Vec<BillingPeriod>, StoreError> {
        let rows = self
            .lock_client()?
            .query(
                "SELECT period_id, start_date, end_date FROM billing_periods ORDER BY start_date",
                &[],
            )
            .map_err(StoreError::database("read billing periods"))?;
        Ok(rows
            .into_iter()
            .map(|row| BillingPeriod {
                period_id: PeriodId(row.get(0)),
                start_date: row.get::<_, NaiveDate>(1),
                end_date: row.get::<_, NaiveDate>(2),
            })
            .collect())
    }

    fn save_periods(&self, periods: &[BillingPeriod]) -> Result<usize, StoreError> {
        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(StoreError::database("begin period import"))?;
        let stmt = tx
            .prepare(
                "INSERT INTO billing_periods (period_id, start_date, end_date) VALUES ($1, $2, $3) \
                 ON CONFLICT (period_id) DO UPDATE \
                 SET start_date = EXCLUDED.start_date, end_date = EXCLUDED.end_date",
            )
            .map_err(StoreError::database("prepare period import"))?;
        for period in periods {
            tx.execute(
                &stmt,
                &[&period.period_id.0, &period.start_date, &period.end_date],
            )
            .map_err(StoreError::database(format!("save period {}", period.period_id)))?;
        }
        tx.commit()
            .map_err(StoreError::database("commit period import"))?;
        Ok(periods.len())
    }
}

impl CheckpointStore for PostgresWarehouse {
    fn save(&self, run_id: &str, partition_key: &str, state: &Value) -> Result<(), StoreError> {
        self.lock_client()?
            .execute(
                "INSERT INTO etl_checkpoints (run_id, partition_key, state, updated_at) \
                 VALUES ($1, $2, $3, now()) \
                 ON CONFLICT (run_id, partition_key) \
                 DO UPDATE SET state = EXCLUDED.state, updated_at = now()",
                &[&run_id, &partition_key, state],
            )
            .map_err(StoreError::database("save checkpoint"))?;
        Ok(())
    }

    fn load(&self, run_id: &str, partition_key: &str) -> Result<Option<Value>, StoreError> {
        let row = self
            .lock_client()?
            .query_opt(
                "SELECT state FROM etl_checkpoints WHERE run_id = $1 AND partition_key = $2",
                &[&run_id, &partition_key],
            )
            .map_err(StoreError::database("load checkpoint"))?;
        Ok(row.map(|row| row.get(0)))
    }

    fn clear(&self, run_id: &str, partition_key: &str) -> Result<(), StoreError> {
        self.lock_client()?
            .execute(
                "DELETE FROM etl_checkpoints WHERE run_id = $1 AND partition_key = $2",
                &[&run_id, &partition_key],
            )
            .map_err(StoreError::database("clear checkpoint"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::warehouse::schema::{EMPLOYEE_DIMENSION, SHIFT_FACT};
    use crate::warehouse::DimensionUpserter;
    use serde_json::json;
    use std::sync::Arc;

    fn test_url() -> String {
        std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL not set; skipping Postgres integration test")
    }

    fn warehouse() -> PostgresWarehouse {
        let warehouse = PostgresWarehouse::connect(&test_url()).unwrap();
        warehouse.migrate().unwrap();
        warehouse
    }

    fn unique_key() -> i64 {
        Utc::now().timestamp_nanos_opt().unwrap_or_default() % 1_000_000_000_000
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn employee_versions_close_and_reopen() {
        let warehouse = Arc::new(warehouse());
        let batch = warehouse
            .insert_batch("test", &json!({}), Utc::now())
            .unwrap();
        let upserter = DimensionUpserter::new(warehouse.clone(), Arc::new(SystemClock));
        let key = unique_key();
        let record = |status: &str| {
            json!({"employee_id": key, "first_name": "Pat", "status": status})
                .as_object()
                .cloned()
                .unwrap()
        };

        let first = upserter
            .upsert(&EMPLOYEE_DIMENSION, vec![record("ACTIVE")], batch)
            .unwrap();
        let second = upserter
            .upsert(&EMPLOYEE_DIMENSION, vec![record("TERMINATED")], batch)
            .unwrap();
        let third = upserter
            .upsert(&EMPLOYEE_DIMENSION, vec![record("TERMINATED")], batch)
            .unwrap();

        assert_eq!((first.inserted, second.updated, third.unchanged), (1, 1, 1));
        let history = warehouse.history(&EMPLOYEE_DIMENSION, key).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].valid_to, Some(history[1].valid_from));
        assert!(history[1].is_current);
        assert_eq!(history[1].attributes["status"], json!("TERMINATED"));
    }

    #[test]
    #[ignore = "requires TEST_DATABASE_URL"]
    fn fact_upsert_keeps_identifying_columns() {
        let warehouse = warehouse();
        let batch = warehouse
            .insert_batch("test", &json!({}), Utc::now())
            .unwrap();
        let shift_id = unique_key();
        let row = |status: &str, client: i64| {
            json!({
                "billing_period_id": 19000101, "shift_id": shift_id, "region_id": 1,
                "client_id": client, "shift_date": "1900-01-01",
                "start_time": "1900-01-01T08:00:00Z", "status": status, "hours": 8
            })
            .as_object()
            .cloned()
            .unwrap()
        };

        let period = PeriodId(19000101);
        warehouse
            .upsert_partition(&SHIFT_FACT, period, &[row("APPROVED", 5)], 100, batch, Utc::now())
            .unwrap();
        warehouse
            .upsert_partition(&SHIFT_FACT, period, &[row("COMPLETED", 9)], 100, batch, Utc::now())
            .unwrap();

        let mut client = warehouse.lock_client().unwrap();
        let found = client
            .query_one(
                "SELECT status, client_id FROM fact_shift WHERE billing_period_id = $1 AND shift_id = $2",
                &[&period.0, &shift_id],
            )
            .unwrap();
        let status: String = found.get(0);
        let client_id: i64 = found.get(1);
        assert_eq!(status, "COMPLETED");
        assert_eq!(client_id, 5);
    }
}
