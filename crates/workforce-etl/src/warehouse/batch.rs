use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::store::{BatchId, BatchStore, StoreError};
use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "RUNNING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(BatchStatus::Running),
            "COMPLETED" => Some(BatchStatus::Completed),
            "FAILED" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Running)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ETL run as recorded in `etl_batches`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlBatch {
    pub batch_id: BatchId,
    pub batch_type: String,
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub records_failed: u64,
    pub metadata: Value,
    pub error_message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch {0} does not exist")]
    NotFound(BatchId),
    #[error("batch {batch_id} is already {status}")]
    AlreadyTerminal {
        batch_id: BatchId,
        status: BatchStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owns the RUNNING -> COMPLETED/FAILED lifecycle of batches.
pub struct BatchTracker<S: BatchStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: BatchStore + ?Sized> BatchTracker<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn create_batch(&self, batch_type: &str, metadata: Value) -> Result<BatchId, BatchError> {
        let batch_id = self
            .store
            .insert_batch(batch_type, &metadata, self.clock.utc_now())?;
        tracing::info!(batch_id = batch_id.0, batch_type, "batch started");
        Ok(batch_id)
    }

    /// COMPLETED when `error` is `None`, FAILED otherwise.
    pub fn complete_batch(
        &self,
        batch_id: BatchId,
        records_processed: u64,
        records_failed: u64,
        error: Option<&str>,
    ) -> Result<BatchStatus, BatchError> {
        let current = self.get(batch_id)?;
        if current.status.is_terminal() {
            return Err(BatchError::AlreadyTerminal {
                batch_id,
                status: current.status,
            });
        }

        let status = if error.is_some() {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        let updated = self.store.finish_batch(
            batch_id,
            status,
            self.clock.utc_now(),
            records_processed,
            records_failed,
            error,
        )?;
        if !updated {
            let latest = self.get(batch_id)?;
            return Err(BatchError::AlreadyTerminal {
                batch_id,
                status: latest.status,
            });
        }

        match status {
            BatchStatus::Failed => tracing::error!(
                batch_id = batch_id.0,
                records_processed,
                records_failed,
                error = error.unwrap_or_default(),
                "batch failed"
            ),
            _ => tracing::info!(
                batch_id = batch_id.0,
                records_processed,
                records_failed,
                "batch completed"
            ),
        }
        Ok(status)
    }

    pub fn get(&self, batch_id: BatchId) -> Result<EtlBatch, BatchError> {
        self.store
            .get_batch(batch_id)?
            .ok_or(BatchError::NotFound(batch_id))
    }
}
