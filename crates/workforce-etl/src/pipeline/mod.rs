//! End-to-end run: authenticate, check period coverage, load regions, then walk
//! every region partition through its dimensions and shift windows.

pub mod orchestrator;
pub mod plan;
pub mod summary;

pub use orchestrator::PipelineOrchestrator;
pub use plan::{partition_key, RunRequest, BATCH_TYPE};
pub use summary::{PartitionOutcome, PartitionSummary, RunSummary};

use crate::api::ApiError;
use crate::warehouse::{BatchError, PeriodError, StoreError};

/// Errors that stop the whole run before or after the partition loop.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid run request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure inside one partition. Only authentication failures escalate.
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Period(#[from] PeriodError),
}

impl PartitionError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, PartitionError::Api(err) if err.is_authentication())
    }
}
