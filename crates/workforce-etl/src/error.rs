use crate::api::ApiError;
use crate::config::ConfigError;
use crate::pipeline::PipelineError;
use crate::telemetry::TelemetryError;
use crate::warehouse::{BatchError, BatchId, PeriodError, StoreError};
use std::fmt;

/// Top-level error surfaced by the command-line entry points.
#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Api(ApiError),
    Store(StoreError),
    Period(PeriodError),
    Batch(BatchError),
    Pipeline(PipelineError),
    Io(std::io::Error),
    Serialization(serde_json::Error),
    /// The run itself finished, but its batch ended FAILED.
    RunFailed { batch_id: BatchId },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Api(err) => write!(f, "api error: {}", err),
            AppError::Store(err) => write!(f, "warehouse error: {}", err),
            AppError::Period(err) => write!(f, "billing period error: {}", err),
            AppError::Batch(err) => write!(f, "batch error: {}", err),
            AppError::Pipeline(err) => write!(f, "pipeline error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Serialization(err) => write!(f, "serialization error: {}", err),
            AppError::RunFailed { batch_id } => write!(f, "batch {} failed", batch_id),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Api(err) => Some(err),
            AppError::Store(err) => Some(err),
            AppError::Period(err) => Some(err),
            AppError::Batch(err) => Some(err),
            AppError::Pipeline(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Serialization(err) => Some(err),
            AppError::RunFailed { .. } => None,
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<ApiError> for AppError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<PeriodError> for AppError {
    fn from(value: PeriodError) -> Self {
        Self::Period(value)
    }
}

impl From<BatchError> for AppError {
    fn from(value: BatchError) -> Self {
        Self::Batch(value)
    }
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}
