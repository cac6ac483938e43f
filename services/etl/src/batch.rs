use crate::infra::{connect, print_json};
use clap::Args;
use std::sync::Arc;
use workforce_etl::clock::SystemClock;
use workforce_etl::config::AppConfig;
use workforce_etl::error::AppError;
use workforce_etl::warehouse::{BatchId, BatchTracker};

#[derive(Args, Debug)]
pub(crate) struct ShowBatchArgs {
    /// Batch id as printed in a run summary
    #[arg(long)]
    pub(crate) id: i64,
}

pub(crate) fn show_batch(config: &AppConfig, args: ShowBatchArgs) -> Result<(), AppError> {
    let tracker = BatchTracker::new(connect(config)?, Arc::new(SystemClock));
    let batch = tracker.get(BatchId(args.id))?;
    print_json(&serde_json::to_value(&batch)?)
}
