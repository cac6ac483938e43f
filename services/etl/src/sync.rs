use crate::infra::{connect, load_periods, parse_date, print_json};
use chrono::NaiveDate;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use workforce_etl::api::ApiClient;
use workforce_etl::clock::{Clock, SystemClock};
use workforce_etl::config::AppConfig;
use workforce_etl::error::AppError;
use workforce_etl::pipeline::{PipelineOrchestrator, RunRequest};
use workforce_etl::warehouse::{BatchStatus, MemoryWarehouse, Warehouse};

#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// First day to sync (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub(crate) start: NaiveDate,
    /// Last day to sync, inclusive (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub(crate) end: NaiveDate,
    /// Only sync this region; repeat for several
    #[arg(long = "region")]
    pub(crate) regions: Vec<i64>,
    /// Checkpoint key to resume under (defaults to one derived from the range)
    #[arg(long)]
    pub(crate) run_id: Option<String>,
    /// Load into an in-memory warehouse and print what would be written
    #[arg(long)]
    pub(crate) dry_run: bool,
    /// Billing periods for a dry run; otherwise they are read from the database
    #[arg(long, requires = "dry_run")]
    pub(crate) periods_csv: Option<PathBuf>,
}

pub(crate) fn run_sync(config: &AppConfig, args: RunArgs) -> Result<(), AppError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let source = ApiClient::from_config(config.require_api()?, Arc::clone(&clock))?;

    let warehouse: Arc<dyn Warehouse> = if args.dry_run {
        let periods = load_periods(config, args.periods_csv.as_deref())?;
        info!(periods = periods.len(), "dry run against an in-memory warehouse");
        Arc::new(MemoryWarehouse::with_periods(&periods))
    } else {
        connect(config)?
    };

    let mut request = RunRequest::new(args.start, args.end).with_regions(args.regions);
    if let Some(run_id) = args.run_id {
        request = request.with_run_id(run_id);
    }

    let orchestrator = PipelineOrchestrator::new(source, warehouse, clock, config.pipeline);
    let summary = orchestrator.run(&request)?;
    print_json(&serde_json::to_value(&summary)?)?;

    if summary.status == BatchStatus::Failed {
        return Err(AppError::RunFailed {
            batch_id: summary.batch_id,
        });
    }
    Ok(())
}
