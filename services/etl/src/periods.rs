use crate::infra::{connect, load_periods, parse_date, print_json};
use chrono::NaiveDate;
use clap::Args;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;
use workforce_etl::config::AppConfig;
use workforce_etl::error::AppError;
use workforce_etl::warehouse::periods::{from_csv_path, generate};
use workforce_etl::warehouse::{BillingPeriod, BillingPeriodResolver, PeriodStore};

#[derive(Args, Debug)]
pub(crate) struct ImportArgs {
    /// CSV file with period_id,start_date,end_date
    #[arg(long)]
    pub(crate) csv: PathBuf,
}

#[derive(Args, Debug)]
pub(crate) struct GenerateArgs {
    /// Start date of the first period (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub(crate) anchor: NaiveDate,
    /// Days per period
    #[arg(long, default_value_t = 14)]
    pub(crate) length_days: u32,
    /// Number of periods to generate
    #[arg(long)]
    pub(crate) count: u32,
    /// Write the generated periods to the warehouse instead of only printing them
    #[arg(long)]
    pub(crate) apply: bool,
}

#[derive(Args, Debug)]
pub(crate) struct ResolveArgs {
    /// Date to look up (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub(crate) date: NaiveDate,
    /// Resolve against this CSV instead of the warehouse
    #[arg(long)]
    pub(crate) periods_csv: Option<PathBuf>,
}

pub(crate) fn import_periods(config: &AppConfig, args: ImportArgs) -> Result<(), AppError> {
    let periods = from_csv_path(&args.csv)?;
    let written = save_merged(config, &periods)?;
    info!(path = %args.csv.display(), written, "billing periods imported");
    print_json(&json!({ "imported": written }))
}

pub(crate) fn generate_periods(config: &AppConfig, args: GenerateArgs) -> Result<(), AppError> {
    let periods = generate(args.anchor, args.length_days, args.count)?;
    // Generated sets are validated on their own even when not applied.
    BillingPeriodResolver::new(periods.clone())?;

    let written = if args.apply {
        save_merged(config, &periods)?
    } else {
        0
    };
    print_json(&json!({
        "periods": serde_json::to_value(&periods)?,
        "written": written,
    }))
}

pub(crate) fn resolve_date(config: &AppConfig, args: ResolveArgs) -> Result<(), AppError> {
    let resolver = BillingPeriodResolver::new(load_periods(config, args.periods_csv.as_deref())?)?;
    let period_id = resolver.resolve(args.date)?;
    let (start_date, end_date) = resolver.period_bounds(period_id)?;
    print_json(&json!({
        "date": args.date,
        "period_id": period_id,
        "start_date": start_date,
        "end_date": end_date,
    }))
}

/// Saves `incoming` after checking it against the stored periods, so an
/// import can never leave overlapping periods behind.
fn save_merged(config: &AppConfig, incoming: &[BillingPeriod]) -> Result<usize, AppError> {
    let warehouse = connect(config)?;
    let mut merged: BTreeMap<i64, BillingPeriod> = warehouse
        .load_periods()?
        .into_iter()
        .map(|period| (period.period_id.0, period))
        .collect();
    for period in incoming {
        merged.insert(period.period_id.0, *period);
    }
    BillingPeriodResolver::new(merged.into_values().collect())?;
    Ok(warehouse.save_periods(incoming)?)
}
