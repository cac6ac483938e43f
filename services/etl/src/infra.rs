use chrono::NaiveDate;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use workforce_etl::config::AppConfig;
use workforce_etl::error::AppError;
use workforce_etl::warehouse::periods::from_csv_path;
use workforce_etl::warehouse::{BillingPeriod, PeriodStore, PostgresWarehouse};

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

pub(crate) fn connect(config: &AppConfig) -> Result<Arc<PostgresWarehouse>, AppError> {
    let database = config.require_database()?;
    Ok(Arc::new(PostgresWarehouse::connect(&database.url)?))
}

/// Periods from a CSV file when one is given, otherwise from the warehouse.
pub(crate) fn load_periods(
    config: &AppConfig,
    csv: Option<&Path>,
) -> Result<Vec<BillingPeriod>, AppError> {
    match csv {
        Some(path) => Ok(from_csv_path(path)?),
        None => Ok(connect(config)?.load_periods()?),
    }
}

pub(crate) fn print_json(value: &Value) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
