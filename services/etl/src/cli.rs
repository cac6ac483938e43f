use crate::batch::{show_batch, ShowBatchArgs};
use crate::periods::{generate_periods, import_periods, resolve_date, GenerateArgs, ImportArgs, ResolveArgs};
use crate::sync::{run_sync, RunArgs};
use clap::{Parser, Subcommand};
use tracing::info;
use workforce_etl::config::AppConfig;
use workforce_etl::error::AppError;
use workforce_etl::telemetry;

#[derive(Parser, Debug)]
#[command(
    name = "workforce-etl",
    about = "Load workforce scheduling data into the reporting warehouse",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or update the warehouse tables
    Migrate,
    /// Sync regions, dimensions and shifts for a date range
    Run(RunArgs),
    /// Manage billing periods
    Periods {
        #[command(subcommand)]
        command: PeriodsCommand,
    },
    /// Inspect recorded ETL batches
    Batch {
        #[command(subcommand)]
        command: BatchCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PeriodsCommand {
    /// Import periods from a CSV with period_id,start_date,end_date columns
    Import(ImportArgs),
    /// Generate back-to-back periods from an anchor date
    Generate(GenerateArgs),
    /// Show the period a date belongs to
    Resolve(ResolveArgs),
}

#[derive(Subcommand, Debug)]
enum BatchCommand {
    /// Print one batch record
    Show(ShowBatchArgs),
}

pub(crate) fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;
    info!(environment = ?config.environment, "workforce etl starting");

    match cli.command {
        Command::Migrate => {
            crate::infra::connect(&config)?.migrate()?;
            info!("warehouse schema is up to date");
            Ok(())
        }
        Command::Run(args) => run_sync(&config, args),
        Command::Periods { command } => match command {
            PeriodsCommand::Import(args) => import_periods(&config, args),
            PeriodsCommand::Generate(args) => generate_periods(&config, args),
            PeriodsCommand::Resolve(args) => resolve_date(&config, args),
        },
        Command::Batch {
            command: BatchCommand::Show(args),
        } => show_batch(&config, args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn parses_a_run_with_repeated_regions() {
        let cli = Cli::try_parse_from([
            "workforce-etl",
            "run",
            "--start",
            "2025-01-01",
            "--end",
            "2025-01-31",
            "--region",
            "4",
            "--region",
            "2",
            "--dry-run",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.start, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(args.regions, vec![4, 2]);
        assert!(args.dry_run);
        assert!(args.run_id.is_none());
    }

    #[test]
    fn rejects_malformed_dates() {
        let err = Cli::try_parse_from(["workforce-etl", "run", "--start", "01/02/2025", "--end", "2025-01-31"])
            .unwrap_err();
        assert!(err.to_string().contains("YYYY-MM-DD"));
    }

    #[test]
    fn parses_period_generation_defaults() {
        let cli = Cli::try_parse_from([
            "workforce-etl",
            "periods",
            "generate",
            "--anchor",
            "2025-01-06",
            "--count",
            "4",
        ])
        .unwrap();

        let Command::Periods {
            command: PeriodsCommand::Generate(args),
        } = cli.command
        else {
            panic!("expected periods generate");
        };
        assert_eq!(args.length_days, 14);
        assert_eq!(args.count, 4);
        assert!(!args.apply);
    }
}
