mod batch;
mod cli;
mod infra;
mod periods;
mod sync;

use workforce_etl::error::AppError;

pub fn run() -> Result<(), AppError> {
    cli::run()
}
