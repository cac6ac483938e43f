//! Batch ETL for workforce data.
//!
//! Shifts, employees, clients, positions and regions are pulled from a paginated
//! OAuth2-protected REST API and loaded into a Postgres warehouse. Dimensions are
//! versioned with SCD Type 2 semantics, shift facts are upserted per billing period
//! and every run is tracked as a batch that can resume from checkpoints.

pub mod api;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod telemetry;
pub mod transform;
pub mod warehouse;
