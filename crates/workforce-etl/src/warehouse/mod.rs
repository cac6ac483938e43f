//! Dimensional warehouse: SCD2 dimensions, partitioned facts, billing periods,
//! batch provenance and the stores behind them.

pub mod batch;
pub mod facts;
pub mod memory;
pub mod periods;
pub mod postgres;
pub mod schema;
pub mod scd2;
pub mod store;

pub use batch::{BatchError, BatchStatus, BatchTracker, EtlBatch};
pub use facts::{FactLoadReport, FactLoader};
pub use memory::MemoryWarehouse;
pub use periods::{BillingPeriod, BillingPeriodResolver, PeriodError, PeriodId};
pub use postgres::PostgresWarehouse;
pub use schema::{
    DimensionSpec, FactSpec, CLIENT_DIMENSION, EMPLOYEE_DIMENSION, POSITION_DIMENSION,
    REGION_DIMENSION, SCHEMA_SQL, SHIFT_FACT,
};
pub use scd2::{values_equal, DimensionUpserter, UpsertStats};
pub use store::{
    BatchId, BatchStore, DataQualityIssue, DimensionStore, DimensionVersion, FactStore,
    PeriodStore, QualityLog, StoreError, SurrogateKey, Warehouse,
};
