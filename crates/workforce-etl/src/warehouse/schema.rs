use super::store::StoreError;

/// Idempotent DDL for the warehouse (`PostgreSQL` dialect).
///
/// `fact_shift` partitions are created on demand per billing period.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS etl_batches (
    batch_id BIGSERIAL PRIMARY KEY,
    batch_type TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('RUNNING', 'COMPLETED', 'FAILED')),
    started_at TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ,
    records_processed BIGINT NOT NULL DEFAULT 0,
    records_failed BIGINT NOT NULL DEFAULT 0,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS billing_periods (
    period_id BIGINT PRIMARY KEY,
    start_date DATE NOT NULL,
    end_date DATE NOT NULL,
    CHECK (start_date <= end_date)
);

CREATE TABLE IF NOT EXISTS dim_region (
    region_key BIGSERIAL PRIMARY KEY,
    region_id BIGINT NOT NULL,
    name TEXT,
    timezone TEXT,
    is_active BOOLEAN,
    valid_from TIMESTAMPTZ NOT NULL,
    valid_to TIMESTAMPTZ,
    is_current BOOLEAN NOT NULL DEFAULT TRUE,
    batch_id BIGINT NOT NULL REFERENCES etl_batches (batch_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS dim_region_current ON dim_region (region_id) WHERE is_current;

CREATE TABLE IF NOT EXISTS dim_employee (
    employee_key BIGSERIAL PRIMARY KEY,
    employee_id BIGINT NOT NULL,
    first_name TEXT,
    last_name TEXT,
    email TEXT,
    status TEXT,
    region_id BIGINT,
    position_id BIGINT,
    valid_from TIMESTAMPTZ NOT NULL,
    valid_to TIMESTAMPTZ,
    is_current BOOLEAN NOT NULL DEFAULT TRUE,
    batch_id BIGINT NOT NULL REFERENCES etl_batches (batch_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS dim_employee_current ON dim_employee (employee_id) WHERE is_current;

CREATE TABLE IF NOT EXISTS dim_client (
    client_key BIGSERIAL PRIMARY KEY,
    client_id BIGINT NOT NULL,
    name TEXT,
    region_id BIGINT,
    billing_code TEXT,
    is_active BOOLEAN,
    valid_from TIMESTAMPTZ NOT NULL,
    valid_to TIMESTAMPTZ,
    is_current BOOLEAN NOT NULL DEFAULT TRUE,
    batch_id BIGINT NOT NULL REFERENCES etl_batches (batch_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS dim_client_current ON dim_client (client_id) WHERE is_current;

CREATE TABLE IF NOT EXISTS dim_position (
    position_key BIGSERIAL PRIMARY KEY,
    position_id BIGINT NOT NULL,
    name TEXT,
    bill_rate NUMERIC(10, 2),
    pay_rate NUMERIC(10, 2),
    is_active BOOLEAN,
    valid_from TIMESTAMPTZ NOT NULL,
    valid_to TIMESTAMPTZ,
    is_current BOOLEAN NOT NULL DEFAULT TRUE,
    batch_id BIGINT NOT NULL REFERENCES etl_batches (batch_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS dim_position_current ON dim_position (position_id) WHERE is_current;

CREATE TABLE IF NOT EXISTS fact_shift (
    billing_period_id BIGINT NOT NULL,
    shift_id BIGINT NOT NULL,
    region_id BIGINT NOT NULL,
    client_id BIGINT NOT NULL,
    shift_date DATE NOT NULL,
    employee_id BIGINT,
    position_id BIGINT,
    status TEXT,
    start_time TIMESTAMPTZ NOT NULL,
    end_time TIMESTAMPTZ,
    hours NUMERIC(6, 2),
    bill_rate NUMERIC(10, 2),
    pay_rate NUMERIC(10, 2),
    raw_payload JSONB,
    etl_batch_id BIGINT NOT NULL,
    first_loaded_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (billing_period_id, shift_id)
) PARTITION BY LIST (billing_period_id);

CREATE TABLE IF NOT EXISTS etl_checkpoints (
    run_id TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    state JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (run_id, partition_key)
);

CREATE TABLE IF NOT EXISTS data_quality_issues (
    issue_id BIGSERIAL PRIMARY KEY,
    batch_id BIGINT NOT NULL REFERENCES etl_batches (batch_id),
    entity TEXT NOT NULL,
    natural_key TEXT,
    reason TEXT NOT NULL,
    payload JSONB NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_quality_batch ON data_quality_issues (batch_id);
";

/// Shape of one SCD2 dimension table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionSpec {
    pub entity: &'static str,
    pub table: &'static str,
    pub surrogate_key: &'static str,
    pub natural_key: &'static str,
    pub tracked_fields: &'static [&'static str],
}

pub const REGION_DIMENSION: DimensionSpec = DimensionSpec {
    entity: "region",
    table: "dim_region",
    surrogate_key: "region_key",
    natural_key: "region_id",
    tracked_fields: &["name", "timezone", "is_active"],
};

pub const EMPLOYEE_DIMENSION: DimensionSpec = DimensionSpec {
    entity: "employee",
    table: "dim_employee",
    surrogate_key: "employee_key",
    natural_key: "employee_id",
    tracked_fields: &[
        "first_name",
        "last_name",
        "email",
        "status",
        "region_id",
        "position_id",
    ],
};

pub const CLIENT_DIMENSION: DimensionSpec = DimensionSpec {
    entity: "client",
    table: "dim_client",
    surrogate_key: "client_key",
    natural_key: "client_id",
    tracked_fields: &["name", "region_id", "billing_code", "is_active"],
};

pub const POSITION_DIMENSION: DimensionSpec = DimensionSpec {
    entity: "position",
    table: "dim_position",
    surrogate_key: "position_key",
    natural_key: "position_id",
    tracked_fields: &["name", "bill_rate", "pay_rate", "is_active"],
};

/// Shape of a partitioned fact table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactSpec {
    pub entity: &'static str,
    pub table: &'static str,
    pub partition_key: &'static str,
    pub natural_id: &'static str,
    /// Written once when the row is created.
    pub fixed_fields: &'static [&'static str],
    /// Overwritten on every load.
    pub mutable_fields: &'static [&'static str],
    /// Must be present for a record to load at all.
    pub required_fields: &'static [&'static str],
}

pub const SHIFT_FACT: FactSpec = FactSpec {
    entity: "shift",
    table: "fact_shift",
    partition_key: "billing_period_id",
    natural_id: "shift_id",
    fixed_fields: &["region_id", "client_id", "shift_date"],
    mutable_fields: &[
        "employee_id",
        "position_id",
        "status",
        "start_time",
        "end_time",
        "hours",
        "bill_rate",
        "pay_rate",
        "raw_payload",
    ],
    required_fields: &["region_id", "client_id", "shift_date", "start_time"],
};

impl DimensionSpec {
    pub fn validate(&self) -> Result<(), StoreError> {
        validate_identifier(self.table)?;
        validate_identifier(self.surrogate_key)?;
        validate_identifier(self.natural_key)?;
        self.tracked_fields
            .iter()
            .try_for_each(|field| validate_identifier(field))
    }
}

impl FactSpec {
    pub fn validate(&self) -> Result<(), StoreError> {
        validate_identifier(self.table)?;
        validate_identifier(self.partition_key)?;
        validate_identifier(self.natural_id)?;
        self.fixed_fields
            .iter()
            .chain(self.mutable_fields)
            .try_for_each(|field| validate_identifier(field))
    }

    /// Columns taken from the incoming record, keys first.
    pub fn record_columns(&self) -> Vec<&'static str> {
        let mut columns = vec![self.partition_key, self.natural_id];
        columns.extend(self.fixed_fields);
        columns.extend(self.mutable_fields);
        columns
    }

    pub fn partition_table(&self, partition: i64) -> String {
        if partition < 0 {
            format!("{}_pm{}", self.table, partition.unsigned_abs())
        } else {
            format!("{}_p{}", self.table, partition)
        }
    }
}

/// Accepts lower-case snake_case names that are safe to splice into SQL.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|first| first.is_ascii_lowercase() || first == '_');
    let valid_rest = chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');
    if valid_start && valid_rest && name.len() <= 63 {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_specs_use_safe_identifiers() {
        for spec in [
            REGION_DIMENSION,
            EMPLOYEE_DIMENSION,
            CLIENT_DIMENSION,
            POSITION_DIMENSION,
        ] {
            spec.validate().expect("dimension identifiers are valid");
            assert!(SCHEMA_SQL.contains(&format!("CREATE TABLE IF NOT EXISTS {}", spec.table)));
        }
        SHIFT_FACT.validate().expect("fact identifiers are valid");
    }

    #[test]
    fn identifiers_with_quotes_or_spaces_are_rejected() {
        assert!(validate_identifier("dim_employee").is_ok());
        assert!(validate_identifier("dim employee").is_err());
        assert!(validate_identifier("dim_employee;drop").is_err());
        assert!(validate_identifier("Dim").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn partition_tables_are_named_after_the_period() {
        assert_eq!(SHIFT_FACT.partition_table(20250106), "fact_shift_p20250106");
        assert_eq!(
            SHIFT_FACT.record_columns()[..3],
            ["billing_period_id", "shift_id", "region_id"]
        );
    }
}
