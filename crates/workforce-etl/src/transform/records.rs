use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;

use super::fields::{decimal, flag, id_ref, required_id, text, timestamp};
use super::{Record, ValidationError};
use crate::warehouse::PeriodId;

/// Normalized row that can be handed to the warehouse as a column map.
pub trait IntoRecord {
    fn natural_key(&self) -> i64;
    fn into_record(self) -> Record;
}

fn to_record<S: Serialize>(row: &S) -> Record {
    match serde_json::to_value(row) {
        Ok(Value::Object(map)) => map,
        _ => Record::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionRow {
    pub region_id: i64,
    pub name: Option<String>,
    pub timezone: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmployeeRow {
    pub employee_id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub status: Option<String>,
    pub region_id: Option<i64>,
    pub position_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientRow {
    pub client_id: i64,
    pub name: Option<String>,
    pub region_id: Option<i64>,
    pub billing_code: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionRow {
    pub position_id: i64,
    pub name: Option<String>,
    pub bill_rate: Option<f64>,
    pub pay_rate: Option<f64>,
    pub is_active: Option<bool>,
}

/// A shift after normalization, before its billing period is known.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShiftRow {
    pub shift_id: i64,
    pub region_id: Option<i64>,
    pub client_id: Option<i64>,
    pub employee_id: Option<i64>,
    pub position_id: Option<i64>,
    pub status: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub shift_date: NaiveDate,
    pub hours: Option<f64>,
    pub bill_rate: Option<f64>,
    pub pay_rate: Option<f64>,
    pub raw_payload: Value,
}

impl ShiftRow {
    /// Fact row for `fact_shift`, keyed by its billing period.
    pub fn into_fact(self, period: PeriodId) -> Record {
        let mut record = to_record(&self);
        record.insert("billing_period_id".to_string(), Value::from(period.0));
        record
    }
}

macro_rules! into_record {
    ($row:ty, $key:ident) => {
        impl IntoRecord for $row {
            fn natural_key(&self) -> i64 {
                self.$key
            }

            fn into_record(self) -> Record {
                to_record(&self)
            }
        }
    };
}

into_record!(RegionRow, region_id);
into_record!(EmployeeRow, employee_id);
into_record!(ClientRow, client_id);
into_record!(PositionRow, position_id);

pub fn region_record(raw: &Record) -> Result<RegionRow, ValidationError> {
    Ok(RegionRow {
        region_id: required_id(raw, "region", "region_id", &["id", "region_id"])?,
        name: text(raw, &["name"]),
        timezone: text(raw, &["timezone", "time_zone"]),
        is_active: flag(raw, &["is_active", "active"]),
    })
}

pub fn employee_record(raw: &Record) -> Result<EmployeeRow, ValidationError> {
    Ok(EmployeeRow {
        employee_id: required_id(raw, "employee", "employee_id", &["id", "employee_id"])?,
        first_name: text(raw, &["first_name", "firstName"]),
        last_name: text(raw, &["last_name", "lastName"]),
        email: text(raw, &["email"]).map(|email| email.to_ascii_lowercase()),
        status: text(raw, &["status"]),
        region_id: id_ref(raw, &["region_id", "region"]).id(),
        position_id: id_ref(raw, &["position_id", "position"]).id(),
    })
}

pub fn client_record(raw: &Record) -> Result<ClientRow, ValidationError> {
    Ok(ClientRow {
        client_id: required_id(raw, "client", "client_id", &["id", "client_id"])?,
        name: text(raw, &["name"]),
        region_id: id_ref(raw, &["region_id", "region"]).id(),
        billing_code: text(raw, &["billing_code", "code"]),
        is_active: flag(raw, &["is_active", "active"]),
    })
}

pub fn position_record(raw: &Record) -> Result<PositionRow, ValidationError> {
    Ok(PositionRow {
        position_id: required_id(raw, "position", "position_id", &["id", "position_id"])?,
        name: text(raw, &["name", "title"]),
        bill_rate: decimal(raw, "position", "bill_rate", &["bill_rate"])?,
        pay_rate: decimal(raw, "position", "pay_rate", &["pay_rate"])?,
        is_active: flag(raw, &["is_active", "active"]),
    })
}

pub fn shift_record(raw: &Record) -> Result<ShiftRow, ValidationError> {
    let shift_id = required_id(raw, "shift", "shift_id", &["id", "shift_id"])?;
    let start_time = timestamp(raw, "shift", "start_time", &["start_time", "start"])?.ok_or(
        ValidationError::MissingField {
            entity: "shift",
            field: "start_time",
        },
    )?;
    let end_time = timestamp(raw, "shift", "end_time", &["end_time", "end"])?;

    if let Some(end) = end_time {
        if end < start_time {
            return Err(ValidationError::InvalidField {
                entity: "shift",
                field: "end_time",
                value: end.to_rfc3339(),
            });
        }
    }

    let hours = match decimal(raw, "shift", "hours", &["hours"])? {
        Some(hours) => Some(hours),
        None => end_time.map(|end| {
            let minutes = (end - start_time).num_minutes() as f64;
            (minutes / 60.0 * 100.0).round() / 100.0
        }),
    };

    Ok(ShiftRow {
        shift_id,
        region_id: id_ref(raw, &["region_id", "region"]).id(),
        client_id: id_ref(raw, &["client_id", "client"]).id(),
        employee_id: id_ref(raw, &["employee_id", "employee"]).id(),
        position_id: id_ref(raw, &["position_id", "position"]).id(),
        status: text(raw, &["status"]).map(|status| status.to_ascii_uppercase()),
        start_time,
        end_time,
        shift_date: start_time.date_naive(),
        hours,
        bill_rate: decimal(raw, "shift", "bill_rate", &["bill_rate"])?,
        pay_rate: decimal(raw, "shift", "pay_rate", &["pay_rate"])?,
        raw_payload: Value::Object(raw.clone()),
    })
}
