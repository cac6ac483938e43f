//! Normalization of raw API payloads into warehouse-ready records.
//!
//! Every function here is pure: one raw record in, one normalized record or a
//! [`ValidationError`] out. Rejected records are collected as
//! [`DataQualityIssue`]s so a bad payload never stops the rest of the batch.

pub mod fields;
pub mod records;

pub use fields::{parse_timestamp, IdRef};
pub use records::{
    client_record, employee_record, position_record, region_record, shift_record, ClientRow,
    EmployeeRow, IntoRecord, PositionRow, RegionRow, ShiftRow,
};

use serde_json::Value;

use crate::warehouse::DataQualityIssue;

/// A JSON object keyed by column or API field name.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{entity} record is missing required field `{field}`")]
    MissingField {
        entity: &'static str,
        field: &'static str,
    },
    #[error("{entity} record has invalid `{field}`: {value}")]
    InvalidField {
        entity: &'static str,
        field: &'static str,
        value: String,
    },
}

/// Applies `transform` to every raw record, splitting successes from rejects.
pub fn transform_all<T, F>(
    entity: &str,
    natural_key_fields: &[&str],
    raws: Vec<Record>,
    transform: F,
) -> (Vec<T>, Vec<DataQualityIssue>)
where
    F: Fn(&Record) -> Result<T, ValidationError>,
{
    let mut accepted = Vec::with_capacity(raws.len());
    let mut rejected = Vec::new();

    for raw in raws {
        match transform(&raw) {
            Ok(row) => accepted.push(row),
            Err(err) => {
                let natural_key = fields::text(&raw, natural_key_fields);
                tracing::warn!(
                    entity,
                    natural_key = natural_key.as_deref().unwrap_or("-"),
                    error = %err,
                    "quarantining record"
                );
                rejected.push(DataQualityIssue {
                    entity: entity.to_string(),
                    natural_key,
                    reason: err.to_string(),
                    payload: Value::Object(raw),
                });
            }
        }
    }

    (accepted, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_are_collected_and_the_rest_continue() {
        let raws: Vec<Record> = vec![
            json!({"id": 1, "first_name": "Ada"}),
            json!({"first_name": "Nobody"}),
            json!({"id": "3", "first_name": "Grace"}),
        ]
        .into_iter()
        .filter_map(|value| value.as_object().cloned())
        .collect();

        let (rows, issues) = transform_all("employee", &["id", "employee_id"], raws, employee_record);

        assert_eq!(
            rows.iter().map(|row| row.employee_id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].entity, "employee");
        assert_eq!(issues[0].natural_key, None);
        assert!(issues[0].reason.contains("employee_id"));
        assert_eq!(issues[0].payload["first_name"], "Nobody");
    }
}
