use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use super::{Record, ValidationError};

/// Reference to another entity. The API sends these either as a bare id
/// (`"region": 4`, `"region_id": "4"`) or as an embedded object (`"region": {"id": 4}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdRef {
    Id(i64),
    Missing,
}

impl IdRef {
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Number(number)) => number
                .as_i64()
                .or_else(|| {
                    number
                        .as_f64()
                        .filter(|float| float.fract() == 0.0)
                        .map(|float| float as i64)
                })
                .map_or(IdRef::Missing, IdRef::Id),
            Some(Value::String(text)) => text
                .trim()
                .parse::<i64>()
                .map_or(IdRef::Missing, IdRef::Id),
            Some(Value::Object(object)) => match object.get("id") {
                Some(Value::Object(_)) | None => IdRef::Missing,
                inner => IdRef::from_value(inner),
            },
            _ => IdRef::Missing,
        }
    }

    pub fn id(self) -> Option<i64> {
        match self {
            IdRef::Id(id) => Some(id),
            IdRef::Missing => None,
        }
    }
}

/// First present, non-null value among `names`.
pub fn lookup<'a>(raw: &'a Record, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| raw.get(*name))
        .find(|value| !value.is_null())
}

pub fn id_ref(raw: &Record, names: &[&str]) -> IdRef {
    names
        .iter()
        .map(|name| IdRef::from_value(raw.get(*name)))
        .find(|id| matches!(id, IdRef::Id(_)))
        .unwrap_or(IdRef::Missing)
}

pub fn required_id(
    raw: &Record,
    entity: &'static str,
    field: &'static str,
    names: &[&str],
) -> Result<i64, ValidationError> {
    id_ref(raw, names)
        .id()
        .ok_or(ValidationError::MissingField { entity, field })
}

pub fn text(raw: &Record, names: &[&str]) -> Option<String> {
    match lookup(raw, names)? {
        Value::String(value) => {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

pub fn flag(raw: &Record, names: &[&str]) -> Option<bool> {
    match lookup(raw, names)? {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_i64().map(|value| value != 0),
        Value::String(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" | "active" => Some(true),
            "false" | "f" | "no" | "n" | "0" | "inactive" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Numeric field that may arrive as a JSON number or a decimal string
/// such as `"18.50"` or `"$18.50"`.
pub fn decimal(
    raw: &Record,
    entity: &'static str,
    field: &'static str,
    names: &[&str],
) -> Result<Option<f64>, ValidationError> {
    match lookup(raw, names) {
        None => Ok(None),
        Some(Value::Number(number)) => Ok(number.as_f64()),
        Some(Value::String(value)) => {
            let cleaned: String = value
                .trim()
                .chars()
                .filter(|ch| !matches!(ch, '$' | ',' | ' '))
                .collect();
            if cleaned.is_empty() {
                return Ok(None);
            }
            cleaned
                .parse::<f64>()
                .map(Some)
                .map_err(|_| ValidationError::InvalidField {
                    entity,
                    field,
                    value: value.clone(),
                })
        }
        Some(other) => Err(ValidationError::InvalidField {
            entity,
            field,
            value: other.to_string(),
        }),
    }
}

pub fn timestamp(
    raw: &Record,
    entity: &'static str,
    field: &'static str,
    names: &[&str],
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match lookup(raw, names) {
        None => Ok(None),
        Some(Value::String(value)) if value.trim().is_empty() => Ok(None),
        Some(Value::String(value)) => {
            parse_timestamp(value)
                .map(Some)
                .ok_or_else(|| ValidationError::InvalidField {
                    entity,
                    field,
                    value: value.clone(),
                })
        }
        Some(other) => Err(ValidationError::InvalidField {
            entity,
            field,
            value: other.to_string(),
        }),
    }
}

/// RFC 3339 with an offset, a naive date-time taken as UTC, or a bare date at
/// midnight UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
