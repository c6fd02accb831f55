//! Field kind to GraphQL scalar mapping, in both directions.
//!
//! The mapping is total: kinds without a dedicated scalar are exposed as
//! `JSON`. Inputs are normalised to the storage representation (ISO dates,
//! decimal strings, hyphenated UUIDs, raw choice values).

use std::str::FromStr;

use async_graphql::dynamic::{Scalar, SchemaBuilder, TypeRef};
use async_graphql::{Name, Number, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use super::ChoiceEnums;
use crate::introspect::FieldKind;

pub const DATE: &str = "Date";
pub const DATE_TIME: &str = "DateTime";
pub const TIME: &str = "Time";
pub const DECIMAL: &str = "Decimal";
pub const UUID: &str = "UUID";
pub const JSON: &str = "JSON";

/// Register the custom scalars every generated schema shares.
pub fn register(builder: SchemaBuilder) -> SchemaBuilder {
    builder
        .register(
            Scalar::new(DATE)
                .description("Calendar date, `YYYY-MM-DD`")
                .validator(|v| matches!(v, Value::String(s) if parse_date(s).is_some())),
        )
        .register(
            Scalar::new(DATE_TIME)
                .description("ISO-8601 date and time")
                .validator(|v| matches!(v, Value::String(s) if parse_datetime(s).is_some())),
        )
        .register(
            Scalar::new(TIME)
                .description("Time of day, `HH:MM[:SS]`")
                .validator(|v| matches!(v, Value::String(s) if parse_time(s).is_some())),
        )
        .register(
            Scalar::new(DECIMAL)
                .description("Arbitrary precision decimal, serialized as a string")
                .validator(|v| match v {
                    Value::String(s) => Decimal::from_str(s).is_ok(),
                    Value::Number(_) => true,
                    _ => false,
                }),
        )
        .register(
            Scalar::new(UUID)
                .description("Hyphenated UUID")
                .specified_by_url("https://datatracker.ietf.org/doc/html/rfc4122")
                .validator(|v| matches!(v, Value::String(s) if uuid::Uuid::parse_str(s).is_ok())),
        )
        .register(Scalar::new(JSON).description("Arbitrary JSON value"))
}

/// Named GraphQL type for a field kind.
pub fn type_name(kind: &FieldKind, enums: &ChoiceEnums) -> String {
    match kind {
        FieldKind::Text => TypeRef::STRING.to_string(),
        FieldKind::Integer => TypeRef::INT.to_string(),
        FieldKind::Float => TypeRef::FLOAT.to_string(),
        FieldKind::Boolean => TypeRef::BOOLEAN.to_string(),
        FieldKind::Date => DATE.to_string(),
        FieldKind::DateTime => DATE_TIME.to_string(),
        FieldKind::Time => TIME.to_string(),
        FieldKind::Decimal => DECIMAL.to_string(),
        FieldKind::Identifier => TypeRef::ID.to_string(),
        FieldKind::Uuid => UUID.to_string(),
        FieldKind::Enumeration(choices) => enums
            .get(choices)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| TypeRef::STRING.to_string()),
        FieldKind::Json | FieldKind::Other(_) => JSON.to_string(),
    }
}

/// Convert a stored value for output.
pub fn to_output(kind: &FieldKind, value: &JsonValue, enums: &ChoiceEnums) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    match kind {
        FieldKind::Boolean => match value {
            JsonValue::Bool(b) => Value::Boolean(*b),
            JsonValue::Number(n) => Value::Boolean(n.as_i64().unwrap_or(0) != 0),
            JsonValue::String(s) => Value::Boolean(matches!(s.as_str(), "true" | "1")),
            other => json_to_value(other),
        },
        FieldKind::Integer => match value {
            JsonValue::String(s) => s
                .parse::<i64>()
                .map(|i| Value::Number(i.into()))
                .unwrap_or_else(|_| Value::String(s.clone())),
            other => json_to_value(other),
        },
        FieldKind::Float => match value.as_f64().and_then(Number::from_f64) {
            Some(n) => Value::Number(n),
            None => json_to_value(value),
        },
        FieldKind::Decimal => match value {
            JsonValue::Number(n) => Value::String(n.to_string()),
            other => json_to_value(other),
        },
        FieldKind::Identifier => match value {
            JsonValue::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        },
        FieldKind::Enumeration(choices) => {
            let raw = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            match enums.get(choices).and_then(|e| e.item_for(&raw)) {
                Some(item) => Value::Enum(Name::new(item)),
                None => Value::Null,
            }
        }
        FieldKind::Json | FieldKind::Other(_) => match value {
            // JSON columns come back from SQL stores as text
            JsonValue::String(s) => serde_json::from_str::<JsonValue>(s)
                .map(|parsed| json_to_value(&parsed))
                .unwrap_or_else(|_| Value::String(s.clone())),
            other => json_to_value(other),
        },
        FieldKind::Text | FieldKind::Date | FieldKind::DateTime | FieldKind::Time | FieldKind::Uuid => {
            match value {
                JsonValue::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            }
        }
    }
}

pub fn json_to_value(value: &JsonValue) -> Value {
    Value::from_json(value.clone()).unwrap_or(Value::Null)
}

pub fn value_to_json(value: &Value) -> JsonValue {
    value.clone().into_json().unwrap_or(JsonValue::Null)
}

/// Validate and normalise an input value for storage. The error names the
/// expected kind.
pub fn coerce_input(kind: &FieldKind, value: &Value, enums: &ChoiceEnums) -> Result<JsonValue, String> {
    let mismatch = || kind.label().to_string();
    match (kind, value) {
        (_, Value::Null) => Ok(JsonValue::Null),
        (FieldKind::Text, Value::String(s)) => Ok(JsonValue::String(s.clone())),
        (FieldKind::Integer, Value::Number(n)) => n.as_i64().map(JsonValue::from).ok_or_else(mismatch),
        (FieldKind::Integer, Value::String(s)) => s.parse::<i64>().map(JsonValue::from).map_err(|_| mismatch()),
        (FieldKind::Float, Value::Number(n)) => n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .ok_or_else(mismatch),
        (FieldKind::Boolean, Value::Boolean(b)) => Ok(JsonValue::Bool(*b)),
        (FieldKind::Date, Value::String(s)) => parse_date(s)
            .map(|d| JsonValue::String(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(mismatch),
        (FieldKind::DateTime, Value::String(s)) => parse_datetime(s)
            .map(|dt| JsonValue::String(dt.to_rfc3339_opts(SecondsFormat::Micros, true)))
            .ok_or_else(mismatch),
        (FieldKind::Time, Value::String(s)) => parse_time(s)
            .map(|t| JsonValue::String(t.format("%H:%M:%S").to_string()))
            .ok_or_else(mismatch),
        (FieldKind::Decimal, Value::String(s)) => Decimal::from_str(s.trim())
            .map(|d| JsonValue::String(d.to_string()))
            .map_err(|_| mismatch()),
        (FieldKind::Decimal, Value::Number(n)) => Decimal::from_str(&n.to_string())
            .map(|d| JsonValue::String(d.to_string()))
            .map_err(|_| mismatch()),
        (FieldKind::Uuid, Value::String(s)) => uuid::Uuid::parse_str(s)
            .map(|u| JsonValue::String(u.hyphenated().to_string()))
            .map_err(|_| mismatch()),
        (FieldKind::Identifier, Value::String(s)) => Ok(JsonValue::String(s.clone())),
        (FieldKind::Identifier, Value::Number(n)) => Ok(JsonValue::String(n.to_string())),
        (FieldKind::Enumeration(choices), Value::Enum(item)) => enums
            .get(choices)
            .and_then(|e| e.value_for(item.as_str()))
            .map(|raw| JsonValue::String(raw.to_string()))
            .ok_or_else(mismatch),
        (FieldKind::Enumeration(choices), Value::String(s)) => {
            let known = choices.iter().any(|c| &c.value == s)
                || enums.get(choices).and_then(|e| e.value_for(s)).is_some();
            if !known {
                return Err(mismatch());
            }
            let raw = enums
                .get(choices)
                .and_then(|e| e.value_for(s))
                .map(str::to_string)
                .unwrap_or_else(|| s.clone());
            Ok(JsonValue::String(raw))
        }
        (FieldKind::Json | FieldKind::Other(_), other) => Ok(value_to_json(other)),
        _ => Err(mismatch()),
    }
}

/// Short description of a value for mismatch messages.
pub fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("string {s:?}"),
        Value::Boolean(b) => format!("boolean {b}"),
        Value::Binary(_) => "binary".into(),
        Value::Enum(e) => format!("enum {e}"),
        Value::List(_) => "list".into(),
        Value::Object(_) => "object".into(),
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// Value for a computed default (`now`, `today`, `uuid`).
pub fn computed_default(generator: &str, kind: &FieldKind) -> Option<JsonValue> {
    let now = Utc::now();
    Some(match generator {
        "now" => match kind {
            FieldKind::Date => JsonValue::String(now.format("%Y-%m-%d").to_string()),
            FieldKind::Time => JsonValue::String(now.format("%H:%M:%S").to_string()),
            _ => JsonValue::String(now.to_rfc3339_opts(SecondsFormat::Micros, true)),
        },
        "today" => JsonValue::String(now.format("%Y-%m-%d").to_string()),
        "uuid" => JsonValue::String(uuid::Uuid::new_v4().hyphenated().to_string()),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Choice;
    use serde_json::json;

    fn status_enums() -> (FieldKind, ChoiceEnums) {
        let choices = vec![Choice::new("draft"), Choice::new("in-review")];
        let mut enums = ChoiceEnums::default();
        enums.register(|| "ArticleStatus".into(), &choices);
        (FieldKind::Enumeration(choices), enums)
    }

    #[test]
    fn test_coerce_normalises_storage_form() {
        let enums = ChoiceEnums::default();
        assert_eq!(
            coerce_input(&FieldKind::Decimal, &Value::String(" 10.50".into()), &enums),
            Ok(json!("10.50"))
        );
        assert_eq!(
            coerce_input(&FieldKind::DateTime, &Value::String("2024-03-01T10:00:00+02:00".into()), &enums),
            Ok(json!("2024-03-01T08:00:00.000000Z"))
        );
        assert_eq!(
            coerce_input(&FieldKind::Integer, &Value::String("x".into()), &enums),
            Err("an integer".to_string())
        );
    }

    #[test]
    fn test_enum_items_map_both_ways() {
        let (kind, enums) = status_enums();
        assert_eq!(
            coerce_input(&kind, &Value::Enum(Name::new("IN_REVIEW")), &enums),
            Ok(json!("in-review"))
        );
        assert_eq!(coerce_input(&kind, &Value::String("draft".into()), &enums), Ok(json!("draft")));
        assert_eq!(to_output(&kind, &json!("in-review"), &enums), Value::Enum(Name::new("IN_REVIEW")));
    }

    #[test]
    fn test_sql_shaped_values_render_by_kind() {
        let enums = ChoiceEnums::default();
        assert_eq!(to_output(&FieldKind::Boolean, &json!(1), &enums), Value::Boolean(true));
        assert_eq!(
            to_output(&FieldKind::Json, &json!("{\"a\":1}"), &enums),
            json_to_value(&json!({"a": 1}))
        );
        assert_eq!(to_output(&FieldKind::Identifier, &json!(7), &enums), Value::String("7".into()));
    }
}
