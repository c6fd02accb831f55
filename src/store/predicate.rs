//! Store-level predicates produced by the filter compiler.

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use super::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    IEq,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Value is a JSON array
    In,
    /// Value is a JSON bool
    IsNull,
    /// Value is a two element array, bounds inclusive
    Range,
}

impl CompareOp {
    /// Filter input suffix; `None` for plain equality.
    pub fn suffix(&self) -> Option<&'static str> {
        Some(match self {
            CompareOp::Eq => return None,
            CompareOp::IEq => "iexact",
            CompareOp::Contains => "contains",
            CompareOp::IContains => "icontains",
            CompareOp::StartsWith => "startswith",
            CompareOp::IStartsWith => "istartswith",
            CompareOp::EndsWith => "endswith",
            CompareOp::IEndsWith => "iendswith",
            CompareOp::Gt => "gt",
            CompareOp::Gte => "gte",
            CompareOp::Lt => "lt",
            CompareOp::Lte => "lte",
            CompareOp::In => "in",
            CompareOp::IsNull => "isnull",
            CompareOp::Range => "range",
        })
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "exact" => CompareOp::Eq,
            "iexact" => CompareOp::IEq,
            "contains" => CompareOp::Contains,
            "icontains" => CompareOp::IContains,
            "startswith" => CompareOp::StartsWith,
            "istartswith" => CompareOp::IStartsWith,
            "endswith" => CompareOp::EndsWith,
            "iendswith" => CompareOp::IEndsWith,
            "gt" => CompareOp::Gt,
            "gte" => CompareOp::Gte,
            "lt" => CompareOp::Lt,
            "lte" => CompareOp::Lte,
            "in" => CompareOp::In,
            "isnull" => CompareOp::IsNull,
            "range" => CompareOp::Range,
            _ => return None,
        })
    }
}

/// How stored values of a column compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueClass {
    Text,
    Number,
    Decimal,
    Boolean,
    /// ISO-8601 dates, times and datetimes
    Temporal,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub column: String,
    pub op: CompareOp,
    pub value: JsonValue,
    pub class: ValueClass,
}

/// How a relationship filter reaches the related table.
#[derive(Debug, Clone, PartialEq)]
pub enum Join {
    /// `this.column = related.related_key`
    Forward {
        column: String,
        table: String,
        related_key: String,
    },
    /// `related.column = this.key`
    Reverse {
        table: String,
        column: String,
        key: String,
    },
    /// Through a join table holding `(source_column, target_column)` pairs
    Through {
        through: String,
        source_column: String,
        target_column: String,
        key: String,
        table: String,
        related_key: String,
    },
}

impl Join {
    pub fn related_table(&self) -> &str {
        match self {
            Join::Forward { table, .. } | Join::Reverse { table, .. } | Join::Through { table, .. } => {
                table
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Predicate {
    #[default]
    All,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare(Comparison),
    /// Some related row matches the inner predicate
    Related { join: Join, predicate: Box<Predicate> },
}

impl Predicate {
    pub fn compare(column: impl Into<String>, op: CompareOp, value: JsonValue, class: ValueClass) -> Self {
        Predicate::Compare(Comparison {
            column: column.into(),
            op,
            value,
            class,
        })
    }

    pub fn equals(column: impl Into<String>, value: JsonValue) -> Self {
        let class = match &value {
            JsonValue::Number(_) => ValueClass::Number,
            JsonValue::Bool(_) => ValueClass::Boolean,
            _ => ValueClass::Text,
        };
        Self::compare(column, CompareOp::Eq, value, class)
    }

    /// Conjunction, flattening nested `And` and dropping `All`.
    pub fn and(self, other: Predicate) -> Predicate {
        match (self, other) {
            (Predicate::All, p) | (p, Predicate::All) => p,
            (Predicate::And(mut a), Predicate::And(b)) => {
                a.extend(b);
                Predicate::And(a)
            }
            (Predicate::And(mut a), p) => {
                a.push(p);
                Predicate::And(a)
            }
            (p, Predicate::And(mut b)) => {
                b.insert(0, p);
                Predicate::And(b)
            }
            (a, b) => Predicate::And(vec![a, b]),
        }
    }

    pub fn all_of(parts: Vec<Predicate>) -> Predicate {
        parts.into_iter().fold(Predicate::All, Predicate::and)
    }

    /// Matches no row.
    pub fn nothing() -> Predicate {
        Predicate::Or(Vec::new())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Predicate::All)
    }

    /// Evaluate against `row`; `related` looks up rows of other tables.
    pub fn matches(&self, row: &Record, related: &dyn Fn(&str) -> Vec<Record>) -> bool {
        match self {
            Predicate::All => true,
            Predicate::And(parts) => parts.iter().all(|p| p.matches(row, related)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(row, related)),
            Predicate::Not(inner) => !inner.matches(row, related),
            Predicate::Compare(cmp) => cmp.matches(row.get(&cmp.column).unwrap_or(&JsonValue::Null)),
            Predicate::Related { join, predicate } => match join {
                Join::Forward {
                    column,
                    table,
                    related_key,
                } => {
                    let Some(fk) = row.get(column).filter(|v| !v.is_null()) else {
                        return false;
                    };
                    related(table).iter().any(|r| {
                        r.get(related_key).is_some_and(|k| loosely_equal(k, fk))
                            && predicate.matches(r, related)
                    })
                }
                Join::Reverse { table, column, key } => {
                    let Some(id) = row.get(key) else {
                        return false;
                    };
                    related(table).iter().any(|r| {
                        r.get(column).is_some_and(|v| loosely_equal(v, id)) && predicate.matches(r, related)
                    })
                }
                Join::Through {
                    through,
                    source_column,
                    target_column,
                    key,
                    table,
                    related_key,
                } => {
                    let Some(id) = row.get(key) else {
                        return false;
                    };
                    let targets: Vec<JsonValue> = related(through)
                        .iter()
                        .filter(|link| link.get(source_column).is_some_and(|v| loosely_equal(v, id)))
                        .filter_map(|link| link.get(target_column).cloned())
                        .collect();
                    related(table).iter().any(|r| {
                        r.get(related_key)
                            .is_some_and(|k| targets.iter().any(|t| loosely_equal(t, k)))
                            && predicate.matches(r, related)
                    })
                }
            },
        }
    }
}

impl Comparison {
    /// A null stored value satisfies nothing but `isnull: true`.
    pub fn matches(&self, stored: &JsonValue) -> bool {
        if self.op == CompareOp::IsNull {
            return stored.is_null() == self.value.as_bool().unwrap_or(true);
        }
        if stored.is_null() {
            return false;
        }
        let class = self.class;
        match self.op {
            CompareOp::Eq => compare_values(stored, &self.value, class) == Some(Ordering::Equal),
            CompareOp::IEq => lower(stored) == lower(&self.value),
            CompareOp::Contains => text(stored).contains(&text(&self.value)),
            CompareOp::IContains => lower(stored).contains(&lower(&self.value)),
            CompareOp::StartsWith => text(stored).starts_with(&text(&self.value)),
            CompareOp::IStartsWith => lower(stored).starts_with(&lower(&self.value)),
            CompareOp::EndsWith => text(stored).ends_with(&text(&self.value)),
            CompareOp::IEndsWith => lower(stored).ends_with(&lower(&self.value)),
            CompareOp::Gt => compare_values(stored, &self.value, class) == Some(Ordering::Greater),
            CompareOp::Gte => matches!(
                compare_values(stored, &self.value, class),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CompareOp::Lt => compare_values(stored, &self.value, class) == Some(Ordering::Less),
            CompareOp::Lte => matches!(
                compare_values(stored, &self.value, class),
                Some(Ordering::Less | Ordering::Equal)
            ),
            CompareOp::In => self.value.as_array().is_some_and(|items| {
                items
                    .iter()
                    .any(|item| compare_values(stored, item, class) == Some(Ordering::Equal))
            }),
            CompareOp::Range => match self.value.as_array().map(Vec::as_slice) {
                Some([low, high]) => {
                    matches!(
                        compare_values(stored, low, class),
                        Some(Ordering::Greater | Ordering::Equal)
                    ) && matches!(
                        compare_values(stored, high, class),
                        Some(Ordering::Less | Ordering::Equal)
                    )
                }
                _ => false,
            },
            CompareOp::IsNull => unreachable!("handled above"),
        }
    }
}

fn text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lower(value: &JsonValue) -> String {
    text(value).to_lowercase()
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.parse().ok(),
        JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_i64().map(|i| i != 0),
        JsonValue::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_decimal(value: &JsonValue) -> Option<Decimal> {
    match value {
        JsonValue::String(s) => Decimal::from_str(s).ok(),
        JsonValue::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

/// Ids may arrive as strings (GraphQL `ID`) while rows store integers.
pub fn loosely_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(_), JsonValue::String(_)) | (JsonValue::String(_), JsonValue::Number(_)) => {
            text(a) == text(b)
        }
        _ => a == b,
    }
}

/// A parsed temporal value. Dates and datetimes share one timeline in UTC.
enum Temporal {
    Moment(NaiveDateTime),
    Time(NaiveTime),
}

fn as_temporal(value: &JsonValue) -> Option<Temporal> {
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(Temporal::Moment(dt.naive_utc()));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Temporal::Moment(dt));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Temporal::Moment(date.and_time(NaiveTime::MIN)));
    }
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
        .map(Temporal::Time)
}

/// `None` when either side does not parse or a time meets a date.
fn compare_temporal(stored: &JsonValue, operand: &JsonValue) -> Option<Ordering> {
    match (as_temporal(stored)?, as_temporal(operand)?) {
        (Temporal::Moment(a), Temporal::Moment(b)) => Some(a.cmp(&b)),
        (Temporal::Time(a), Temporal::Time(b)) => Some(a.cmp(&b)),
        _ => None,
    }
}

/// Compare a stored value with an operand under a value class.
pub fn compare_values(stored: &JsonValue, operand: &JsonValue, class: ValueClass) -> Option<Ordering> {
    match class {
        ValueClass::Number => as_number(stored)?.partial_cmp(&as_number(operand)?),
        ValueClass::Decimal => Some(as_decimal(stored)?.cmp(&as_decimal(operand)?)),
        ValueClass::Boolean => Some(as_bool(stored)?.cmp(&as_bool(operand)?)),
        ValueClass::Temporal => {
            compare_temporal(stored, operand).or_else(|| Some(text(stored).cmp(&text(operand))))
        }
        ValueClass::Text => Some(text(stored).cmp(&text(operand))),
        ValueClass::Json => (stored == operand).then_some(Ordering::Equal),
    }
}

/// Total order used for sorting rows: nulls first, then by JSON type.
pub fn sort_order(a: &JsonValue, b: &JsonValue) -> Ordering {
    fn rank(v: &JsonValue) -> u8 {
        match v {
            JsonValue::Null => 0,
            JsonValue::Bool(_) => 1,
            JsonValue::Number(_) => 2,
            JsonValue::String(_) => 3,
            JsonValue::Array(_) => 4,
            JsonValue::Object(_) => 5,
        }
    }
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn no_tables(_: &str) -> Vec<Record> {
        Vec::new()
    }

    #[test]
    fn test_null_fails_everything_but_isnull() {
        let r = row(json!({"name": null}));
        let contains = Predicate::compare("name", CompareOp::Contains, json!(""), ValueClass::Text);
        assert!(!contains.matches(&r, &no_tables));
        let isnull = Predicate::compare("name", CompareOp::IsNull, json!(true), ValueClass::Text);
        assert!(isnull.matches(&r, &no_tables));
        let negated = Predicate::Not(Box::new(contains));
        assert!(negated.matches(&r, &no_tables));
    }

    #[test]
    fn test_temporal_comparison_uses_the_instant() {
        let r = row(json!({"at": "2024-03-01T10:00:00+02:00", "opens": "9:30:00"}));
        let same = Predicate::compare("at", CompareOp::Eq, json!("2024-03-01T08:00:00Z"), ValueClass::Temporal);
        assert!(same.matches(&r, &no_tables));
        let later = Predicate::compare("at", CompareOp::Lt, json!("2024-03-01T09:30:00Z"), ValueClass::Temporal);
        assert!(later.matches(&r, &no_tables));
        let day = Predicate::compare("at", CompareOp::Gte, json!("2024-03-01"), ValueClass::Temporal);
        assert!(day.matches(&r, &no_tables));
        // as text "9:30:00" sorts after "10:00:00"
        let before_ten = Predicate::compare("opens", CompareOp::Lt, json!("10:00:00"), ValueClass::Temporal);
        assert!(before_ten.matches(&r, &no_tables));
    }

    #[test]
    fn test_decimal_comparison_is_numeric() {
        let r = row(json!({"price": "10.50"}));
        let gt = Predicate::compare("price", CompareOp::Gt, json!("9.99"), ValueClass::Decimal);
        assert!(gt.matches(&r, &no_tables));
    }

    #[test]
    fn test_forward_join() {
        let categories = vec![row(json!({"id": 1, "name": "Books"}))];
        let lookup = move |table: &str| {
            if table == "catalog_category" {
                categories.clone()
            } else {
                Vec::new()
            }
        };
        let pred = Predicate::Related {
            join: Join::Forward {
                column: "category_id".into(),
                table: "catalog_category".into(),
                related_key: "id".into(),
            },
            predicate: Box::new(Predicate::equals("name", json!("Books"))),
        };
        assert!(pred.matches(&row(json!({"category_id": 1})), &lookup));
        assert!(!pred.matches(&row(json!({"category_id": null})), &lookup));
    }

    #[test]
    fn test_and_flattens() {
        let p = Predicate::All
            .and(Predicate::equals("a", json!(1)))
            .and(Predicate::equals("b", json!(2)));
        assert!(matches!(p, Predicate::And(ref parts) if parts.len() == 2));
    }
}
