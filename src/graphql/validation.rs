//! Input validation for create and update mutations.
//!
//! [prepare] checks everything that can be decided from the input alone
//! (requiredness, kinds, lengths, bounds, choices, validators) and turns the
//! GraphQL input into storage columns. Checks that need the store (uniqueness
//! and relationship existence) run inside the write transaction.

use std::collections::HashMap;

use async_graphql::Value;
use async_graphql::indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use tracing::warn;

use super::naming::field_name;
use super::payload::{ErrorCode, MutationError};
use super::{ModelEntry, SchemaModels, key_kind, scalars, storage_key};
use crate::introspect::{Direction, FieldDescriptor, FieldKind, RelationKind, RelationshipDescriptor};
use crate::models::{DefaultValue, ValidatorDefinition};
use crate::store::Record;

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid regex"));
static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(https?|ftp)://[^\s/$.?#][^\s]*$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Purpose {
    Create,
    Update,
}

/// Target ids assigned to a many-to-many relationship.
#[derive(Debug, Clone)]
pub(crate) struct ManyAssignment<'a> {
    pub relationship: &'a RelationshipDescriptor,
    pub target: &'a ModelEntry,
    pub ids: Vec<JsonValue>,
}

/// A forward to-one reference that must exist.
#[derive(Debug, Clone)]
pub(crate) struct Reference<'a> {
    pub relationship: &'a RelationshipDescriptor,
    pub target: &'a ModelEntry,
    pub id: JsonValue,
}

/// Validated input ready for the store.
#[derive(Debug, Clone, Default)]
pub(crate) struct PreparedWrite<'a> {
    pub columns: Record,
    pub references: Vec<Reference<'a>>,
    pub many: Vec<ManyAssignment<'a>>,
}

pub(crate) type Input = IndexMap<async_graphql::Name, Value>;

fn lookup<'v>(input: &'v Input, name: &str) -> Option<&'v Value> {
    input
        .get(field_name(name).as_str())
        .or_else(|| input.get(name))
}

/// Validate `input` for `entry`, collecting every problem found.
pub(crate) fn prepare<'a>(
    entry: &'a ModelEntry,
    models: &'a SchemaModels,
    input: &Input,
    purpose: Purpose,
) -> Result<PreparedWrite<'a>, Vec<MutationError>> {
    let mut prepared = PreparedWrite::default();
    let mut errors = Vec::new();

    for field in entry.descriptor.fields() {
        if (field.primary_key && field.auto) || !field.editable {
            continue;
        }
        let gql_name = field_name(&field.name);
        match lookup(input, &field.name) {
            Some(Value::Null) if !field.nullable => errors.push(MutationError::on_field(
                ErrorCode::Required,
                &gql_name,
                "This field cannot be null.",
            )),
            Some(value) => match scalars::coerce_input(&field.kind, value, &models.enums) {
                Ok(coerced) => {
                    let before = errors.len();
                    check_constraints(field, &gql_name, &coerced, &mut errors);
                    if errors.len() == before {
                        prepared.columns.insert(field.column.clone(), coerced);
                    }
                }
                Err(expected) => errors.push(MutationError::on_field(
                    ErrorCode::Validation,
                    &gql_name,
                    format!("Expected {expected}, got {}.", scalars::describe(value)),
                )),
            },
            None if purpose == Purpose::Create => match &field.default {
                Some(DefaultValue::Value(v)) => {
                    prepared.columns.insert(field.column.clone(), v.clone());
                }
                Some(DefaultValue::Computed { computed }) => {
                    match scalars::computed_default(computed, &field.kind) {
                        Some(v) => {
                            prepared.columns.insert(field.column.clone(), v);
                        }
                        None => {
                            warn!(model = %entry.key(), field = %field.name, generator = %computed, "Unknown default generator");
                            if !field.nullable {
                                errors.push(MutationError::on_field(
                                    ErrorCode::Required,
                                    &gql_name,
                                    "This field is required.",
                                ));
                            }
                        }
                    }
                }
                None if field.required_on_create() => errors.push(MutationError::on_field(
                    ErrorCode::Required,
                    &gql_name,
                    "This field is required.",
                )),
                None => {
                    prepared.columns.insert(field.column.clone(), JsonValue::Null);
                }
            },
            None => {}
        }
    }

    for (rel, target) in models.relationships(entry) {
        if rel.direction != Direction::Forward || !rel.editable {
            continue;
        }
        let gql_name = field_name(&rel.name);
        let value = lookup(input, &rel.name);
        match rel.kind {
            RelationKind::ToOne => {
                let Some(column) = rel.column.as_ref() else { continue };
                match value {
                    None if purpose == Purpose::Create && !rel.nullable => errors.push(
                        MutationError::on_field(ErrorCode::Required, &gql_name, "This field is required."),
                    ),
                    None => {}
                    Some(Value::Null) if !rel.nullable => errors.push(MutationError::on_field(
                        ErrorCode::Required,
                        &gql_name,
                        "This field cannot be null.",
                    )),
                    Some(Value::Null) => {
                        prepared.columns.insert(column.clone(), JsonValue::Null);
                    }
                    Some(value) => match id_of(value) {
                        Some(id) => {
                            let id = storage_key(&key_kind(&target.descriptor), &id);
                            prepared.columns.insert(column.clone(), id.clone());
                            prepared.references.push(Reference {
                                relationship: rel,
                                target,
                                id,
                            });
                        }
                        None => errors.push(MutationError::on_field(
                            ErrorCode::Validation,
                            &gql_name,
                            format!("Expected an id, got {}.", scalars::describe(value)),
                        )),
                    },
                }
            }
            RelationKind::ManyToMany => match value {
                None | Some(Value::Null) => {}
                Some(Value::List(items)) => {
                    let kind = key_kind(&target.descriptor);
                    let ids: Option<Vec<JsonValue>> = items
                        .iter()
                        .map(|item| id_of(item).map(|id| storage_key(&kind, &id)))
                        .collect();
                    match ids {
                        Some(ids) => {
                            let mut distinct: Vec<JsonValue> = Vec::with_capacity(ids.len());
                            for id in ids {
                                if !distinct.contains(&id) {
                                    distinct.push(id);
                                }
                            }
                            prepared.many.push(ManyAssignment {
                                relationship: rel,
                                target,
                                ids: distinct,
                            });
                        }
                        None => errors.push(MutationError::on_field(
                            ErrorCode::Validation,
                            &gql_name,
                            "Expected a list of ids.",
                        )),
                    }
                }
                Some(other) => errors.push(MutationError::on_field(
                    ErrorCode::Validation,
                    &gql_name,
                    format!("Expected a list of ids, got {}.", scalars::describe(other)),
                )),
            },
            RelationKind::ToMany => {}
        }
    }

    if errors.is_empty() {
        Ok(prepared)
    } else {
        Err(errors)
    }
}

pub(crate) fn id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn numeric(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => Decimal::from_str(s).ok().and_then(|d| d.to_f64()),
        _ => None,
    }
}

/// Length, bound, choice and validator checks on a coerced value.
fn check_constraints(field: &FieldDescriptor, gql_name: &str, value: &JsonValue, errors: &mut Vec<MutationError>) {
    if value.is_null() {
        return;
    }
    let mut fail = |message: String| {
        errors.push(MutationError::on_field(ErrorCode::Validation, gql_name, message));
    };
    let text = value.as_str();
    let length = text.map(|s| s.chars().count());

    if let (Some(max), Some(len)) = (field.max_length, length)
        && len > max as usize
    {
        fail(format!("Ensure this value has at most {max} characters (it has {len})."));
    }
    if !matches!(field.kind, FieldKind::Text | FieldKind::Enumeration(_)) {
        if let (Some(min), Some(n)) = (field.min_value, numeric(value))
            && n < min
        {
            fail(format!("Ensure this value is greater than or equal to {min}."));
        }
        if let (Some(max), Some(n)) = (field.max_value, numeric(value))
            && n > max
        {
            fail(format!("Ensure this value is less than or equal to {max}."));
        }
    }
    if let (FieldKind::Enumeration(choices), Some(s)) = (&field.kind, text)
        && !choices.iter().any(|c| c.value == s)
    {
        fail(format!("Value {s:?} is not a valid choice."));
    }

    for validator in &field.validators {
        match validator {
            ValidatorDefinition::Regex { pattern, message } => {
                let Some(s) = text else { continue };
                match Regex::new(pattern) {
                    Ok(re) if !re.is_match(s) => fail(
                        message
                            .clone()
                            .unwrap_or_else(|| "Enter a valid value.".to_string()),
                    ),
                    Ok(_) => {}
                    Err(err) => warn!(field = %field.name, %pattern, error = %err, "Skipping invalid validator pattern"),
                }
            }
            ValidatorDefinition::Email => {
                if text.is_some_and(|s| !EMAIL.is_match(s)) {
                    fail("Enter a valid email address.".into());
                }
            }
            ValidatorDefinition::Url => {
                if text.is_some_and(|s| !URL.is_match(s)) {
                    fail("Enter a valid URL.".into());
                }
            }
            ValidatorDefinition::MinLength { value: min } => {
                if length.is_some_and(|len| len < *min as usize) {
                    fail(format!("Ensure this value has at least {min} characters."));
                }
            }
            ValidatorDefinition::MaxLength { value: max } => {
                if length.is_some_and(|len| len > *max as usize) {
                    fail(format!("Ensure this value has at most {max} characters."));
                }
            }
            ValidatorDefinition::MinValue { value: min } => {
                if numeric(value).is_some_and(|n| n < *min) {
                    fail(format!("Ensure this value is greater than or equal to {min}."));
                }
            }
            ValidatorDefinition::MaxValue { value: max } => {
                if numeric(value).is_some_and(|n| n > *max) {
                    fail(format!("Ensure this value is less than or equal to {max}."));
                }
            }
        }
    }
}

/// Unique field values and unique-together sets touched by `columns`.
///
/// Returns `(error field, column -> value)` groups to look up; for updates the
/// caller merges the stored row first so partial updates are checked against
/// the full resulting row.
pub(crate) fn unique_groups(entry: &ModelEntry, columns: &Record) -> Vec<(String, HashMap<String, JsonValue>)> {
    let descriptor = &entry.descriptor;
    let mut groups = Vec::new();
    for field in descriptor.fields().filter(|f| f.unique && !f.primary_key) {
        if let Some(value) = columns.get(&field.column).filter(|v| !v.is_null()) {
            groups.push((
                field_name(&field.name),
                HashMap::from([(field.column.clone(), value.clone())]),
            ));
        }
    }
    for set in &descriptor.unique_together {
        let resolved: Option<HashMap<String, JsonValue>> = set
            .iter()
            .map(|name| {
                let column = descriptor.order_column(name)?.to_string();
                let value = columns.get(&column).filter(|v| !v.is_null())?.clone();
                Some((column, value))
            })
            .collect();
        if let Some(group) = resolved {
            groups.push((set.iter().map(|n| field_name(n)).collect::<Vec<_>>().join(","), group));
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphql::testing::catalog_models;
    use crate::models::ModelKey;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn input(value: serde_json::Value) -> Input {
        match Value::from_json(value).unwrap() {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_create_applies_defaults_and_references() {
        let (models, _) = catalog_models();
        let product = models.get(&ModelKey::new("catalog", "Product")).unwrap();
        let prepared = prepare(
            product,
            &models,
            &input(json!({
                "name": "Desk lamp",
                "sku": "L-1",
                "price": "19.90",
                "category": "3",
                "tags": ["1", "2", "2"]
            })),
            Purpose::Create,
        )
        .unwrap();
        assert_eq!(prepared.columns["stock"], json!(0));
        assert_eq!(prepared.columns["active"], json!(true));
        assert_eq!(prepared.columns["status"], json!("draft"));
        assert_eq!(prepared.columns["price"], json!("19.90"));
        assert_eq!(prepared.columns["category_id"], json!(3));
        assert_eq!(prepared.references.len(), 1);
        assert_eq!(prepared.many[0].ids, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_create_collects_every_error() {
        let (models, _) = catalog_models();
        let product = models.get(&ModelKey::new("catalog", "Product")).unwrap();
        let errors = prepare(
            product,
            &models,
            &input(json!({
                "name": "x".repeat(121),
                "price": "abc",
                "stock": -1,
                "status": "retired"
            })),
            Purpose::Create,
        )
        .unwrap_err();
        let mut seen: Vec<(String, ErrorCode)> = errors
            .iter()
            .map(|e| (e.field.clone().unwrap_or_default(), e.code))
            .collect();
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            seen,
            vec![
                ("category".to_string(), ErrorCode::Required),
                ("name".to_string(), ErrorCode::Validation),
                ("price".to_string(), ErrorCode::Validation),
                ("sku".to_string(), ErrorCode::Required),
                ("status".to_string(), ErrorCode::Validation),
                ("stock".to_string(), ErrorCode::Validation),
            ]
        );
    }

    #[test]
    fn test_update_only_touches_supplied_fields() {
        let (models, _) = catalog_models();
        let product = models.get(&ModelKey::new("catalog", "Product")).unwrap();
        let prepared = prepare(product, &models, &input(json!({"stock": 4})), Purpose::Update).unwrap();
        assert_eq!(prepared.columns.len(), 1);
        assert_eq!(prepared.columns["stock"], json!(4));

        let errors = prepare(product, &models, &input(json!({"name": null})), Purpose::Update).unwrap_err();
        assert_eq!(errors[0].code, ErrorCode::Required);
    }

    #[test]
    fn test_unique_groups() {
        let (models, _) = catalog_models();
        let product = models.get(&ModelKey::new("catalog", "Product")).unwrap();
        let mut columns = Record::new();
        columns.insert("sku".into(), json!("L-1"));
        columns.insert("name".into(), json!("Lamp"));
        let groups = unique_groups(product, &columns);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, "sku");
    }
}
