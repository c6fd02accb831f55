//! Filter input synthesis and compilation
//!
//! Every model gets a `<Model>Filter` input with one field per supported
//! operator on each base field:
//! - bare field name (equality)
//! - `__iexact`, `__contains`, `__icontains`, `__startswith`, `__istartswith`,
//!   `__endswith`, `__iendswith` (text)
//! - `__gt`, `__gte`, `__lt`, `__lte`, `__range` (ordered kinds)
//! - `__in`, `__isnull`
//!
//! Relationships nest the target's filter input, and `AND`, `OR`, `NOT`
//! combine sub-filters. An empty `AND` matches every row; an empty `OR` and
//! the negation of an empty filter match none. [FilterCompiler] turns a
//! filter value into a single store [Predicate].

use async_graphql::Value;
use async_graphql::dynamic::{InputObject, InputValue, TypeRef};

use super::naming::field_name;
use super::{ModelEntry, SchemaModels, scalars};
use crate::error::FilterError;
use crate::introspect::{Direction, FieldDescriptor, FieldKind, Member, RelationKind};
use crate::schema::SchemaSettings;
use crate::store::{CompareOp, Predicate};

const TEXT_OPS: &[CompareOp] = &[
    CompareOp::Eq,
    CompareOp::IEq,
    CompareOp::Contains,
    CompareOp::IContains,
    CompareOp::StartsWith,
    CompareOp::IStartsWith,
    CompareOp::EndsWith,
    CompareOp::IEndsWith,
    CompareOp::In,
    CompareOp::IsNull,
];

const ORDERED_OPS: &[CompareOp] = &[
    CompareOp::Eq,
    CompareOp::Gt,
    CompareOp::Gte,
    CompareOp::Lt,
    CompareOp::Lte,
    CompareOp::In,
    CompareOp::Range,
    CompareOp::IsNull,
];

const EQUALITY_OPS: &[CompareOp] = &[CompareOp::Eq, CompareOp::In, CompareOp::IsNull];

const BASIC_OPS: &[CompareOp] = &[CompareOp::Eq, CompareOp::IsNull];

/// Operators offered for a field kind.
pub fn operators(kind: &FieldKind) -> &'static [CompareOp] {
    match kind {
        FieldKind::Text => TEXT_OPS,
        k if k.is_ordered() => ORDERED_OPS,
        FieldKind::Enumeration(_) | FieldKind::Uuid | FieldKind::Identifier => EQUALITY_OPS,
        _ => BASIC_OPS,
    }
}

fn is_text_op(op: CompareOp) -> bool {
    matches!(
        op,
        CompareOp::IEq
            | CompareOp::Contains
            | CompareOp::IContains
            | CompareOp::StartsWith
            | CompareOp::IStartsWith
            | CompareOp::EndsWith
            | CompareOp::IEndsWith
    )
}

/// Filter input field name for `field` and `op`.
pub fn filter_field_name(field: &str, op: CompareOp) -> String {
    match op.suffix() {
        Some(suffix) => format!("{}__{}", field_name(field), suffix),
        None => field_name(field),
    }
}

fn base_type(field: &FieldDescriptor, models: &SchemaModels) -> String {
    if field.primary_key {
        TypeRef::ID.to_string()
    } else {
        scalars::type_name(&field.kind, &models.enums)
    }
}

/// Build `<Model>Filter`.
pub fn filter_input(entry: &ModelEntry, models: &SchemaModels, settings: &SchemaSettings) -> InputObject {
    let name = &entry.names.filter;
    let mut input = InputObject::new(name).description(format!("Filter for {}", entry.names.object));

    for field in entry.descriptor.fields() {
        let base = base_type(field, models);
        for &op in operators(&field.kind) {
            let ty = match op {
                CompareOp::IsNull => TypeRef::named(TypeRef::BOOLEAN),
                CompareOp::In | CompareOp::Range => TypeRef::named_nn_list(&base),
                op if is_text_op(op) => TypeRef::named(TypeRef::STRING),
                _ => TypeRef::named(&base),
            };
            input = input.field(InputValue::new(filter_field_name(&field.name, op), ty));
        }
    }

    for (rel, target) in models.relationships(entry) {
        if rel.direction == Direction::Reverse && !settings.include_reverse_relations {
            continue;
        }
        if settings.filter_max_depth > 0 {
            input = input.field(InputValue::new(
                field_name(&rel.name),
                TypeRef::named(&target.names.filter),
            ));
        }
        if rel.kind == RelationKind::ToOne && rel.column.is_some() {
            input = input.field(InputValue::new(
                filter_field_name(&rel.name, CompareOp::IsNull),
                TypeRef::named(TypeRef::BOOLEAN),
            ));
        }
    }

    input
        .field(InputValue::new("AND", TypeRef::named_nn_list(name)))
        .field(InputValue::new("OR", TypeRef::named_nn_list(name)))
        .field(InputValue::new("NOT", TypeRef::named(name)))
}

/// Compiles filter values into store predicates.
///
/// Keys accept either the generated camelCase name or the raw member name,
/// so accessor scopes declared against the host model compile too. A null
/// value and an empty object both mean "no constraint".
pub struct FilterCompiler<'a> {
    models: &'a SchemaModels,
    max_depth: usize,
    include_reverse: bool,
}

impl<'a> FilterCompiler<'a> {
    pub fn new(models: &'a SchemaModels, settings: &SchemaSettings) -> Self {
        Self {
            models,
            max_depth: settings.filter_max_depth,
            include_reverse: settings.include_reverse_relations,
        }
    }

    pub fn compile(&self, entry: &ModelEntry, filter: &Value) -> Result<Predicate, FilterError> {
        self.compile_at(entry, filter, 0)
    }

    fn compile_at(&self, entry: &ModelEntry, filter: &Value, depth: usize) -> Result<Predicate, FilterError> {
        let map = match filter {
            Value::Null => return Ok(Predicate::All),
            Value::Object(map) => map,
            other => {
                return Err(FilterError::TypeMismatch {
                    field: entry.names.filter.clone(),
                    expected: "an object",
                    found: scalars::describe(other),
                });
            }
        };

        let mut parts = Vec::with_capacity(map.len());
        for (key, value) in map {
            if matches!(value, Value::Null) {
                continue;
            }
            match key.as_str() {
                "AND" => {
                    for branch in as_list(value) {
                        parts.push(self.compile_at(entry, branch, depth)?);
                    }
                }
                "OR" => {
                    let mut branches = Vec::new();
                    let mut tautology = false;
                    for branch in as_list(value) {
                        let compiled = self.compile_at(entry, branch, depth)?;
                        tautology |= compiled.is_all();
                        branches.push(compiled);
                    }
                    if !tautology {
                        parts.push(if branches.len() == 1 {
                            branches.remove(0)
                        } else {
                            Predicate::Or(branches)
                        });
                    }
                }
                "NOT" => {
                    let inner = self.compile_at(entry, value, depth)?;
                    parts.push(if inner.is_all() {
                        Predicate::nothing()
                    } else {
                        Predicate::Not(Box::new(inner))
                    });
                }
                key => parts.push(self.compile_leaf(entry, key, value, depth)?),
            }
        }
        Ok(Predicate::all_of(parts))
    }

    fn compile_leaf(
        &self,
        entry: &ModelEntry,
        key: &str,
        value: &Value,
        depth: usize,
    ) -> Result<Predicate, FilterError> {
        let (base, op) = split_key(key);
        let member = entry
            .descriptor
            .members
            .iter()
            .find(|m| m.name() == base || field_name(m.name()) == base)
            .ok_or_else(|| FilterError::UnknownField(key.to_string()))?;

        match member {
            Member::Field(field) => {
                let op = op.unwrap_or(CompareOp::Eq);
                if !operators(&field.kind).contains(&op) {
                    return Err(FilterError::UnknownField(key.to_string()));
                }
                let operand = self.operand(field, op, key, value)?;
                Ok(Predicate::compare(&field.column, op, operand, field.kind.value_class()))
            }
            Member::Relationship(rel) => {
                let target = self
                    .models
                    .target(entry, &rel.name)
                    .filter(|_| rel.direction == Direction::Forward || self.include_reverse)
                    .ok_or_else(|| FilterError::UnknownField(key.to_string()))?;
                match (op, &rel.column) {
                    (Some(CompareOp::IsNull), Some(column)) if rel.kind == RelationKind::ToOne => {
                        let flag = expect_bool(key, value)?;
                        Ok(Predicate::compare(
                            column,
                            CompareOp::IsNull,
                            serde_json::Value::Bool(flag),
                            crate::store::ValueClass::Number,
                        ))
                    }
                    (None, _) => {
                        if depth + 1 > self.max_depth {
                            return Err(FilterError::TooDeep {
                                field: key.to_string(),
                                limit: self.max_depth,
                            });
                        }
                        let inner = self.compile_at(target, value, depth + 1)?;
                        Ok(Predicate::Related {
                            join: rel.join(&entry.descriptor, &target.descriptor),
                            predicate: Box::new(inner),
                        })
                    }
                    _ => Err(FilterError::UnknownField(key.to_string())),
                }
            }
            Member::Method(_) => Err(FilterError::UnknownField(key.to_string())),
        }
    }

    fn operand(
        &self,
        field: &FieldDescriptor,
        op: CompareOp,
        key: &str,
        value: &Value,
    ) -> Result<serde_json::Value, FilterError> {
        let single = |v: &Value| {
            scalars::coerce_input(&field.kind, v, &self.models.enums).map_err(|_| FilterError::TypeMismatch {
                field: key.to_string(),
                expected: field.kind.label(),
                found: scalars::describe(v),
            })
        };
        match op {
            CompareOp::IsNull => expect_bool(key, value).map(serde_json::Value::Bool),
            CompareOp::In => as_list(value)
                .into_iter()
                .map(single)
                .collect::<Result<Vec<_>, _>>()
                .map(serde_json::Value::Array),
            CompareOp::Range => match value {
                Value::List(bounds) if bounds.len() == 2 => Ok(serde_json::Value::Array(vec![
                    single(&bounds[0])?,
                    single(&bounds[1])?,
                ])),
                other => Err(FilterError::TypeMismatch {
                    field: key.to_string(),
                    expected: "a two element list",
                    found: scalars::describe(other),
                }),
            },
            op if is_text_op(op) => match value {
                Value::String(s) => Ok(serde_json::Value::String(s.clone())),
                other => Err(FilterError::TypeMismatch {
                    field: key.to_string(),
                    expected: "a string",
                    found: scalars::describe(other),
                }),
            },
            _ => single(value),
        }
    }
}

/// `name__icontains` -> (`name`, IContains); unknown suffixes stay part of the name.
fn split_key(key: &str) -> (&str, Option<CompareOp>) {
    match key.rsplit_once("__") {
        Some((base, suffix)) if !base.is_empty() => match CompareOp::from_suffix(suffix) {
            Some(op) => (base, Some(op)),
            None => (key, None),
        },
        _ => (key, None),
    }
}

fn as_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::List(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        single => vec![single],
    }
}

fn expect_bool(key: &str, value: &Value) -> Result<bool, FilterError> {
    match value {
        Value::Boolean(b) => Ok(*b),
        other => Err(FilterError::TypeMismatch {
            field: key.to_string(),
            expected: "a boolean",
            found: scalars::describe(other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphql::testing::catalog_models;
    use crate::models::ModelKey;
    use crate::store::{Join, ValueClass};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn value(json: serde_json::Value) -> Value {
        Value::from_json(json).unwrap()
    }

    #[test]
    fn test_empty_filter_is_unconstrained() {
        let (models, settings) = catalog_models();
        let product = models.get(&ModelKey::new("catalog", "Product")).unwrap();
        let compiler = FilterCompiler::new(&models, &settings);
        assert_eq!(compiler.compile(product, &value(json!({}))).unwrap(), Predicate::All);
        assert_eq!(compiler.compile(product, &Value::Null).unwrap(), Predicate::All);
        assert_eq!(compiler.compile(product, &value(json!({"AND": []}))).unwrap(), Predicate::All);
        assert_eq!(
            compiler.compile(product, &value(json!({"OR": [{}, {"name": "Lamp"}]}))).unwrap(),
            Predicate::All
        );
    }

    #[test]
    fn test_empty_or_and_negated_empty_match_nothing() {
        let (models, settings) = catalog_models();
        let product = models.get(&ModelKey::new("catalog", "Product")).unwrap();
        let compiler = FilterCompiler::new(&models, &settings);
        let row = json!({"id": 1, "name": "Lamp"}).as_object().cloned().unwrap();
        let no_rows = |_: &str| -> Vec<crate::store::Record> { Vec::new() };
        for filter in [json!({"OR": []}), json!({"NOT": {}}), json!({"NOT": {"AND": []}})] {
            let compiled = compiler.compile(product, &value(filter.clone())).unwrap();
            assert_eq!(compiled, Predicate::nothing(), "{filter}");
            assert!(!compiled.matches(&row, &no_rows), "{filter}");
        }
    }

    #[test]
    fn test_leaves_and_relations() {
        let (models, settings) = catalog_models();
        let product = models.get(&ModelKey::new("catalog", "Product")).unwrap();
        let compiler = FilterCompiler::new(&models, &settings);
        let compiled = compiler
            .compile(
                product,
                &value(json!({
                    "name__icontains": "lamp",
                    "category": {"name": "Lighting"}
                })),
            )
            .unwrap();
        assert_eq!(
            compiled,
            Predicate::And(vec![
                Predicate::compare("name", CompareOp::IContains, json!("lamp"), ValueClass::Text),
                Predicate::Related {
                    join: Join::Forward {
                        column: "category_id".into(),
                        table: "catalog_category".into(),
                        related_key: "id".into(),
                    },
                    predicate: Box::new(Predicate::compare(
                        "name",
                        CompareOp::Eq,
                        json!("Lighting"),
                        ValueClass::Text
                    )),
                },
            ])
        );
    }

    #[test]
    fn test_type_mismatch_and_unknown_fields() {
        let (models, settings) = catalog_models();
        let product = models.get(&ModelKey::new("catalog", "Product")).unwrap();
        let compiler = FilterCompiler::new(&models, &settings);
        assert_matches!(
            compiler.compile(product, &value(json!({"price__gt": "cheap"}))),
            Err(FilterError::TypeMismatch { ref field, .. }) if field == "price__gt"
        );
        assert_matches!(
            compiler.compile(product, &value(json!({"active__contains": "x"}))),
            Err(FilterError::UnknownField(_))
        );
        assert_matches!(
            compiler.compile(product, &value(json!({"nope": 1}))),
            Err(FilterError::UnknownField(_))
        );
    }

    #[test]
    fn test_relation_depth_limit() {
        let (models, mut settings) = catalog_models();
        settings.filter_max_depth = 1;
        let product = models.get(&ModelKey::new("catalog", "Product")).unwrap();
        let compiler = FilterCompiler::new(&models, &settings);
        assert!(compiler
            .compile(product, &value(json!({"category": {"name": "A"}})))
            .is_ok());
        assert_matches!(
            compiler.compile(
                product,
                &value(json!({"category": {"productSet": {"name": "A"}}}))
            ),
            Err(FilterError::TooDeep { limit: 1, .. })
        );
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("unitPrice__gte"), ("unitPrice", Some(CompareOp::Gte)));
        assert_eq!(split_key("name"), ("name", None));
        assert_eq!(split_key("odd__name"), ("odd__name", None));
    }
}
