//! Object and input type synthesis
//!
//! One object type per model: base fields keep their source nullability,
//! to-one relationships resolve to the target object, to-many and
//! many-to-many relationships to `[Target!]!` with `filter`, `orderBy`,
//! `limit` and `offset` arguments, and read-only methods and properties to
//! fields computed by the catalog's handlers.
//!
//! Relationship fields without arguments go through the request's
//! `DataLoader<RelationLoader>` so a list of parents costs one store query
//! per relationship.

use std::sync::Arc;

use async_graphql::Value;
use async_graphql::dataloader::DataLoader;
use async_graphql::dynamic::{
    Enum, EnumItem, Field, FieldFuture, FieldValue, InputObject, InputValue, Object, ResolverContext, Type,
    TypeRef,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::warn;

use super::naming::field_name;
use super::queries::{self, ListArgs};
use super::{
    ChoiceEnum, ModelEntry, RelationKey, RelationLoader, SchemaModels, SchemaRuntime, id_string, parent_record,
    row_value, scalars,
};
use crate::error::coded_error;
use crate::introspect::{Direction, FieldDescriptor, MethodDescriptor, RelationKind, RelationshipDescriptor};
use crate::models::{MethodHandler, ModelKey};
use crate::store::{CompareOp, Join, Predicate, Record, StoreQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPurpose {
    Create,
    Update,
    Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratedKind {
    Object,
    Input(InputPurpose),
    Enum,
    Connection,
    Edge,
    Payload,
    Shared,
}

/// A synthesized type ready for registration.
pub struct GeneratedType {
    pub name: String,
    pub kind: GeneratedKind,
    pub model: Option<ModelKey>,
    pub ty: Type,
}

impl GeneratedType {
    pub fn new(name: impl Into<String>, kind: GeneratedKind, model: Option<&ModelKey>, ty: impl Into<Type>) -> Self {
        Self {
            name: name.into(),
            kind,
            model: model.cloned(),
            ty: ty.into(),
        }
    }
}

impl std::fmt::Debug for GeneratedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedType")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("model", &self.model)
            .finish()
    }
}

/// GraphQL enum for a choice set.
pub fn enum_type(choice: &ChoiceEnum) -> Enum {
    choice.items.iter().fold(Enum::new(&choice.name), |e, (item, value)| {
        let mut entry = EnumItem::new(item);
        if item != value {
            entry = entry.description(format!("Stored as `{value}`"));
        }
        e.item(entry)
    })
}

fn output_type(field: &FieldDescriptor, models: &SchemaModels) -> TypeRef {
    let name = if field.primary_key {
        TypeRef::ID.to_string()
    } else {
        scalars::type_name(&field.kind, &models.enums)
    };
    if field.nullable {
        TypeRef::named(name)
    } else {
        TypeRef::named_nn(name)
    }
}

/// Object type for `entry`.
pub fn object_type(entry: &ModelEntry, runtime: &Arc<SchemaRuntime>) -> Object {
    let models = &runtime.models;
    let mut object = Object::new(&entry.names.object);
    if let Some(description) = &entry.descriptor.description {
        object = object.description(description);
    }

    for field in entry.descriptor.fields() {
        object = object.field(column_field(field, runtime));
    }
    for (rel, target) in models.relationships(entry) {
        object = object.field(relationship_field(entry, rel, target, runtime));
    }
    for method in entry.descriptor.methods().filter(|m| m.read_only) {
        object = object.field(method_field(entry, method, runtime));
    }
    object
}

fn column_field(field: &FieldDescriptor, runtime: &Arc<SchemaRuntime>) -> Field {
    let runtime = runtime.clone();
    let column = field.column.clone();
    let kind = field.kind.clone();
    let is_key = field.primary_key;
    let mut gql = Field::new(
        field_name(&field.name),
        output_type(field, &runtime.models),
        move |ctx| {
            let runtime = runtime.clone();
            let column = column.clone();
            let kind = kind.clone();
            FieldFuture::new(async move {
                let row = parent_record(&ctx)?;
                let value = match row.get(&column) {
                    None | Some(JsonValue::Null) => return Ok(None),
                    Some(value) => value,
                };
                if is_key {
                    return Ok(id_string(value).map(FieldValue::value));
                }
                Ok(Some(FieldValue::value(scalars::to_output(
                    &kind,
                    value,
                    &runtime.models.enums,
                ))))
            })
        },
    );
    if let Some(help) = &field.help_text {
        gql = gql.description(help);
    }
    gql
}

/// Predicate selecting the rows of `rel` belonging to `row` of `owner`.
pub(crate) fn rows_of_parent(
    owner: &ModelEntry,
    rel: &RelationshipDescriptor,
    target: &ModelEntry,
    row: &Record,
) -> Option<Predicate> {
    let owner_pk = &owner.descriptor.primary_key;
    let target_pk = &target.descriptor.primary_key;
    if let Some(through) = &rel.through {
        let id = row.get(owner_pk)?.clone();
        return Some(Predicate::Related {
            join: Join::Through {
                through: through.table.clone(),
                source_column: through.target_column.clone(),
                target_column: through.source_column.clone(),
                key: target_pk.clone(),
                table: owner.descriptor.table.clone(),
                related_key: owner_pk.clone(),
            },
            predicate: Box::new(Predicate::equals(owner_pk.clone(), id)),
        });
    }
    match (&rel.column, &rel.remote_column) {
        (Some(column), _) => {
            let fk = row.get(column).filter(|v| !v.is_null())?.clone();
            Some(Predicate::equals(target_pk.clone(), fk))
        }
        (None, Some(remote)) => {
            let id = row.get(owner_pk)?.clone();
            Some(Predicate::equals(remote.clone(), id))
        }
        (None, None) => None,
    }
}

/// Rows of a relationship, batched through the request loader when present.
async fn related_rows(
    ctx: &ResolverContext<'_>,
    runtime: &SchemaRuntime,
    owner: &ModelEntry,
    rel: &RelationshipDescriptor,
    target: &ModelEntry,
    row: &Record,
) -> async_graphql::Result<Vec<Record>> {
    if let Some(loader) = ctx.data_opt::<DataLoader<RelationLoader>>() {
        let Some(key) = RelationKey::for_row(owner.key(), rel, &owner.descriptor.primary_key, row) else {
            return Ok(Vec::new());
        };
        return loader
            .load_one(key)
            .await
            .map(Option::unwrap_or_default)
            .map_err(|err| runtime.store_failure(ctx, (*err).clone()));
    }
    let Some(predicate) = rows_of_parent(owner, rel, target, row) else {
        return Ok(Vec::new());
    };
    let order = super::ordering::compile(target, &[]).unwrap_or_default();
    let query = StoreQuery::new(&target.descriptor.table)
        .filter(predicate)
        .order(order);
    runtime
        .read(&query)
        .await
        .map(|page| page.rows)
        .map_err(|err| runtime.store_failure(ctx, err))
}

fn relationship_field(
    owner: &ModelEntry,
    rel: &RelationshipDescriptor,
    target: &ModelEntry,
    runtime: &Arc<SchemaRuntime>,
) -> Field {
    let shared = runtime.clone();
    let owner_key = owner.key().clone();
    let rel_name = rel.name.clone();
    let list = rel.is_list();
    let ty = match rel.kind {
        RelationKind::ToOne if rel.direction == Direction::Forward && !rel.nullable => {
            TypeRef::named_nn(&target.names.object)
        }
        RelationKind::ToOne => TypeRef::named(&target.names.object),
        RelationKind::ToMany | RelationKind::ManyToMany => TypeRef::named_nn_list_nn(&target.names.object),
    };

    let mut field = Field::new(field_name(&rel.name), ty, move |ctx| {
        let runtime = shared.clone();
        let owner_key = owner_key.clone();
        let rel_name = rel_name.clone();
        FieldFuture::new(async move {
            let row = parent_record(&ctx)?;
            let owner = runtime.entry(&owner_key)?;
            let rel = owner
                .descriptor
                .relationship(&rel_name)
                .ok_or_else(|| coded_error("GENERAL", format!("unknown relationship {rel_name}")))?;
            let target = runtime
                .models
                .target(owner, &rel_name)
                .ok_or_else(|| coded_error("GENERAL", format!("relationship {rel_name} is not exposed")))?;

            if !list {
                let rows = related_rows(&ctx, &runtime, owner, rel, target, row).await?;
                return Ok(rows.into_iter().next().map(row_value));
            }

            let args = ListArgs::from_ctx(&ctx);
            let rows = if args.is_empty() {
                related_rows(&ctx, &runtime, owner, rel, target, row).await?
            } else {
                let Some(base) = rows_of_parent(owner, rel, target, row) else {
                    return Ok(Some(FieldValue::list(Vec::<FieldValue>::new())));
                };
                queries::fetch_list(&ctx, &runtime, target, base, &args).await?
            };
            Ok(Some(FieldValue::list(rows.into_iter().map(row_value))))
        })
    });
    if list {
        field = queries::list_arguments(field, target);
    }
    if let Some(help) = &rel.help_text {
        field = field.description(help);
    }
    field
}

fn method_field(entry: &ModelEntry, method: &MethodDescriptor, runtime: &Arc<SchemaRuntime>) -> Field {
    let shared = runtime.clone();
    let model = entry.key().clone();
    let name = method.name.clone();
    let returns = method.returns.clone();
    let params: Vec<(String, String)> = method
        .params
        .iter()
        .map(|p| (field_name(&p.name), p.name.clone()))
        .collect();
    let ty = TypeRef::named(scalars::type_name(&method.returns, &runtime.models.enums));

    let mut field = Field::new(field_name(&method.name), ty, move |ctx| {
        let runtime = shared.clone();
        let model = model.clone();
        let name = name.clone();
        let returns = returns.clone();
        let params = params.clone();
        FieldFuture::new(async move {
            let row = parent_record(&ctx)?;
            let args = ctx.args.as_index_map();
            let mut call_args = JsonMap::new();
            for (gql, raw) in &params {
                if let Some(value) = args.get(gql.as_str()) {
                    call_args.insert(raw.clone(), scalars::value_to_json(value));
                }
            }
            let handler = match runtime.catalog.method(&model, &name) {
                Some(MethodHandler::Compute(handler)) => handler,
                Some(MethodHandler::Mutate(_)) | None => {
                    warn!(model = %model, method = %name, "No compute handler registered");
                    return Err(coded_error("GENERAL", format!("method {name} is not available")));
                }
            };
            let value = handler(row, &call_args).map_err(|msg| coded_error("GENERAL", msg))?;
            Ok(Some(FieldValue::value(scalars::to_output(
                &returns,
                &value,
                &runtime.models.enums,
            ))))
        })
    });
    for param in &method.params {
        let ty = scalars::type_name(&param.kind, &runtime.models.enums);
        field = field.argument(InputValue::new(
            field_name(&param.name),
            if param.required {
                TypeRef::named_nn(ty)
            } else {
                TypeRef::named(ty)
            },
        ));
    }
    if let Some(help) = &method.help_text {
        field = field.description(help);
    }
    field
}

fn input_scalar(field: &FieldDescriptor, models: &SchemaModels) -> String {
    if field.primary_key {
        TypeRef::ID.to_string()
    } else {
        scalars::type_name(&field.kind, &models.enums)
    }
}

/// `<Model>CreateInput` or `<Model>UpdateInput`.
pub fn input_type(entry: &ModelEntry, models: &SchemaModels, purpose: InputPurpose) -> InputObject {
    let (name, create) = match purpose {
        InputPurpose::Update => (&entry.names.update_input, false),
        _ => (&entry.names.create_input, true),
    };
    let mut input = InputObject::new(name);
    if !create {
        input = input.field(InputValue::new("id", TypeRef::named_nn(TypeRef::ID)));
    }

    for field in entry.descriptor.fields() {
        if (field.primary_key && field.auto) || !field.editable || (!create && field.primary_key) {
            continue;
        }
        let base = input_scalar(field, models);
        let mut value = if create && field.required_on_create() {
            InputValue::new(field_name(&field.name), TypeRef::named_nn(base))
        } else {
            InputValue::new(field_name(&field.name), TypeRef::named(base))
        };
        if create && let Some(default) = field.static_default() {
            value = value.default_value(scalars::to_output(&field.kind, default, &models.enums));
        }
        if let Some(help) = &field.help_text {
            value = value.description(help);
        }
        input = input.field(value);
    }

    for (rel, _) in models.relationships(entry) {
        if rel.direction != Direction::Forward || !rel.editable {
            continue;
        }
        let ty = match rel.kind {
            RelationKind::ToOne if create && !rel.nullable => TypeRef::named_nn(TypeRef::ID),
            RelationKind::ToOne => TypeRef::named(TypeRef::ID),
            RelationKind::ManyToMany => TypeRef::named_nn_list(TypeRef::ID),
            RelationKind::ToMany => continue,
        };
        input = input.field(InputValue::new(field_name(&rel.name), ty));
    }
    input
}

/// Id filter used by single reads and writes.
pub(crate) fn key_predicate(entry: &ModelEntry, id: &str) -> Predicate {
    let kind = super::key_kind(&entry.descriptor);
    Predicate::compare(
        entry.descriptor.primary_key.clone(),
        CompareOp::Eq,
        super::storage_key(&kind, id),
        kind.value_class(),
    )
}

/// Id argument of a resolver as a string.
pub(crate) fn id_argument(ctx: &ResolverContext<'_>, name: &str) -> async_graphql::Result<String> {
    match ctx.args.as_index_map().get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(coded_error("VALIDATION", format!("argument `{name}` must be an id"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphql::testing::catalog_models;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_rows_of_parent_per_relation_kind() {
        let (models, _) = catalog_models();
        let category = models.get(&ModelKey::new("catalog", "Category")).unwrap();
        let product = models.get(&ModelKey::new("catalog", "Product")).unwrap();
        let tag = models.get(&ModelKey::new("catalog", "Tag")).unwrap();
        let row: Record = json!({"id": 7, "category_id": 3}).as_object().cloned().unwrap();

        let forward = product.descriptor.relationship("category").unwrap();
        assert_eq!(
            rows_of_parent(product, forward, category, &row),
            Some(Predicate::equals("id", json!(3)))
        );

        let reverse = category.descriptor.relationship("product_set").unwrap();
        assert_eq!(
            rows_of_parent(category, reverse, product, &row),
            Some(Predicate::equals("category_id", json!(7)))
        );

        let tags = product.descriptor.relationship("tags").unwrap();
        assert_eq!(
            rows_of_parent(product, tags, tag, &row),
            Some(Predicate::Related {
                join: Join::Through {
                    through: "catalog_product_tags".into(),
                    source_column: "tag_id".into(),
                    target_column: "product_id".into(),
                    key: "id".into(),
                    table: "catalog_product".into(),
                    related_key: "id".into(),
                },
                predicate: Box::new(Predicate::equals("id", json!(7))),
            })
        );

        let orphan: Record = json!({"id": 8, "category_id": null}).as_object().cloned().unwrap();
        assert_eq!(rows_of_parent(product, forward, category, &orphan), None);
    }
}
