//! Store-side half of every write
//!
//! [apply] performs one unit of work inside the caller's transaction:
//! validation that needs the store (uniqueness, reference existence, delete
//! protection), the write itself and many-to-many link maintenance.

use futures::future::BoxFuture;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};

use super::{MutationRun, MutationState};
use crate::cache::ChangeKind;
use crate::error::StoreError;
use crate::graphql::naming::field_name;
use crate::graphql::payload::{ErrorCode, MutationError, MutationOutcome};
use crate::graphql::validation::{self, Input, PreparedWrite, Purpose};
use crate::graphql::{ModelEntry, SchemaModels, SchemaRuntime, id_string, key_kind, scalars, storage_key};
use crate::introspect::{Direction, ModelDescriptor};
use crate::models::{DefaultValue, MethodHandler, OnDelete};
use crate::store::{CompareOp, Predicate, Record, StoreQuery, StoreTransaction, ValueClass};

/// One unit of work.
#[derive(Debug, Clone)]
pub(crate) enum WriteItem<'i> {
    Create(&'i Input),
    Update(&'i Input),
    Delete(String),
    Invoke {
        id: String,
        method: String,
        args: JsonMap<String, JsonValue>,
    },
}

#[derive(Debug)]
pub(crate) enum WriteFailure {
    /// Reported to the client as payload errors
    Rejected(Vec<MutationError>),
    Store(StoreError),
}

impl From<StoreError> for WriteFailure {
    fn from(err: StoreError) -> Self {
        WriteFailure::Store(err)
    }
}

impl From<Vec<MutationError>> for WriteFailure {
    fn from(errors: Vec<MutationError>) -> Self {
        WriteFailure::Rejected(errors)
    }
}

impl From<MutationError> for WriteFailure {
    fn from(error: MutationError) -> Self {
        WriteFailure::Rejected(vec![error])
    }
}

pub(crate) type WriteResult<T> = Result<T, WriteFailure>;

/// What a successful unit of work produced.
#[derive(Debug, Clone)]
pub(crate) struct Applied {
    pub row: Option<Record>,
    pub deleted: Option<String>,
    pub result: Option<JsonValue>,
    pub change: ChangeKind,
}

impl Applied {
    fn row(row: Record, change: ChangeKind) -> Self {
        Self {
            row: Some(row),
            deleted: None,
            result: None,
            change,
        }
    }

    pub fn into_outcome(self) -> MutationOutcome {
        let mut outcome = MutationOutcome::succeeded(self.row.into_iter().collect());
        outcome.success_count = 1;
        outcome.deleted.extend(self.deleted);
        outcome.result = self.result;
        outcome
    }
}

fn key_class(descriptor: &ModelDescriptor) -> ValueClass {
    key_kind(descriptor).value_class()
}

fn key_is(descriptor: &ModelDescriptor, id: &JsonValue) -> Predicate {
    Predicate::compare(&descriptor.primary_key, CompareOp::Eq, id.clone(), key_class(descriptor))
}

fn column_class(descriptor: &ModelDescriptor, column: &str) -> ValueClass {
    descriptor
        .fields()
        .find(|f| f.column == column)
        .map(|f| f.kind.value_class())
        .unwrap_or_else(|| key_class(descriptor))
}

fn display_id(id: &JsonValue) -> String {
    id_string(id).unwrap_or_else(|| "null".to_string())
}

async fn find_one(
    tx: &mut dyn StoreTransaction,
    table: &str,
    predicate: Predicate,
) -> Result<Option<Record>, StoreError> {
    let page = tx
        .select(&StoreQuery::new(table).filter(predicate).window(0, Some(1)))
        .await?;
    Ok(page.rows.into_iter().next())
}

/// Stored row for a client supplied id, or an `INVALID_REFERENCE` error.
async fn existing_row(tx: &mut dyn StoreTransaction, entry: &ModelEntry, id: &str) -> WriteResult<Record> {
    let descriptor = &entry.descriptor;
    let key = storage_key(&key_kind(descriptor), id);
    find_one(tx, &descriptor.table, key_is(descriptor, &key))
        .await?
        .ok_or_else(|| {
            MutationError::on_field(
                ErrorCode::InvalidReference,
                "id",
                format!("No {} with id {id}.", entry.names.object),
            )
            .into()
        })
}

/// Unique fields and unique-together sets of `columns` that another row
/// already holds.
async fn check_unique(
    tx: &mut dyn StoreTransaction,
    entry: &ModelEntry,
    columns: &Record,
    own_key: Option<&JsonValue>,
) -> WriteResult<()> {
    let descriptor = &entry.descriptor;
    let mut errors = Vec::new();
    for (field, group) in validation::unique_groups(entry, columns) {
        let mut group: Vec<(String, JsonValue)> = group.into_iter().collect();
        group.sort_by(|a, b| a.0.cmp(&b.0));
        let mut predicate = Predicate::all_of(
            group
                .into_iter()
                .map(|(column, value)| {
                    let class = column_class(descriptor, &column);
                    Predicate::compare(column, CompareOp::Eq, value, class)
                })
                .collect(),
        );
        if let Some(key) = own_key {
            predicate = predicate.and(Predicate::Not(Box::new(key_is(descriptor, key))));
        }
        if find_one(tx, &descriptor.table, predicate).await?.is_some() {
            errors.push(MutationError::on_field(
                ErrorCode::Duplicate,
                &field,
                format!(
                    "{} with this {} already exists.",
                    entry.names.object,
                    field.replace(',', " and ")
                ),
            ));
        }
    }
    if errors.is_empty() { Ok(()) } else { Err(errors.into()) }
}

/// Every referenced row must exist.
async fn check_references(tx: &mut dyn StoreTransaction, prepared: &PreparedWrite<'_>) -> WriteResult<()> {
    let mut errors = Vec::new();
    for reference in &prepared.references {
        let target = &reference.target.descriptor;
        if find_one(tx, &target.table, key_is(target, &reference.id)).await?.is_none() {
            errors.push(MutationError::on_field(
                ErrorCode::InvalidReference,
                field_name(&reference.relationship.name),
                format!(
                    "No {} with id {}.",
                    reference.target.names.object,
                    display_id(&reference.id)
                ),
            ));
        }
    }
    for assignment in prepared.many.iter().filter(|m| !m.ids.is_empty()) {
        let target = &assignment.target.descriptor;
        let found = tx
            .select(&StoreQuery::new(&target.table).filter(Predicate::compare(
                &target.primary_key,
                CompareOp::In,
                JsonValue::Array(assignment.ids.clone()),
                key_class(target),
            )))
            .await?
            .rows;
        let found: Vec<String> = found
            .iter()
            .filter_map(|row| row.get(&target.primary_key).and_then(id_string))
            .collect();
        let missing: Vec<String> = assignment
            .ids
            .iter()
            .map(display_id)
            .filter(|id| !found.contains(id))
            .collect();
        if !missing.is_empty() {
            errors.push(MutationError::on_field(
                ErrorCode::InvalidReference,
                field_name(&assignment.relationship.name),
                format!(
                    "No {} with id {}.",
                    assignment.target.names.object,
                    missing.join(", ")
                ),
            ));
        }
    }
    if errors.is_empty() { Ok(()) } else { Err(errors.into()) }
}

/// Replace the link rows of every assigned many-to-many relationship.
async fn link_many(
    tx: &mut dyn StoreTransaction,
    entry: &ModelEntry,
    row: &Record,
    prepared: &PreparedWrite<'_>,
) -> Result<(), StoreError> {
    let Some(owner) = row.get(&entry.descriptor.primary_key).cloned() else {
        return Ok(());
    };
    for assignment in &prepared.many {
        let Some(through) = &assignment.relationship.through else {
            continue;
        };
        tx.delete_where(
            &through.table,
            &Predicate::compare(
                &through.source_column,
                CompareOp::Eq,
                owner.clone(),
                key_class(&entry.descriptor),
            ),
        )
        .await?;
        for id in &assignment.ids {
            let mut link = Record::new();
            link.insert(through.source_column.clone(), owner.clone());
            link.insert(through.target_column.clone(), id.clone());
            tx.insert(&through.table, "id", link).await?;
        }
    }
    Ok(())
}

/// Delete rows of `entry` with the given keys, then apply every dependent
/// relationship's on-delete behaviour.
///
/// Rows are removed before their dependents are visited, so reference cycles
/// terminate. A protected dependent rejects the whole unit of work, which the
/// caller rolls back.
fn remove_rows<'a>(
    tx: &'a mut dyn StoreTransaction,
    models: &'a SchemaModels,
    entry: &'a ModelEntry,
    keys: Vec<JsonValue>,
) -> BoxFuture<'a, WriteResult<usize>> {
    Box::pin(async move {
        if keys.is_empty() {
            return Ok(0);
        }
        let descriptor = &entry.descriptor;
        let class = key_class(descriptor);
        let in_keys = |column: &str| Predicate::compare(column, CompareOp::In, JsonValue::Array(keys.clone()), class);

        let removed = tx.delete_where(&descriptor.table, &in_keys(&descriptor.primary_key)).await?;
        for rel in descriptor.relationships() {
            if let Some(through) = &rel.through {
                tx.delete_where(&through.table, &in_keys(&through.source_column)).await?;
                continue;
            }
            let (Direction::Reverse, Some(remote)) = (rel.direction, &rel.remote_column) else {
                continue;
            };
            let Some(target) = models.get(&rel.target) else {
                warn!(model = %entry.key(), relation = %rel.name, "Dependent model is not part of the schema");
                continue;
            };
            let query = StoreQuery::new(&target.descriptor.table).filter(in_keys(remote));
            match rel.on_delete {
                OnDelete::DoNothing => {}
                OnDelete::Protect | OnDelete::Restrict => {
                    if !tx.select(&query.window(0, Some(1))).await?.rows.is_empty() {
                        return Err(MutationError::new(
                            ErrorCode::Validation,
                            format!(
                                "Cannot delete {} because related {} rows still reference it.",
                                entry.names.object, target.names.object
                            ),
                        )
                        .into());
                    }
                }
                OnDelete::Cascade => {
                    let target_key = &target.descriptor.primary_key;
                    let children: Vec<JsonValue> = tx
                        .select(&query)
                        .await?
                        .rows
                        .iter()
                        .filter_map(|row| row.get(target_key).cloned())
                        .collect();
                    debug!(model = %target.key(), count = children.len(), "Cascading delete");
                    remove_rows(&mut *tx, models, target, children).await?;
                }
                OnDelete::SetNull | OnDelete::SetDefault => {
                    let replacement = match rel.on_delete {
                        OnDelete::SetDefault => detached_reference(entry, rel.default.as_ref()),
                        _ => JsonValue::Null,
                    };
                    let target_key = &target.descriptor.primary_key;
                    for row in tx.select(&query).await?.rows {
                        let Some(child) = row.get(target_key) else { continue };
                        let mut changes = Record::new();
                        changes.insert(remote.clone(), replacement.clone());
                        tx.update(&target.descriptor.table, target_key, child, changes).await?;
                    }
                }
            }
        }
        Ok(removed)
    })
}

/// Value written into a dependent's reference column when its target row
/// is deleted with `SET_DEFAULT`. Null when the column declares no default.
fn detached_reference(entry: &ModelEntry, default: Option<&DefaultValue>) -> JsonValue {
    let kind = key_kind(&entry.descriptor);
    match default {
        Some(DefaultValue::Value(JsonValue::String(id))) => storage_key(&kind, id),
        Some(DefaultValue::Value(value)) => value.clone(),
        Some(DefaultValue::Computed { computed }) => {
            scalars::computed_default(computed, &kind).unwrap_or(JsonValue::Null)
        }
        None => JsonValue::Null,
    }
}

/// Perform `item` within `tx`, advancing `run` to `Executed` on success.
pub(crate) async fn apply(
    tx: &mut dyn StoreTransaction,
    runtime: &SchemaRuntime,
    entry: &ModelEntry,
    item: &WriteItem<'_>,
    run: &mut MutationRun<'_>,
) -> WriteResult<Applied> {
    let models = &runtime.models;
    let descriptor = &entry.descriptor;
    let applied = match item {
        WriteItem::Create(input) => {
            let prepared = validation::prepare(entry, models, input, Purpose::Create)?;
            check_unique(tx, entry, &prepared.columns, None).await?;
            check_references(tx, &prepared).await?;
            run.advance(MutationState::Validated);

            let row = tx
                .insert(&descriptor.table, &descriptor.primary_key, prepared.columns.clone())
                .await?;
            link_many(tx, entry, &row, &prepared).await?;
            Applied::row(row, ChangeKind::RowCreated)
        }
        WriteItem::Update(input) => {
            let Some(id) = input.get("id").and_then(validation::id_of) else {
                return Err(MutationError::on_field(ErrorCode::Required, "id", "This field is required.").into());
            };
            let existing = existing_row(tx, entry, &id).await?;
            let prepared = validation::prepare(entry, models, input, Purpose::Update)?;
            let key = existing
                .get(&descriptor.primary_key)
                .cloned()
                .unwrap_or(JsonValue::Null);
            let mut merged = existing.clone();
            merged.extend(prepared.columns.clone());
            check_unique(tx, entry, &merged, Some(&key)).await?;
            check_references(tx, &prepared).await?;
            run.advance(MutationState::Validated);

            let row = if prepared.columns.is_empty() {
                existing
            } else {
                tx.update(&descriptor.table, &descriptor.primary_key, &key, prepared.columns.clone())
                    .await?
                    .unwrap_or(merged)
            };
            link_many(tx, entry, &row, &prepared).await?;
            Applied::row(row, ChangeKind::RowUpdated)
        }
        WriteItem::Delete(id) => {
            let existing = existing_row(tx, entry, id).await?;
            let key = existing
                .get(&descriptor.primary_key)
                .cloned()
                .unwrap_or(JsonValue::Null);
            run.advance(MutationState::Validated);

            remove_rows(tx, models, entry, vec![key.clone()]).await?;
            Applied {
                row: None,
                deleted: Some(display_id(&key)),
                result: None,
                change: ChangeKind::RowDeleted,
            }
        }
        WriteItem::Invoke { id, method, args } => {
            let existing = existing_row(tx, entry, id).await?;
            let Some(MethodHandler::Mutate(handler)) = runtime.catalog.method(entry.key(), method) else {
                return Err(MutationError::new(
                    ErrorCode::General,
                    format!("Method {method} is not available."),
                )
                .into());
            };
            run.advance(MutationState::Validated);

            let mut row = existing.clone();
            let result = handler(&mut row, args).map_err(|message| MutationError::new(ErrorCode::Validation, message))?;
            let changes: Record = row
                .iter()
                .filter(|(column, value)| *column != &descriptor.primary_key && existing.get(*column) != Some(*value))
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect();
            let key = existing
                .get(&descriptor.primary_key)
                .cloned()
                .unwrap_or(JsonValue::Null);
            let row = if changes.is_empty() {
                row
            } else {
                debug!(model = %entry.key(), method = %method, columns = changes.len(), "Persisting method changes");
                tx.update(&descriptor.table, &descriptor.primary_key, &key, changes)
                    .await?
                    .unwrap_or(row)
            };
            Applied {
                result: Some(result),
                ..Applied::row(row, ChangeKind::RowUpdated)
            }
        }
    };
    run.advance(MutationState::Executed);
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphql::AllowAll;
    use crate::graphql::testing::{catalog, catalog_models};
    use crate::store::{DataStore, MemoryStore};
    use assert_matches::assert_matches;
    use async_graphql::Value;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn row(value: JsonValue) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn input(value: JsonValue) -> Input {
        match Value::from_json(value).unwrap() {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn runtime(store: &MemoryStore) -> SchemaRuntime {
        let (models, settings) = catalog_models();
        SchemaRuntime {
            schema_name: "catalog".into(),
            models,
            settings,
            store: Arc::new(store.clone()),
            catalog: catalog(),
            authorizer: Arc::new(AllowAll),
            notifier: None,
        }
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.seed("catalog_category", [row(json!({"id": 1, "name": "Lighting", "description": null}))]);
        store.seed("catalog_tag", [row(json!({"id": 5, "name": "sale"}))]);
        store.seed(
            "catalog_product",
            [row(json!({
                "id": 10, "name": "Lamp", "sku": "L-1", "price": "19.90", "stock": 3,
                "active": true, "status": "draft", "category_id": 1
            }))],
        );
        store.seed("catalog_product_tags", [row(json!({"id": 1, "product_id": 10, "tag_id": 5}))]);
        store
    }

    async fn run_item(runtime: &SchemaRuntime, item: WriteItem<'_>) -> WriteResult<Applied> {
        let product = runtime.models.get(&crate::models::ModelKey::new("catalog", "Product")).unwrap();
        let mut tx = runtime.store.begin().await.unwrap();
        let mut run = MutationRun::new("test", None);
        let applied = apply(tx.as_mut(), runtime, product, &item, &mut run).await;
        if applied.is_ok() {
            assert_eq!(run.state(), MutationState::Executed);
            tx.commit().await.unwrap();
        }
        applied
    }

    #[tokio::test]
    async fn test_create_links_tags_and_rejects_duplicates() {
        let store = seeded();
        let runtime = runtime(&store);
        let create = input(json!({"name": "Desk", "sku": "D-1", "price": "120.00", "category": "1", "tags": ["5"]}));
        let applied = run_item(&runtime, WriteItem::Create(&create)).await.unwrap();
        let id = applied.row.unwrap()["id"].clone();
        assert_eq!(store.rows("catalog_product_tags").len(), 2);
        assert!(store
            .rows("catalog_product_tags")
            .iter()
            .any(|link| link["product_id"] == id && link["tag_id"] == json!(5)));

        let duplicate = input(json!({"name": "Other", "sku": "D-1", "price": "1.00", "category": "1"}));
        let failure = run_item(&runtime, WriteItem::Create(&duplicate)).await.unwrap_err();
        assert_matches!(failure, WriteFailure::Rejected(errors) if errors[0].code == ErrorCode::Duplicate && errors[0].field.as_deref() == Some("sku"));
    }

    #[tokio::test]
    async fn test_unknown_reference_is_rejected() {
        let store = seeded();
        let runtime = runtime(&store);
        let create = input(json!({"name": "Desk", "sku": "D-2", "price": "1.00", "category": "99", "tags": ["5", "6"]}));
        let failure = run_item(&runtime, WriteItem::Create(&create)).await.unwrap_err();
        let WriteFailure::Rejected(errors) = failure else { panic!("expected rejection") };
        let fields: Vec<_> = errors.iter().map(|e| (e.field.as_deref(), e.code)).collect();
        assert_eq!(
            fields,
            vec![
                (Some("category"), ErrorCode::InvalidReference),
                (Some("tags"), ErrorCode::InvalidReference),
            ]
        );
        assert_eq!(store.rows("catalog_product").len(), 1);
    }

    #[tokio::test]
    async fn test_update_keeps_own_unique_values() {
        let store = seeded();
        let runtime = runtime(&store);
        let update = input(json!({"id": "10", "sku": "L-1", "stock": 7}));
        let applied = run_item(&runtime, WriteItem::Update(&update)).await.unwrap();
        assert_eq!(applied.row.unwrap()["stock"], json!(7));

        let missing = input(json!({"id": "404", "stock": 1}));
        let failure = run_item(&runtime, WriteItem::Update(&missing)).await.unwrap_err();
        assert_matches!(failure, WriteFailure::Rejected(errors) if errors[0].code == ErrorCode::InvalidReference);
    }

    #[test]
    fn test_set_default_reference_value() {
        let runtime = runtime(&MemoryStore::new());
        let category = runtime.models.get(&crate::models::ModelKey::new("catalog", "Category")).unwrap();
        assert_eq!(detached_reference(category, None), JsonValue::Null);
        assert_eq!(detached_reference(category, Some(&DefaultValue::Value(json!("3")))), json!(3));
        assert_eq!(detached_reference(category, Some(&DefaultValue::Value(json!(4)))), json!(4));
        let unknown = DefaultValue::Computed {
            computed: "nope".into(),
        };
        assert_eq!(detached_reference(category, Some(&unknown)), JsonValue::Null);
    }

    #[tokio::test]
    async fn test_delete_removes_links() {
        let store = seeded();
        let runtime = runtime(&store);
        let applied = run_item(&runtime, WriteItem::Delete("10".into())).await.unwrap();
        assert_eq!(applied.deleted.as_deref(), Some("10"));
        assert!(store.rows("catalog_product").is_empty());
        assert!(store.rows("catalog_product_tags").is_empty());
        assert_eq!(store.rows("catalog_tag").len(), 1);
    }

    #[tokio::test]
    async fn test_invoke_persists_handler_changes() {
        let store = seeded();
        let runtime = runtime(&store);
        let mut args = JsonMap::new();
        args.insert("amount".into(), json!(4));
        let applied = run_item(
            &runtime,
            WriteItem::Invoke {
                id: "10".into(),
                method: "restock".into(),
                args: args.clone(),
            },
        )
        .await
        .unwrap();
        assert_eq!(applied.result, Some(json!(7)));
        assert_eq!(store.rows("catalog_product")[0]["stock"], json!(7));

        args.insert("amount".into(), json!(0));
        let failure = run_item(
            &runtime,
            WriteItem::Invoke {
                id: "10".into(),
                method: "restock".into(),
                args,
            },
        )
        .await
        .unwrap_err();
        assert_matches!(failure, WriteFailure::Rejected(errors) if errors[0].code == ErrorCode::Validation);
        assert_eq!(store.rows("catalog_product")[0]["stock"], json!(7));
    }
}
