//! DataLoader batching for relationship fields
//!
//! When a list of rows each resolves the same relationship without
//! arguments, every resolver calls `loader.load_one(key)` and the DataLoader
//! collects them within the same request tick. [RelationLoader] then issues
//! one store query per relationship:
//! - forward to-one: `target.pk IN (fk values)`
//! - reverse: `target.fk IN (parent keys)`, grouped by the fk
//! - many-to-many: through rows for the parent keys, then the targets
//!
//! One `DataLoader<RelationLoader>` is attached to every request by
//! `Engine::execute`, so nothing is cached across requests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_graphql::dataloader::Loader;
use serde_json::Value as JsonValue;

use super::{SchemaRuntime, id_string, key_kind, ordering, storage_key};
use crate::error::StoreError;
use crate::introspect::RelationshipDescriptor;
use crate::models::ModelKey;
use crate::store::{CompareOp, Predicate, Record, StoreQuery};

/// One relationship lookup: rows of `relation` on `model` for the parent
/// whose join value is `parent` (its fk value for forward relations, its key
/// otherwise).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationKey {
    pub model: ModelKey,
    pub relation: String,
    pub parent: String,
}

impl RelationKey {
    /// Key for `relationship` on `row`, or `None` when the join value is null.
    pub fn for_row(model: &ModelKey, relationship: &RelationshipDescriptor, pk_column: &str, row: &Record) -> Option<Self> {
        let column = match (&relationship.column, &relationship.through) {
            (Some(column), None) => column.as_str(),
            _ => pk_column,
        };
        Some(Self {
            model: model.clone(),
            relation: relationship.name.clone(),
            parent: id_string(row.get(column)?)?,
        })
    }
}

/// Batches relationship loads of one schema.
pub struct RelationLoader {
    runtime: Arc<SchemaRuntime>,
}

impl RelationLoader {
    pub fn new(runtime: Arc<SchemaRuntime>) -> Self {
        Self { runtime }
    }

    async fn load_group(
        &self,
        model: &ModelKey,
        relation: &str,
        parents: &[String],
    ) -> Result<HashMap<String, Vec<Record>>, StoreError> {
        let models = &self.runtime.models;
        let (Some(owner), Some(rel)) = (
            models.get(model),
            models.get(model).and_then(|m| m.descriptor.relationship(relation)),
        ) else {
            return Ok(HashMap::new());
        };
        let Some(target) = models.target(owner, relation) else {
            return Ok(HashMap::new());
        };
        let target_desc = &target.descriptor;
        let order = ordering::compile(target, &[]).unwrap_or_default();
        let mut grouped: HashMap<String, Vec<Record>> = HashMap::new();

        if let Some(through) = &rel.through {
            let owner_kind = key_kind(&owner.descriptor);
            let keys: Vec<JsonValue> = parents.iter().map(|p| storage_key(&owner_kind, p)).collect();
            let links = self
                .runtime
                .read(&StoreQuery::new(&through.table).filter(Predicate::compare(
                    &through.source_column,
                    CompareOp::In,
                    JsonValue::Array(keys),
                    owner_kind.value_class(),
                )))
                .await?
                .rows;
            let target_kind = key_kind(target_desc);
            let mut target_ids: Vec<JsonValue> = Vec::new();
            for link in &links {
                if let Some(id) = link.get(&through.target_column)
                    && !target_ids.contains(id)
                {
                    target_ids.push(id.clone());
                }
            }
            if target_ids.is_empty() {
                return Ok(grouped);
            }
            let rows = self
                .runtime
                .read(
                    &StoreQuery::new(&target_desc.table)
                        .filter(Predicate::compare(
                            &target_desc.primary_key,
                            CompareOp::In,
                            JsonValue::Array(target_ids),
                            target_kind.value_class(),
                        ))
                        .order(order),
                )
                .await?
                .rows;
            // keep the target ordering within each parent
            for row in &rows {
                let Some(row_id) = row.get(&target_desc.primary_key).and_then(id_string) else {
                    continue;
                };
                for link in &links {
                    let linked = link.get(&through.target_column).and_then(id_string);
                    if linked.as_deref() != Some(row_id.as_str()) {
                        continue;
                    }
                    if let Some(parent) = link.get(&through.source_column).and_then(id_string) {
                        grouped.entry(parent).or_default().push(row.clone());
                    }
                }
            }
            return Ok(grouped);
        }

        let (column, kind, group_column) = match (&rel.column, &rel.remote_column) {
            (Some(_), _) => (
                target_desc.primary_key.clone(),
                key_kind(target_desc),
                target_desc.primary_key.clone(),
            ),
            (None, Some(remote)) => (remote.clone(), key_kind(&owner.descriptor), remote.clone()),
            (None, None) => return Ok(grouped),
        };
        let keys: Vec<JsonValue> = parents.iter().map(|p| storage_key(&kind, p)).collect();
        let rows = self
            .runtime
            .read(
                &StoreQuery::new(&target_desc.table)
                    .filter(Predicate::compare(
                        column,
                        CompareOp::In,
                        JsonValue::Array(keys),
                        kind.value_class(),
                    ))
                    .order(order),
            )
            .await?
            .rows;
        for row in rows {
            if let Some(parent) = row.get(&group_column).and_then(id_string) {
                grouped.entry(parent).or_default().push(row);
            }
        }
        Ok(grouped)
    }
}

impl Loader<RelationKey> for RelationLoader {
    type Value = Vec<Record>;
    type Error = Arc<StoreError>;

    async fn load(&self, keys: &[RelationKey]) -> Result<HashMap<RelationKey, Self::Value>, Self::Error> {
        let mut groups: BTreeMap<(&ModelKey, &str), Vec<String>> = BTreeMap::new();
        for key in keys {
            groups
                .entry((&key.model, key.relation.as_str()))
                .or_default()
                .push(key.parent.clone());
        }

        let mut result: HashMap<RelationKey, Vec<Record>> = keys.iter().map(|k| (k.clone(), Vec::new())).collect();
        for ((model, relation), parents) in groups {
            tracing::debug!(
                schema = %self.runtime.schema_name,
                model = %model,
                relation,
                parent_count = parents.len(),
                "Batch loading relation"
            );
            let mut grouped = self
                .load_group(model, relation, &parents)
                .await
                .map_err(Arc::new)?;
            for parent in parents {
                let key = RelationKey {
                    model: model.clone(),
                    relation: relation.to_string(),
                    parent: parent.clone(),
                };
                if let Some(rows) = grouped.remove(&parent) {
                    result.insert(key, rows);
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphql::testing::catalog_models;
    use crate::graphql::AllowAll;
    use crate::store::MemoryStore;
    use async_graphql::dataloader::DataLoader;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn runtime(store: MemoryStore) -> Arc<SchemaRuntime> {
        let (models, settings) = catalog_models();
        Arc::new(SchemaRuntime {
            schema_name: "catalog".into(),
            models,
            settings,
            store: Arc::new(store),
            catalog: crate::graphql::testing::catalog(),
            authorizer: Arc::new(AllowAll),
            notifier: None,
        })
    }

    #[tokio::test]
    async fn test_batches_each_relation_kind() {
        let store = MemoryStore::new();
        store.seed(
            "catalog_category",
            [row(json!({"id": 1, "name": "Lighting"})), row(json!({"id": 2, "name": "Desks"}))],
        );
        store.seed(
            "catalog_product",
            [
                row(json!({"id": 10, "name": "Lamp", "category_id": 1})),
                row(json!({"id": 11, "name": "Bulb", "category_id": 1})),
                row(json!({"id": 12, "name": "Desk", "category_id": 2})),
            ],
        );
        store.seed("catalog_tag", [row(json!({"id": 5, "name": "sale"}))]);
        store.seed(
            "catalog_product_tags",
            [row(json!({"id": 1, "product_id": 10, "tag_id": 5}))],
        );
        let loader = DataLoader::new(RelationLoader::new(runtime(store.clone())), tokio::spawn);
        let category = ModelKey::new("catalog", "Category");
        let product = ModelKey::new("catalog", "Product");
        let key = |model: &ModelKey, relation: &str, parent: &str| RelationKey {
            model: model.clone(),
            relation: relation.into(),
            parent: parent.into(),
        };

        let before = store.access_count();
        let sets = loader
            .load_many([key(&category, "product_set", "1"), key(&category, "product_set", "2")])
            .await
            .unwrap();
        assert_eq!(store.access_count() - before, 1);
        let names: Vec<&str> = sets[&key(&category, "product_set", "1")]
            .iter()
            .map(|r| r["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Bulb", "Lamp"]);

        let owner = loader.load_one(key(&product, "category", "2")).await.unwrap().unwrap();
        assert_eq!(owner[0]["name"], json!("Desks"));

        let tags = loader.load_one(key(&product, "tags", "10")).await.unwrap().unwrap();
        assert_eq!(tags[0]["name"], json!("sale"));
        let none = loader.load_one(key(&product, "tags", "12")).await.unwrap().unwrap();
        assert!(none.is_empty());
    }
}
