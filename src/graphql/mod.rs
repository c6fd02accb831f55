//! Runtime GraphQL synthesis
//!
//! Everything in here works against async-graphql's dynamic schema API: the
//! set of types and root fields is decided from model descriptors when a
//! schema is assembled, and the resolvers capture a shared [SchemaRuntime]
//! that carries the store, the catalog and the model metadata they need at
//! request time.
//!
//! Parent values flowing between resolvers are plain [Record]s (one row,
//! keyed by storage column) wrapped with `FieldValue::owned_any`.

pub mod auth;
pub mod filters;
mod loaders;
pub mod mutations;
pub mod naming;
pub mod operation;
pub mod ordering;
pub mod pagination;
pub mod payload;
pub mod queries;
pub mod scalars;
pub mod types;
mod validation;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_graphql::dynamic::{FieldValue, ResolverContext};
use convert_case::{Case, Casing};
use tracing::{debug, warn};

pub use auth::{AllowAll, AuthExt, Authorizer, CapabilityAuthorizer, Identity, RequestMeta};
pub use loaders::{RelationKey, RelationLoader};
pub use operation::{OperationDescriptor, OperationKind};

use crate::cache::{ChangeEvent, ChangeNotifier};
use crate::error::{StoreError, coded_error};
use crate::introspect::{DescriptorArena, Direction, FieldKind, ModelDescriptor, RelationshipDescriptor};
use crate::models::{Choice, ModelCatalog, ModelKey};
use crate::schema::SchemaSettings;
use crate::store::{DataStore, Record, StorePage, StoreQuery};
use naming::TypeNames;

/// One model as it appears in a schema.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub descriptor: Arc<ModelDescriptor>,
    pub names: TypeNames,
    /// Root operations are generated; `false` for models only reachable
    /// through relationships
    pub exposed: bool,
    /// Relationship name -> resolved target key. Relationships missing here
    /// are left out of the schema.
    pub targets: BTreeMap<String, ModelKey>,
}

impl ModelEntry {
    pub fn key(&self) -> &ModelKey {
        &self.descriptor.key
    }
}

/// Shared enum per distinct choice set.
#[derive(Debug, Clone, Default)]
pub struct ChoiceEnums {
    by_values: BTreeMap<Vec<String>, ChoiceEnum>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceEnum {
    pub name: String,
    /// (item, stored value)
    pub items: Vec<(String, String)>,
}

impl ChoiceEnum {
    pub fn item_for(&self, value: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(_, v)| v == value)
            .map(|(item, _)| item.as_str())
    }

    pub fn value_for(&self, item: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(i, _)| i == item)
            .map(|(_, value)| value.as_str())
    }
}

impl ChoiceEnums {
    fn values_of(choices: &[Choice]) -> Vec<String> {
        choices.iter().map(|c| c.value.clone()).collect()
    }

    /// Register `choices`, naming a new enum `name` unless the set is known.
    pub fn register(&mut self, name: impl FnOnce() -> String, choices: &[Choice]) {
        self.by_values
            .entry(Self::values_of(choices))
            .or_insert_with(|| ChoiceEnum {
                name: name(),
                items: naming::enum_items(choices),
            });
    }

    pub fn get(&self, choices: &[Choice]) -> Option<&ChoiceEnum> {
        self.by_values.get(&Self::values_of(choices))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChoiceEnum> {
        self.by_values.values()
    }

    pub fn len(&self) -> usize {
        self.by_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_values.is_empty()
    }
}

/// Models participating in one schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaModels {
    pub entries: BTreeMap<ModelKey, ModelEntry>,
    pub enums: ChoiceEnums,
    /// Reached but left out until they can be described
    pub skipped: BTreeSet<ModelKey>,
}

impl SchemaModels {
    pub fn get(&self, key: &ModelKey) -> Option<&ModelEntry> {
        self.entries.get(key)
    }

    /// Target entry of `relationship` on `owner`, when it is part of the schema.
    pub fn target(&self, owner: &ModelEntry, relationship: &str) -> Option<&ModelEntry> {
        owner
            .targets
            .get(relationship)
            .and_then(|key| self.entries.get(key))
    }

    /// Relationships of `owner` whose targets are part of the schema.
    pub fn relationships<'a>(
        &'a self,
        owner: &'a ModelEntry,
    ) -> impl Iterator<Item = (&'a RelationshipDescriptor, &'a ModelEntry)> + 'a {
        owner
            .descriptor
            .relationships()
            .filter_map(move |rel| self.target(owner, &rel.name).map(|target| (rel, target)))
    }

    pub fn exposed(&self) -> impl Iterator<Item = &ModelEntry> {
        self.entries.values().filter(|e| e.exposed)
    }

    /// Collect `roots` plus every model reachable from them through
    /// relationships. Reachable models get object types but no root
    /// operations. Abstract, excluded and unresolvable models are skipped
    /// with a warning.
    pub fn collect(
        arena: &DescriptorArena<'_>,
        roots: &[ModelKey],
        excluded: &BTreeSet<ModelKey>,
        settings: &SchemaSettings,
    ) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let mut found: BTreeMap<ModelKey, (Arc<ModelDescriptor>, bool)> = BTreeMap::new();
        let mut rejected: BTreeSet<ModelKey> = excluded.clone();
        let mut skipped = BTreeSet::new();
        let mut queue: VecDeque<(ModelKey, bool)> = roots.iter().map(|k| (k.clone(), true)).collect();

        let usable = |key: &ModelKey, warnings: &mut Vec<String>| -> Option<Arc<ModelDescriptor>> {
            let descriptor = match arena.get(key) {
                Ok(d) => d,
                Err(err) => {
                    warnings.push(format!("{key}: {err}"));
                    return None;
                }
            };
            if descriptor.inheritance.is_abstract {
                warnings.push(format!("{key}: abstract models have no rows and are not exposed"));
                return None;
            }
            let unresolved = arena.unresolved(&descriptor);
            if !unresolved.is_empty() {
                warnings.push(format!("{key}: unresolved relationships {}", unresolved.join(", ")));
                return None;
            }
            Some(descriptor)
        };

        while let Some((key, root)) = queue.pop_front() {
            if rejected.contains(&key) {
                continue;
            }
            if let Some((_, exposed)) = found.get_mut(&key) {
                *exposed |= root;
                continue;
            }
            let Some(descriptor) = usable(&key, &mut warnings) else {
                skipped.insert(key.clone());
                rejected.insert(key);
                continue;
            };
            for rel in descriptor.relationships() {
                if rel.direction == Direction::Reverse && !settings.include_reverse_relations {
                    continue;
                }
                if let Some(target) = arena.target(&descriptor, rel) {
                    queue.push_back((target.key.clone(), false));
                }
            }
            found.insert(key, (descriptor, root));
        }

        let names = naming::object_names(found.keys());
        let mut entries = BTreeMap::new();
        for (key, (descriptor, exposed)) in &found {
            let mut targets = BTreeMap::new();
            for rel in descriptor.relationships() {
                if rel.direction == Direction::Reverse && !settings.include_reverse_relations {
                    continue;
                }
                match arena.target(descriptor, rel) {
                    Some(target) if found.contains_key(&target.key) => {
                        targets.insert(rel.name.clone(), target.key.clone());
                    }
                    _ => debug!(model = %key, relationship = %rel.name, "Relationship target not in schema"),
                }
            }
            let object = names.get(key).cloned().unwrap_or_else(|| key.name.clone());
            entries.insert(
                key.clone(),
                ModelEntry {
                    names: TypeNames::new(&object, descriptor.plural.as_deref()),
                    descriptor: descriptor.clone(),
                    exposed: *exposed,
                    targets,
                },
            );
        }

        let mut enums = ChoiceEnums::default();
        for entry in entries.values() {
            for field in entry.descriptor.fields() {
                if let FieldKind::Enumeration(choices) = &field.kind {
                    enums.register(
                        || format!("{}{}", entry.names.object, field.name.to_case(Case::Pascal)),
                        choices,
                    );
                }
            }
        }

        (
            Self {
                entries,
                enums,
                skipped,
            },
            warnings,
        )
    }
}

/// State captured by every resolver of one built schema.
pub struct SchemaRuntime {
    pub schema_name: String,
    pub models: SchemaModels,
    pub settings: SchemaSettings,
    pub store: Arc<dyn DataStore>,
    pub catalog: Arc<ModelCatalog>,
    pub authorizer: Arc<dyn Authorizer>,
    pub notifier: Option<Weak<dyn ChangeNotifier>>,
}

impl SchemaRuntime {
    pub fn entry(&self, key: &ModelKey) -> async_graphql::Result<&ModelEntry> {
        self.models
            .get(key)
            .ok_or_else(|| coded_error("GENERAL", format!("model {key} is not part of this schema")))
    }

    /// Idempotent read, retried once on a transient store failure.
    pub async fn read(&self, query: &StoreQuery) -> Result<StorePage, StoreError> {
        match self.store.select(query).await {
            Err(err) if err.is_transient() => {
                warn!(schema = %self.schema_name, table = %query.table, error = %err, "Retrying read");
                self.store.select(query).await
            }
            other => other,
        }
    }

    pub fn permits(&self, ctx: &ResolverContext<'_>, operation: &OperationDescriptor) -> bool {
        self.authorizer.allows(ctx.identity(), operation)
    }

    pub fn notify(&self, event: ChangeEvent) {
        if let Some(notifier) = self.notifier.as_ref().and_then(Weak::upgrade) {
            notifier.notify(event);
        }
    }

    /// Log a failed store call with the request correlation id and convert it.
    pub fn store_failure(&self, ctx: &ResolverContext<'_>, err: StoreError) -> async_graphql::Error {
        warn!(
            schema = %self.schema_name,
            correlation_id = %ctx.correlation_id(),
            error = %err,
            "Store call failed"
        );
        err.to_graphql()
    }
}

/// Row of the resolver's parent value.
pub(crate) fn parent_record<'a>(ctx: &ResolverContext<'a>) -> async_graphql::Result<&'a Record> {
    ctx.parent_value
        .downcast_ref::<Record>()
        .ok_or_else(|| coded_error("GENERAL", "parent value is not a row"))
}

pub(crate) fn row_value(row: Record) -> FieldValue<'static> {
    FieldValue::owned_any(row)
}

/// Stored primary key rendered as a GraphQL `ID`.
pub(crate) fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Normalise a client supplied id to the storage type of `kind`.
pub(crate) fn storage_key(kind: &FieldKind, id: &str) -> serde_json::Value {
    match kind {
        FieldKind::Integer => id
            .parse::<i64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::String(id.to_string())),
        _ => serde_json::Value::String(id.to_string()),
    }
}

/// Primary key kind of `descriptor`.
pub(crate) fn key_kind(descriptor: &ModelDescriptor) -> FieldKind {
    descriptor
        .primary_field()
        .map(|f| f.kind.clone())
        .unwrap_or(FieldKind::Integer)
}
