//! Process-wide schema registry
//!
//! Readers load an immutable [RegistrySnapshot] through `ArcSwap` and never
//! block. Writers are serialized by a mutex, copy the current snapshot, edit
//! the copy and publish it, so a reader sees either the state before or
//! after an edit.
//!
//! Schemas are built lazily: an entry holds a `OnceCell` that the first
//! request fills. Any edit that changes what a schema would contain swaps in
//! a fresh cell instead of touching the old one, so in-flight requests keep
//! executing against the schema they started with.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::{BuiltSchema, SchemaAssembler, SchemaSpec, SchemaUpdate};
use crate::error::{BuildError, RegistryError};
use crate::models::ModelKey;

/// Builds retried when the catalog keeps changing mid-build.
const MAX_BUILD_ATTEMPTS: usize = 3;

/// One registered schema.
#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub spec: SchemaSpec,
    built: OnceCell<Arc<BuiltSchema>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SchemaEntry {
    fn new(spec: SchemaSpec) -> Self {
        let now = Utc::now();
        Self {
            spec,
            built: OnceCell::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn enabled(&self) -> bool {
        self.spec.enabled
    }

    /// The built schema, if a request has built it already.
    pub fn built(&self) -> Option<&Arc<BuiltSchema>> {
        self.built.get()
    }

    /// Same spec, new timestamps, nothing built.
    fn rebuilt(&self, spec: SchemaSpec) -> Self {
        Self {
            spec,
            built: OnceCell::new(),
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    /// Same entry with an empty cell, timestamps untouched.
    fn fresh_cell(&self) -> Self {
        Self {
            built: OnceCell::new(),
            ..self.clone()
        }
    }

    pub fn summary(&self) -> SchemaSummary {
        SchemaSummary {
            name: self.spec.name.clone(),
            version: self.spec.version.clone(),
            description: self.spec.description.clone(),
            enabled: self.spec.enabled,
            auto_discover: self.spec.auto_discover,
            built: self.built.get().is_some(),
            models: self
                .built
                .get()
                .map(|b| b.models.iter().map(ToString::to_string).collect())
                .unwrap_or_default(),
            warnings: self.built.get().map(|b| b.warnings.clone()).unwrap_or_default(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Serializable view of an entry for management surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaSummary {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub auto_discover: bool,
    pub built: bool,
    pub models: Vec<String>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable view of all entries.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub entries: BTreeMap<String, Arc<SchemaEntry>>,
}

pub struct SchemaRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    writes: Mutex<()>,
    assembler: Arc<SchemaAssembler>,
}

impl SchemaRegistry {
    pub fn new(assembler: Arc<SchemaAssembler>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            writes: Mutex::new(()),
            assembler,
        }
    }

    pub fn assembler(&self) -> &Arc<SchemaAssembler> {
        &self.assembler
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Copy, edit and publish the snapshot under the write lock.
    fn edit<T>(&self, change: impl FnOnce(&mut RegistrySnapshot) -> Result<T, RegistryError>) -> Result<T, RegistryError> {
        let _guard = self.writes.lock();
        let mut next = (*self.snapshot.load_full()).clone();
        let result = change(&mut next)?;
        self.snapshot.store(Arc::new(next));
        Ok(result)
    }

    pub fn register(&self, spec: SchemaSpec) -> Result<Arc<SchemaEntry>, RegistryError> {
        spec.validate()?;
        let entry = self.edit(|snap| {
            if snap.entries.contains_key(&spec.name) {
                return Err(RegistryError::Duplicate(spec.name.clone()));
            }
            let entry = Arc::new(SchemaEntry::new(spec));
            snap.entries.insert(entry.spec.name.clone(), entry.clone());
            Ok(entry)
        })?;
        info!(schema = %entry.name(), version = %entry.spec.version, "Registered schema");
        Ok(entry)
    }

    /// Register or overwrite, keeping the original creation time.
    pub fn replace(&self, spec: SchemaSpec) -> Result<Arc<SchemaEntry>, RegistryError> {
        spec.validate()?;
        let entry = self.edit(|snap| {
            let entry = match snap.entries.get(&spec.name) {
                Some(existing) => Arc::new(existing.rebuilt(spec)),
                None => Arc::new(SchemaEntry::new(spec)),
            };
            snap.entries.insert(entry.spec.name.clone(), entry.clone());
            Ok(entry)
        })?;
        info!(schema = %entry.name(), "Replaced schema");
        Ok(entry)
    }

    pub fn update(&self, name: &str, update: SchemaUpdate) -> Result<Arc<SchemaEntry>, RegistryError> {
        let entry = self.edit(|snap| {
            let current = snap
                .entries
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            let mut spec = current.spec.clone();
            let rebuild = update.affects_build();
            if let Some(description) = update.description {
                spec.description = Some(description);
            }
            if let Some(version) = update.version {
                spec.version = version;
            }
            if let Some(models) = update.models {
                spec.models = models;
            }
            if let Some(excluded) = update.exclude_models {
                spec.exclude_models = excluded;
            }
            if let Some(enabled) = update.enabled {
                spec.enabled = enabled;
            }
            if let Some(auto_discover) = update.auto_discover {
                spec.auto_discover = auto_discover;
            }
            if let Some(settings) = update.settings {
                spec.settings = settings;
            }
            spec.validate()?;
            let next = if rebuild {
                current.rebuilt(spec)
            } else {
                SchemaEntry {
                    spec,
                    built: current.built.clone(),
                    created_at: current.created_at,
                    updated_at: Utc::now(),
                }
            };
            let next = Arc::new(next);
            snap.entries.insert(name.to_string(), next.clone());
            Ok(next)
        })?;
        info!(schema = %name, "Updated schema");
        Ok(entry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<SchemaEntry>> {
        self.snapshot.load().entries.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<SchemaEntry>> {
        self.snapshot.load().entries.values().cloned().collect()
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<Arc<SchemaEntry>, RegistryError> {
        let entry = self.edit(|snap| {
            let current = snap
                .entries
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            let mut next = (**current).clone();
            next.spec.enabled = enabled;
            next.updated_at = Utc::now();
            let next = Arc::new(next);
            snap.entries.insert(name.to_string(), next.clone());
            Ok(next)
        })?;
        info!(schema = %name, enabled, "Schema availability changed");
        Ok(entry)
    }

    pub fn enable(&self, name: &str) -> Result<Arc<SchemaEntry>, RegistryError> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<Arc<SchemaEntry>, RegistryError> {
        self.set_enabled(name, false)
    }

    pub fn remove(&self, name: &str) -> Result<Arc<SchemaEntry>, RegistryError> {
        let removed = self.edit(|snap| {
            snap.entries
                .remove(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))
        })?;
        info!(schema = %name, "Removed schema");
        Ok(removed)
    }

    pub fn clear_all(&self) -> usize {
        let removed = self
            .edit(|snap| Ok(std::mem::take(&mut snap.entries).len()))
            .unwrap_or_default();
        info!(removed, "Cleared schema registry");
        removed
    }

    /// Built schema for serving `name`, building it on first use.
    pub fn schema(&self, name: &str) -> Result<Arc<BuiltSchema>, RegistryError> {
        let entry = self
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if !entry.enabled() {
            return Err(RegistryError::Disabled(name.to_string()));
        }
        self.build_entry(&entry)
    }

    /// Build (or return the already built) schema of `entry`, enabled or not.
    pub fn build_entry(&self, entry: &SchemaEntry) -> Result<Arc<BuiltSchema>, RegistryError> {
        entry
            .built
            .get_or_try_init(|| self.assemble_settled(&entry.spec))
            .cloned()
            .map_err(|source| RegistryError::Build {
                name: entry.spec.name.clone(),
                source,
            })
    }

    /// Assemble `spec`, starting over while the catalog structure changes
    /// underneath the build.
    fn assemble_settled(&self, spec: &SchemaSpec) -> Result<Arc<BuiltSchema>, BuildError> {
        let catalog = self.assembler.introspector().catalog();
        let mut attempt = 1;
        loop {
            let generation = catalog.generation();
            let built = self.assembler.build(spec)?;
            if catalog.generation() == generation || attempt == MAX_BUILD_ATTEMPTS {
                return Ok(Arc::new(built));
            }
            debug!(schema = %spec.name, attempt, "Model structure changed during build, rebuilding");
            attempt += 1;
        }
    }

    /// Drop the built schema of every entry that includes `model`. Returns
    /// the names of the invalidated schemas.
    ///
    /// Entries not built yet get a fresh cell too: a build already running
    /// on the old cell may have read the previous structure.
    pub fn invalidate_model(&self, model: &ModelKey) -> Vec<String> {
        let invalidated = self
            .edit(|snap| {
                let mut names = Vec::new();
                for (name, entry) in snap.entries.iter_mut() {
                    let Some(built) = entry.built() else {
                        *entry = Arc::new(entry.fresh_cell());
                        continue;
                    };
                    let affected = built.depends_on(model) || entry.spec.auto_discover;
                    if affected {
                        *entry = Arc::new(entry.rebuilt(entry.spec.clone()));
                        names.push(name.clone());
                    }
                }
                Ok(names)
            })
            .unwrap_or_default();
        if !invalidated.is_empty() {
            debug!(model = %model, schemas = ?invalidated, "Invalidated built schemas");
        }
        invalidated
    }

    /// Drop every built schema.
    pub fn invalidate_all(&self) -> usize {
        self.edit(|snap| {
            let mut count = 0;
            for entry in snap.entries.values_mut() {
                if entry.built().is_some() {
                    *entry = Arc::new(entry.rebuilt(entry.spec.clone()));
                    count += 1;
                }
            }
            Ok(count)
        })
        .unwrap_or_default()
    }

    /// Edit the entry map under the write lock, without validation.
    pub(super) fn edit_specs<T: Default>(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, Arc<SchemaEntry>>) -> T,
    ) -> T {
        self.edit(|snap| Ok(change(&mut snap.entries))).unwrap_or_default()
    }

    pub(super) fn rebuilt_entry(entry: &SchemaEntry, spec: SchemaSpec) -> Arc<SchemaEntry> {
        Arc::new(entry.rebuilt(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetadataCache;
    use crate::graphql::AllowAll;
    use crate::graphql::testing::catalog;
    use crate::introspect::Introspector;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn registry() -> SchemaRegistry {
        let introspector = Arc::new(Introspector::new(catalog(), Arc::new(MetadataCache::default())));
        SchemaRegistry::new(Arc::new(SchemaAssembler::new(
            introspector,
            Arc::new(MemoryStore::new()),
            Arc::new(AllowAll),
            None,
        )))
    }

    #[test]
    fn test_register_and_duplicate() {
        let registry = registry();
        registry
            .register(SchemaSpec::new("catalog").models(&["Product"]))
            .unwrap();
        assert_matches!(
            registry.register(SchemaSpec::new("catalog")),
            Err(RegistryError::Duplicate(name)) if name == "catalog"
        );
        assert_matches!(
            registry.register(SchemaSpec::new("bad name!")),
            Err(RegistryError::InvalidSpec(_))
        );
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_disabled_schema_refuses_requests() {
        let registry = registry();
        registry
            .register(SchemaSpec::new("catalog").models(&["Product"]))
            .unwrap();
        registry.disable("catalog").unwrap();
        assert_matches!(registry.schema("catalog"), Err(RegistryError::Disabled(_)));
        assert!(registry.get("catalog").is_some());
        registry.enable("catalog").unwrap();
        assert!(registry.schema("catalog").is_ok());
        assert_matches!(registry.schema("missing"), Err(RegistryError::NotFound(_)));
    }

    #[test]
    fn test_snapshot_readers_keep_old_state() {
        let registry = registry();
        registry
            .register(SchemaSpec::new("catalog").models(&["Product"]))
            .unwrap();
        let before = registry.snapshot();
        registry.remove("catalog").unwrap();
        assert!(before.entries.contains_key("catalog"));
        assert!(registry.snapshot().entries.is_empty());
    }

    #[test]
    fn test_update_rebuilds_only_when_needed() {
        let registry = registry();
        registry
            .register(SchemaSpec::new("catalog").models(&["Product"]))
            .unwrap();
        let first = registry.schema("catalog").unwrap();

        registry
            .update(
                "catalog",
                SchemaUpdate {
                    description: Some("Storefront".into()),
                    ..SchemaUpdate::default()
                },
            )
            .unwrap();
        assert!(Arc::ptr_eq(&first, &registry.schema("catalog").unwrap()));

        registry
            .update(
                "catalog",
                SchemaUpdate {
                    models: Some(vec!["Category".into()]),
                    ..SchemaUpdate::default()
                },
            )
            .unwrap();
        let second = registry.schema("catalog").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.exposed, vec![ModelKey::new("catalog", "Category")]);
    }

    #[test]
    fn test_invalidate_model_only_touches_dependents() {
        let registry = registry();
        registry
            .register(SchemaSpec::new("products").models(&["Product"]))
            .unwrap();
        registry
            .register(SchemaSpec::new("tags").models(&["Tag"]).settings(crate::schema::SchemaSettings {
                include_reverse_relations: false,
                ..Default::default()
            }))
            .unwrap();
        registry.schema("products").unwrap();
        registry.schema("tags").unwrap();

        let invalidated = registry.invalidate_model(&ModelKey::new("catalog", "Category"));
        assert_eq!(invalidated, vec!["products".to_string()]);
        assert!(registry.get("tags").unwrap().built().is_some());
        assert!(registry.get("products").unwrap().built().is_none());
        assert_eq!(registry.clear_all(), 2);
    }

    #[test]
    fn test_build_finishing_after_structure_change_is_not_served() {
        let registry = registry();
        registry
            .register(SchemaSpec::new("products").models(&["Product"]))
            .unwrap();
        let pending = registry.get("products").unwrap();

        // nothing was built yet, so no schema counts as invalidated
        assert!(registry.invalidate_model(&ModelKey::new("catalog", "Category")).is_empty());
        let stale = registry.build_entry(&pending).unwrap();

        let current = registry.get("products").unwrap();
        assert!(!Arc::ptr_eq(&pending, &current));
        assert!(current.built().is_none());
        assert_eq!(current.created_at, pending.created_at);
        assert!(!Arc::ptr_eq(&stale, &registry.schema("products").unwrap()));
    }
}
