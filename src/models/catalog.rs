//! Registry of host model definitions plus the structure-change feed.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, info};

use super::{ModelDefinition, ModelKey};
use crate::error::CatalogError;
use crate::store::Record;

/// Read-only computation backing a method or property field.
pub type ComputeFn = dyn Fn(&Record, &JsonMap<String, JsonValue>) -> Result<JsonValue, String> + Send + Sync;

/// Row-mutating computation backing an invokable method.
pub type MutateFn =
    dyn Fn(&mut Record, &JsonMap<String, JsonValue>) -> Result<JsonValue, String> + Send + Sync;

#[derive(Clone)]
pub enum MethodHandler {
    Compute(Arc<ComputeFn>),
    Mutate(Arc<MutateFn>),
}

impl std::fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodHandler::Compute(_) => f.write_str("MethodHandler::Compute"),
            MethodHandler::Mutate(_) => f.write_str("MethodHandler::Mutate"),
        }
    }
}

/// Notified after a model's declared structure changes.
pub trait StructureListener: Send + Sync {
    fn on_structure_change(&self, model: &ModelKey);
}

/// What changed between two versions of a definition.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StructureDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    /// Meta options (parents, managers, ordering, constraints) differ
    pub meta_changed: bool,
}

impl StructureDiff {
    pub fn between(old: &ModelDefinition, new: &ModelDefinition) -> Self {
        let mut diff = StructureDiff::default();
        for attr in &new.attributes {
            match old.find_attribute(&attr.name) {
                None => diff.added.push(attr.name.clone()),
                Some(previous) if previous != attr => diff.changed.push(attr.name.clone()),
                Some(_) => {}
            }
        }
        for attr in &old.attributes {
            if new.find_attribute(&attr.name).is_none() {
                diff.removed.push(attr.name.clone());
            }
        }
        diff.meta_changed = old.parents != new.parents
            || old.managers != new.managers
            || old.ordering != new.ordering
            || old.unique_together != new.unique_together
            || old.is_abstract != new.is_abstract
            || old.table != new.table
            || old.plural != new.plural;
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty() && !self.meta_changed
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    models: Vec<ModelDefinition>,
}

/// All model definitions known to the process.
///
/// Every structural edit bumps [ModelCatalog::generation] and notifies the
/// subscribed listeners; listeners that have been dropped are pruned.
#[derive(Default)]
pub struct ModelCatalog {
    definitions: RwLock<BTreeMap<ModelKey, Arc<ModelDefinition>>>,
    methods: RwLock<HashMap<(ModelKey, String), MethodHandler>>,
    listeners: RwLock<Vec<Weak<dyn StructureListener>>>,
    generation: AtomicU64,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(
        definitions: impl IntoIterator<Item = ModelDefinition>,
    ) -> Result<Self, CatalogError> {
        let catalog = Self::new();
        for def in definitions {
            catalog.register(def)?;
        }
        Ok(catalog)
    }

    /// Parse a `models:` YAML document.
    pub fn from_yaml_str(source: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_yaml::from_str(source)?;
        Self::from_definitions(file.models)
    }

    pub fn load_yaml(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_yaml_str(&source)?;
        info!(path = %path.display(), models = catalog.len(), "Loaded model catalog");
        Ok(catalog)
    }

    pub fn register(&self, definition: ModelDefinition) -> Result<ModelKey, CatalogError> {
        let key = ModelKey::new(&definition.namespace, &definition.name);
        {
            let mut defs = self.definitions.write();
            if defs.contains_key(&key) {
                return Err(CatalogError::Duplicate(key));
            }
            defs.insert(key.clone(), Arc::new(definition));
        }
        debug!(model = %key, "Registered model definition");
        self.structure_changed(&key);
        Ok(key)
    }

    /// Replace an existing definition. Listeners fire only when the structure differs.
    pub fn alter(&self, definition: ModelDefinition) -> Result<StructureDiff, CatalogError> {
        let key = ModelKey::new(&definition.namespace, &definition.name);
        let diff = {
            let mut defs = self.definitions.write();
            let previous = defs
                .get(&key)
                .cloned()
                .ok_or_else(|| CatalogError::Unknown(key.clone()))?;
            let diff = StructureDiff::between(&previous, &definition);
            defs.insert(key.clone(), Arc::new(definition));
            diff
        };
        if !diff.is_empty() {
            info!(
                model = %key,
                added = ?diff.added,
                removed = ?diff.removed,
                changed = ?diff.changed,
                "Model structure altered"
            );
            self.structure_changed(&key);
        }
        Ok(diff)
    }

    pub fn remove(&self, key: &ModelKey) -> Option<Arc<ModelDefinition>> {
        let removed = self.definitions.write().remove(key);
        if removed.is_some() {
            self.methods.write().retain(|(model, _), _| model != key);
            self.structure_changed(key);
        }
        removed
    }

    pub fn get(&self, key: &ModelKey) -> Option<Arc<ModelDefinition>> {
        self.definitions.read().get(key).cloned()
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.definitions.read().contains_key(key)
    }

    /// Keys in stable (sorted) order.
    pub fn keys(&self) -> Vec<ModelKey> {
        self.definitions.read().keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<Arc<ModelDefinition>> {
        self.definitions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve `"ns.Name"` exactly, or a bare `"Name"` in `default_namespace`
    /// first and then in any namespace when unambiguous.
    pub fn resolve(&self, reference: &str, default_namespace: &str) -> Option<ModelKey> {
        let defs = self.definitions.read();
        if reference.contains('.') {
            let key = ModelKey::parse(reference, default_namespace);
            return defs.contains_key(&key).then_some(key);
        }
        let local = ModelKey::new(default_namespace, reference);
        if defs.contains_key(&local) {
            return Some(local);
        }
        let mut candidates = defs.keys().filter(|k| k.name == reference);
        match (candidates.next(), candidates.next()) {
            (Some(only), None) => Some(only.clone()),
            _ => None,
        }
    }

    pub fn register_compute<F>(&self, model: &ModelKey, method: &str, handler: F)
    where
        F: Fn(&Record, &JsonMap<String, JsonValue>) -> Result<JsonValue, String> + Send + Sync + 'static,
    {
        self.methods.write().insert(
            (model.clone(), method.to_string()),
            MethodHandler::Compute(Arc::new(handler)),
        );
    }

    pub fn register_mutate<F>(&self, model: &ModelKey, method: &str, handler: F)
    where
        F: Fn(&mut Record, &JsonMap<String, JsonValue>) -> Result<JsonValue, String>
            + Send
            + Sync
            + 'static,
    {
        self.methods.write().insert(
            (model.clone(), method.to_string()),
            MethodHandler::Mutate(Arc::new(handler)),
        );
    }

    pub fn method(&self, model: &ModelKey, method: &str) -> Option<MethodHandler> {
        self.methods
            .read()
            .get(&(model.clone(), method.to_string()))
            .cloned()
    }

    pub fn subscribe(&self, listener: Weak<dyn StructureListener>) {
        self.listeners.write().push(listener);
    }

    /// Incremented on every structural edit.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn structure_changed(&self, key: &ModelKey) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let live: Vec<Arc<dyn StructureListener>> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.on_structure_change(key);
        }
    }
}
