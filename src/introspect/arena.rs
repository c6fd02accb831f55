//! Descriptor arena with lazy relationship resolution.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Introspector, ModelDescriptor, RelationshipDescriptor};
use crate::error::IntrospectionError;
use crate::models::ModelKey;

/// Descriptors indexed by key for the duration of one schema build.
///
/// Relationships hold only target keys; the arena turns a key into a
/// descriptor on demand, retrying catalog resolution for targets that were
/// missing when the owning descriptor was built.
pub struct DescriptorArena<'a> {
    introspector: &'a Introspector,
    slots: Mutex<BTreeMap<ModelKey, Arc<ModelDescriptor>>>,
}

impl<'a> DescriptorArena<'a> {
    pub fn new(introspector: &'a Introspector) -> Self {
        Self {
            introspector,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, key: &ModelKey) -> Result<Arc<ModelDescriptor>, IntrospectionError> {
        if let Some(found) = self.slots.lock().get(key) {
            return Ok(found.clone());
        }
        let descriptor = self.introspector.describe(key)?;
        self.slots.lock().insert(key.clone(), descriptor.clone());
        Ok(descriptor)
    }

    /// Target descriptor of `relationship`, or `None` when still unresolvable.
    pub fn target(
        &self,
        owner: &ModelDescriptor,
        relationship: &RelationshipDescriptor,
    ) -> Option<Arc<ModelDescriptor>> {
        let catalog = self.introspector.catalog();
        let key = if catalog.contains(&relationship.target) {
            relationship.target.clone()
        } else if relationship.reference == "self" {
            owner.key.clone()
        } else {
            catalog.resolve(&relationship.reference, &owner.key.namespace)?
        };
        self.get(&key).ok()
    }

    /// Names of relationships on `descriptor` whose targets cannot be resolved now.
    pub fn unresolved(&self, descriptor: &ModelDescriptor) -> Vec<String> {
        descriptor
            .relationships()
            .filter(|rel| self.target(descriptor, rel).is_none())
            .map(|rel| format!("{} -> {}", rel.name, rel.reference))
            .collect()
    }
}
