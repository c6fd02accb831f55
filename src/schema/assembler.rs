//! Schema assembly
//!
//! [SchemaAssembler::build] is a pure function of the catalog state and the
//! spec: models are visited in key order and members in declaration order,
//! so the same inputs always produce the same SDL.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_graphql::dynamic::{Object, Schema};
use tracing::{debug, info, warn};

use super::{SchemaSettings, SchemaSpec};
use crate::cache::ChangeNotifier;
use crate::error::BuildError;
use crate::graphql::naming::field_name;
use crate::graphql::operation::OperationKind;
use crate::graphql::types::{GeneratedKind, GeneratedType, InputPurpose};
use crate::graphql::{
    Authorizer, OperationDescriptor, SchemaModels, SchemaRuntime, filters, mutations, pagination, payload, queries,
    scalars, types,
};
use crate::introspect::{DescriptorArena, Introspector};
use crate::models::ModelKey;
use crate::store::DataStore;

const QUERY: &str = "Query";
const MUTATION: &str = "Mutation";

/// Name, kind and owning model of one generated type.
pub type TypeInventory = Vec<(String, GeneratedKind, Option<ModelKey>)>;

/// An executable schema plus everything known about how it was built.
pub struct BuiltSchema {
    pub name: String,
    pub version: String,
    pub schema: Schema,
    pub sdl: String,
    /// Every model with an object type, exposed or not
    pub models: Vec<ModelKey>,
    /// Models with root operations
    pub exposed: Vec<ModelKey>,
    /// Models left out with unresolved relationships
    pub pending: BTreeSet<ModelKey>,
    pub warnings: Vec<String>,
    pub build_ms: f64,
    /// Fields whose children the safety analyzer multiplies
    pub list_fields: BTreeSet<String>,
    pub operations: Vec<OperationDescriptor>,
    pub types: TypeInventory,
    pub settings: SchemaSettings,
    pub runtime: Arc<SchemaRuntime>,
}

impl BuiltSchema {
    pub fn includes(&self, model: &ModelKey) -> bool {
        self.models.contains(model)
    }

    /// A change to `model` can alter this schema, including models it had
    /// to leave out.
    pub fn depends_on(&self, model: &ModelKey) -> bool {
        self.includes(model) || self.pending.contains(model)
    }
}

impl std::fmt::Debug for BuiltSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltSchema")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("models", &self.models)
            .field("pending", &self.pending)
            .field("warnings", &self.warnings)
            .field("build_ms", &self.build_ms)
            .finish()
    }
}

/// Builds schemas against one catalog, store and authorizer.
pub struct SchemaAssembler {
    introspector: Arc<Introspector>,
    store: Arc<dyn DataStore>,
    authorizer: Arc<dyn Authorizer>,
    notifier: Option<Weak<dyn ChangeNotifier>>,
}

impl SchemaAssembler {
    pub fn new(
        introspector: Arc<Introspector>,
        store: Arc<dyn DataStore>,
        authorizer: Arc<dyn Authorizer>,
        notifier: Option<Weak<dyn ChangeNotifier>>,
    ) -> Self {
        Self {
            introspector,
            store,
            authorizer,
            notifier,
        }
    }

    pub fn introspector(&self) -> &Arc<Introspector> {
        &self.introspector
    }

    /// Resolve model references, reporting the ones that match nothing.
    pub fn resolve_models(&self, references: &[String], warnings: &mut Vec<String>) -> Vec<ModelKey> {
        let catalog = self.introspector.catalog();
        let mut keys = Vec::new();
        for reference in references {
            match catalog.resolve(reference, "") {
                Some(key) if !keys.contains(&key) => keys.push(key),
                Some(_) => {}
                None => warnings.push(format!("model `{reference}` not found")),
            }
        }
        keys.sort();
        keys
    }

    pub fn build(&self, spec: &SchemaSpec) -> Result<BuiltSchema, BuildError> {
        let started = Instant::now();
        let settings = &spec.settings;
        let mut warnings = Vec::new();
        let roots = self.resolve_models(&spec.models, &mut warnings);
        let excluded: BTreeSet<ModelKey> = self
            .resolve_models(&spec.exclude_models, &mut warnings)
            .into_iter()
            .collect();

        let arena = DescriptorArena::new(&self.introspector);
        let (models, collect_warnings) = SchemaModels::collect(&arena, &roots, &excluded, settings);
        warnings.extend(collect_warnings);
        if models.exposed().next().is_none() {
            return Err(BuildError::NoModels(spec.name.clone()));
        }

        let runtime = Arc::new(SchemaRuntime {
            schema_name: spec.name.clone(),
            models,
            settings: settings.clone(),
            store: self.store.clone(),
            catalog: self.introspector.catalog().clone(),
            authorizer: self.authorizer.clone(),
            notifier: self.notifier.clone(),
        });
        let models = &runtime.models;

        let mut generated = Vec::new();
        for choice in models.enums.iter() {
            generated.push(GeneratedType::new(&choice.name, GeneratedKind::Enum, None, types::enum_type(choice)));
        }
        generated.push(GeneratedType::new(
            pagination::PAGE_INFO,
            GeneratedKind::Shared,
            None,
            pagination::page_info_type(),
        ));
        let (error_codes, error_object) = payload::shared_types();
        generated.push(GeneratedType::new(payload::ERROR_CODE, GeneratedKind::Shared, None, error_codes));
        generated.push(GeneratedType::new(payload::MUTATION_ERROR, GeneratedKind::Shared, None, error_object));

        let mut list_fields = BTreeSet::new();
        for entry in models.entries.values() {
            let key = Some(entry.key());
            let names = &entry.names;
            generated.push(GeneratedType::new(
                &names.object,
                GeneratedKind::Object,
                key,
                types::object_type(entry, &runtime),
            ));
            generated.push(GeneratedType::new(
                &names.filter,
                GeneratedKind::Input(InputPurpose::Filter),
                key,
                filters::filter_input(entry, models, settings),
            ));
            for (rel, _) in models.relationships(entry).filter(|(rel, _)| rel.is_list()) {
                list_fields.insert(field_name(&rel.name));
            }
            if !entry.exposed {
                continue;
            }
            generated.push(GeneratedType::new(
                &names.connection,
                GeneratedKind::Connection,
                key,
                pagination::connection_type(entry),
            ));
            generated.push(GeneratedType::new(&names.edge, GeneratedKind::Edge, key, pagination::edge_type(entry)));
            if settings.enable_mutations && !entry.descriptor.inheritance.is_abstract {
                generated.push(GeneratedType::new(
                    &names.create_input,
                    GeneratedKind::Input(InputPurpose::Create),
                    key,
                    types::input_type(entry, models, InputPurpose::Create),
                ));
                generated.push(GeneratedType::new(
                    &names.update_input,
                    GeneratedKind::Input(InputPurpose::Update),
                    key,
                    types::input_type(entry, models, InputPurpose::Update),
                ));
                generated.push(GeneratedType::new(
                    &names.payload,
                    GeneratedKind::Payload,
                    key,
                    payload::payload_type(entry),
                ));
                if settings.enable_bulk {
                    generated.push(GeneratedType::new(
                        &names.bulk_payload,
                        GeneratedKind::Payload,
                        key,
                        payload::bulk_payload_type(entry),
                    ));
                }
                if settings.enable_invocations {
                    generated.push(GeneratedType::new(
                        &names.invoke_payload,
                        GeneratedKind::Payload,
                        key,
                        payload::invoke_payload_type(entry),
                    ));
                }
            }
        }

        let (read_fields, read_warnings) = queries::root_fields(&runtime);
        let (write_fields, write_warnings) = mutations::root_fields(&runtime);
        warnings.extend(read_warnings);
        warnings.extend(write_warnings);

        let mut operations = Vec::new();
        let mut query = Object::new(QUERY);
        for (descriptor, field) in read_fields {
            if matches!(descriptor.kind, OperationKind::ListRead | OperationKind::PaginatedRead) {
                list_fields.insert(descriptor.name.clone());
            }
            query = query.field(field);
            operations.push(descriptor);
        }
        let has_mutations = !write_fields.is_empty();
        let mut mutation = Object::new(MUTATION);
        for (descriptor, field) in write_fields {
            mutation = mutation.field(field);
            operations.push(descriptor);
        }

        let mut builder = Schema::build(QUERY, has_mutations.then_some(MUTATION), None);
        builder = scalars::register(builder);
        let inventory: TypeInventory = generated
            .iter()
            .map(|t| (t.name.clone(), t.kind, t.model.clone()))
            .collect();
        for generated in generated {
            debug!(schema = %spec.name, ty = %generated.name, kind = ?generated.kind, "Registering type");
            builder = builder.register(generated.ty);
        }
        builder = builder.register(query);
        if has_mutations {
            builder = builder.register(mutation);
        }
        let schema = builder.finish().map_err(|err| BuildError::Invalid(err.to_string()))?;
        let sdl = schema.sdl();

        let build_ms = started.elapsed().as_secs_f64() * 1000.0;
        for warning in &warnings {
            warn!(schema = %spec.name, "{warning}");
        }
        info!(
            schema = %spec.name,
            models = models.entries.len(),
            operations = operations.len(),
            warnings = warnings.len(),
            build_ms,
            "Schema built"
        );
        Ok(BuiltSchema {
            name: spec.name.clone(),
            version: spec.version.clone(),
            sdl,
            schema,
            models: models.entries.keys().cloned().collect(),
            exposed: models.exposed().map(|e| e.key().clone()).collect(),
            pending: models.skipped.clone(),
            warnings,
            build_ms,
            list_fields,
            operations,
            types: inventory,
            settings: settings.clone(),
            runtime: runtime.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetadataCache;
    use crate::graphql::AllowAll;
    use crate::graphql::testing::catalog;
    use crate::models::{AttributeDefinition, ModelDefinition};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn assembler() -> SchemaAssembler {
        let introspector = Arc::new(Introspector::new(catalog(), Arc::new(MetadataCache::default())));
        SchemaAssembler::new(introspector, Arc::new(MemoryStore::new()), Arc::new(AllowAll), None)
    }

    #[test]
    fn test_build_is_deterministic() {
        let assembler = assembler();
        let spec = SchemaSpec::new("catalog").models(&["catalog.Product", "Category"]);
        let first = assembler.build(&spec).unwrap();
        let second = assembler.build(&spec).unwrap();
        assert_eq!(first.sdl, second.sdl);
        assert_eq!(first.operations, second.operations);

        // Tag is reachable through Product.tags but not a root
        assert!(first.includes(&ModelKey::new("catalog", "Tag")));
        assert!(!first.exposed.contains(&ModelKey::new("catalog", "Tag")));
        for expected in [
            "type Product",
            "productPages(",
            "products__active(",
            "product_pages_active(",
            "createProduct(",
            "bulkCreateProduct(",
            "invokeProductRestock(",
            "input ProductFilter",
            "enum ProductStatus",
        ] {
            assert!(first.sdl.contains(expected), "missing `{expected}`");
        }
        assert!(!first.sdl.contains("tagPages("), "Tag has no root operations");
        assert!(first.list_fields.contains("products"));
        assert!(first.list_fields.contains("productSet"));
    }

    #[test]
    fn test_settings_toggle_operations() {
        let assembler = assembler();
        let mut spec = SchemaSpec::new("readonly").models(&["Product"]);
        spec.settings.enable_mutations = false;
        let built = assembler.build(&spec).unwrap();
        assert!(built.operations.iter().all(|op| op.kind.is_read()));
        assert!(!built.sdl.contains("type Mutation"));
    }

    #[test]
    fn test_unresolved_and_missing_models() {
        let assembler = assembler();
        assembler
            .introspector()
            .catalog()
            .register(
                ModelDefinition::new("catalog", "Review")
                    .attribute(AttributeDefinition::field("body", "text"))
                    .attribute(AttributeDefinition::foreign_key("author", "accounts.User")),
            )
            .unwrap();
        let spec = SchemaSpec::new("partial").models(&["Category", "Review", "Ghost"]);
        let built = assembler.build(&spec).unwrap();
        assert!(!built.includes(&ModelKey::new("catalog", "Review")));
        assert!(built.depends_on(&ModelKey::new("catalog", "Review")));
        assert!(built.warnings.iter().any(|w| w.contains("Review")));
        assert!(built.warnings.iter().any(|w| w.contains("`Ghost` not found")));

        let empty = SchemaSpec::new("empty").models(&["Ghost"]);
        assert_matches!(assembler.build(&empty), Err(BuildError::NoModels(name)) if name == "empty");
    }
}
