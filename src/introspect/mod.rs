//! Model introspection
//!
//! Turns catalog definitions into immutable [ModelDescriptor]s: every
//! declared attribute is classified as a field, relationship or method,
//! inherited attributes are merged (child overrides win), reverse
//! relationships are discovered by scanning the catalog, and every manager
//! becomes an accessor. Results are memoized in the metadata cache until a
//! structural change invalidates them.

mod arena;
mod descriptor;

use std::collections::HashSet;
use std::sync::Arc;

use convert_case::{Case, Casing};
use tracing::{debug, warn};

pub use arena::DescriptorArena;
pub use descriptor::*;

use crate::cache::{CacheKey, MetadataCache};
use crate::error::IntrospectionError;
use crate::models::{
    AttributeDefinition, ModelCatalog, ModelDefinition, ModelKey, OnDelete, ValidatorDefinition,
};

/// Cache method tag for descriptors.
pub const DESCRIBE: &str = "describe";

const SLUG_PATTERN: &str = r"^[-a-zA-Z0-9_]+$";

pub struct Introspector {
    catalog: Arc<ModelCatalog>,
    cache: Arc<MetadataCache>,
}

impl Introspector {
    pub fn new(catalog: Arc<ModelCatalog>, cache: Arc<MetadataCache>) -> Self {
        Self { catalog, cache }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    /// Describe `key`, memoized per process until a structural change.
    pub fn describe(&self, key: &ModelKey) -> Result<Arc<ModelDescriptor>, IntrospectionError> {
        self.cache
            .try_get_or_compute(CacheKey::new(DESCRIBE, Some(key)), None, || {
                self.build(key).map(Arc::new)
            })
    }

    /// Models whose descriptors embed facts about `key` (relations in either
    /// direction, ancestors and descendants).
    pub fn dependents(&self, key: &ModelKey) -> Vec<ModelKey> {
        let own = self.catalog.get(key);
        let mut found = Vec::new();
        for def in self.catalog.definitions() {
            let other = ModelKey::new(&def.namespace, &def.name);
            if &other == key {
                continue;
            }
            let refers_to_key = def
                .attributes
                .iter()
                .filter_map(|a| a.target.as_deref())
                .chain(def.parents.iter().map(String::as_str))
                .any(|r| self.resolve_reference(r, &def.namespace, &other).as_ref() == Some(key));
            let referenced_by_key = own.as_ref().is_some_and(|own| {
                own.attributes
                    .iter()
                    .filter_map(|a| a.target.as_deref())
                    .chain(own.parents.iter().map(String::as_str))
                    .any(|r| self.resolve_reference(r, &own.namespace, key).as_ref() == Some(&other))
            });
            if refers_to_key || referenced_by_key {
                found.push(other);
            }
        }
        found
    }

    fn resolve_reference(&self, reference: &str, namespace: &str, owner: &ModelKey) -> Option<ModelKey> {
        if reference == "self" {
            return Some(owner.clone());
        }
        self.catalog.resolve(reference, namespace)
    }

    /// Definitions of `key` and its ancestors, nearest first.
    fn lineage(&self, key: &ModelKey) -> Result<Vec<Arc<ModelDefinition>>, IntrospectionError> {
        let mut chain = Vec::new();
        let mut visiting = HashSet::new();
        self.walk_lineage(key, &mut visiting, &mut chain)?;
        Ok(chain)
    }

    fn walk_lineage(
        &self,
        key: &ModelKey,
        visiting: &mut HashSet<ModelKey>,
        chain: &mut Vec<Arc<ModelDefinition>>,
    ) -> Result<(), IntrospectionError> {
        if !visiting.insert(key.clone()) {
            return Err(IntrospectionError::InheritanceCycle(key.clone()));
        }
        let def = self
            .catalog
            .get(key)
            .ok_or_else(|| IntrospectionError::UnknownModel(key.clone()))?;
        chain.push(def.clone());
        for parent in &def.parents {
            let parent_key = self.catalog.resolve(parent, &def.namespace).ok_or_else(|| {
                IntrospectionError::UnknownParent {
                    model: key.clone(),
                    parent: parent.clone(),
                }
            })?;
            if visiting.contains(&parent_key) {
                return Err(IntrospectionError::InheritanceCycle(parent_key));
            }
            if chain
                .iter()
                .any(|d| d.namespace == parent_key.namespace && d.name == parent_key.name)
            {
                continue;
            }
            self.walk_lineage(&parent_key, visiting, chain)?;
        }
        visiting.remove(key);
        Ok(())
    }

    /// Attributes after inheritance: ancestors' first, overrides replace in place.
    fn merged_attributes(&self, lineage: &[Arc<ModelDefinition>]) -> Vec<AttributeDefinition> {
        let mut merged: Vec<AttributeDefinition> = Vec::new();
        for def in lineage.iter().rev() {
            for attr in &def.attributes {
                match merged.iter_mut().find(|a| a.name == attr.name) {
                    Some(slot) => *slot = attr.clone(),
                    None => merged.push(attr.clone()),
                }
            }
        }
        merged
    }

    fn build(&self, key: &ModelKey) -> Result<ModelDescriptor, IntrospectionError> {
        let lineage = self.lineage(key)?;
        let def = lineage[0].clone();
        let table = table_name(&def);
        let mut warnings = Vec::new();
        let mut unresolved = Vec::new();
        let mut members = Vec::new();

        for attr in self.merged_attributes(&lineage) {
            match self.classify(key, &def, &table, &attr) {
                Classified::Member(member, missing_target) => {
                    if missing_target {
                        unresolved.push(UnresolvedTarget {
                            member: attr.name.clone(),
                            reference: attr.target.clone().unwrap_or_default(),
                        });
                    }
                    members.push(member);
                }
                Classified::Skipped(reason) => {
                    warn!(model = %key, attribute = %attr.name, %reason, "Attribute excluded");
                    warnings.push(format!("{}: {}", attr.name, reason));
                }
            }
        }

        let primary_key = match members.iter().find_map(|m| match m {
            Member::Field(f) if f.primary_key => Some(f.name.clone()),
            _ => None,
        }) {
            Some(pk) => pk,
            None => {
                members.insert(0, Member::Field(implicit_primary_key()));
                "id".to_string()
            }
        };

        if !def.is_abstract {
            self.add_reverse_relationships(key, &mut members, &mut warnings);
        }

        let accessors = accessors_for(&def);
        let ancestors = lineage
            .iter()
            .skip(1)
            .map(|d| ModelKey::new(&d.namespace, &d.name))
            .collect();
        let children = self.children_of(key);

        debug!(model = %key, members = members.len(), unresolved = unresolved.len(), "Described model");
        Ok(ModelDescriptor {
            key: key.clone(),
            table,
            primary_key,
            description: def.description.clone(),
            plural: def.plural.clone(),
            members,
            inheritance: Inheritance {
                is_abstract: def.is_abstract,
                ancestors,
                children,
            },
            unique_together: def.unique_together.clone(),
            ordering: def.ordering.clone(),
            accessors,
            unresolved,
            schema_relevant: def.schema_relevant,
            warnings,
        })
    }

    fn children_of(&self, key: &ModelKey) -> Vec<ModelKey> {
        self.catalog
            .keys()
            .into_iter()
            .filter(|other| other != key)
            .filter(|other| {
                self.lineage(other)
                    .map(|chain| {
                        chain
                            .iter()
                            .skip(1)
                            .any(|d| d.namespace == key.namespace && d.name == key.name)
                    })
                    .unwrap_or(false)
            })
            .collect()
    }

    fn classify(
        &self,
        owner: &ModelKey,
        def: &ModelDefinition,
        table: &str,
        attr: &AttributeDefinition,
    ) -> Classified {
        let kind = attr.type_name.to_ascii_lowercase();
        match kind.as_str() {
            "foreign_key" | "fk" | "one_to_one" | "many_to_many" | "m2m" => {
                let Some(reference) = attr.target.clone() else {
                    return Classified::Skipped("relationship declares no target".into());
                };
                let resolved = self.resolve_reference(&reference, &def.namespace, owner);
                let missing = resolved.is_none();
                let target = resolved.unwrap_or_else(|| ModelKey::parse(&reference, &def.namespace));
                let related_name = match attr.related_name.as_deref() {
                    Some("+") => None,
                    Some(name) => Some(name.to_string()),
                    None => Some(default_reverse_name(&kind, &owner.name)),
                };
                let many = matches!(kind.as_str(), "many_to_many" | "m2m");
                let through = many.then(|| forward_through(attr, table, owner, &target));
                let column = (!many).then(|| attr.column.clone().unwrap_or_else(|| format!("{}_id", attr.name)));
                Classified::Member(
                    Member::Relationship(RelationshipDescriptor {
                        name: attr.name.clone(),
                        kind: if many {
                            RelationKind::ManyToMany
                        } else {
                            RelationKind::ToOne
                        },
                        direction: Direction::Forward,
                        target,
                        reference,
                        on_delete: attr.on_delete.unwrap_or(OnDelete::Cascade),
                        related_name,
                        column,
                        remote_column: None,
                        through,
                        nullable: attr.null || many,
                        editable: attr.editable,
                        unique: attr.unique || kind == "one_to_one",
                        default: attr.default.clone(),
                        help_text: attr.help_text.clone(),
                    }),
                    missing,
                )
            }
            "method" | "property" => {
                let property = kind == "property";
                let returns = attr
                    .returns
                    .as_deref()
                    .and_then(scalar_kind)
                    .map(|s| s.kind)
                    .unwrap_or(FieldKind::Json);
                let params = attr
                    .params
                    .iter()
                    .map(|p| ParamDescriptor {
                        name: p.name.clone(),
                        kind: scalar_kind(&p.type_name)
                            .map(|s| s.kind)
                            .unwrap_or(FieldKind::Json),
                        required: p.required,
                    })
                    .collect();
                Classified::Member(
                    Member::Method(MethodDescriptor {
                        name: attr.name.clone(),
                        returns,
                        params,
                        read_only: property || !attr.mutating,
                        property,
                        invokable: attr.invokable,
                        help_text: attr.help_text.clone(),
                    }),
                    false,
                )
            }
            other => {
                let scalar = scalar_kind(other).unwrap_or_else(|| ScalarKind {
                    kind: FieldKind::Other(attr.type_name.clone()),
                    auto: false,
                    validators: Vec::new(),
                    min_value: None,
                });
                if let FieldKind::Other(raw) = &scalar.kind {
                    warn!(model = %owner, attribute = %attr.name, kind = %raw, "Unmapped field kind exposed as JSON");
                }
                let kind = if attr.choices.is_empty() {
                    scalar.kind
                } else {
                    FieldKind::Enumeration(attr.choices.clone())
                };
                let mut validators = scalar.validators;
                validators.extend(attr.validators.iter().cloned());
                let auto = scalar.auto;
                Classified::Member(
                    Member::Field(FieldDescriptor {
                        name: attr.name.clone(),
                        column: attr.column.clone().unwrap_or_else(|| attr.name.clone()),
                        kind,
                        nullable: attr.null,
                        default: attr.default.clone(),
                        unique: attr.unique || attr.primary_key,
                        indexed: attr.db_index || attr.unique || attr.primary_key,
                        primary_key: attr.primary_key,
                        auto,
                        editable: attr.editable && !auto,
                        validators,
                        max_length: attr.max_length,
                        min_value: attr.min_value.or(scalar.min_value),
                        max_value: attr.max_value,
                        help_text: attr.help_text.clone(),
                    }),
                    false,
                )
            }
        }
    }

    fn add_reverse_relationships(
        &self,
        key: &ModelKey,
        members: &mut Vec<Member>,
        warnings: &mut Vec<String>,
    ) {
        for source in self.catalog.definitions() {
            if source.is_abstract {
                continue;
            }
            let source_key = ModelKey::new(&source.namespace, &source.name);
            let Ok(lineage) = self.lineage(&source_key) else {
                continue;
            };
            let source_table = table_name(&source);
            for attr in self.merged_attributes(&lineage) {
                let kind = attr.type_name.to_ascii_lowercase();
                if !matches!(kind.as_str(), "foreign_key" | "fk" | "one_to_one" | "many_to_many" | "m2m") {
                    continue;
                }
                let Some(reference) = attr.target.as_deref() else {
                    continue;
                };
                if self.resolve_reference(reference, &source.namespace, &source_key).as_ref() != Some(key) {
                    continue;
                }
                let name = match attr.related_name.as_deref() {
                    Some("+") => continue,
                    Some(name) => name.to_string(),
                    None => default_reverse_name(&kind, &source.name),
                };
                if members.iter().any(|m| m.name() == name) {
                    warnings.push(format!("{name}: reverse accessor clashes with a declared member"));
                    continue;
                }
                let (relation, remote_column, through) = match kind.as_str() {
                    "many_to_many" | "m2m" => {
                        let forward = forward_through(&attr, &source_table, &source_key, key);
                        let through = ThroughTable {
                            table: forward.table,
                            source_column: forward.target_column,
                            target_column: forward.source_column,
                        };
                        (RelationKind::ManyToMany, None, Some(through))
                    }
                    "one_to_one" => (
                        RelationKind::ToOne,
                        Some(attr.column.clone().unwrap_or_else(|| format!("{}_id", attr.name))),
                        None,
                    ),
                    _ => (
                        RelationKind::ToMany,
                        Some(attr.column.clone().unwrap_or_else(|| format!("{}_id", attr.name))),
                        None,
                    ),
                };
                debug!(model = %key, reverse = %name, source = %source_key, "Reverse relationship");
                members.push(Member::Relationship(RelationshipDescriptor {
                    name,
                    kind: relation,
                    direction: Direction::Reverse,
                    target: source_key.clone(),
                    reference: source_key.label(),
                    on_delete: attr.on_delete.unwrap_or(OnDelete::Cascade),
                    related_name: Some(attr.name.clone()),
                    column: None,
                    remote_column,
                    through,
                    nullable: true,
                    editable: false,
                    unique: false,
                    default: attr.default.clone(),
                    help_text: None,
                }));
            }
        }
    }
}

enum Classified {
    /// The flag marks a relationship whose target did not resolve
    Member(Member, bool),
    Skipped(String),
}

struct ScalarKind {
    kind: FieldKind,
    auto: bool,
    validators: Vec<ValidatorDefinition>,
    min_value: Option<f64>,
}

/// Map a host scalar kind name. Unknown names yield `None`.
fn scalar_kind(name: &str) -> Option<ScalarKind> {
    let plain = |kind| ScalarKind {
        kind,
        auto: false,
        validators: Vec::new(),
        min_value: None,
    };
    let name = name.to_ascii_lowercase();
    Some(match name.as_str() {
        "string" | "str" | "char" | "text" => plain(FieldKind::Text),
        "slug" => ScalarKind {
            validators: vec![ValidatorDefinition::Regex {
                pattern: SLUG_PATTERN.to_string(),
                message: Some("enter a valid slug".to_string()),
            }],
            ..plain(FieldKind::Text)
        },
        "email" => ScalarKind {
            validators: vec![ValidatorDefinition::Email],
            ..plain(FieldKind::Text)
        },
        "url" => ScalarKind {
            validators: vec![ValidatorDefinition::Url],
            ..plain(FieldKind::Text)
        },
        "integer" | "int" | "smallint" | "bigint" => plain(FieldKind::Integer),
        "positive_integer" => ScalarKind {
            min_value: Some(0.0),
            ..plain(FieldKind::Integer)
        },
        "auto" | "bigauto" => ScalarKind {
            auto: true,
            ..plain(FieldKind::Integer)
        },
        "float" | "double" => plain(FieldKind::Float),
        "decimal" => plain(FieldKind::Decimal),
        "boolean" | "bool" => plain(FieldKind::Boolean),
        "date" => plain(FieldKind::Date),
        "datetime" | "timestamp" => plain(FieldKind::DateTime),
        "time" => plain(FieldKind::Time),
        "uuid" => plain(FieldKind::Uuid),
        "id" => plain(FieldKind::Identifier),
        "json" => plain(FieldKind::Json),
        _ => return None,
    })
}

fn implicit_primary_key() -> FieldDescriptor {
    FieldDescriptor {
        name: "id".into(),
        column: "id".into(),
        kind: FieldKind::Integer,
        nullable: false,
        default: None,
        unique: true,
        indexed: true,
        primary_key: true,
        auto: true,
        editable: false,
        validators: Vec::new(),
        max_length: None,
        min_value: None,
        max_value: None,
        help_text: None,
    }
}

/// `catalog_product` for `catalog.Product` unless the definition names a table.
pub fn table_name(def: &ModelDefinition) -> String {
    def.table.clone().unwrap_or_else(|| {
        format!(
            "{}_{}",
            def.namespace.to_case(Case::Snake),
            def.name.to_case(Case::Snake)
        )
    })
}

fn default_reverse_name(kind: &str, source_model: &str) -> String {
    let base = source_model.to_case(Case::Snake);
    if kind == "one_to_one" {
        base
    } else {
        format!("{base}_set")
    }
}

fn forward_through(attr: &AttributeDefinition, table: &str, owner: &ModelKey, target: &ModelKey) -> ThroughTable {
    let through = attr.through.clone().unwrap_or_else(|| format!("{}_{}", table, attr.name));
    let (source_column, target_column) = if owner == target {
        let base = owner.name.to_case(Case::Snake);
        (format!("from_{base}_id"), format!("to_{base}_id"))
    } else {
        (
            format!("{}_id", owner.name.to_case(Case::Snake)),
            format!("{}_id", target.name.to_case(Case::Snake)),
        )
    };
    ThroughTable {
        table: through,
        source_column,
        target_column,
    }
}

fn accessors_for(def: &ModelDefinition) -> Vec<AccessorDescriptor> {
    if def.managers.is_empty() {
        return vec![AccessorDescriptor {
            name: "objects".into(),
            is_default: true,
            scope: None,
            description: None,
        }];
    }
    let default_index = def.managers.iter().position(|m| m.default).unwrap_or(0);
    def.managers
        .iter()
        .enumerate()
        .map(|(i, m)| AccessorDescriptor {
            name: m.name.clone(),
            is_default: i == default_index,
            scope: m.scope.clone(),
            description: m.description.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttributeDefinition as Attr, ManagerDefinition};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn catalog() -> Arc<ModelCatalog> {
        let catalog = ModelCatalog::new();
        catalog
            .register(
                ModelDefinition::new("catalog", "Timestamped")
                    .abstract_model()
                    .attribute(Attr::field("created", "datetime").computed_default("now"))
                    .attribute(Attr::field("note", "string").nullable()),
            )
            .unwrap();
        catalog
            .register(
                ModelDefinition::new("catalog", "Category")
                    .attribute(Attr::field("name", "string").unique().max_length(80)),
            )
            .unwrap();
        catalog
            .register(
                ModelDefinition::new("catalog", "Product")
                    .parent("Timestamped")
                    .attribute(Attr::field("title", "string"))
                    .attribute(Attr::field("note", "text"))
                    .attribute(Attr::field("status", "string").choices(&["draft", "live"]))
                    .attribute(Attr::foreign_key("category", "Category").related_name("products"))
                    .attribute(Attr::many_to_many("tags", "Tag"))
                    .attribute(Attr::property("label", "string"))
                    .attribute(Attr::field("weight", "furlongs"))
                    .manager(ManagerDefinition::new("objects").default_manager())
                    .manager(ManagerDefinition::new("active").scope(json!({"status": "live"}))),
            )
            .unwrap();
        Arc::new(catalog)
    }

    fn introspector(catalog: Arc<ModelCatalog>) -> Introspector {
        Introspector::new(catalog, Arc::new(MetadataCache::default()))
    }

    #[test]
    fn test_classification_and_inheritance() {
        let intro = introspector(catalog());
        let product = intro.describe(&ModelKey::new("catalog", "Product")).unwrap();

        let names: Vec<&str> = product.members.iter().map(Member::name).collect();
        assert_eq!(
            names,
            vec!["id", "created", "note", "title", "status", "category", "tags", "label", "weight"]
        );
        // the child's non-null `note` overrides the parent's nullable one
        assert!(!product.field("note").unwrap().nullable);
        assert!(matches!(product.field("status").unwrap().kind, FieldKind::Enumeration(_)));
        assert_eq!(
            product.field("weight").unwrap().kind,
            FieldKind::Other("furlongs".into())
        );
        assert_eq!(product.relationship("category").unwrap().column.as_deref(), Some("category_id"));
        assert_eq!(product.table, "catalog_product");
        assert_eq!(product.inheritance.ancestors, vec![ModelKey::new("catalog", "Timestamped")]);
        assert_eq!(product.unresolved.len(), 1);
        assert_eq!(product.unresolved[0].member, "tags");
        assert_eq!(product.accessors.len(), 2);
        assert_eq!(product.accessors[1].suffix(), Some("active"));
    }

    #[test]
    fn test_reverse_relationship_discovered() {
        let intro = introspector(catalog());
        let category = intro.describe(&ModelKey::new("catalog", "Category")).unwrap();
        let reverse = category.relationship("products").unwrap();
        assert_eq!(reverse.kind, RelationKind::ToMany);
        assert_eq!(reverse.direction, Direction::Reverse);
        assert_eq!(reverse.remote_column.as_deref(), Some("category_id"));
    }

    #[test]
    fn test_describe_is_idempotent() {
        let intro = introspector(catalog());
        let key = ModelKey::new("catalog", "Product");
        let first = intro.describe(&key).unwrap();
        intro.cache().clear();
        let second = intro.describe(&key).unwrap();
        assert_eq!(*first, *second);
    }

    #[test]
    fn test_inheritance_cycle_is_an_error() {
        let catalog = ModelCatalog::new();
        catalog.register(ModelDefinition::new("a", "A").parent("a.B")).unwrap();
        catalog.register(ModelDefinition::new("a", "B").parent("a.A")).unwrap();
        let intro = introspector(Arc::new(catalog));
        assert!(matches!(
            intro.describe(&ModelKey::new("a", "A")),
            Err(IntrospectionError::InheritanceCycle(_))
        ));
    }

    #[test]
    fn test_dependents_cover_both_directions() {
        let intro = introspector(catalog());
        let deps = intro.dependents(&ModelKey::new("catalog", "Category"));
        assert_eq!(deps, vec![ModelKey::new("catalog", "Product")]);
        let deps = intro.dependents(&ModelKey::new("catalog", "Product"));
        assert!(deps.contains(&ModelKey::new("catalog", "Category")));
        assert!(deps.contains(&ModelKey::new("catalog", "Timestamped")));
    }
}
