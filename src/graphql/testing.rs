//! Shared fixtures for the graphql unit tests.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Value as JsonValue, json};

use super::SchemaModels;
use crate::cache::MetadataCache;
use crate::introspect::{DescriptorArena, Introspector};
use crate::models::{AttributeDefinition, ManagerDefinition, ModelCatalog, ModelDefinition, ModelKey};
use crate::schema::SchemaSettings;

/// Category / Product / Tag catalog with a computed property and a mutating method.
pub fn catalog() -> Arc<ModelCatalog> {
    let catalog = ModelCatalog::new();
    catalog
        .register(
            ModelDefinition::new("catalog", "Category")
                .attribute(AttributeDefinition::field("name", "string").unique())
                .attribute(AttributeDefinition::field("description", "text").nullable()),
        )
        .unwrap();
    catalog
        .register(
            ModelDefinition::new("catalog", "Tag").attribute(AttributeDefinition::field("name", "string").unique()),
        )
        .unwrap();
    catalog
        .register(
            ModelDefinition::new("catalog", "Product")
                .attribute(AttributeDefinition::field("name", "string").max_length(120))
                .attribute(AttributeDefinition::field("sku", "string").unique())
                .attribute(AttributeDefinition::field("price", "decimal"))
                .attribute(
                    AttributeDefinition::field("stock", "integer")
                        .default_value(json!(0))
                        .bounds(Some(0.0), None),
                )
                .attribute(AttributeDefinition::field("active", "boolean").default_value(json!(true)))
                .attribute(
                    AttributeDefinition::field("status", "string")
                        .choices(&["draft", "published", "archived"])
                        .default_value(json!("draft")),
                )
                .attribute(AttributeDefinition::foreign_key("category", "Category"))
                .attribute(AttributeDefinition::many_to_many("tags", "Tag"))
                .attribute(AttributeDefinition::property("display_name", "string"))
                .attribute(
                    AttributeDefinition::method("restock", "integer")
                        .param("amount", "integer")
                        .mutating()
                        .invokable(),
                )
                .manager(ManagerDefinition::new("objects").default_manager())
                .manager(ManagerDefinition::new("active").scope(json!({"active": true})))
                .ordering(&["name"]),
        )
        .unwrap();

    let product = ModelKey::new("catalog", "Product");
    catalog.register_compute(&product, "display_name", |row, _| {
        let name = row.get("name").and_then(JsonValue::as_str).unwrap_or_default();
        let sku = row.get("sku").and_then(JsonValue::as_str).unwrap_or_default();
        Ok(json!(format!("{name} ({sku})")))
    });
    catalog.register_mutate(&product, "restock", |row, args| {
        let amount = args.get("amount").and_then(JsonValue::as_i64).unwrap_or(0);
        if amount <= 0 {
            return Err("amount must be positive".into());
        }
        let stock = row.get("stock").and_then(JsonValue::as_i64).unwrap_or(0) + amount;
        row.insert("stock".into(), json!(stock));
        Ok(json!(stock))
    });
    Arc::new(catalog)
}

pub fn models_for(catalog: Arc<ModelCatalog>, roots: &[ModelKey], settings: &SchemaSettings) -> SchemaModels {
    let introspector = Introspector::new(catalog, Arc::new(MetadataCache::default()));
    let arena = DescriptorArena::new(&introspector);
    let (models, _) = SchemaModels::collect(&arena, roots, &BTreeSet::new(), settings);
    models
}

pub fn catalog_models() -> (SchemaModels, SchemaSettings) {
    let settings = SchemaSettings::default();
    let roots = [
        ModelKey::new("catalog", "Category"),
        ModelKey::new("catalog", "Product"),
        ModelKey::new("catalog", "Tag"),
    ];
    (models_for(catalog(), &roots, &settings), settings)
}
