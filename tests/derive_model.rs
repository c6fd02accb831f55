use std::sync::Arc;

use modelql::models::{DefaultValue, DescribeModel, ModelCatalog, OnDelete};
use modelql::store::MemoryStore;
use modelql::{Engine, Model, SchemaSpec};
use pretty_assertions::assert_eq;
use serde_json::json;

#[derive(Model)]
#[model(namespace = "blog")]
#[allow(dead_code)]
struct Author {
    #[model(primary_key)]
    id: i64,
    #[model(unique, max_length = 80)]
    name: String,
}

/// A published article
#[derive(Model)]
#[model(namespace = "blog", ordering = "-published_at,title", plural = "posts")]
#[allow(dead_code)]
struct Post {
    #[model(primary_key)]
    id: i64,
    /// Shown in listings
    #[model(max_length = 120)]
    title: String,
    #[model(foreign_key = "Author", related_name = "posts", on_delete = "protect")]
    author_id: i64,
    #[model(choices = "draft,live", default = "draft")]
    status: String,
    #[model(min_value = 0)]
    views: u32,
    published_at: Option<chrono::DateTime<chrono::Utc>>,
    #[model(skip)]
    cached_html: String,
}

#[test]
fn test_derived_definition() {
    let def = Post::model_definition();
    assert_eq!(def.namespace, "blog");
    assert_eq!(def.name, "Post");
    assert_eq!(def.plural.as_deref(), Some("posts"));
    assert_eq!(def.description.as_deref(), Some("A published article"));
    assert_eq!(def.ordering, vec!["-published_at".to_string(), "title".to_string()]);

    let names: Vec<&str> = def.attributes.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, ["id", "title", "author", "status", "views", "published_at"]);

    let attr = |name: &str| def.attributes.iter().find(|a| a.name == name).unwrap();
    assert_eq!(attr("id").type_name, "auto");
    assert!(attr("id").primary_key);
    assert_eq!(attr("title").max_length, Some(120));
    assert_eq!(attr("title").help_text.as_deref(), Some("Shown in listings"));

    let author = attr("author");
    assert_eq!(author.type_name, "foreign_key");
    assert_eq!(author.column.as_deref(), Some("author_id"));
    assert_eq!(author.target.as_deref(), Some("Author"));
    assert_eq!(author.related_name.as_deref(), Some("posts"));
    assert_eq!(author.on_delete, Some(OnDelete::Protect));

    assert_eq!(attr("status").choices.len(), 2);
    assert_eq!(attr("status").default, Some(DefaultValue::Value(json!("draft"))));
    assert_eq!(attr("views").type_name, "integer");
    assert_eq!(attr("views").min_value, Some(0.0));
    assert_eq!(attr("published_at").type_name, "datetime");
    assert!(attr("published_at").null);
    assert!(!attr("title").null);
}

#[test]
fn test_derived_models_build_a_schema() {
    let catalog = ModelCatalog::from_definitions([Author::model_definition(), Post::model_definition()]).unwrap();
    let engine = Engine::builder(Arc::new(catalog), Arc::new(MemoryStore::new())).build();
    engine
        .registry()
        .register(SchemaSpec::new("blog").models(&["Author", "Post"]))
        .unwrap();
    let sdl = engine.sdl("blog").unwrap();
    assert!(sdl.contains("type Post"));
    assert!(sdl.contains("posts("));
    assert!(sdl.contains("createPost("));
}
