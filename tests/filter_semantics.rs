//! Filters given through GraphQL select exactly the rows a direct scan would.

use std::sync::Arc;

use modelql::models::{AttributeDefinition, ModelCatalog, ModelDefinition};
use modelql::store::{MemoryStore, Record};
use modelql::{Engine, SchemaSpec};
use pretty_assertions::assert_eq;
use serde_json::{Value as JsonValue, json};

struct Row {
    id: i64,
    title: &'static str,
    pages: i64,
    author: Option<i64>,
}

const BOOKS: &[Row] = &[
    Row { id: 1, title: "Rust in Action", pages: 456, author: Some(1) },
    Row { id: 2, title: "The Rust Book", pages: 552, author: Some(2) },
    Row { id: 3, title: "Dune", pages: 412, author: Some(3) },
    Row { id: 4, title: "Children of Dune", pages: 444, author: Some(3) },
    Row { id: 5, title: "untitled draft", pages: 12, author: None },
    Row { id: 6, title: "Zero to Production", pages: 370, author: Some(1) },
];

const AUTHORS: &[(i64, &str)] = &[(1, "Tim"), (2, "Steve"), (3, "Frank")];

fn engine() -> Arc<Engine> {
    let catalog = ModelCatalog::new();
    catalog
        .register(ModelDefinition::new("lib", "Author").attribute(AttributeDefinition::field("name", "string")))
        .unwrap();
    catalog
        .register(
            ModelDefinition::new("lib", "Book")
                .attribute(AttributeDefinition::field("title", "string"))
                .attribute(AttributeDefinition::field("pages", "integer"))
                .attribute(AttributeDefinition::foreign_key("author", "Author").nullable()),
        )
        .unwrap();

    let store = MemoryStore::new();
    store.seed(
        "lib_author",
        AUTHORS.iter().map(|(id, name)| record(json!({"id": id, "name": name}))),
    );
    store.seed(
        "lib_book",
        BOOKS.iter().map(|b| {
            record(json!({"id": b.id, "title": b.title, "pages": b.pages, "author_id": b.author}))
        }),
    );

    let engine = Engine::builder(Arc::new(catalog), Arc::new(store)).build();
    engine
        .registry()
        .register(SchemaSpec::new("lib").models(&["Author", "Book"]))
        .unwrap();
    engine
}

fn record(value: JsonValue) -> Record {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

fn author_name(id: Option<i64>) -> Option<&'static str> {
    AUTHORS.iter().find(|(a, _)| Some(*a) == id).map(|(_, name)| *name)
}

fn expected(keep: impl Fn(&Row) -> bool) -> Vec<String> {
    BOOKS.iter().filter(|b| keep(b)).map(|b| b.id.to_string()).collect()
}

async fn filtered(engine: &Engine, filter: &str) -> Vec<String> {
    let query = format!("{{ books(filter: {filter}, orderBy: [\"id\"]) {{ id }} }}");
    let response = engine.execute("lib", query.as_str(), None).await;
    assert!(response.errors.is_empty(), "{filter}: {:?}", response.errors);
    let data = response.data.into_json().unwrap();
    data["books"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_field_operators_match_direct_scan() {
    let engine = engine();
    let cases: Vec<(&str, Vec<String>)> = vec![
        (r#"{ title: "Dune" }"#, expected(|b| b.title == "Dune")),
        (
            r#"{ title__icontains: "rust" }"#,
            expected(|b| b.title.to_lowercase().contains("rust")),
        ),
        (r#"{ title__startswith: "The" }"#, expected(|b| b.title.starts_with("The"))),
        (r#"{ pages__gt: 440 }"#, expected(|b| b.pages > 440)),
        (r#"{ pages__lte: 412 }"#, expected(|b| b.pages <= 412)),
        (
            r#"{ pages__range: [400, 450] }"#,
            expected(|b| (400..=450).contains(&b.pages)),
        ),
        (r#"{ pages__in: [12, 552, 9] }"#, expected(|b| [12, 552, 9].contains(&b.pages))),
        (r#"{ author__isnull: true }"#, expected(|b| b.author.is_none())),
    ];
    for (filter, want) in cases {
        assert_eq!(filtered(&engine, filter).await, want, "{filter}");
    }
}

#[tokio::test]
async fn test_combinators_match_direct_scan() {
    let engine = engine();
    let cases: Vec<(&str, Vec<String>)> = vec![
        (
            r#"{ title__icontains: "dune", pages__gt: 420 }"#,
            expected(|b| b.title.to_lowercase().contains("dune") && b.pages > 420),
        ),
        (
            r#"{ OR: [{ pages__lt: 100 }, { pages__gt: 500 }] }"#,
            expected(|b| b.pages < 100 || b.pages > 500),
        ),
        (
            r#"{ NOT: { title__icontains: "rust" } }"#,
            expected(|b| !b.title.to_lowercase().contains("rust")),
        ),
        (
            r#"{ AND: [{ pages__gte: 400 }], OR: [{ title: "Dune" }, { title__endswith: "Book" }] }"#,
            expected(|b| b.pages >= 400 && (b.title == "Dune" || b.title.ends_with("Book"))),
        ),
    ];
    for (filter, want) in cases {
        assert_eq!(filtered(&engine, filter).await, want, "{filter}");
    }
}

#[tokio::test]
async fn test_relation_filter_matches_direct_scan() {
    let engine = engine();
    assert_eq!(
        filtered(&engine, r#"{ author: { name: "Frank" } }"#).await,
        expected(|b| author_name(b.author) == Some("Frank"))
    );
    assert_eq!(
        filtered(&engine, r#"{ author: { name__startswith: "T" }, pages__lt: 400 }"#).await,
        expected(|b| author_name(b.author).is_some_and(|n| n.starts_with('T')) && b.pages < 400)
    );
}

#[tokio::test]
async fn test_unknown_filter_field_is_rejected() {
    let engine = engine();
    let response = engine
        .execute("lib", r#"{ books(filter: { isbn: "x" }) { id } }"#, None)
        .await;
    assert!(!response.errors.is_empty());
}
