//! End-to-end scenarios driven through `Engine::execute`.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use modelql::models::{AttributeDefinition, ModelCatalog, ModelDefinition, ModelKey, OnDelete};
use modelql::schema::SchemaSettings;
use modelql::store::{MemoryStore, Record};
use modelql::{Engine, SchemaSpec};
use pretty_assertions::assert_eq;
use serde_json::{Value as JsonValue, json};

fn shop_catalog() -> Arc<ModelCatalog> {
    let catalog = ModelCatalog::new();
    catalog
        .register(
            ModelDefinition::new("shop", "Category").attribute(AttributeDefinition::field("name", "string").unique()),
        )
        .unwrap();
    catalog
        .register(
            ModelDefinition::new("shop", "Product")
                .attribute(AttributeDefinition::field("name", "string").max_length(20))
                .attribute(
                    AttributeDefinition::field("stock", "integer")
                        .default_value(json!(0))
                        .bounds(Some(0.0), None),
                )
                .attribute(AttributeDefinition::foreign_key("category", "Category")),
        )
        .unwrap();
    Arc::new(catalog)
}

fn record(value: JsonValue) -> Record {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

struct Shop {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
}

impl Shop {
    fn new(settings: SchemaSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.seed("shop_category", [record(json!({"id": 1, "name": "Tools"}))]);
        let engine = Engine::builder(shop_catalog(), store.clone()).build();
        engine
            .registry()
            .register(SchemaSpec::new("shop").models(&["Category", "Product"]).settings(settings))
            .unwrap();
        Self { engine, store }
    }

    fn seed_products(&self, count: i64) {
        self.store.seed(
            "shop_product",
            (1..=count).map(|i| record(json!({"id": i, "name": format!("p{i}"), "stock": i, "category_id": 1}))),
        );
    }

    async fn run(&self, query: &str) -> JsonValue {
        let response = self.engine.execute("shop", query, None).await;
        assert!(response.errors.is_empty(), "unexpected errors: {:?}", response.errors);
        response.data.into_json().unwrap()
    }
}

#[tokio::test]
async fn test_create_then_read_back() {
    let shop = Shop::new(SchemaSettings::default());
    let created = shop
        .run(r#"mutation { createProduct(input: { name: "Hammer", category: "1" }) { ok errors { code } object { id name stock } } }"#)
        .await;
    let payload = &created["createProduct"];
    assert_eq!(payload["ok"], json!(true));
    assert_eq!(payload["object"]["name"], json!("Hammer"));
    assert_eq!(payload["object"]["stock"], json!(0));

    let id = payload["object"]["id"].as_str().unwrap().to_string();
    let read = shop
        .run(&format!(r#"{{ product(id: "{id}") {{ name category {{ name }} }} }}"#))
        .await;
    assert_eq!(read["product"], json!({"name": "Hammer", "category": {"name": "Tools"}}));
}

#[tokio::test]
async fn test_bulk_create_reports_failing_index() {
    let shop = Shop::new(SchemaSettings::default());
    let data = shop
        .run(
            r#"mutation {
                bulkCreateProduct(inputs: [
                    { name: "Saw", category: "1" },
                    { name: "A name that is far too long", category: "1" },
                    { name: "Drill", category: "1" }
                ]) { ok successCount errorCount errors { index code field } objects { name } }
            }"#,
        )
        .await;
    let payload = &data["bulkCreateProduct"];
    assert_eq!(payload["ok"], json!(false));
    assert_eq!(payload["successCount"], json!(2));
    assert_eq!(payload["errorCount"], json!(1));
    assert_eq!(payload["errors"][0]["index"], json!(1));
    assert_eq!(payload["errors"][0]["code"], json!("VALIDATION"));
    assert_eq!(payload["errors"][0]["field"], json!("name"));
    assert_eq!(payload["objects"], json!([{"name": "Saw"}, {"name": "Drill"}]));
    assert_eq!(shop.store.rows("shop_product").len(), 2);
}

#[tokio::test]
async fn test_update_is_idempotent() {
    let shop = Shop::new(SchemaSettings::default());
    shop.seed_products(1);
    let update = r#"mutation { updateProduct(input: { id: "1", stock: 7 }) { ok object { stock } } }"#;
    let first = shop.run(update).await;
    let second = shop.run(update).await;
    assert_eq!(first, second);
    assert_eq!(first["updateProduct"]["object"]["stock"], json!(7));
    assert_eq!(shop.store.rows("shop_product")[0]["stock"], json!(7));
}

#[tokio::test]
async fn test_pagination_boundaries() {
    let shop = Shop::new(SchemaSettings {
        page_size_default: 2,
        page_size_max: 3,
        ..SchemaSettings::default()
    });
    shop.seed_products(5);

    let first = shop
        .run("{ productPages { totalCount edges { node { name } } pageInfo { hasNextPage hasPreviousPage endCursor } } }")
        .await;
    let page = &first["productPages"];
    assert_eq!(page["totalCount"], json!(5));
    assert_eq!(page["edges"].as_array().unwrap().len(), 2);
    assert_eq!(page["pageInfo"]["hasNextPage"], json!(true));
    assert_eq!(page["pageInfo"]["hasPreviousPage"], json!(false));

    let after = page["pageInfo"]["endCursor"].as_str().unwrap().to_string();
    let rest = shop
        .run(&format!(
            r#"{{ productPages(first: 50, after: "{after}") {{ edges {{ node {{ name }} }} pageInfo {{ hasNextPage hasPreviousPage }} }} }}"#
        ))
        .await;
    let names: Vec<&str> = rest["productPages"]["edges"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["node"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["p3", "p4", "p5"]);
    assert_eq!(rest["productPages"]["pageInfo"]["hasNextPage"], json!(false));
    assert_eq!(rest["productPages"]["pageInfo"]["hasPreviousPage"], json!(true));

    let reads = shop.store.access_count();
    let tail = shop.run("{ productPages(last: 1) { edges { node { name } } } }").await;
    assert_eq!(tail["productPages"]["edges"], json!([{"node": {"name": "p5"}}]));
    assert_eq!(shop.store.access_count() - reads, 1);

    let empty = shop.run("{ productPages(first: 0) { edges { cursor } totalCount } }").await;
    assert_eq!(empty["productPages"], json!({"edges": [], "totalCount": 5}));
}

#[tokio::test]
async fn test_deep_query_rejected_before_store_access() {
    let shop = Shop::new(SchemaSettings {
        max_query_depth: 3,
        ..SchemaSettings::default()
    });
    shop.seed_products(2);
    let before = shop.store.access_count();
    let response = shop
        .engine
        .execute(
            "shop",
            "{ products { category { productSet { category { name } } } } }",
            None,
        )
        .await;
    assert_eq!(response.errors.len(), 1);
    let code = response.errors[0]
        .extensions
        .as_ref()
        .and_then(|ext| ext.get("code"))
        .cloned();
    assert_eq!(code, Some(async_graphql::Value::from("QUERY_TOO_DEEP")));
    assert_eq!(shop.store.access_count(), before);
    assert_eq!(shop.engine.metrics().rejected, 1);
}

#[tokio::test]
async fn test_row_writes_keep_schema_but_alterations_rebuild_it() {
    let shop = Shop::new(SchemaSettings::default());
    shop.engine.sdl("shop").unwrap();
    let built = shop.engine.registry().get("shop").unwrap().built().cloned().unwrap();

    shop.run(r#"mutation { createCategory(input: { name: "Garden" }) { ok } }"#)
        .await;
    let still = shop.engine.registry().get("shop").unwrap().built().cloned().unwrap();
    assert!(Arc::ptr_eq(&built, &still));

    let key = ModelKey::new("shop", "Category");
    let altered = (*shop.engine.catalog().get(&key).unwrap())
        .clone()
        .attribute(AttributeDefinition::field("slug", "string").nullable());
    shop.engine.catalog().alter(altered).unwrap();
    assert!(shop.engine.registry().get("shop").unwrap().built().is_none());
    assert!(shop.engine.sdl("shop").unwrap().contains("slug"));
}

#[tokio::test]
async fn test_reads_retry_once_on_unavailable_store() {
    let shop = Shop::new(SchemaSettings::default());
    shop.seed_products(2);

    shop.store.fail_next_reads(1);
    let data = shop.run("{ products { name } }").await;
    assert_eq!(data["products"], json!([{"name": "p1"}, {"name": "p2"}]));

    shop.store.fail_next_reads(2);
    let response = shop.engine.execute("shop", "{ products { name } }", None).await;
    assert_eq!(response.errors.len(), 1);
}

fn error_code(response: &async_graphql::Response) -> Option<async_graphql::Value> {
    response.errors.first()?.extensions.as_ref()?.get("code").cloned()
}

#[tokio::test]
async fn test_catalog_registry_scenario() {
    let engine = Engine::builder(shop_catalog(), Arc::new(MemoryStore::new())).build();
    let settings = SchemaSettings {
        max_query_depth: 5,
        ..SchemaSettings::default()
    };
    engine
        .registry()
        .register(SchemaSpec::new("catalog").models(&["Product"]).settings(settings))
        .unwrap();
    assert!(engine.registry().get("catalog").unwrap().enabled());

    let deep = "{ products { category { productSet { category { productSet { category { name } } } } } } }";
    let response = engine.execute("catalog", deep, None).await;
    assert_eq!(response.errors.len(), 1);
    assert_eq!(error_code(&response), Some(async_graphql::Value::from("QUERY_TOO_DEEP")));

    engine.registry().disable("catalog").unwrap();
    let response = engine.execute("catalog", "{ products { name } }", None).await;
    assert_eq!(error_code(&response), Some(async_graphql::Value::from("SCHEMA_DISABLED")));
}

#[tokio::test]
async fn test_bad_cursors_fail_the_field_not_the_process() {
    let shop = Shop::new(SchemaSettings::default());
    shop.seed_products(5);

    let overflowing = BASE64.encode(format!("cursor:{}", u64::MAX));
    for cursor in [
        "%%%".to_string(),
        BASE64.encode("cursor:abc"),
        BASE64.encode("cursor:99999999999999999999999"),
        overflowing,
    ] {
        let query = format!(r#"{{ productPages(after: "{cursor}") {{ totalCount }} }}"#);
        let response = shop.engine.execute("shop", query.as_str(), None).await;
        assert_eq!(response.errors.len(), 1, "{cursor}");
    }

    let near_end = BASE64.encode(format!("cursor:{}", u64::MAX - 1));
    let page = shop
        .run(&format!(
            r#"{{ productPages(first: 2, after: "{near_end}") {{ edges {{ cursor }} totalCount pageInfo {{ hasNextPage hasPreviousPage }} }} }}"#
        ))
        .await;
    assert_eq!(
        page["productPages"],
        json!({
            "edges": [],
            "totalCount": 5,
            "pageInfo": {"hasNextPage": false, "hasPreviousPage": true}
        })
    );
}

#[tokio::test]
async fn test_forward_relation_resolves_once_target_registered() {
    let catalog = Arc::new(ModelCatalog::new());
    catalog
        .register(ModelDefinition::new("crm", "Note").attribute(AttributeDefinition::field("body", "text")))
        .unwrap();
    catalog
        .register(
            ModelDefinition::new("crm", "Ticket")
                .attribute(AttributeDefinition::field("title", "string"))
                .attribute(AttributeDefinition::foreign_key("owner", "Agent").nullable()),
        )
        .unwrap();
    let store = Arc::new(MemoryStore::new());
    store.seed("crm_agent", [record(json!({"id": 1, "name": "Ada"}))]);
    store.seed("crm_ticket", [record(json!({"id": 1, "title": "Printer on fire", "owner_id": 1}))]);
    let engine = Engine::builder(catalog.clone(), store).build();
    engine
        .registry()
        .register(SchemaSpec::new("crm").models(&["Note", "Ticket"]))
        .unwrap();

    let before = engine.sdl("crm").unwrap();
    assert!(!before.contains("type Ticket"));
    assert!(!before.contains("type Agent"));

    catalog
        .register(ModelDefinition::new("crm", "Agent").attribute(AttributeDefinition::field("name", "string")))
        .unwrap();
    let response = engine
        .execute("crm", "{ tickets { title owner { name } } }", None)
        .await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(
        response.data.into_json().unwrap()["tickets"],
        json!([{"title": "Printer on fire", "owner": {"name": "Ada"}}])
    );
}

#[tokio::test]
async fn test_deleting_a_target_detaches_its_dependents() {
    let catalog = ModelCatalog::new();
    catalog
        .register(ModelDefinition::new("hr", "Team").attribute(AttributeDefinition::field("name", "string")))
        .unwrap();
    let dependent = |name: &str, fk: AttributeDefinition| {
        ModelDefinition::new("hr", name)
            .attribute(AttributeDefinition::field("label", "string"))
            .attribute(fk)
    };
    let team = || AttributeDefinition::foreign_key("team", "Team");
    for def in [
        dependent("Member", team().nullable().on_delete(OnDelete::SetNull)),
        dependent("Desk", team().default_value(json!(2)).on_delete(OnDelete::SetDefault)),
        dependent("Badge", team().nullable().on_delete(OnDelete::SetDefault)),
        dependent("Memo", team().on_delete(OnDelete::DoNothing)),
    ] {
        catalog.register(def).unwrap();
    }

    let store = Arc::new(MemoryStore::new());
    store.seed(
        "hr_team",
        [record(json!({"id": 1, "name": "Ops"})), record(json!({"id": 2, "name": "Pool"}))],
    );
    for table in ["hr_member", "hr_desk", "hr_badge", "hr_memo"] {
        store.seed(table, [record(json!({"id": 1, "label": "x", "team_id": 1}))]);
    }
    let engine = Engine::builder(Arc::new(catalog), store.clone()).build();
    engine
        .registry()
        .register(SchemaSpec::new("hr").models(&["Team", "Member", "Desk", "Badge", "Memo"]))
        .unwrap();

    let response = engine
        .execute("hr", r#"mutation { deleteTeam(id: "1") { ok } }"#, None)
        .await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(response.data.into_json().unwrap()["deleteTeam"]["ok"], json!(true));

    let team_of = |table: &str| store.rows(table)[0]["team_id"].clone();
    assert_eq!(team_of("hr_member"), JsonValue::Null);
    assert_eq!(team_of("hr_desk"), json!(2));
    assert_eq!(team_of("hr_badge"), JsonValue::Null);
    assert_eq!(team_of("hr_memo"), json!(1));
    assert_eq!(store.rows("hr_team").len(), 1);
}
