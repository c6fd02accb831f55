//! Engine: the one object a host embeds.
//!
//! Owns the catalog subscription, metadata cache and schema registry, runs
//! the safety analyzer in front of every request and routes change events
//! to the right invalidation.
//!
//! ```ignore
//! let engine = Engine::builder(catalog, store).build();
//! engine.registry().register(SchemaSpec::new("catalog").models(&["Product"]))?;
//! let response = engine.execute("catalog", "{ products { name } }", None).await;
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_graphql::dataloader::DataLoader;
use async_graphql::{Request, Response};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::cache::{
    CacheKey, ChangeClass, ChangeEvent, ChangeNotifier, MetadataCache, StructureChangeDetector, short_hash,
};
use crate::error::RegistryError;
use crate::graphql::{AllowAll, Authorizer, Identity, OperationDescriptor, RelationLoader, RequestMeta};
use crate::introspect::Introspector;
use crate::lifecycle::{HealthStatus, Service, ServiceHealth};
use crate::models::{ModelCatalog, ModelKey, StructureListener};
use crate::safety::QueryAnalyzer;
use crate::schema::{DiscoveryService, SchemaAssembler, SchemaRegistry};
use crate::store::DataStore;

const VISIBLE_OPERATIONS: &str = "visible_operations";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Built schema name to model count
    pub schemas: BTreeMap<String, usize>,
    pub cache_hit_ratio: f64,
    pub average_build_ms: f64,
    pub requests: u64,
    pub rejected: u64,
}

pub struct EngineBuilder {
    catalog: Arc<ModelCatalog>,
    store: Arc<dyn DataStore>,
    authorizer: Arc<dyn Authorizer>,
    cache_ttl: Option<Duration>,
    invalidate_on_data_write: bool,
    discovery: Option<(Duration, Option<String>)>,
}

impl EngineBuilder {
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Drop a model's cached metadata on every row write to it.
    pub fn invalidate_on_data_write(mut self, enabled: bool) -> Self {
        self.invalidate_on_data_write = enabled;
        self
    }

    /// Run a discovery sweep every `interval` while the engine is started.
    pub fn discovery(mut self, interval: Duration, default_schema: Option<String>) -> Self {
        self.discovery = Some((interval, default_schema));
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let cache = Arc::new(MetadataCache::new(self.cache_ttl));
        let introspector = Arc::new(Introspector::new(self.catalog.clone(), cache.clone()));
        let engine = Arc::new_cyclic(|weak: &Weak<Engine>| {
            let notifier: Weak<dyn ChangeNotifier> = weak.clone();
            let assembler = SchemaAssembler::new(
                introspector.clone(),
                self.store.clone(),
                self.authorizer.clone(),
                Some(notifier),
            );
            let registry = Arc::new(SchemaRegistry::new(Arc::new(assembler)));
            let discovery = self
                .discovery
                .map(|(interval, default)| DiscoveryService::new(registry.clone(), interval, default));
            Engine {
                catalog: self.catalog.clone(),
                introspector,
                cache,
                registry,
                authorizer: self.authorizer,
                detector: StructureChangeDetector::new(self.invalidate_on_data_write),
                discovery,
                requests: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }
        });
        let listener: Weak<dyn StructureListener> = Arc::downgrade(&engine) as Weak<dyn StructureListener>;
        self.catalog.subscribe(listener);
        engine
    }
}

pub struct Engine {
    catalog: Arc<ModelCatalog>,
    introspector: Arc<Introspector>,
    cache: Arc<MetadataCache>,
    registry: Arc<SchemaRegistry>,
    authorizer: Arc<dyn Authorizer>,
    detector: StructureChangeDetector,
    discovery: Option<DiscoveryService>,
    requests: AtomicU64,
    rejected: AtomicU64,
}

impl Engine {
    pub fn builder(catalog: Arc<ModelCatalog>, store: Arc<dyn DataStore>) -> EngineBuilder {
        EngineBuilder {
            catalog,
            store,
            authorizer: Arc::new(AllowAll),
            cache_ttl: None,
            invalidate_on_data_write: false,
            discovery: None,
        }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn introspector(&self) -> &Arc<Introspector> {
        &self.introspector
    }

    /// SDL of a schema, building it if needed.
    pub fn sdl(&self, schema: &str) -> Result<String, RegistryError> {
        Ok(self.registry.schema(schema)?.sdl.clone())
    }

    /// Run one GraphQL request against `schema`.
    ///
    /// Unknown or disabled schemas and queries over the depth or complexity
    /// limit are answered with a single coded error without running any
    /// resolver.
    pub async fn execute(&self, schema: &str, request: impl Into<Request>, identity: Option<Identity>) -> Response {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let request = request.into();
        let built = match self.registry.schema(schema) {
            Ok(built) => built,
            Err(err) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(schema, error = %err, "Request refused");
                return Response::from_errors(vec![err.to_server_error()]);
            }
        };

        let analyzer = QueryAnalyzer::new(&built.list_fields, built.settings.list_fanout);
        let checked = analyzer
            .analyze(&request.query, request.operation_name.as_deref(), &request.variables)
            .and_then(|metrics| metrics.check(&built.settings).map(|()| metrics));
        let metrics = match checked {
            Ok(metrics) => metrics,
            Err(err) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(schema, code = err.code(), error = %err, "Query rejected");
                return Response::from_errors(vec![err.to_server_error()]);
            }
        };

        let correlation_id = Uuid::new_v4().to_string();
        let span = info_span!("graphql", schema, correlation_id = %correlation_id);
        let request = request
            .data(RequestMeta {
                correlation_id,
                identity,
            })
            .data(DataLoader::new(RelationLoader::new(built.runtime.clone()), tokio::spawn));

        async move {
            debug!(depth = metrics.depth, complexity = metrics.complexity, "Executing");
            let response = built.schema.execute(request).await;
            if response.is_err() {
                debug!(errors = response.errors.len(), "Request finished with errors");
            }
            response
        }
        .instrument(span)
        .await
    }

    /// Root operations of `schema` the identity may run. Cached per identity
    /// and schema build.
    pub fn visible_operations(
        &self,
        schema: &str,
        identity: Option<&Identity>,
    ) -> Result<Vec<OperationDescriptor>, RegistryError> {
        let built = self.registry.schema(schema)?;
        let fingerprint = identity.map(Identity::fingerprint);
        let key = CacheKey::new(VISIBLE_OPERATIONS, None)
            .for_identity(fingerprint.as_deref())
            .with_params(&(&built.name, short_hash(&built.sdl)));
        Ok(self.cache.get_or_compute(key, None, || {
            built
                .operations
                .iter()
                .filter(|op| self.authorizer.allows(identity, op))
                .cloned()
                .collect()
        }))
    }

    /// A model's declared structure changed: drop its metadata and that of
    /// every model whose description embeds it, then invalidate the built
    /// schemas that include any of them.
    pub fn on_structure_change(&self, model: &ModelKey) {
        let mut affected = vec![model.clone()];
        affected.extend(self.introspector.dependents(model));
        let mut removed = 0;
        let mut schemas = Vec::new();
        for key in &affected {
            removed += self.cache.invalidate_model(key);
            for name in self.registry.invalidate_model(key) {
                if !schemas.contains(&name) {
                    schemas.push(name);
                }
            }
        }
        self.cache.invalidate_method(VISIBLE_OPERATIONS);
        info!(model = %model, dependents = affected.len() - 1, removed, schemas = ?schemas, "Structure changed");
    }

    /// Drop everything computed before this process started serving.
    pub fn on_startup(&self) {
        self.cache.on_startup();
        let schemas = self.registry.invalidate_all();
        debug!(schemas, "Built schemas dropped at startup");
    }

    /// Classify a change and react to it.
    pub fn on_change(&self, event: ChangeEvent) -> ChangeClass {
        let schema_relevant = self
            .catalog
            .get(&event.model)
            .is_some_and(|def| def.schema_relevant);
        let class = self.detector.classify(&event, schema_relevant);
        match class {
            ChangeClass::Structural => self.on_structure_change(&event.model),
            ChangeClass::DataInvalidating => {
                self.cache.invalidate_model(&event.model);
            }
            ChangeClass::Data => {
                debug!(model = %event.model, kind = ?event.kind, "Row change ignored by the metadata cache");
            }
        }
        class
    }

    pub fn health(&self) -> HealthSnapshot {
        let entries = self.registry.list();
        let total = entries.len();
        let enabled: Vec<_> = entries.iter().filter(|e| e.enabled()).collect();
        let mut issues = Vec::new();
        let mut serving = 0;
        for entry in &enabled {
            match self.registry.build_entry(entry) {
                Ok(_) => serving += 1,
                Err(err) => issues.push(err.to_string()),
            }
        }
        let status = if issues.is_empty() {
            HealthStatus::Healthy
        } else if serving > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };
        HealthSnapshot {
            status,
            total,
            enabled: enabled.len(),
            disabled: total - enabled.len(),
            issues,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let mut schemas = BTreeMap::new();
        let mut build_ms = Vec::new();
        for entry in self.registry.list() {
            if let Some(built) = entry.built() {
                schemas.insert(entry.name().to_string(), built.models.len());
                build_ms.push(built.build_ms);
            }
        }
        let average_build_ms = if build_ms.is_empty() {
            0.0
        } else {
            build_ms.iter().sum::<f64>() / build_ms.len() as f64
        };
        MetricsSnapshot {
            schemas,
            cache_hit_ratio: self.cache.stats().hit_ratio,
            average_build_ms,
            requests: self.requests.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl StructureListener for Engine {
    fn on_structure_change(&self, model: &ModelKey) {
        Engine::on_structure_change(self, model);
    }
}

impl ChangeNotifier for Engine {
    fn notify(&self, event: ChangeEvent) {
        self.on_change(event);
    }
}

#[async_trait]
impl Service for Engine {
    fn name(&self) -> &str {
        "engine"
    }

    async fn start(&self) -> Result<()> {
        self.on_startup();
        if let Some(discovery) = &self.discovery {
            discovery.start().await?;
        }
        info!(service = %self.name(), schemas = self.registry.list().len(), "Started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(discovery) = &self.discovery {
            discovery.stop().await?;
        }
        let schemas = self.registry.clear_all();
        self.cache.clear();
        info!(service = %self.name(), schemas, "Stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        let snapshot = self.health();
        let registry = match snapshot.status {
            HealthStatus::Healthy => ServiceHealth::healthy(),
            HealthStatus::Degraded => ServiceHealth::degraded(snapshot.issues.join("; ")),
            HealthStatus::Unhealthy => ServiceHealth::unhealthy(snapshot.issues.join("; ")),
        };
        Ok(match &self.discovery {
            Some(discovery) => registry.merge(discovery.health().await?),
            None => registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ChangeKind;
    use crate::graphql::CapabilityAuthorizer;
    use crate::graphql::testing::catalog;
    use crate::schema::SchemaSpec;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn engine() -> Arc<Engine> {
        let engine = Engine::builder(catalog(), Arc::new(MemoryStore::new())).build();
        engine
            .registry()
            .register(SchemaSpec::new("catalog").models(&["Product"]))
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_unknown_schema_is_a_coded_error() {
        let engine = engine();
        let response = engine.execute("nope", "{ products { id } }", None).await;
        assert_eq!(response.errors.len(), 1);
        let code = response.errors[0]
            .extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .cloned();
        assert_eq!(code, Some(async_graphql::Value::from("SCHEMA_NOT_FOUND")));
    }

    #[test]
    fn test_visible_operations_respect_authorizer() {
        let engine = Engine::builder(catalog(), Arc::new(MemoryStore::new()))
            .authorizer(Arc::new(CapabilityAuthorizer::default()))
            .build();
        engine
            .registry()
            .register(SchemaSpec::new("catalog").models(&["Product"]))
            .unwrap();
        let reader = Identity::new("u1").with_capability("catalog.view_product");
        let visible = engine.visible_operations("catalog", Some(&reader)).unwrap();
        assert!(!visible.is_empty());
        assert!(visible.iter().all(|op| op.kind.is_read()));
        assert!(engine.visible_operations("catalog", None).unwrap().is_empty());
        // served from the cache the second time
        let hits = engine.cache().stats().hits;
        engine.visible_operations("catalog", Some(&reader)).unwrap();
        assert_eq!(engine.cache().stats().hits, hits + 1);
    }

    #[test]
    fn test_row_writes_keep_built_schemas() {
        let engine = engine();
        engine.sdl("catalog").unwrap();
        let class = engine.on_change(ChangeEvent::row_written(
            ModelKey::new("catalog", "Product"),
            ChangeKind::RowCreated,
        ));
        assert_eq!(class, ChangeClass::Data);
        assert!(engine.registry().get("catalog").unwrap().built().is_some());
    }

    #[test]
    fn test_catalog_alteration_rebuilds_dependents() {
        let engine = engine();
        let before = engine.sdl("catalog").unwrap();
        let mut category = (*engine.catalog().get(&ModelKey::new("catalog", "Category")).unwrap()).clone();
        category = category.attribute(crate::models::AttributeDefinition::field("slug", "string"));
        engine.catalog().alter(category).unwrap();
        assert!(engine.registry().get("catalog").unwrap().built().is_none());
        let after = engine.sdl("catalog").unwrap();
        assert_ne!(before, after);
        assert!(after.contains("slug"));
    }

    #[test]
    fn test_health_and_metrics() {
        let engine = engine();
        engine
            .registry()
            .register(SchemaSpec::new("ghosts").models(&["Ghost"]))
            .unwrap();
        engine
            .registry()
            .register(SchemaSpec::new("off").models(&["Tag"]).disabled())
            .unwrap();
        let health = engine.health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!((health.total, health.enabled, health.disabled), (3, 2, 1));
        assert_eq!(health.issues.len(), 1);

        let metrics = engine.metrics();
        assert_eq!(metrics.schemas.keys().collect::<Vec<_>>(), vec!["catalog"]);
        assert_matches!(engine.sdl("off"), Err(RegistryError::Disabled(_)));
    }
}
