//! Assigning unclaimed models to auto-discover schemas.
//!
//! A model is claimed when any schema without `auto_discover` lists it.
//! Every concrete (non-abstract) model nobody claims is appended to each
//! auto-discover schema that does not exclude it. When no auto-discover
//! schema exists and a default name is configured, one is created.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{SchemaRegistry, SchemaSpec};
use crate::lifecycle::{Service, ServiceHealth};
use crate::models::ModelKey;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryReport {
    /// Schema name to the model references added to it
    pub assigned: BTreeMap<String, Vec<String>>,
    /// Auto-discover schema created by this sweep
    pub created: Option<String>,
    /// Unclaimed models with no schema to go to
    pub unassigned: Vec<String>,
}

impl DiscoveryReport {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty() && self.created.is_none()
    }
}

impl SchemaRegistry {
    /// Run one discovery sweep.
    pub fn discover(&self, default_schema: Option<&str>) -> DiscoveryReport {
        let catalog = self.assembler().introspector().catalog().clone();
        let concrete: Vec<ModelKey> = catalog
            .definitions()
            .iter()
            .filter(|def| !def.is_abstract)
            .map(|def| ModelKey::new(def.namespace.as_str(), def.name.as_str()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut ignored = Vec::new();
        let mut report = DiscoveryReport::default();

        let has_target = self.list().iter().any(|e| e.spec.auto_discover);
        if let Some(name) = default_schema.filter(|_| !has_target) {
            let spec = SchemaSpec::new(name)
                .auto_discover()
                .description("Models not listed by any other schema");
            match self.register(spec) {
                Ok(_) => report.created = Some(name.to_string()),
                Err(err) => warn!(schema = %name, error = %err, "Could not create discovery schema"),
            }
        }

        let assembler = self.assembler().clone();
        let assigned = self.edit_specs(|entries| {
            let claimed: BTreeSet<ModelKey> = entries
                .values()
                .filter(|e| !e.spec.auto_discover)
                .flat_map(|e| assembler.resolve_models(&e.spec.models, &mut ignored))
                .collect();
            let unclaimed: Vec<&ModelKey> = concrete.iter().filter(|k| !claimed.contains(*k)).collect();

            let mut assigned = BTreeMap::new();
            let targets: Vec<String> = entries
                .values()
                .filter(|e| e.spec.auto_discover)
                .map(|e| e.spec.name.clone())
                .collect();
            if targets.is_empty() {
                report.unassigned = unclaimed.iter().map(|k| k.to_string()).collect();
            }
            for name in targets {
                let Some(entry) = entries.get(&name) else { continue };
                let mut skip = ignored.clone();
                let present: BTreeSet<ModelKey> = assembler
                    .resolve_models(&entry.spec.models, &mut skip)
                    .into_iter()
                    .chain(assembler.resolve_models(&entry.spec.exclude_models, &mut skip))
                    .collect();
                let added: Vec<String> = unclaimed
                    .iter()
                    .filter(|k| !present.contains(**k))
                    .map(|k| k.to_string())
                    .collect();
                if added.is_empty() {
                    continue;
                }
                let mut spec = entry.spec.clone();
                spec.models.extend(added.iter().cloned());
                let next = SchemaRegistry::rebuilt_entry(entry, spec);
                entries.insert(name.clone(), next);
                assigned.insert(name, added);
            }
            assigned
        });
        report.assigned = assigned;

        if report.is_empty() {
            debug!("Discovery found nothing to assign");
        } else {
            info!(assigned = ?report.assigned, created = ?report.created, "Discovery assigned models");
        }
        report
    }
}

/// Periodic discovery sweep on a tokio interval.
pub struct DiscoveryService {
    registry: Arc<SchemaRegistry>,
    interval: Duration,
    default_schema: Option<String>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(registry: Arc<SchemaRegistry>, interval: Duration, default_schema: Option<String>) -> Self {
        Self {
            registry,
            interval,
            default_schema,
            shutdown_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

async fn sweep_loop(
    registry: Arc<SchemaRegistry>,
    period: Duration,
    default_schema: Option<String>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = interval.tick() => {
                registry.discover(default_schema.as_deref());
            }
        }
    }
}

#[async_trait]
impl Service for DiscoveryService {
    fn name(&self) -> &str {
        "discovery"
    }

    async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if self.interval.is_zero() {
            anyhow::bail!("discovery interval must be positive");
        }
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(sweep_loop(
            self.registry.clone(),
            self.interval,
            self.default_schema.clone(),
            shutdown_rx,
        ));
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        *self.handle.lock() = Some(handle);
        info!(service = %self.name(), interval_secs = self.interval.as_secs(), "Started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        let _ = self.shutdown_tx.lock().take().map(|tx| tx.send(()));
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(service = %self.name(), "Stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        Ok(if self.is_running() {
            ServiceHealth::healthy()
        } else {
            ServiceHealth::degraded("discovery sweep is not running")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetadataCache;
    use crate::graphql::AllowAll;
    use crate::graphql::testing::catalog;
    use crate::introspect::Introspector;
    use crate::schema::SchemaAssembler;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn registry() -> Arc<SchemaRegistry> {
        let introspector = Arc::new(Introspector::new(catalog(), Arc::new(MetadataCache::default())));
        Arc::new(SchemaRegistry::new(Arc::new(SchemaAssembler::new(
            introspector,
            Arc::new(MemoryStore::new()),
            Arc::new(AllowAll),
            None,
        ))))
    }

    #[test]
    fn test_discover_assigns_unclaimed_models() {
        let registry = registry();
        registry
            .register(SchemaSpec::new("products").models(&["Product"]))
            .unwrap();
        registry
            .register(SchemaSpec::new("rest").auto_discover().exclude(&["Tag"]))
            .unwrap();

        let report = registry.discover(None);
        assert_eq!(
            report.assigned.get("rest"),
            Some(&vec!["catalog.Category".to_string()])
        );
        assert_eq!(report.created, None);
        assert_eq!(registry.get("rest").unwrap().spec.models, vec!["catalog.Category".to_string()]);

        // a second sweep has nothing left to do
        assert!(registry.discover(None).is_empty());
    }

    #[test]
    fn test_discover_creates_default_schema() {
        let registry = registry();
        registry
            .register(SchemaSpec::new("products").models(&["Product", "Tag"]))
            .unwrap();

        let report = registry.discover(Some("discovered"));
        assert_eq!(report.created.as_deref(), Some("discovered"));
        assert_eq!(
            report.assigned.get("discovered"),
            Some(&vec!["catalog.Category".to_string()])
        );
        assert!(registry.get("discovered").unwrap().spec.auto_discover);
    }

    #[test]
    fn test_discover_without_target_reports_unassigned() {
        let registry = registry();
        registry
            .register(SchemaSpec::new("products").models(&["Product"]))
            .unwrap();
        let report = registry.discover(None);
        assert!(report.assigned.is_empty());
        assert_eq!(report.unassigned, vec!["catalog.Category".to_string(), "catalog.Tag".to_string()]);
    }

    #[tokio::test]
    async fn test_service_runs_and_stops() {
        let registry = registry();
        let service = DiscoveryService::new(registry.clone(), Duration::from_millis(10), Some("auto".into()));
        service.start().await.unwrap();
        assert!(service.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.get("auto").is_some());
        service.stop().await.unwrap();
        assert!(!service.is_running());
    }
}
