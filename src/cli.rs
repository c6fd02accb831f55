//! Command line parsing and the commands behind it.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_graphql::{Request, Variables};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::lifecycle::Service;
use crate::models::ModelCatalog;
use crate::schema::load_specs;
use crate::store::{DataStore, MemoryStore};

pub const USAGE: &str = "\
usage: modelql [--models <file>] [--schemas <file>] <command>

commands:
  sdl <schema>                          print the generated SDL
  health                                print registry health as JSON
  metrics                               print engine metrics as JSON
  query <schema> <file> [--variables <file>]
                                        run a GraphQL document and print the response";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Sdl { schema: String },
    Health,
    Metrics,
    Query {
        schema: String,
        document: PathBuf,
        variables: Option<PathBuf>,
    },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOptions {
    pub command: Command,
    pub models: Option<PathBuf>,
    pub schemas: Option<PathBuf>,
}

impl CliOptions {
    pub fn from_args() -> Result<Self> {
        Self::parse(env::args().skip(1))
    }

    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut models = None;
        let mut schemas = None;
        let mut variables = None;
        let mut positional = Vec::new();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let mut value_of = |flag: &str| args.next().with_context(|| format!("{flag} needs a value"));
            match arg.as_str() {
                "--models" => models = Some(PathBuf::from(value_of("--models")?)),
                "--schemas" => schemas = Some(PathBuf::from(value_of("--schemas")?)),
                "--variables" => variables = Some(PathBuf::from(value_of("--variables")?)),
                "-h" | "--help" => positional.insert(0, "help".to_string()),
                _ if arg.starts_with("--models=") => models = arg.split_once('=').map(|(_, v)| PathBuf::from(v)),
                _ if arg.starts_with("--schemas=") => schemas = arg.split_once('=').map(|(_, v)| PathBuf::from(v)),
                _ if arg.starts_with("--") => bail!("unknown option {arg}"),
                _ => positional.push(arg),
            }
        }

        let mut positional = positional.into_iter();
        let command = match positional.next().as_deref() {
            None | Some("help") => Command::Help,
            Some("sdl") => Command::Sdl {
                schema: positional.next().context("sdl needs a schema name")?,
            },
            Some("health") => Command::Health,
            Some("metrics") => Command::Metrics,
            Some("query") => Command::Query {
                schema: positional.next().context("query needs a schema name")?,
                document: positional.next().map(PathBuf::from).context("query needs a document file")?,
                variables,
            },
            Some(other) => bail!("unknown command `{other}`"),
        };
        Ok(Self {
            command,
            models,
            schemas,
        })
    }
}

/// Build and start an engine from configuration: catalog, store, schemas.
pub async fn bootstrap(config: &EngineConfig) -> Result<Arc<Engine>> {
    let catalog = match &config.models_path {
        Some(path) => ModelCatalog::load_yaml(path)?,
        None => bail!("no model file given (set MODELQL_MODELS_PATH or pass --models)"),
    };
    let catalog = Arc::new(catalog);

    let mut builder = Engine::builder(catalog.clone(), open_store(config, &catalog).await?)
        .cache_ttl(config.cache_ttl)
        .invalidate_on_data_write(config.invalidate_on_data_write);
    if let Some(interval) = config.discovery_interval {
        builder = builder.discovery(interval, config.default_schema.clone());
    }
    let engine = builder.build();
    engine.start().await?;

    if let Some(path) = &config.schemas_path {
        for spec in load_specs(path)? {
            engine.registry().register(spec)?;
        }
    }
    if engine.registry().list().is_empty() {
        let name = config.default_schema.as_deref().unwrap_or("default");
        let report = engine.registry().discover(Some(name));
        info!(schema = name, models = ?report.assigned.get(name), "No schemas configured, discovered one");
    }
    Ok(engine)
}

#[cfg(feature = "sqlite")]
async fn open_store(config: &EngineConfig, catalog: &Arc<ModelCatalog>) -> Result<Arc<dyn DataStore>> {
    use crate::cache::MetadataCache;
    use crate::introspect::Introspector;
    use crate::store::SqliteStore;

    let Some(url) = &config.database_url else {
        return Ok(Arc::new(MemoryStore::new()));
    };
    let store = SqliteStore::connect(url).await?;
    let introspector = Introspector::new(catalog.clone(), Arc::new(MetadataCache::default()));
    let descriptors: Vec<_> = catalog
        .keys()
        .iter()
        .filter_map(|key| introspector.describe(key).ok())
        .filter(|d| !d.inheritance.is_abstract)
        .collect();
    let sync = store.sync_tables(&descriptors).await?;
    for error in &sync.errors {
        warn!(error = %error, "Table sync problem");
    }
    info!(created = ?sync.tables_created, added = sync.columns_added.len(), "Tables synced");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_store(config: &EngineConfig, _catalog: &Arc<ModelCatalog>) -> Result<Arc<dyn DataStore>> {
    if config.database_url.is_some() {
        warn!("DATABASE_URL is set but sqlite support is not compiled in; using the in-memory store");
    }
    Ok(Arc::new(MemoryStore::new()))
}

/// Run `options.command` and return what it prints.
pub async fn run(options: CliOptions, mut config: EngineConfig) -> Result<String> {
    if options.command == Command::Help {
        return Ok(USAGE.to_string());
    }
    if options.models.is_some() {
        config.models_path = options.models;
    }
    if options.schemas.is_some() {
        config.schemas_path = options.schemas;
    }
    let engine = bootstrap(&config).await?;

    let output = match options.command {
        Command::Help => USAGE.to_string(),
        Command::Sdl { schema } => engine.sdl(&schema)?,
        Command::Health => serde_json::to_string_pretty(&engine.health())?,
        Command::Metrics => {
            for entry in engine.registry().list() {
                if entry.enabled() {
                    let _ = engine.registry().build_entry(&entry);
                }
            }
            serde_json::to_string_pretty(&engine.metrics())?
        }
        Command::Query {
            schema,
            document,
            variables,
        } => {
            let query = std::fs::read_to_string(&document)
                .with_context(|| format!("failed to read {}", document.display()))?;
            let mut request = Request::new(query);
            if let Some(path) = variables {
                let source = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let json: serde_json::Value = serde_json::from_str(&source)
                    .with_context(|| format!("invalid JSON in {}", path.display()))?;
                request = request.variables(Variables::from_json(json));
            }
            let response = engine.execute(&schema, request, None).await;
            serde_json::to_string_pretty(&response)?
        }
    };
    engine.stop().await?;
    Ok(output)
}
