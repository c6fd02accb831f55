//! Schema registration input.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, RegistryError};

static SCHEMA_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]{0,63}$").expect("valid regex"));

/// Per-schema generation and safety settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaSettings {
    pub max_query_depth: usize,
    pub max_query_complexity: usize,
    pub page_size_default: usize,
    pub page_size_max: usize,
    pub enable_mutations: bool,
    pub enable_bulk: bool,
    pub enable_invocations: bool,
    pub bulk_batch_limit: usize,
    /// Relationship hops a single filter may traverse
    pub filter_max_depth: usize,
    /// Multiplier for list fields without a literal `first`/`limit`
    pub list_fanout: usize,
    pub include_reverse_relations: bool,
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            max_query_depth: 10,
            max_query_complexity: 1000,
            page_size_default: 25,
            page_size_max: 100,
            enable_mutations: true,
            enable_bulk: true,
            enable_invocations: true,
            bulk_batch_limit: 100,
            filter_max_depth: 3,
            list_fanout: 10,
            include_reverse_relations: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    /// Model references (`ns.Model` or bare `Model`)
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub exclude_models: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_discover: bool,
    #[serde(default)]
    pub settings: SchemaSettings,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

impl SchemaSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            version: default_version(),
            models: Vec::new(),
            exclude_models: Vec::new(),
            enabled: true,
            auto_discover: false,
            settings: SchemaSettings::default(),
        }
    }

    pub fn models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn exclude(mut self, models: &[&str]) -> Self {
        self.exclude_models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn auto_discover(mut self) -> Self {
        self.auto_discover = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn settings(mut self, settings: SchemaSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if !SCHEMA_NAME.is_match(&self.name) {
            return Err(RegistryError::InvalidSpec(format!(
                "schema name `{}` must start with a letter or underscore and contain only letters, digits, `_` or `-`",
                self.name
            )));
        }
        let s = &self.settings;
        if s.page_size_max == 0 || s.page_size_default == 0 {
            return Err(RegistryError::InvalidSpec("page sizes must be positive".into()));
        }
        if s.page_size_default > s.page_size_max {
            return Err(RegistryError::InvalidSpec(format!(
                "page_size_default ({}) exceeds page_size_max ({})",
                s.page_size_default, s.page_size_max
            )));
        }
        if s.max_query_depth == 0 || s.max_query_complexity == 0 {
            return Err(RegistryError::InvalidSpec("query limits must be positive".into()));
        }
        if s.enable_bulk && s.bulk_batch_limit == 0 {
            return Err(RegistryError::InvalidSpec("bulk_batch_limit must be positive".into()));
        }
        Ok(())
    }
}

/// Partial update applied by `SchemaRegistry::update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaUpdate {
    pub description: Option<String>,
    pub version: Option<String>,
    pub models: Option<Vec<String>>,
    pub exclude_models: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub auto_discover: Option<bool>,
    pub settings: Option<SchemaSettings>,
}

impl SchemaUpdate {
    /// True when applying this update invalidates a built schema.
    pub fn affects_build(&self) -> bool {
        self.models.is_some() || self.exclude_models.is_some() || self.settings.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    schemas: Vec<SchemaSpec>,
}

/// Load `schemas:` from a YAML file.
pub fn load_specs(path: impl AsRef<Path>) -> Result<Vec<SchemaSpec>, ConfigError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let file: SchemaFile = serde_yaml::from_str(&source).map_err(|source| ConfigError::Yaml {
        path: path.display().to_string(),
        source,
    })?;
    Ok(file.schemas)
}
