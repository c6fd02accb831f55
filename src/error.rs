//! Error types
//!
//! One enum per concern, all converging on [EngineError]. GraphQL-visible
//! failures are converted to `async_graphql::Error` with a `code` extension at
//! the resolver boundary.

use async_graphql::{ErrorExtensions, ServerError};

use crate::models::ModelKey;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("model {0} is already registered")]
    Duplicate(ModelKey),

    #[error("model {0} is not registered")]
    Unknown(ModelKey),

    #[error("invalid model declarations: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum IntrospectionError {
    #[error("model {0} is not registered")]
    UnknownModel(ModelKey),

    #[error("model {model} inherits from unknown parent `{parent}`")]
    UnknownParent { model: ModelKey, parent: String },

    #[error("inheritance cycle through {0}")]
    InheritanceCycle(ModelKey),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    #[error("unknown filter field `{0}`")]
    UnknownField(String),

    #[error("filter `{field}` expects {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },

    #[error("filter through `{field}` exceeds the maximum relation depth of {limit}")]
    TooDeep { field: String, limit: usize },

    #[error("unknown ordering field `{0}`")]
    UnknownOrderField(String),

    #[error("invalid cursor `{0}`")]
    InvalidCursor(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("constraint violated: {0}")]
    Conflict(String),

    #[error("unknown table `{0}`")]
    UnknownTable(String),

    #[error("transaction already finished")]
    Finished,

    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Transient failures worth a single retry on idempotent reads.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no model in `{0}` could be included")]
    NoModels(String),

    #[error("generated schema is invalid: {0}")]
    Invalid(String),

    #[error(transparent)]
    Introspection(#[from] IntrospectionError),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("schema `{0}` is already registered")]
    Duplicate(String),

    #[error("schema `{0}` not found")]
    NotFound(String),

    #[error("schema `{0}` is disabled")]
    Disabled(String),

    #[error("invalid schema spec: {0}")]
    InvalidSpec(String),

    #[error("schema `{name}` failed to build: {source}")]
    Build {
        name: String,
        #[source]
        source: BuildError,
    },
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::Duplicate(_) => "SCHEMA_EXISTS",
            RegistryError::NotFound(_) => "SCHEMA_NOT_FOUND",
            RegistryError::Disabled(_) => "SCHEMA_DISABLED",
            RegistryError::InvalidSpec(_) => "INVALID_SPEC",
            RegistryError::Build { .. } => "SCHEMA_BUILD_FAILED",
        }
    }

    pub fn to_server_error(&self) -> ServerError {
        to_server_error(self.code(), self.to_string(), Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SafetyError {
    #[error("query depth {measured} exceeds the limit of {limit}")]
    TooDeep { measured: usize, limit: usize },

    #[error("query complexity {measured} exceeds the limit of {limit}")]
    TooComplex { measured: usize, limit: usize },

    #[error("failed to parse query: {0}")]
    Parse(String),
}

impl SafetyError {
    pub fn code(&self) -> &'static str {
        match self {
            SafetyError::TooDeep { .. } => "QUERY_TOO_DEEP",
            SafetyError::TooComplex { .. } => "QUERY_TOO_COMPLEX",
            SafetyError::Parse(_) => "PARSE_ERROR",
        }
    }

    pub fn to_server_error(&self) -> ServerError {
        let extra = match self {
            SafetyError::TooDeep { measured, limit } | SafetyError::TooComplex { measured, limit } => {
                vec![("measured", *measured as i64), ("limit", *limit as i64)]
            }
            SafetyError::Parse(_) => Vec::new(),
        };
        to_server_error(self.code(), self.to_string(), extra)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    InvalidVar { var: &'static str, message: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Introspection(#[from] IntrospectionError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A GraphQL error carrying a machine readable `code` extension.
pub fn coded_error(code: &'static str, message: impl Into<String>) -> async_graphql::Error {
    async_graphql::Error::new(message).extend_with(|_, ext| ext.set("code", code))
}

impl FilterError {
    pub fn to_graphql(&self) -> async_graphql::Error {
        coded_error("VALIDATION", self.to_string())
    }
}

impl StoreError {
    pub fn to_graphql(&self) -> async_graphql::Error {
        coded_error("GENERAL", self.to_string())
    }
}

fn to_server_error(code: &'static str, message: String, extra: Vec<(&'static str, i64)>) -> ServerError {
    let mut err = ServerError::new(message, None);
    let mut extensions = async_graphql::ErrorExtensionValues::default();
    extensions.set("code", code);
    for (key, value) in extra {
        extensions.set(key, value);
    }
    err.extensions = Some(extensions);
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_error_extensions() {
        let err = SafetyError::TooDeep {
            measured: 6,
            limit: 5,
        };
        let server = err.to_server_error();
        let ext = server.extensions.expect("extensions");
        assert_eq!(ext.get("code"), Some(&async_graphql::Value::from("QUERY_TOO_DEEP")));
        assert_eq!(ext.get("measured"), Some(&async_graphql::Value::from(6)));
        assert_eq!(ext.get("limit"), Some(&async_graphql::Value::from(5)));
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("pool".into()).is_transient());
        assert!(!StoreError::Conflict("sku".into()).is_transient());
    }
}
