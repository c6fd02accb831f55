//! Engine configuration loaded from environment variables

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::logging::LogFormat;

/// Engine configuration loaded from environment variables (after `.env`)
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// YAML file with `models:`
    pub models_path: Option<PathBuf>,

    /// YAML file with `schemas:`
    pub schemas_path: Option<PathBuf>,

    /// Metadata cache TTL; unset keeps entries until invalidated
    pub cache_ttl: Option<Duration>,

    /// Discovery sweep period; unset disables the sweep
    pub discovery_interval: Option<Duration>,

    pub invalidate_on_data_write: bool,

    /// Auto-discover schema created by discovery when none exists
    pub default_schema: Option<String>,

    pub log_format: LogFormat,

    /// SQLite database URL; the in-memory store is used when unset
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models_path: None,
            schemas_path: None,
            cache_ttl: None,
            discovery_interval: None,
            invalidate_on_data_write: false,
            default_schema: None,
            log_format: LogFormat::Pretty,
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Load `.env` if present, then read `MODELQL_*` and `DATABASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        Ok(Self {
            models_path: get("MODELQL_MODELS_PATH").map(PathBuf::from),
            schemas_path: get("MODELQL_SCHEMAS_PATH").map(PathBuf::from),
            cache_ttl: seconds(get("MODELQL_CACHE_TTL_SECS"), "MODELQL_CACHE_TTL_SECS")?,
            discovery_interval: seconds(
                get("MODELQL_DISCOVERY_INTERVAL_SECS"),
                "MODELQL_DISCOVERY_INTERVAL_SECS",
            )?,
            invalidate_on_data_write: get("MODELQL_INVALIDATE_ON_DATA_WRITE")
                .map(|v| flag(&v, "MODELQL_INVALIDATE_ON_DATA_WRITE"))
                .transpose()?
                .unwrap_or(false),
            default_schema: get("MODELQL_DEFAULT_SCHEMA"),
            log_format: get("MODELQL_LOG_FORMAT")
                .map(|v| {
                    LogFormat::from_str(&v).map_err(|message| ConfigError::InvalidVar {
                        var: "MODELQL_LOG_FORMAT",
                        message,
                    })
                })
                .transpose()?
                .unwrap_or_default(),
            database_url: get("DATABASE_URL"),
        })
    }
}

/// Whole seconds; zero means unset.
fn seconds(value: Option<String>, var: &'static str) -> Result<Option<Duration>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let secs: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidVar {
        var,
        message: format!("expected a number of seconds, got `{value}`"),
    })?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

fn flag(value: &str, var: &'static str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidVar {
            var,
            message: format!("expected true or false, got `{other}`"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        EngineConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_defaults() {
        assert_eq!(load(&[]).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_reads_every_variable() {
        let config = load(&[
            ("MODELQL_MODELS_PATH", "models.yaml"),
            ("MODELQL_SCHEMAS_PATH", "schemas.yaml"),
            ("MODELQL_CACHE_TTL_SECS", "300"),
            ("MODELQL_DISCOVERY_INTERVAL_SECS", "0"),
            ("MODELQL_INVALIDATE_ON_DATA_WRITE", "yes"),
            ("MODELQL_DEFAULT_SCHEMA", "discovered"),
            ("MODELQL_LOG_FORMAT", "json"),
            ("DATABASE_URL", "sqlite::memory:"),
        ])
        .unwrap();
        assert_eq!(config.models_path, Some(PathBuf::from("models.yaml")));
        assert_eq!(config.cache_ttl, Some(Duration::from_secs(300)));
        assert_eq!(config.discovery_interval, None);
        assert!(config.invalidate_on_data_write);
        assert_eq!(config.default_schema.as_deref(), Some("discovered"));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.database_url.as_deref(), Some("sqlite::memory:"));
    }

    #[test]
    fn test_invalid_values() {
        assert_matches!(
            load(&[("MODELQL_CACHE_TTL_SECS", "soon")]),
            Err(ConfigError::InvalidVar { var: "MODELQL_CACHE_TTL_SECS", .. })
        );
        assert_matches!(
            load(&[("MODELQL_INVALIDATE_ON_DATA_WRITE", "maybe")]),
            Err(ConfigError::InvalidVar { .. })
        );
        assert_matches!(
            load(&[("MODELQL_LOG_FORMAT", "xml")]),
            Err(ConfigError::InvalidVar { var: "MODELQL_LOG_FORMAT", .. })
        );
    }
}
