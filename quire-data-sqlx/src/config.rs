//! Connection settings.
//!
//! Resolution order, later sources overriding earlier ones:
//!
//! 1. `application.yaml`, `database:` section
//! 2. `application-{profile}.yaml` (profile override, deep-merged)
//! 3. `.env` and `.env.{profile}` (loaded into the process environment)
//! 4. Environment variables `QUIRE_DATABASE_<KEY>` (e.g. `QUIRE_DATABASE_URL`)
//!
//! `.env` files never overwrite already-set environment variables.
//! Profile is determined by: `QUIRE_PROFILE` env var > argument.

use std::path::{Path, PathBuf};
use std::time::Duration;

use quire_data::DataError;
use serde::Deserialize;

const ENV_PREFIX: &str = "QUIRE_DATABASE_";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DalConfig {
    /// SQLite connection URL, e.g. `sqlite://data.db` or `sqlite::memory:`.
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long to wait for a free pooled connection.
    pub acquire_timeout_ms: u64,
    /// Upper bound on a single statement.
    pub statement_timeout_ms: u64,
    pub idle_timeout_ms: Option<u64>,
    pub max_lifetime_ms: Option<u64>,
    /// Directory of `*.sql` migrations applied on connect.
    pub migrations: Option<PathBuf>,
}

impl Default for DalConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://quire.db".to_string(),
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_ms: 30_000,
            statement_timeout_ms: 30_000,
            idle_timeout_ms: Some(600_000),
            max_lifetime_ms: Some(1_800_000),
            migrations: None,
        }
    }
}

impl DalConfig {
    /// A private in-memory database. The pool holds exactly one connection
    /// that is never reaped, since the database lives and dies with it.
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            idle_timeout_ms: None,
            max_lifetime_ms: None,
            ..Self::default()
        }
    }

    /// Load configuration for the given profile from the working directory
    /// and the environment.
    pub fn load(profile: &str) -> Result<Self, DataError> {
        Self::load_from(Path::new("."), profile)
    }

    /// Like [`load`](Self::load), reading YAML files from `dir`.
    pub fn load_from(dir: &Path, profile: &str) -> Result<Self, DataError> {
        let active_profile =
            std::env::var("QUIRE_PROFILE").unwrap_or_else(|_| profile.to_string());

        let mut tree = serde_yaml::Value::Null;
        merge(&mut tree, read_yaml(&dir.join("application.yaml"))?);
        merge(
            &mut tree,
            read_yaml(&dir.join(format!("application-{active_profile}.yaml")))?,
        );

        let _ = dotenvy::dotenv();
        let _ = dotenvy::from_filename(format!(".env.{active_profile}"));

        let section = database_section(tree);
        let config = Self::from_section(section, std::env::vars())?;
        tracing::debug!(profile = %active_profile, url = %config.url, "database configuration loaded");
        Ok(config)
    }

    /// Parse a YAML document with a `database:` section (useful for testing).
    pub fn from_yaml_str(yaml: &str) -> Result<Self, DataError> {
        let tree: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(config_error)?;
        Self::from_section(database_section(tree), std::iter::empty())
    }

    /// Overlay `QUIRE_DATABASE_<KEY>` variables from `env` onto `section`.
    fn from_section(
        mut section: serde_yaml::Value,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, DataError> {
        if section.is_null() {
            section = serde_yaml::Value::Mapping(Default::default());
        }
        for (key, value) in env {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let parsed: serde_yaml::Value = serde_yaml::from_str(&value)
                .unwrap_or_else(|_| serde_yaml::Value::String(value.clone()));
            // URLs and paths stay strings even when they parse as something else.
            let parsed = match field {
                "URL" | "MIGRATIONS" => serde_yaml::Value::String(value),
                _ => parsed,
            };
            if let serde_yaml::Value::Mapping(map) = &mut section {
                map.insert(serde_yaml::Value::String(field.to_lowercase()), parsed);
            }
        }
        serde_yaml::from_value(section).map_err(config_error)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_ms.map(Duration::from_millis)
    }
}

fn config_error(err: impl std::fmt::Display) -> DataError {
    DataError::Config(err.to_string())
}

fn read_yaml(path: &Path) -> Result<serde_yaml::Value, DataError> {
    if !path.exists() {
        return Ok(serde_yaml::Value::Null);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| DataError::Config(format!("{}: {e}", path.display())))?;
    serde_yaml::from_str(&content).map_err(|e| DataError::Config(format!("{}: {e}", path.display())))
}

fn database_section(tree: serde_yaml::Value) -> serde_yaml::Value {
    match tree {
        serde_yaml::Value::Mapping(mut map) => map
            .remove(serde_yaml::Value::String("database".into()))
            .unwrap_or(serde_yaml::Value::Null),
        _ => serde_yaml::Value::Null,
    }
}

/// Deep-merge `overlay` into `base`; mappings merge key by key, anything
/// else replaces.
fn merge(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (_, serde_yaml::Value::Null) => {}
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
