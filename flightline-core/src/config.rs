//! Configuration system for Flightline.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! `FLIGHTLINE_*` environment -> `DB_*` environment. The result is resolved
//! once into an immutable [`EtlConfig`]; database credentials are further
//! resolved into [`DatabaseSettings`] by the loader.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml, Yaml},
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Config file read when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

/// Prefix for nested overrides, e.g. `FLIGHTLINE_ETL__CHUNK_SIZE`.
pub const ENV_PREFIX: &str = "FLIGHTLINE_";

/// Sink variables parsed into typed fields.
const DB_TYPED_VARS: &[&str] = &["DB_ENGINE", "DB_PORT"];

/// Sink variables kept as the exact text of the environment value.
const DB_TEXT_VARS: &[&str] = &["DB_USER", "DB_PASSWORD", "DB_HOST", "DB_NAME"];

const REDACTED: &str = "***";

/// Top-level configuration for a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub paths: PathsConfig,
    pub etl: EtlSettings,
    pub database: DatabaseConfig,
}

/// Input locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// CSV file to extract.
    pub input_data: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_data: PathBuf::from("data/flights_sample_3m.csv"),
        }
    }
}

/// Batch sizes, target table and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlSettings {
    /// Rows per load batch.
    pub chunk_size: usize,
    /// Target table name.
    pub table_name: String,
    /// Rows per CSV read batch. Falls back to `chunk_size` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_chunk_size: Option<usize>,
    /// Budget for connecting and the liveness probe.
    pub connect_timeout_secs: u64,
    /// Budget for each batch write and the count query.
    pub operation_timeout_secs: u64,
}

impl Default for EtlSettings {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            table_name: "flights".to_string(),
            read_chunk_size: None,
            connect_timeout_secs: 10,
            operation_timeout_secs: 300,
        }
    }
}

impl EtlSettings {
    pub fn effective_read_chunk_size(&self) -> usize {
        self.read_chunk_size.unwrap_or(self.chunk_size)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Supported relational sinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbEngine {
    #[default]
    #[serde(rename = "postgresql", alias = "postgres")]
    Postgres,
    #[serde(rename = "sqlite")]
    Sqlite,
}

impl fmt::Display for DbEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbEngine::Postgres => write!(f, "postgresql"),
            DbEngine::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Raw database section; every field may be absent until resolved.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub engine: DbEngine,
    #[serde(
        default,
        deserialize_with = "text_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub user: Option<String>,
    #[serde(
        default,
        deserialize_with = "text_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<String>,
    #[serde(
        default,
        deserialize_with = "text_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Database name, or the file path for SQLite.
    #[serde(
        default,
        deserialize_with = "text_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
}

/// Reads a text field that a config file may spell as a bare number
/// (`password: 2552`).
fn text_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Signed(i64),
        Unsigned(u64),
        Float(f64),
        Bool(bool),
    }

    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|value| match value {
        Scalar::Text(s) => s,
        Scalar::Signed(n) => n.to_string(),
        Scalar::Unsigned(n) => n.to_string(),
        Scalar::Float(n) => n.to_string(),
        Scalar::Bool(b) => b.to_string(),
    }))
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("engine", &self.engine)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .finish()
    }
}

impl DatabaseConfig {
    /// Resolve into connection settings, naming every missing variable.
    pub fn resolve(&self) -> Result<DatabaseSettings, ConfigError> {
        fn given(value: &Option<String>) -> Option<String> {
            value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(String::from)
        }

        match self.engine {
            DbEngine::Sqlite => {
                let path = given(&self.name).ok_or_else(|| ConfigError::MissingDatabaseParams {
                    vars: vec!["DB_NAME".to_string()],
                })?;
                Ok(DatabaseSettings::Sqlite {
                    path: PathBuf::from(path),
                })
            }
            DbEngine::Postgres => {
                let user = given(&self.user);
                let password = self.password.clone().filter(|p| !p.is_empty());
                let host = given(&self.host);
                let name = given(&self.name);

                let mut missing = Vec::new();
                for (var, present) in [
                    ("DB_USER", user.is_some()),
                    ("DB_PASSWORD", password.is_some()),
                    ("DB_HOST", host.is_some()),
                    ("DB_PORT", self.port.is_some()),
                    ("DB_NAME", name.is_some()),
                ] {
                    if !present {
                        missing.push(var.to_string());
                    }
                }

                match (user, password, host, self.port, name) {
                    (Some(user), Some(password), Some(host), Some(port), Some(name)) => {
                        Ok(DatabaseSettings::Postgres {
                            user,
                            password,
                            host,
                            port,
                            name,
                        })
                    }
                    _ => Err(ConfigError::MissingDatabaseParams { vars: missing }),
                }
            }
        }
    }
}

/// Fully resolved, immutable connection settings.
#[derive(Clone, PartialEq, Eq)]
pub enum DatabaseSettings {
    Postgres {
        user: String,
        password: String,
        host: String,
        port: u16,
        name: String,
    },
    Sqlite {
        path: PathBuf,
    },
}

impl DatabaseSettings {
    pub fn engine(&self) -> DbEngine {
        match self {
            DatabaseSettings::Postgres { .. } => DbEngine::Postgres,
            DatabaseSettings::Sqlite { .. } => DbEngine::Sqlite,
        }
    }

    /// Connection URL with user and password percent-encoded.
    pub fn connection_url(&self) -> String {
        self.url_with_password(None)
    }

    /// Connection URL safe for logs.
    pub fn redacted_url(&self) -> String {
        self.url_with_password(Some(REDACTED))
    }

    fn url_with_password(&self, mask: Option<&str>) -> String {
        match self {
            DatabaseSettings::Postgres {
                user,
                password,
                host,
                port,
                name,
            } => {
                let password = match mask {
                    Some(mask) => mask.to_string(),
                    None => urlencoding::encode(password).into_owned(),
                };
                format!(
                    "postgresql://{}:{}@{}:{}/{}",
                    urlencoding::encode(user),
                    password,
                    host,
                    port,
                    name
                )
            }
            DatabaseSettings::Sqlite { path } => format!("sqlite://{}", path.display()),
        }
    }
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted_url())
    }
}

impl EtlConfig {
    /// Reject values no run could use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };
        if self.etl.chunk_size == 0 {
            return invalid("etl.chunk_size must be a positive integer");
        }
        if self.etl.read_chunk_size == Some(0) {
            return invalid("etl.read_chunk_size must be a positive integer");
        }
        if self.etl.table_name.trim().is_empty() {
            return invalid("etl.table_name must not be empty");
        }
        if self.etl.connect_timeout_secs == 0 || self.etl.operation_timeout_secs == 0 {
            return invalid("timeouts must be at least one second");
        }
        Ok(())
    }

    /// Copy with the database password masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.database.password.is_some() {
            copy.database.password = Some(REDACTED.to_string());
        }
        copy
    }
}

fn db_field(key: &str) -> String {
    key.to_ascii_lowercase().trim_start_matches("db_").to_string()
}

fn env_layers(figment: Figment) -> Figment {
    // figment parses env values (`2552` becomes a number, `0123` loses its
    // zero), so credentials bypass the parser and merge as strings.
    let text: BTreeMap<String, String> = Env::raw()
        .only(DB_TEXT_VARS)
        .iter()
        .map(|(key, value)| (db_field(key.as_str()), value))
        .collect();

    figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .merge(
            Env::raw()
                .only(DB_TYPED_VARS)
                .map(|key| format!("database.{}", db_field(key.as_str())).into()),
        )
        .merge(Serialized::default("database", text))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. `DB_*` environment variables
/// 2. `FLIGHTLINE_*` environment variables
/// 3. The config file (YAML, or TOML by `.toml` extension)
/// 4. Built-in defaults
pub fn load_config(path: Option<&Path>) -> Result<EtlConfig, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut figment = Figment::from(Serialized::defaults(EtlConfig::default()));
    figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => figment.merge(Toml::file(path)),
        _ => figment.merge(Yaml::file(path)),
    };
    let config: EtlConfig = env_layers(figment).extract()?;
    config.validate()?;
    debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Load configuration, falling back to defaults plus environment when the
/// file cannot be used.
pub fn load_config_or_default(path: Option<&Path>) -> EtlConfig {
    match load_config(path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Error loading configuration, using defaults and environment");
            let fallback: Result<EtlConfig, ConfigError> =
                env_layers(Figment::from(Serialized::defaults(EtlConfig::default())))
                    .extract()
                    .map_err(ConfigError::from)
                    .and_then(|config: EtlConfig| config.validate().map(|()| config));
            fallback.unwrap_or_else(|err| {
                warn!(error = %err, "Environment overrides rejected, using built-in defaults");
                EtlConfig::default()
            })
        }
    }
}
