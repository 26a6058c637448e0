//! Startup configuration for the flight board.
//!
//! The configuration file is read once before the server binds a socket.
//! Files ending in `.json` are parsed as JSON (the historical `config.json`
//! layout), everything else as TOML. Absent fields take the defaults below;
//! a missing or malformed file is a fatal [`ConfigError`].

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable consulted when `database.password` is absent from the file
pub const PASSWORD_ENV: &str = "FLIGHT_DATABASE_PASSWORD";

/// Largest deadline PostgreSQL accepts as a `statement_timeout` (i32 milliseconds)
pub const MAX_DEADLINE_SECS: u64 = i32::MAX as u64 / 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse configuration file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Fully validated configuration. Never mutated after [`load`] returns.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub html: HtmlConfig,
    /// `mysql` is the section name used by older `config.json` files
    #[serde(alias = "mysql")]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            port: default_http_port(),
        }
    }
}

/// Template and static asset locations
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HtmlConfig {
    #[serde(default = "default_views")]
    pub views: PathBuf,
    #[serde(default = "default_public")]
    pub public: PathBuf,
}

impl Default for HtmlConfig {
    fn default() -> Self {
        Self {
            views: default_views(),
            public: default_public(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    pub database: String,
    /// Upper bound on concurrently leased connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// How long an acquire may wait for a free slot before giving up
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl DatabaseConfig {
    /// libpq keyword/value connection string
    pub fn connection_string(&self) -> String {
        let mut conninfo = format!(
            "host={} port={} user={} dbname={}",
            quote_conninfo(&self.host),
            self.port,
            quote_conninfo(&self.user),
            quote_conninfo(&self.database),
        );
        if let Some(password) = &self.password {
            conninfo.push_str(" password=");
            conninfo.push_str(&quote_conninfo(password));
        }
        conninfo
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    /// Trailing window in seconds; older observations are not shown
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            period_secs: default_period_secs(),
            deadline_secs: default_deadline_secs(),
        }
    }
}

impl QueryConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Prometheus exporter port; the exporter is disabled when unset
    #[serde(default)]
    pub port: Option<u16>,
}

impl Config {
    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.http.interface, self.http.port)
            .parse()
            .map_err(|e| ConfigError::Invalid {
                field: "http.interface",
                reason: format!("{e}"),
            })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address()?;

        let checks: [(&'static str, bool, &str); 7] = [
            ("database.user", !self.database.user.trim().is_empty(), "must not be empty"),
            (
                "database.database",
                !self.database.database.trim().is_empty(),
                "must not be empty",
            ),
            ("database.pool_size", self.database.pool_size >= 1, "must be at least 1"),
            (
                "database.acquire_timeout_secs",
                self.database.acquire_timeout_secs >= 1,
                "must be at least 1",
            ),
            ("query.period_secs", self.query.period_secs >= 1, "must be at least 1"),
            ("query.deadline_secs", self.query.deadline_secs >= 1, "must be at least 1"),
            (
                "query.deadline_secs",
                self.query.deadline_secs <= MAX_DEADLINE_SECS,
                "exceeds the largest PostgreSQL statement timeout",
            ),
        ];

        match checks.into_iter().find(|(_, ok, _)| !ok) {
            Some((field, _, reason)) => Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Read, parse and validate the configuration file at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut config = parse(path, &contents)?;

    if config.database.password.is_none() {
        config.database.password = std::env::var(PASSWORD_ENV).ok();
    }

    config.validate()?;
    Ok(config)
}

fn parse(path: &Path, contents: &str) -> Result<Config, ConfigError> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let parsed = if is_json {
        serde_json::from_str(contents).map_err(|e| e.to_string())
    } else {
        toml::from_str(contents).map_err(|e| e.to_string())
    };

    parsed.map_err(|reason| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    })
}

fn quote_conninfo(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

fn default_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    9090
}

fn default_views() -> PathBuf {
    PathBuf::from("templates")
}

fn default_public() -> PathBuf {
    PathBuf::from("public")
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_pool_size() -> u32 {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    2
}

fn default_period_secs() -> u64 {
    60
}

fn default_deadline_secs() -> u64 {
    5
}
