//! Typed configuration from environment variables, with an optional TOML
//! override file.
//!
//! Loads once at startup, fails fast if required vars are missing or values
//! are out of range. The resulting [`Config`] is immutable and shared by
//! reference with the receiver, status, and worker components.
//! Connection strings are wrapped in secrecy::SecretString to prevent log leaks.

pub mod file;

pub use file::FileConfig;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8069;
pub const DEFAULT_QUEUE: &str = "proxymod_receive";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_PROCESSING_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
/// One day.
pub const MAX_PROCESSING_TIMEOUT_SECS: u64 = 86_400;

#[derive(Debug)]
pub struct Config {
    /// Task store connection target.
    pub database_url: SecretString,
    /// Queue broker connection target. `None` means pgmq on the task store database.
    pub broker_url: Option<SecretString>,
    pub queue_name: String,
    pub host: String,
    pub port: u16,
    /// Processing attempts before a task is marked failed.
    pub max_attempts: u32,
    /// Upper bound on one processing attempt.
    pub processing_timeout: Duration,
    /// Executable that performs the proxy-model update.
    pub processor_command: Option<PathBuf>,
    /// Age after which terminal tasks may be pruned.
    pub retention_days: u32,
    pub db_max_connections: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| {
            var(name).ok_or_else(|| {
                Error::Config(format!("required environment variable {name} is not set"))
            })
        };

        let config = Self {
            database_url: SecretString::from(required("DATABASE_URL")?),
            broker_url: var("BROKER_URL").map(SecretString::from),
            queue_name: var("QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            host: var("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parsed(&var, "PORT")?.unwrap_or(DEFAULT_PORT),
            max_attempts: parsed(&var, "MAX_ATTEMPTS")?.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            processing_timeout: Duration::from_secs(
                parsed(&var, "PROCESSING_TIMEOUT_SECS")?
                    .unwrap_or(DEFAULT_PROCESSING_TIMEOUT_SECS),
            ),
            processor_command: var("PROCESSOR_COMMAND").map(PathBuf::from),
            retention_days: parsed(&var, "RETENTION_DAYS")?.unwrap_or(DEFAULT_RETENTION_DAYS),
            db_max_connections: parsed(&var, "DB_MAX_CONNECTIONS")?.unwrap_or(10),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply a TOML override file on top of the environment.
    pub fn with_file(mut self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let file: FileConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))?;
        file.apply(&mut self);
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.processing_timeout.is_zero() {
            return Err(Error::Config("processing timeout must be positive".to_string()));
        }
        if self.processing_timeout > Duration::from_secs(MAX_PROCESSING_TIMEOUT_SECS) {
            return Err(Error::Config(format!(
                "processing timeout must be at most {MAX_PROCESSING_TIMEOUT_SECS}s"
            )));
        }
        if self.queue_name.is_empty() {
            return Err(Error::Config("queue name must not be empty".to_string()));
        }
        if self.db_max_connections == 0 {
            return Err(Error::Config("db_max_connections must be at least 1".to_string()));
        }
        Ok(())
    }

    /// `host:port` for the HTTP listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parsed<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw}")))
        })
        .transpose()
}
