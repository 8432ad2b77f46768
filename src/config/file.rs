//! TOML override file (`--config`).
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8069
//!
//! [worker]
//! max_attempts = 5
//! processing_timeout_secs = 300
//! processor_command = "/opt/proxymod/bin/run-model"
//!
//! [retention]
//! days = 30
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::Config;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub retention: RetentionSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSection {
    pub queue_name: Option<String>,
    pub max_attempts: Option<u32>,
    pub processing_timeout_secs: Option<u64>,
    pub processor_command: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionSection {
    pub days: Option<u32>,
}

impl FileConfig {
    /// Overwrite every field the file sets.
    pub fn apply(self, config: &mut Config) {
        if let Some(host) = self.server.host {
            config.host = host;
        }
        if let Some(port) = self.server.port {
            config.port = port;
        }
        if let Some(queue_name) = self.worker.queue_name {
            config.queue_name = queue_name;
        }
        if let Some(n) = self.worker.max_attempts {
            config.max_attempts = n;
        }
        if let Some(secs) = self.worker.processing_timeout_secs {
            config.processing_timeout = Duration::from_secs(secs);
        }
        if let Some(command) = self.worker.processor_command {
            config.processor_command = Some(command);
        }
        if let Some(days) = self.retention.days {
            config.retention_days = days;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::from_lookup(|name| (name == "DATABASE_URL").then(|| "postgres://x/y".to_string()))
            .unwrap()
    }

    #[test]
    fn file_overrides_environment() {
        let file: FileConfig = toml::from_str(
            r#"
            [server]
            port = 9100

            [worker]
            max_attempts = 2
            processor_command = "/usr/bin/true"
            "#,
        )
        .unwrap();
        let mut config = base();
        file.apply(&mut config);
        assert_eq!(config.port, 9100);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_attempts, 2);
        assert_eq!(
            config.processor_command.as_deref(),
            Some(std::path::Path::new("/usr/bin/true"))
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<FileConfig>("[server]\nprot = 1\n").is_err());
    }

    #[test]
    fn with_file_revalidates() {
        let path = std::env::temp_dir().join(format!("proxymod-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[worker]\nmax_attempts = 0\n").unwrap();
        let result = base().with_file(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
