//! Configuration management for the relay.
//!
//! `config.json` under the base directory holds every tunable. Each section
//! has serde defaults, so a file containing only the fields an operator cares
//! about still loads. A few values can be overridden from the environment.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default Elasticsearch endpoint.
pub const DEFAULT_ELASTICSEARCH_URL: &str = "http://localhost:9200";

/// Default prefix for per-aggregate-type index names.
pub const DEFAULT_INDEX_PREFIX: &str = "outbox";

/// Upper bound on `dispatcher.retention_hours` (100 years).
const MAX_RETENTION_HOURS: u64 = 100 * 365 * 24;

const ENV_LOG_LEVEL: &str = "OUTBOX_RELAY_LOG_LEVEL";
const ENV_ELASTICSEARCH_URL: &str = "OUTBOX_RELAY_ELASTICSEARCH_URL";
const ENV_DATABASE_PATH: &str = "OUTBOX_RELAY_DATABASE_PATH";

/// Main relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Outbox database file. Defaults to `<base>/outbox.sqlite`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub elasticsearch: ElasticsearchSettings,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

/// Polling, claiming, and worker-pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Maximum events claimed per cycle.
    pub batch_size: usize,
    /// Sleep between cycles that did not fill a batch.
    pub poll_interval_ms: u64,
    /// Random extra sleep added to each poll (0..=poll_jitter_ms).
    pub poll_jitter_ms: u64,
    /// Maximum aggregates applied concurrently.
    pub worker_pool_size: usize,
    /// Claims older than this are returned to pending by the sweep.
    pub claim_liveness_timeout_secs: u64,
    /// How often the liveness sweep and retention purge run.
    pub sweep_interval_secs: u64,
    /// Per-event timeout around the index write.
    pub apply_timeout_secs: u64,
    /// Only claim events of this aggregate type.
    pub partition: Option<String>,
    /// Backoff when the outbox store itself is unreachable.
    pub infra_backoff_base_ms: u64,
    pub infra_backoff_max_ms: u64,
    /// Dispatched rows older than this are purged. 0 disables the purge.
    pub retention_hours: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 3_000,
            poll_jitter_ms: 250,
            worker_pool_size: 8,
            claim_liveness_timeout_secs: 300,
            sweep_interval_secs: 30,
            apply_timeout_secs: 10,
            partition: None,
            infra_backoff_base_ms: 1_000,
            infra_backoff_max_ms: 60_000,
            retention_hours: 72,
        }
    }
}

/// Per-event retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Fraction of the delay added as random jitter (0.0..=1.0).
    pub jitter_ratio: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            jitter_ratio: 0.2,
        }
    }
}

/// Elasticsearch connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticsearchSettings {
    pub url: String,
    pub index_prefix: String,
    pub request_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for ElasticsearchSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_ELASTICSEARCH_URL.to_string(),
            index_prefix: DEFAULT_INDEX_PREFIX.to_string(),
            request_timeout_secs: 5,
            username: None,
            password: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            database_path: None,
            dispatcher: DispatcherSettings::default(),
            retry: RetrySettings::default(),
            elasticsearch: ElasticsearchSettings::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from `paths`, falling back to defaults, then apply
    /// environment overrides and validate.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a key lookup (the process environment in production).
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(level) = non_empty(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
        if let Some(url) = non_empty(ENV_ELASTICSEARCH_URL) {
            self.elasticsearch.url = url;
        }
        if let Some(path) = non_empty(ENV_DATABASE_PATH) {
            self.database_path = Some(PathBuf::from(path));
        }
    }

    /// Reject settings that would stall or misbehave at runtime.
    pub fn validate(&self) -> CoreResult<()> {
        let d = &self.dispatcher;
        if d.batch_size == 0 {
            return Err(CoreError::Config("dispatcher.batch_size must be > 0".into()));
        }
        if d.worker_pool_size == 0 {
            return Err(CoreError::Config(
                "dispatcher.worker_pool_size must be > 0".into(),
            ));
        }
        if d.apply_timeout_secs == 0 {
            return Err(CoreError::Config(
                "dispatcher.apply_timeout_secs must be > 0".into(),
            ));
        }
        if d.claim_liveness_timeout_secs <= d.apply_timeout_secs {
            return Err(CoreError::Config(
                "dispatcher.claim_liveness_timeout_secs must exceed apply_timeout_secs".into(),
            ));
        }
        if d.retention_hours > MAX_RETENTION_HOURS {
            return Err(CoreError::Config(format!(
                "dispatcher.retention_hours must not exceed {MAX_RETENTION_HOURS}"
            )));
        }

        let r = &self.retry;
        if !(0.0..=1.0).contains(&r.jitter_ratio) {
            return Err(CoreError::Config(
                "retry.jitter_ratio must be within 0.0..=1.0".into(),
            ));
        }
        if r.backoff_base_ms > r.backoff_max_ms {
            return Err(CoreError::Config(
                "retry.backoff_base_ms must not exceed retry.backoff_max_ms".into(),
            ));
        }

        self.elasticsearch_url()?;
        Ok(())
    }

    /// Resolve the outbox database path.
    pub fn database_path(&self, paths: &Paths) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }

    /// Get the Elasticsearch URL as a parsed URL.
    pub fn elasticsearch_url(&self) -> CoreResult<Url> {
        Url::parse(&self.elasticsearch.url).map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.dispatcher.batch_size, 100);
        assert_eq!(config.dispatcher.poll_interval_ms, 3_000);
        assert_eq!(config.dispatcher.claim_liveness_timeout_secs, 300);
        assert_eq!(config.retry.max_retries, 10);
        assert_eq!(config.retry.backoff_max_ms, 300_000);
        assert_eq!(config.elasticsearch.url, DEFAULT_ELASTICSEARCH_URL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_section_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "dispatcher": { "batch_size": 25, "partition": "job" },
            "retry": { "max_retries": 3 }
        }"#;
        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.dispatcher.batch_size, 25);
        assert_eq!(config.dispatcher.partition.as_deref(), Some("job"));
        assert_eq!(config.dispatcher.worker_pool_size, 8);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.backoff_base_ms, 1_000);
        assert_eq!(config.elasticsearch, ElasticsearchSettings::default());
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.dispatcher.batch_size = 7;
        config.elasticsearch.index_prefix = "breakin-dev".to_string();
        config.save(&paths).unwrap();

        let loaded = Config::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded.dispatcher.batch_size, 7);
        assert_eq!(loaded.elasticsearch.index_prefix, "breakin-dev");
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.dispatcher, DispatcherSettings::default());
    }

    #[test]
    fn test_overrides_apply_non_empty_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_LOG_LEVEL, "trace"),
            (ENV_ELASTICSEARCH_URL, "http://es:9200"),
            (ENV_DATABASE_PATH, "  "),
        ]);

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.log_level, "trace");
        assert_eq!(config.elasticsearch.url, "http://es:9200");
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_database_path_defaults_under_base_dir() {
        let paths = Paths::with_base_dir(PathBuf::from("/srv/relay"));
        let mut config = Config::default();
        assert_eq!(
            config.database_path(&paths),
            PathBuf::from("/srv/relay/outbox.sqlite")
        );

        config.database_path = Some(PathBuf::from("/data/app.sqlite"));
        assert_eq!(
            config.database_path(&paths),
            PathBuf::from("/data/app.sqlite")
        );
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.dispatcher.batch_size = 0;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let mut config = Config::default();
        config.retry.jitter_ratio = 1.5;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let mut config = Config::default();
        config.dispatcher.claim_liveness_timeout_secs = 5;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let mut config = Config::default();
        config.dispatcher.retention_hours = u64::MAX;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        let mut config = Config::default();
        config.elasticsearch.url = "not a valid url".to_string();
        assert!(matches!(config.validate(), Err(CoreError::InvalidUrl(_))));
    }
}
