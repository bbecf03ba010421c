//! Configuration types for sefaz-dfe
//!
//! Configuration is explicit: a [`Config`] (or one of its sub-configs) is
//! passed to each component at construction time. Nothing reads endpoints or
//! credentials from process-wide state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Production endpoint of the national distribution service
pub const PRODUCTION_URL: &str =
    "https://www1.nfe.fazenda.gov.br/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx";

/// Homologation (testing) endpoint of the national distribution service
pub const HOMOLOGATION_URL: &str =
    "https://hom1.nfe.fazenda.gov.br/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx";

/// SEFAZ environment (`tpAmb`)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Real fiscal documents (`tpAmb` = 1)
    #[default]
    Production,
    /// Testing environment (`tpAmb` = 2)
    Homologation,
}

impl Environment {
    /// Value of the `tpAmb` element
    pub fn tp_amb(&self) -> u8 {
        match self {
            Environment::Production => 1,
            Environment::Homologation => 2,
        }
    }

    /// Well-known endpoint URL for this environment
    pub fn default_url(&self) -> &'static str {
        match self {
            Environment::Production => PRODUCTION_URL,
            Environment::Homologation => HOMOLOGATION_URL,
        }
    }
}

/// Remote service settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Production or homologation (default: production)
    #[serde(default)]
    pub environment: Environment,

    /// Endpoint override (None = the environment's well-known URL)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Timeout of one HTTPS round trip (default: 60 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            endpoint_url: None,
            request_timeout: default_request_timeout(),
        }
    }
}

impl ServiceConfig {
    /// Effective endpoint URL
    pub fn endpoint(&self) -> &str {
        self.endpoint_url
            .as_deref()
            .unwrap_or_else(|| self.environment.default_url())
    }
}

/// Pagination controller limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaginationConfig {
    /// Hard cap on requests per fetch (default: 100)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Pause between consecutive requests of one fetch (default: 0)
    ///
    /// Bulk historical backfills should use 1-2 seconds to stay clear of the
    /// remote rate limiter.
    #[serde(default, with = "duration_serde")]
    pub iteration_delay: Duration,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            iteration_delay: Duration::ZERO,
        }
    }
}

/// Sync orchestration settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long an identity is left alone after a rate-limited response (default: 1 hour)
    #[serde(default = "default_rate_limit_cooldown", with = "duration_serde")]
    pub rate_limit_cooldown: Duration,

    /// Maximum identities synchronized in parallel (default: 4)
    #[serde(default = "default_max_concurrent_identities")]
    pub max_concurrent_identities: usize,

    /// Re-fetch summary records by access key to obtain the full document (default: true)
    #[serde(default = "default_true")]
    pub upgrade_summaries: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rate_limit_cooldown: default_rate_limit_cooldown(),
            max_concurrent_identities: default_max_concurrent_identities(),
            upgrade_summaries: true,
        }
    }
}

/// Retry configuration for callers that retry whole syncs after transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 5 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 300 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Local persistence settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./sefaz-dfe.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Main configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote service settings
    #[serde(default)]
    pub service: ServiceConfig,

    /// Pagination limits
    #[serde(default)]
    pub pagination: PaginationConfig,

    /// Sync orchestration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Caller-side retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Local persistence
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the client unusable
    pub fn validate(&self) -> Result<()> {
        if self.pagination.max_iterations == 0 {
            return Err(config_error(
                "max_iterations must be at least 1",
                "pagination.max_iterations",
            ));
        }
        if self.sync.max_concurrent_identities == 0 {
            return Err(config_error(
                "max_concurrent_identities must be at least 1",
                "sync.max_concurrent_identities",
            ));
        }
        if self.service.request_timeout.is_zero() {
            return Err(config_error(
                "request_timeout must be greater than zero",
                "service.request_timeout",
            ));
        }
        if let Some(url) = &self.service.endpoint_url {
            url::Url::parse(url).map_err(|e| {
                config_error(
                    &format!("invalid endpoint_url {url:?}: {e}"),
                    "service.endpoint_url",
                )
            })?;
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_iterations() -> u32 {
    100
}

fn default_rate_limit_cooldown() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_concurrent_identities() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_database_path() -> PathBuf {
    PathBuf::from("sefaz-dfe.db")
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_service_contract() {
        let config = Config::default();

        assert_eq!(config.service.request_timeout, Duration::from_secs(60));
        assert_eq!(config.service.endpoint(), PRODUCTION_URL);
        assert_eq!(config.pagination.max_iterations, 100);
        assert_eq!(config.pagination.iteration_delay, Duration::ZERO);
        assert_eq!(config.sync.rate_limit_cooldown, Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_json_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.pagination.max_iterations, 100);
        assert_eq!(config.service.environment, Environment::Production);
    }

    #[test]
    fn durations_are_whole_seconds() {
        let json = r#"{"pagination": {"iteration_delay": 2}, "service": {"environment": "homologation"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.pagination.iteration_delay, Duration::from_secs(2));
        assert_eq!(config.service.endpoint(), HOMOLOGATION_URL);
        assert_eq!(config.service.environment.tp_amb(), 2);

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["pagination"]["iteration_delay"], 2);
    }

    #[test]
    fn endpoint_override_wins() {
        let service = ServiceConfig {
            endpoint_url: Some("http://127.0.0.1:9000/dist".to_string()),
            ..ServiceConfig::default()
        };
        assert_eq!(service.endpoint(), "http://127.0.0.1:9000/dist");
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let mut config = Config::default();
        config.pagination.max_iterations = 0;
        match config.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("pagination.max_iterations"))
            }
            other => panic!("expected config error, got {other:?}"),
        }

        let mut config = Config::default();
        config.service.endpoint_url = Some("not a url".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sync.max_concurrent_identities = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_json_file_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"pagination": {"max_iterations": 5}}"#).unwrap();

        let config = Config::from_json_file(&path).unwrap();
        assert_eq!(config.pagination.max_iterations, 5);

        std::fs::write(&path, r#"{"pagination": {"max_iterations": 0}}"#).unwrap();
        assert!(Config::from_json_file(&path).is_err());
    }
}
