use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::models::{LeftoverPolicy, RoundConfig, ScoringWeights};
use crate::rounds::OrchestratorOptions;

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub deployment: DeploymentSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub lease: LeaseSettings,
    #[serde(default)]
    pub notifier: NotifierSettings,
    #[serde(default)]
    pub matching: MatchingSettings,
    #[serde(default)]
    pub scoring: ScoringSettings,
    #[serde(default)]
    pub round: RoundSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentSettings {
    pub id: String,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// Empty runs against the in-memory store
    #[serde(default)]
    pub url: String,
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub acquire_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: Some(10),
            min_connections: Some(1),
            acquire_timeout_secs: Some(5),
            idle_timeout_secs: Some(600),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseSettings {
    /// Without Redis the lock only excludes runs inside this process
    pub redis_url: Option<String>,
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_lock_key_prefix")]
    pub key_prefix: String,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl_secs: default_lease_ttl_secs(),
            key_prefix: default_lock_key_prefix(),
        }
    }
}

fn default_lease_ttl_secs() -> u64 { 300 }
fn default_lock_key_prefix() -> String { "coffee-match:round-lock".to_string() }

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierSettings {
    pub webhook_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            api_key: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

fn default_notify_timeout_secs() -> u64 { 10 }

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingSettings {
    #[serde(default = "default_group_size")]
    pub group_size: usize,
    #[serde(default = "default_lookback_window")]
    pub lookback_window: u64,
    #[serde(default = "default_max_relaxation_steps")]
    pub max_relaxation_steps: u32,
    #[serde(default)]
    pub leftover_policy: LeftoverPolicy,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            group_size: default_group_size(),
            lookback_window: default_lookback_window(),
            max_relaxation_steps: default_max_relaxation_steps(),
            leftover_policy: LeftoverPolicy::default(),
        }
    }
}

fn default_group_size() -> usize { 2 }
fn default_lookback_window() -> u64 { 4 }
fn default_max_relaxation_steps() -> u32 { 3 }

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScoringSettings {
    #[serde(default)]
    pub weights: WeightsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeightsConfig {
    #[serde(default = "default_topic_weight")]
    pub topic: f64,
    #[serde(default = "default_availability_weight")]
    pub availability: f64,
    #[serde(default = "default_length_weight")]
    pub length: f64,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            topic: default_topic_weight(),
            availability: default_availability_weight(),
            length: default_length_weight(),
        }
    }
}

fn default_topic_weight() -> f64 { 0.40 }
fn default_availability_weight() -> f64 { 0.40 }
fn default_length_weight() -> f64 { 0.20 }

#[derive(Debug, Clone, Deserialize)]
pub struct RoundSettings {
    #[serde(default = "default_round_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_persistence_max_attempts")]
    pub persistence_max_attempts: u32,
    #[serde(default = "default_persistence_backoff_ms")]
    pub persistence_backoff_ms: u64,
    /// Defaults to the number of available cores
    pub score_workers: Option<usize>,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_round_timeout_secs(),
            persistence_max_attempts: default_persistence_max_attempts(),
            persistence_backoff_ms: default_persistence_backoff_ms(),
            score_workers: None,
        }
    }
}

fn default_round_timeout_secs() -> u64 { 120 }
fn default_persistence_max_attempts() -> u32 { 3 }
fn default_persistence_backoff_ms() -> u64 { 200 }

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }

impl Settings {
    /// Load configuration from file and environment variables
    ///
    /// Configuration is loaded in the following order (later overrides earlier):
    /// 1. Default values in the struct
    /// 2. Configuration files (config/default.toml, config/local.toml)
    /// 3. Environment variables (prefixed with COFFEE__)
    /// 4. DATABASE_URL and REDIS_URL
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // e.g. COFFEE__MATCHING__GROUP_SIZE -> matching.group_size
            .add_source(
                Environment::with_prefix("COFFEE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings = apply_url_overrides(settings)?;

        let settings: Self = settings.try_deserialize()?;
        settings.check()?;
        Ok(settings)
    }

    /// Load configuration from a custom path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("COFFEE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = settings.try_deserialize()?;
        settings.check()?;
        Ok(settings)
    }

    /// Cross-section constraints that serde defaults cannot express
    pub fn check(&self) -> Result<(), ConfigError> {
        // A round must finish inside its lease
        if self.lease.ttl_secs <= self.round.timeout_secs {
            return Err(ConfigError::Message(format!(
                "lease.ttl_secs ({}) must be greater than round.timeout_secs ({})",
                self.lease.ttl_secs, self.round.timeout_secs
            )));
        }
        Ok(())
    }

    /// Matching parameters for one round; built fresh on every call
    pub fn round_config(&self) -> RoundConfig {
        RoundConfig {
            group_size: self.matching.group_size,
            lookback_window: self.matching.lookback_window,
            weights: ScoringWeights {
                topic: self.scoring.weights.topic,
                availability: self.scoring.weights.availability,
                length: self.scoring.weights.length,
            },
            max_relaxation_steps: self.matching.max_relaxation_steps,
            leftover_policy: self.matching.leftover_policy,
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        let defaults = OrchestratorOptions::default();
        OrchestratorOptions {
            round_timeout: Duration::from_secs(self.round.timeout_secs),
            lease_ttl: Duration::from_secs(self.lease.ttl_secs),
            persistence_max_attempts: self.round.persistence_max_attempts,
            persistence_backoff: Duration::from_millis(self.round.persistence_backoff_ms),
            score_workers: self.round.score_workers.unwrap_or(defaults.score_workers),
            notify_timeout: Duration::from_secs(self.notifier.timeout_secs),
            lock_key_prefix: self.lease.key_prefix.clone(),
        }
    }
}

/// Let the conventional DATABASE_URL / REDIS_URL variables win over files
fn apply_url_overrides(settings: Config) -> Result<Config, ConfigError> {
    use std::env;

    let mut builder = Config::builder().add_source(settings);

    if let Ok(database_url) = env::var("DATABASE_URL") {
        builder = builder.set_override("database.url", database_url)?;
    }
    if let Ok(redis_url) = env::var("REDIS_URL") {
        builder = builder.set_override("lease.redis_url", redis_url)?;
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use validator::Validate;

    fn parse(toml: &str) -> Settings {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_weights() {
        let weights = WeightsConfig::default();
        assert_eq!(weights.topic, 0.40);
        assert_eq!(weights.availability, 0.40);
        assert_eq!(weights.length, 0.20);
    }

    #[test]
    fn test_default_logging() {
        let level = default_log_level();
        let format = default_log_format();
        assert_eq!(level, "info");
        assert_eq!(format, "json");
    }

    #[test]
    fn test_empty_file_gives_valid_round_config() {
        let settings = parse("");
        let config = settings.round_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.group_size, 2);
        assert_eq!(settings.deployment.id, "default");
    }

    #[test]
    fn test_sections_override_defaults() {
        let settings = parse(
            r#"
            [deployment]
            id = "acme"

            [matching]
            group_size = 3
            lookback_window = 2
            leftover_policy = "carry_forward"

            [scoring.weights]
            topic = 0.5
            availability = 0.3
            length = 0.2

            [round]
            persistence_max_attempts = 5
            score_workers = 2
            "#,
        );

        let config = settings.round_config();
        assert_eq!(config.group_size, 3);
        assert_eq!(config.lookback_window, 2);
        assert_eq!(config.leftover_policy, LeftoverPolicy::CarryForward);
        assert_eq!(config.weights.topic, 0.5);

        let options = settings.orchestrator_options();
        assert_eq!(options.persistence_max_attempts, 5);
        assert_eq!(options.score_workers, 2);
        assert_eq!(options.lock_key_prefix, "coffee-match:round-lock");
    }

    #[test]
    fn test_defaults_pass_check() {
        assert!(parse("").check().is_ok());
    }

    #[test]
    fn test_lease_shorter_than_round_rejected() {
        let settings = parse(
            r#"
            [lease]
            ttl_secs = 60

            [round]
            timeout_secs = 120
            "#,
        );

        let err = settings.check().unwrap_err();
        assert!(err.to_string().contains("lease.ttl_secs"));

        let equal = parse(
            r#"
            [lease]
            ttl_secs = 120

            [round]
            timeout_secs = 120
            "#,
        );
        assert!(equal.check().is_err());
    }
}
