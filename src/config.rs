use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub kube: KubeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Health server port (default: 8080)
    #[serde(default)]
    pub health_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Check interval used when a route has no interval annotation
    #[serde(default)]
    pub default_interval: Option<String>,
    /// Concurrent reconciles per controller
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// First retry delay after a failed reconcile in milliseconds
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Upper bound on retry delay in seconds
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Delay before re-reading after a version conflict in milliseconds
    #[serde(default = "default_conflict_delay_ms")]
    pub conflict_delay_ms: u64,
    /// Full re-enqueue period in seconds (0 disables resync)
    #[serde(default = "default_resync_secs")]
    pub resync_secs: u64,
    /// Restrict watches to one namespace (all namespaces when unset)
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_workers() -> usize {
    4
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    300
}

fn default_conflict_delay_ms() -> u64 {
    100
}

fn default_resync_secs() -> u64 {
    600
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_interval: None,
            workers: default_workers(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            conflict_delay_ms: default_conflict_delay_ms(),
            resync_secs: default_resync_secs(),
            namespace: None,
        }
    }
}

impl ControllerConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn conflict_delay(&self) -> Duration {
        Duration::from_millis(self.conflict_delay_ms)
    }

    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Base URL of the monitoring service API
    pub base_url: String,
    /// Bearer token (prefer ROUTEWATCH_MONITORING__API_TOKEN)
    #[serde(default)]
    pub api_token: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
    /// Retry count sent with every check
    #[serde(default)]
    pub retry_count: i32,
    /// Log calls instead of sending them
    #[serde(default)]
    pub dry_run: bool,
}

fn default_request_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct KubeConfig {
    /// API server URL
    #[serde(default = "default_kube_api_url")]
    pub api_url: String,
    /// Service account token file
    #[serde(default = "default_token_file")]
    pub token_file: String,
    /// Cluster CA bundle; system roots are used when the file is absent
    #[serde(default = "default_ca_file")]
    pub ca_file: String,
    /// Per-request timeout in seconds (watches are exempt)
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_kube_api_url() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_token_file() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}

fn default_ca_file() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".to_string()
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            api_url: default_kube_api_url(),
            token_file: default_token_file(),
            ca_file: default_ca_file(),
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("monitoring.timeout_secs", 10)?
            .set_default("controller.workers", 4)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("ROUTEWATCH_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (ROUTEWATCH_MONITORING__BASE_URL, etc.)
            .add_source(
                Environment::with_prefix("ROUTEWATCH")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Default interval with empty strings treated as unset
    pub fn default_interval(&self) -> Option<&str> {
        self.controller
            .default_interval
            .as_deref()
            .filter(|v| !v.is_empty())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Some(interval) = self.default_interval() {
            match interval.parse::<u64>() {
                Ok(secs) if secs > 0 => {}
                _ => errors.push(format!(
                    "controller.default_interval must be a positive integer, got '{}'",
                    interval
                )),
            }
        }

        if self.controller.workers == 0 {
            errors.push("controller.workers must be at least 1".to_string());
        }

        if self.controller.base_backoff_ms == 0 {
            errors.push("controller.base_backoff_ms must be positive".to_string());
        }

        if self.controller.max_backoff() < self.controller.base_backoff() {
            errors.push("controller.max_backoff_secs must not be below base_backoff_ms".to_string());
        }

        if url::Url::parse(&self.monitoring.base_url).is_err() {
            errors.push(format!(
                "monitoring.base_url is not a valid URL: '{}'",
                self.monitoring.base_url
            ));
        }

        if self.monitoring.retry_count < 0 {
            errors.push("monitoring.retry_count must not be negative".to_string());
        }

        if !self.monitoring.dry_run && self.monitoring.api_token.is_none() {
            errors.push("monitoring.api_token is required unless monitoring.dry_run is set".to_string());
        }

        if url::Url::parse(&self.kube.api_url).is_err() {
            errors.push(format!("kube.api_url is not a valid URL: '{}'", self.kube.api_url));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
