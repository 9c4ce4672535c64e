//! Configuration for the ingress manager
//!
//! Defaults reproduce the fixed behavior of the controller: marker
//! `ingress/http`, host `codehorse.com`, path `/`, port 80, five workers and
//! ten retries per key.

use crate::error::ControllerError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Annotation whose presence on a Service requests an Ingress
    #[serde(default = "default_marker_annotation")]
    pub marker_annotation: String,

    /// Namespace to watch (all namespaces when unset)
    #[serde(default)]
    pub watch_namespace: Option<String>,

    /// Shape of the generated Ingress
    #[serde(default)]
    pub ingress: IngressTemplate,

    /// Work queue and worker pool
    #[serde(default)]
    pub queue: QueueConfig,

    /// Bind address for /metrics, /healthz and /readyz
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

/// Fixed parts of every generated Ingress
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IngressTemplate {
    /// External hostname of the single rule (default: codehorse.com)
    #[serde(default = "default_host")]
    pub host: String,

    /// Path prefix of the single path rule (default: /)
    #[serde(default = "default_path")]
    pub path: String,

    /// Backend Service port (default: 80)
    #[serde(default = "default_port")]
    pub port: i32,

    /// IngressClass handling the generated objects (default: nginx)
    #[serde(default = "default_ingress_class_name")]
    pub ingress_class_name: Option<String>,
}

fn default_host() -> String {
    "codehorse.com".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_port() -> i32 {
    80
}

fn default_ingress_class_name() -> Option<String> {
    Some("nginx".to_string())
}

impl Default for IngressTemplate {
    fn default() -> Self {
        Self {
            host: default_host(),
            path: default_path(),
            port: default_port(),
            ingress_class_name: default_ingress_class_name(),
        }
    }
}

/// Work queue configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Number of parallel reconcile workers (default: 5)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Rate-limited requeues allowed per key before it is dropped (default: 10)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay in milliseconds, doubled per failure (default: 5ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound of the per-key delay in seconds (default: 1000s)
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Overall requeue rate in keys per second (default: 10)
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Overall requeue burst (default: 100)
    #[serde(default = "default_burst")]
    pub burst: u64,
}

fn default_workers() -> usize {
    5
}

fn default_max_retries() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    1000
}

fn default_qps() -> f64 {
    10.0
}

fn default_burst() -> u64 {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl QueueConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

fn default_marker_annotation() -> String {
    "ingress/http".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            marker_annotation: default_marker_annotation(),
            watch_namespace: None,
            ingress: IngressTemplate::default(),
            queue: QueueConfig::default(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::default().with_env_overrides()
    }

    /// Load configuration from a TOML file
    ///
    /// Missing fields fall back to their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ControllerError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents).map_err(|e| {
            ControllerError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, ControllerError> {
        toml::from_str(contents).map_err(|e| ControllerError::Config(e.to_string()))
    }

    /// Apply `INGRESS_MANAGER_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self, ControllerError> {
        if let Ok(val) = env::var("INGRESS_MANAGER_MARKER_ANNOTATION") {
            self.marker_annotation = val;
        }

        if let Ok(val) = env::var("INGRESS_MANAGER_NAMESPACE") {
            self.watch_namespace = Some(val).filter(|ns| !ns.is_empty());
        }

        if let Ok(val) = env::var("INGRESS_MANAGER_HOST") {
            self.ingress.host = val;
        }

        if let Ok(val) = env::var("INGRESS_MANAGER_PORT") {
            self.ingress.port = parse_env("INGRESS_MANAGER_PORT", &val)?;
        }

        if let Ok(val) = env::var("INGRESS_MANAGER_INGRESS_CLASS") {
            self.ingress.ingress_class_name = Some(val).filter(|c| !c.is_empty());
        }

        if let Ok(val) = env::var("INGRESS_MANAGER_WORKERS") {
            self.queue.workers = parse_env("INGRESS_MANAGER_WORKERS", &val)?;
        }

        if let Ok(val) = env::var("INGRESS_MANAGER_MAX_RETRIES") {
            self.queue.max_retries = parse_env("INGRESS_MANAGER_MAX_RETRIES", &val)?;
        }

        if let Ok(val) = env::var("INGRESS_MANAGER_METRICS_ADDR") {
            self.metrics_addr = val;
        }

        Ok(self)
    }

    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.marker_annotation.is_empty() {
            return Err(ControllerError::Config(
                "marker_annotation cannot be empty".to_string(),
            ));
        }

        if self.ingress.host.is_empty() {
            return Err(ControllerError::Config(
                "ingress.host cannot be empty".to_string(),
            ));
        }

        if !self.ingress.path.starts_with('/') {
            return Err(ControllerError::Config(format!(
                "ingress.path '{}' must start with '/'",
                self.ingress.path
            )));
        }

        if !(1..=65535).contains(&self.ingress.port) {
            return Err(ControllerError::Config(format!(
                "ingress.port {} is out of range",
                self.ingress.port
            )));
        }

        if self.queue.workers == 0 {
            return Err(ControllerError::Config(
                "queue.workers must be at least 1".to_string(),
            ));
        }

        if self.queue.qps <= 0.0 {
            return Err(ControllerError::Config(
                "queue.qps must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, val: &str) -> Result<T, ControllerError>
where
    T::Err: std::fmt::Display,
{
    val.parse()
        .map_err(|e| ControllerError::Config(format!("Invalid {}={:?}: {}", name, val, e)))
}
