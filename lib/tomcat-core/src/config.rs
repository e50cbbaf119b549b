//! Operator configuration from `TOMCAT_OPERATOR_*` environment variables

use crate::{CoreError, EngineConfig, ExponentialBackoff, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const PREFIX: &str = "TOMCAT_OPERATOR_";

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(CoreError::InvalidConfiguration(format!(
                "unknown log format {:?}",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Only watch this namespace; all namespaces when unset
    pub namespace: Option<String>,
    /// Image repository the Tomcat version is appended to
    pub base_image: String,
    /// Directory holding `deployment.yaml` and `service.yaml`; embedded
    /// templates when unset
    pub template_dir: Option<PathBuf>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub log_format: LogFormat,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            namespace: None,
            base_image: "tomcat".to_string(),
            template_dir: None,
            workers: engine.workers,
            queue_capacity: engine.queue_capacity,
            backoff_initial: engine.backoff.initial,
            backoff_max: engine.backoff.max,
            log_format: LogFormat::Text,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through a variable lookup function
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(&format!("{}{}", PREFIX, name)).filter(|v| !v.trim().is_empty())
        };
        let defaults = Self::default();

        let config = Self {
            namespace: var("NAMESPACE"),
            base_image: var("BASE_IMAGE").unwrap_or(defaults.base_image),
            template_dir: var("TEMPLATE_DIR").map(PathBuf::from),
            workers: parse(var("WORKERS"), "WORKERS")?.unwrap_or(defaults.workers),
            queue_capacity: parse(var("QUEUE_CAPACITY"), "QUEUE_CAPACITY")?
                .unwrap_or(defaults.queue_capacity),
            backoff_initial: parse(var("BACKOFF_INITIAL_MS"), "BACKOFF_INITIAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_initial),
            backoff_max: parse(var("BACKOFF_MAX_MS"), "BACKOFF_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
            log_format: var("LOG_FORMAT")
                .map(|v| v.parse::<LogFormat>())
                .transpose()?
                .unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(CoreError::InvalidConfiguration(format!(
                "{}WORKERS must be at least 1",
                PREFIX
            )));
        }
        if self.queue_capacity == 0 {
            return Err(CoreError::InvalidConfiguration(format!(
                "{}QUEUE_CAPACITY must be at least 1",
                PREFIX
            )));
        }
        if self.backoff_initial > self.backoff_max {
            return Err(CoreError::InvalidConfiguration(format!(
                "{}BACKOFF_INITIAL_MS exceeds {}BACKOFF_MAX_MS",
                PREFIX, PREFIX
            )));
        }
        Ok(())
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            backoff: ExponentialBackoff::new(self.backoff_initial, self.backoff_max),
        }
    }
}

fn parse<T: FromStr>(value: Option<String>, name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.trim().parse::<T>().map_err(|e| {
                CoreError::InvalidConfiguration(format!("{}{}={:?}: {}", PREFIX, name, v, e))
            })
        })
        .transpose()
}
