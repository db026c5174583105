//! Bus configuration: YAML document describing resiliency policies,
//! resources, pipelines, operation namespaces and error templates.
//!
//! `${VAR}` references are substituted from the environment before the
//! document is parsed.

pub mod duration;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use relaybus_core::{ErrorCode, Expr, OperationSchema, Value};
use serde::Deserialize;

pub use duration::HumanDuration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("missing environment variable(s): {}", .0.join(", "))]
    MissingEnv(Vec<String>),
    #[error("failed to parse bus configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid duration {input:?}: {reason}")]
    Duration { input: String, reason: String },
}

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

/// Operation name -> pipeline.
pub type Operations = BTreeMap<String, PipelineConfig>;

/// Interface name -> operations.
pub type Namespaces = BTreeMap<String, Operations>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub resiliency: ResiliencyConfig,
    #[serde(default)]
    pub resources: BTreeMap<String, ComponentConfig>,
    /// Compute modules linked into the mesh, in order.
    #[serde(default)]
    pub compute: Vec<ComponentConfig>,
    /// Named pipelines reachable through `call_pipeline`.
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineConfig>,
    /// Operations exposed to callers.
    #[serde(default)]
    pub interfaces: Namespaces,
    /// Operations used internally and by compute modules.
    #[serde(default)]
    pub providers: Namespaces,
    /// Input schemas per interface operation.
    #[serde(default)]
    pub schemas: BTreeMap<String, BTreeMap<String, OperationSchema>>,
    #[serde(default)]
    pub errors: BTreeMap<String, ErrorTemplate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResiliencyConfig {
    #[serde(default)]
    pub timeouts: BTreeMap<String, HumanDuration>,
    #[serde(default)]
    pub retries: BTreeMap<String, RetryConfig>,
    #[serde(default)]
    pub circuit_breakers: BTreeMap<String, CircuitBreakerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    #[default]
    Constant,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub policy: BackoffPolicy,
    /// Constant backoff interval.
    #[serde(deserialize_with = "duration::deserialize")]
    pub duration: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub initial_interval: Duration,
    pub randomization_factor: f64,
    pub multiplier: f64,
    #[serde(deserialize_with = "duration::deserialize")]
    pub max_interval: Duration,
    /// Zero means no elapsed-time limit.
    #[serde(deserialize_with = "duration::deserialize")]
    pub max_elapsed_time: Duration,
    /// Negative means unbounded (limited only by `max_elapsed_time`).
    pub max_retries: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: BackoffPolicy::Constant,
            duration: Duration::from_secs(5),
            initial_interval: Duration::from_millis(500),
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Duration::from_secs(15 * 60),
            max_retries: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Calls allowed through while half-open.
    pub max_requests: u32,
    /// Cyclic period for clearing counts while closed. Zero never clears.
    #[serde(deserialize_with = "duration::deserialize")]
    pub interval: Duration,
    /// How long the breaker stays open before probing.
    #[serde(deserialize_with = "duration::deserialize")]
    pub timeout: Duration,
    /// Trip condition over `requests`, `totalSuccesses`, `totalFailures`,
    /// `consecutiveSuccesses` and `consecutiveFailures`.
    pub trip: Expr,
}

/// Default trip condition.
static DEFAULT_TRIP: LazyLock<Expr> =
    LazyLock::new(|| Expr::compile("consecutiveFailures > 5").expect("valid default trip expression"));

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 1,
            interval: Duration::ZERO,
            timeout: Duration::from_secs(60),
            trip: DEFAULT_TRIP.clone(),
        }
    }
}

/// `{uses, with}` declaration of a resource.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentConfig {
    pub uses: String,
    #[serde(default)]
    pub with: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub uses: String,
    #[serde(default)]
    pub with: Value,
    #[serde(default)]
    pub returns: Option<String>,
    /// Name of a timeout policy, or a literal duration.
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub retry: Option<String>,
    #[serde(default)]
    pub circuit_breaker: Option<String>,
    #[serde(default)]
    pub on_error: Option<PipelineConfig>,
}

/// Configured rendering of a domain error.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorTemplate {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<ErrorCode>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub help: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitutes `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns [`ConfigError::MissingEnv`] naming every referenced variable
/// that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            missing.push(cap[1].to_string());
            String::new()
        })
    });
    if !missing.is_empty() {
        missing.dedup();
        return Err(ConfigError::MissingEnv(missing));
    }
    Ok(result.into_owned())
}

impl BusConfig {
    /// Parses a YAML document after environment substitution.
    ///
    /// # Errors
    ///
    /// Returns an error if substitution fails or the YAML is invalid.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(yaml)?;
        Ok(serde_yaml::from_str(&substituted)?)
    }

    /// Reads and parses a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }
}
