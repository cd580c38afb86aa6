//! Engine configuration that downstream crates can serialize/deserialize.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hard limits the policy engine checks requested caps against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyLimits {
    pub max_workers: usize,
    pub max_time_s: u64,
    pub max_mem_mb: u64,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            max_workers: 64,
            max_time_s: 3_600,
            max_mem_mb: 8_192,
        }
    }
}

/// Cost model used for the compile-time estimate and the default cost meter.
///
/// Weights are keyed by operator name; anything unlisted costs `default_weight`
/// per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub default_weight: f64,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            default_weight: 1.0,
            weights: BTreeMap::new(),
        }
    }
}

impl CostModel {
    pub fn weight_for(&self, operator: &str) -> f64 {
        self.weights
            .get(operator)
            .copied()
            .unwrap_or(self.default_weight)
    }
}

/// Named sandbox profile: where the provider lives and what a sandbox may use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxProfile {
    /// Provider endpoint; the only egress destination allowlisted for the job.
    pub endpoint: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub time_s: Option<u64>,
    #[serde(default)]
    pub mem_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrency cap for the Map phase. Backends never exceed this.
    pub max_workers: usize,

    /// Per-attempt timeout for a Map shard.
    pub shard_timeout_ms: u64,

    /// Retry policy for retryable shard failures.
    pub retry_max_retries: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_multiplier: f64,
    pub retry_jitter_factor: f64,

    /// Budget cap in cost units and the kill multiplier applied to it.
    pub budget_cap: f64,
    pub kill_threshold: f64,

    pub limits: PolicyLimits,
    pub cost_model: CostModel,

    /// Directory for the artifact store (legacy local-path configuration).
    pub store_dir: String,
    /// Optional store URI (`file:///path` or `memory://`).
    pub store_uri: Option<String>,

    /// Root for Produce output directories.
    pub outputs_dir: String,

    /// Skip Map shards whose output is already in the store.
    pub shard_cache: bool,

    pub sandbox_profiles: BTreeMap<String, SandboxProfile>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            shard_timeout_ms: 300_000,
            retry_max_retries: 3,
            retry_initial_backoff_ms: 200,
            retry_max_backoff_ms: 5_000,
            retry_multiplier: 2.0,
            retry_jitter_factor: 0.2,
            budget_cap: 1_000.0,
            kill_threshold: 1.2,
            limits: PolicyLimits::default(),
            cost_model: CostModel::default(),
            store_dir: ".mrp/artifacts".to_string(),
            store_uri: None,
            outputs_dir: ".mrp/outputs".to_string(),
            shard_cache: true,
            sandbox_profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub uri: Option<String>,
    pub root: String,
}

impl StoreConfig {
    pub fn scheme(&self) -> Option<&str> {
        self.uri
            .as_deref()
            .and_then(|uri| uri.split("://").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl EngineConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `MRP_MAX_WORKERS`: Map concurrency cap
    /// - `MRP_SHARD_TIMEOUT_MS`: per-attempt timeout
    /// - `MRP_MAX_RETRIES`, `MRP_RETRY_INITIAL_MS`, `MRP_RETRY_MAX_MS`: retry policy
    /// - `MRP_BUDGET_CAP`, `MRP_KILL_THRESHOLD`: governor limits
    /// - `MRP_STORE_DIR`, `MRP_STORE_URI`: artifact store location
    /// - `MRP_OUTPUTS_DIR`: Produce output root
    /// - `MRP_SHARD_CACHE`: `true`/`false`
    /// - `MRP_SANDBOX_ENDPOINT`: registers the `default` sandbox profile
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse("MRP_MAX_WORKERS") {
            cfg.max_workers = v;
        }
        if let Some(v) = env_parse("MRP_SHARD_TIMEOUT_MS") {
            cfg.shard_timeout_ms = v;
        }
        if let Some(v) = env_parse("MRP_MAX_RETRIES") {
            cfg.retry_max_retries = v;
        }
        if let Some(v) = env_parse("MRP_RETRY_INITIAL_MS") {
            cfg.retry_initial_backoff_ms = v;
        }
        if let Some(v) = env_parse("MRP_RETRY_MAX_MS") {
            cfg.retry_max_backoff_ms = v;
        }
        if let Some(v) = env_parse("MRP_BUDGET_CAP") {
            cfg.budget_cap = v;
        }
        if let Some(v) = env_parse("MRP_KILL_THRESHOLD") {
            cfg.kill_threshold = v;
        }
        if let Ok(s) = std::env::var("MRP_STORE_DIR") {
            cfg.store_dir = s;
        }
        if let Ok(s) = std::env::var("MRP_STORE_URI") {
            cfg.store_uri = Some(s);
        }
        if let Ok(s) = std::env::var("MRP_OUTPUTS_DIR") {
            cfg.outputs_dir = s;
        }
        if let Some(v) = env_parse("MRP_SHARD_CACHE") {
            cfg.shard_cache = v;
        }
        if let Ok(endpoint) = std::env::var("MRP_SANDBOX_ENDPOINT") {
            cfg.sandbox_profiles.insert(
                "default".to_string(),
                SandboxProfile {
                    endpoint,
                    image: None,
                    workers: None,
                    time_s: None,
                    mem_mb: None,
                },
            );
        }

        cfg
    }

    /// Reject configurations that would make the governor or scheduler meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".into()));
        }
        if !(self.kill_threshold >= 1.0) {
            return Err(Error::Config(format!(
                "kill_threshold must be >= 1.0, got {}",
                self.kill_threshold
            )));
        }
        if !(self.budget_cap >= 0.0) {
            return Err(Error::Config("budget_cap must be non-negative".into()));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(Error::Config(
                "retry_jitter_factor must be within [0, 1]".into(),
            ));
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(Error::Config(
                "retry_initial_backoff_ms exceeds retry_max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Profile lookup; an absent reference falls back to the `default` profile.
    pub fn sandbox_profile(&self, reference: Option<&str>) -> Option<(&str, &SandboxProfile)> {
        let name = reference.unwrap_or("default");
        self.sandbox_profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Produce a storage configuration snapshot used by the store layer.
    pub fn store_config(&self) -> StoreConfig {
        let scheme = self
            .store_uri
            .as_deref()
            .and_then(|uri| uri.split("://").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let root = match (scheme.as_deref(), self.store_uri.as_ref()) {
            (Some("file"), Some(uri)) => {
                file_uri_to_path(uri).unwrap_or_else(|| self.store_dir.clone())
            }
            (Some(_), Some(uri)) => uri.trim_end_matches('/').to_string(),
            _ => self.store_dir.clone(),
        };

        StoreConfig {
            uri: self.store_uri.clone(),
            root,
        }
    }
}

fn file_uri_to_path(uri: &str) -> Option<String> {
    let stripped = uri.strip_prefix("file://")?;
    if stripped.starts_with('/') {
        Some(stripped.to_string())
    } else {
        Some(format!("/{}", stripped))
    }
}
