//! Process configuration (spec.md §6, SPEC_FULL.md §4.7).
//!
//! Loaded once from the environment (with an optional `.env` overlay for
//! local development) and clamped against the ranges spec.md §3 documents.
//! A value that is structurally invalid (e.g. a zero queue size) fails
//! process startup rather than silently substituting a default.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

fn default_port() -> u16 {
    8080
}
fn default_worker_base_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_chat_base_url() -> String {
    "http://localhost:8001/v1".to_string()
}
fn default_outbound_channel_capacity() -> usize {
    64
}
fn default_batch_window_sec() -> f64 {
    5.0
}
fn default_max_batch_window_sec() -> f64 {
    10.0
}
fn default_max_buffer_sec() -> f64 {
    10.0
}
fn default_insight_min_tokens() -> usize {
    10
}
fn default_insight_min_interval_sec() -> u64 {
    10
}
fn default_insight_retain_tokens() -> usize {
    60
}
fn default_insight_worker_concurrency() -> usize {
    32
}
fn default_insight_queue_maxsize() -> usize {
    256
}
fn default_insight_flush_timeout_sec() -> u64 {
    60
}
fn default_insight_per_tenant_max() -> usize {
    5
}
fn default_llm_routing_thresholds() -> String {
    "2000,8000,32000".to_string()
}
fn default_worker_retries() -> usize {
    2
}
fn default_worker_backoff_base_ms() -> u64 {
    250
}

/// Raw environment shape; `GatewayConfig::load` turns this into the
/// validated, clamped form the rest of the workspace consumes.
#[derive(Debug, Deserialize)]
struct RawEnv {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_worker_base_url")]
    worker_base_url: String,
    #[serde(default)]
    worker_api_key: Option<String>,
    #[serde(default = "default_chat_base_url")]
    chat_base_url: String,
    #[serde(default)]
    chat_api_key: Option<String>,
    #[serde(default)]
    bearer_token: Option<String>,
    #[serde(default = "default_outbound_channel_capacity")]
    outbound_channel_capacity: usize,

    #[serde(default = "default_batch_window_sec")]
    batch_window_sec: f64,
    #[serde(default = "default_max_batch_window_sec")]
    max_batch_window_sec: f64,
    #[serde(default = "default_max_buffer_sec")]
    max_buffer_sec: f64,

    #[serde(default = "default_insight_min_tokens")]
    insight_min_tokens: usize,
    #[serde(default = "default_insight_min_interval_sec")]
    insight_min_interval_sec: u64,
    #[serde(default = "default_insight_retain_tokens")]
    insight_retain_tokens: usize,
    #[serde(default = "default_insight_worker_concurrency")]
    insight_worker_concurrency: usize,
    #[serde(default = "default_insight_queue_maxsize")]
    insight_queue_maxsize: usize,
    #[serde(default = "default_insight_flush_timeout_sec")]
    insight_flush_timeout_sec: u64,
    #[serde(default = "default_insight_per_tenant_max")]
    insight_per_tenant_max: usize,

    #[serde(default = "default_llm_routing_thresholds")]
    llm_routing_thresholds: String,

    #[serde(default = "default_worker_retries")]
    worker_retries: usize,
    #[serde(default = "default_worker_backoff_base_ms")]
    worker_backoff_base_ms: u64,
}

/// Fast/balanced/high-context prompt-token thresholds (spec.md §4.4, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingThresholds {
    pub fast_ceiling: u32,
    pub balanced_ceiling: u32,
    pub max_context: u32,
}

impl Default for RoutingThresholds {
    fn default() -> Self {
        Self {
            fast_ceiling: 2_000,
            balanced_ceiling: 8_000,
            max_context: 32_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),
    #[error("invalid LLM_ROUTING_THRESHOLDS {0:?}: expected \"fast,balanced,max\"")]
    InvalidRoutingThresholds(String),
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },
}

/// Validated, clamped process configuration (SPEC_FULL.md §4.7).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub worker_base_url: String,
    pub worker_api_key: Option<String>,
    pub chat_base_url: String,
    pub chat_api_key: Option<String>,
    pub bearer_token: Option<String>,
    pub outbound_channel_capacity: usize,

    pub batch_window_sec: f64,
    pub max_batch_window_sec: f64,
    pub max_buffer_sec: f64,

    pub insight_min_tokens: usize,
    pub insight_min_interval: Duration,
    pub insight_retain_tokens: usize,
    pub insight_worker_concurrency: usize,
    pub insight_queue_maxsize: usize,
    pub insight_flush_timeout: Duration,
    pub insight_per_tenant_max: usize,

    pub routing_thresholds: RoutingThresholds,

    pub worker_retries: usize,
    pub worker_backoff_base_ms: u64,
}

impl GatewayConfig {
    /// Load `.env`/`.env.local` (if present) then the process environment,
    /// clamping every range spec.md §3 documents.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::dotenv();
        let raw: RawEnv = envy::from_env()?;
        Self::from_raw(raw)
    }

    /// Load from an explicit directory's `.env`, used by `apps/sig-server`
    /// when the working directory isn't the crate root (e.g. tests).
    pub fn load_from(dir: &Path) -> Result<Self, ConfigError> {
        let _ = dotenvy::from_path(dir.join(".env"));
        let raw: RawEnv = envy::from_env()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawEnv) -> Result<Self, ConfigError> {
        if raw.insight_queue_maxsize == 0 {
            return Err(ConfigError::MustBePositive {
                field: "INSIGHT_QUEUE_MAXSIZE",
            });
        }
        if raw.insight_worker_concurrency == 0 {
            return Err(ConfigError::MustBePositive {
                field: "INSIGHT_WORKER_CONCURRENCY",
            });
        }
        if raw.outbound_channel_capacity == 0 {
            return Err(ConfigError::MustBePositive {
                field: "OUTBOUND_CHANNEL_CAPACITY",
            });
        }

        let batch_window_sec = raw.batch_window_sec.clamp(0.5, 15.0);
        let max_batch_window_sec = raw.max_batch_window_sec.clamp(batch_window_sec, 20.0);
        let max_buffer_sec = raw.max_buffer_sec.max(max_batch_window_sec);

        let routing_thresholds = parse_routing_thresholds(&raw.llm_routing_thresholds)?;

        Ok(Self {
            port: raw.port,
            worker_base_url: raw.worker_base_url,
            worker_api_key: raw.worker_api_key,
            chat_base_url: raw.chat_base_url,
            chat_api_key: raw.chat_api_key,
            bearer_token: raw.bearer_token,
            outbound_channel_capacity: raw.outbound_channel_capacity,

            batch_window_sec,
            max_batch_window_sec,
            max_buffer_sec,

            insight_min_tokens: raw.insight_min_tokens,
            insight_min_interval: Duration::from_secs(raw.insight_min_interval_sec),
            insight_retain_tokens: raw.insight_retain_tokens,
            insight_worker_concurrency: raw.insight_worker_concurrency,
            insight_queue_maxsize: raw.insight_queue_maxsize,
            insight_flush_timeout: Duration::from_secs(raw.insight_flush_timeout_sec),
            insight_per_tenant_max: raw.insight_per_tenant_max,

            routing_thresholds,

            worker_retries: raw.worker_retries,
            worker_backoff_base_ms: raw.worker_backoff_base_ms,
        })
    }
}

fn parse_routing_thresholds(raw: &str) -> Result<RoutingThresholds, ConfigError> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    let [fast, balanced, max] = parts.as_slice() else {
        return Err(ConfigError::InvalidRoutingThresholds(raw.to_string()));
    };
    let parse = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| ConfigError::InvalidRoutingThresholds(raw.to_string()))
    };
    Ok(RoutingThresholds {
        fast_ceiling: parse(fast)?,
        balanced_ceiling: parse(balanced)?,
        max_context: parse(max)?,
    })
}
