//! # Orchestrator Configuration
//!
//! ## Responsibility
//! Describe every tunable of the deployment orchestrator as a TOML document:
//! ```text
//! tokio-deploy-orchestrator --config orchestrator.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `OrchestratorConfig`
//! - Total: every field has a default, so an empty document is a valid config
//! - Validated: semantic constraints are checked by [`validation::validate`]
//!   before a loaded config is returned
//!
//! ## NOT Responsible For
//! - Building the orchestrator (that belongs to `deployment::orchestrator`)
//! - Environment transport settings (owned by the environment provider)

pub mod loader;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use validation::ConfigError;

// ── Default value functions ──────────────────────────────────────────────

fn default_max_concurrent_deployments() -> usize {
    10
}

fn default_max_concurrent_per_env() -> usize {
    3
}

fn default_idle_poll_ms() -> u64 {
    100
}

fn default_contention_backoff_ms() -> u64 {
    250
}

fn default_max_retries() -> u32 {
    3
}

/// 5s, 10s, 20s with the default multiplier.
fn default_base_delay_ms() -> u64 {
    5000
}

fn default_multiplier() -> u32 {
    2
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("deployment_logs")
}

fn default_true() -> bool {
    true
}

/// 15 minutes.
fn default_credential_cache_ttl_secs() -> u64 {
    900
}

fn default_credential_ttl_hours() -> u32 {
    24
}

fn default_pbkdf2_iterations() -> u32 {
    100_000
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an orchestrator instance.
///
/// # Example
///
/// ```toml
/// [scheduler]
/// max_concurrent_deployments = 10
/// max_concurrent_per_env = 3
///
/// [retry]
/// base_delay_ms = 5000
///
/// [logging]
/// log_dir = "deployment_logs"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Dispatch loop and concurrency limits.
    pub scheduler: SchedulerConfig,
    /// Automatic and explicit retry backoff.
    pub retry: RetryConfig,
    /// Deployment event logs and persisted metrics.
    pub logging: LoggingConfig,
    /// Credential cache and key derivation.
    pub security: SecurityConfig,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Global cap on simultaneously running pipelines.
    #[serde(default = "default_max_concurrent_deployments")]
    pub max_concurrent_deployments: usize,
    /// Per-environment cap enforced before a pipeline is admitted.
    #[serde(default = "default_max_concurrent_per_env")]
    pub max_concurrent_per_env: usize,
    /// Dispatch loop sleep when the queue is empty.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Dispatch loop pause after re-queueing a plan denied a token.
    #[serde(default = "default_contention_backoff_ms")]
    pub contention_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deployments: default_max_concurrent_deployments(),
            max_concurrent_per_env: default_max_concurrent_per_env(),
            idle_poll_ms: default_idle_poll_ms(),
            contention_backoff_ms: default_contention_backoff_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Idle poll interval as a [`Duration`].
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Contention pause as a [`Duration`].
    pub fn contention_backoff(&self) -> Duration {
        Duration::from_millis(self.contention_backoff_ms)
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff growth factor.
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Directory holding `<deployment_id>.jsonl` files and `metrics.json`.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Redact secret-looking fields before they reach disk.
    #[serde(default = "default_true")]
    pub sanitize: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            sanitize: true,
        }
    }
}

/// `[security]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    /// Lifetime of a decrypted credential in the cache.
    #[serde(default = "default_credential_cache_ttl_secs")]
    pub credential_cache_ttl_secs: u64,
    /// TTL applied when `store` is called without one.
    #[serde(default = "default_credential_ttl_hours")]
    pub default_credential_ttl_hours: u32,
    /// PBKDF2-HMAC-SHA256 rounds for password-derived keys.
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            credential_cache_ttl_secs: default_credential_cache_ttl_secs(),
            default_credential_ttl_hours: default_credential_ttl_hours(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
        }
    }
}

impl SecurityConfig {
    /// Credential cache lifetime as a [`Duration`].
    pub fn credential_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.scheduler.max_concurrent_deployments, 10);
        assert_eq!(config.scheduler.max_concurrent_per_env, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 5000);
        assert_eq!(config.retry.multiplier, 2);
        assert_eq!(config.logging.log_dir, PathBuf::from("deployment_logs"));
        assert!(config.logging.sanitize);
        assert_eq!(config.security.credential_cache_ttl(), Duration::from_secs(900));
        assert_eq!(config.security.pbkdf2_iterations, 100_000);
    }

    #[test]
    fn test_empty_document_deserializes_to_defaults() {
        let config: OrchestratorConfig = toml::from_str("").expect("empty toml");
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: OrchestratorConfig =
            toml::from_str("[scheduler]\nmax_concurrent_per_env = 5\n").expect("toml");
        assert_eq!(config.scheduler.max_concurrent_per_env, 5);
        assert_eq!(config.scheduler.max_concurrent_deployments, 10);
        assert_eq!(config.scheduler.idle_poll(), Duration::from_millis(100));
        assert_eq!(config.scheduler.contention_backoff(), Duration::from_millis(250));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = OrchestratorConfig::default();
        let text = toml::to_string(&config).expect("serialize");
        let parsed: OrchestratorConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed, config);
    }
}
