//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`OrchestratorConfig`] that the
//! type system cannot express (zero limits, runaway retry counts, weak key
//! derivation).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value

use super::OrchestratorConfig;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "scheduler.max_concurrent_per_env").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Upper bound on `retry.max_retries`; a deployment is retried at most three times.
pub const MAX_RETRIES_LIMIT: u32 = 3;

/// Lower bound on `security.pbkdf2_iterations`.
pub const MIN_PBKDF2_ITERATIONS: u32 = 10_000;

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on an [`OrchestratorConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
pub fn validate(config: &OrchestratorConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Scheduler ────────────────────────────────────────────────────
    if config.scheduler.max_concurrent_deployments == 0 {
        errors.push(invalid(
            "scheduler.max_concurrent_deployments",
            0,
            "must be at least 1",
        ));
    }

    if config.scheduler.max_concurrent_per_env == 0 {
        errors.push(invalid(
            "scheduler.max_concurrent_per_env",
            0,
            "must be at least 1",
        ));
    }

    // ── Retry ────────────────────────────────────────────────────────
    if config.retry.max_retries > MAX_RETRIES_LIMIT {
        errors.push(invalid(
            "retry.max_retries",
            config.retry.max_retries,
            "must be at most 3",
        ));
    }

    if config.retry.multiplier == 0 {
        errors.push(invalid("retry.multiplier", 0, "must be at least 1"));
    }

    // ── Security ─────────────────────────────────────────────────────
    if config.security.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
        errors.push(invalid(
            "security.pbkdf2_iterations",
            config.security.pbkdf2_iterations,
            "must be at least 10000",
        ));
    }

    if config.security.credential_cache_ttl_secs == 0 {
        errors.push(invalid(
            "security.credential_cache_ttl_secs",
            0,
            "must be at least 1",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
