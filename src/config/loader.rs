//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into an [`OrchestratorConfig`], and
//! run validation before returning.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message

use std::path::Path;

use super::validation::{self, ConfigError};
use super::OrchestratorConfig;

/// Load an [`OrchestratorConfig`] from a TOML file.
///
/// # Errors
///
/// - [`ConfigError::Io`] if the file cannot be read.
/// - [`ConfigError::Parse`] if the TOML is malformed.
/// - [`ConfigError::Validation`] if semantic constraints are violated.
///
/// # Example
///
/// ```rust,ignore
/// use tokio_deploy_orchestrator::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("orchestrator.toml"))?;
/// println!("per-env cap: {}", config.scheduler.max_concurrent_per_env);
/// ```
pub fn load_from_file(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load an [`OrchestratorConfig`] from a TOML string.
///
/// `source_name` identifies the source in error messages.
pub fn load_from_str(content: &str, source_name: &str) -> Result<OrchestratorConfig, ConfigError> {
    let config: OrchestratorConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[scheduler]
max_concurrent_deployments = 4
max_concurrent_per_env = 2
idle_poll_ms = 10
contention_backoff_ms = 20

[retry]
max_retries = 3
base_delay_ms = 50
multiplier = 2

[logging]
log_dir = "/tmp/deploy-logs"
sanitize = false

[security]
credential_cache_ttl_secs = 60
default_credential_ttl_hours = 1
pbkdf2_iterations = 20000
"#;

    #[test]
    fn test_load_from_str_valid_toml_succeeds() {
        let config = load_from_str(VALID_TOML, "test.toml").expect("valid config");
        assert_eq!(config.scheduler.max_concurrent_deployments, 4);
        assert_eq!(config.scheduler.max_concurrent_per_env, 2);
        assert_eq!(config.retry.base_delay_ms, 50);
        assert!(!config.logging.sanitize);
        assert_eq!(config.security.pbkdf2_iterations, 20_000);
    }

    #[test]
    fn test_load_from_str_malformed_toml_is_parse_error() {
        let result = load_from_str("[scheduler\nmax = ", "broken.toml");
        match result {
            Err(ConfigError::Parse { file, .. }) => assert_eq!(file, "broken.toml"),
            other => panic!("expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_str_wrong_type_is_parse_error() {
        let result = load_from_str("[scheduler]\nmax_concurrent_per_env = \"three\"\n", "t.toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_str_invalid_values_joined_in_message() {
        let toml = "[scheduler]\nmax_concurrent_per_env = 0\n[retry]\nmultiplier = 0\n";
        match load_from_str(toml, "t.toml") {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("scheduler.max_concurrent_per_env"));
                assert!(msg.contains("retry.multiplier"));
                assert!(msg.contains("; "));
            }
            other => panic!("expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file_reads_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(VALID_TOML.as_bytes()).expect("write");
        let config = load_from_file(file.path()).expect("load");
        assert_eq!(config.scheduler.idle_poll_ms, 10);
    }

    #[test]
    fn test_load_from_file_missing_is_io_error() {
        let result = load_from_file(Path::new("/nonexistent/orchestrator.toml"));
        match result {
            Err(ConfigError::Io { file, .. }) => assert!(file.contains("orchestrator.toml")),
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
