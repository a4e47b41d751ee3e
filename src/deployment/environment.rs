//! Environment collaborator abstraction
//!
//! The orchestrator never talks to a transport directly. It asks an
//! [`EnvironmentProvider`] for a per-environment [`EnvironmentManager`],
//! connects through it, and drives the resulting [`EnvironmentConnection`].
//! Readiness checks go through a separate [`ReadinessValidator`].
//!
//! All traits are object-safe and `Send + Sync` so they can be shared as
//! `Arc<dyn …>` across pipeline tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::DeployError;

/// Parameters for opening a connection.
pub struct ConnectionConfig {
    /// Environment being connected to.
    pub environment_id: String,
    /// Decrypted credential, if the plan named one.
    pub credential: Option<Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("environment_id", &self.environment_id)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Resolves environment ids to managers.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Manager for `environment_id`, or an error if it is unknown.
    async fn get_manager(
        &self,
        environment_id: &str,
    ) -> Result<Arc<dyn EnvironmentManager>, DeployError>;
}

/// Opens connections to one environment.
#[async_trait]
pub trait EnvironmentManager: Send + Sync {
    /// Open a connection. Failure here is a connectivity failure.
    async fn connect(
        &self,
        config: ConnectionConfig,
    ) -> Result<Box<dyn EnvironmentConnection>, DeployError>;
}

/// A live connection to an environment.
#[async_trait]
pub trait EnvironmentConnection: Send + Sync {
    /// Returns `true` if the environment answers.
    async fn test_connection(&self) -> bool;

    /// Install one package.
    async fn install_package(&self, package: &str) -> Result<(), DeployError>;

    /// Write `content` to `path` with Unix `mode`.
    async fn upload_file(&self, path: &str, content: &[u8], mode: u32) -> Result<(), DeployError>;

    /// Apply instrumentation settings.
    async fn apply_instrumentation(&self, config: &serde_json::Value) -> Result<(), DeployError>;

    /// Delete a previously uploaded file.
    async fn remove_file(&self, path: &str) -> Result<(), DeployError>;

    /// Release the connection.
    async fn close(&self) -> Result<(), DeployError>;
}

/// Readiness check output, as produced by [`ReadinessValidator`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Environment is ready for tests.
    pub is_ready: bool,
    /// Fraction of checks that passed, 0.0..=1.0.
    pub success_rate: f64,
    /// Names of the checks that failed.
    #[serde(default)]
    pub failed_checks: Vec<String>,
    /// Non-fatal findings.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Validator-specific output.
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl ValidationReport {
    /// All checks passed.
    pub fn ready() -> Self {
        Self {
            is_ready: true,
            success_rate: 1.0,
            ..Self::default()
        }
    }

    /// `failed` checks out of `total` failed.
    pub fn not_ready<S: Into<String>>(failed: impl IntoIterator<Item = S>, total: usize) -> Self {
        let failed_checks: Vec<String> = failed.into_iter().map(Into::into).collect();
        let passed = total.saturating_sub(failed_checks.len());
        let success_rate = if total == 0 {
            0.0
        } else {
            passed as f64 / total as f64
        };
        Self {
            is_ready: false,
            success_rate,
            failed_checks,
            ..Self::default()
        }
    }
}

/// Checks whether an environment is ready, and tries to repair it.
#[async_trait]
pub trait ReadinessValidator: Send + Sync {
    /// Run readiness checks. `config` is the plan's validation settings.
    async fn validate_readiness(
        &self,
        environment_id: &str,
        config: Option<&serde_json::Value>,
    ) -> Result<ValidationReport, DeployError>;

    /// One recovery pass based on a failed report; returns the re-check.
    async fn attempt_recovery(
        &self,
        environment_id: &str,
        report: &ValidationReport,
    ) -> Result<ValidationReport, DeployError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_success_rate() {
        let report = ValidationReport::not_ready(["disk_space"], 4);
        assert!(!report.is_ready);
        assert!((report.success_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(report.failed_checks, vec!["disk_space"]);
    }

    #[test]
    fn test_not_ready_with_zero_checks() {
        let report = ValidationReport::not_ready(Vec::<String>::new(), 0);
        assert_eq!(report.success_rate, 0.0);
    }

    #[test]
    fn test_connection_config_debug_redacts_credential() {
        let config = ConnectionConfig {
            environment_id: "env-1".into(),
            credential: Some(Zeroizing::new(b"hunter2".to_vec())),
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("env-1"));
        assert!(!debug.contains("hunter2"));
    }
}
