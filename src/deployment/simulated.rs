//! In-process environments and validator
//!
//! Record everything that would have happened on a real environment and let
//! callers inject failures. Used by the demo binary and the test suites.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::environment::{
    ConnectionConfig, EnvironmentConnection, EnvironmentManager, EnvironmentProvider,
    ReadinessValidator, ValidationReport,
};
use crate::DeployError;

#[derive(Default)]
struct EnvState {
    files: HashMap<String, (Vec<u8>, u32)>,
    packages: Vec<String>,
    instrumentation: Vec<serde_json::Value>,
    connect_attempts: u32,
    pending_connect_failures: u32,
    open_connections: usize,
    had_credential: bool,
}

#[derive(Default)]
struct Shared {
    envs: DashMap<String, EnvState>,
    latency: Duration,
    failing_packages: DashMap<String, ()>,
}

/// Simulated fleet. Every environment id is valid and starts empty.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct SimulatedEnvironments {
    shared: Arc<Shared>,
}

impl SimulatedEnvironments {
    /// Fleet with no artificial latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fleet where every operation sleeps for `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                latency,
                ..Shared::default()
            }),
        }
    }

    /// Make the next `count` connection attempts to `environment_id` fail.
    pub fn fail_connections(&self, environment_id: &str, count: u32) {
        self.shared
            .envs
            .entry(environment_id.to_string())
            .or_default()
            .pending_connect_failures = count;
    }

    /// Make every install of `package` fail.
    pub fn fail_package(&self, package: &str) {
        self.shared.failing_packages.insert(package.to_string(), ());
    }

    /// Connection attempts made so far, failed ones included.
    pub fn connection_attempts(&self, environment_id: &str) -> u32 {
        self.shared
            .envs
            .get(environment_id)
            .map_or(0, |env| env.connect_attempts)
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self, environment_id: &str) -> usize {
        self.shared
            .envs
            .get(environment_id)
            .map_or(0, |env| env.open_connections)
    }

    /// Paths currently present on the environment, sorted.
    pub fn files(&self, environment_id: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .shared
            .envs
            .get(environment_id)
            .map(|env| env.files.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    /// Content and mode of one uploaded file.
    pub fn file(&self, environment_id: &str, path: &str) -> Option<(Vec<u8>, u32)> {
        self.shared
            .envs
            .get(environment_id)
            .and_then(|env| env.files.get(path).cloned())
    }

    /// Packages installed, in install order.
    pub fn packages(&self, environment_id: &str) -> Vec<String> {
        self.shared
            .envs
            .get(environment_id)
            .map(|env| env.packages.clone())
            .unwrap_or_default()
    }

    /// Instrumentation configs applied, in order.
    pub fn instrumentation(&self, environment_id: &str) -> Vec<serde_json::Value> {
        self.shared
            .envs
            .get(environment_id)
            .map(|env| env.instrumentation.clone())
            .unwrap_or_default()
    }

    /// Returns `true` if the last connection carried a credential.
    pub fn received_credential(&self, environment_id: &str) -> bool {
        self.shared
            .envs
            .get(environment_id)
            .is_some_and(|env| env.had_credential)
    }
}

#[async_trait]
impl EnvironmentProvider for SimulatedEnvironments {
    async fn get_manager(
        &self,
        environment_id: &str,
    ) -> Result<Arc<dyn EnvironmentManager>, DeployError> {
        Ok(Arc::new(SimulatedManager {
            shared: self.shared.clone(),
            environment_id: environment_id.to_string(),
        }))
    }
}

struct SimulatedManager {
    shared: Arc<Shared>,
    environment_id: String,
}

#[async_trait]
impl EnvironmentManager for SimulatedManager {
    async fn connect(
        &self,
        config: ConnectionConfig,
    ) -> Result<Box<dyn EnvironmentConnection>, DeployError> {
        tokio::time::sleep(self.shared.latency).await;

        let mut env = self
            .shared
            .envs
            .entry(self.environment_id.clone())
            .or_default();
        env.connect_attempts += 1;
        if env.pending_connect_failures > 0 {
            env.pending_connect_failures -= 1;
            debug!(environment_id = %self.environment_id, "simulated connection failure");
            return Err(DeployError::Connectivity(format!(
                "environment {} unreachable",
                self.environment_id
            )));
        }
        env.open_connections += 1;
        env.had_credential = config.credential.is_some();
        drop(env);

        Ok(Box::new(SimulatedConnection {
            shared: self.shared.clone(),
            environment_id: self.environment_id.clone(),
        }))
    }
}

struct SimulatedConnection {
    shared: Arc<Shared>,
    environment_id: String,
}

impl SimulatedConnection {
    async fn with_env<R>(&self, f: impl FnOnce(&mut EnvState) -> R) -> R {
        tokio::time::sleep(self.shared.latency).await;
        let mut env = self
            .shared
            .envs
            .entry(self.environment_id.clone())
            .or_default();
        f(&mut *env)
    }
}

#[async_trait]
impl EnvironmentConnection for SimulatedConnection {
    async fn test_connection(&self) -> bool {
        true
    }

    async fn install_package(&self, package: &str) -> Result<(), DeployError> {
        if self.shared.failing_packages.contains_key(package) {
            return Err(DeployError::Stage {
                stage: "dependency_installation".into(),
                message: format!("package {package} failed to install"),
            });
        }
        self.with_env(|env| {
            if !env.packages.iter().any(|p| p == package) {
                env.packages.push(package.to_string());
            }
        })
        .await;
        Ok(())
    }

    async fn upload_file(&self, path: &str, content: &[u8], mode: u32) -> Result<(), DeployError> {
        self.with_env(|env| {
            env.files.insert(path.to_string(), (content.to_vec(), mode));
        })
        .await;
        Ok(())
    }

    async fn apply_instrumentation(&self, config: &serde_json::Value) -> Result<(), DeployError> {
        self.with_env(|env| env.instrumentation.push(config.clone()))
            .await;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), DeployError> {
        self.with_env(|env| {
            env.files.remove(path);
        })
        .await;
        Ok(())
    }

    async fn close(&self) -> Result<(), DeployError> {
        self.with_env(|env| env.open_connections = env.open_connections.saturating_sub(1))
            .await;
        Ok(())
    }
}

/// Validator returning a fixed verdict.
pub struct SimulatedValidator {
    failed_checks: Vec<String>,
    total_checks: usize,
    recovers: bool,
    validations: AtomicUsize,
    recoveries: AtomicUsize,
}

impl SimulatedValidator {
    /// Every environment is ready.
    pub fn ready() -> Self {
        Self::failing(Vec::<String>::new(), true)
    }

    /// `failed_checks` fail; recovery fixes them iff `recovers`.
    pub fn failing<S: Into<String>>(failed_checks: impl IntoIterator<Item = S>, recovers: bool) -> Self {
        Self {
            failed_checks: failed_checks.into_iter().map(Into::into).collect(),
            total_checks: 10,
            recovers,
            validations: AtomicUsize::new(0),
            recoveries: AtomicUsize::new(0),
        }
    }

    /// Number of `validate_readiness` calls.
    pub fn validations(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }

    /// Number of `attempt_recovery` calls.
    pub fn recoveries(&self) -> usize {
        self.recoveries.load(Ordering::SeqCst)
    }

    fn report(&self) -> ValidationReport {
        if self.failed_checks.is_empty() {
            ValidationReport::ready()
        } else {
            ValidationReport::not_ready(self.failed_checks.iter().cloned(), self.total_checks)
        }
    }
}

#[async_trait]
impl ReadinessValidator for SimulatedValidator {
    async fn validate_readiness(
        &self,
        _environment_id: &str,
        _config: Option<&serde_json::Value>,
    ) -> Result<ValidationReport, DeployError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        Ok(self.report())
    }

    async fn attempt_recovery(
        &self,
        _environment_id: &str,
        _report: &ValidationReport,
    ) -> Result<ValidationReport, DeployError> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        if self.recovers {
            Ok(ValidationReport::ready())
        } else {
            Ok(self.report())
        }
    }
}
