//! # Deployment pipeline
//!
//! ## Responsibility
//! Execute one admitted plan through the six ordered stages, recording one
//! [`DeploymentStep`](super::DeploymentStep) per stage entered.
//!
//! ## Guarantees
//! - Stages run strictly in [`Stage::ORDERED`] order and stop at the first error
//! - A checksum mismatch fails `artifact_preparation`, so no later step is recorded
//! - An open connection is always closed before [`Pipeline::run`] returns
//! - Cancellation is observed between stages, never inside one
//!
//! ## NOT Responsible For
//! - Terminal status, retries, token release (see: `orchestrator.rs`)

use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument, Span};

use super::environment::{
    ConnectionConfig, EnvironmentConnection, EnvironmentProvider, ReadinessValidator,
    ValidationReport,
};
use super::tracker::Tracker;
use super::types::{DeploymentPlan, DeploymentStatus, TestArtifact};
use crate::security::SecureArtifactHandler;
use crate::{metrics, DeployError};

/// User checked against access rules when a plan names no requester.
pub const SYSTEM_USER: &str = "system";

/// One pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Checksum verification, decryption, deploy-permission checks.
    ArtifactPreparation,
    /// Obtain a manager and verify connectivity.
    EnvironmentConnection,
    /// Install plan and artifact packages.
    DependencyInstallation,
    /// Upload artifacts to their target paths.
    ScriptDeployment,
    /// Apply the instrumentation config.
    InstrumentationSetup,
    /// Readiness checks with one recovery pass.
    ReadinessValidation,
}

impl Stage {
    /// Execution order.
    pub const ORDERED: [Stage; 6] = [
        Stage::ArtifactPreparation,
        Stage::EnvironmentConnection,
        Stage::DependencyInstallation,
        Stage::ScriptDeployment,
        Stage::InstrumentationSetup,
        Stage::ReadinessValidation,
    ];

    /// Stage identifier used in step names, metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ArtifactPreparation => "artifact_preparation",
            Stage::EnvironmentConnection => "environment_connection",
            Stage::DependencyInstallation => "dependency_installation",
            Stage::ScriptDeployment => "script_deployment",
            Stage::InstrumentationSetup => "instrumentation_setup",
            Stage::ReadinessValidation => "readiness_validation",
        }
    }

    /// Deployment status while this stage runs.
    pub fn target_status(self) -> DeploymentStatus {
        match self {
            Stage::ArtifactPreparation => DeploymentStatus::Preparing,
            Stage::EnvironmentConnection => DeploymentStatus::Connecting,
            Stage::DependencyInstallation => DeploymentStatus::InstallingDeps,
            Stage::ScriptDeployment => DeploymentStatus::DeployingScripts,
            Stage::InstrumentationSetup => DeploymentStatus::ConfiguringInstrumentation,
            Stage::ReadinessValidation => DeploymentStatus::Validating,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! stage_span {
    ($name:literal, $id:expr, $env:expr) => {
        tracing::info_span!(
            $name,
            deployment_id = %$id,
            environment_id = %$env,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
            error_kind = tracing::field::Empty,
        )
    };
}

fn stage_span(stage: Stage, deployment_id: &str, environment_id: &str) -> Span {
    match stage {
        Stage::ArtifactPreparation => {
            stage_span!("pipeline.artifact_preparation", deployment_id, environment_id)
        }
        Stage::EnvironmentConnection => {
            stage_span!("pipeline.environment_connection", deployment_id, environment_id)
        }
        Stage::DependencyInstallation => {
            stage_span!("pipeline.dependency_installation", deployment_id, environment_id)
        }
        Stage::ScriptDeployment => {
            stage_span!("pipeline.script_deployment", deployment_id, environment_id)
        }
        Stage::InstrumentationSetup => {
            stage_span!("pipeline.instrumentation_setup", deployment_id, environment_id)
        }
        Stage::ReadinessValidation => {
            stage_span!("pipeline.readiness_validation", deployment_id, environment_id)
        }
    }
}

/// How a pipeline run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineOutcome {
    /// Every stage succeeded.
    Completed,
    /// The deployment went terminal between stages.
    Cancelled,
}

/// The stage that failed and why.
#[derive(Debug)]
pub(crate) struct StageFailure {
    pub stage: Stage,
    pub error: DeployError,
}

type StageDetails = HashMap<String, Value>;

/// Per-run mutable state carried between stages.
#[derive(Default)]
struct RunState {
    prepared: Vec<TestArtifact>,
    connection: Option<Box<dyn EnvironmentConnection>>,
}

impl RunState {
    fn connection(&self) -> Result<&dyn EnvironmentConnection, DeployError> {
        self.connection.as_deref().ok_or_else(|| DeployError::Stage {
            stage: Stage::EnvironmentConnection.to_string(),
            message: "no open connection".into(),
        })
    }
}

/// Stage executor shared by every pipeline task.
pub(crate) struct Pipeline {
    provider: Arc<dyn EnvironmentProvider>,
    validator: Arc<dyn ReadinessValidator>,
    security: Option<Arc<SecureArtifactHandler>>,
}

impl Pipeline {
    pub(crate) fn new(
        provider: Arc<dyn EnvironmentProvider>,
        validator: Arc<dyn ReadinessValidator>,
        security: Option<Arc<SecureArtifactHandler>>,
    ) -> Self {
        Self {
            provider,
            validator,
            security,
        }
    }

    /// Run every stage of `plan`, recording steps in `tracker`.
    pub(crate) async fn run(
        &self,
        plan: &DeploymentPlan,
        tracker: &Tracker,
    ) -> Result<PipelineOutcome, StageFailure> {
        let mut state = RunState::default();
        let outcome = self.run_stages(plan, tracker, &mut state).await;

        if let Some(connection) = state.connection.take() {
            if let Err(e) = connection.close().await {
                warn!(
                    deployment_id = %plan.plan_id,
                    environment_id = %plan.environment_id,
                    error = %e,
                    "failed to close environment connection"
                );
            }
        }
        outcome
    }

    async fn run_stages(
        &self,
        plan: &DeploymentPlan,
        tracker: &Tracker,
        state: &mut RunState,
    ) -> Result<PipelineOutcome, StageFailure> {
        let id = plan.plan_id.as_str();

        for stage in Stage::ORDERED {
            let Some(step) = tracker.begin_stage(id, stage) else {
                info!(deployment_id = %id, stage = %stage, "deployment no longer active, stopping pipeline");
                return Ok(PipelineOutcome::Cancelled);
            };

            let span = stage_span(stage, id, &plan.environment_id);
            let start = Instant::now();
            let result = self
                .execute(stage, plan, tracker, state)
                .instrument(span.clone())
                .await;
            let elapsed = start.elapsed();

            metrics::record_stage_latency(stage.as_str(), elapsed);
            span.record("duration_ms", elapsed.as_millis() as u64);

            match result {
                Ok(details) => {
                    span.record("outcome", "ok");
                    tracker.end_step(id, step, Ok(details));
                }
                Err(error) => {
                    span.record("outcome", "err");
                    span.record("error_kind", error.kind());
                    metrics::inc_stage_error(stage.as_str(), error.kind());
                    warn!(
                        deployment_id = %id,
                        stage = %stage,
                        error = %error,
                        "pipeline stage failed"
                    );
                    tracker.end_step(id, step, Err(error.to_string()));
                    return Err(StageFailure { stage, error });
                }
            }
        }
        Ok(PipelineOutcome::Completed)
    }

    async fn execute(
        &self,
        stage: Stage,
        plan: &DeploymentPlan,
        tracker: &Tracker,
        state: &mut RunState,
    ) -> Result<StageDetails, DeployError> {
        match stage {
            Stage::ArtifactPreparation => self.prepare_artifacts(plan, state),
            Stage::EnvironmentConnection => {
                state.connection = Some(self.open_connection(plan).await?);
                Ok(HashMap::from([(
                    "connected".to_string(),
                    json!(true),
                )]))
            }
            Stage::DependencyInstallation => {
                let connection = state.connection()?;
                let mut installed = Vec::new();
                for package in plan.all_dependencies() {
                    connection.install_package(&package).await?;
                    debug!(deployment_id = %plan.plan_id, package = %package, "package installed");
                    tracker.update(&plan.plan_id, |r| r.dependencies_installed.push(package.clone()));
                    installed.push(package);
                }
                Ok(HashMap::from([("packages".to_string(), json!(installed))]))
            }
            Stage::ScriptDeployment => {
                let connection = state.connection()?;
                for artifact in &state.prepared {
                    connection
                        .upload_file(&artifact.target_path, &artifact.content, artifact.permissions)
                        .await?;
                    debug!(
                        deployment_id = %plan.plan_id,
                        artifact_id = %artifact.artifact_id,
                        target_path = %artifact.target_path,
                        "artifact uploaded"
                    );
                    tracker.update(&plan.plan_id, |r| r.artifacts_deployed += 1);
                }
                Ok(HashMap::from([(
                    "artifacts".to_string(),
                    json!(state.prepared.len()),
                )]))
            }
            Stage::InstrumentationSetup => {
                if is_empty_config(&plan.instrumentation_config) {
                    return Ok(HashMap::from([("skipped".to_string(), json!(true))]));
                }
                state
                    .connection()?
                    .apply_instrumentation(&plan.instrumentation_config)
                    .await?;
                Ok(HashMap::from([("skipped".to_string(), json!(false))]))
            }
            Stage::ReadinessValidation => self.validate_readiness(plan).await,
        }
    }

    fn prepare_artifacts(
        &self,
        plan: &DeploymentPlan,
        state: &mut RunState,
    ) -> Result<StageDetails, DeployError> {
        let user = requester(plan);
        state.prepared.clear();
        for artifact in &plan.test_artifacts {
            let plain = self.unlock_artifact(artifact, user, &plan.environment_id)?;
            if let Some(actual) = plain.checksum_mismatch() {
                return Err(DeployError::ChecksumMismatch {
                    artifact_id: plain.artifact_id,
                    expected: plain.checksum,
                    actual,
                });
            }
            state.prepared.push(plain);
        }
        Ok(HashMap::from([(
            "artifacts_verified".to_string(),
            json!(state.prepared.len()),
        )]))
    }

    /// Plaintext artifact `user` is allowed to deploy to `environment_id`.
    fn unlock_artifact(
        &self,
        artifact: &TestArtifact,
        user: &str,
        environment_id: &str,
    ) -> Result<TestArtifact, DeployError> {
        if !artifact.is_encrypted && !artifact.access_control_enabled {
            return Ok(artifact.clone());
        }
        let Some(security) = &self.security else {
            return Err(DeployError::PermissionDenied(format!(
                "artifact {} is protected and no security handler is configured",
                artifact.artifact_id
            )));
        };
        if artifact.access_control_enabled
            && !security.enforce_deploy_permission(artifact, user, environment_id)
        {
            return Err(DeployError::PermissionDenied(format!(
                "user {user} may not deploy artifact {} to {environment_id}",
                artifact.artifact_id
            )));
        }
        security.decrypt(artifact, user)?.ok_or_else(|| {
            DeployError::PermissionDenied(format!(
                "user {user} may not read artifact {}",
                artifact.artifact_id
            ))
        })
    }

    /// Connect to the plan's environment and verify it answers.
    pub(crate) async fn open_connection(
        &self,
        plan: &DeploymentPlan,
    ) -> Result<Box<dyn EnvironmentConnection>, DeployError> {
        let credential = match &plan.deployment_config.credential_id {
            None => None,
            Some(credential_id) => {
                let security = self.security.as_ref().ok_or_else(|| {
                    DeployError::PermissionDenied(format!(
                        "credential {credential_id} requested and no security handler is configured"
                    ))
                })?;
                Some(security.environment_credential(
                    credential_id,
                    requester(plan),
                    &plan.environment_id,
                )?)
            }
        };

        let manager = self.provider.get_manager(&plan.environment_id).await?;
        let connection = manager
            .connect(ConnectionConfig {
                environment_id: plan.environment_id.clone(),
                credential,
            })
            .await?;

        if !connection.test_connection().await {
            if let Err(e) = connection.close().await {
                debug!(environment_id = %plan.environment_id, error = %e, "close after failed probe");
            }
            return Err(DeployError::Connectivity(format!(
                "environment {} did not answer the connection test",
                plan.environment_id
            )));
        }
        Ok(connection)
    }

    async fn validate_readiness(&self, plan: &DeploymentPlan) -> Result<StageDetails, DeployError> {
        let env = plan.environment_id.as_str();
        let config = plan.deployment_config.validation.as_ref();

        let report = self.validator.validate_readiness(env, config).await?;
        if report.is_ready {
            return Ok(readiness_details(&report, false));
        }

        warn!(
            environment_id = %env,
            failed_checks = ?report.failed_checks,
            "environment not ready, attempting recovery"
        );
        let recovered = self.validator.attempt_recovery(env, &report).await?;
        if recovered.is_ready {
            info!(environment_id = %env, "environment recovered");
            return Ok(readiness_details(&recovered, true));
        }
        Err(DeployError::Readiness(format_readiness_failure(env, &recovered)))
    }
}

fn requester(plan: &DeploymentPlan) -> &str {
    plan.requested_by.as_deref().unwrap_or(SYSTEM_USER)
}

fn is_empty_config(config: &Value) -> bool {
    match config {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn readiness_details(report: &ValidationReport, recovered: bool) -> StageDetails {
    HashMap::from([
        ("success_rate".to_string(), json!(report.success_rate)),
        ("warnings".to_string(), json!(report.warnings)),
        ("recovered".to_string(), json!(recovered)),
    ])
}

/// Remediation hint for one failed check, matched by keyword.
fn remediation_hint(check: &str) -> &'static str {
    const HINTS: &[(&[&str], &str)] = &[
        (&["disk"], "free disk space or enlarge the test volume"),
        (&["memory"], "reduce memory pressure or add memory to the environment"),
        (&["network"], "check network reachability and firewall rules"),
        (&["permission"], "verify file ownership and user permissions"),
        (&["package", "dependency"], "reinstall the missing packages"),
        (&["service"], "restart the required services"),
        (&["kernel"], "confirm the running kernel matches the test requirements"),
    ];
    let check = check.to_lowercase();
    HINTS
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|kw| check.contains(kw)))
        .map_or("inspect the environment manually", |&(_, hint)| hint)
}

/// Diagnostic for a readiness failure that survived recovery.
pub(crate) fn format_readiness_failure(environment_id: &str, report: &ValidationReport) -> String {
    let checks = if report.failed_checks.is_empty() {
        "unknown".to_string()
    } else {
        report.failed_checks.join(", ")
    };
    let suggestions = if report.failed_checks.is_empty() {
        remediation_hint("").to_string()
    } else {
        report
            .failed_checks
            .iter()
            .map(|check| format!("{check}: {}", remediation_hint(check)))
            .collect::<Vec<_>>()
            .join("; ")
    };
    format!(
        "environment {environment_id} not ready after recovery (success rate {:.0}%): \
         failed checks: {checks}; suggestions: {suggestions}",
        report.success_rate * 100.0
    )
}
