//! # Deployment data model
//!
//! ## Responsibility
//! Define plans (what to deploy), results (the tracked execution), steps
//! (one per pipeline stage) and artifacts, plus the deployment state machine.
//!
//! ## Guarantees
//! - Serializable: every type round-trips through serde (JSON logs, snapshots)
//! - Terminal states are terminal: [`DeploymentStatus::can_transition_to`]
//!   never allows leaving `Completed`, `Failed` or `Cancelled`
//! - Artifact checksums are SHA-256 over the plaintext content, hex encoded
//!
//! ## NOT Responsible For
//! - Executing anything (see: `pipeline.rs`)
//! - Encryption of artifact content (see: `security::artifacts`)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use crate::scheduling::Priority;
use crate::security::SecurityLevel;

/// Hex-encoded SHA-256 of `content`.
pub fn content_checksum(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Lifecycle status of a deployment.
///
/// `Pending` → `Preparing` → `Connecting` → `InstallingDeps` →
/// `DeployingScripts` → `ConfiguringInstrumentation` → `Validating` →
/// `Completed`, with `Failed` and `Cancelled` reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Queued, not yet admitted.
    Pending,
    /// Verifying and decrypting artifacts.
    Preparing,
    /// Reaching the environment.
    Connecting,
    /// Installing packages on the environment.
    InstallingDeps,
    /// Uploading artifacts.
    DeployingScripts,
    /// Applying instrumentation config.
    ConfiguringInstrumentation,
    /// Running readiness checks.
    Validating,
    /// All stages succeeded.
    Completed,
    /// A stage failed.
    Failed,
    /// Cancelled or rolled back by a caller.
    Cancelled,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Connecting => "connecting",
            Self::InstallingDeps => "installing_deps",
            Self::DeployingScripts => "deploying_scripts",
            Self::ConfiguringInstrumentation => "configuring_instrumentation",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl DeploymentStatus {
    /// Returns `true` once no further automatic action will occur.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Position in the happy path, `None` for `Failed`/`Cancelled`.
    fn ordinal(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Preparing => Some(1),
            Self::Connecting => Some(2),
            Self::InstallingDeps => Some(3),
            Self::DeployingScripts => Some(4),
            Self::ConfiguringInstrumentation => Some(5),
            Self::Validating => Some(6),
            Self::Completed => Some(7),
            Self::Failed | Self::Cancelled => None,
        }
    }

    /// Returns `true` if the state machine allows `self → next`.
    ///
    /// Forward moves along the happy path only go one step at a time.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed | Self::Cancelled => true,
            _ => match (self.ordinal(), next.ordinal()) {
                (Some(from), Some(to)) => to == from + 1,
                _ => false,
            },
        }
    }
}

/// Outcome of a single pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Stage body is executing.
    Running,
    /// Stage finished successfully.
    Completed,
    /// Stage raised an error.
    Failed,
}

/// Recorded execution of one pipeline stage. Appended, never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStep {
    /// Unique step id (`<deployment_id>-<stage>-<n>`).
    pub step_id: String,
    /// Stage identifier, e.g. `artifact_preparation`.
    pub name: String,
    /// Step outcome.
    pub status: StepStatus,
    /// When the stage started.
    pub start_time: DateTime<Utc>,
    /// When the stage finished, if it has.
    pub end_time: Option<DateTime<Utc>>,
    /// Failure message, if the stage failed.
    pub error_message: Option<String>,
    /// Free-form stage output.
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl DeploymentStep {
    /// New running step.
    pub fn start(step_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            name: name.into(),
            status: StepStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            error_message: None,
            details: HashMap::new(),
        }
    }

    /// Mark the step completed.
    pub fn complete(&mut self) {
        self.status = StepStatus::Completed;
        self.end_time = Some(Utc::now());
    }

    /// Mark the step failed with `message`.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error_message = Some(message.into());
        self.end_time = Some(Utc::now());
    }
}

/// Kind of test artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    /// Executable test script.
    Script,
    /// Configuration file.
    Config,
    /// Compiled binary.
    Binary,
    /// Input data.
    Data,
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Script => write!(f, "script"),
            Self::Config => write!(f, "config"),
            Self::Binary => write!(f, "binary"),
            Self::Data => write!(f, "data"),
        }
    }
}

/// A file to place on the test environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestArtifact {
    /// Unique artifact id; also the access-control resource id.
    pub artifact_id: String,
    /// Display name.
    pub name: String,
    /// Kind of artifact.
    pub artifact_type: ArtifactType,
    /// Content bytes (ciphertext when `is_encrypted`).
    #[serde(with = "hex_bytes")]
    pub content: Vec<u8>,
    /// Hex SHA-256 of the plaintext content.
    pub checksum: String,
    /// Unix mode bits applied on upload.
    pub permissions: u32,
    /// Destination path on the environment.
    pub target_path: String,
    /// Packages this artifact needs installed.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Sensitivity tag.
    #[serde(default)]
    pub security_level: SecurityLevel,
    /// `content` holds ciphertext.
    #[serde(default)]
    pub is_encrypted: bool,
    /// Deploying requires a `deploy` grant.
    #[serde(default)]
    pub access_control_enabled: bool,
    /// Free-form tags (`encrypted`, `security_level`, `encryption_timestamp`, …).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl TestArtifact {
    /// Plaintext artifact with a freshly computed checksum and mode `0o755`
    /// for scripts/binaries, `0o644` otherwise.
    pub fn new(
        artifact_id: impl Into<String>,
        name: impl Into<String>,
        artifact_type: ArtifactType,
        content: Vec<u8>,
        target_path: impl Into<String>,
    ) -> Self {
        let permissions = match artifact_type {
            ArtifactType::Script | ArtifactType::Binary => 0o755,
            ArtifactType::Config | ArtifactType::Data => 0o644,
        };
        Self {
            artifact_id: artifact_id.into(),
            name: name.into(),
            artifact_type,
            checksum: content_checksum(&content),
            content,
            permissions,
            target_path: target_path.into(),
            dependencies: Vec::new(),
            security_level: SecurityLevel::Public,
            is_encrypted: false,
            access_control_enabled: false,
            metadata: HashMap::new(),
        }
    }

    /// Add package dependencies.
    pub fn with_dependencies<S: Into<String>>(mut self, deps: impl IntoIterator<Item = S>) -> Self {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Returns the recomputed checksum if it differs from the declared one.
    ///
    /// Only meaningful on plaintext content.
    pub fn checksum_mismatch(&self) -> Option<String> {
        let actual = content_checksum(&self.content);
        (actual != self.checksum).then_some(actual)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

/// Scheduling and access settings of a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Queue priority.
    #[serde(default)]
    pub priority: Priority,
    /// Credential handed to the environment connection.
    #[serde(default)]
    pub credential_id: Option<String>,
    /// Passed verbatim to the readiness validator.
    #[serde(default)]
    pub validation: Option<serde_json::Value>,
}

/// What to deploy, where. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// Unique id; becomes the deployment id.
    pub plan_id: String,
    /// Target environment.
    pub environment_id: String,
    /// Files to place on the environment.
    pub test_artifacts: Vec<TestArtifact>,
    /// Packages to install before the artifacts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Instrumentation settings; `null` or `{}` skips the stage body.
    #[serde(default)]
    pub instrumentation_config: serde_json::Value,
    /// Priority, credential and validation settings.
    #[serde(default)]
    pub deployment_config: DeploymentConfig,
    /// User whose grants gate artifact access.
    #[serde(default)]
    pub requested_by: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

impl DeploymentPlan {
    /// Plan at normal priority with no dependencies or instrumentation.
    pub fn new(
        plan_id: impl Into<String>,
        environment_id: impl Into<String>,
        test_artifacts: Vec<TestArtifact>,
    ) -> Self {
        Self {
            plan_id: plan_id.into(),
            environment_id: environment_id.into(),
            test_artifacts,
            dependencies: Vec::new(),
            instrumentation_config: serde_json::Value::Null,
            deployment_config: DeploymentConfig::default(),
            requested_by: None,
            created_at: Utc::now(),
        }
    }

    /// Set the queue priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.deployment_config.priority = priority;
        self
    }

    /// Set the requesting user.
    pub fn requested_by(mut self, user_id: impl Into<String>) -> Self {
        self.requested_by = Some(user_id.into());
        self
    }

    /// Add plan-level package dependencies.
    pub fn with_dependencies<S: Into<String>>(mut self, deps: impl IntoIterator<Item = S>) -> Self {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Set the instrumentation config.
    pub fn with_instrumentation(mut self, config: serde_json::Value) -> Self {
        self.instrumentation_config = config;
        self
    }

    /// Set the credential used to connect.
    pub fn with_credential(mut self, credential_id: impl Into<String>) -> Self {
        self.deployment_config.credential_id = Some(credential_id.into());
        self
    }

    /// Plan-level dependencies followed by artifact dependencies, first
    /// occurrence wins.
    pub fn all_dependencies(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.dependencies
            .iter()
            .chain(self.test_artifacts.iter().flat_map(|a| a.dependencies.iter()))
            .filter(|dep| seen.insert(dep.as_str()))
            .cloned()
            .collect()
    }
}

/// Tracked execution of a plan. One instance per deployment for its whole
/// lifetime; retries mutate it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResult {
    /// Equal to the plan id.
    pub deployment_id: String,
    /// Current status.
    pub status: DeploymentStatus,
    /// Every step ever recorded, across attempts.
    pub steps: Vec<DeploymentStep>,
    /// Submission time.
    pub start_time: DateTime<Utc>,
    /// Set when a terminal status is reached.
    pub end_time: Option<DateTime<Utc>>,
    /// Failure or cancellation reason.
    pub error_message: Option<String>,
    /// Artifacts uploaded in the current attempt.
    pub artifacts_deployed: usize,
    /// Retries taken so far.
    pub retry_count: u32,
    /// Packages installed in the current attempt.
    pub dependencies_installed: Vec<String>,
}

impl DeploymentResult {
    /// Fresh pending result.
    pub fn new(deployment_id: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            status: DeploymentStatus::Pending,
            steps: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            error_message: None,
            artifacts_deployed: 0,
            retry_count: 0,
            dependencies_installed: Vec::new(),
        }
    }

    /// Move to a terminal status with an end time and optional message.
    pub fn finish(&mut self, status: DeploymentStatus, error_message: Option<String>) {
        self.status = status;
        self.error_message = error_message;
        self.end_time = Some(Utc::now());
    }

    /// Re-open a failed deployment for another attempt.
    pub fn reset_for_retry(&mut self) {
        self.status = DeploymentStatus::Pending;
        self.retry_count += 1;
        self.error_message = None;
        self.end_time = None;
        self.artifacts_deployed = 0;
        self.dependencies_installed.clear();
    }

    /// Wall-clock duration, once finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}
