//! # tokio-deploy-orchestrator
//!
//! Schedules and executes deployments of test artifacts (scripts, configs,
//! binaries) onto a pool of remote test environments over Tokio.
//!
//! ## Architecture
//!
//! ```text
//! deploy() ──► DeploymentQueue (priority, FIFO within level, lazy deletion)
//!                   │
//!             dispatch loop ──► ResourceManager (per-environment tokens)
//!                   │                 │ denied → re-queue one level worse
//!                   ▼                 ▼ granted
//!             global semaphore ──► Pipeline
//!                                    artifact_preparation
//!                                    environment_connection
//!                                    dependency_installation
//!                                    script_deployment
//!                                    instrumentation_setup
//!                                    readiness_validation
//! ```
//!
//! Artifact access is gated by the [`security`] layer, and every lifecycle
//! event is appended to a per-deployment JSON log by
//! [`deployment::DeploymentLogger`].

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod deployment;
pub mod metrics;
pub mod scheduling;
pub mod security;

// Re-exports for convenience
pub use config::OrchestratorConfig;
pub use deployment::{
    ArtifactType, DeploymentLogger, DeploymentOrchestrator, DeploymentPlan, DeploymentResult,
    DeploymentStatus, DeploymentStep, TestArtifact,
};
pub use scheduling::{DeploymentQueue, Priority, ResourceManager, RetryPolicy};
pub use security::{
    AccessControlManager, AccessControlRule, CredentialManager, EncryptionManager, Permission,
    SecureArtifactHandler, SecurityError, SecurityLevel,
};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`DeployError::Config`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), DeployError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| DeployError::Config(format!("tracing init failed: {e}")))
}

/// Top-level deployment errors.
///
/// Capacity refusals from the [`ResourceManager`] are deliberately absent:
/// they re-queue the plan and never reach a caller.
#[derive(Error, Debug)]
pub enum DeployError {
    /// Missing or invalid submission parameters; rejected before enqueue.
    #[error("validation error: {0}")]
    Validation(String),

    /// Declared and recomputed artifact checksums disagree.
    #[error("checksum mismatch for artifact {artifact_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Artifact whose content failed verification.
        artifact_id: String,
        /// Checksum declared on the artifact.
        expected: String,
        /// Checksum recomputed from the content.
        actual: String,
    },

    /// The target environment could not be reached.
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// Readiness validation failed and recovery did not fix it.
    #[error("readiness failure: {0}")]
    Readiness(String),

    /// An access-control check refused the artifact or operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A pipeline stage failed for a reason not covered above.
    #[error("stage {stage} failed: {message}")]
    Stage {
        /// Stage identifier.
        stage: String,
        /// Failure description from the collaborator.
        message: String,
    },

    /// Referenced deployment does not exist.
    #[error("deployment not found: {0}")]
    NotFound(String),

    /// Error raised by the security layer.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Filesystem I/O error (deployment logs, metrics).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration or initialisation error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DeployError {
    /// Returns `true` if an automatic retry may fix this failure.
    ///
    /// Bad submissions, corrupt content (checksum or authentication tag),
    /// refused permissions and missing credentials are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_)
                | Self::ChecksumMismatch { .. }
                | Self::PermissionDenied(_)
                | Self::Security(
                    SecurityError::PermissionDenied(_)
                        | SecurityError::Decryption(_)
                        | SecurityError::CredentialNotFound(_)
                )
        )
    }

    /// Short machine-readable name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::Connectivity(_) => "connectivity",
            Self::Readiness(_) => "readiness",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Stage { .. } => "stage",
            Self::NotFound(_) => "not_found",
            Self::Security(_) => "security",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Config(_) => "config",
        }
    }
}
