//! Deployment execution: data model, collaborator traits, pipeline, event
//! log and the orchestrator that ties them together.

pub mod environment;
pub mod logger;
pub mod orchestrator;
pub mod pipeline;
pub mod simulated;
pub mod types;

mod tracker;

pub use environment::{
    ConnectionConfig, EnvironmentConnection, EnvironmentManager, EnvironmentProvider,
    ReadinessValidator, ValidationReport,
};
pub use logger::{DeploymentLogger, DeploymentMetrics, LogSanitizer, RedactingSanitizer};
pub use orchestrator::DeploymentOrchestrator;
pub use pipeline::Stage;
pub use types::{
    content_checksum, ArtifactType, DeploymentConfig, DeploymentPlan, DeploymentResult,
    DeploymentStatus, DeploymentStep, StepStatus, TestArtifact,
};
