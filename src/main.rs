//! Demo binary for tokio-deploy-orchestrator
//!
//! Runs a handful of deployments against a simulated two-environment fleet,
//! one of which drops its first connection attempt, then prints the final
//! statuses and metrics.
//!
//! ## Usage
//!
//! ```text
//! tokio-deploy-orchestrator [--config orchestrator.toml]
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter (default: info)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_deploy_orchestrator::config::loader;
use tokio_deploy_orchestrator::deployment::simulated::{SimulatedEnvironments, SimulatedValidator};
use tokio_deploy_orchestrator::{
    init_tracing, metrics, AccessControlManager, AccessControlRule, ArtifactType,
    CredentialManager, DeploymentOrchestrator, DeploymentPlan, EncryptionManager,
    OrchestratorConfig, Permission, Priority, SecureArtifactHandler, SecurityLevel, TestArtifact,
};
use tracing::info;

fn config_path() -> Result<Option<PathBuf>, String> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => Ok(None),
        Some("--config") => args
            .next()
            .map(|p| Some(PathBuf::from(p)))
            .ok_or_else(|| "--config requires a path".to_string()),
        Some(other) => Err(format!("unknown argument: {other}")),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A subscriber may already be installed by the embedding environment.
    let _ = init_tracing();
    metrics::init_metrics()?;

    let config = match config_path()? {
        Some(path) => loader::load_from_file(&path)?,
        None => {
            let mut config = OrchestratorConfig::default();
            // Keep the demo short.
            config.retry.base_delay_ms = 200;
            config
        }
    };

    info!("Starting tokio-deploy-orchestrator demo");

    // Security layer
    let encryption = Arc::new(EncryptionManager::generate());
    let credentials = Arc::new(CredentialManager::new(encryption.clone(), &config.security));
    let access = Arc::new(AccessControlManager::new());
    let security = Arc::new(SecureArtifactHandler::new(encryption, credentials.clone(), access.clone()));

    let credential_id = credentials.store("env-b", "ssh_key", b"demo-private-key", None)?;
    access.add_rule(
        AccessControlRule::new(credential_id.clone(), "alice", [Permission::Read])
            .restricted_to(["env-b"]),
    )?;

    // Simulated fleet: env-b drops the first connection attempt.
    let fleet = SimulatedEnvironments::with_latency(Duration::from_millis(20));
    fleet.fail_connections("env-b", 1);

    let orchestrator = DeploymentOrchestrator::new(
        config,
        Arc::new(fleet.clone()),
        Arc::new(SimulatedValidator::ready()),
        Some(security.clone()),
    )
    .await?;
    orchestrator.start();

    let mut ids = Vec::new();
    for (i, priority) in [Priority::Low, Priority::Critical, Priority::Normal, Priority::High]
        .into_iter()
        .enumerate()
    {
        let script = TestArtifact::new(
            format!("smoke-{i}"),
            "smoke.sh",
            ArtifactType::Script,
            format!("#!/bin/sh\necho smoke {i}\n").into_bytes(),
            format!("/opt/tests/smoke-{i}.sh"),
        )
        .with_dependencies(["curl"]);
        ids.push(orchestrator.deploy(&format!("demo-a-{i}"), "env-a", vec![script], priority).await?);
    }

    let config_artifact = TestArtifact::new(
        "bench-config",
        "bench.conf",
        ArtifactType::Config,
        b"iterations=10\napi_token=demo\n".to_vec(),
        "/etc/bench.conf",
    );
    let secured = security.secure(config_artifact, SecurityLevel::Confidential, "alice")?;
    let plan = DeploymentPlan::new("demo-b-0", "env-b", vec![secured])
        .requested_by("alice")
        .with_credential(credential_id)
        .with_priority(Priority::High)
        .with_instrumentation(serde_json::json!({"tracing": true, "sample_rate": 0.1}));
    ids.push(orchestrator.submit(plan).await?);

    info!(count = ids.len(), "All deployments submitted");

    // Settled: every deployment terminal and no retry waiting out its backoff.
    for _ in 0..100 {
        if orchestrator.is_settled() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    orchestrator.stop().await;

    for result in orchestrator.deployments() {
        info!(
            deployment_id = %result.deployment_id,
            status = %result.status,
            retries = result.retry_count,
            steps = result.steps.len(),
            error = result.error_message.as_deref().unwrap_or(""),
            "Deployment finished"
        );
    }

    let summary = orchestrator.metrics().await;
    info!(
        total = summary.total_deployments,
        successful = summary.successful_deployments,
        failed = summary.failed_deployments,
        cancelled = summary.cancelled_deployments,
        retries = summary.retry_count,
        avg_secs = summary.average_duration_secs,
        "Deployment metrics"
    );

    println!("\n{}", metrics::gather());

    Ok(())
}
