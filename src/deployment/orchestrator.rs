//! # DeploymentOrchestrator
//!
//! ## Responsibility
//! Public submission, query, cancel, retry and rollback API, plus the
//! background dispatch loop that admits queued plans into the pipeline.
//!
//! ## Guarantees
//! - Two nested limits: at most `max_concurrent_per_env` pipelines per
//!   environment (ResourceManager) and `max_concurrent_deployments` overall
//!   (semaphore)
//! - Submission never blocks on execution
//! - Environment tokens are released when a pipeline task ends, even on panic
//! - Retry backoff sleeps outside the semaphore and is abandoned on `stop()`
//! - Every finished deployment ends in exactly one terminal status
//! - After `stop()` returns, nothing re-opens a deployment
//!
//! ## NOT Responsible For
//! - Stage bodies (see: `pipeline.rs`)
//! - Transport to environments (see: `environment.rs`)

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::environment::{EnvironmentProvider, ReadinessValidator};
use super::logger::{DeploymentLogger, DeploymentMetrics};
use super::pipeline::{Pipeline, PipelineOutcome, StageFailure};
use super::tracker::Tracker;
use super::types::{DeploymentPlan, DeploymentResult, DeploymentStatus, TestArtifact};
use crate::config::{validation, OrchestratorConfig};
use crate::scheduling::{DeploymentQueue, Priority, ResourceManager, RetryPolicy};
use crate::security::SecureArtifactHandler;
use crate::{metrics, DeployError};

/// Error message set on cancelled deployments.
pub const CANCELLED_MESSAGE: &str = "Deployment cancelled by user";
/// Error message set on rolled-back deployments.
pub const ROLLED_BACK_MESSAGE: &str = "Deployment rolled back";

struct Inner {
    config: OrchestratorConfig,
    queue: DeploymentQueue,
    resources: ResourceManager,
    slots: Arc<Semaphore>,
    tracker: Tracker,
    pipeline: Pipeline,
    logger: DeploymentLogger,
    policy: RetryPolicy,
    /// `true` from `stop()` until the next `start()`.
    stopping: watch::Sender<bool>,
    /// Automatic retries waiting out their backoff.
    retries: parking_lot::Mutex<JoinSet<()>>,
}

struct Running {
    handle: JoinHandle<()>,
}

/// Top-level coordinator.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio_deploy_orchestrator::deployment::simulated::{SimulatedEnvironments, SimulatedValidator};
/// use tokio_deploy_orchestrator::{
///     ArtifactType, DeploymentOrchestrator, OrchestratorConfig, Priority, TestArtifact,
/// };
///
/// # async fn demo() -> Result<(), tokio_deploy_orchestrator::DeployError> {
/// let orchestrator = DeploymentOrchestrator::new(
///     OrchestratorConfig::default(),
///     Arc::new(SimulatedEnvironments::new()),
///     Arc::new(SimulatedValidator::ready()),
///     None,
/// )
/// .await?;
/// orchestrator.start();
///
/// let script = TestArtifact::new("a1", "smoke.sh", ArtifactType::Script, b"echo ok".to_vec(), "/opt/smoke.sh");
/// let id = orchestrator.deploy("plan-1", "env-1", vec![script], Priority::High).await?;
/// println!("{:?}", orchestrator.status(&id).map(|r| r.status));
///
/// orchestrator.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct DeploymentOrchestrator {
    inner: Arc<Inner>,
    runtime: parking_lot::Mutex<Option<Running>>,
}

impl std::fmt::Debug for DeploymentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentOrchestrator")
            .field("running", &self.is_running())
            .field("queue_depth", &self.inner.queue.size())
            .finish()
    }
}

impl DeploymentOrchestrator {
    /// Build an orchestrator; the dispatch loop is not started.
    ///
    /// # Errors
    ///
    /// - [`DeployError::Config`] if `config` fails validation.
    /// - [`DeployError::Io`] if the log directory cannot be opened.
    pub async fn new(
        config: OrchestratorConfig,
        provider: Arc<dyn EnvironmentProvider>,
        validator: Arc<dyn ReadinessValidator>,
        security: Option<Arc<SecureArtifactHandler>>,
    ) -> Result<Self, DeployError> {
        validation::validate(&config).map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
            DeployError::Config(messages.join("; "))
        })?;

        let logger =
            DeploymentLogger::open(&config.logging.log_dir, config.logging.sanitize).await?;

        let inner = Inner {
            queue: DeploymentQueue::new(),
            resources: ResourceManager::new(config.scheduler.max_concurrent_per_env),
            slots: Arc::new(Semaphore::new(config.scheduler.max_concurrent_deployments)),
            tracker: Tracker::default(),
            pipeline: Pipeline::new(provider, validator, security),
            logger,
            policy: RetryPolicy::from_config(&config.retry),
            stopping: watch::channel(false).0,
            retries: parking_lot::Mutex::new(JoinSet::new()),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
            runtime: parking_lot::Mutex::new(None),
        })
    }

    /// Spawn the dispatch loop. No-op if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            debug!("dispatch loop already running");
            return;
        }
        self.inner.stopping.send_replace(false);
        let shutdown = self.inner.stopping.subscribe();
        let handle = tokio::spawn(dispatch_loop(self.inner.clone(), shutdown));
        *runtime = Some(Running { handle });
        info!(
            max_concurrent_deployments = self.inner.config.scheduler.max_concurrent_deployments,
            max_concurrent_per_env = self.inner.config.scheduler.max_concurrent_per_env,
            "orchestrator started"
        );
    }

    /// Stop the dispatch loop, abandon pending retries and cancel every
    /// non-terminal deployment.
    ///
    /// Safe to call repeatedly or before [`start`](Self::start).
    pub async fn stop(&self) {
        let running = self.runtime.lock().take();
        self.inner.stopping.send_replace(true);
        if let Some(Running { handle }) = running {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatch loop ended abnormally");
            }
        }

        // Backoff sleeps wake on the stop signal; wait for them to unwind.
        let mut retries = std::mem::take(&mut *self.inner.retries.lock());
        while let Some(joined) = retries.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "retry task ended abnormally");
            }
        }

        let active = self.inner.tracker.active_ids();
        let cancelled = active.len();
        for id in active {
            self.inner.cancel(&id).await;
        }
        info!(cancelled, "orchestrator stopped");
    }

    /// Returns `true` while the dispatch loop is running.
    pub fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Submit a plan built from the arguments. Returns the deployment id.
    ///
    /// # Errors
    ///
    /// [`DeployError::Validation`] for an empty id, environment or artifact
    /// list, or a duplicate id.
    pub async fn deploy(
        &self,
        plan_id: &str,
        environment_id: &str,
        artifacts: Vec<TestArtifact>,
        priority: Priority,
    ) -> Result<String, DeployError> {
        let plan = DeploymentPlan::new(plan_id, environment_id, artifacts).with_priority(priority);
        self.submit(plan).await
    }

    /// Submit a complete plan. Returns the deployment id.
    ///
    /// # Errors
    ///
    /// Same as [`deploy`](Self::deploy).
    pub async fn submit(&self, plan: DeploymentPlan) -> Result<String, DeployError> {
        if plan.plan_id.trim().is_empty() {
            return Err(DeployError::Validation("plan_id is required".into()));
        }
        if plan.environment_id.trim().is_empty() {
            return Err(DeployError::Validation("environment_id is required".into()));
        }
        if plan.test_artifacts.is_empty() {
            return Err(DeployError::Validation(
                "at least one test artifact is required".into(),
            ));
        }
        if !self.inner.tracker.insert(plan.clone()) {
            return Err(DeployError::Validation(format!(
                "deployment {} already exists",
                plan.plan_id
            )));
        }

        let id = plan.plan_id.clone();
        info!(
            deployment_id = %id,
            environment_id = %plan.environment_id,
            priority = %plan.deployment_config.priority,
            artifacts = plan.test_artifacts.len(),
            "deployment submitted"
        );
        if let Err(e) = self.inner.logger.log_start(&plan).await {
            warn!(deployment_id = %id, error = %e, "failed to log deployment start");
        }
        self.inner.queue.add(plan, None);
        metrics::set_queue_depth(self.inner.queue.size());
        Ok(id)
    }

    /// Snapshot of one deployment, `None` for unknown ids.
    pub fn status(&self, deployment_id: &str) -> Option<DeploymentResult> {
        self.inner.tracker.result(deployment_id)
    }

    /// Snapshot of every tracked deployment, oldest first.
    pub fn deployments(&self) -> Vec<DeploymentResult> {
        self.inner.tracker.results()
    }

    /// Returns `true` when every tracked deployment is terminal and no
    /// automatic retry is waiting out its backoff.
    pub fn is_settled(&self) -> bool {
        let mut retries = self.inner.retries.lock();
        while retries.try_join_next().is_some() {}
        retries.is_empty() && self.inner.tracker.active_ids().is_empty()
    }

    /// Live plans waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.size()
    }

    /// Tokens held per environment.
    pub fn resource_usage(&self) -> HashMap<String, usize> {
        self.inner.resources.usage_snapshot()
    }

    /// Aggregate counters from the logger.
    pub async fn metrics(&self) -> DeploymentMetrics {
        self.inner.logger.metrics().await
    }

    /// Event logger.
    pub fn logger(&self) -> &DeploymentLogger {
        &self.inner.logger
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Cancel a deployment that has not reached a terminal status.
    ///
    /// A stage already running finishes first; the pipeline stops at the
    /// next stage boundary.
    pub async fn cancel(&self, deployment_id: &str) -> bool {
        self.inner.cancel(deployment_id).await
    }

    /// Retry a failed deployment after its backoff delay.
    ///
    /// Returns `None` if the deployment is not failed, has used all retries,
    /// changed state while the delay elapsed, or the orchestrator was stopped.
    pub async fn retry(&self, deployment_id: &str) -> Option<String> {
        self.inner.retry(deployment_id).await
    }

    /// Remove a deployment's artifacts from its environment and mark it
    /// cancelled. Returns `false`, leaving the status untouched, on any failure.
    pub async fn rollback(&self, deployment_id: &str) -> bool {
        let Some(plan) = self.inner.tracker.plan(deployment_id) else {
            return false;
        };

        let connection = match self.inner.pipeline.open_connection(&plan).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(deployment_id, error = %e, "rollback could not connect");
                return false;
            }
        };

        let mut cleanup = Ok(());
        for artifact in &plan.test_artifacts {
            if let Err(e) = connection.remove_file(&artifact.target_path).await {
                cleanup = Err(e);
                break;
            }
        }
        let closed = connection.close().await;
        if let Err(e) = cleanup.and(closed) {
            warn!(deployment_id, error = %e, "rollback cleanup failed");
            return false;
        }

        let Some(result) = self.inner.tracker.force_finish(
            deployment_id,
            DeploymentStatus::Cancelled,
            Some(ROLLED_BACK_MESSAGE.into()),
        ) else {
            return false;
        };
        self.inner.queue.remove(deployment_id);
        metrics::set_queue_depth(self.inner.queue.size());
        metrics::inc_deployment("rolled_back");
        self.inner.record_end(&result).await;
        info!(deployment_id, "deployment rolled back");
        true
    }
}

impl Inner {
    async fn cancel(&self, deployment_id: &str) -> bool {
        let Some(result) = self.tracker.finish_if_active(
            deployment_id,
            DeploymentStatus::Cancelled,
            Some(CANCELLED_MESSAGE.into()),
        ) else {
            return false;
        };
        self.queue.remove(deployment_id);
        metrics::set_queue_depth(self.queue.size());
        metrics::inc_deployment("cancelled");
        self.record_end(&result).await;
        info!(deployment_id, "deployment cancelled");
        true
    }

    fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    async fn retry(&self, deployment_id: &str) -> Option<String> {
        if self.is_stopping() {
            debug!(deployment_id, "retry refused, orchestrator stopping");
            return None;
        }
        let result = self.tracker.result(deployment_id)?;
        if result.status != DeploymentStatus::Failed || !self.policy.allows(result.retry_count) {
            debug!(
                deployment_id,
                status = %result.status,
                retry_count = result.retry_count,
                "retry not applicable"
            );
            return None;
        }

        self.retry_after_backoff(deployment_id, result.retry_count).await
    }

    /// Sleep the backoff for `expected_retries`, then re-open and re-queue
    /// the deployment if it is still failed at that count.
    async fn retry_after_backoff(&self, deployment_id: &str, expected_retries: u32) -> Option<String> {
        let delay = self.policy.delay_for(expected_retries);
        info!(
            deployment_id,
            retry_count = expected_retries,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        let mut stopping = self.stopping.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_signalled(&mut stopping) => {
                info!(deployment_id, "retry abandoned, orchestrator stopping");
                return None;
            }
        }

        let (plan, retry_count) = self.tracker.reopen_for_retry(
            deployment_id,
            expected_retries,
            || self.is_stopping(),
        )?;
        if let Err(e) = self.logger.log_retry(deployment_id, retry_count, delay).await {
            warn!(deployment_id, error = %e, "failed to log retry");
        }
        metrics::inc_retry();
        self.queue.add(plan, None);
        metrics::set_queue_depth(self.queue.size());
        info!(deployment_id, retry_count, "deployment re-queued");
        Some(deployment_id.to_string())
    }

    async fn execute(self: Arc<Self>, plan: DeploymentPlan) {
        let id = plan.plan_id.clone();
        debug!(deployment_id = %id, environment_id = %plan.environment_id, "pipeline admitted");

        match self.pipeline.run(&plan, &self.tracker).await {
            Ok(PipelineOutcome::Completed) => {
                let Some(result) =
                    self.tracker
                        .finish_if_active(&id, DeploymentStatus::Completed, None)
                else {
                    return;
                };
                metrics::inc_deployment("completed");
                self.record_end(&result).await;
                info!(
                    deployment_id = %id,
                    retry_count = result.retry_count,
                    artifacts = result.artifacts_deployed,
                    "deployment completed"
                );
            }
            Ok(PipelineOutcome::Cancelled) => {
                debug!(deployment_id = %id, "pipeline observed cancellation");
            }
            Err(StageFailure { stage, error }) => {
                let retryable = error.is_retryable();
                let Some(result) = self.tracker.finish_if_active(
                    &id,
                    DeploymentStatus::Failed,
                    Some(error.to_string()),
                ) else {
                    return;
                };
                metrics::inc_deployment("failed");
                self.record_end(&result).await;

                if retryable && self.policy.allows(result.retry_count) && !self.is_stopping() {
                    info!(
                        deployment_id = %id,
                        stage = %stage,
                        retry_count = result.retry_count,
                        "deployment failed, scheduling automatic retry"
                    );
                    self.spawn_retry(id, result.retry_count);
                } else {
                    warn!(
                        deployment_id = %id,
                        stage = %stage,
                        retry_count = result.retry_count,
                        error = %error,
                        "deployment failed permanently"
                    );
                }
            }
        }
    }

    fn spawn_retry(self: &Arc<Self>, deployment_id: String, expected_retries: u32) {
        let inner = Arc::clone(self);
        let mut retries = self.retries.lock();
        while retries.try_join_next().is_some() {}
        retries.spawn(async move {
            inner.retry_after_backoff(&deployment_id, expected_retries).await;
        });
    }

    async fn record_end(&self, result: &DeploymentResult) {
        if let Err(e) = self.logger.log_end(result).await {
            warn!(deployment_id = %result.deployment_id, error = %e, "failed to log deployment end");
        }
    }
}

/// Resolves once `stopping` holds `true`.
async fn stop_signalled(stopping: &mut watch::Receiver<bool>) {
    loop {
        if *stopping.borrow_and_update() {
            return;
        }
        if stopping.changed().await.is_err() {
            return;
        }
    }
}

/// Pop, admit, execute. Runs until shutdown is signalled.
async fn dispatch_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let idle = inner.config.scheduler.idle_poll();
    let backoff = inner.config.scheduler.contention_backoff();
    info!("dispatch loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let Some((priority, plan)) = inner.queue.pop() else {
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };
        metrics::set_queue_depth(inner.queue.size());

        if inner
            .tracker
            .status(&plan.plan_id)
            .map_or(true, DeploymentStatus::is_terminal)
        {
            debug!(deployment_id = %plan.plan_id, "skipping inactive deployment");
            continue;
        }

        let Some(token) = inner.resources.try_token(&plan.environment_id) else {
            let demoted = priority.demoted();
            debug!(
                deployment_id = %plan.plan_id,
                environment_id = %plan.environment_id,
                priority = %demoted,
                "environment at capacity, re-queued"
            );
            inner.queue.add(plan, Some(demoted));
            metrics::set_queue_depth(inner.queue.size());
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        let permit = tokio::select! {
            permit = inner.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    inner.queue.add(plan, Some(priority));
                    break;
                }
            },
            _ = shutdown.changed() => {
                inner.queue.add(plan, Some(priority));
                break;
            }
        };

        let task = inner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _token = token;
            task.execute(plan).await;
        });
    }

    metrics::set_queue_depth(inner.queue.size());
    info!("dispatch loop stopped");
}
