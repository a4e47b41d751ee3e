//! Registry of tracked deployments.
//!
//! Owns every [`DeploymentResult`] together with the plan it executes. All
//! state changes go through here so the transition rules live in one place.
//! The lock is synchronous and never held across an `.await`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::pipeline::Stage;
use super::types::{DeploymentPlan, DeploymentResult, DeploymentStatus, DeploymentStep};

struct Tracked {
    plan: DeploymentPlan,
    result: DeploymentResult,
}

/// Shared handle; clones see the same deployments.
#[derive(Clone, Default)]
pub(crate) struct Tracker {
    inner: Arc<RwLock<HashMap<String, Tracked>>>,
}

impl Tracker {
    /// Register a new deployment. Returns `false` if the id is taken.
    pub(crate) fn insert(&self, plan: DeploymentPlan) -> bool {
        let mut map = self.inner.write();
        if map.contains_key(&plan.plan_id) {
            return false;
        }
        let result = DeploymentResult::new(plan.plan_id.clone());
        map.insert(plan.plan_id.clone(), Tracked { plan, result });
        true
    }

    pub(crate) fn result(&self, id: &str) -> Option<DeploymentResult> {
        self.inner.read().get(id).map(|t| t.result.clone())
    }

    pub(crate) fn status(&self, id: &str) -> Option<DeploymentStatus> {
        self.inner.read().get(id).map(|t| t.result.status)
    }

    pub(crate) fn plan(&self, id: &str) -> Option<DeploymentPlan> {
        self.inner.read().get(id).map(|t| t.plan.clone())
    }

    /// Snapshot of every result, oldest first.
    pub(crate) fn results(&self) -> Vec<DeploymentResult> {
        let mut all: Vec<DeploymentResult> =
            self.inner.read().values().map(|t| t.result.clone()).collect();
        all.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        all
    }

    /// Ids of deployments not yet in a terminal status.
    pub(crate) fn active_ids(&self) -> Vec<String> {
        self.inner
            .read()
            .iter()
            .filter(|(_, t)| !t.result.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Enter `stage`: set its status and append a running step.
    ///
    /// Returns the step index, or `None` if the deployment is gone or
    /// already terminal (cancelled while the previous stage ran).
    pub(crate) fn begin_stage(&self, id: &str, stage: Stage) -> Option<usize> {
        let mut map = self.inner.write();
        let result = &mut map.get_mut(id)?.result;
        if result.status.is_terminal() {
            return None;
        }
        result.status = stage.target_status();
        let step_id = format!("{id}-{stage}-{}", result.retry_count + 1);
        result.steps.push(DeploymentStep::start(step_id, stage.as_str()));
        Some(result.steps.len() - 1)
    }

    /// Close the step at `index` with its outcome.
    pub(crate) fn end_step(
        &self,
        id: &str,
        index: usize,
        outcome: Result<HashMap<String, serde_json::Value>, String>,
    ) {
        let mut map = self.inner.write();
        let Some(step) = map
            .get_mut(id)
            .and_then(|t| t.result.steps.get_mut(index))
        else {
            return;
        };
        match outcome {
            Ok(details) => {
                step.details.extend(details);
                step.complete();
            }
            Err(message) => step.fail(message),
        }
    }

    /// Apply `f` to the result of `id`.
    pub(crate) fn update<R>(&self, id: &str, f: impl FnOnce(&mut DeploymentResult) -> R) -> Option<R> {
        self.inner.write().get_mut(id).map(|t| f(&mut t.result))
    }

    /// Move to terminal `status` if the state machine allows it.
    ///
    /// Returns the finished result, or `None` if the deployment is unknown or
    /// already terminal.
    pub(crate) fn finish_if_active(
        &self,
        id: &str,
        status: DeploymentStatus,
        message: Option<String>,
    ) -> Option<DeploymentResult> {
        let mut map = self.inner.write();
        let result = &mut map.get_mut(id)?.result;
        let allowed = match status {
            // Completion is only reachable from the last stage.
            DeploymentStatus::Completed => result.status == DeploymentStatus::Validating,
            _ => result.status.can_transition_to(status),
        };
        if !allowed {
            return None;
        }
        result.finish(status, message);
        Some(result.clone())
    }

    /// Set terminal `status` regardless of the current one (rollback).
    pub(crate) fn force_finish(
        &self,
        id: &str,
        status: DeploymentStatus,
        message: Option<String>,
    ) -> Option<DeploymentResult> {
        let mut map = self.inner.write();
        let result = &mut map.get_mut(id)?.result;
        result.finish(status, message);
        Some(result.clone())
    }

    /// Re-open a failed deployment whose retry count is still
    /// `expected_retries`. Returns the plan to re-enqueue and the new count.
    ///
    /// `halted` is evaluated under the registry lock; when it returns `true`
    /// nothing is re-opened.
    pub(crate) fn reopen_for_retry(
        &self,
        id: &str,
        expected_retries: u32,
        halted: impl FnOnce() -> bool,
    ) -> Option<(DeploymentPlan, u32)> {
        let mut map = self.inner.write();
        let tracked = map.get_mut(id)?;
        if halted()
            || tracked.result.status != DeploymentStatus::Failed
            || tracked.result.retry_count != expected_retries
        {
            return None;
        }
        tracked.result.reset_for_retry();
        Some((tracked.plan.clone(), tracked.result.retry_count))
    }
}
