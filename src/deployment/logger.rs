//! # Deployment event log
//!
//! ## Responsibility
//! Append one JSON record per lifecycle event (`deployment_start`,
//! `retry_attempt`, `deployment_end`) to `<log_dir>/<deployment_id>.jsonl`,
//! and keep aggregate counters in `<log_dir>/metrics.json`.
//!
//! ## Guarantees
//! - Records are one JSON object per line: `{timestamp, event, deployment_id, ...}`
//! - Counters are reloaded on [`DeploymentLogger::open`], so restarts keep history
//! - Each deployment is counted in at most one outcome bucket; a later
//!   outcome for the same id (retry, rollback) replaces the earlier one
//! - The running average covers successful deployments only
//!
//! ## NOT Responsible For
//! - Rendering or rotating logs

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::types::{DeploymentPlan, DeploymentResult, DeploymentStatus};
use crate::DeployError;

const METRICS_FILE: &str = "metrics.json";
const REDACTED: &str = "[REDACTED]";

/// Rewrites a record before it is persisted.
pub trait LogSanitizer: Send + Sync {
    /// Scrub `record` in place.
    fn sanitize(&self, record: &mut Value);
}

/// Replaces the value of every object key that looks secret.
#[derive(Debug, Clone)]
pub struct RedactingSanitizer {
    markers: Vec<String>,
}

impl Default for RedactingSanitizer {
    fn default() -> Self {
        Self::with_markers(["password", "secret", "token", "key", "credential", "certificate"])
    }
}

impl RedactingSanitizer {
    /// Redact keys containing any of `markers` (case-insensitive).
    pub fn with_markers<S: Into<String>>(markers: impl IntoIterator<Item = S>) -> Self {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.into().to_lowercase())
                .collect(),
        }
    }

    fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.markers.iter().any(|m| key.contains(m.as_str()))
    }
}

impl LogSanitizer for RedactingSanitizer {
    fn sanitize(&self, record: &mut Value) {
        match record {
            Value::Object(map) => {
                for (key, value) in map.iter_mut() {
                    if self.is_sensitive_key(key) {
                        *value = Value::String(REDACTED.into());
                    } else {
                        self.sanitize(value);
                    }
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|v| self.sanitize(v)),
            _ => {}
        }
    }
}

/// Aggregate counters persisted in `metrics.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentMetrics {
    /// Deployments submitted.
    pub total_deployments: u64,
    /// Deployments whose latest outcome is `completed`.
    pub successful_deployments: u64,
    /// Deployments whose latest outcome is `failed`.
    pub failed_deployments: u64,
    /// Deployments whose latest outcome is `cancelled`.
    pub cancelled_deployments: u64,
    /// Retry attempts started.
    pub retry_count: u64,
    /// Mean duration of successful deployments, seconds.
    pub average_duration_secs: f64,
}

impl DeploymentMetrics {
    fn count(&mut self, status: DeploymentStatus, duration_secs: f64) {
        match status {
            DeploymentStatus::Completed => {
                self.successful_deployments += 1;
                let n = self.successful_deployments as f64;
                self.average_duration_secs =
                    (self.average_duration_secs * (n - 1.0) + duration_secs) / n;
            }
            DeploymentStatus::Failed => self.failed_deployments += 1,
            DeploymentStatus::Cancelled => self.cancelled_deployments += 1,
            _ => {}
        }
    }

    fn retract(&mut self, status: DeploymentStatus, duration_secs: f64) {
        match status {
            DeploymentStatus::Completed => {
                let before = self.successful_deployments as f64;
                self.successful_deployments = self.successful_deployments.saturating_sub(1);
                let n = self.successful_deployments as f64;
                self.average_duration_secs = if n == 0.0 {
                    0.0
                } else {
                    (self.average_duration_secs * before - duration_secs) / n
                };
            }
            DeploymentStatus::Failed => {
                self.failed_deployments = self.failed_deployments.saturating_sub(1)
            }
            DeploymentStatus::Cancelled => {
                self.cancelled_deployments = self.cancelled_deployments.saturating_sub(1)
            }
            _ => {}
        }
    }
}

struct LoggerState {
    metrics: DeploymentMetrics,
    outcomes: HashMap<String, (DeploymentStatus, f64)>,
}

/// Append-only event log with aggregate metrics.
pub struct DeploymentLogger {
    log_dir: PathBuf,
    sanitizer: Option<Box<dyn LogSanitizer>>,
    state: Mutex<LoggerState>,
}

impl std::fmt::Debug for DeploymentLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentLogger")
            .field("log_dir", &self.log_dir)
            .field("sanitize", &self.sanitizer.is_some())
            .finish()
    }
}

impl DeploymentLogger {
    /// Open (creating if needed) `log_dir` and reload saved metrics.
    ///
    /// A corrupt `metrics.json` is logged and replaced by zeroed counters.
    /// With `sanitize`, records pass through a [`RedactingSanitizer`].
    ///
    /// # Errors
    ///
    /// [`DeployError::Io`] if the directory cannot be created or read.
    pub async fn open(log_dir: impl Into<PathBuf>, sanitize: bool) -> Result<Self, DeployError> {
        let log_dir = log_dir.into();
        tokio::fs::create_dir_all(&log_dir).await?;

        let metrics = match tokio::fs::read(log_dir.join(METRICS_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %log_dir.display(), error = %e, "unreadable metrics file, starting from zero");
                DeploymentMetrics::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DeploymentMetrics::default(),
            Err(e) => return Err(e.into()),
        };

        let sanitizer: Option<Box<dyn LogSanitizer>> = if sanitize {
            Some(Box::new(RedactingSanitizer::default()))
        } else {
            None
        };

        Ok(Self {
            log_dir,
            sanitizer,
            state: Mutex::new(LoggerState {
                metrics,
                outcomes: HashMap::new(),
            }),
        })
    }

    /// Replace the sanitizer.
    pub fn with_sanitizer(mut self, sanitizer: impl LogSanitizer + 'static) -> Self {
        self.sanitizer = Some(Box::new(sanitizer));
        self
    }

    /// Directory holding the logs.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Current counters.
    pub async fn metrics(&self) -> DeploymentMetrics {
        self.state.lock().await.metrics.clone()
    }

    /// Record a submission.
    pub async fn log_start(&self, plan: &DeploymentPlan) -> Result<(), DeployError> {
        let artifacts: Vec<&str> = plan
            .test_artifacts
            .iter()
            .map(|a| a.artifact_id.as_str())
            .collect();
        let fields = json!({
            "environment_id": plan.environment_id,
            "priority": plan.deployment_config.priority,
            "artifacts": artifacts,
            "dependencies": plan.all_dependencies(),
            "requested_by": plan.requested_by,
            "instrumentation_config": plan.instrumentation_config,
        });

        let mut state = self.state.lock().await;
        state.metrics.total_deployments += 1;
        self.append(&plan.plan_id, "deployment_start", fields).await?;
        self.persist(&state.metrics).await
    }

    /// Record a retry attempt; the deployment's previous outcome is withdrawn.
    pub async fn log_retry(
        &self,
        deployment_id: &str,
        retry_count: u32,
        delay: Duration,
    ) -> Result<(), DeployError> {
        let fields = json!({
            "retry_count": retry_count,
            "delay_ms": delay.as_millis() as u64,
        });

        let mut state = self.state.lock().await;
        state.metrics.retry_count += 1;
        if let Some((status, duration)) = state.outcomes.remove(deployment_id) {
            state.metrics.retract(status, duration);
        }
        self.append(deployment_id, "retry_attempt", fields).await?;
        self.persist(&state.metrics).await
    }

    /// Record a terminal outcome, replacing any earlier one for this id.
    pub async fn log_end(&self, result: &DeploymentResult) -> Result<(), DeployError> {
        let duration_secs = result
            .duration()
            .map_or(0.0, |d| d.num_milliseconds().max(0) as f64 / 1000.0);
        let steps: Vec<Value> = result
            .steps
            .iter()
            .map(|s| json!({"name": s.name, "status": s.status}))
            .collect();
        let fields = json!({
            "status": result.status,
            "error_message": result.error_message,
            "duration_secs": duration_secs,
            "artifacts_deployed": result.artifacts_deployed,
            "retry_count": result.retry_count,
            "steps": steps,
        });

        let mut state = self.state.lock().await;
        let LoggerState { metrics, outcomes } = &mut *state;
        if let Some((status, duration)) = outcomes.remove(&result.deployment_id) {
            metrics.retract(status, duration);
        }
        if result.status.is_terminal() {
            metrics.count(result.status, duration_secs);
            outcomes.insert(result.deployment_id.clone(), (result.status, duration_secs));
        }
        self.append(&result.deployment_id, "deployment_end", fields).await?;
        self.persist(&state.metrics).await
    }

    /// All records for `deployment_id`, oldest first. Empty if none exist.
    pub async fn read_log(&self, deployment_id: &str) -> Result<Vec<Value>, DeployError> {
        let content = match tokio::fs::read_to_string(self.log_path(deployment_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(DeployError::from))
            .collect()
    }

    fn log_path(&self, deployment_id: &str) -> PathBuf {
        let file: String = deployment_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.log_dir.join(format!("{file}.jsonl"))
    }

    async fn append(&self, deployment_id: &str, event: &str, fields: Value) -> Result<(), DeployError> {
        let mut record = Map::new();
        record.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        record.insert("event".into(), json!(event));
        record.insert("deployment_id".into(), json!(deployment_id));
        if let Value::Object(extra) = fields {
            record.extend(extra);
        }
        let mut record = Value::Object(record);
        if let Some(sanitizer) = &self.sanitizer {
            sanitizer.sanitize(&mut record);
        }

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(deployment_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        debug!(deployment_id, event, "deployment event logged");
        Ok(())
    }

    async fn persist(&self, metrics: &DeploymentMetrics) -> Result<(), DeployError> {
        let bytes = serde_json::to_vec_pretty(metrics)?;
        tokio::fs::write(self.log_dir.join(METRICS_FILE), bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{ArtifactType, TestArtifact};

    fn plan(id: &str) -> DeploymentPlan {
        let artifact = TestArtifact::new("a1", "run.sh", ArtifactType::Script, b"echo".to_vec(), "/opt/run.sh");
        DeploymentPlan::new(id, "env-1", vec![artifact])
    }

    fn finished(id: &str, status: DeploymentStatus, secs: i64) -> DeploymentResult {
        let mut result = DeploymentResult::new(id);
        result.finish(status, None);
        result.end_time = Some(result.start_time + chrono::Duration::seconds(secs));
        result
    }

    #[tokio::test]
    async fn test_events_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DeploymentLogger::open(dir.path(), true).await.unwrap();

        logger.log_start(&plan("d1")).await.unwrap();
        logger
            .log_end(&finished("d1", DeploymentStatus::Completed, 4))
            .await
            .unwrap();

        let records = logger.read_log("d1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["event"], "deployment_start");
        assert_eq!(records[0]["deployment_id"], "d1");
        assert_eq!(records[0]["environment_id"], "env-1");
        assert!(records[0]["timestamp"].is_string());
        assert_eq!(records[1]["event"], "deployment_end");
        assert_eq!(records[1]["status"], "completed");
    }

    #[tokio::test]
    async fn test_average_duration_over_successes_only() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DeploymentLogger::open(dir.path(), false).await.unwrap();

        logger.log_end(&finished("a", DeploymentStatus::Completed, 10)).await.unwrap();
        logger.log_end(&finished("b", DeploymentStatus::Failed, 100)).await.unwrap();
        logger.log_end(&finished("c", DeploymentStatus::Completed, 20)).await.unwrap();

        let metrics = logger.metrics().await;
        assert_eq!(metrics.successful_deployments, 2);
        assert_eq!(metrics.failed_deployments, 1);
        assert!((metrics.average_duration_secs - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_retry_withdraws_previous_failure() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DeploymentLogger::open(dir.path(), false).await.unwrap();

        logger.log_start(&plan("d1")).await.unwrap();
        logger.log_end(&finished("d1", DeploymentStatus::Failed, 1)).await.unwrap();
        logger.log_retry("d1", 1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(logger.metrics().await.failed_deployments, 0);

        logger.log_end(&finished("d1", DeploymentStatus::Completed, 3)).await.unwrap();
        let metrics = logger.metrics().await;
        assert_eq!(metrics.total_deployments, 1);
        assert_eq!(metrics.retry_count, 1);
        assert_eq!(metrics.failed_deployments, 0);
        assert_eq!(metrics.successful_deployments, 1);
    }

    #[tokio::test]
    async fn test_later_outcome_replaces_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DeploymentLogger::open(dir.path(), false).await.unwrap();

        logger.log_end(&finished("a", DeploymentStatus::Completed, 10)).await.unwrap();
        logger.log_end(&finished("b", DeploymentStatus::Completed, 30)).await.unwrap();
        logger.log_end(&finished("b", DeploymentStatus::Cancelled, 30)).await.unwrap();

        let metrics = logger.metrics().await;
        assert_eq!(metrics.successful_deployments, 1);
        assert_eq!(metrics.cancelled_deployments, 1);
        assert!((metrics.average_duration_secs - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_metrics_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let logger = DeploymentLogger::open(dir.path(), false).await.unwrap();
            logger.log_start(&plan("d1")).await.unwrap();
            logger.log_end(&finished("d1", DeploymentStatus::Completed, 2)).await.unwrap();
        }
        let reopened = DeploymentLogger::open(dir.path(), false).await.unwrap();
        let metrics = reopened.metrics().await;
        assert_eq!(metrics.total_deployments, 1);
        assert_eq!(metrics.successful_deployments, 1);
    }

    #[tokio::test]
    async fn test_corrupt_metrics_file_falls_back_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METRICS_FILE), b"{not json").unwrap();
        let logger = DeploymentLogger::open(dir.path(), false).await.unwrap();
        assert_eq!(logger.metrics().await, DeploymentMetrics::default());
    }

    #[tokio::test]
    async fn test_missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DeploymentLogger::open(dir.path(), false).await.unwrap();
        assert!(logger.read_log("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sanitizer_redacts_secret_keys_in_records() {
        let dir = tempfile::tempdir().unwrap();
        let logger = DeploymentLogger::open(dir.path(), true).await.unwrap();
        let plan = plan("d1").with_instrumentation(json!({
            "endpoint": "collector:4317",
            "auth": {"api_token": "abc123"},
        }));
        logger.log_start(&plan).await.unwrap();

        let record = &logger.read_log("d1").await.unwrap()[0];
        assert_eq!(record["instrumentation_config"]["endpoint"], "collector:4317");
        assert_eq!(record["instrumentation_config"]["auth"]["api_token"], REDACTED);
    }

    #[test]
    fn test_redacting_sanitizer_walks_arrays() {
        let mut value = json!([{"password": "x"}, {"name": "ok"}]);
        RedactingSanitizer::default().sanitize(&mut value);
        assert_eq!(value[0]["password"], REDACTED);
        assert_eq!(value[1]["name"], "ok");
    }

    #[test]
    fn test_unsafe_ids_mapped_to_file_names() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let logger = rt.block_on(DeploymentLogger::open(dir.path(), false)).unwrap();
        let path = logger.log_path("../etc/passwd");
        assert_eq!(path, dir.path().join(".._etc_passwd.jsonl"));
    }
}
