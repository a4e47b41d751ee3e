//! Prometheus metrics for the deployment orchestrator.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup before starting an
//! orchestrator. The helper functions (`record_stage_latency`,
//! `inc_deployment`, …) are no-ops if `init_metrics` was never called, so
//! deployments always run; observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `deploy_orchestrator_deployments_total` | Counter | `outcome` |
//! | `deploy_orchestrator_stage_duration_seconds` | Histogram | `stage` |
//! | `deploy_orchestrator_stage_errors_total` | Counter | `stage`, `kind` |
//! | `deploy_orchestrator_queue_depth` | Gauge | |
//! | `deploy_orchestrator_environment_usage` | Gauge | `environment` |
//! | `deploy_orchestrator_retries_total` | Counter | |

use crate::DeployError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All orchestrator metrics, stored together in a single [`OnceLock`].
pub struct Metrics {
    /// Registry that owns every descriptor below.
    pub registry: Registry,
    /// Finished deployments by outcome (`completed`, `failed`, `cancelled`).
    pub deployments_total: CounterVec,
    /// Stage latency histogram.
    pub stage_duration: HistogramVec,
    /// Stage failures by stage and error kind.
    pub stage_errors: CounterVec,
    /// Live entries in the deployment queue.
    pub queue_depth: IntGauge,
    /// Tokens held per environment.
    pub environment_usage: IntGaugeVec,
    /// Retries scheduled (automatic and explicit).
    pub retries_total: IntCounter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: C) -> Result<C, DeployError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| DeployError::Config(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn build_error(e: prometheus::Error) -> DeployError {
    DeployError::Config(format!("metrics init failed: {e}"))
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`DeployError::Config`] if metric construction or registration
/// fails.
pub fn init_metrics() -> Result<(), DeployError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let deployments_total = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "deploy_orchestrator_deployments_total",
                "Finished deployments by outcome",
            ),
            &["outcome"],
        )
        .map_err(build_error)?,
    )?;

    let stage_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "deploy_orchestrator_stage_duration_seconds",
                "Pipeline stage duration",
            ),
            &["stage"],
        )
        .map_err(build_error)?,
    )?;

    let stage_errors = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "deploy_orchestrator_stage_errors_total",
                "Pipeline stage failures by kind",
            ),
            &["stage", "kind"],
        )
        .map_err(build_error)?,
    )?;

    let queue_depth = register(
        &registry,
        IntGauge::new(
            "deploy_orchestrator_queue_depth",
            "Live plans waiting in the deployment queue",
        )
        .map_err(build_error)?,
    )?;

    let environment_usage = register(
        &registry,
        IntGaugeVec::new(
            Opts::new(
                "deploy_orchestrator_environment_usage",
                "Deployment tokens held per environment",
            ),
            &["environment"],
        )
        .map_err(build_error)?,
    )?;

    let retries_total = register(
        &registry,
        IntCounter::new("deploy_orchestrator_retries_total", "Deployment retries scheduled")
            .map_err(build_error)?,
    )?;

    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(Metrics {
        registry,
        deployments_total,
        stage_duration,
        stage_errors,
        queue_depth,
        environment_usage,
        retries_total,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Record how long a pipeline stage took.
pub fn record_stage_latency(stage: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.stage_duration.get_metric_with_label_values(&[stage]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Count a stage failure.
pub fn inc_stage_error(stage: &str, kind: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.stage_errors.get_metric_with_label_values(&[stage, kind]) {
            c.inc();
        }
    }
}

/// Count a finished deployment.
pub fn inc_deployment(outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.deployments_total.get_metric_with_label_values(&[outcome]) {
            c.inc();
        }
    }
}

/// Count a scheduled retry.
pub fn inc_retry() {
    if let Some(m) = metrics() {
        m.retries_total.inc();
    }
}

/// Set the queue depth gauge.
pub fn set_queue_depth(depth: usize) {
    if let Some(m) = metrics() {
        m.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }
}

/// Set the token usage gauge for one environment.
pub fn set_environment_usage(environment: &str, usage: usize) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.environment_usage.get_metric_with_label_values(&[environment]) {
            g.set(i64::try_from(usage).unwrap_or(i64::MAX));
        }
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
pub fn gather() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Finished deployment counts keyed by outcome label.
///
/// Empty if metrics have not been initialised.
pub fn deployment_outcomes() -> HashMap<String, u64> {
    let mut outcomes = HashMap::new();
    let Some(m) = metrics() else {
        return outcomes;
    };

    for family in m.deployments_total.collect() {
        for metric in family.get_metric() {
            let outcome = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == "outcome")
                .map_or("unknown", |l| l.get_value());
            outcomes.insert(outcome.to_string(), metric.get_counter().get_value() as u64);
        }
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_helpers_do_not_panic_in_any_state() {
        record_stage_latency("artifact_preparation", Duration::from_millis(3));
        inc_stage_error("environment_connection", "connectivity");
        set_queue_depth(4);
        set_environment_usage("env-x", 1);
        inc_retry();
    }

    #[test]
    fn test_deployment_counter_visible_in_outcomes() {
        let _ = init_metrics();
        inc_deployment("metrics-test-outcome");
        let outcomes = deployment_outcomes();
        assert!(outcomes.get("metrics-test-outcome").copied().unwrap_or(0) >= 1);
    }

    #[test]
    fn test_gather_contains_metric_names_after_observation() {
        let _ = init_metrics();
        inc_stage_error("script_deployment", "stage");
        set_environment_usage("gather-env", 2);
        let text = gather();
        assert!(text.contains("deploy_orchestrator_stage_errors_total"));
        assert!(text.contains("deploy_orchestrator_environment_usage"));
        assert!(text.contains("deploy_orchestrator_queue_depth"));
    }

    #[test]
    fn test_isolated_registry_records_exact_values() {
        let registry = Registry::new();
        let retries = register(
            &registry,
            IntCounter::new("t_retries_total", "test").expect("counter"),
        )
        .expect("register");
        retries.inc();
        retries.inc();
        let families = registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "t_retries_total")
            .expect("family must exist");
        let value = family.get_metric()[0].get_counter().get_value();
        assert!((value - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duplicate_registration_is_an_error() {
        let registry = Registry::new();
        let _ = register(&registry, IntGauge::new("t_dup", "test").expect("gauge"));
        let second = register(&registry, IntGauge::new("t_dup", "test").expect("gauge"));
        assert!(matches!(second, Err(DeployError::Config(_))));
    }
}
