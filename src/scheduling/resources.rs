//! Per-environment concurrency limits.
//!
//! ## Usage
//!
//! ```no_run
//! use tokio_deploy_orchestrator::scheduling::ResourceManager;
//! let resources = ResourceManager::new(3); // 3 concurrent deployments per environment
//!
//! if resources.acquire("env-1") {
//!     // run the deployment
//!     resources.release("env-1");
//! } else {
//!     // capacity exhausted, try again later
//! }
//! ```
//!
//! `acquire` is a pure capacity check: it never queues and never waits.
//! Callers denied a token must come back later themselves.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::metrics;

/// Per-environment token bucket.
///
/// Invariant: `0 <= usage[e] <= max_per_env` for every environment at all times.
/// Cheap to clone; clones share the same counters.
#[derive(Clone)]
pub struct ResourceManager {
    usage: Arc<Mutex<HashMap<String, usize>>>,
    max_per_env: usize,
}

impl ResourceManager {
    /// Create a manager allowing `max_per_env` concurrent deployments per environment.
    pub fn new(max_per_env: usize) -> Self {
        Self {
            usage: Arc::new(Mutex::new(HashMap::new())),
            max_per_env,
        }
    }

    /// Take one token for `env_id`.
    ///
    /// Returns `true` and increments usage if capacity remains, otherwise
    /// returns `false` with no side effect.
    pub fn acquire(&self, env_id: &str) -> bool {
        let mut usage = self.usage.lock();
        let current = usage.get(env_id).copied().unwrap_or(0);

        if current >= self.max_per_env {
            debug!(
                environment_id = env_id,
                usage = current,
                limit = self.max_per_env,
                "environment at capacity"
            );
            return false;
        }

        usage.insert(env_id.to_string(), current + 1);
        metrics::set_environment_usage(env_id, current + 1);
        debug!(environment_id = env_id, usage = current + 1, "environment token acquired");
        true
    }

    /// Return one token for `env_id`. Usage is floored at zero.
    pub fn release(&self, env_id: &str) {
        let mut usage = self.usage.lock();
        match usage.get_mut(env_id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                metrics::set_environment_usage(env_id, *count);
                debug!(environment_id = env_id, usage = *count, "environment token released");
            }
            _ => {
                warn!(environment_id = env_id, "release without matching acquire");
            }
        }
    }

    /// Take a token that is returned automatically when the guard drops.
    pub fn try_token(&self, env_id: &str) -> Option<ResourceToken> {
        self.acquire(env_id).then(|| ResourceToken {
            manager: self.clone(),
            env_id: env_id.to_string(),
        })
    }

    /// Current usage for one environment.
    pub fn usage(&self, env_id: &str) -> usize {
        self.usage.lock().get(env_id).copied().unwrap_or(0)
    }

    /// Copy of the usage table.
    pub fn usage_snapshot(&self) -> HashMap<String, usize> {
        self.usage.lock().clone()
    }

    /// Configured per-environment cap.
    pub fn max_per_env(&self) -> usize {
        self.max_per_env
    }
}

/// RAII environment token; releases on drop, including during unwinding.
pub struct ResourceToken {
    manager: ResourceManager,
    env_id: String,
}

impl ResourceToken {
    /// Environment this token belongs to.
    pub fn environment_id(&self) -> &str {
        &self.env_id
    }
}

impl Drop for ResourceToken {
    fn drop(&mut self) {
        self.manager.release(&self.env_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_capacity() {
        let resources = ResourceManager::new(2);
        assert!(resources.acquire("e1"));
        assert!(resources.acquire("e1"));
        assert!(!resources.acquire("e1"));
        assert_eq!(resources.usage("e1"), 2);
    }

    #[test]
    fn test_environments_are_independent() {
        let resources = ResourceManager::new(1);
        assert!(resources.acquire("e1"));
        assert!(resources.acquire("e2"));
        assert!(!resources.acquire("e1"));
    }

    #[test]
    fn test_release_restores_capacity() {
        let resources = ResourceManager::new(1);
        assert!(resources.acquire("e1"));
        resources.release("e1");
        assert_eq!(resources.usage("e1"), 0);
        assert!(resources.acquire("e1"));
    }

    #[test]
    fn test_release_floors_at_zero() {
        let resources = ResourceManager::new(2);
        resources.release("never-used");
        resources.release("never-used");
        assert_eq!(resources.usage("never-used"), 0);
        assert!(resources.acquire("never-used"));
        assert_eq!(resources.usage("never-used"), 1);
    }

    #[test]
    fn test_denied_acquire_has_no_side_effect() {
        let resources = ResourceManager::new(1);
        assert!(resources.acquire("e1"));
        let before = resources.usage_snapshot();
        assert!(!resources.acquire("e1"));
        assert_eq!(resources.usage_snapshot(), before);
    }

    #[test]
    fn test_token_releases_on_drop() {
        let resources = ResourceManager::new(1);
        {
            let token = resources.try_token("e1").unwrap();
            assert_eq!(token.environment_id(), "e1");
            assert!(resources.try_token("e1").is_none());
        }
        assert_eq!(resources.usage("e1"), 0);
    }

    #[test]
    fn test_token_releases_when_task_panics() {
        let resources = ResourceManager::new(1);
        let cloned = resources.clone();
        let result = std::thread::spawn(move || {
            let _token = cloned.try_token("e1");
            #[allow(clippy::panic)]
            {
                panic!("pipeline blew up");
            }
        })
        .join();
        assert!(result.is_err());
        assert_eq!(resources.usage("e1"), 0);
    }

    #[test]
    fn test_zero_capacity_denies_everything() {
        let resources = ResourceManager::new(0);
        assert!(!resources.acquire("e1"));
        assert!(resources.usage_snapshot().is_empty());
    }
}
