//! Deployment Queue
//!
//! Priority queue of pending deployment plans with lazy deletion.
//!
//! ## Usage
//!
//! ```no_run
//! use tokio_deploy_orchestrator::scheduling::{DeploymentQueue, Priority};
//! use tokio_deploy_orchestrator::DeploymentPlan;
//! # fn plan(id: &str) -> DeploymentPlan { unimplemented!() }
//! let queue = DeploymentQueue::new();
//!
//! queue.add(plan("smoke"), Some(Priority::High));
//! queue.add(plan("nightly"), Some(Priority::Low));
//!
//! // Dequeue by priority, lowest number first
//! if let Some((_priority, plan)) = queue.pop() {
//!     println!("{}", plan.plan_id);
//! }
//! ```
//!
//! ## Lazy deletion
//!
//! `remove` and re-`add` never touch the heap. The index maps each live
//! `plan_id` to the sequence number of its current entry; any heap entry
//! whose sequence no longer matches is a tombstone and is discarded when it
//! reaches the head.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::deployment::DeploymentPlan;

/// Deployment priority levels. Lower numeric value is scheduled first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Scheduled ahead of everything else.
    Critical = 0,
    /// Elevated priority.
    High = 1,
    /// Standard priority for most deployments.
    #[default]
    Normal = 2,
    /// Background work.
    Low = 3,
}

impl Priority {
    /// Parse a priority level from a name string (`"critical"`, `"high"`, `"normal"`, `"low"`).
    ///
    /// Returns `None` for unrecognised strings.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(Priority::Critical),
            "high" => Some(Priority::High),
            "normal" => Some(Priority::Normal),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }

    /// Numeric scheduling value (0 = first).
    pub fn value(self) -> u8 {
        self as u8
    }

    /// One level worse, saturating at [`Priority::Low`].
    pub fn demoted(self) -> Self {
        match self {
            Priority::Critical => Priority::High,
            Priority::High => Priority::Normal,
            Priority::Normal | Priority::Low => Priority::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Heap entry
struct QueuedPlan {
    priority: Priority,
    sequence: u64, // For FIFO within same priority
    plan: DeploymentPlan,
}

impl PartialEq for QueuedPlan {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedPlan {}

impl PartialOrd for QueuedPlan {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedPlan {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: the "greatest" entry is the one with the
        // lowest priority value, then the lowest sequence.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedPlan>,
    /// plan_id -> (sequence, priority) of the single live entry
    index: HashMap<String, (u64, Priority)>,
    sequence: u64,
}

/// Priority queue of pending deployment plans.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone, Default)]
pub struct DeploymentQueue {
    state: Arc<Mutex<QueueState>>,
}

impl DeploymentQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a plan. The plan's configured priority is used unless
    /// `priority` overrides it. A prior entry for the same `plan_id` is
    /// tombstoned first, so at most one live entry exists per plan.
    pub fn add(&self, plan: DeploymentPlan, priority: Option<Priority>) {
        let priority = priority.unwrap_or(plan.deployment_config.priority);
        let mut state = self.state.lock();

        state.sequence += 1;
        let sequence = state.sequence;
        let superseded = state
            .index
            .insert(plan.plan_id.clone(), (sequence, priority))
            .is_some();

        debug!(
            plan_id = %plan.plan_id,
            priority = %priority,
            sequence,
            superseded,
            heap_size = state.heap.len() + 1,
            "plan enqueued"
        );

        state.heap.push(QueuedPlan {
            priority,
            sequence,
            plan,
        });
    }

    /// Pop the live plan with the lowest priority value (FIFO among equals).
    ///
    /// Tombstoned entries are discarded on the way. Returns `None` when no
    /// live plan remains; never waits.
    pub fn pop(&self) -> Option<(Priority, DeploymentPlan)> {
        let mut state = self.state.lock();

        while let Some(entry) = state.heap.pop() {
            let live = state
                .index
                .get(&entry.plan.plan_id)
                .is_some_and(|(seq, _)| *seq == entry.sequence);

            if !live {
                debug!(plan_id = %entry.plan.plan_id, sequence = entry.sequence, "tombstone discarded");
                continue;
            }

            state.index.remove(&entry.plan.plan_id);
            debug!(
                plan_id = %entry.plan.plan_id,
                priority = %entry.priority,
                sequence = entry.sequence,
                remaining = state.index.len(),
                "plan dequeued"
            );
            return Some((entry.priority, entry.plan));
        }

        None
    }

    /// Tombstone the live entry for `plan_id`. Returns `true` if one existed.
    pub fn remove(&self, plan_id: &str) -> bool {
        let removed = self.state.lock().index.remove(plan_id).is_some();
        if removed {
            debug!(plan_id, "plan removed from queue");
        }
        removed
    }

    /// Returns `true` if a live entry exists for `plan_id`.
    pub fn contains(&self, plan_id: &str) -> bool {
        self.state.lock().index.contains_key(plan_id)
    }

    /// Number of live entries (tombstones excluded).
    pub fn size(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Check if no live entry remains
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Live entry counts by priority.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats {
            total: state.index.len(),
            by_priority: HashMap::new(),
        };
        for (_, priority) in state.index.values() {
            *stats.by_priority.entry(*priority).or_insert(0) += 1;
        }
        stats
    }

    /// Drop every entry, live or tombstoned.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.heap.clear();
        state.index.clear();
        debug!("deployment queue cleared");
    }
}

/// Queue statistics
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Total number of live plans in the queue.
    pub total: usize,
    /// Breakdown of live plan counts keyed by priority level.
    pub by_priority: HashMap<Priority, usize>,
}
