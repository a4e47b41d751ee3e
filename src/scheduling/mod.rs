//! Admission control for deployments: what runs next, and whether its
//! environment has room for it.

pub mod queue;
pub mod resources;
pub mod retry;

pub use queue::{DeploymentQueue, Priority, QueueStats};
pub use resources::{ResourceManager, ResourceToken};
pub use retry::RetryPolicy;
