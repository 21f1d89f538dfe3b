//! Rate limiting logic and state management.

mod engine;
mod registry;
mod store;

pub use engine::{CheckResult, LimitSpec, MultiCheckResult, RateLimitEngine};
pub use registry::{LimiterConfig, LimiterRegistry};
pub use store::{MemoryStore, WindowSnapshot, WindowStore};
