//! Token-bucket rate limiting
//!
//! [`TokenBucketLimiter`] keeps one bucket per key under a single rule.
//! [`HierarchicalRateLimiter`] stacks three of them (agent, canvas, global)
//! and is what the orchestrator consults before dispatching a call.

pub mod bucket;
pub mod hierarchical;

pub use bucket::{RateLimitDecision, RateLimitRule, TokenBucket, TokenBucketLimiter};
pub use hierarchical::{
    HierarchicalRateLimiter, RateLimitConfig, RateLimitScope, RateLimitViolation,
};
