//! Agent invocation orchestrator
//!
//! Every call between agents goes through [`Orchestrator::invoke`]:
//!
//! ```text
//! invoke(params)
//!   ├─ `to` already on the call stack  → CircularDependency (chain in data)
//!   ├─ stack longer than max depth     → CircularDependency
//!   ├─ any rate-limit scope empty      → RateLimitExceeded
//!   ├─ fresh cached result             → return it
//!   └─ consume tokens, emit agent:invoke
//!        ├─ agent:response (result)    → cache, return
//!        ├─ agent:response (error)     → agent:error, return error
//!        └─ timeout                    → agent:status cancelled, agent:error
//! ```

pub mod cache;
pub mod dispatch;
pub mod retry;
pub mod types;

pub use cache::{cache_key, CacheStats, CachedResult, ResultCache};
pub use dispatch::{Orchestrator, OrchestratorConfig};
pub use retry::RetryPolicy;
pub use types::{
    AgentId, CallerContext, InvocationContext, InvocationParams, InvocationResult, RequestId,
    ResultMetadata,
};
