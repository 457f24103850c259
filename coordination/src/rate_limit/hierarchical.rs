//! Agent → canvas → global rate limiting.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::bucket::{RateLimitDecision, RateLimitRule, TokenBucketLimiter};

const GLOBAL_KEY: &str = "global";

/// Scope whose bucket rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Agent,
    Canvas,
    Global,
}

impl std::fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Canvas => write!(f, "canvas"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// Rules for the three scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub agent: RateLimitRule,
    pub canvas: RateLimitRule,
    pub global: RateLimitRule,
}

impl Default for RateLimitConfig {
    /// Default: 10/min per agent, 50/min per canvas, 200/min overall.
    fn default() -> Self {
        Self {
            agent: RateLimitRule::new(10, 60_000),
            canvas: RateLimitRule::new(50, 60_000),
            global: RateLimitRule::new(200, 60_000),
        }
    }
}

/// A request denied by one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitViolation {
    pub scope: RateLimitScope,
    pub decision: RateLimitDecision,
}

/// Three stacked token-bucket limiters.
///
/// `check` walks agent, canvas and global in that order and stops at the
/// first scope without a token. `consume` runs the same checks and only
/// then takes a token from every applicable bucket. The canvas scope is
/// skipped when the request carries no canvas id.
#[derive(Debug)]
pub struct HierarchicalRateLimiter {
    agent: TokenBucketLimiter,
    canvas: TokenBucketLimiter,
    global: TokenBucketLimiter,
}

impl HierarchicalRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            agent: TokenBucketLimiter::new(config.agent),
            canvas: TokenBucketLimiter::new(config.canvas),
            global: TokenBucketLimiter::new(config.global),
        }
    }

    fn scopes<'a>(
        &'a self,
        agent_id: &'a str,
        canvas_id: Option<&'a str>,
    ) -> impl Iterator<Item = (RateLimitScope, &'a TokenBucketLimiter, &'a str)> + 'a {
        [
            Some((RateLimitScope::Agent, &self.agent, agent_id)),
            canvas_id.map(|c| (RateLimitScope::Canvas, &self.canvas, c)),
            Some((RateLimitScope::Global, &self.global, GLOBAL_KEY)),
        ]
        .into_iter()
        .flatten()
    }

    pub fn check(&self, agent_id: &str, canvas_id: Option<&str>) -> Result<(), RateLimitViolation> {
        self.check_at(agent_id, canvas_id, Instant::now())
    }

    pub fn check_at(
        &self,
        agent_id: &str,
        canvas_id: Option<&str>,
        now: Instant,
    ) -> Result<(), RateLimitViolation> {
        for (scope, limiter, key) in self.scopes(agent_id, canvas_id) {
            let decision = limiter.check_at(key, now);
            if !decision.allowed {
                debug!(
                    %scope,
                    key,
                    retry_after_ms = decision.retry_after.as_millis() as u64,
                    "Rate limit reached"
                );
                return Err(RateLimitViolation { scope, decision });
            }
        }
        Ok(())
    }

    pub fn consume(&self, agent_id: &str, canvas_id: Option<&str>) -> Result<(), RateLimitViolation> {
        self.consume_at(agent_id, canvas_id, Instant::now())
    }

    /// Check every scope, then take one token from each.
    ///
    /// Buckets are locked one at a time, so two racing callers can both
    /// pass the checks; the loser then finds its bucket empty and is
    /// reported against that scope.
    pub fn consume_at(
        &self,
        agent_id: &str,
        canvas_id: Option<&str>,
        now: Instant,
    ) -> Result<(), RateLimitViolation> {
        self.check_at(agent_id, canvas_id, now)?;
        for (scope, limiter, key) in self.scopes(agent_id, canvas_id) {
            let decision = limiter.consume_at(key, now);
            if !decision.allowed {
                return Err(RateLimitViolation { scope, decision });
            }
        }
        Ok(())
    }

    /// Forget the agent's bucket and, if given, the canvas bucket.
    pub fn reset(&self, agent_id: &str, canvas_id: Option<&str>) {
        self.agent.reset(agent_id);
        if let Some(canvas) = canvas_id {
            self.canvas.reset(canvas);
        }
    }

    pub fn reset_all(&self) {
        self.agent.reset_all();
        self.canvas.reset_all();
        self.global.reset_all();
    }
}

impl Default for HierarchicalRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
