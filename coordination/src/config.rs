//! Mesh configuration: TOML file, `MESH_*` environment overrides, validation.
//!
//! ```toml
//! [orchestrator]
//! max_call_depth = 5
//! default_timeout_ms = 30000
//!
//! [rate_limits.agent]
//! max_requests = 10
//! window_ms = 60000
//!
//! [debate]
//! questions_per_examiner = 2
//! judge_id = "judge"
//! ```
//!
//! Missing sections and fields take their defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::debate::{DebateConfig, MAX_QUESTIONS_PER_EXAMINER};
use crate::events::DEFAULT_HISTORY_CAPACITY;
use crate::orchestrator::OrchestratorConfig;
use crate::rate_limit::{RateLimitConfig, RateLimitRule};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {var}: '{value}'")]
    Env { var: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events kept in the bus history ring.
    pub history_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Top-level configuration of the agent mesh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub orchestrator: OrchestratorConfig,
    pub rate_limits: RateLimitConfig,
    pub events: EventsConfig,
    pub debate: DebateConfig,
}

impl MeshConfig {
    /// Parse a TOML file. Does not apply overrides or validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File (or defaults), then environment, then validation.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MESH_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    ///
    /// Rate limit rules are written `max_requests/window_ms`, e.g. `10/60000`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let orch = &mut self.orchestrator;
        override_parsed(&lookup, "MESH_MAX_CALL_DEPTH", &mut orch.max_call_depth)?;
        override_parsed(&lookup, "MESH_DEFAULT_TIMEOUT_MS", &mut orch.default_timeout_ms)?;
        override_parsed(&lookup, "MESH_CACHE_TTL_SECS", &mut orch.cache_ttl_secs)?;
        override_parsed(&lookup, "MESH_CACHE_CAPACITY", &mut orch.cache_capacity)?;

        let limits = &mut self.rate_limits;
        override_rule(&lookup, "MESH_RATE_LIMIT_AGENT", &mut limits.agent)?;
        override_rule(&lookup, "MESH_RATE_LIMIT_CANVAS", &mut limits.canvas)?;
        override_rule(&lookup, "MESH_RATE_LIMIT_GLOBAL", &mut limits.global)?;

        override_parsed(
            &lookup,
            "MESH_HISTORY_CAPACITY",
            &mut self.events.history_capacity,
        )?;

        let debate = &mut self.debate;
        override_parsed(
            &lookup,
            "MESH_QUESTIONS_PER_EXAMINER",
            &mut debate.questions_per_examiner,
        )?;
        override_parsed(&lookup, "MESH_DEBATE_RETRIES", &mut debate.sub_invocation_retries)?;
        override_parsed(
            &lookup,
            "MESH_TRANSACTION_TIMEOUT_SECS",
            &mut debate.transaction_timeout_secs,
        )?;
        override_parsed(
            &lookup,
            "MESH_INVOCATION_TIMEOUT_MS",
            &mut debate.invocation_timeout_ms,
        )?;
        if let Some(moderator) = lookup("MESH_MODERATOR_ID") {
            debate.moderator_id = moderator;
        }
        if let Some(judge) = lookup("MESH_JUDGE_ID") {
            debate.judge_id = Some(judge).filter(|j| !j.is_empty());
        }
        Ok(())
    }

    /// Reject values that would make the mesh unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let orch = &self.orchestrator;
        if orch.max_call_depth == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.max_call_depth must be at least 1".into(),
            ));
        }
        if orch.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.default_timeout_ms must be positive".into(),
            ));
        }
        if orch.cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.cache_capacity must be positive".into(),
            ));
        }

        for (scope, rule) in [
            ("agent", self.rate_limits.agent),
            ("canvas", self.rate_limits.canvas),
            ("global", self.rate_limits.global),
        ] {
            if rule.max_requests == 0 || rule.window_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate_limits.{} needs positive max_requests and window_ms",
                    scope
                )));
            }
        }

        if self.events.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events.history_capacity must be positive".into(),
            ));
        }

        let debate = &self.debate;
        if !(1..=MAX_QUESTIONS_PER_EXAMINER).contains(&debate.questions_per_examiner) {
            return Err(ConfigError::Invalid(format!(
                "debate.questions_per_examiner must be between 1 and {}",
                MAX_QUESTIONS_PER_EXAMINER
            )));
        }
        if debate.transaction_timeout_secs == 0 || debate.invocation_timeout_ms == 0 {
            return Err(ConfigError::Invalid("debate timeouts must be positive".into()));
        }
        if debate.moderator_id.trim().is_empty() {
            return Err(ConfigError::Invalid("debate.moderator_id is empty".into()));
        }
        if debate.judge_id.as_deref().is_some_and(|j| j.trim().is_empty()) {
            return Err(ConfigError::Invalid("debate.judge_id is empty".into()));
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, var: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(value) = lookup(var) else {
        return Ok(());
    };
    *target = value.trim().parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value: value.clone(),
    })?;
    debug!(var, value = %value, "Config override applied");
    Ok(())
}

fn override_rule<F>(lookup: &F, var: &str, target: &mut RateLimitRule) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(());
    };
    let invalid = || ConfigError::Env {
        var: var.to_string(),
        value: value.clone(),
    };
    let (max, window) = value.trim().split_once('/').ok_or_else(invalid)?;
    *target = RateLimitRule::new(
        max.trim().parse().map_err(|_| invalid())?,
        window.trim().parse().map_err(|_| invalid())?,
    );
    debug!(var, value = %value, "Config override applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = MeshConfig::default();
        config.validate().unwrap();
        assert_eq!(config.orchestrator.max_call_depth, 5);
        assert_eq!(config.rate_limits.agent, RateLimitRule::new(10, 60_000));
        assert_eq!(config.events.history_capacity, 1000);
        assert_eq!(config.debate.questions_per_examiner, 1);
        assert_eq!(config.debate.transaction_timeout_secs, 120);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[orchestrator]
max_call_depth = 3

[rate_limits.global]
max_requests = 500
window_ms = 1000

[debate]
questions_per_examiner = 2
judge_id = "judge"
"#
        )
        .unwrap();

        let config = MeshConfig::load(file.path()).unwrap();
        assert_eq!(config.orchestrator.max_call_depth, 3);
        assert_eq!(config.orchestrator.default_timeout_ms, 30_000);
        assert_eq!(config.rate_limits.global, RateLimitRule::new(500, 1_000));
        assert_eq!(config.rate_limits.agent, RateLimitRule::new(10, 60_000));
        assert_eq!(config.debate.questions_per_examiner, 2);
        assert_eq!(config.debate.judge_id.as_deref(), Some("judge"));
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = MeshConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[orchestrator\nmax_call_depth = ").unwrap();
        let err = MeshConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = MeshConfig::default();
        config
            .apply_overrides(lookup(&[
                ("MESH_MAX_CALL_DEPTH", "7"),
                ("MESH_RATE_LIMIT_AGENT", "20/30000"),
                ("MESH_QUESTIONS_PER_EXAMINER", "2"),
                ("MESH_JUDGE_ID", "judge"),
            ]))
            .unwrap();
        assert_eq!(config.orchestrator.max_call_depth, 7);
        assert_eq!(config.rate_limits.agent, RateLimitRule::new(20, 30_000));
        assert_eq!(config.debate.questions_per_examiner, 2);
        assert_eq!(config.debate.judge_id.as_deref(), Some("judge"));
    }

    #[test]
    fn test_empty_judge_override_clears_judge() {
        let mut config = MeshConfig::default();
        config.debate.judge_id = Some("judge".into());
        config
            .apply_overrides(lookup(&[("MESH_JUDGE_ID", "")]))
            .unwrap();
        assert_eq!(config.debate.judge_id, None);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = MeshConfig::default();
        let err = config
            .apply_overrides(lookup(&[("MESH_CACHE_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref var, .. } if var == "MESH_CACHE_CAPACITY"));

        let err = config
            .apply_overrides(lookup(&[("MESH_RATE_LIMIT_GLOBAL", "200")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        let mut config = MeshConfig::default();
        config.debate.questions_per_examiner = 3;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.rate_limits.canvas = RateLimitRule::new(0, 60_000);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rate_limits.canvas"));

        let mut config = MeshConfig::default();
        config.orchestrator.max_call_depth = 0;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.debate.moderator_id = " ".into();
        assert!(config.validate().is_err());
    }
}
