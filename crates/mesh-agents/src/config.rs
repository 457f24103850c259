use anyhow::{bail, Context, Result};
use coordination::debate::{Posture, POSTURES_PER_DEBATE};
use serde::Deserialize;
use std::path::Path;

/// OpenAI-compatible chat endpoint used by LLM debaters.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmEndpoint {
    /// Base URL, e.g. `http://localhost:8080/v1`.
    pub url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    512
}

impl LlmEndpoint {
    /// Endpoint from `MESH_LLM_URL`, `MESH_LLM_MODEL` and `MESH_LLM_API_KEY`.
    /// `None` unless the URL is set.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("MESH_LLM_URL").ok().filter(|u| !u.is_empty())?;
        Some(Self {
            url,
            model: std::env::var("MESH_LLM_MODEL").unwrap_or_else(|_| "default".into()),
            api_key: std::env::var("MESH_LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        })
    }

    /// Full `/chat/completions` URL.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.url.trim_end_matches('/'))
    }
}

/// Runner-specific settings, read from the same TOML file as the mesh
/// config (`[llm]` and `[[postures]]`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub llm: Option<LlmEndpoint>,
    #[serde(default)]
    pub postures: Vec<Posture>,
}

impl AgentsConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Self::parse(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => Self::default(),
        };
        if let Some(endpoint) = LlmEndpoint::from_env() {
            config.llm = Some(endpoint);
        }
        if config.postures.is_empty() {
            config.postures = default_postures();
        }
        if config.postures.len() != POSTURES_PER_DEBATE {
            bail!(
                "a debate needs exactly {} postures, {} configured",
                POSTURES_PER_DEBATE,
                config.postures.len()
            );
        }
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid agents TOML")
    }
}

/// Three stock postures used when none are configured.
pub fn default_postures() -> Vec<Posture> {
    vec![
        Posture::new(
            "advocate",
            "debater-advocate",
            "benefits and opportunities",
            "The proposal delivers more value than it costs.",
        )
        .with_topics(vec!["benefits".into(), "adoption".into()])
        .with_guiding_questions(vec![
            "Which concrete gains would be lost without it?".into(),
            "Who benefits first, and how soon?".into(),
        ]),
        Posture::new(
            "skeptic",
            "debater-skeptic",
            "risks and hidden costs",
            "The downside risks outweigh the promised benefits.",
        )
        .with_topics(vec!["risk".into(), "cost".into()])
        .with_guiding_questions(vec![
            "What happens when the key assumption fails?".into(),
            "Which costs are left out of the estimate?".into(),
        ]),
        Posture::new(
            "pragmatist",
            "debater-pragmatist",
            "feasibility and execution",
            "The idea works only with a staged, measurable rollout.",
        )
        .with_topics(vec!["execution".into(), "metrics".into()])
        .with_guiding_questions(vec![
            "What is the smallest version worth trying?".into(),
            "How would we know it is failing?".into(),
        ]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_ignores_mesh_sections() {
        let config = AgentsConfig::parse(
            r#"
[orchestrator]
max_call_depth = 4

[llm]
url = "http://localhost:8080/v1/"
model = "qwen"

[[postures]]
id = "pro"
debaterId = "d-pro"
perspective = "for"
initialPosition = "yes"

[[postures]]
id = "con"
debaterId = "d-con"
perspective = "against"
initialPosition = "no"
topics = ["cost"]
"#,
        )
        .unwrap();

        let llm = config.llm.unwrap();
        assert_eq!(llm.completions_url(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(llm.temperature, 0.7);
        assert_eq!(config.postures.len(), 2);
        assert_eq!(config.postures[1].debater_id, "d-con");
        assert_eq!(config.postures[1].topics, vec!["cost"]);
    }

    #[test]
    fn test_load_falls_back_to_default_postures() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[debate]\nquestions_per_examiner = 2").unwrap();

        let config = AgentsConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.postures.len(), 3);
        assert_eq!(config.postures[0].id, "advocate");
    }

    #[test]
    fn test_load_rejects_two_postures() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[postures]]
id = "pro"
debaterId = "d-pro"
perspective = "for"
initialPosition = "yes"

[[postures]]
id = "con"
debaterId = "d-con"
perspective = "against"
initialPosition = "no"
"#
        )
        .unwrap();

        let err = AgentsConfig::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("exactly 3 postures"));
    }

    #[test]
    fn test_default_postures_are_distinct() {
        let postures = default_postures();
        for (i, p) in postures.iter().enumerate() {
            assert!(postures[..i].iter().all(|q| q.id != p.id && q.debater_id != p.debater_id));
        }
    }
}
