//! LLM-backed debaters over an OpenAI-compatible chat endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use coordination::agents::ToolOutput;
use coordination::error::{ErrorCode, InvocationError};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::LlmEndpoint;
use crate::debaters::{posture_arg, str_arg, Debater, Judge};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct LlmClient {
    http: reqwest::Client,
    endpoint: LlmEndpoint,
}

impl LlmClient {
    pub fn new(endpoint: LlmEndpoint) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, endpoint })
    }

    pub fn model(&self) -> &str {
        &self.endpoint.model
    }

    /// One system + user exchange; returns the assistant message text.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String, InvocationError> {
        let start = Instant::now();
        let body = json!({
            "model": self.endpoint.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "max_tokens": self.endpoint.max_tokens,
            "temperature": self.endpoint.temperature,
        });

        let mut request = self.http.post(self.endpoint.completions_url()).json(&body);
        if let Some(key) = &self.endpoint.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let code = if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                ErrorCode::RateLimitExceeded
            } else {
                ErrorCode::InternalError
            };
            return Err(InvocationError::new(
                code,
                format!("LLM endpoint returned {}: {}", status, body),
            ));
        }

        let payload: Value = response.json().await.map_err(request_error)?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                InvocationError::new(ErrorCode::ParseError, "LLM response has no message content")
            })?
            .trim()
            .to_string();
        debug!(
            model = %self.endpoint.model,
            chars = content.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "LLM completion"
        );
        Ok(content)
    }
}

fn request_error(e: reqwest::Error) -> InvocationError {
    if e.is_timeout() {
        InvocationError::new(ErrorCode::Timeout, format!("LLM request timed out: {}", e))
    } else {
        InvocationError::internal(format!("LLM request failed: {}", e))
    }
}

fn history_text(args: &Value) -> String {
    args["history"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .map(|e| {
                    format!(
                        "[round {} {} from {}] {}",
                        e["round"],
                        str_arg(e, "type"),
                        str_arg(e, "from"),
                        str_arg(e, "content")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

pub struct LlmDebater {
    client: std::sync::Arc<LlmClient>,
}

impl LlmDebater {
    pub fn new(client: std::sync::Arc<LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Debater for LlmDebater {
    async fn present_position(&self, args: &Value) -> Result<ToolOutput, InvocationError> {
        let posture = posture_arg(args, "posture")?;
        let system = format!(
            "You are a debater arguing from the perspective of {}. Be concise and concrete.",
            posture.perspective
        );
        let user = format!(
            "Debate topic: {}\nYour position: {}\nFocus topics: {}\n\nState your opening position in one paragraph.",
            str_arg(args, "topic"),
            posture.initial_position,
            posture.topics.join(", ")
        );
        let text = self.client.complete(&system, &user).await?;
        Ok(ToolOutput::text(text).with_sources(vec![self.client.model().to_string()]))
    }

    async fn ask_question(&self, args: &Value) -> Result<ToolOutput, InvocationError> {
        let posture = posture_arg(args, "posture")?;
        let target = posture_arg(args, "target")?;
        let system = format!(
            "You are a debater arguing from the perspective of {}. You cross-examine opponents with one sharp question.",
            posture.perspective
        );
        let user = format!(
            "Debate topic: {}\nOpponent '{}' holds: {}\nDebate so far:\n{}\n\nAsk question #{} to the opponent. Reply with the question only.",
            str_arg(args, "topic"),
            target.id,
            target.initial_position,
            history_text(args),
            args["questionIndex"].as_u64().unwrap_or(0) + 1
        );
        let text = self.client.complete(&system, &user).await?;
        Ok(ToolOutput::text(text).with_sources(vec![self.client.model().to_string()]))
    }

    async fn answer_questions(&self, args: &Value) -> Result<ToolOutput, InvocationError> {
        let posture = posture_arg(args, "posture")?;
        let system = format!(
            "You are a debater arguing from the perspective of {}. Defend your position honestly.",
            posture.perspective
        );
        let user = format!(
            "Debate topic: {}\nYour position: {}\n\nQuestions put to you:\n{}\n\nAnswer all questions in one reply.",
            str_arg(args, "topic"),
            posture.initial_position,
            str_arg(args, "combined")
        );
        let text = self.client.complete(&system, &user).await?;
        Ok(ToolOutput::text(text).with_sources(vec![self.client.model().to_string()]))
    }
}

pub struct LlmJudge {
    client: std::sync::Arc<LlmClient>,
}

impl LlmJudge {
    pub fn new(client: std::sync::Arc<LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn evaluate(&self, args: &Value) -> Result<ToolOutput, InvocationError> {
        let system = "You judge structured debates. Reply with a JSON object \
                      {\"winner\": <posture id>, \"rationale\": <string>} and nothing else.";
        let user = format!(
            "Debate topic: {}\nTranscript:\n{}",
            str_arg(args, "topic"),
            serde_json::to_string_pretty(&args["transcript"]).unwrap_or_default()
        );
        let text = self.client.complete(system, &user).await?;
        let verdict = parse_verdict(&text);
        Ok(ToolOutput::new(verdict).with_reasoning(text))
    }
}

/// JSON verdict from a model reply, tolerating surrounding prose or fences.
fn parse_verdict(text: &str) -> Value {
    let json = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    };
    serde_json::from_str(json).unwrap_or_else(|_| json!({ "verdict": text }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict_strips_fences() {
        let verdict = parse_verdict("```json\n{\"winner\": \"skeptic\", \"rationale\": \"x\"}\n```");
        assert_eq!(verdict["winner"], "skeptic");
    }

    #[test]
    fn test_parse_verdict_falls_back_to_text() {
        let verdict = parse_verdict("The skeptic wins.");
        assert_eq!(verdict["verdict"], "The skeptic wins.");
    }

    #[test]
    fn test_history_text() {
        let args = json!({
            "history": [
                {"round": 1, "type": "exposition", "from": "a", "content": "hello"},
            ]
        });
        assert_eq!(history_text(&args), "[round 1 exposition from a] hello");
        assert_eq!(history_text(&json!({})), "");
    }
}
