//! Debater and judge agents, and their adapters onto the agent host.

use std::sync::Arc;

use async_trait::async_trait;
use coordination::agents::{AgentSpec, ToolCall, ToolHandler, ToolOutput};
use coordination::debate::{
    Posture, TOOL_ANSWER_QUESTIONS, TOOL_ASK_QUESTION, TOOL_EVALUATE_DEBATE,
    TOOL_PRESENT_POSITION,
};
use coordination::error::InvocationError;
use serde_json::{json, Value};

/// Something that can hold a posture in a debate.
#[async_trait]
pub trait Debater: Send + Sync {
    async fn present_position(&self, args: &Value) -> Result<ToolOutput, InvocationError>;
    async fn ask_question(&self, args: &Value) -> Result<ToolOutput, InvocationError>;
    async fn answer_questions(&self, args: &Value) -> Result<ToolOutput, InvocationError>;
}

/// Something that can judge a finished debate.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(&self, args: &Value) -> Result<ToolOutput, InvocationError>;
}

struct DebaterTool(Arc<dyn Debater>);

#[async_trait]
impl ToolHandler for DebaterTool {
    async fn call(&self, call: ToolCall) -> Result<ToolOutput, InvocationError> {
        match call.tool.as_str() {
            TOOL_PRESENT_POSITION => self.0.present_position(&call.args).await,
            TOOL_ASK_QUESTION => self.0.ask_question(&call.args).await,
            TOOL_ANSWER_QUESTIONS => self.0.answer_questions(&call.args).await,
            _ => Err(InvocationError::tool_not_found(&call.agent_id, &call.tool)),
        }
    }
}

struct JudgeTool(Arc<dyn Judge>);

#[async_trait]
impl ToolHandler for JudgeTool {
    async fn call(&self, call: ToolCall) -> Result<ToolOutput, InvocationError> {
        self.0.evaluate(&call.args).await
    }
}

/// Agent exposing the three debater tools.
pub fn debater_spec(agent_id: &str, debater: Arc<dyn Debater>) -> AgentSpec {
    let handler: Arc<dyn ToolHandler> = Arc::new(DebaterTool(debater));
    AgentSpec::new(agent_id)
        .tool(TOOL_PRESENT_POSITION, Arc::clone(&handler))
        .tool(TOOL_ASK_QUESTION, Arc::clone(&handler))
        .tool(TOOL_ANSWER_QUESTIONS, handler)
}

/// Agent exposing `evaluate_debate`.
pub fn judge_spec(agent_id: &str, judge: Arc<dyn Judge>) -> AgentSpec {
    AgentSpec::new(agent_id).tool(TOOL_EVALUATE_DEBATE, Arc::new(JudgeTool(judge)))
}

/// Posture passed under `field` in the tool arguments.
pub fn posture_arg(args: &Value, field: &str) -> Result<Posture, InvocationError> {
    let value = args
        .get(field)
        .cloned()
        .ok_or_else(|| InvocationError::validation(format!("missing '{}' argument", field)))?;
    serde_json::from_value(value)
        .map_err(|e| InvocationError::validation(format!("invalid '{}' argument: {}", field, e)))
}

pub fn str_arg<'a>(args: &'a Value, field: &str) -> &'a str {
    args.get(field).and_then(Value::as_str).unwrap_or_default()
}

/// Deterministic debater built from the posture text alone.
#[derive(Debug, Default)]
pub struct ScriptedDebater;

#[async_trait]
impl Debater for ScriptedDebater {
    async fn present_position(&self, args: &Value) -> Result<ToolOutput, InvocationError> {
        let posture = posture_arg(args, "posture")?;
        let mut text = format!(
            "Speaking for {}: {}",
            posture.perspective, posture.initial_position
        );
        if !posture.topics.is_empty() {
            text.push_str(&format!(" Key concerns: {}.", posture.topics.join(", ")));
        }
        Ok(ToolOutput::text(text).with_confidence(0.6))
    }

    async fn ask_question(&self, args: &Value) -> Result<ToolOutput, InvocationError> {
        let posture = posture_arg(args, "posture")?;
        let target = posture_arg(args, "target")?;
        let index = args
            .get("questionIndex")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;

        let question = match posture.guiding_questions.get(index) {
            Some(guiding) => format!("To {}: {}", target.id, guiding),
            None => format!(
                "To {}: from the {} angle, how does \"{}\" survive scrutiny on {}?",
                target.id,
                posture.perspective,
                target.initial_position,
                target
                    .topics
                    .get(index)
                    .or_else(|| target.topics.first())
                    .map_or(str_arg(args, "topic"), String::as_str)
            ),
        };
        Ok(ToolOutput::text(question).with_confidence(0.6))
    }

    async fn answer_questions(&self, args: &Value) -> Result<ToolOutput, InvocationError> {
        let posture = posture_arg(args, "posture")?;
        let askers: Vec<&str> = args
            .get("questions")
            .and_then(Value::as_array)
            .map(|qs| qs.iter().filter_map(|q| q["from"].as_str()).collect())
            .unwrap_or_default();
        Ok(ToolOutput::text(format!(
            "Answering {} ({} questions): the {} view stands. {}",
            askers.join(", "),
            askers.len(),
            posture.perspective,
            posture.initial_position
        ))
        .with_confidence(0.5))
    }
}

/// Judge that scores postures by how much they contributed.
#[derive(Debug, Default)]
pub struct ScriptedJudge;

#[async_trait]
impl Judge for ScriptedJudge {
    async fn evaluate(&self, args: &Value) -> Result<ToolOutput, InvocationError> {
        let rounds = args["transcript"]["rounds"]
            .as_array()
            .ok_or_else(|| InvocationError::validation("missing transcript rounds"))?;

        let mut scores: Vec<(String, usize)> = Vec::new();
        for exchange in rounds.iter().filter_map(|r| r["exchanges"].as_array()).flatten() {
            let from = exchange["from"].as_str().unwrap_or_default();
            let len = exchange["content"].as_str().map_or(0, str::len);
            match scores.iter_mut().find(|(id, _)| id == from) {
                Some((_, score)) => *score += len,
                None => scores.push((from.to_string(), len)),
            }
        }
        // first posture wins ties
        let winner = scores
            .iter()
            .fold(None::<&(String, usize)>, |best, entry| match best {
                Some(b) if b.1 >= entry.1 => Some(b),
                _ => Some(entry),
            })
            .map(|(id, _)| id.clone());

        let score_map: serde_json::Map<String, Value> = scores
            .iter()
            .map(|(id, score)| (id.clone(), json!(score)))
            .collect();
        Ok(ToolOutput::new(json!({
            "winner": winner,
            "scores": score_map,
            "rationale": "scored by volume of argument",
        }))
        .with_reasoning("scripted judge"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::orchestrator::CallerContext;

    fn posture(id: &str) -> Posture {
        Posture::new(id, format!("d-{}", id), format!("{} view", id), format!("{} wins", id))
            .with_topics(vec![format!("{}-topic", id)])
    }

    fn call(tool: &str, args: Value) -> ToolCall {
        ToolCall {
            request_id: "r".into(),
            agent_id: "d-a".into(),
            tool: tool.into(),
            from: "moderator".into(),
            args,
            context: CallerContext::new(),
            cancel: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_debater_tool_dispatch() {
        let tool = DebaterTool(Arc::new(ScriptedDebater));
        let out = tool
            .call(call(TOOL_PRESENT_POSITION, json!({ "posture": posture("a") })))
            .await
            .unwrap();
        assert_eq!(
            out.data["content"],
            "Speaking for a view: a wins Key concerns: a-topic."
        );

        let err = tool.call(call("dance", json!({}))).await.unwrap_err();
        assert_eq!(err.code, coordination::error::ErrorCode::ToolNotFound);
    }

    #[tokio::test]
    async fn test_question_prefers_guiding_questions() {
        let asker = posture("a").with_guiding_questions(vec!["Why now?".into()]);
        let args = |index: u64| {
            json!({ "posture": asker, "target": posture("b"), "questionIndex": index, "topic": "t" })
        };

        let first = ScriptedDebater.ask_question(&args(0)).await.unwrap();
        assert_eq!(first.data["content"], "To b: Why now?");

        let second = ScriptedDebater.ask_question(&args(1)).await.unwrap();
        let text = second.data["content"].as_str().unwrap();
        assert!(text.starts_with("To b: from the a view angle"));
        assert!(text.ends_with("on b-topic?"));
    }

    #[tokio::test]
    async fn test_answer_lists_askers() {
        let out = ScriptedDebater
            .answer_questions(&json!({
                "posture": posture("a"),
                "questions": [{"from": "b", "content": "?"}, {"from": "c", "content": "?"}],
            }))
            .await
            .unwrap();
        assert!(out.data["content"]
            .as_str()
            .unwrap()
            .starts_with("Answering b, c (2 questions)"));
    }

    #[tokio::test]
    async fn test_missing_posture_is_validation_error() {
        let err = ScriptedDebater.present_position(&json!({})).await.unwrap_err();
        assert_eq!(err.code, coordination::error::ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn test_scripted_judge_picks_most_content() {
        let transcript = json!({
            "rounds": [
                { "exchanges": [
                    { "from": "a", "content": "short" },
                    { "from": "b", "content": "a much longer argument" },
                ]},
                { "exchanges": [ { "from": "a", "content": "more" } ] },
            ]
        });
        let out = ScriptedJudge
            .evaluate(&json!({ "transcript": transcript }))
            .await
            .unwrap();
        assert_eq!(out.data["winner"], "b");
        assert_eq!(out.data["scores"]["a"], 9);
    }
}
