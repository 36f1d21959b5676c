//! LLM summarization of conversation turns.
//!
//! [`Summarizer`] is the seam the enrichment workers call. [`ChatSummarizer`]
//! talks to an OpenAI-compatible `/chat/completions` endpoint and expects
//! the reply to be a JSON object shaped like [`TurnSummary`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::models::ChunkEnrichment;

/// Structured summary produced for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnSummary {
    pub main_topic: String,
    pub problem: String,
    pub solution: String,
    pub tech_stack: Vec<String>,
    pub code_snippets: Vec<String>,
    pub key_points: Vec<String>,
    pub lessons: Vec<String>,
    pub tags: Vec<String>,
    pub summary: String,
    pub context: String,
}

impl TurnSummary {
    pub fn enrichment(&self) -> ChunkEnrichment {
        ChunkEnrichment {
            summary: self.summary.clone(),
            main_topic: self.main_topic.clone(),
            tags: self.tags.clone(),
        }
    }
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, user_text: &str, ai_text: &str) -> Result<TurnSummary>;
}

/// Build the configured summarizer, or `None` when the LLM is disabled.
pub fn create_summarizer(config: &LlmConfig) -> Result<Option<Arc<dyn Summarizer>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(ChatSummarizer::new(config)?))),
        other => bail!("Unknown llm provider: {}", other),
    }
}

pub fn build_prompt(user_text: &str, ai_text: &str) -> String {
    format!(
        r#"Analyze the following exchange between a developer and an AI coding assistant and summarize it.

Developer:
{user_text}

Assistant:
{ai_text}

Reply with a single JSON object and nothing else, using these fields:
- "main_topic": short title of what the exchange is about
- "problem": the problem the developer had
- "solution": how it was solved
- "tech_stack": technologies involved (array of strings)
- "code_snippets": key code fragments, if any (array of strings)
- "key_points": important points (array of strings)
- "lessons": lessons learned (array of strings)
- "tags": 3-6 short lowercase keywords (array of strings)
- "summary": one or two sentence summary
- "context": relevant background"#
    )
}

/// Parse the model reply, tolerating a surrounding ```json fence.
pub fn parse_summary(content: &str) -> Result<TurnSummary> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);

    serde_json::from_str(body.trim())
        .with_context(|| format!("LLM reply is not a summary object: {}", preview_reply(body)))
}

fn preview_reply(body: &str) -> String {
    crate::models::preview(body, 120)
}

// ============ OpenAI-compatible chat client ============

pub struct ChatSummarizer {
    url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl ChatSummarizer {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required"))?;
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!("{} environment variable not set", config.api_key_env)
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            model,
            api_key,
            client,
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl Summarizer for ChatSummarizer {
    async fn summarize(&self, user_text: &str, ai_text: &str) -> Result<TurnSummary> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": build_prompt(user_text, ai_text)}
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("LLM request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("LLM API error {}: {}", status, text);
        }

        let chat: ChatResponse = response.json().await.context("invalid LLM response")?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("LLM response has no choices"))?;

        parse_summary(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let s = parse_summary(r#"{"main_topic":"Parser","summary":"Fixed it","tags":["rust"]}"#)
            .unwrap();
        assert_eq!(s.main_topic, "Parser");
        assert_eq!(s.tags, vec!["rust"]);
        assert!(s.lessons.is_empty());
    }

    #[test]
    fn parses_fenced_json() {
        let s = parse_summary("```json\n{\"summary\": \"ok\"}\n```").unwrap();
        assert_eq!(s.summary, "ok");
    }

    #[test]
    fn rejects_prose() {
        assert!(parse_summary("Sure! Here is the summary.").is_err());
    }

    #[test]
    fn prompt_includes_both_sides() {
        let p = build_prompt("how do I X", "do Y");
        assert!(p.contains("how do I X"));
        assert!(p.contains("do Y"));
        assert!(p.contains("\"tags\""));
    }

    #[test]
    fn disabled_llm_yields_no_summarizer() {
        assert!(create_summarizer(&LlmConfig::default()).unwrap().is_none());
    }
}
