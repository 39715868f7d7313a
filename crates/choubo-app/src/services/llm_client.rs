//! Anthropic messages API client behind a small trait seam so jobs can be
//! exercised with scripted responses in tests.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const MAX_TOKENS: u32 = 2048;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing llm configuration: set ANTHROPIC_API_KEY")]
    MissingConfig,
    #[error("llm request failed with status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("llm response contained no text content")]
    EmptyResponse,
    #[error("llm transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Single-turn completion against a chat model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError>;

    /// Model identifier recorded alongside anything this client produced.
    fn model_name(&self) -> String;
}

pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl AnthropicClient {
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| LlmError::MissingConfig)?;
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self {
            http: reqwest::Client::new(),
            api_key,
            model,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });

        let response = self
            .http
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "llm request rejected");
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessagesResponse = response.json().await?;
        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();
        if text.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text)
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

/// Pull the first top-level JSON object out of a completion that may wrap it
/// in prose or a code fence.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_from_fenced_completion() {
        let text = "回答:\n```json\n{\"document_type\": \"invoice\", \"confidence\": 0.9}\n```\n";
        let extracted = extract_json_object(text).expect("object present");
        let parsed: serde_json::Value = serde_json::from_str(extracted).expect("valid json");
        assert_eq!(parsed["document_type"], "invoice");
    }

    #[test]
    fn extracts_bare_object() {
        assert_eq!(extract_json_object("{\"a\":1}"), Some("{\"a\":1}"));
    }

    #[test]
    fn missing_braces_yield_none() {
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("} backwards {"), None);
    }
}
