use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::LlmConfig;

/// Per-call budget for full decision prompts.
pub const DECISION_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-call budget for the cheap semantic-visibility check.
pub const SEMANTIC_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-call budget for plan generation.
pub const PLANNER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    /// The endpoint answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    /// The request never completed (connect failure, timeout).
    #[error("transport error: {0}")]
    Transport(String),
    /// A 2xx response that carried no usable content.
    #[error("empty response from model")]
    Empty,
}

impl LlmError {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Thin chat-completions client shared by the decision oracle, the
/// semantic gate, and the planner. OpenAI-wire-compatible; the endpoint
/// and model come from configuration.
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    api_url: String,
    model: String,
}

impl LlmClient {
    /// Returns `None` when no API key is configured, which switches every
    /// caller to its heuristic path.
    pub fn from_config(cfg: &LlmConfig) -> Option<Self> {
        let api_key = cfg.api_key.clone()?;
        Some(Self {
            http: reqwest::Client::new(),
            api_key,
            api_url: cfg.api_url.clone(),
            model: cfg.model.clone(),
        })
    }

    /// Send one chat request and return the assistant text.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
        });

        let response = self
            .http
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message = payload["error"]["message"]
                .as_str()
                .unwrap_or("unknown API error")
                .to_string();
            warn!(status = status.as_u16(), %message, "chat completion failed");
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_owned)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::Empty)?;

        debug!(chars = content.len(), "chat completion received");
        Ok(content)
    }
}

/// Pull a JSON object out of an untrusted model response: strip markdown
/// fences, then take the window from the first `{` to the last `}`.
pub fn extract_json(raw: &str) -> Option<&str> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&cleaned[start..=end])
}
