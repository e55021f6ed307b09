//! Language model collaborator.
//!
//! The repair loop only sees [`ChatModel`]. [`OpenAiChatModel`] talks to any
//! OpenAI-compatible `/chat/completions` endpoint; [`RetryingModel`] wraps a
//! model with the configured backoff so the loop never retries a call itself.

use std::time::Duration;

use async_trait::async_trait;
use coordination::Message;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ModelConfig, RetryPolicy};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model request failed: {0}")]
    Request(String),

    #[error("Model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse model response: {0}")]
    Parse(String),

    /// Credentials or the request itself were rejected; retrying cannot help.
    #[error("Unrecoverable model error: {0}")]
    Unrecoverable(String),
}

impl ModelError {
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            Self::Unrecoverable(_) => true,
            Self::Status { status, .. } => matches!(status, 400 | 401 | 403 | 404),
            _ => false,
        }
    }
}

pub type ModelResult<T> = Result<T, ModelError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send `prompt` as the newest user turn after `history`.
    async fn generate(&self, prompt: &str, history: &[Message]) -> ModelResult<String>;
}

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct OpenAiChatModel {
    config: ModelConfig,
    client: reqwest::Client,
}

impl OpenAiChatModel {
    pub fn new(config: ModelConfig) -> ModelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ModelError::Unrecoverable(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn request_body(&self, prompt: &str, history: &[Message]) -> serde_json::Value {
        let mut messages: Vec<Message> = history.to_vec();
        messages.push(Message::user(prompt));
        serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn generate(&self, prompt: &str, history: &[Message]) -> ModelResult<String> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&self.request_body(prompt, history));
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status { status, body });
        }

        let resp_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError::Parse(e.to_string()))?;

        let content = resp_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ModelError::Parse("missing choices[0].message.content".into()))?
            .to_string();

        debug!(model = %self.config.model, chars = content.len(), "Model responded");
        Ok(content)
    }
}

/// Retries recoverable failures with backoff.
///
/// Once attempts are exhausted the call yields an empty response; the loop
/// treats that like an unparseable answer. Unrecoverable errors surface at once.
pub struct RetryingModel<M> {
    inner: M,
    policy: RetryPolicy,
}

impl<M: ChatModel> RetryingModel<M> {
    pub fn new(inner: M, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<M: ChatModel> ChatModel for RetryingModel<M> {
    async fn generate(&self, prompt: &str, history: &[Message]) -> ModelResult<String> {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 0..attempts {
            match self.inner.generate(prompt, history).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_unrecoverable() => return Err(e),
                Err(e) => {
                    if attempt + 1 == attempts {
                        warn!(attempts, error = %e, "Model call failed, giving up");
                        break;
                    }
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Model call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 10,
            multiplier: 2.0,
            min_delay_ms: 10,
            max_delay_ms: 40,
        }
    }

    #[test]
    fn test_unrecoverable_classification() {
        assert!(ModelError::Unrecoverable("bad key".into()).is_unrecoverable());
        assert!(ModelError::Status { status: 401, body: String::new() }.is_unrecoverable());
        assert!(!ModelError::Status { status: 429, body: String::new() }.is_unrecoverable());
        assert!(!ModelError::Request("connection reset".into()).is_unrecoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let mut mock = MockChatModel::new();
        let mut seq = Sequence::new();
        mock.expect_generate()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(ModelError::Status { status: 503, body: "busy".into() }));
        mock.expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("[Change Start a.py]".into()));

        let model = RetryingModel::new(mock, fast_policy(3));
        assert_eq!(model.generate("fix", &[]).await.unwrap(), "[Change Start a.py]");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_returns_empty() {
        let mut mock = MockChatModel::new();
        mock.expect_generate()
            .times(3)
            .returning(|_, _| Err(ModelError::Request("timeout".into())));

        let model = RetryingModel::new(mock, fast_policy(3));
        assert_eq!(model.generate("fix", &[]).await.unwrap(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_aborts_immediately() {
        let mut mock = MockChatModel::new();
        mock.expect_generate()
            .times(1)
            .returning(|_, _| Err(ModelError::Status { status: 403, body: "forbidden".into() }));

        let model = RetryingModel::new(mock, fast_policy(5));
        let err = model.generate("fix", &[]).await.unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn test_request_body_appends_prompt() {
        let model = OpenAiChatModel::new(ModelConfig::default()).unwrap();
        let body = model.request_body("second", &[Message::user("first"), Message::assistant("reply")]);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[2]["content"], "second");
        assert_eq!(body["model"], ModelConfig::default().model);
    }
}
