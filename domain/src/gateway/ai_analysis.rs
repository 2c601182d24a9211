//! Chat-completions client used for portfolio analysis.
//!
//! Each completion is a single request wrapped in a [`RetryExecutor`]:
//! rate limits, 5xx responses and network failures are retried with
//! exponential backoff, anything else is returned to the caller at once.

use std::time::Duration;

use integration_auth::http::{
    endpoint, send_json, AuthenticatedClient, AuthenticatedClientBuilder, BackoffPolicy,
    RetryExecutor,
};
use log::*;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use service::config::Config;

use crate::error::{config_error, validation_error, DomainErrorKind, Error, ExternalErrorKind};

/// Upper bound on a single backoff wait, including server-supplied ones.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AnalysisSettings {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl AnalysisSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.ai_base_url().to_string(),
            api_key: config.ai_api_key().map(SecretString::from),
            model: config.ai_model().to_string(),
            timeout: config.http_timeout(),
            max_attempts: config.ai_max_attempts,
            base_delay: config.ai_base_delay(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct AnalysisClient {
    http: AuthenticatedClient,
    settings: AnalysisSettings,
    executor: RetryExecutor,
}

impl AnalysisClient {
    pub fn new(settings: AnalysisSettings) -> Result<Self, Error> {
        let http = AuthenticatedClientBuilder::new()
            .with_timeout(settings.timeout)
            .build()?;
        let policy = BackoffPolicy::new(settings.max_attempts, settings.base_delay)
            .with_max_delay(MAX_RETRY_DELAY);
        Ok(Self {
            http,
            settings,
            executor: RetryExecutor::new(policy),
        })
    }

    pub async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, Error> {
        let Some(api_key) = &self.settings.api_key else {
            return Err(config_error("AI_API_KEY is not configured"));
        };
        if user_prompt.trim().is_empty() {
            return Err(validation_error("prompt must not be empty"));
        }

        let url = endpoint(&self.settings.base_url, "/chat/completions")?;
        let request = ChatRequest {
            model: &self.settings.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
        };

        let body = self
            .executor
            .run(|attempt| {
                debug!(
                    "Requesting completion from {} (attempt {})",
                    self.settings.model, attempt
                );
                send_json(
                    self.http
                        .post(url.clone())
                        .bearer_auth(api_key.expose_secret())
                        .json(&request),
                )
            })
            .await?;

        let response: ChatResponse = serde_json::from_value(body)?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| Error {
                source: Some("completion contained no message content".into()),
                error_kind: DomainErrorKind::External(ExternalErrorKind::InvalidResponse),
            })
    }
}
