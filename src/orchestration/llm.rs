//! Capability-typed LLM clients.
//!
//! The orchestrator needs two capabilities: structured extraction (the
//! Recommend stage) and long-context synthesis (the Synthesize stage).
//! Both go through the `LlmClient` seam so tests can substitute a
//! scripted client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{LlmProviderSection, LlmSection};
use crate::errors::LlmError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A single-turn completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub prompt: String,
    /// Overrides the client's configured limit.
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: None,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier, recorded as the provenance agent.
    fn model(&self) -> &str;

    async fn complete(&self, request: LlmRequest) -> Result<String, LlmError>;
}

/// The clients each stage is allowed to use.
#[derive(Clone)]
pub struct LlmClients {
    pub extraction: Arc<dyn LlmClient>,
    pub synthesis: Arc<dyn LlmClient>,
}

impl LlmClients {
    pub fn new(extraction: Arc<dyn LlmClient>, synthesis: Arc<dyn LlmClient>) -> Self {
        Self {
            extraction,
            synthesis,
        }
    }

    pub fn from_config(config: &LlmSection) -> Result<Self, LlmError> {
        Ok(Self {
            extraction: Arc::new(AnthropicClient::from_config(&config.extraction)?),
            synthesis: Arc::new(AnthropicClient::from_config(&config.synthesis)?),
        })
    }
}

// ── Anthropic Messages API ────────────────────────────────────────────

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    /// Missing keys surface as `Misconfiguration` on first use so the
    /// service can still start and serve status reads.
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicClient {
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        model: String,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Misconfiguration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model,
            max_tokens,
            temperature,
        })
    }

    pub fn from_config(config: &LlmProviderSection) -> Result<Self, LlmError> {
        if config.provider != "anthropic" {
            return Err(LlmError::Misconfiguration(format!(
                "Unsupported LLM provider '{}'",
                config.provider
            )));
        }
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            tracing::warn!(
                api_key_env = %config.api_key_env,
                model = %config.model,
                "LLM API key not set; calls will fail until it is configured"
            );
        }
        Self::new(
            api_key,
            config.base_url.clone(),
            config.model.clone(),
            config.max_tokens,
            config.temperature,
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: LlmRequest) -> Result<String, LlmError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            LlmError::Misconfiguration(format!("No API key configured for model {}", self.model))
        })?;
        let max_tokens = request.max_tokens.unwrap_or(self.max_tokens);
        let body = AnthropicRequest {
            model: &self.model,
            messages: vec![AnthropicMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens,
            temperature: self.temperature,
            system: &request.system,
        };

        tracing::debug!(model = %self.model, max_tokens, "invoking Anthropic Messages API");

        let response = self
            .http
            .post(&self.base_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(format!("Failed to parse Anthropic response: {}", e)))?;

        if let Some(usage) = &parsed.usage {
            tracing::debug!(
                model = %self.model,
                tokens_input = usage.input_tokens,
                tokens_output = usage.output_tokens,
                "Anthropic call completed"
            );
        }

        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.content_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();
        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text)
    }
}

// ── Offline client ────────────────────────────────────────────────────

type Responder = dyn Fn(&LlmRequest) -> Result<String, LlmError> + Send + Sync;

/// Client whose responses come from a closure. Counts calls.
pub struct ScriptedLlmClient {
    model: String,
    responder: Box<Responder>,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new<F>(model: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&LlmRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            model: model.into(),
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answer with the same text.
    pub fn fixed(model: impl Into<String>, response: impl Into<String>) -> Self {
        let response = response.into();
        Self::new(model, move |_| Ok(response.clone()))
    }

    /// Always fail with a transport error.
    pub fn failing(model: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(model, move |_| Err(LlmError::Transport(message.clone())))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: LlmRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(&request)
    }
}

/// Slice the outermost JSON object out of model output that may be
/// wrapped in prose or a fenced code block.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
