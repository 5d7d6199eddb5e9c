//! LLM provider port.
//!
//! The provider is asked for schema-constrained JSON: the request carries a
//! `SchemaDescriptor` and the adapter validates the parsed response against it
//! before returning, so callers never see free-form prose.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelClass {
    Small,
    Large,
}

impl ModelClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelClass::Small => "small",
            ModelClass::Large => "large",
        }
    }
}

/// Minimal JSON schema: a named object with required string-or-number keys.
/// The adapter rejects responses that parse but miss a required key.
#[derive(Debug, Clone)]
pub struct SchemaDescriptor {
    pub name: &'static str,
    pub required: &'static [&'static str],
}

impl SchemaDescriptor {
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let obj = value
            .as_object()
            .ok_or_else(|| format!("{}: expected a JSON object", self.name))?;
        for key in self.required {
            if !obj.contains_key(*key) {
                return Err(format!("{}: missing required key {key}", self.name));
            }
        }
        Ok(())
    }

    /// Instruction block appended to the system prompt.
    pub fn prompt_instruction(&self) -> String {
        format!(
            "Respond with a single JSON object (no prose, no code fences) containing the keys: {}.",
            self.required.join(", ")
        )
    }
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub user: String,
    pub schema: SchemaDescriptor,
    pub model_class: ModelClass,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: Value,
    pub usage_tokens: u64,
    pub latency_ms: u64,
    pub provider_id: String,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, req: LlmRequest) -> AppResult<LlmResponse>;
}

// ============================================================================
// OpenRouter adapter
// ============================================================================

#[derive(Clone)]
pub struct OpenRouterLlm {
    http: reqwest::Client,
    api_key: String,
    small_model: String,
    large_model: String,
}

impl OpenRouterLlm {
    pub fn new(
        http: reqwest::Client,
        api_key: String,
        small_model: String,
        large_model: String,
    ) -> Self {
        Self {
            http,
            api_key,
            small_model,
            large_model,
        }
    }

    fn model_for(&self, class: ModelClass) -> &str {
        match class {
            ModelClass::Small => &self.small_model,
            ModelClass::Large => &self.large_model,
        }
    }
}

/// Strip optional markdown code fences some models wrap JSON in.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

#[async_trait]
impl LlmProvider for OpenRouterLlm {
    async fn complete(&self, req: LlmRequest) -> AppResult<LlmResponse> {
        let start = Instant::now();
        let model = self.model_for(req.model_class).to_string();

        let system = format!("{}\n\n{}", req.system, req.schema.prompt_instruction());
        let body = ChatCompletionRequest {
            model: model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system,
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: req.user,
                },
            ],
            temperature: Some(req.temperature),
            max_tokens: Some(req.max_tokens),
        };

        let resp = self
            .http
            .post("https://openrouter.ai/api/v1/chat/completions")
            .timeout(req.timeout)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::ProviderTransient(format!("timeout: llm {model}"))
                } else {
                    AppError::ProviderTransient(format!("llm request: {e}"))
                }
            })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = text.chars().take(400).collect();
            return Err(AppError::ProviderTransient(format!(
                "llm {}: {}",
                status.as_u16(),
                snippet
            )));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| AppError::ProviderTransient(format!("llm json parse: {e}")))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let value: Value = serde_json::from_str(strip_fences(&content))
            .map_err(|e| AppError::ProviderTransient(format!("llm schema parse: {e}")))?;
        req.schema
            .validate(&value)
            .map_err(AppError::ProviderTransient)?;

        Ok(LlmResponse {
            content: value,
            usage_tokens: parsed
                .usage
                .as_ref()
                .and_then(|u| u.total_tokens)
                .unwrap_or(0),
            latency_ms: start.elapsed().as_millis() as u64,
            provider_id: model,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: Option<u64>,
}

// ============================================================================
// Scripted fake
// ============================================================================

/// Returns pre-scripted responses in order; errors are injectable.
/// Used both in tests and when the service runs without an API key.
pub struct FakeLlm {
    script: Mutex<VecDeque<AppResult<Value>>>,
    calls: Mutex<Vec<(ModelClass, String)>>,
}

impl FakeLlm {
    pub fn scripted(responses: Vec<AppResult<Value>>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always fails, for breaker tests and keyless deployments.
    pub fn unavailable() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<(ModelClass, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for FakeLlm {
    async fn complete(&self, req: LlmRequest) -> AppResult<LlmResponse> {
        self.calls.lock().push((req.model_class, req.user.clone()));
        let next = self.script.lock().pop_front();
        match next {
            Some(Ok(value)) => {
                req.schema
                    .validate(&value)
                    .map_err(AppError::ProviderTransient)?;
                Ok(LlmResponse {
                    content: value,
                    usage_tokens: 42,
                    latency_ms: 1,
                    provider_id: format!("fake-{}", req.model_class.as_str()),
                })
            }
            Some(Err(e)) => Err(e),
            None => Err(AppError::ProviderTransient(
                "fake llm script exhausted".to_string(),
            )),
        }
    }
}
