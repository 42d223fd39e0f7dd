//! LLM and embedding seams.
//!
//! The core consumes two capabilities: `chat` over a message list and
//! `json_complete` for structured extraction, plus a fixed-dimension text
//! embedder. `HttpLlm` and `HttpEmbedder` implement them over
//! OpenAI-compatible or Anthropic-native APIs; provider-specific JSON-mode
//! hints stay inside this module.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MemoryError, Result};
use crate::EmbedCache;

fn llm_err(msg: impl Into<String>) -> MemoryError {
    MemoryError::Llm(msg.into())
}

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const CHAT_MAX_TOKENS: u32 = 1024;

/// One chat message as sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

/// Conversational LLM capability consumed by the orchestrator and distiller.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Full chat completion over an ordered message list.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Single-prompt completion expected to yield a JSON object. Returns the
    /// raw response text; the caller owns parsing so it can repair
    /// truncation.
    async fn json_complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
}

/// Deterministic text-to-vector capability with a fixed dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dim(&self) -> usize;
}

/// Which wire format to speak.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
}

#[derive(Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub chat_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
}

// ---------------------------------------------------------------------------
// OpenAI wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Anthropic wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

/// HTTP-backed language model client.
pub struct HttpLlm {
    cfg: LlmConfig,
    client: reqwest::Client,
}

impl HttpLlm {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| llm_err(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { cfg, client })
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.cfg.api_key.is_empty() {
            return builder;
        }
        match self.cfg.provider {
            LlmProvider::Anthropic => builder
                .header("x-api-key", &self.cfg.api_key)
                .header("anthropic-version", "2023-06-01"),
            LlmProvider::OpenAi => {
                builder.header("Authorization", format!("Bearer {}", self.cfg.api_key))
            }
        }
    }

    async fn complete_openai(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        json_mode: bool,
    ) -> Result<String> {
        let req = ChatRequest {
            model: &self.cfg.model,
            messages,
            temperature: self.cfg.temperature,
            max_tokens,
            response_format: json_mode.then(|| serde_json::json!({"type": "json_object"})),
        };
        let resp = self
            .auth(self.client.post(&self.cfg.chat_url).json(&req))
            .send()
            .await
            .map_err(|e| llm_err(format!("LLM request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(llm_err(format!("LLM returned {status}: {body}")));
        }
        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| llm_err(format!("LLM response parse failed: {e}")))?;
        Ok(chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn complete_anthropic(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String> {
        // Anthropic takes the system prompt out-of-band.
        let system = messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.clone());
        let turns: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| m.role != "system")
            .cloned()
            .collect();
        let req = AnthropicRequest {
            model: &self.cfg.model,
            max_tokens,
            system,
            messages: turns,
            temperature: self.cfg.temperature,
        };
        let resp = self
            .auth(self.client.post(&self.cfg.chat_url).json(&req))
            .send()
            .await
            .map_err(|e| llm_err(format!("Anthropic request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(llm_err(format!("Anthropic returned {status}: {body}")));
        }
        let ar: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| llm_err(format!("Anthropic response parse failed: {e}")))?;
        Ok(ar
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join(""))
    }
}

#[async_trait]
impl LanguageModel for HttpLlm {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        match self.cfg.provider {
            LlmProvider::OpenAi => self.complete_openai(messages, CHAT_MAX_TOKENS, false).await,
            LlmProvider::Anthropic => self.complete_anthropic(messages, CHAT_MAX_TOKENS).await,
        }
    }

    async fn json_complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let messages = [ChatMessage::user(prompt)];
        match self.cfg.provider {
            LlmProvider::OpenAi => self.complete_openai(&messages, max_tokens, true).await,
            LlmProvider::Anthropic => self.complete_anthropic(&messages, max_tokens).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Embeddings (always OpenAI-compatible)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct EmbedConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub dim: usize,
}

/// HTTP-backed embedder with an LRU cache and retry on transient failures.
pub struct HttpEmbedder {
    cfg: EmbedConfig,
    client: reqwest::Client,
    cache: EmbedCache,
}

impl HttpEmbedder {
    pub fn new(cfg: EmbedConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| MemoryError::Embedding(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            cfg,
            client,
            cache: EmbedCache::new(crate::thresholds::EMBED_CACHE_CAPACITY),
        })
    }

    async fn fetch(&self, text: &str) -> Result<Vec<f32>> {
        let req = EmbedRequest { model: &self.cfg.model, input: vec![text] };
        let mut builder = self.client.post(&self.cfg.url).json(&req);
        if !self.cfg.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.cfg.api_key));
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| MemoryError::Embedding(format!("embedding request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(MemoryError::Embedding(format!(
                "embedding API returned {status}: {body}"
            )));
        }
        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| MemoryError::Embedding(format!("embedding response parse failed: {e}")))?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| MemoryError::Embedding("embedding API returned no vectors".into()))?;
        if embedding.len() != self.cfg.dim {
            return Err(MemoryError::Embedding(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.cfg.dim,
                embedding.len()
            )));
        }
        Ok(embedding)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.cache.get(text) {
            return Ok(hit);
        }
        let embedding = (|| self.fetch(text))
            .retry(ExponentialBuilder::default().with_max_times(3))
            .notify(|err, dur| {
                warn!(error = %err, retry_after = ?dur, "embedding call failed, retrying");
            })
            .await?;
        self.cache.insert(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    fn dim(&self) -> usize {
        self.cfg.dim
    }
}
