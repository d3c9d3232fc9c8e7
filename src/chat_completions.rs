//! Chat Completions provider family (OpenAI, Groq).
//!
//! Wire contract:
//! - request: `{model, messages:[{role, content}], max_tokens, temperature, stop?}`
//! - auth: `Authorization: Bearer <secret>`
//! - response: `{id, choices:[{message:{content}, finish_reason}], usage:{...}}`

use async_trait::async_trait;
use http::header;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::{GatewayError, Result};
use crate::models::{Model, Provider, Request, Response, TokenUsage};
use crate::providers::{effective_max_tokens, send_json, validate_request, CallContext, ProviderClient};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: ChatUsage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub message: ChatChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Client for any upstream that speaks the Chat Completions schema.
pub struct ChatCompletionsClient {
    provider: Provider,
    base_url: String,
    http: reqwest::Client,
    models: Vec<Model>,
}

impl ChatCompletionsClient {
    pub fn new(
        provider: Provider,
        http: reqwest::Client,
        base_url: impl Into<String>,
        models: Vec<Model>,
    ) -> Self {
        Self {
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            models,
        }
    }

    pub fn openai(http: reqwest::Client, base_url: Option<String>) -> Self {
        Self::new(
            Provider::OpenAI,
            http,
            base_url.unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            vec![
                Model::new(
                    "gpt-4",
                    Provider::OpenAI,
                    "GPT-4",
                    "OpenAI's most capable model",
                    8192,
                    0.03,
                ),
                Model::new(
                    "gpt-3.5-turbo",
                    Provider::OpenAI,
                    "GPT-3.5 Turbo",
                    "OpenAI's fastest model",
                    4096,
                    0.002,
                ),
            ],
        )
    }

    pub fn groq(http: reqwest::Client, base_url: Option<String>) -> Self {
        Self::new(
            Provider::Groq,
            http,
            base_url.unwrap_or_else(|| GROQ_BASE_URL.to_string()),
            vec![
                Model::new(
                    "llama2-70b-4096",
                    Provider::Groq,
                    "Llama2 70B",
                    "High-performance Llama2 70B model",
                    4096,
                    0.0007,
                ),
                Model::new(
                    "mixtral-8x7b-32768",
                    Provider::Groq,
                    "Mixtral 8x7B",
                    "High-performance Mixtral 8x7B model",
                    32768,
                    0.00027,
                ),
            ],
        )
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Translate a normalized request into the Chat Completions body.
    pub fn to_wire(&self, req: &Request) -> ChatRequest {
        ChatRequest {
            model: req.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: req.prompt.clone(),
            }],
            max_tokens: effective_max_tokens(&self.models, req),
            temperature: req.temperature.unwrap_or(0.0),
            stop: req.stop_sequences().map(|s| s.to_vec()),
        }
    }

    /// Prepared HTTP request; the credential travels as a bearer token.
    pub fn http_request(&self, req: &Request, secret: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.endpoint())
            .header(header::CONTENT_TYPE, "application/json")
            .bearer_auth(secret)
            .json(&self.to_wire(req))
    }

    /// Map the first choice and the usage block into a normalized response.
    pub fn from_wire(
        &self,
        req: &Request,
        wire: ChatResponse,
        latency: std::time::Duration,
    ) -> Result<Response> {
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or(GatewayError::EmptyResponse(self.provider))?;

        Ok(Response {
            id: wire
                .id
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())),
            provider: req.provider,
            model: req.model.clone(),
            text: choice.message.content.unwrap_or_default(),
            usage: TokenUsage {
                prompt_tokens: wire.usage.prompt_tokens,
                completion_tokens: wire.usage.completion_tokens,
                total_tokens: wire.usage.total_tokens,
            },
            finish_reason: choice.finish_reason.unwrap_or_default(),
            metadata: req.metadata.clone(),
            latency,
        })
    }
}

#[async_trait]
impl ProviderClient for ChatCompletionsClient {
    async fn query(&self, ctx: &CallContext, req: &Request, secret: &str) -> Result<Response> {
        validate_request(req)?;
        let builder = self.http_request(req, secret);

        let start = Instant::now();
        let wire: ChatResponse = ctx.run(send_json(self.provider, builder)).await?;
        let latency = start.elapsed();

        tracing::debug!(
            provider = %self.provider,
            model = %req.model,
            latency_ms = latency.as_millis() as u64,
            "Chat completion received"
        );
        self.from_wire(req, wire, latency)
    }

    fn list_models(&self) -> Vec<Model> {
        self.models.clone()
    }

    fn provider(&self) -> Provider {
        self.provider
    }
}
