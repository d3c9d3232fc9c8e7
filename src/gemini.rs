//! Google Generative Language (Gemini) provider.
//!
//! Wire contract:
//! - request: `{contents:[{parts:[{text}]}], generationConfig:{maxOutputTokens, temperature, stopSequences?}}`
//! - auth: `?key=<secret>` query parameter (no bearer header)
//! - response: `{candidates:[{content:{parts:[{text}]}, finishReason}], promptFeedback:{tokenCount:{...}}}`

use async_trait::async_trait;
use http::header;
use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::error::{GatewayError, Result};
use crate::models::{Model, Provider, Request, Response, TokenUsage};
use crate::providers::{effective_max_tokens, send_json, validate_request, CallContext, ProviderClient};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub max_output_tokens: u32,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<CandidateContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<CandidatePart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandidatePart {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub token_count: Option<TokenCount>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCount {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub completion_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

impl GenerateContentResponse {
    fn token_usage(&self) -> TokenUsage {
        if let Some(tc) = self
            .prompt_feedback
            .as_ref()
            .and_then(|pf| pf.token_count.as_ref())
        {
            return TokenUsage {
                prompt_tokens: tc.prompt_token_count,
                completion_tokens: tc.completion_token_count,
                total_tokens: tc.total_token_count,
            };
        }
        self.usage_metadata
            .as_ref()
            .map(|um| TokenUsage {
                prompt_tokens: um.prompt_token_count,
                completion_tokens: um.candidates_token_count,
                total_tokens: um.total_token_count,
            })
            .unwrap_or_default()
    }
}

pub struct GeminiClient {
    base_url: String,
    http: reqwest::Client,
    models: Vec<Model>,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, base_url: Option<String>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or_else(|| GEMINI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            http,
            models: vec![
                Model::new(
                    "gemini-pro",
                    Provider::Google,
                    "Gemini Pro",
                    "Google's most capable model for text generation",
                    32768,
                    0.00025,
                ),
                Model::new(
                    "gemini-pro-vision",
                    Provider::Google,
                    "Gemini Pro Vision",
                    "Google's model for text and image generation",
                    32768,
                    0.00025,
                ),
            ],
        }
    }

    pub fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.base_url, model)
    }

    pub fn to_wire(&self, req: &Request) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: req.prompt.clone(),
                }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: effective_max_tokens(&self.models, req),
                temperature: req.temperature.unwrap_or(0.0),
                stop_sequences: req.stop_sequences().map(|s| s.to_vec()),
            },
        }
    }

    /// Prepared HTTP request; the credential travels as the `key` query parameter.
    pub fn http_request(&self, req: &Request, secret: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.endpoint(&req.model))
            .query(&[("key", secret)])
            .header(header::CONTENT_TYPE, "application/json")
            .json(&self.to_wire(req))
    }

    pub fn from_wire(
        &self,
        req: &Request,
        wire: GenerateContentResponse,
        latency: std::time::Duration,
    ) -> Result<Response> {
        let usage = wire.token_usage();
        let candidate = wire
            .candidates
            .into_iter()
            .next()
            .ok_or(GatewayError::EmptyResponse(Provider::Google))?;
        let text = candidate
            .content
            .and_then(|c| c.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or(GatewayError::EmptyResponse(Provider::Google))?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        Ok(Response {
            id: format!("gemini-{nanos}"),
            provider: req.provider,
            model: req.model.clone(),
            text,
            usage,
            finish_reason: candidate.finish_reason.unwrap_or_default(),
            metadata: req.metadata.clone(),
            latency,
        })
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    async fn query(&self, ctx: &CallContext, req: &Request, secret: &str) -> Result<Response> {
        validate_request(req)?;
        let builder = self.http_request(req, secret);

        let start = Instant::now();
        let wire: GenerateContentResponse =
            ctx.run(send_json(Provider::Google, builder)).await?;
        let latency = start.elapsed();

        tracing::debug!(
            provider = "google",
            model = %req.model,
            latency_ms = latency.as_millis() as u64,
            "Gemini content received"
        );
        self.from_wire(req, wire, latency)
    }

    fn list_models(&self) -> Vec<Model> {
        self.models.clone()
    }

    fn provider(&self) -> Provider {
        Provider::Google
    }
}
