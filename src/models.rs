//! Normalized request/response shapes shared by the router and every provider client.
//!
//! These are the provider-agnostic types callers see on `/v1/llm/query`. Provider wire
//! schemas live next to their clients (`chat_completions`, `gemini`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Upstream LLM vendor tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Groq,
    #[serde(alias = "gemini")]
    Google,
    #[serde(rename = "openai")]
    OpenAI,
    Anthropic,
    Mistral,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Groq => "groq",
            Provider::Google => "google",
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Mistral => "mistral",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(Provider::Groq),
            "google" | "gemini" => Ok(Provider::Google),
            "openai" => Ok(Provider::OpenAI),
            "anthropic" => Ok(Provider::Anthropic),
            "mistral" => Ok(Provider::Mistral),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// A named capability offered by a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Model {
    pub id: String,
    pub provider: Provider,
    pub name: String,
    pub description: String,
    pub max_tokens: u32,
    #[serde(rename = "cost_per_1k")]
    pub cost_per_1k: f64,
}

impl Model {
    pub fn new(
        id: &str,
        provider: Provider,
        name: &str,
        description: &str,
        max_tokens: u32,
        cost_per_1k: f64,
    ) -> Self {
        Self {
            id: id.to_string(),
            provider,
            name: name.to_string(),
            description: description.to_string(),
            max_tokens,
            cost_per_1k,
        }
    }
}

/// Normalized query. Also the JSON body accepted by `POST /v1/llm/query`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub provider: Provider,
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Request {
    pub fn new(provider: Provider, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            prompt: prompt.into(),
            max_tokens: None,
            temperature: None,
            stop: None,
            stream: None,
            metadata: HashMap::new(),
        }
    }

    /// Stop sequences, treating an empty list the same as none.
    pub fn stop_sequences(&self) -> Option<&[String]> {
        self.stop.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Normalized completion returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: String,
    pub provider: Provider,
    pub model: String,
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Upstream round-trip time, serialized as integer nanoseconds.
    #[serde(with = "duration_nanos")]
    pub latency: Duration,
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}
