//! Provider client abstraction.
//!
//! Every upstream vendor is a `ProviderClient`; the registry selects one by provider tag.
//! Clients own their wire schema and their static model catalogue.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chat_completions::ChatCompletionsClient;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::gemini::GeminiClient;
use crate::models::{Model, Provider, Request, Response};

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Perform one upstream call for `req` authenticated with `secret`.
    async fn query(&self, ctx: &CallContext, req: &Request, secret: &str) -> Result<Response>;

    /// Static catalogue, fixed at construction.
    fn list_models(&self) -> Vec<Model>;

    fn provider(&self) -> Provider;
}

/// Caller-side cancellation and deadline for a single gateway call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` until it finishes, the token fires, or the deadline passes.
    /// The future is dropped on cancellation, which aborts an in-flight HTTP exchange.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let bounded = async {
            match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::DeadlineExceeded),
                },
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GatewayError::Cancelled),
            result = bounded => result,
        }
    }
}

/// Reject requests no provider could serve.
pub(crate) fn validate_request(req: &Request) -> Result<()> {
    if req.model.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("model is required".into()));
    }
    if req.prompt.is_empty() {
        return Err(GatewayError::InvalidRequest("prompt is required".into()));
    }
    Ok(())
}

/// Requested token ceiling, falling back to the catalogue entry for the model.
pub(crate) fn effective_max_tokens(models: &[Model], req: &Request) -> u32 {
    req.max_tokens.unwrap_or_else(|| {
        models
            .iter()
            .find(|m| m.id == req.model)
            .map(|m| m.max_tokens)
            .unwrap_or(0)
    })
}

/// Send a prepared request and decode a JSON body, mapping every transport,
/// status and decoding failure to `ProviderInvocation`.
pub(crate) async fn send_json<T: DeserializeOwned>(
    provider: Provider,
    builder: reqwest::RequestBuilder,
) -> Result<T> {
    let resp = builder.send().await.map_err(|e| {
        GatewayError::invocation(provider, format!("failed to send request: {}", transport_error(e)))
    })?;

    let status = resp.status();
    let bytes = resp.bytes().await.map_err(|e| {
        GatewayError::invocation(provider, format!("failed to read response: {}", transport_error(e)))
    })?;

    if !status.is_success() {
        let snippet = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).into_owned();
        return Err(GatewayError::invocation(
            provider,
            format!("upstream returned {}: {}", status.as_u16(), snippet.trim()),
        ));
    }

    serde_json::from_slice(&bytes)
        .map_err(|e| GatewayError::invocation(provider, format!("failed to parse response: {e}")))
}

/// Describe a transport failure without its URL; the query string may carry a credential.
fn transport_error(e: reqwest::Error) -> String {
    let e = e.without_url();
    let mut out = e.to_string();
    let mut source = std::error::Error::source(&e);
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Build the clients enabled in `config`, sharing one HTTP connection pool.
pub fn build_clients(
    config: &GatewayConfig,
    http: &reqwest::Client,
) -> Vec<Arc<dyn ProviderClient>> {
    let mut out: Vec<Arc<dyn ProviderClient>> = Vec::new();
    for pc in config.providers.iter().filter(|p| p.enabled) {
        let base = pc.base_url.clone();
        match pc.provider {
            Provider::OpenAI => out.push(Arc::new(ChatCompletionsClient::openai(
                http.clone(),
                base,
            ))),
            Provider::Groq => out.push(Arc::new(ChatCompletionsClient::groq(http.clone(), base))),
            Provider::Google => out.push(Arc::new(GeminiClient::new(http.clone(), base))),
            Provider::Anthropic | Provider::Mistral => {
                tracing::warn!(
                    provider = %pc.provider,
                    "No client implementation for provider; skipping registration"
                );
            }
        }
    }
    out
}
