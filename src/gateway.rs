//! Gateway router: one inbound request → model lookup → credential → upstream call →
//! metrics and accounting.
//!
//! Request-path failures return before any accounting side effect. Accounting-path
//! failures after a successful upstream call are logged and swallowed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::accounting::UsageAccountant;
use crate::error::{GatewayError, Result};
use crate::key_pool::{now_millis, KeyPoolManager};
use crate::metrics::{MetricsSink, TokenKind};
use crate::models::{Model, Request, Response};
use crate::providers::{CallContext, ProviderClient};
use crate::registry::ProviderRegistry;

pub const META_ORGANIZATION_ID: &str = "organization_id";
pub const META_PROJECT_ID: &str = "project_id";
pub const META_USER_ID: &str = "user_id";

/// Identity of the caller, attached to every request's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerTags {
    pub organization_id: String,
    pub project_id: String,
    pub user_id: String,
}

pub struct GatewayRouter {
    registry: Arc<ProviderRegistry>,
    pool: Arc<KeyPoolManager>,
    accountant: UsageAccountant,
    metrics: Arc<dyn MetricsSink>,
}

impl GatewayRouter {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        pool: Arc<KeyPoolManager>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            accountant: UsageAccountant::new(pool.clone()),
            registry,
            pool,
            metrics,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &KeyPoolManager {
        &self.pool
    }

    pub fn metrics(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }

    /// Resolve model, client and credential without touching any state.
    fn resolve(&self, req: &Request) -> Result<(Model, Arc<dyn ProviderClient>)> {
        if req.model.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("model is required".into()));
        }
        if req.prompt.is_empty() {
            return Err(GatewayError::InvalidRequest("prompt is required".into()));
        }

        let model = self
            .registry
            .model_for(&req.model)
            .ok_or_else(|| GatewayError::ModelNotFound(req.model.clone()))?;

        let client = self.registry.client_for(req.provider)?;

        if model.provider != req.provider {
            return Err(GatewayError::ModelProviderMismatch {
                model: model.id,
                provider: req.provider,
            });
        }
        Ok((model, client))
    }

    /// Execute `req` on behalf of `tags`.
    pub async fn query(
        &self,
        ctx: &CallContext,
        tags: &CallerTags,
        mut req: Request,
    ) -> Result<Response> {
        let (model, client) = self.resolve(&req)?;
        let credential = self.pool.acquire(req.provider)?;

        // Reserved keys win over caller-supplied ones.
        req.metadata
            .insert(META_ORGANIZATION_ID.into(), tags.organization_id.clone());
        req.metadata
            .insert(META_PROJECT_ID.into(), tags.project_id.clone());
        req.metadata.insert(META_USER_ID.into(), tags.user_id.clone());

        let provider = req.provider;
        let start = Instant::now();
        let outcome = client.query(ctx, &req, &credential.secret).await;
        let elapsed = start.elapsed();

        let response = match outcome {
            Ok(resp) => resp,
            Err(err) => {
                self.metrics.observe_error(provider, &req.model);
                if err.is_cancellation() {
                    info!(provider = %provider, model = %req.model, error = %err, "Request abandoned");
                } else {
                    warn!(
                        provider = %provider,
                        model = %req.model,
                        key_id = %credential.id,
                        error = %err,
                        "Provider call failed"
                    );
                }
                return Err(err);
            }
        };

        self.metrics
            .observe_latency(provider, &req.model, elapsed.as_secs_f64());
        let usage = response.usage;
        for (kind, count) in [
            (TokenKind::Prompt, usage.prompt_tokens),
            (TokenKind::Completion, usage.completion_tokens),
            (TokenKind::Total, usage.total_tokens),
        ] {
            self.metrics.observe_tokens(provider, &req.model, kind, count);
        }

        let cost = UsageAccountant::cost(&model, &usage);
        self.accountant.record(&credential.id, &usage, cost);
        if let Err(e) = self.pool.mark_used(&credential.id, now_millis()) {
            warn!(key_id = %credential.id, error = %e, "Failed to update credential last_used");
        }

        debug!(
            provider = %provider,
            model = %req.model,
            key_id = %credential.id,
            latency_ms = elapsed.as_millis() as u64,
            total_tokens = usage.total_tokens,
            cost,
            "Request completed"
        );
        Ok(response)
    }
}
