use std::sync::Arc;
use tracing::warn;

use crate::key_pool::KeyPoolManager;
use crate::models::{Model, TokenUsage};

/// Prices calls and writes them to the usage ledger.
pub struct UsageAccountant {
    pool: Arc<KeyPoolManager>,
}

impl UsageAccountant {
    pub fn new(pool: Arc<KeyPoolManager>) -> Self {
        Self { pool }
    }

    /// `total_tokens * cost_per_1k / 1000`, in that order.
    pub fn cost(model: &Model, usage: &TokenUsage) -> f64 {
        usage.total_tokens as f64 * model.cost_per_1k / 1000.0
    }

    /// Append a ledger entry. Failures are logged and never reach the caller.
    pub fn record(&self, key_id: &str, usage: &TokenUsage, cost: f64) {
        if let Err(e) = self.pool.record_usage(key_id, usage, cost) {
            warn!(key_id = %key_id, error = %e, "Failed to record usage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provider;

    #[test]
    fn cost_is_tokens_times_rate_per_thousand() {
        let model = Model::new("gpt-4", Provider::OpenAI, "GPT-4", "", 8192, 0.03);
        let usage = TokenUsage {
            prompt_tokens: 400,
            completion_tokens: 600,
            total_tokens: 1000,
        };
        assert_eq!(UsageAccountant::cost(&model, &usage), 0.03);
        assert_eq!(UsageAccountant::cost(&model, &TokenUsage::default()), 0.0);
    }

    #[test]
    fn record_appends_to_ledger() {
        let pool = Arc::new(KeyPoolManager::in_memory());
        let cred = pool.add_credential(Provider::OpenAI, "sk-1", None).unwrap();
        let accountant = UsageAccountant::new(pool.clone());
        let usage = TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        };
        accountant.record(&cred.id, &usage, 0.5);
        let events = pool.usage_for(&cred.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tokens, 3);
        assert_eq!(events[0].cost, 0.5);
    }
}
