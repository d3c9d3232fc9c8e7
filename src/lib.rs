#![forbid(unsafe_code)]
#![doc = r#"
Modelgate

Route normalized LLM requests to Groq, Google Gemini and OpenAI behind one contract,
drawing upstream credentials from a least-recently-used pool and metering every call.

Crate highlights
- `GatewayRouter::query`: model lookup → credential → upstream call → metrics and ledger.
- HTTP server (in `server`): `/v1/llm/query`, `/v1/llm/models`, `/metrics`, `/status`,
  plus token-guarded `/v1/admin/*` routes for credentials and caller keys.
- Storage: credentials and caller keys in memory, sled or Redis (`store`).

Modules
- `models`: provider-agnostic request, response and catalogue types.
- `providers`, `chat_completions`, `gemini`: upstream clients.
- `registry`: provider tag → client, model id → model.
- `store`: JSON tables and journals over memory, sled or Redis.
- `key_pool`: credential pool and usage ledger.
- `accounting`, `metrics`: cost and observations.
- `gateway`: the request pipeline.
- `auth`: caller API keys for the HTTP surface.
- `config`, `util`, `server`: startup and HTTP wiring.
"#]

pub mod accounting;
pub mod auth;
pub mod chat_completions;
pub mod config;
pub mod error;
pub mod gateway;
pub mod gemini;
pub mod key_pool;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod registry;
pub mod server;
pub mod store;
pub mod util;

pub use crate::accounting::UsageAccountant;
pub use crate::auth::{ApiKeyInfo, AuthGate, AuthManager, GeneratedKey, Verification};
pub use crate::config::GatewayConfig;
pub use crate::error::GatewayError;
pub use crate::gateway::{CallerTags, GatewayRouter};
pub use crate::key_pool::{Credential, CredentialInfo, CredentialStore, KeyPoolManager, UsageEvent};
pub use crate::metrics::{MetricsSink, NoopMetrics, PrometheusMetrics, TokenKind};
pub use crate::models::{Model, Provider, Request, Response, TokenUsage};
pub use crate::providers::{CallContext, ProviderClient};
pub use crate::registry::ProviderRegistry;
pub use crate::store::{Store, StoreBackend};
