use actix_web::HttpResponse;
use anyhow::{anyhow, Result};
use http::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, EnvFilter};

use crate::auth::{AuthGate, AuthManager, KeyPolicy};
use crate::config::{GatewayConfig, HttpConfig};
use crate::gateway::GatewayRouter;
use crate::key_pool::{KeyPoolManager, StoredCredentials};
use crate::metrics::PrometheusMetrics;
use crate::providers::build_clients;
use crate::registry::ProviderRegistry;
use crate::store::Store;

/// Initialize dotenv and structured tracing based on RUST_LOG.
///
/// An explicit env file may be named via ENV_FILE or DOTENV_PATH; otherwise `.env` in the
/// working directory is used when present.
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }
    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub router: Arc<GatewayRouter>,
    pub auth: AuthGate,
    /// Per-request deadline applied to every gateway call.
    pub request_timeout: Option<Duration>,
    /// Bearer token for `/v1/admin/*`; None disables those routes.
    pub admin_token: Option<String>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(router: Arc<GatewayRouter>, auth: AuthGate, request_timeout: Option<Duration>) -> Self {
        Self {
            router,
            auth,
            request_timeout,
            admin_token: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        self
    }

    /// Assemble registry, key pool, metrics and auth gate from configuration.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        config.validate()?;
        let http = build_http_client(&config.http);

        let registry = Arc::new(ProviderRegistry::new());
        for client in build_clients(config, &http) {
            registry
                .register(client)
                .map_err(|e| anyhow!("provider registration failed: {e}"))?;
        }

        let credentials_backend = config.storage.credentials_backend()?;
        let credentials_store = Store::open(credentials_backend.clone())?;
        let pool = Arc::new(KeyPoolManager::new(Arc::new(StoredCredentials::new(
            &credentials_store,
        ))));
        seed_credentials(config, &pool);

        let router = Arc::new(GatewayRouter::new(
            registry,
            pool,
            Arc::new(PrometheusMetrics::new()),
        ));

        let auth = if config.auth.enabled {
            // One sled path can only be opened once per process; share the handle.
            let keys_backend = config.storage.auth_keys_backend()?;
            let keys_store = if keys_backend == credentials_backend {
                credentials_store.clone()
            } else {
                Store::open(keys_backend)?
            };
            let manager = AuthManager::new(&keys_store)
                .with_policy(KeyPolicy {
                    require_expiration: config.auth.require_expiration,
                    default_ttl: config.auth.default_ttl_seconds.map(Duration::from_secs),
                });
            AuthGate::Keys(Arc::new(manager))
        } else {
            tracing::warn!(
                org = %config.auth.dev_identity.organization_id,
                user = %config.auth.dev_identity.user_id,
                "Auth disabled; all requests use the development identity"
            );
            AuthGate::Disabled {
                identity: config.auth.dev_identity.clone(),
            }
        };

        let admin_token = config
            .auth
            .admin_token_env
            .as_deref()
            .and_then(|env| std::env::var(env).ok());
        let state = Self::new(router, auth, config.request_timeout()).with_admin_token(admin_token);
        if state.admin_token.is_none() {
            tracing::info!("Admin token not configured; /v1/admin routes are disabled");
        }
        Ok(state)
    }
}

/// Insert configured credentials whose secrets are present in the environment.
fn seed_credentials(config: &GatewayConfig, pool: &KeyPoolManager) {
    for seed in &config.credentials {
        let secret = match std::env::var(&seed.secret_env) {
            Ok(v) if !v.trim().is_empty() => v,
            _ => {
                tracing::warn!(
                    provider = %seed.provider,
                    env = %seed.secret_env,
                    "Credential seed skipped; environment variable unset"
                );
                continue;
            }
        };
        match pool.ensure_credential(seed.provider, &secret, seed.description.clone()) {
            Ok(true) => tracing::info!(provider = %seed.provider, "Seeded credential from {}", seed.secret_env),
            Ok(false) => {}
            Err(e) => tracing::warn!(provider = %seed.provider, error = %e, "Credential seed failed"),
        }
    }
}

/// Build the outbound HTTP client shared by every provider.
///
/// Without `proxy_url`/`no_proxy`, reqwest honors HTTP_PROXY/HTTPS_PROXY from the environment.
pub fn build_http_client(config: &HttpConfig) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_seconds))
        .connect_timeout(Duration::from_secs(config.connect_timeout_seconds));

    if config.no_proxy {
        builder = builder.no_proxy();
    } else if let Some(url) = config.proxy_url.as_deref().map(str::trim) {
        if !url.is_empty() {
            match reqwest::Proxy::all(url) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => tracing::warn!("Ignoring invalid proxy_url {}: {}", url, e),
            }
        }
    }

    builder = builder.user_agent(format!("modelgate/{}", env!("CARGO_PKG_VERSION")));

    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": msg });
    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

/// CORS policy from the configured origin list; `*` allows any origin.
pub fn cors_from_origins(origins: &[String]) -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default()
        .allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![
            actix_web::http::header::AUTHORIZATION,
            actix_web::http::header::CONTENT_TYPE,
            actix_web::http::header::ACCEPT,
        ])
        .max_age(3600);
    for origin in origins.iter().map(|o| o.trim()).filter(|o| !o.is_empty()) {
        if origin == "*" {
            cors = cors.allow_any_origin();
        } else {
            cors = cors.allowed_origin(origin);
        }
    }
    cors
}
