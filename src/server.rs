use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::bearer_matches;
use crate::gateway::CallerTags;
use crate::key_pool::CredentialInfo;
use crate::models::{Model, Provider, Request};
use crate::providers::CallContext;
use crate::util::{error_response, AppState};

const ROUTES: [&str; 11] = [
    "/health",
    "/status",
    "/metrics",
    "/v1/llm/query",
    "/v1/llm/models",
    "/v1/auth/me",
    "/v1/admin/credentials",
    "/v1/admin/credentials/{id}/activate",
    "/v1/admin/credentials/{id}/deactivate",
    "/v1/admin/keys",
    "/v1/admin/keys/{id}/revoke",
];

/// Configure Actix-web routes with AppState.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .app_data(web::PayloadConfig::new(1 << 20))
            .route("/health", web::get().to(health))
            .route("/status", web::get().to(status))
            .route("/metrics", web::get().to(metrics))
            .route("/v1/llm/query", web::post().to(query))
            .route("/v1/llm/models", web::get().to(list_models))
            .route("/v1/auth/me", web::get().to(whoami))
            .route("/v1/admin/credentials", web::get().to(list_credentials))
            .route("/v1/admin/credentials", web::post().to(add_credential))
            .route(
                "/v1/admin/credentials/{id}/activate",
                web::post().to(activate_credential),
            )
            .route(
                "/v1/admin/credentials/{id}/deactivate",
                web::post().to(deactivate_credential),
            )
            .route("/v1/admin/keys", web::get().to(list_keys))
            .route("/v1/admin/keys", web::post().to(generate_key))
            .route("/v1/admin/keys/{id}/revoke", web::post().to(revoke_key)),
    );
}

/// Error response that is also counted in `api_request_errors_total`.
fn reject(state: &AppState, req: &HttpRequest, status: StatusCode, msg: &str) -> HttpResponse {
    let endpoint = req
        .match_pattern()
        .unwrap_or_else(|| req.path().to_string());
    state
        .router
        .metrics()
        .observe_api_error(&endpoint, req.method().as_str(), status.as_u16());
    error_response(status, msg)
}

fn auth_header(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// Resolve caller tags or produce the 401 response.
fn authenticate(state: &AppState, req: &HttpRequest) -> Result<CallerTags, HttpResponse> {
    state.auth.authenticate(auth_header(req)).map_err(|rejection| {
        debug!(reason = rejection.reason(), "Rejected caller credentials");
        reject(
            state,
            req,
            StatusCode::UNAUTHORIZED,
            &format!("unauthorized: {}", rejection.reason()),
        )
    })
}

/// Admin routes need the configured admin token; without one they are unavailable.
fn authorize_admin(state: &AppState, req: &HttpRequest) -> Result<(), HttpResponse> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(reject(
            state,
            req,
            StatusCode::SERVICE_UNAVAILABLE,
            "admin API disabled: no admin token configured",
        ));
    };
    if bearer_matches(expected, auth_header(req)) {
        Ok(())
    } else {
        warn!(path = %req.path(), "Rejected admin request");
        Err(reject(state, req, StatusCode::UNAUTHORIZED, "unauthorized: invalid admin token"))
    }
}

/// Decode a JSON body after the caller has been authenticated.
fn decode<T: DeserializeOwned>(
    state: &AppState,
    req: &HttpRequest,
    body: &[u8],
) -> Result<T, HttpResponse> {
    serde_json::from_slice(body).map_err(|e| {
        reject(
            state,
            req,
            StatusCode::BAD_REQUEST,
            &format!("invalid request body: {e}"),
        )
    })
}

async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

/// Service status: identity, registered providers and auth mode.
async fn status(state: web::Data<AppState>) -> impl Responder {
    let registry = state.router.registry();
    let providers: Vec<String> = registry
        .providers()
        .iter()
        .map(|p| p.to_string())
        .collect();

    HttpResponse::Ok().json(serde_json::json!({
        "name": "modelgate",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "providers": providers,
        "model_count": registry.all_models().len(),
        "auth": state.auth.mode(),
        "admin_api": state.admin_token.is_some(),
        "request_timeout_seconds": state.request_timeout.map(|d| d.as_secs()),
        "routes": ROUTES,
    }))
}

async fn metrics(state: web::Data<AppState>) -> impl Responder {
    let body = state.router.metrics().render().unwrap_or_default();
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(body)
}

async fn query(state: web::Data<AppState>, req: HttpRequest, body: web::Bytes) -> HttpResponse {
    let tags = match authenticate(&state, &req) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let request: Request = match decode(&state, &req, &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let ctx = match state.request_timeout {
        Some(timeout) => CallContext::with_timeout(timeout),
        None => CallContext::new(),
    };

    match state.router.query(&ctx, &tags, request).await {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(err) => {
            let status = err.status_code();
            if status.is_server_error() {
                warn!(status = status.as_u16(), error = %err, "Query failed");
            }
            reject(&state, &req, status, &err.to_string())
        }
    }
}

async fn list_models(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(resp) = authenticate(&state, &req) {
        return resp;
    }
    let mut models: Vec<Model> = state.router.registry().all_models();
    models.sort_by(|a, b| a.id.cmp(&b.id));
    HttpResponse::Ok().json(models)
}

async fn whoami(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    match authenticate(&state, &req) {
        Ok(tags) => HttpResponse::Ok().json(tags),
        Err(resp) => resp,
    }
}

// ==============================
// Admin: upstream credentials
// ==============================

#[derive(Deserialize)]
struct AddCredentialRequest {
    provider: Provider,
    secret: String,
    #[serde(default)]
    description: Option<String>,
}

async fn list_credentials(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(resp) = authorize_admin(&state, &req) {
        return resp;
    }
    match state.router.pool().list_credentials() {
        Ok(items) => HttpResponse::Ok().json(items),
        Err(e) => reject(
            &state,
            &req,
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to list credentials: {e}"),
        ),
    }
}

async fn add_credential(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    if let Err(resp) = authorize_admin(&state, &req) {
        return resp;
    }
    let payload: AddCredentialRequest = match decode(&state, &req, &body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if payload.secret.trim().is_empty() {
        return reject(&state, &req, StatusCode::BAD_REQUEST, "secret must not be empty");
    }
    match state
        .router
        .pool()
        .add_credential(payload.provider, &payload.secret, payload.description)
    {
        Ok(cred) => HttpResponse::Created().json(CredentialInfo::from(cred)),
        Err(e) => reject(
            &state,
            &req,
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to add credential: {e}"),
        ),
    }
}

async fn activate_credential(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    set_credential_active(&state, &req, &path, true)
}

async fn deactivate_credential(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    set_credential_active(&state, &req, &path, false)
}

fn set_credential_active(state: &AppState, req: &HttpRequest, id: &str, active: bool) -> HttpResponse {
    if let Err(resp) = authorize_admin(state, req) {
        return resp;
    }
    let pool = state.router.pool();
    match pool.set_active(id, active).and_then(|_| pool.get(id)) {
        Ok(Some(cred)) => HttpResponse::Ok().json(CredentialInfo::from(cred)),
        Ok(None) => reject(
            state,
            req,
            StatusCode::NOT_FOUND,
            &format!("credential {id} not found"),
        ),
        Err(e) => reject(
            state,
            req,
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to update credential: {e}"),
        ),
    }
}

// ==============================
// Admin: caller keys
// ==============================

#[derive(Debug, Deserialize)]
struct GenerateKeyRequest {
    organization_id: String,
    #[serde(default)]
    project_id: String,
    user_id: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

fn key_manager_unavailable(state: &AppState, req: &HttpRequest) -> HttpResponse {
    reject(
        state,
        req,
        StatusCode::SERVICE_UNAVAILABLE,
        "caller keys are disabled (auth.enabled = false)",
    )
}

async fn list_keys(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(resp) = authorize_admin(&state, &req) {
        return resp;
    }
    let Some(manager) = state.auth.manager() else {
        return key_manager_unavailable(&state, &req);
    };
    match manager.list_keys() {
        Ok(items) => HttpResponse::Ok().json(items),
        Err(e) => reject(
            &state,
            &req,
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to list keys: {e}"),
        ),
    }
}

async fn generate_key(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    if let Err(resp) = authorize_admin(&state, &req) {
        return resp;
    }
    let Some(manager) = state.auth.manager() else {
        return key_manager_unavailable(&state, &req);
    };
    let payload: GenerateKeyRequest = match decode(&state, &req, &body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let identity = CallerTags {
        organization_id: payload.organization_id,
        project_id: payload.project_id,
        user_id: payload.user_id,
    };
    match manager.generate_key(
        identity,
        payload.label,
        payload.ttl_seconds.map(Duration::from_secs),
    ) {
        Ok(generated) => HttpResponse::Created().json(generated),
        Err(e) => reject(&state, &req, StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

async fn revoke_key(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> HttpResponse {
    if let Err(resp) = authorize_admin(&state, &req) {
        return resp;
    }
    let Some(manager) = state.auth.manager() else {
        return key_manager_unavailable(&state, &req);
    };
    let id = path.into_inner();
    match manager.revoke(&id) {
        Ok(true) => {
            info!(key_id = %id, "Key revoked over admin API");
            HttpResponse::Ok().json(serde_json::json!({ "id": id, "revoked": true }))
        }
        Ok(false) => reject(
            &state,
            &req,
            StatusCode::NOT_FOUND,
            &format!("key {id} not found or already revoked"),
        ),
        Err(e) => reject(
            &state,
            &req,
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to revoke key: {e}"),
        ),
    }
}
