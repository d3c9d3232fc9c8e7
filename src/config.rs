//! Gateway configuration.
//!
//! Loaded once at startup from YAML (`.yaml`/`.yml`) or JSON (anything else), then
//! overridden by CLI flags. Every field has a default so an empty file is valid.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::gateway::CallerTags;
use crate::store::StoreBackend;
use crate::models::Provider;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub http: HttpConfig,
    /// Upper bound for one gateway call, including the upstream exchange.
    pub request_timeout_seconds: Option<u64>,
    pub providers: Vec<ProviderConfig>,
    pub storage: StorageConfig,
    /// Credentials inserted into the pool at startup when absent.
    pub credentials: Vec<CredentialSeed>,
    pub auth: AuthConfig,
    pub cors_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            http: HttpConfig::default(),
            request_timeout_seconds: Some(120),
            providers: vec![
                ProviderConfig::enabled(Provider::Groq),
                ProviderConfig::enabled(Provider::Google),
                ProviderConfig::enabled(Provider::OpenAI),
            ],
            storage: StorageConfig::default(),
            credentials: Vec::new(),
            auth: AuthConfig::default(),
            cors_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

/// Outbound HTTP client settings shared by every provider.
///
/// `timeout_seconds` must not undercut `request_timeout_seconds`, otherwise the client
/// gives up first and a slow upstream reads as a provider failure instead of a deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub proxy_url: Option<String>,
    pub no_proxy: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 150,
            connect_timeout_seconds: 10,
            proxy_url: None,
            no_proxy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub provider: Provider,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the vendor's public endpoint (proxies, mocks).
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn enabled(provider: Provider) -> Self {
        Self {
            provider,
            enabled: true,
            base_url: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Backend spec strings: `memory`, `sled:<path>`, `redis://...`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub credentials: String,
    pub auth_keys: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials: "sled:./data/credentials.db".to_string(),
            auth_keys: "sled:./data/keys.db".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn credentials_backend(&self) -> Result<StoreBackend> {
        StoreBackend::parse(&self.credentials)
            .ok_or_else(|| anyhow!("invalid credentials backend spec: {}", self.credentials))
    }

    pub fn auth_keys_backend(&self) -> Result<StoreBackend> {
        StoreBackend::parse(&self.auth_keys)
            .ok_or_else(|| anyhow!("invalid auth_keys backend spec: {}", self.auth_keys))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSeed {
    pub provider: Provider,
    /// Environment variable holding the secret.
    pub secret_env: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub dev_identity: CallerTags,
    pub require_expiration: bool,
    pub default_ttl_seconds: Option<u64>,
    /// Environment variable holding the bearer token for `/v1/admin/*`. The admin
    /// routes answer 503 when it is unset or the variable is empty.
    pub admin_token_env: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dev_identity: CallerTags {
                organization_id: "dev-org-123".to_string(),
                project_id: "dev-project-123".to_string(),
                user_id: "dev-user-123".to_string(),
            },
            require_expiration: false,
            default_ttl_seconds: None,
            admin_token_env: Some("MODELGATE_ADMIN_TOKEN".to_string()),
        }
    }
}

impl GatewayConfig {
    /// Load from file; the extension picks the format.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let config: GatewayConfig = if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse YAML config {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse JSON config {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for p in &self.providers {
            if !seen.insert(p.provider) {
                return Err(anyhow!("provider {} configured more than once", p.provider));
            }
        }
        for seed in &self.credentials {
            if seed.secret_env.trim().is_empty() {
                return Err(anyhow!(
                    "credential seed for {} has an empty secret_env",
                    seed.provider
                ));
            }
        }
        self.storage.credentials_backend()?;
        self.storage.auth_keys_backend()?;
        if self.request_timeout_seconds == Some(0) {
            return Err(anyhow!("request_timeout_seconds must be > 0"));
        }
        if let Some(deadline) = self.request_timeout_seconds {
            if self.http.timeout_seconds < deadline {
                return Err(anyhow!(
                    "http.timeout_seconds ({}) must be at least request_timeout_seconds ({})",
                    self.http.timeout_seconds,
                    deadline
                ));
            }
        }
        if self.http.timeout_seconds == 0 {
            return Err(anyhow!("http.timeout_seconds must be > 0"));
        }
        if let Some(env) = self.auth.admin_token_env.as_deref() {
            if env.trim().is_empty() {
                return Err(anyhow!("auth.admin_token_env must name a variable"));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_seconds.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(ext: &str, body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new()
            .suffix(ext)
            .tempfile()
            .unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = GatewayConfig::default();
        cfg.validate().unwrap();
        assert!(cfg.auth.enabled);
        assert_eq!(cfg.auth.dev_identity.user_id, "dev-user-123");
        assert_eq!(cfg.providers.len(), 3);
    }

    #[test]
    fn test_load_yaml() {
        let f = write_temp(
            ".yaml",
            r#"
bind_addr: "127.0.0.1:9000"
providers:
  - provider: openai
    base_url: "http://localhost:1234/v1"
  - provider: gemini
    enabled: false
storage:
  credentials: memory
  auth_keys: memory
credentials:
  - provider: openai
    secret_env: OPENAI_API_KEY
auth:
  enabled: false
"#,
        );
        let cfg = GatewayConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.providers[0].base_url.as_deref(), Some("http://localhost:1234/v1"));
        assert_eq!(cfg.providers[1].provider, Provider::Google);
        assert!(!cfg.providers[1].enabled);
        assert_eq!(cfg.storage.credentials_backend().unwrap(), StoreBackend::Memory);
        assert!(!cfg.auth.enabled);
        assert_eq!(cfg.auth.dev_identity.organization_id, "dev-org-123");
        assert_eq!(cfg.http.timeout_seconds, 150);
    }

    #[test]
    fn test_client_timeout_cannot_undercut_request_deadline() {
        let mut cfg = GatewayConfig::default();
        assert!(cfg.http.timeout_seconds >= cfg.request_timeout_seconds.unwrap());

        cfg.http.timeout_seconds = 60;
        cfg.request_timeout_seconds = Some(120);
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("http.timeout_seconds"), "{err}");

        cfg.request_timeout_seconds = Some(60);
        cfg.validate().unwrap();

        cfg.request_timeout_seconds = None;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_load_json() {
        let f = write_temp(".json", r#"{"request_timeout_seconds": 30, "cors_origins": []}"#);
        let cfg = GatewayConfig::load_from_file(f.path()).unwrap();
        assert_eq!(cfg.request_timeout(), Some(Duration::from_secs(30)));
        assert!(cfg.cors_origins.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let mut cfg = GatewayConfig::default();
        cfg.providers.push(ProviderConfig::enabled(Provider::Groq));
        assert!(cfg.validate().is_err());

        let mut cfg = GatewayConfig::default();
        cfg.storage.credentials = "postgres://nope".into();
        assert!(cfg.validate().is_err());

        let mut cfg = GatewayConfig::default();
        cfg.auth.admin_token_env = Some("".into());
        assert!(cfg.validate().is_err());

        let mut cfg = GatewayConfig::default();
        cfg.credentials.push(CredentialSeed {
            provider: Provider::Groq,
            secret_env: " ".into(),
            description: None,
        });
        assert!(cfg.validate().is_err());
    }
}
