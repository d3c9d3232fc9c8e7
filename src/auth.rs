/* modelgate/src/auth.rs

Caller API keys for the gateway's HTTP surface.

A key reads "sk_<id>.<secret>": the id is 32 hex chars, the secret 64 hex chars
(32 random bytes). Only a per-key random salt and SHA-256(salt || secret) are stored,
in the "api_keys" table of a `store::Store`. Every key is issued for one caller
identity (organization, project, user), which becomes the request's caller tags.

With the gate disabled every request carries a fixed development identity.
*/

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::CallerTags;
use crate::store::{Store, StoreBackend, Table};

const TOKEN_PREFIX: &str = "sk_";
const SECRET_BYTES: usize = 32;
const SALT_BYTES: usize = 16;

/// Listing view of an issued key; carries neither secret nor digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyInfo {
    pub id: String,
    pub label: Option<String>,
    pub identity: CallerTags,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub revoked_at: Option<u64>,
}

/// Returned once at issuance; the token cannot be recovered afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedKey {
    pub id: String,
    pub token: String,
    pub identity: CallerTags,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Verification {
    Valid {
        id: String,
        identity: CallerTags,
        expires_at: Option<u64>,
    },
    InvalidTokenFormat,
    NotFound,
    Revoked {
        revoked_at: u64,
    },
    Expired {
        expired_at: u64,
    },
    HashMismatch,
}

impl Verification {
    /// Short machine-readable reason for rejections.
    pub fn reason(&self) -> &'static str {
        match self {
            Verification::Valid { .. } => "valid",
            Verification::InvalidTokenFormat => "invalid token format",
            Verification::NotFound => "unknown key",
            Verification::Revoked { .. } => "key revoked",
            Verification::Expired { .. } => "key expired",
            Verification::HashMismatch => "invalid key",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiKeyRecord {
    id: String,
    label: Option<String>,
    identity: CallerTags,
    created_at: u64,
    expires_at: Option<u64>,
    revoked_at: Option<u64>,
    salt: String,
    digest: String,
}

impl ApiKeyRecord {
    fn info(self) -> ApiKeyInfo {
        ApiKeyInfo {
            id: self.id,
            label: self.label,
            identity: self.identity,
            created_at: self.created_at,
            expires_at: self.expires_at,
            revoked_at: self.revoked_at,
        }
    }

    /// The rejection that applies at `now` regardless of the presented secret.
    fn standing(&self, now: u64) -> Option<Verification> {
        if let Some(revoked_at) = self.revoked_at {
            return Some(Verification::Revoked { revoked_at });
        }
        self.expires_at
            .filter(|&at| now >= at)
            .map(|expired_at| Verification::Expired { expired_at })
    }

    fn opens_with(&self, secret: &[u8]) -> bool {
        match (hex::decode(&self.salt), hex::decode(&self.digest)) {
            (Ok(salt), Ok(expected)) => ct_eq(&salted_digest(&salt, secret), &expected),
            _ => false,
        }
    }
}

/// A syntactically valid bearer token, split into lookup id and secret bytes.
struct PresentedToken {
    id: String,
    secret: Vec<u8>,
}

impl PresentedToken {
    fn parse(token: &str) -> Option<Self> {
        let (id, secret_hex) = token.strip_prefix(TOKEN_PREFIX)?.split_once('.')?;
        if id.len() != 32 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let secret = hex::decode(secret_hex).ok().filter(|s| s.len() >= 16)?;
        Some(Self {
            id: id.to_string(),
            secret,
        })
    }
}

/// Issuance policy for new keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyPolicy {
    pub require_expiration: bool,
    pub default_ttl: Option<Duration>,
}

pub struct AuthManager {
    keys: Table<ApiKeyRecord>,
    policy: KeyPolicy,
}

impl AuthManager {
    pub fn new(store: &Store) -> Self {
        Self {
            keys: store.table("api_keys"),
            policy: KeyPolicy::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(&Store::memory())
    }

    pub fn from_backend(backend: StoreBackend) -> Result<Self> {
        Ok(Self::new(&Store::open(backend)?))
    }

    pub fn with_policy(mut self, policy: KeyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Issue a key for `identity`. Organization and user are required; `ttl` falls back
    /// to the policy default.
    pub fn generate_key(
        &self,
        identity: CallerTags,
        label: Option<String>,
        ttl: Option<Duration>,
    ) -> Result<GeneratedKey> {
        if identity.organization_id.trim().is_empty() || identity.user_id.trim().is_empty() {
            return Err(anyhow!("organization_id and user_id are required"));
        }
        let ttl = ttl.or(self.policy.default_ttl);
        match ttl {
            None if self.policy.require_expiration => {
                return Err(anyhow!("an expiration is required for new keys"))
            }
            Some(d) if d.as_secs() == 0 => return Err(anyhow!("ttl must be at least one second")),
            _ => {}
        }

        let secret = random_bytes(SECRET_BYTES);
        let salt = random_bytes(SALT_BYTES);
        let created_at = now_epoch();
        let record = ApiKeyRecord {
            id: Uuid::new_v4().simple().to_string(),
            label,
            identity,
            created_at,
            expires_at: ttl.map(|d| created_at.saturating_add(d.as_secs())),
            revoked_at: None,
            salt: hex::encode(&salt),
            digest: hex::encode(salted_digest(&salt, &secret)),
        };
        self.keys.put(&record.id, &record)?;
        info!(key_id = %record.id, org = %record.identity.organization_id, "Issued API key");

        Ok(GeneratedKey {
            token: format!("{TOKEN_PREFIX}{}.{}", record.id, hex::encode(&secret)),
            id: record.id,
            identity: record.identity,
            created_at,
            expires_at: record.expires_at,
            label: record.label,
        })
    }

    pub fn verify(&self, token: &str) -> Verification {
        let Some(presented) = PresentedToken::parse(token) else {
            return Verification::InvalidTokenFormat;
        };
        let record = match self.keys.get(&presented.id) {
            Ok(Some(record)) => record,
            Ok(None) => return Verification::NotFound,
            Err(e) => {
                warn!(key_id = %presented.id, error = %e, "API key lookup failed");
                return Verification::NotFound;
            }
        };
        if let Some(rejection) = record.standing(now_epoch()) {
            debug!(key_id = %record.id, reason = rejection.reason(), "API key not usable");
            return rejection;
        }
        if !record.opens_with(&presented.secret) {
            return Verification::HashMismatch;
        }
        Verification::Valid {
            id: record.id,
            identity: record.identity,
            expires_at: record.expires_at,
        }
    }

    /// Revoke `id`. False when it is unknown or already revoked.
    pub fn revoke(&self, id: &str) -> Result<bool> {
        let now = now_epoch();
        let mut newly_revoked = false;
        self.keys.update(id, |record| {
            newly_revoked = record.revoked_at.is_none();
            record.revoked_at.get_or_insert(now);
        })?;
        if newly_revoked {
            info!(key_id = %id, "Revoked API key");
        }
        Ok(newly_revoked)
    }

    /// Issued keys, oldest first.
    pub fn list_keys(&self) -> Result<Vec<ApiKeyInfo>> {
        let mut keys: Vec<ApiKeyInfo> = self
            .keys
            .list()?
            .into_iter()
            .map(ApiKeyRecord::info)
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(keys)
    }
}

/// Token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(auth_header: Option<&str>) -> Option<&str> {
    let (scheme, token) = auth_header?.trim().split_once(char::is_whitespace)?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// True when the header carries exactly `expected` as its bearer token.
pub fn bearer_matches(expected: &str, auth_header: Option<&str>) -> bool {
    bearer_token(auth_header).is_some_and(|t| ct_eq(t.as_bytes(), expected.as_bytes()))
}

/// Resolves the caller identity for an inbound request.
pub enum AuthGate {
    /// Development mode: every request is attributed to a fixed identity.
    Disabled { identity: CallerTags },
    Keys(Arc<AuthManager>),
}

impl AuthGate {
    pub fn authenticate(
        &self,
        auth_header: Option<&str>,
    ) -> std::result::Result<CallerTags, Verification> {
        let manager = match self {
            AuthGate::Disabled { identity } => return Ok(identity.clone()),
            AuthGate::Keys(manager) => manager,
        };
        match bearer_token(auth_header).map(|t| manager.verify(t)) {
            Some(Verification::Valid { identity, .. }) => Ok(identity),
            Some(rejection) => Err(rejection),
            None => Err(Verification::InvalidTokenFormat),
        }
    }

    /// The key manager, when caller keys are enforced.
    pub fn manager(&self) -> Option<&AuthManager> {
        match self {
            AuthGate::Keys(manager) => Some(manager.as_ref()),
            AuthGate::Disabled { .. } => None,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            AuthGate::Disabled { .. } => "disabled",
            AuthGate::Keys(_) => "api_keys",
        }
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn random_bytes(n: usize) -> Vec<u8> {
    let mut v = vec![0u8; n];
    OsRng.fill_bytes(&mut v);
    v
}

fn salted_digest(salt: &[u8], secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret);
    hasher.finalize().into()
}

/// Constant-time equality for two byte slices.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> CallerTags {
        CallerTags {
            organization_id: "org-1".into(),
            project_id: "proj-1".into(),
            user_id: "user-1".into(),
        }
    }

    #[test]
    fn issued_key_verifies_until_revoked() {
        let mgr = AuthManager::in_memory();
        let out = mgr
            .generate_key(identity(), Some("unit".into()), Some(Duration::from_secs(60)))
            .unwrap();
        assert!(out.token.starts_with("sk_"));

        match mgr.verify(&out.token) {
            Verification::Valid { id, identity: who, .. } => {
                assert_eq!(id, out.id);
                assert_eq!(who, identity());
            }
            x => panic!("expected valid, got {:?}", x),
        }

        assert!(mgr.revoke(&out.id).unwrap());
        assert!(!mgr.revoke(&out.id).unwrap());
        assert!(!mgr.revoke("unknown").unwrap());
        assert!(matches!(mgr.verify(&out.token), Verification::Revoked { .. }));
    }

    #[test]
    fn tampered_and_malformed_tokens_are_rejected() {
        let mgr = AuthManager::in_memory();
        let out = mgr.generate_key(identity(), None, None).unwrap();
        let mut bad = out.token.clone();
        let last = bad.pop().unwrap();
        bad.push(if last == '0' { '1' } else { '0' });
        assert!(matches!(mgr.verify(&bad), Verification::HashMismatch));
        assert!(matches!(
            mgr.verify("sk_nothex.abc"),
            Verification::InvalidTokenFormat
        ));
        assert!(matches!(
            mgr.verify(&format!("sk_{}.{}", "f".repeat(32), "zz".repeat(32))),
            Verification::InvalidTokenFormat
        ));
        assert!(matches!(
            mgr.verify(&format!("sk_{}.{}", "a".repeat(32), "a".repeat(64))),
            Verification::NotFound
        ));
    }

    #[test]
    fn expired_key_is_reported_before_secret_check() {
        let mgr = AuthManager::in_memory();
        let out = mgr
            .generate_key(identity(), None, Some(Duration::from_secs(60)))
            .unwrap();
        mgr.keys
            .update(&out.id, |record| record.expires_at = Some(1))
            .unwrap();
        assert!(matches!(
            mgr.verify(&out.token),
            Verification::Expired { expired_at: 1 }
        ));
    }

    #[test]
    fn policy_requires_expiration_and_identity() {
        let mgr = AuthManager::in_memory().with_policy(KeyPolicy {
            require_expiration: true,
            default_ttl: None,
        });
        assert!(mgr.generate_key(identity(), None, None).is_err());
        assert!(mgr
            .generate_key(identity(), None, Some(Duration::ZERO))
            .is_err());
        let out = mgr
            .generate_key(identity(), None, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(out.expires_at, Some(out.created_at + 5));

        let mut anonymous = identity();
        anonymous.user_id.clear();
        assert!(mgr
            .generate_key(anonymous, None, Some(Duration::from_secs(5)))
            .is_err());
    }

    #[test]
    fn listing_never_exposes_digests() {
        let mgr = AuthManager::in_memory();
        mgr.generate_key(identity(), Some("a".into()), None).unwrap();
        mgr.generate_key(identity(), Some("b".into()), None).unwrap();
        let listed = mgr.list_keys().unwrap();
        assert_eq!(listed.len(), 2);
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("digest") && !json.contains("salt"));
    }

    #[test]
    fn sled_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let token = {
            let mgr = AuthManager::from_backend(StoreBackend::Sled { path: path.clone() }).unwrap();
            mgr.generate_key(identity(), None, None).unwrap().token
        };
        let mgr = AuthManager::from_backend(StoreBackend::Sled { path }).unwrap();
        assert!(matches!(mgr.verify(&token), Verification::Valid { .. }));
        assert_eq!(mgr.list_keys().unwrap().len(), 1);
    }

    #[test]
    fn gate_modes() {
        let dev = AuthGate::Disabled {
            identity: identity(),
        };
        assert_eq!(dev.authenticate(None).unwrap(), identity());
        assert_eq!(dev.mode(), "disabled");
        assert!(dev.manager().is_none());

        let mgr = Arc::new(AuthManager::in_memory());
        let out = mgr.generate_key(identity(), None, None).unwrap();
        let gate = AuthGate::Keys(mgr);
        assert!(gate.authenticate(None).is_err());
        assert!(gate.authenticate(Some("Basic abc")).is_err());
        let header = format!("Bearer {}", out.token);
        assert_eq!(gate.authenticate(Some(&header)).unwrap(), identity());
        assert!(gate.manager().is_some());
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("  bearer   abc ")), Some("abc"));
        assert_eq!(bearer_token(Some("Bearer")), None);
        assert_eq!(bearer_token(Some("Token abc")), None);
        assert!(bearer_matches("admin-1", Some("Bearer admin-1")));
        assert!(!bearer_matches("admin-1", Some("Bearer admin-2")));
        assert!(!bearer_matches("admin-1", None));
    }
}
