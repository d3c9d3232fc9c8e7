/* modelgate/src/key_pool.rs

Provider credential pool and usage ledger, persisted through `store::Store`
("memory", "sled:<path>" or "redis://...").

Selection policy: among active credentials of a provider, the least recently used wins;
ties go to the lowest credential id. `last_used` only moves after a successful upstream
call, so a failing key is not pushed behind healthy ones.

Acquire and mark-used are separate steps. Two concurrent requests can observe and pick
the same credential before either marks it; nothing is reserved across the upstream call.
*/

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::{Provider, TokenUsage};
use crate::store::{Journal, Store, StoreBackend, Table};

// ==============================
// Public model
// ==============================

/// A provider secret in the pool. `last_used` is epoch milliseconds; 0 means never used.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub id: String,
    pub provider: Provider,
    pub secret: String,
    #[serde(default)]
    pub description: Option<String>,
    pub active: bool,
    pub created_at: u64,
    #[serde(default)]
    pub last_used: u64,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("secret", &"<redacted>")
            .field("active", &self.active)
            .field("last_used", &self.last_used)
            .finish()
    }
}

/// Listing view; never carries the secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialInfo {
    pub id: String,
    pub provider: Provider,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: u64,
    pub last_used: u64,
}

impl From<Credential> for CredentialInfo {
    fn from(c: Credential) -> Self {
        Self {
            id: c.id,
            provider: c.provider,
            description: c.description,
            active: c.active,
            created_at: c.created_at,
            last_used: c.last_used,
        }
    }
}

/// Append-only ledger entry for one successful call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageEvent {
    pub key_id: String,
    pub request_count: u64,
    pub tokens: u64,
    pub cost: f64,
    pub timestamp: u64,
}

fn lru_order(a: &Credential, b: &Credential) -> Ordering {
    a.last_used
        .cmp(&b.last_used)
        .then_with(|| a.id.cmp(&b.id))
}

// ==============================
// Storage seam
// ==============================

pub trait CredentialStore: Send + Sync {
    fn put(&self, cred: &Credential) -> Result<()>;
    fn get(&self, id: &str) -> Result<Option<Credential>>;
    fn list(&self) -> Result<Vec<Credential>>;

    /// Apply `change` to the stored credential as one atomic step. None when unknown.
    fn modify(
        &self,
        id: &str,
        change: &mut dyn FnMut(&mut Credential),
    ) -> Result<Option<Credential>>;

    fn insert_usage(&self, event: &UsageEvent) -> Result<()>;
    fn usage_for(&self, key_id: &str) -> Result<Vec<UsageEvent>>;

    /// Active credentials for `provider`, least recently used first.
    fn active_for_provider(&self, provider: Provider) -> Result<Vec<Credential>> {
        let mut out: Vec<Credential> = self
            .list()?
            .into_iter()
            .filter(|c| c.active && c.provider == provider)
            .collect();
        out.sort_by(lru_order);
        Ok(out)
    }
}

/// Credentials in the "credentials" table, ledger in the "usage" journal.
pub struct StoredCredentials {
    records: Table<Credential>,
    ledger: Journal<UsageEvent>,
}

impl StoredCredentials {
    pub fn new(store: &Store) -> Self {
        Self {
            records: store.table("credentials"),
            ledger: store.journal("usage"),
        }
    }
}

impl CredentialStore for StoredCredentials {
    fn put(&self, cred: &Credential) -> Result<()> {
        self.records.put(&cred.id, cred)
    }

    fn get(&self, id: &str) -> Result<Option<Credential>> {
        self.records.get(id)
    }

    fn list(&self) -> Result<Vec<Credential>> {
        self.records.list()
    }

    fn modify(
        &self,
        id: &str,
        change: &mut dyn FnMut(&mut Credential),
    ) -> Result<Option<Credential>> {
        self.records.update(id, change)
    }

    fn insert_usage(&self, event: &UsageEvent) -> Result<()> {
        self.ledger.append(&event.key_id, event.timestamp, event)
    }

    fn usage_for(&self, key_id: &str) -> Result<Vec<UsageEvent>> {
        self.ledger.read(key_id)
    }
}

// ==============================
// Manager
// ==============================

pub struct KeyPoolManager {
    store: Arc<dyn CredentialStore>,
}

impl KeyPoolManager {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(StoredCredentials::new(&Store::memory())))
    }

    pub fn from_backend(backend: StoreBackend) -> Result<Self> {
        Ok(Self::new(Arc::new(StoredCredentials::new(&Store::open(
            backend,
        )?))))
    }

    /// Least recently used active credential for `provider`.
    pub fn acquire(&self, provider: Provider) -> Result<Credential, GatewayError> {
        let candidates = self
            .store
            .active_for_provider(provider)
            .map_err(|e| GatewayError::Store(e.to_string()))?;

        let picked = candidates
            .into_iter()
            .filter(|c| c.active && c.provider == provider)
            .min_by(lru_order)
            .ok_or(GatewayError::NoActiveKey(provider))?;

        debug!(provider = %provider, key_id = %picked.id, "Acquired credential");
        Ok(picked)
    }

    /// Move `last_used` forward to `now`. Only that field is written, so a concurrent
    /// activation change is kept.
    pub fn mark_used(&self, id: &str, now: u64) -> Result<()> {
        self.store
            .modify(id, &mut |cred: &mut Credential| cred.last_used = cred.last_used.max(now))?
            .map(|_| ())
            .ok_or_else(|| anyhow!("credential {id} not found"))
    }

    pub fn record_usage(&self, id: &str, usage: &TokenUsage, cost: f64) -> Result<UsageEvent> {
        let event = UsageEvent {
            key_id: id.to_string(),
            request_count: 1,
            tokens: usage.total_tokens,
            cost,
            timestamp: now_millis(),
        };
        self.store.insert_usage(&event)?;
        Ok(event)
    }

    pub fn add_credential(
        &self,
        provider: Provider,
        secret: &str,
        description: Option<String>,
    ) -> Result<Credential> {
        if secret.trim().is_empty() {
            return Err(anyhow!("secret must not be empty"));
        }
        let cred = Credential {
            id: Uuid::new_v4().simple().to_string(),
            provider,
            secret: secret.trim().to_string(),
            description,
            active: true,
            created_at: now_millis(),
            last_used: 0,
        };
        self.store.put(&cred)?;
        info!(provider = %provider, key_id = %cred.id, "Added credential");
        Ok(cred)
    }

    /// Insert the secret unless the provider already holds it. Returns true when added.
    pub fn ensure_credential(
        &self,
        provider: Provider,
        secret: &str,
        description: Option<String>,
    ) -> Result<bool> {
        let secret = secret.trim();
        let exists = self
            .store
            .list()?
            .iter()
            .any(|c| c.provider == provider && c.secret == secret);
        if exists {
            return Ok(false);
        }
        self.add_credential(provider, secret, description)?;
        Ok(true)
    }

    /// Returns false when the id is unknown.
    pub fn set_active(&self, id: &str, active: bool) -> Result<bool> {
        let mut changed = false;
        let found = self.store.modify(id, &mut |cred: &mut Credential| {
            changed = cred.active != active;
            cred.active = active;
        })?;
        if changed {
            info!(key_id = %id, active, "Credential state changed");
        }
        Ok(found.is_some())
    }

    pub fn list_credentials(&self) -> Result<Vec<CredentialInfo>> {
        let mut out: Vec<CredentialInfo> = self
            .store
            .list()?
            .into_iter()
            .map(CredentialInfo::from)
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    pub fn get(&self, id: &str) -> Result<Option<Credential>> {
        self.store.get(id)
    }

    pub fn usage_for(&self, id: &str) -> Result<Vec<UsageEvent>> {
        self.store.usage_for(id)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ==============================
// Tests
// ==============================
