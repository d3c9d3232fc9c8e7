/* modelgate/src/store.rs

JSON record storage behind the credential pool and the caller-key manager.

A `Store` wraps one backend, picked by spec string:
- "memory":       process-local maps, for tests and throwaway runs.
- "sled:<path>":  embedded database. sled holds an exclusive file lock, so only the
                  serving process can open it; manage records over the admin HTTP routes.
- "redis://...":  shared across gateway replicas, pooled with r2d2.

Typed handles on top:
- `Table<T>`:   records keyed by id. `update` is an atomic read-modify-write
                (compare-and-swap on sled, WATCH/MULTI on redis).
- `Journal<T>`: append-only events grouped by partition, read back in insertion order.
*/

use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

const REDIS_PREFIX: &str = "modelgate:";
const REDIS_POOL_SIZE: u32 = 16;

/// Storage backend selected by spec string.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    Redis { url: String },
    Sled { path: PathBuf },
    Memory,
}

impl StoreBackend {
    /// `redis://` / `rediss://` URL, `sled:<path>` or `memory`.
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.starts_with("redis://") || spec.starts_with("rediss://") {
            return Some(StoreBackend::Redis {
                url: spec.to_string(),
            });
        }
        if let Some(path) = spec.strip_prefix("sled:").map(str::trim) {
            return (!path.is_empty()).then(|| StoreBackend::Sled { path: path.into() });
        }
        spec.eq_ignore_ascii_case("memory").then_some(StoreBackend::Memory)
    }
}

pub struct RedisConnectionManager {
    client: redis::Client,
}

impl r2d2::ManageConnection for RedisConnectionManager {
    type Connection = redis::Connection;
    type Error = redis::RedisError;

    fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        self.client.get_connection()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        redis::cmd("PING").query::<String>(conn).map(|_| ())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

enum Engine {
    /// collection name -> key -> JSON bytes; BTreeMap keeps journal keys ordered.
    Memory(RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>),
    Sled(sled::Db),
    Redis(r2d2::Pool<RedisConnectionManager>),
}

/// Shared handle to one storage backend.
#[derive(Clone)]
pub struct Store {
    engine: Arc<Engine>,
}

impl Store {
    pub fn memory() -> Self {
        Self {
            engine: Arc::new(Engine::Memory(RwLock::new(HashMap::new()))),
        }
    }

    pub fn open(backend: StoreBackend) -> Result<Self> {
        let engine = match backend {
            StoreBackend::Memory => return Ok(Self::memory()),
            StoreBackend::Sled { path } => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).ok();
                }
                let db = sled::open(&path)
                    .map_err(|e| anyhow!("failed to open sled store {}: {e}", path.display()))?;
                Engine::Sled(db)
            }
            StoreBackend::Redis { url } => {
                let manager = RedisConnectionManager {
                    client: redis::Client::open(url.as_str())?,
                };
                Engine::Redis(
                    r2d2::Pool::builder()
                        .max_size(REDIS_POOL_SIZE)
                        .build(manager)?,
                )
            }
        };
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    pub fn table<T>(&self, name: &str) -> Table<T> {
        Table {
            store: self.clone(),
            name: name.to_string(),
            _record: PhantomData,
        }
    }

    pub fn journal<T>(&self, name: &str) -> Journal<T> {
        Journal {
            store: self.clone(),
            name: name.to_string(),
            _event: PhantomData,
        }
    }
}

fn poisoned<E>(_: E) -> anyhow::Error {
    anyhow!("store lock poisoned")
}

/// Time one store operation; slow ones are logged.
fn timed<R>(collection: &str, op: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
    let start = Instant::now();
    let out = f();
    let elapsed = start.elapsed();
    let ms = elapsed.as_millis() as u64;
    if elapsed >= Duration::from_millis(250) {
        warn!(collection, op, duration_ms = ms, "Slow store operation");
    } else if elapsed >= Duration::from_millis(50) {
        debug!(collection, op, duration_ms = ms, "Store operation latency");
    }
    out
}

/// Records of type `T` keyed by id.
pub struct Table<T> {
    store: Store,
    name: String,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Table<T> {
    fn redis_key(&self, id: &str) -> String {
        format!("{REDIS_PREFIX}{}:{id}", self.name)
    }

    pub fn put(&self, id: &str, record: &T) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        timed(&self.name, "put", || match self.store.engine.as_ref() {
            Engine::Memory(map) => {
                map.write()
                    .map_err(poisoned)?
                    .entry(self.name.clone())
                    .or_default()
                    .insert(id.to_string(), bytes);
                Ok(())
            }
            Engine::Sled(db) => {
                let tree = db.open_tree(&self.name)?;
                tree.insert(id, bytes)?;
                tree.flush()?;
                Ok(())
            }
            Engine::Redis(pool) => {
                let mut conn = pool.get()?;
                redis::cmd("SET")
                    .arg(self.redis_key(id))
                    .arg(bytes)
                    .query::<()>(&mut *conn)?;
                Ok(())
            }
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<T>> {
        let raw: Option<Vec<u8>> = timed(&self.name, "get", || match self.store.engine.as_ref() {
            Engine::Memory(map) => Ok(map
                .read()
                .map_err(poisoned)?
                .get(&self.name)
                .and_then(|rows| rows.get(id).cloned())),
            Engine::Sled(db) => Ok(db.open_tree(&self.name)?.get(id)?.map(|v| v.to_vec())),
            Engine::Redis(pool) => {
                let mut conn = pool.get()?;
                Ok(redis::cmd("GET")
                    .arg(self.redis_key(id))
                    .query(&mut *conn)?)
            }
        })?;
        raw.map(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
            .transpose()
    }

    /// Every record; rows that no longer decode are skipped with a warning.
    pub fn list(&self) -> Result<Vec<T>> {
        let rows: Vec<(String, Vec<u8>)> = timed(&self.name, "list", || {
            match self.store.engine.as_ref() {
                Engine::Memory(map) => Ok(map
                    .read()
                    .map_err(poisoned)?
                    .get(&self.name)
                    .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default()),
                Engine::Sled(db) => db
                    .open_tree(&self.name)?
                    .iter()
                    .map(|item| -> Result<(String, Vec<u8>)> {
                        let (k, v) = item?;
                        Ok((String::from_utf8_lossy(&k).into_owned(), v.to_vec()))
                    })
                    .collect(),
                Engine::Redis(pool) => {
                    let mut conn = pool.get()?;
                    let keys: Vec<String> = redis::cmd("KEYS")
                        .arg(self.redis_key("*"))
                        .query(&mut *conn)?;
                    let mut rows = Vec::with_capacity(keys.len());
                    for key in keys {
                        let value: Option<Vec<u8>> = redis::cmd("GET").arg(&key).query(&mut *conn)?;
                        if let Some(value) = value {
                            rows.push((key, value));
                        }
                    }
                    Ok(rows)
                }
            }
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|(key, bytes)| match serde_json::from_slice(&bytes) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(collection = %self.name, key = %key, error = %e, "Skipping malformed record");
                    None
                }
            })
            .collect())
    }

    /// Apply `change` to the stored record without losing concurrent writes.
    ///
    /// Returns the record as written, or None when `id` is absent. `change` may run more
    /// than once if another writer gets in between.
    pub fn update(&self, id: &str, mut change: impl FnMut(&mut T)) -> Result<Option<T>> {
        timed(&self.name, "update", || match self.store.engine.as_ref() {
            Engine::Memory(map) => {
                let mut guard = map.write().map_err(poisoned)?;
                let Some(slot) = guard.get_mut(&self.name).and_then(|rows| rows.get_mut(id)) else {
                    return Ok(None);
                };
                let mut record: T = serde_json::from_slice(slot)?;
                change(&mut record);
                *slot = serde_json::to_vec(&record)?;
                Ok(Some(record))
            }
            Engine::Sled(db) => {
                let tree = db.open_tree(&self.name)?;
                loop {
                    let Some(current) = tree.get(id)? else {
                        return Ok(None);
                    };
                    let mut record: T = serde_json::from_slice(&current)?;
                    change(&mut record);
                    let next = serde_json::to_vec(&record)?;
                    if tree.compare_and_swap(id, Some(current), Some(next))?.is_ok() {
                        tree.flush()?;
                        return Ok(Some(record));
                    }
                }
            }
            Engine::Redis(pool) => {
                let mut conn = pool.get()?;
                let key = self.redis_key(id);
                let mut decode_error = None;
                let written = redis::transaction(&mut *conn, &[&key], |con, pipe| {
                    let current: Option<Vec<u8>> = redis::cmd("GET").arg(&key).query(con)?;
                    let Some(current) = current else {
                        return Ok(Some(None));
                    };
                    let mut record: T = match serde_json::from_slice(&current) {
                        Ok(r) => r,
                        Err(e) => {
                            decode_error = Some(e);
                            return Ok(Some(None));
                        }
                    };
                    change(&mut record);
                    let next = match serde_json::to_vec(&record) {
                        Ok(b) => b,
                        Err(e) => {
                            decode_error = Some(e);
                            return Ok(Some(None));
                        }
                    };
                    // EXEC returns nil when the watched key changed; retry.
                    let exec: Option<()> = pipe
                        .cmd("SET")
                        .arg(&key)
                        .arg(next)
                        .ignore()
                        .query(con)?;
                    Ok(exec.map(|_| Some(record)))
                })?;
                match decode_error {
                    Some(e) => Err(e.into()),
                    None => Ok(written),
                }
            }
        })
    }
}

/// Append-only events of type `T`, grouped by partition.
pub struct Journal<T> {
    store: Store,
    name: String,
    _event: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    fn redis_key(&self, partition: &str) -> String {
        format!("{REDIS_PREFIX}{}:{partition}", self.name)
    }

    /// `<partition>/<seq>/<nonce>` keeps a partition contiguous and ordered.
    fn ordered_key(partition: &str, seq: u64) -> String {
        format!("{partition}/{seq:020}/{}", Uuid::new_v4().simple())
    }

    /// Append `event`; `seq` orders events within the partition (a timestamp works).
    pub fn append(&self, partition: &str, seq: u64, event: &T) -> Result<()> {
        let bytes = serde_json::to_vec(event)?;
        timed(&self.name, "append", || match self.store.engine.as_ref() {
            Engine::Memory(map) => {
                map.write()
                    .map_err(poisoned)?
                    .entry(self.name.clone())
                    .or_default()
                    .insert(Self::ordered_key(partition, seq), bytes);
                Ok(())
            }
            Engine::Sled(db) => {
                let tree = db.open_tree(&self.name)?;
                tree.insert(Self::ordered_key(partition, seq), bytes)?;
                tree.flush()?;
                Ok(())
            }
            Engine::Redis(pool) => {
                let mut conn = pool.get()?;
                redis::cmd("RPUSH")
                    .arg(self.redis_key(partition))
                    .arg(bytes)
                    .query::<i64>(&mut *conn)?;
                Ok(())
            }
        })
    }

    pub fn read(&self, partition: &str) -> Result<Vec<T>> {
        let prefix = format!("{partition}/");
        let rows: Vec<Vec<u8>> = timed(&self.name, "read", || match self.store.engine.as_ref() {
            Engine::Memory(map) => Ok(map
                .read()
                .map_err(poisoned)?
                .get(&self.name)
                .map(|rows| {
                    rows.range(prefix.clone()..)
                        .take_while(|(k, _)| k.starts_with(&prefix))
                        .map(|(_, v)| v.clone())
                        .collect()
                })
                .unwrap_or_default()),
            Engine::Sled(db) => db
                .open_tree(&self.name)?
                .scan_prefix(prefix.as_bytes())
                .map(|item| -> Result<Vec<u8>> { Ok(item?.1.to_vec()) })
                .collect(),
            Engine::Redis(pool) => {
                let mut conn = pool.get()?;
                Ok(redis::cmd("LRANGE")
                    .arg(self.redis_key(partition))
                    .arg(0)
                    .arg(-1)
                    .query(&mut *conn)?)
            }
        })?;
        rows.iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        name: String,
        hits: u64,
        enabled: bool,
    }

    fn row(name: &str) -> Row {
        Row {
            name: name.into(),
            hits: 0,
            enabled: true,
        }
    }

    fn exercise(store: &Store) {
        let table = store.table::<Row>("rows");
        table.put("a", &row("a")).unwrap();
        table.put("b", &row("b")).unwrap();
        assert_eq!(table.get("a").unwrap(), Some(row("a")));
        assert_eq!(table.get("zz").unwrap(), None);
        assert_eq!(table.list().unwrap().len(), 2);

        let updated = table.update("a", |r| r.hits += 3).unwrap().unwrap();
        assert_eq!(updated.hits, 3);
        assert_eq!(table.get("a").unwrap().unwrap().hits, 3);
        assert!(table.update("zz", |r| r.hits += 1).unwrap().is_none());

        let journal = store.journal::<Row>("events");
        journal.append("a", 2, &row("second")).unwrap();
        journal.append("a", 1, &row("first")).unwrap();
        journal.append("ab", 1, &row("other")).unwrap();
        let names: Vec<String> = journal.read("a").unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(journal.read("missing").unwrap().is_empty());
    }

    #[test]
    fn memory_store_tables_and_journals() {
        exercise(&Store::memory());
    }

    #[test]
    fn sled_store_tables_and_journals() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreBackend::Sled {
            path: dir.path().join("store.db"),
        })
        .unwrap();
        exercise(&store);
    }

    #[test]
    fn update_keeps_fields_written_after_a_stale_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreBackend::Sled {
            path: dir.path().join("store.db"),
        })
        .unwrap();
        let table = store.table::<Row>("rows");
        table.put("a", &row("a")).unwrap();

        let _stale = table.get("a").unwrap().unwrap();
        table.update("a", |r| r.enabled = false).unwrap();
        table.update("a", |r| r.hits = 99).unwrap();

        let now = table.get("a").unwrap().unwrap();
        assert!(!now.enabled);
        assert_eq!(now.hits, 99);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreBackend::Sled {
            path: dir.path().join("store.db"),
        })
        .unwrap();
        store.table::<Row>("rows").put("a", &row("a")).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let table = store.table::<Row>("rows");
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        table.update("a", |r| r.hits += 1).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(store.table::<Row>("rows").get("a").unwrap().unwrap().hits, 100);
    }

    #[test]
    fn malformed_rows_are_skipped_in_listings() {
        let store = Store::memory();
        let table = store.table::<Row>("rows");
        table.put("a", &row("a")).unwrap();
        store
            .table::<String>("rows")
            .put("junk", &"not a row".to_string())
            .unwrap();
        assert_eq!(table.list().unwrap(), vec![row("a")]);
    }

    #[test]
    fn backend_spec_parsing() {
        assert_eq!(StoreBackend::parse("memory"), Some(StoreBackend::Memory));
        assert_eq!(
            StoreBackend::parse("sled:./data/x.db"),
            Some(StoreBackend::Sled {
                path: "./data/x.db".into()
            })
        );
        assert!(matches!(
            StoreBackend::parse("rediss://cache:6380/"),
            Some(StoreBackend::Redis { .. })
        ));
        assert_eq!(StoreBackend::parse("sled:  "), None);
        assert_eq!(StoreBackend::parse("postgres://x"), None);
    }
}
