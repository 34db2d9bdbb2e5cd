//! Durable Storage Backends
//!
//! A flat string key-value table per user. The key store caches everything in
//! memory and only uses these backends to hydrate and persist. Providers also
//! hand out the per-user key the store seals its values with.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use super::sealing::keyed_digest;

const USER_KEY_DOMAIN: &[u8] = b"vc-keys:user_store_key:v1";

/// Storage backend errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// User ID cannot be used to scope storage.
    #[error("Invalid user id for key storage")]
    InvalidUserId,

    /// Blocking storage task panicked or was cancelled.
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A previous storage call panicked while holding the connection.
    #[error("Storage connection poisoned")]
    Poisoned,

    /// Sealing a value failed.
    #[error("Encryption error: {0}")]
    Encryption(String),
}

/// Storage result type.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Key-value storage scoped to a single user.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Every stored entry.
    async fn load_all(&self) -> Result<Vec<(String, String)>>;

    /// Insert or replace one entry.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete one entry. Missing keys are ignored.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete several entries at once.
    async fn delete_many(&self, keys: &[String]) -> Result<()>;

    /// Delete everything.
    async fn clear(&self) -> Result<()>;
}

/// Opens per-user storage.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn open(&self, user_id: &str) -> Result<Box<dyn KeyValueStorage>>;

    /// Key that seals the values stored for `user_id`.
    fn encryption_key(&self, user_id: &str) -> Result<Zeroizing<[u8; 32]>>;
}

/// Derive the per-user store key from a provider-wide master key.
fn user_key(master_key: &[u8; 32], user_id: &str) -> Result<Zeroizing<[u8; 32]>> {
    validate_user_id(user_id)?;
    Ok(keyed_digest(master_key, &[USER_KEY_DOMAIN, user_id.as_bytes()]))
}

/// Reject user IDs that are unsafe as a directory name.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    let valid = !user_id.is_empty()
        && user_id.len() <= 128
        && user_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidUserId)
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// One `SQLite` database per user under `<data_dir>/e2ee/<user_id>/keys.db`.
///
/// Values are sealed under a key derived from `master_key` and the user ID.
#[derive(Clone)]
pub struct SqliteStorageProvider {
    data_dir: PathBuf,
    master_key: Arc<Zeroizing<[u8; 32]>>,
}

impl SqliteStorageProvider {
    pub fn new(data_dir: impl Into<PathBuf>, master_key: [u8; 32]) -> Self {
        Self {
            data_dir: data_dir.into(),
            master_key: Arc::new(Zeroizing::new(master_key)),
        }
    }

    /// Database path for `user_id`.
    pub fn database_path(&self, user_id: &str) -> Result<PathBuf> {
        validate_user_id(user_id)?;
        Ok(self.data_dir.join("e2ee").join(user_id).join("keys.db"))
    }
}

fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        ",
    )?;
    Ok(conn)
}

#[async_trait]
impl StorageProvider for SqliteStorageProvider {
    async fn open(&self, user_id: &str) -> Result<Box<dyn KeyValueStorage>> {
        let path = self.database_path(user_id)?;
        debug!(path = %path.display(), "Opening key database");
        let conn = tokio::task::spawn_blocking(move || open_database(&path)).await??;
        Ok(Box::new(SqliteStorage {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }

    fn encryption_key(&self, user_id: &str) -> Result<Zeroizing<[u8; 32]>> {
        user_key(&self.master_key, user_id)
    }
}

/// `rusqlite::Connection` is `Send` but not `Sync`, so it sits behind a mutex
/// and every statement runs on the blocking pool.
struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StorageError::Poisoned)?;
            f(&mut conn).map_err(StorageError::from)
        })
        .await?
    }
}

#[async_trait]
impl KeyValueStorage for SqliteStorage {
    async fn load_all(&self) -> Result<Vec<(String, String)>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM kv")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, chrono::Utc::now().timestamp()],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let keys = keys.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("DELETE FROM kv WHERE key = ?1")?;
                for key in &keys {
                    stmt.execute(params![key])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.run(|conn| {
            conn.execute("DELETE FROM kv", [])?;
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

type Table = Arc<Mutex<BTreeMap<String, String>>>;

struct MemoryState {
    users: Mutex<HashMap<String, Table>>,
    opens: AtomicUsize,
    open_delay: Option<Duration>,
    master_key: Zeroizing<[u8; 32]>,
}

/// Storage that lives as long as the provider.
///
/// Data for a user survives close and reopen, like a database file would.
/// The master key is random per provider.
#[derive(Clone)]
pub struct MemoryStorageProvider {
    state: Arc<MemoryState>,
}

impl Default for MemoryStorageProvider {
    fn default() -> Self {
        Self::with_state(None)
    }
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `open` take at least `delay`.
    pub fn with_open_delay(delay: Duration) -> Self {
        Self::with_state(Some(delay))
    }

    fn with_state(open_delay: Option<Duration>) -> Self {
        Self {
            state: Arc::new(MemoryState {
                users: Mutex::new(HashMap::new()),
                opens: AtomicUsize::new(0),
                open_delay,
                master_key: Zeroizing::new(rand::random()),
            }),
        }
    }

    /// How many times `open` was called.
    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    async fn open(&self, user_id: &str) -> Result<Box<dyn KeyValueStorage>> {
        validate_user_id(user_id)?;
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.state.open_delay {
            tokio::time::sleep(delay).await;
        }
        let table = {
            let mut users = self
                .state
                .users
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(users.entry(user_id.to_string()).or_default())
        };
        Ok(Box::new(MemoryStorage { table }))
    }

    fn encryption_key(&self, user_id: &str) -> Result<Zeroizing<[u8; 32]>> {
        user_key(&self.state.master_key, user_id)
    }
}

struct MemoryStorage {
    table: Table,
}

impl MemoryStorage {
    fn with_table<T>(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> T) -> T {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut table)
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn load_all(&self) -> Result<Vec<(String, String)>> {
        Ok(self.with_table(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.with_table(|t| t.insert(key.to_string(), value.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_table(|t| t.remove(key));
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        self.with_table(|t| {
            for key in keys {
                t.remove(key);
            }
        });
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.with_table(BTreeMap::clear);
        Ok(())
    }
}
