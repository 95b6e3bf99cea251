use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

/// Well-known keys in the device's persistent store.
///
/// The raw names are shared with existing installs and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKey {
    UserToken,
    UserData,
    LastWorkingIp,
}

impl StorageKey {
    pub const ALL: [StorageKey; 3] = [
        StorageKey::UserToken,
        StorageKey::UserData,
        StorageKey::LastWorkingIp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::UserToken => "userToken",
            StorageKey::UserData => "userData",
            StorageKey::LastWorkingIp => "lastWorkingIP",
        }
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error for '{key}': {message}")]
    Serialization { message: String, key: String },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionFailed,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorCode::ConnectionFailed | StorageErrorCode::Busy | StorageErrorCode::Locked
        )
    }
}

/// Durable string storage owned by the shell (AsyncStorage, SQLite, ...).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: StorageKey) -> Result<Option<String>, KvError>;

    async fn set(&self, key: StorageKey, value: String) -> Result<(), KvError>;

    async fn remove(&self, key: StorageKey) -> Result<(), KvError>;

    async fn remove_many(&self, keys: &[StorageKey]) -> Result<(), KvError> {
        for key in keys {
            self.remove(*key).await?;
        }
        Ok(())
    }
}

pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: StorageKey,
) -> Result<Option<T>, KvError> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| KvError::Serialization {
                message: e.to_string(),
                key: key.to_string(),
            }),
        None => Ok(None),
    }
}

pub async fn store_json<T: Serialize + Sync>(
    store: &dyn KeyValueStore,
    key: StorageKey,
    value: &T,
) -> Result<(), KvError> {
    let raw = serde_json::to_string(value).map_err(|e| KvError::Serialization {
        message: e.to_string(),
        key: key.to_string(),
    })?;
    store.set(key, raw).await
}

fn check_size(value: &str) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<StorageKey, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: StorageKey) -> Result<Option<String>, KvError> {
        Ok(self.entries.read().await.get(&key).cloned())
    }

    async fn set(&self, key: StorageKey, value: String) -> Result<(), KvError> {
        check_size(&value)?;
        self.entries.write().await.insert(key, value);
        Ok(())
    }

    async fn remove(&self, key: StorageKey) -> Result<(), KvError> {
        self.entries.write().await.remove(&key);
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKvStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::Mutex;

    const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv_store (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )";

    /// SQLite-backed store for native shells and the CLI.
    pub struct SqliteKvStore {
        conn: Mutex<Connection>,
    }

    impl SqliteKvStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let conn = Connection::open(path.as_ref()).map_err(map_sqlite_error)?;
            Self::with_connection(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
            Self::with_connection(conn)
        }

        fn with_connection(conn: Connection) -> Result<Self, KvError> {
            conn.execute(SCHEMA, []).map_err(map_sqlite_error)?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn with_conn<T>(
            &self,
            op: impl FnOnce(&Connection) -> rusqlite::Result<T>,
        ) -> Result<T, KvError> {
            let conn = self
                .conn
                .lock()
                .map_err(|_| KvError::storage(StorageErrorCode::Locked, "connection poisoned"))?;
            op(&conn).map_err(map_sqlite_error)
        }
    }

    fn map_sqlite_error(error: rusqlite::Error) -> KvError {
        let code = match &error {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                rusqlite::ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                rusqlite::ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    StorageErrorCode::Corrupted
                }
                rusqlite::ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                rusqlite::ErrorCode::PermissionDenied | rusqlite::ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                rusqlite::ErrorCode::CannotOpen => StorageErrorCode::ConnectionFailed,
                rusqlite::ErrorCode::SystemIoFailure => StorageErrorCode::IoError,
                _ => StorageErrorCode::Unknown,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, error.to_string())
    }

    #[async_trait]
    impl KeyValueStore for SqliteKvStore {
        async fn get(&self, key: StorageKey) -> Result<Option<String>, KvError> {
            self.with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM kv_store WHERE key = ?1",
                    params![key.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
        }

        async fn set(&self, key: StorageKey, value: String) -> Result<(), KvError> {
            check_size(&value)?;
            let now = i64::try_from(crate::get_current_time_ms()).unwrap_or(i64::MAX);
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE
                     SET value = excluded.value, updated_at = excluded.updated_at",
                    params![key.as_str(), value, now],
                )
                .map(|_| ())
            })
        }

        async fn remove(&self, key: StorageKey) -> Result<(), KvError> {
            self.with_conn(|conn| {
                conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key.as_str()])
                    .map(|_| ())
            })
        }
    }
}
