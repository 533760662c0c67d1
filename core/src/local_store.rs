/// Persisted local client state: token, current user, read watermarks, unread map
/// String keys -> string values in a sled embedded database
use crate::error::{Result, SyncError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub const TOKEN_KEY: &str = "token";
pub const USER_KEY: &str = "user";
pub const UNREAD_KEY: &str = "unread_map";

/// Key of the read watermark for one conversation
pub fn watermark_key(conversation_id: &str) -> String {
    format!("read:{}", conversation_id)
}

/// Local store backed by sled embedded database
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<sled::Db>,
}

impl LocalStore {
    /// Open (or create) the store in the given data directory
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("local.db");
        debug!("Opening local store at {:?}", db_path);

        let db = sled::open(&db_path)
            .map_err(|e| SyncError::Storage(format!("Failed to open local store: {}", e)))?;

        info!("Local store initialized at {:?}", db_path);
        Ok(Self { db: Arc::new(db) })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        match self.db.get(key.as_bytes()) {
            Ok(Some(value)) => Ok(Some(String::from_utf8_lossy(&value).into_owned())),
            Ok(None) => Ok(None),
            Err(e) => Err(SyncError::Storage(format!("Failed to read {}: {}", key, e))),
        }
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .insert(key.as_bytes(), value.as_bytes())
            .map_err(|e| SyncError::Storage(format!("Failed to write {}: {}", key, e)))?;
        self.flush()
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        let removed = self
            .db
            .remove(key.as_bytes())
            .map_err(|e| SyncError::Storage(format!("Failed to remove {}: {}", key, e)))?;
        self.flush()?;
        Ok(removed.is_some())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.put(key, &raw)
    }

    /// Atomically replace the value under `key` with `f(current)`.
    /// `f` may run more than once under contention; `None` removes the key.
    pub fn update<F>(&self, key: &str, mut f: F) -> Result<Option<String>>
    where
        F: FnMut(Option<&str>) -> Option<String>,
    {
        let updated = self
            .db
            .update_and_fetch(key.as_bytes(), |old| {
                let current = old.map(|v| String::from_utf8_lossy(v).into_owned());
                f(current.as_deref()).map(String::into_bytes)
            })
            .map_err(|e| SyncError::Storage(format!("Failed to update {}: {}", key, e)))?;
        self.flush()?;
        Ok(updated.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| SyncError::Storage(format!("Failed to flush local store: {}", e)))?;
        Ok(())
    }
}
