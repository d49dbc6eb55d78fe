//! Durable session storage
//!
//! One record per (broker, user); `upsert` replaces, never duplicates.

use super::{SessionKey, SessionRecord};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Row layout of the durable store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub key: SessionKey,
    pub session: SessionRecord,
}

impl PersistedSession {
    #[must_use]
    pub const fn new(key: SessionKey, session: SessionRecord) -> Self {
        Self { key, session }
    }
}

/// Key-value store with expiry for sessions
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert or replace the record for `row.key`
    async fn upsert(&self, row: PersistedSession) -> BrokerResult<()>;

    /// Stored record, expired or not
    async fn get(&self, key: &SessionKey) -> BrokerResult<Option<PersistedSession>>;

    /// Remove the record; missing keys are not an error
    async fn delete(&self, key: &SessionKey) -> BrokerResult<()>;

    /// Every record owned by `user_id`
    async fn list_for_user(&self, user_id: &str) -> BrokerResult<Vec<PersistedSession>>;

    /// Every record
    async fn list_all(&self) -> BrokerResult<Vec<PersistedSession>>;

    /// Remove records with `expires_at <= now`, returning how many went
    async fn purge_expired(&self, now: DateTime<Utc>) -> BrokerResult<usize>;
}

/// Process-local durable store
#[derive(Default)]
pub struct MemoryRepository {
    rows: RwLock<FxHashMap<SessionKey, PersistedSession>>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl SessionRepository for MemoryRepository {
    async fn upsert(&self, row: PersistedSession) -> BrokerResult<()> {
        self.rows.write().await.insert(row.key.clone(), row);
        Ok(())
    }

    async fn get(&self, key: &SessionKey) -> BrokerResult<Option<PersistedSession>> {
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &SessionKey) -> BrokerResult<()> {
        self.rows.write().await.remove(key);
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> BrokerResult<Vec<PersistedSession>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.key.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> BrokerResult<Vec<PersistedSession>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> BrokerResult<usize> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, row| row.session.expires_at > now);
        Ok(before - rows.len())
    }
}

/// One JSON document per session under a cache directory
pub struct FileRepository {
    dir: PathBuf,
    // serialises writers so temp files never race
    write_lock: tokio::sync::Mutex<()>,
}

impl FileRepository {
    /// Create a repository rooted at `dir`, creating it if needed
    ///
    /// # Errors
    /// Returns a storage error if the directory cannot be created
    pub fn new(dir: impl Into<PathBuf>) -> BrokerResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!("Session cache directory: {}", dir.display());
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Get cache file path
    fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!(
            "{}_session_{}.json",
            key.broker,
            hex::encode(key.user_id.as_bytes())
        ))
    }

    fn read_row(path: &Path) -> Option<PersistedSession> {
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<PersistedSession>(&content) {
                Ok(row) => Some(row),
                Err(e) => {
                    warn!("Failed to parse cached session {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read cached session {}: {}", path.display(), e);
                None
            }
        }
    }

    fn scan(&self, suffix: Option<String>) -> BrokerResult<Vec<PersistedSession>> {
        let mut rows = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") || !name.contains("_session_") {
                continue;
            }
            if let Some(ref suffix) = suffix
                && !name.ends_with(suffix.as_str())
            {
                continue;
            }
            if let Some(row) = Self::read_row(&path) {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl SessionRepository for FileRepository {
    async fn upsert(&self, row: PersistedSession) -> BrokerResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(&row.key);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&row)?;

        // write-then-rename keeps readers from seeing a torn document
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;

        info!("Session cached at: {}", path.display());
        Ok(())
    }

    async fn get(&self, key: &SessionKey) -> BrokerResult<Option<PersistedSession>> {
        let path = self.path_for(key);
        if !path.exists() {
            debug!("No session cache file found at: {}", path.display());
            return Ok(None);
        }
        Ok(Self::read_row(&path).filter(|row| row.key == *key))
    }

    async fn delete(&self, key: &SessionKey) -> BrokerResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed cached session {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BrokerError::from(e)),
        }
    }

    async fn list_for_user(&self, user_id: &str) -> BrokerResult<Vec<PersistedSession>> {
        let suffix = format!("_session_{}.json", hex::encode(user_id.as_bytes()));
        Ok(self
            .scan(Some(suffix))?
            .into_iter()
            .filter(|row| row.key.user_id == user_id)
            .collect())
    }

    async fn list_all(&self) -> BrokerResult<Vec<PersistedSession>> {
        self.scan(None)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> BrokerResult<usize> {
        let expired: Vec<SessionKey> = self
            .scan(None)?
            .into_iter()
            .filter(|row| row.session.expires_at <= now)
            .map(|row| row.key)
            .collect();

        for key in &expired {
            self.delete(key).await?;
        }
        Ok(expired.len())
    }
}
