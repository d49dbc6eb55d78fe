//! Session records and the two-tier session store
//!
//! The memory mirror answers every read it can and is the only place live
//! API clients are kept; the durable repository is authoritative across
//! restarts. Writes go to memory first and to the repository when the caller
//! asked for the session to be remembered.

pub mod repository;

use crate::Broker;
use crate::error::BrokerResult;
use crate::providers::BrokerApi;
use crate::redact;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub use repository::{FileRepository, MemoryRepository, PersistedSession, SessionRepository};

/// Authentication protocol that produced a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    /// OAuth-style redirect with a request token exchange
    RedirectDelegated,
    /// Partner consent generate/consume
    PartnerConsent,
    /// Static client id + access token supplied by the user
    DirectToken,
    /// Login id, password and time-based one-time code
    PasswordTotp,
}

/// (broker, user) pair a session belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub broker: Broker,
    pub user_id: String,
}

impl SessionKey {
    pub fn new(broker: Broker, user_id: impl Into<String>) -> Self {
        Self {
            broker,
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.broker, self.user_id)
    }
}

/// Outcome of a successful authentication
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Token presented on every API call
    pub access_token: String,
    /// Renewal token, when the broker issues one
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Market-feed token (SmartAPI)
    #[serde(default)]
    pub feed_token: Option<String>,
    /// Broker-native identifiers such as client code or consent id
    #[serde(default)]
    pub identifiers: FxHashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub transport_mode: TransportMode,
}

impl SessionRecord {
    /// Create a session valid for `ttl` from now
    #[must_use]
    pub fn new(access_token: String, transport_mode: TransportMode, ttl: ChronoDuration) -> Self {
        let now = Utc::now();
        Self {
            access_token,
            refresh_token: None,
            feed_token: None,
            identifiers: FxHashMap::default(),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            transport_mode,
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, token: Option<String>) -> Self {
        self.refresh_token = token;
        self
    }

    #[must_use]
    pub fn with_feed_token(mut self, token: Option<String>) -> Self {
        self.feed_token = token;
        self
    }

    #[must_use]
    pub fn with_identifier(mut self, key: &str, value: impl Into<String>) -> Self {
        self.identifiers.insert(key.to_string(), value.into());
        self
    }

    /// Broker-native identifier lookup
    #[must_use]
    pub fn identifier(&self, key: &str) -> Option<&str> {
        self.identifiers.get(key).map(String::as_str)
    }

    /// Check if the session is still valid (not expired)
    #[must_use]
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }

    /// Get time until expiration in hours
    #[must_use]
    pub fn expires_in_hours(&self) -> f64 {
        let remaining = self.expires_at.signed_duration_since(Utc::now());
        let minutes = i32::try_from(remaining.num_minutes()).unwrap_or(i32::MAX);
        f64::from(minutes) / 60.0
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .field("feed_token", &self.feed_token.as_deref().map(redact))
            .field("identifiers", &self.identifiers)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .field("expires_at", &self.expires_at)
            .field("transport_mode", &self.transport_mode)
            .finish()
    }
}

struct MirrorEntry {
    record: SessionRecord,
    persisted: bool,
}

/// Two-tier session store
///
/// Writes for one key run one at a time, in the order they arrive.
pub struct SessionStore {
    mirror: RwLock<FxHashMap<SessionKey, MirrorEntry>>,
    clients: RwLock<FxHashMap<SessionKey, Arc<dyn BrokerApi>>>,
    write_locks: Mutex<FxHashMap<SessionKey, Arc<Mutex<()>>>>,
    durable: Arc<dyn SessionRepository>,
}

impl SessionStore {
    /// Create a store over a durable repository
    pub fn new(durable: Arc<dyn SessionRepository>) -> Self {
        Self {
            mirror: RwLock::new(FxHashMap::default()),
            clients: RwLock::new(FxHashMap::default()),
            write_locks: Mutex::new(FxHashMap::default()),
            durable,
        }
    }

    async fn key_lock(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        Arc::clone(self.write_locks.lock().await.entry(key.clone()).or_default())
    }

    /// Store a session, replacing any previous one for the key
    ///
    /// Any live client built from the replaced session is dropped.
    ///
    /// # Errors
    /// Returns a storage error if the durable write fails; the memory mirror
    /// is only updated once the durable copy is in place
    pub async fn save(&self, key: &SessionKey, record: SessionRecord, persist: bool) -> BrokerResult<()> {
        let lock = self.key_lock(key).await;
        let _write = lock.lock().await;

        if persist {
            self.durable
                .upsert(PersistedSession::new(key.clone(), record.clone()))
                .await?;
        } else if self.durable.get(key).await?.is_some() {
            // an ephemeral login supersedes an older remembered one
            self.durable.delete(key).await?;
        }

        self.clients.write().await.remove(key);
        self.mirror
            .write()
            .await
            .insert(key.clone(), MirrorEntry { record, persisted: persist });

        info!(
            "Session saved for {} (persist: {})",
            key, persist
        );
        Ok(())
    }

    /// Load an unexpired session, memory first
    ///
    /// # Errors
    /// Returns a storage error if the durable read fails
    pub async fn load(&self, key: &SessionKey) -> BrokerResult<Option<SessionRecord>> {
        if let Some(entry) = self.mirror.read().await.get(key) {
            if entry.record.is_valid() {
                return Ok(Some(entry.record.clone()));
            }
            debug!("In-memory session for {} has expired", key);
        }

        let lock = self.key_lock(key).await;
        let _write = lock.lock().await;
        let Some(stored) = self.durable.get(key).await? else {
            return Ok(None);
        };

        if !stored.session.is_valid() {
            debug!("Durable session for {} has expired", key);
            return Ok(None);
        }

        // converge the mirror with the durable copy
        let record = stored.session;
        self.mirror.write().await.insert(
            key.clone(),
            MirrorEntry {
                record: record.clone(),
                persisted: true,
            },
        );
        Ok(Some(record))
    }

    /// Durable copy regardless of expiry
    ///
    /// # Errors
    /// Returns a storage error if the durable read fails
    pub async fn load_raw(&self, key: &SessionKey) -> BrokerResult<Option<SessionRecord>> {
        if let Some(entry) = self.mirror.read().await.get(key) {
            return Ok(Some(entry.record.clone()));
        }
        Ok(self.durable.get(key).await?.map(|p| p.session))
    }

    /// Whether the session for `key` is (or was) remembered durably
    ///
    /// The mirror answers when it holds the key; otherwise any durable row,
    /// expired or not, counts.
    ///
    /// # Errors
    /// Returns a storage error if the durable read fails
    pub async fn is_persisted(&self, key: &SessionKey) -> BrokerResult<bool> {
        if let Some(entry) = self.mirror.read().await.get(key) {
            return Ok(entry.persisted);
        }
        Ok(self.durable.get(key).await?.is_some())
    }

    /// Remove both copies and any live client
    ///
    /// # Errors
    /// Returns a storage error if the durable delete fails
    pub async fn invalidate(&self, key: &SessionKey) -> BrokerResult<()> {
        let lock = self.key_lock(key).await;
        let _write = lock.lock().await;
        self.clients.write().await.remove(key);
        self.mirror.write().await.remove(key);
        self.durable.delete(key).await?;
        info!("Session invalidated for {}", key);
        Ok(())
    }

    /// Expire the session in place and drop its live client
    ///
    /// The record stays in both tiers, so the key keeps reading as lapsed
    /// rather than never connected until it is replaced or purged.
    ///
    /// # Errors
    /// Returns a storage error if the durable write fails
    pub async fn mark_expired(&self, key: &SessionKey) -> BrokerResult<()> {
        let lock = self.key_lock(key).await;
        let _write = lock.lock().await;
        let now = Utc::now();

        self.clients.write().await.remove(key);
        if let Some(mut stored) = self.durable.get(key).await? {
            stored.session.expires_at = now;
            stored.session.updated_at = now;
            self.durable.upsert(stored).await?;
        }
        if let Some(entry) = self.mirror.write().await.get_mut(key) {
            entry.record.expires_at = now;
            entry.record.updated_at = now;
        }
        info!("Session for {} marked expired", key);
        Ok(())
    }

    /// Push the expiry of an existing session out to `new_expiry`
    ///
    /// Returns `false` when there is no session to extend.
    ///
    /// # Errors
    /// Returns a storage error if the durable write fails
    pub async fn refresh_expiry(&self, key: &SessionKey, new_expiry: DateTime<Utc>) -> BrokerResult<bool> {
        let lock = self.key_lock(key).await;
        let _write = lock.lock().await;
        let now = Utc::now();
        let mut found = false;

        if let Some(mut stored) = self.durable.get(key).await? {
            stored.session.expires_at = new_expiry;
            stored.session.updated_at = now;
            self.durable.upsert(stored).await?;
            found = true;
        }

        if let Some(entry) = self.mirror.write().await.get_mut(key) {
            entry.record.expires_at = new_expiry;
            entry.record.updated_at = now;
            found = true;
        }

        if found {
            info!("Session for {} extended to {}", key, new_expiry);
        } else {
            warn!("No session to refresh for {}", key);
        }
        Ok(found)
    }

    /// Keep a live client for a key
    pub async fn attach_client(&self, key: &SessionKey, client: Arc<dyn BrokerApi>) {
        self.clients.write().await.insert(key.clone(), client);
    }

    /// Live client, if one was attached since the last save/invalidate
    pub async fn client(&self, key: &SessionKey) -> Option<Arc<dyn BrokerApi>> {
        self.clients.read().await.get(key).cloned()
    }

    /// Keys with an unexpired session for `user_id`, memory and durable
    ///
    /// # Errors
    /// Returns a storage error if the durable listing fails
    pub async fn active_keys_for_user(&self, user_id: &str) -> BrokerResult<Vec<SessionKey>> {
        let mut keys: Vec<SessionKey> = self
            .mirror
            .read()
            .await
            .iter()
            .filter(|(k, entry)| k.user_id == user_id && entry.record.is_valid())
            .map(|(k, _)| k.clone())
            .collect();

        for stored in self.durable.list_for_user(user_id).await? {
            if stored.session.is_valid() && !keys.contains(&stored.key) {
                keys.push(stored.key);
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Every durable session, expired ones included
    ///
    /// # Errors
    /// Returns a storage error if the durable listing fails
    pub async fn list_durable(&self) -> BrokerResult<Vec<PersistedSession>> {
        self.durable.list_all().await
    }

    /// Mirror every unexpired durable session into memory
    ///
    /// # Errors
    /// Returns a storage error if the durable listing fails
    pub async fn warm_start(&self) -> BrokerResult<usize> {
        let stored = self.durable.list_all().await?;
        let mut mirror = self.mirror.write().await;
        let mut loaded = 0;
        for persisted in stored.into_iter().filter(|p| p.session.is_valid()) {
            mirror.insert(
                persisted.key,
                MirrorEntry {
                    record: persisted.session,
                    persisted: true,
                },
            );
            loaded += 1;
        }
        info!("Warm start loaded {} durable sessions", loaded);
        Ok(loaded)
    }

    /// Delete durable rows and mirror entries past their expiry
    ///
    /// # Errors
    /// Returns a storage error if the durable purge fails
    pub async fn purge_expired(&self) -> BrokerResult<usize> {
        let removed = self.durable.purge_expired(Utc::now()).await?;
        let expired: Vec<SessionKey> = self
            .mirror
            .read()
            .await
            .iter()
            .filter(|(_, entry)| !entry.record.is_valid())
            .map(|(k, _)| k.clone())
            .collect();

        if !expired.is_empty() {
            let mut mirror = self.mirror.write().await;
            let mut clients = self.clients.write().await;
            for key in &expired {
                mirror.remove(key);
                clients.remove(key);
            }
        }
        Ok(removed)
    }

    /// Drop the memory mirror and every live client
    pub async fn clear_memory(&self) {
        self.clients.write().await.clear();
        self.mirror.write().await.clear();
    }
}
