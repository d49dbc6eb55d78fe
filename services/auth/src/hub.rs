//! Broker hub
//!
//! Owns the credential store, pending-login registry, session store and one
//! driver per broker, and exposes the operations a web layer maps onto
//! routes. Constructed once at process start; [`BrokerHub::shutdown`] is the
//! explicit teardown.

use crate::config::HubConfig;
use crate::credentials::{CredentialRecord, CredentialStore};
use crate::error::{BrokerError, BrokerResult};
use crate::facade::{self, BrokerSnapshot, DataKind};
use crate::guard::ReauthGuard;
use crate::pending::PendingAuthRegistry;
use crate::providers::{
    AngelDriver, AuthDriver, CompletedLogin, DhanDriver, LoginStep, ZerodhaDriver, build_http_client,
    totp,
};
use crate::session::{FileRepository, SessionKey, SessionRecord, SessionRepository, SessionStore, TransportMode};
use crate::Broker;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Identifier keys never shown in summaries
const HIDDEN_IDENTIFIERS: [&str; 1] = ["api_key"];

/// Token-free view of a live session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub broker: Broker,
    pub user_id: String,
    pub transport_mode: TransportMode,
    pub identifiers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_in_hours: f64,
}

impl SessionSummary {
    fn new(key: &SessionKey, record: &SessionRecord) -> Self {
        Self {
            broker: key.broker,
            user_id: key.user_id.clone(),
            transport_mode: record.transport_mode,
            identifiers: record
                .identifiers
                .iter()
                .filter(|(k, _)| !HIDDEN_IDENTIFIERS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            expires_in_hours: record.expires_in_hours(),
        }
    }
}

/// Connection state for one (broker, user)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "session", rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No session was ever established
    NotConnected,
    /// A valid session exists
    Connected(SessionSummary),
    /// A session existed but has lapsed; the user must reconnect
    Expired,
}

impl ConnectionStatus {
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// One durable session as listed to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedSession {
    pub broker: Broker,
    pub user_id: String,
    pub transport_mode: TransportMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Credential, login and session lifecycle for every broker
pub struct BrokerHub {
    config: HubConfig,
    credentials: Arc<CredentialStore>,
    pending: Arc<PendingAuthRegistry>,
    sessions: Arc<SessionStore>,
    guard: ReauthGuard,
    drivers: FxHashMap<Broker, Arc<dyn AuthDriver>>,
}

impl BrokerHub {
    /// Build a hub with the stock drivers over a durable repository
    #[must_use]
    pub fn new(config: HubConfig, repository: Arc<dyn SessionRepository>) -> Self {
        let credentials = Arc::new(CredentialStore::new());
        let pending = Arc::new(PendingAuthRegistry::new(config.pending_ttl()));
        let sessions = Arc::new(SessionStore::new(repository));
        let http = build_http_client(config.http_timeout());

        let mut drivers: FxHashMap<Broker, Arc<dyn AuthDriver>> = FxHashMap::default();
        drivers.insert(
            Broker::Kite,
            Arc::new(ZerodhaDriver::new(
                http.clone(),
                config.settings(Broker::Kite).clone(),
                Arc::clone(&credentials),
                Arc::clone(&pending),
            )),
        );
        drivers.insert(
            Broker::Dhan,
            Arc::new(DhanDriver::new(
                http.clone(),
                config.settings(Broker::Dhan).clone(),
                Arc::clone(&credentials),
                Arc::clone(&pending),
            )),
        );
        drivers.insert(
            Broker::Angel,
            Arc::new(AngelDriver::new(
                http,
                config.settings(Broker::Angel).clone(),
                config.totp,
                Arc::clone(&credentials),
            )),
        );

        info!("Broker hub initialised with {} drivers", drivers.len());
        Self {
            guard: ReauthGuard::new(Arc::clone(&sessions)),
            config,
            credentials,
            pending,
            sessions,
            drivers,
        }
    }

    /// Build a hub whose durable store lives under `config.cache_dir`
    ///
    /// # Errors
    /// Returns a storage error if the cache directory cannot be created
    pub fn with_file_store(config: HubConfig) -> BrokerResult<Self> {
        let repository = Arc::new(FileRepository::new(&config.cache_dir)?);
        Ok(Self::new(config, repository))
    }

    /// Replace the driver for its broker
    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn AuthDriver>) -> Self {
        self.drivers.insert(driver.broker(), driver);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    #[must_use]
    pub const fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    fn driver(&self, broker: Broker) -> BrokerResult<&dyn AuthDriver> {
        self.drivers
            .get(&broker)
            .map(|driver| driver.as_ref())
            .ok_or_else(|| BrokerError::UnknownBroker(broker.to_string()))
    }

    /// Store credentials for (broker, user)
    ///
    /// # Errors
    /// Returns `CredentialsMissing` when the broker's required fields are absent
    pub async fn register_credentials(
        &self,
        broker: Broker,
        user_id: &str,
        credentials: CredentialRecord,
    ) -> BrokerResult<TransportMode> {
        self.credentials.register(broker, user_id, credentials).await
    }

    /// Start a login
    ///
    /// Logins that finish without the user are saved immediately, durably
    /// when `remember` is set.
    ///
    /// # Errors
    /// Returns the driver's typed failure
    pub async fn begin_login(&self, broker: Broker, user_id: &str, remember: bool) -> BrokerResult<LoginStep> {
        let step = self.driver(broker)?.begin(user_id, remember).await?;
        if let LoginStep::Established(session) = &step {
            self.sessions
                .save(&SessionKey::new(broker, user_id), session.clone(), remember)
                .await?;
        }
        Ok(step)
    }

    /// Finish a redirect or consent login from its callback
    ///
    /// # Errors
    /// Returns `ProtocolViolation` for an unknown or abandoned correlation,
    /// otherwise the driver's typed failure; no session is written on error
    pub async fn complete_login(
        &self,
        broker: Broker,
        correlation: &str,
        provider_token: &str,
    ) -> BrokerResult<SessionSummary> {
        let CompletedLogin { pending, session } =
            self.driver(broker)?.complete(correlation, provider_token).await?;

        let key = SessionKey::new(broker, pending.user_id);
        let summary = SessionSummary::new(&key, &session);
        self.sessions.save(&key, session, pending.remember).await?;
        info!("{} connected", key);
        Ok(summary)
    }

    /// Connection state for (broker, user)
    ///
    /// # Errors
    /// Returns a storage error if the durable read fails
    pub async fn status(&self, broker: Broker, user_id: &str) -> BrokerResult<ConnectionStatus> {
        let key = SessionKey::new(broker, user_id);
        if let Some(session) = self.sessions.load(&key).await? {
            return Ok(ConnectionStatus::Connected(SessionSummary::new(&key, &session)));
        }
        if self.sessions.load_raw(&key).await?.is_some() {
            return Ok(ConnectionStatus::Expired);
        }
        Ok(ConnectionStatus::NotConnected)
    }

    /// Forget the session for (broker, user); credentials stay registered
    ///
    /// # Errors
    /// Returns a storage error if the durable delete fails
    pub async fn disconnect(&self, broker: Broker, user_id: &str) -> BrokerResult<()> {
        self.sessions.invalidate(&SessionKey::new(broker, user_id)).await
    }

    /// Normalized orders, positions or trades
    ///
    /// # Errors
    /// `NotConnected`, `SessionExpired` or `BrokerCallFailed` from the guard
    pub async fn fetch(&self, broker: Broker, user_id: &str, kind: DataKind) -> BrokerResult<Vec<Value>> {
        facade::fetch(&self.guard, self.driver(broker)?, user_id, kind).await
    }

    /// All three data families in one call
    ///
    /// # Errors
    /// The first failing call's error
    pub async fn fetch_all(&self, broker: Broker, user_id: &str) -> BrokerResult<BrokerSnapshot> {
        facade::fetch_all(&self.guard, self.driver(broker)?, user_id).await
    }

    /// Brokers with a valid session for `user_id`
    ///
    /// # Errors
    /// Returns a storage error if the durable listing fails
    pub async fn connected_brokers(&self, user_id: &str) -> BrokerResult<Vec<Broker>> {
        let mut brokers: Vec<Broker> = self
            .sessions
            .active_keys_for_user(user_id)
            .await?
            .into_iter()
            .map(|key| key.broker)
            .collect();
        brokers.dedup();
        Ok(brokers)
    }

    /// Push the session's expiry out by the configured extension
    ///
    /// # Errors
    /// Returns `NotConnected` when there is no session to extend
    pub async fn refresh_session(&self, broker: Broker, user_id: &str) -> BrokerResult<DateTime<Utc>> {
        let key = SessionKey::new(broker, user_id);
        let new_expiry = Utc::now() + ChronoDuration::hours(self.config.refresh_extension_hours);
        if self.sessions.refresh_expiry(&key, new_expiry).await? {
            Ok(new_expiry)
        } else {
            Err(BrokerError::NotConnected { broker })
        }
    }

    /// Every durable session with its activity flag
    ///
    /// # Errors
    /// Returns a storage error if the durable listing fails
    pub async fn saved_sessions(&self) -> BrokerResult<Vec<SavedSession>> {
        let now = Utc::now();
        let mut saved: Vec<SavedSession> = self
            .sessions
            .list_durable()
            .await?
            .into_iter()
            .map(|row| SavedSession {
                broker: row.key.broker,
                user_id: row.key.user_id,
                transport_mode: row.session.transport_mode,
                created_at: row.session.created_at,
                updated_at: row.session.updated_at,
                expires_at: row.session.expires_at,
                is_active: row.session.expires_at > now,
            })
            .collect();
        saved.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(saved)
    }

    /// Drop logins whose callback never arrived
    pub async fn reclaim_abandoned_logins(&self) -> usize {
        self.pending.reclaim_expired().await
    }

    /// Delete sessions past their expiry
    ///
    /// # Errors
    /// Returns a storage error if the durable purge fails
    pub async fn purge_expired(&self) -> BrokerResult<usize> {
        self.sessions.purge_expired().await
    }

    /// Mirror unexpired durable sessions into memory
    ///
    /// # Errors
    /// Returns a storage error if the durable listing fails
    pub async fn warm_start(&self) -> BrokerResult<usize> {
        self.sessions.warm_start().await
    }

    /// Current one-time code for the registered seed
    ///
    /// # Errors
    /// `CredentialsMissing` without a registered seed, `CredentialsInvalid`
    /// for a malformed one
    pub async fn current_totp(&self, broker: Broker, user_id: &str) -> BrokerResult<String> {
        let creds = self.credentials.require(broker, user_id).await?;
        let seed = creds.totp_seed().ok_or_else(|| BrokerError::CredentialsMissing {
            broker,
            detail: "totp_seed".to_string(),
        })?;
        totp::generate_code(broker, seed)
    }

    /// Drop live clients, the memory mirror and pending logins
    ///
    /// Durable sessions survive for the next start.
    pub async fn shutdown(&self) {
        let abandoned = self.pending.len().await;
        if abandoned > 0 {
            warn!("Shutting down with {} logins in flight", abandoned);
        }
        self.pending.clear().await;
        self.sessions.clear_memory().await;
        info!("Broker hub shut down");
    }
}
