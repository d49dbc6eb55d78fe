//! Session validity / auto-reauth guard
//!
//! Resolves a live client for (broker, user), runs one operation against it
//! and, when the broker reports an expired token, re-authenticates once and
//! retries once. There is no further retry.

use crate::error::{BrokerError, BrokerResult};
use crate::providers::{AuthDriver, BrokerApi, ExpirySignal, error_envelope};
use crate::session::{SessionKey, SessionRecord, SessionStore};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one guarded attempt
enum Attempt {
    Done(Value),
    Expired(String),
    Failed(BrokerError),
}

impl Attempt {
    fn classify(result: BrokerResult<Value>, signal: &ExpirySignal) -> Self {
        match result {
            Ok(payload) if signal.matches_payload(&payload) => {
                let message = error_envelope(&payload)
                    .map(|(_, message)| message)
                    .unwrap_or_else(|| "token expired".to_string());
                Self::Expired(message)
            }
            Ok(payload) => Self::Done(payload),
            Err(err) if signal.matches_error(&err) => Self::Expired(err.to_string()),
            Err(err) => Self::Failed(err),
        }
    }
}

/// Wraps broker calls with one transparent re-authentication
pub struct ReauthGuard {
    sessions: Arc<SessionStore>,
}

impl ReauthGuard {
    #[must_use]
    pub const fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }

    /// Run `operation` against the live client for (`driver.broker()`, `user_id`)
    ///
    /// # Errors
    /// - `NotConnected` when no session exists and none can be created
    ///   without the user
    /// - `SessionExpired` when the session lapsed and could not be renewed
    ///   silently
    /// - `BrokerCallFailed` for any failed call, with `expired` set when the
    ///   failure carried the broker's expiry signal
    pub async fn invoke<F, Fut>(
        &self,
        driver: &dyn AuthDriver,
        user_id: &str,
        operation: F,
    ) -> BrokerResult<Value>
    where
        F: Fn(Arc<dyn BrokerApi>) -> Fut + Send + Sync,
        Fut: Future<Output = BrokerResult<Value>> + Send,
    {
        let broker = driver.broker();
        let key = SessionKey::new(broker, user_id);
        let signal = driver.expiry_signal();

        let session = self.resolve(driver, &key).await?;
        let api = self.client_for(driver, &key, &session).await?;

        match Attempt::classify(operation(api).await, signal) {
            Attempt::Done(payload) => return Ok(payload),
            Attempt::Failed(err) => {
                return Err(BrokerError::BrokerCallFailed {
                    broker,
                    message: err.to_string(),
                    expired: false,
                });
            }
            Attempt::Expired(message) => {
                info!("{} session for {} expired ({}), re-authenticating", broker, user_id, message);
            }
        }

        let fresh = self.reauthenticate(driver, &key).await?;
        let api = self.client_for(driver, &key, &fresh).await?;

        match Attempt::classify(operation(api).await, signal) {
            Attempt::Done(payload) => Ok(payload),
            Attempt::Expired(message) => {
                warn!("{} still reports an expired session for {} after re-authentication", broker, user_id);
                Err(BrokerError::BrokerCallFailed {
                    broker,
                    message,
                    expired: true,
                })
            }
            Attempt::Failed(err) => Err(BrokerError::BrokerCallFailed {
                broker,
                message: err.to_string(),
                expired: false,
            }),
        }
    }

    /// Stored session, or one established without user interaction
    async fn resolve(&self, driver: &dyn AuthDriver, key: &SessionKey) -> BrokerResult<SessionRecord> {
        if let Some(session) = self.sessions.load(key).await? {
            return Ok(session);
        }

        let had_session = self.sessions.load_raw(key).await?.is_some();
        let persist = self.sessions.is_persisted(key).await?;

        match driver.authenticate(&key.user_id).await {
            Ok(session) => {
                debug!("Lazily established {} session", key);
                self.sessions.save(key, session.clone(), persist).await?;
                Ok(session)
            }
            Err(
                BrokerError::InteractionRequired { broker }
                | BrokerError::CredentialsMissing { broker, .. },
            ) => {
                if had_session {
                    Err(BrokerError::SessionExpired { broker })
                } else {
                    Err(BrokerError::NotConnected { broker })
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Retire the stale session and run the driver once more
    ///
    /// The stale record is kept as expired, so a key that cannot be renewed
    /// silently keeps reporting `SessionExpired` instead of `NotConnected`.
    async fn reauthenticate(&self, driver: &dyn AuthDriver, key: &SessionKey) -> BrokerResult<SessionRecord> {
        let broker = key.broker;
        let persist = self.sessions.is_persisted(key).await?;
        self.sessions.mark_expired(key).await?;

        match driver.authenticate(&key.user_id).await {
            Ok(session) => {
                self.sessions.save(key, session.clone(), persist).await?;
                info!("Re-authenticated {}", key);
                Ok(session)
            }
            Err(
                BrokerError::InteractionRequired { .. }
                | BrokerError::CredentialsMissing { .. }
                | BrokerError::CredentialsInvalid { .. },
            ) => {
                warn!("{} cannot be renewed without the user", key);
                Err(BrokerError::SessionExpired { broker })
            }
            Err(err) => {
                warn!("Re-authentication failed for {}: {}", key, err);
                Err(BrokerError::BrokerCallFailed {
                    broker,
                    message: err.to_string(),
                    expired: true,
                })
            }
        }
    }

    async fn client_for(
        &self,
        driver: &dyn AuthDriver,
        key: &SessionKey,
        session: &SessionRecord,
    ) -> BrokerResult<Arc<dyn BrokerApi>> {
        if let Some(client) = self.sessions.client(key).await {
            return Ok(client);
        }
        let client = driver.connect(session)?;
        self.sessions.attach_client(key, Arc::clone(&client)).await;
        Ok(client)
    }
}
