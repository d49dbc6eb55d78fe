//! Per-user broker application credentials
//!
//! Pure storage: registration validates that the fields a broker's login
//! protocol needs are present, nothing here talks to the network.

use crate::Broker;
use crate::error::{BrokerError, BrokerResult};
use crate::redact;
use crate::session::{SessionKey, TransportMode};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Application credentials for one (broker, user)
///
/// Dhan partner mode reuses `api_key`/`api_secret` as partner id/secret.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub static_access_token: Option<String>,
    #[serde(default)]
    pub totp_seed: Option<String>,
    #[serde(default)]
    pub login_id: Option<String>,
    #[serde(default)]
    pub login_password: Option<String>,
}

fn present(field: Option<&String>) -> Option<&str> {
    field.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl CredentialRecord {
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        present(self.api_key.as_ref())
    }

    #[must_use]
    pub fn api_secret(&self) -> Option<&str> {
        present(self.api_secret.as_ref())
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        present(self.client_id.as_ref())
    }

    #[must_use]
    pub fn static_access_token(&self) -> Option<&str> {
        present(self.static_access_token.as_ref())
    }

    #[must_use]
    pub fn totp_seed(&self) -> Option<&str> {
        present(self.totp_seed.as_ref())
    }

    #[must_use]
    pub fn login_id(&self) -> Option<&str> {
        present(self.login_id.as_ref())
    }

    #[must_use]
    pub fn login_password(&self) -> Option<&str> {
        present(self.login_password.as_ref())
    }

    /// Read `<BROKER>_API_KEY`, `<BROKER>_API_SECRET`, `<BROKER>_CLIENT_ID`,
    /// `<BROKER>_ACCESS_TOKEN`, `<BROKER>_TOTP_SECRET`, `<BROKER>_LOGIN_ID` and
    /// `<BROKER>_PASSWORD` from the environment
    #[must_use]
    pub fn from_env(broker: Broker) -> Self {
        let prefix = broker.as_str().to_uppercase();
        let var = |name: &str| std::env::var(format!("{prefix}_{name}")).ok();
        Self {
            api_key: var("API_KEY"),
            api_secret: var("API_SECRET"),
            client_id: var("CLIENT_ID"),
            static_access_token: var("ACCESS_TOKEN"),
            totp_seed: var("TOTP_SECRET"),
            login_id: var("LOGIN_ID"),
            login_password: var("PASSWORD"),
        }
    }

    /// Login protocol these credentials select for `broker`
    ///
    /// # Errors
    /// Returns `CredentialsMissing` naming the absent fields
    pub fn transport_mode(&self, broker: Broker) -> BrokerResult<TransportMode> {
        let missing = |fields: &[(&str, Option<&str>)]| -> Option<String> {
            let absent: Vec<&str> = fields
                .iter()
                .filter(|(_, v)| v.is_none())
                .map(|(name, _)| *name)
                .collect();
            (!absent.is_empty()).then(|| absent.join(", "))
        };

        let result = match broker {
            Broker::Kite => missing(&[("api_key", self.api_key()), ("api_secret", self.api_secret())])
                .map_or(Ok(TransportMode::RedirectDelegated), Err),
            Broker::Dhan => {
                if self.client_id().is_some() && self.static_access_token().is_some() {
                    Ok(TransportMode::DirectToken)
                } else if self.api_key().is_some() && self.api_secret().is_some() {
                    Ok(TransportMode::PartnerConsent)
                } else {
                    Err("client_id + access_token, or partner id + partner secret".to_string())
                }
            }
            Broker::Angel => missing(&[
                ("api_key", self.api_key()),
                ("login_id", self.login_id()),
                ("login_password", self.login_password()),
                ("totp_seed", self.totp_seed()),
            ])
            .map_or(Ok(TransportMode::PasswordTotp), Err),
        };

        result.map_err(|detail| BrokerError::CredentialsMissing { broker, detail })
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hidden = |v: &Option<String>| v.as_deref().map(redact);
        f.debug_struct("CredentialRecord")
            .field("api_key", &hidden(&self.api_key))
            .field("api_secret", &hidden(&self.api_secret))
            .field("client_id", &self.client_id)
            .field("static_access_token", &hidden(&self.static_access_token))
            .field("totp_seed", &hidden(&self.totp_seed))
            .field("login_id", &self.login_id)
            .field("login_password", &self.login_password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Credential registry shared across requests
#[derive(Default)]
pub struct CredentialStore {
    records: RwLock<FxHashMap<SessionKey, Arc<CredentialRecord>>>,
}

impl CredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store credentials, replacing any earlier registration
    ///
    /// # Errors
    /// Returns `CredentialsMissing` if the broker's required fields are absent
    pub async fn register(
        &self,
        broker: Broker,
        user_id: &str,
        credentials: CredentialRecord,
    ) -> BrokerResult<TransportMode> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(BrokerError::CredentialsMissing {
                broker,
                detail: "user_id".to_string(),
            });
        }

        let mode = credentials.transport_mode(broker)?;
        self.records
            .write()
            .await
            .insert(SessionKey::new(broker, user_id), Arc::new(credentials));

        info!("Registered {} credentials for {} ({:?})", broker, user_id, mode);
        Ok(mode)
    }

    /// Stored credentials, if any
    pub async fn get(&self, broker: Broker, user_id: &str) -> Option<Arc<CredentialRecord>> {
        self.records
            .read()
            .await
            .get(&SessionKey::new(broker, user_id))
            .cloned()
    }

    /// Stored credentials or `CredentialsMissing`
    ///
    /// # Errors
    /// Returns `CredentialsMissing` when nothing is registered for the pair
    pub async fn require(&self, broker: Broker, user_id: &str) -> BrokerResult<Arc<CredentialRecord>> {
        self.get(broker, user_id)
            .await
            .ok_or_else(|| BrokerError::CredentialsMissing {
                broker,
                detail: format!("no {broker} credentials registered for {user_id}"),
            })
    }
}
