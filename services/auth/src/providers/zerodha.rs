//! Zerodha Kite Connect: redirect login with a signed request-token exchange

use super::{
    AuthDriver, BrokerApi, CompletedLogin, ExpirySignal, LoginStep, credentials_rejected,
    missing_field, pick_str, read_json,
};
use crate::Broker;
use crate::config::BrokerSettings;
use crate::credentials::CredentialStore;
use crate::error::{BrokerError, BrokerResult};
use crate::facade::DataKind;
use crate::pending::PendingAuthRegistry;
use crate::session::{SessionRecord, TransportMode};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use reqwest::{Client, Url};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

const BROKER: Broker = Broker::Kite;

/// Session identifier holding the app key, needed on every data call
pub const API_KEY_ID: &str = "api_key";

/// `hex(sha256(api_key + request_token + api_secret))`
#[must_use]
pub fn checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Redirect-delegated login driver
pub struct ZerodhaDriver {
    http: Client,
    settings: BrokerSettings,
    credentials: Arc<CredentialStore>,
    pending: Arc<PendingAuthRegistry>,
}

impl ZerodhaDriver {
    #[must_use]
    pub const fn new(
        http: Client,
        settings: BrokerSettings,
        credentials: Arc<CredentialStore>,
        pending: Arc<PendingAuthRegistry>,
    ) -> Self {
        Self {
            http,
            settings,
            credentials,
            pending,
        }
    }

    /// Kite hands `redirect_params` back verbatim on the callback
    fn login_url(&self, api_key: &str, state: &str) -> BrokerResult<String> {
        let base = format!("{}/connect/login", self.settings.login_base);
        let redirect_params = format!("state={state}");
        let url = Url::parse_with_params(
            &base,
            &[
                ("v", "3"),
                ("api_key", api_key),
                ("redirect_params", redirect_params.as_str()),
            ],
        )
        .map_err(|e| BrokerError::ProtocolViolation {
            broker: BROKER,
            message: format!("bad login base {base}: {e}"),
        })?;
        Ok(url.into())
    }

    async fn exchange(&self, api_key: &str, api_secret: &str, request_token: &str) -> BrokerResult<Value> {
        debug!("Generating access token from request token");

        let checksum = checksum(api_key, request_token, api_secret);
        let session_params = [
            ("api_key", api_key),
            ("request_token", request_token),
            ("checksum", checksum.as_str()),
        ];

        let response = self
            .http
            .post(format!("{}/session/token", self.settings.auth_base))
            .header("X-Kite-Version", "3")
            .form(&session_params)
            .send()
            .await
            .map_err(|e| BrokerError::transport(BROKER, &e))?;

        read_json(BROKER, response).await.map_err(credentials_rejected)
    }
}

#[async_trait]
impl AuthDriver for ZerodhaDriver {
    fn broker(&self) -> Broker {
        BROKER
    }

    async fn begin(&self, user_id: &str, remember: bool) -> BrokerResult<LoginStep> {
        let creds = self.credentials.require(BROKER, user_id).await?;
        creds.transport_mode(BROKER)?;
        let api_key = creds.api_key().ok_or_else(|| BrokerError::CredentialsMissing {
            broker: BROKER,
            detail: "api_key".to_string(),
        })?;

        let state = Uuid::new_v4().simple().to_string();
        let url = self.login_url(api_key, &state)?;
        self.pending.issue(&state, BROKER, user_id, remember).await;

        info!("Kite login started for {}", user_id);
        Ok(LoginStep::Redirect {
            url,
            correlation: state,
        })
    }

    async fn complete(&self, correlation: &str, provider_token: &str) -> BrokerResult<CompletedLogin> {
        let pending = self
            .pending
            .take(BROKER, correlation)
            .await
            .ok_or_else(|| BrokerError::ProtocolViolation {
                broker: BROKER,
                message: "unknown or expired login state".to_string(),
            })?;

        let request_token = provider_token.trim();
        if request_token.is_empty() {
            return Err(BrokerError::ProtocolViolation {
                broker: BROKER,
                message: "callback carried no request_token".to_string(),
            });
        }

        let creds = self.credentials.require(BROKER, &pending.user_id).await?;
        let (Some(api_key), Some(api_secret)) = (creds.api_key(), creds.api_secret()) else {
            return Err(BrokerError::CredentialsMissing {
                broker: BROKER,
                detail: "api_key, api_secret".to_string(),
            });
        };

        let body = match self.exchange(api_key, api_secret, request_token).await {
            Ok(body) => body,
            Err(e) => {
                error!("Kite token exchange failed for {}: {}", pending.user_id, e);
                return Err(e);
            }
        };

        let data = body.get("data").unwrap_or(&Value::Null);
        let access_token =
            pick_str(data, &["access_token"]).ok_or_else(|| missing_field(BROKER, "access_token"))?;

        let mut session = SessionRecord::new(
            access_token.to_string(),
            TransportMode::RedirectDelegated,
            ChronoDuration::hours(self.settings.session_ttl_hours),
        )
        .with_refresh_token(pick_str(data, &["refresh_token"]).map(str::to_string))
        .with_identifier(API_KEY_ID, api_key);
        if let Some(kite_user) = pick_str(data, &["user_id"]) {
            session = session.with_identifier("user_id", kite_user);
        }

        info!("Access token generated successfully for {}", pending.user_id);
        Ok(CompletedLogin { pending, session })
    }

    /// The exchange needs a fresh request token from the browser
    async fn authenticate(&self, user_id: &str) -> BrokerResult<SessionRecord> {
        self.credentials.require(BROKER, user_id).await?;
        Err(BrokerError::InteractionRequired { broker: BROKER })
    }

    async fn abandon(&self, correlation: &str) {
        self.pending.discard(correlation).await;
    }

    fn connect(&self, session: &SessionRecord) -> BrokerResult<Arc<dyn BrokerApi>> {
        let api_key = session
            .identifier(API_KEY_ID)
            .ok_or_else(|| missing_field(BROKER, API_KEY_ID))?;
        Ok(Arc::new(KiteClient {
            http: self.http.clone(),
            api_base: self.settings.api_base.clone(),
            authorization: format!("token {}:{}", api_key, session.access_token),
        }))
    }

    fn expiry_signal(&self) -> &ExpirySignal {
        &self.settings.expiry_signal
    }
}

/// Authenticated Kite REST client
pub struct KiteClient {
    http: Client,
    api_base: String,
    authorization: String,
}

#[async_trait]
impl BrokerApi for KiteClient {
    fn broker(&self) -> Broker {
        BROKER
    }

    async fn fetch(&self, kind: DataKind) -> BrokerResult<Value> {
        let path = match kind {
            DataKind::Orders => "/orders",
            DataKind::Positions => "/portfolio/positions",
            DataKind::Trades => "/trades",
        };

        let response = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .header("X-Kite-Version", "3")
            .header("Authorization", &self.authorization)
            .send()
            .await
            .map_err(|e| BrokerError::transport(BROKER, &e))?;

        let body = read_json(BROKER, response).await?;

        // positions come as {"data": {"net": [...], "day": [...]}}
        if kind == DataKind::Positions
            && let Some(net) = body.pointer("/data/net")
        {
            return Ok(json!({ "data": net }));
        }
        Ok(body)
    }
}
