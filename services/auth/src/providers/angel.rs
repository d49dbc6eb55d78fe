//! Angel One SmartAPI: client code, password and a time-based one-time code

use super::totp::{RetryDecision, TotpRetry, generate_code};
use super::{
    AuthDriver, BrokerApi, CompletedLogin, ExpirySignal, LoginStep, credentials_rejected,
    missing_field, pick_str, read_json,
};
use crate::Broker;
use crate::config::{BrokerSettings, TotpPolicy};
use crate::credentials::{CredentialRecord, CredentialStore};
use crate::error::{BrokerError, BrokerResult};
use crate::facade::DataKind;
use crate::session::{SessionRecord, TransportMode};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use reqwest::{Client, RequestBuilder};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, warn};

const BROKER: Broker = Broker::Angel;

/// Session identifier holding the SmartAPI private key
pub const API_KEY_ID: &str = "api_key";

/// Session identifier holding the client code
pub const CLIENT_CODE: &str = "client_code";

const LOGIN_PATH: &str = "/rest/auth/angelbroking/user/v1/loginByPassword";

/// Headers SmartAPI expects on every request
fn smartapi_headers(request: RequestBuilder, api_key: &str) -> RequestBuilder {
    request
        .header("X-PrivateKey", api_key)
        .header("X-UserType", "USER")
        .header("X-SourceID", "WEB")
        .header("X-ClientLocalIP", "127.0.0.1")
        .header("X-ClientPublicIP", "127.0.0.1")
        .header("X-MACAddress", "00:00:00:00:00:00")
        .header("Accept", "application/json")
        .header("Content-Type", "application/json")
}

/// Password+TOTP login driver
pub struct AngelDriver {
    http: Client,
    settings: BrokerSettings,
    totp: TotpPolicy,
    credentials: Arc<CredentialStore>,
}

impl AngelDriver {
    #[must_use]
    pub const fn new(
        http: Client,
        settings: BrokerSettings,
        totp: TotpPolicy,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            http,
            settings,
            totp,
            credentials,
        }
    }

    /// One login round trip with an already generated code
    async fn login_once(
        &self,
        api_key: &str,
        client_code: &str,
        password: &str,
        code: &str,
    ) -> BrokerResult<SessionRecord> {
        let payload = json!({
            "clientcode": client_code,
            "password": password,
            "totp": code,
        });

        let request = self
            .http
            .post(format!("{}{}", self.settings.auth_base, LOGIN_PATH));
        let response = smartapi_headers(request, api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BrokerError::transport(BROKER, &e))?;

        let body = read_json(BROKER, response).await?;
        let data = body.get("data").unwrap_or(&Value::Null);

        let jwt = pick_str(data, &["jwtToken"]).ok_or_else(|| missing_field(BROKER, "jwtToken"))?;
        let jwt = jwt.strip_prefix("Bearer ").unwrap_or(jwt);

        Ok(SessionRecord::new(
            jwt.to_string(),
            TransportMode::PasswordTotp,
            ChronoDuration::hours(self.settings.session_ttl_hours),
        )
        .with_refresh_token(pick_str(data, &["refreshToken"]).map(str::to_string))
        .with_feed_token(pick_str(data, &["feedToken"]).map(str::to_string))
        .with_identifier(API_KEY_ID, api_key)
        .with_identifier(CLIENT_CODE, client_code))
    }

    /// Log in, waiting out the code window when the provider calls it stale
    async fn login(&self, creds: &CredentialRecord) -> BrokerResult<SessionRecord> {
        creds.transport_mode(BROKER)?;
        let (Some(api_key), Some(client_code), Some(password), Some(seed)) = (
            creds.api_key(),
            creds.login_id(),
            creds.login_password(),
            creds.totp_seed(),
        ) else {
            return Err(BrokerError::CredentialsMissing {
                broker: BROKER,
                detail: "api_key, login_id, login_password, totp_seed".to_string(),
            });
        };

        let mut retry = TotpRetry::new(self.totp);
        loop {
            let attempt = retry.start_attempt();
            let code = generate_code(BROKER, seed)?;

            let err = match self.login_once(api_key, client_code, password, &code).await {
                Ok(session) => {
                    info!("SmartAPI login succeeded for {} on attempt {}", client_code, attempt);
                    return Ok(session);
                }
                Err(err) => err,
            };

            if !self.settings.invalid_totp_signal.matches_error(&err) {
                error!("SmartAPI login failed for {}: {}", client_code, err);
                return Err(credentials_rejected(err));
            }

            match retry.on_rejected() {
                RetryDecision::Retry { after } => {
                    warn!(
                        "One-time code rejected for {} (attempt {}), retrying in {:?}",
                        client_code, attempt, after
                    );
                    // suspension point; dropping the login future cancels it
                    tokio::time::sleep(after).await;
                }
                RetryDecision::GiveUp => {
                    return Err(BrokerError::CredentialsInvalid {
                        broker: BROKER,
                        message: format!("one-time code rejected after {attempt} attempts: {err}"),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl AuthDriver for AngelDriver {
    fn broker(&self) -> Broker {
        BROKER
    }

    async fn begin(&self, user_id: &str, _remember: bool) -> BrokerResult<LoginStep> {
        Ok(LoginStep::Established(self.authenticate(user_id).await?))
    }

    async fn complete(&self, _correlation: &str, _provider_token: &str) -> BrokerResult<CompletedLogin> {
        Err(BrokerError::ProtocolViolation {
            broker: BROKER,
            message: "password+TOTP login has no callback".to_string(),
        })
    }

    async fn authenticate(&self, user_id: &str) -> BrokerResult<SessionRecord> {
        let creds = self.credentials.require(BROKER, user_id).await?;
        self.login(&creds).await
    }

    fn connect(&self, session: &SessionRecord) -> BrokerResult<Arc<dyn BrokerApi>> {
        let api_key = session
            .identifier(API_KEY_ID)
            .ok_or_else(|| missing_field(BROKER, API_KEY_ID))?;
        Ok(Arc::new(AngelClient {
            http: self.http.clone(),
            api_base: self.settings.api_base.clone(),
            api_key: api_key.to_string(),
            bearer: format!("Bearer {}", session.access_token),
        }))
    }

    fn expiry_signal(&self) -> &ExpirySignal {
        &self.settings.expiry_signal
    }
}

/// Authenticated SmartAPI client
pub struct AngelClient {
    http: Client,
    api_base: String,
    api_key: String,
    bearer: String,
}

#[async_trait]
impl BrokerApi for AngelClient {
    fn broker(&self) -> Broker {
        BROKER
    }

    async fn fetch(&self, kind: DataKind) -> BrokerResult<Value> {
        let path = match kind {
            DataKind::Orders => "getOrderBook",
            DataKind::Positions => "getPosition",
            DataKind::Trades => "getTradeBook",
        };

        let request = self.http.get(format!(
            "{}/rest/secure/angelbroking/order/v1/{}",
            self.api_base, path
        ));
        let response = smartapi_headers(request, &self.api_key)
            .header("Authorization", &self.bearer)
            .send()
            .await
            .map_err(|e| BrokerError::transport(BROKER, &e))?;
        read_json(BROKER, response).await
    }
}
