//! DhanHQ: partner consent login, or a static client id + access token

use super::{
    AuthDriver, BrokerApi, CompletedLogin, ExpirySignal, LoginStep, credentials_rejected,
    missing_field, pick_str, read_json,
};
use crate::Broker;
use crate::config::BrokerSettings;
use crate::credentials::{CredentialRecord, CredentialStore};
use crate::error::{BrokerError, BrokerResult};
use crate::facade::DataKind;
use crate::pending::PendingAuthRegistry;
use crate::session::{SessionRecord, TransportMode};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const BROKER: Broker = Broker::Dhan;

/// Session identifier holding the Dhan client id
pub const CLIENT_ID: &str = "client_id";

/// Partner-consent and direct-token driver
pub struct DhanDriver {
    http: Client,
    settings: BrokerSettings,
    credentials: Arc<CredentialStore>,
    pending: Arc<PendingAuthRegistry>,
}

fn partner_headers(request: RequestBuilder, creds: &CredentialRecord) -> RequestBuilder {
    request
        .header("partner_id", creds.api_key().unwrap_or_default())
        .header("partner_secret", creds.api_secret().unwrap_or_default())
}

impl DhanDriver {
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

    fn ttl(&self) -> ChronoDuration {
        ChronoDuration::hours(self.settings.session_ttl_hours)
    }

    /// Session straight from a user-supplied token; no network involved
    fn direct_session(&self, creds: &CredentialRecord) -> BrokerResult<SessionRecord> {
        let (Some(client_id), Some(token)) = (creds.client_id(), creds.static_access_token()) else {
            return Err(BrokerError::CredentialsMissing {
                broker: BROKER,
                detail: "client_id, access_token".to_string(),
            });
        };
        Ok(
            SessionRecord::new(token.to_string(), TransportMode::DirectToken, self.ttl())
                .with_identifier(CLIENT_ID, client_id),
        )
    }

    async fn generate_consent(&self, creds: &CredentialRecord) -> BrokerResult<String> {
        let request = self
            .http
            .post(format!("{}/partner/generate-consent", self.settings.auth_base));
        let response = partner_headers(request, creds)
            .send()
            .await
            .map_err(|e| BrokerError::transport(BROKER, &e))?;

        let body = read_json(BROKER, response).await.map_err(credentials_rejected)?;
        pick_str(&body, &["consentId", "consent_id"])
            .map(str::to_string)
            .ok_or_else(|| missing_field(BROKER, "consentId"))
    }

    async fn consume_consent(&self, creds: &CredentialRecord, token_id: &str) -> BrokerResult<Value> {
        let url = Url::parse_with_params(
            &format!("{}/partner/consume-consent", self.settings.auth_base),
            &[("tokenId", token_id)],
        )
        .map_err(|e| BrokerError::ProtocolViolation {
            broker: BROKER,
            message: format!("bad auth base: {e}"),
        })?;

        let response = partner_headers(self.http.get(url), creds)
            .send()
            .await
            .map_err(|e| BrokerError::transport(BROKER, &e))?;
        read_json(BROKER, response).await
    }
}

#[async_trait]
impl AuthDriver for DhanDriver {
    fn broker(&self) -> Broker {
        BROKER
    }

    async fn begin(&self, user_id: &str, remember: bool) -> BrokerResult<LoginStep> {
        let creds = self.credentials.require(BROKER, user_id).await?;

        match creds.transport_mode(BROKER)? {
            TransportMode::DirectToken => {
                info!("Dhan direct-token session for {}", user_id);
                Ok(LoginStep::Established(self.direct_session(&creds)?))
            }
            TransportMode::PartnerConsent => {
                let consent_id = self.generate_consent(&creds).await?;
                let url = Url::parse_with_params(
                    &format!("{}/consent-login", self.settings.login_base),
                    &[("consentId", consent_id.as_str())],
                )
                .map_err(|e| BrokerError::ProtocolViolation {
                    broker: BROKER,
                    message: format!("bad login base: {e}"),
                })?;

                self.pending.issue(&consent_id, BROKER, user_id, remember).await;
                info!("Dhan consent issued for {}", user_id);
                Ok(LoginStep::Redirect {
                    url: url.into(),
                    correlation: consent_id,
                })
            }
            other => Err(BrokerError::ProtocolViolation {
                broker: BROKER,
                message: format!("unsupported transport mode {other:?}"),
            }),
        }
    }

    async fn complete(&self, correlation: &str, provider_token: &str) -> BrokerResult<CompletedLogin> {
        let pending = self
            .pending
            .take(BROKER, correlation)
            .await
            .ok_or_else(|| BrokerError::ProtocolViolation {
                broker: BROKER,
                message: "unknown or expired consent".to_string(),
            })?;

        let token_id = provider_token.trim();
        if token_id.is_empty() {
            return Err(BrokerError::ProtocolViolation {
                broker: BROKER,
                message: "callback carried no tokenId".to_string(),
            });
        }

        let creds = self.credentials.require(BROKER, &pending.user_id).await?;
        let body = match self.consume_consent(&creds, token_id).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Dhan consent consumption failed for {}: {}", pending.user_id, e);
                return Err(e);
            }
        };

        let client_id = pick_str(&body, &["dhanClientId", "clientId", "client_id"])
            .ok_or_else(|| missing_field(BROKER, "dhanClientId"))?;
        let access_token = pick_str(&body, &["accessToken", "access_token", "jwt", "JWT"])
            .ok_or_else(|| missing_field(BROKER, "accessToken"))?;

        let session = SessionRecord::new(access_token.to_string(), TransportMode::PartnerConsent, self.ttl())
            .with_identifier(CLIENT_ID, client_id)
            .with_identifier("consent_id", correlation);

        info!("Dhan consent consumed for {}", pending.user_id);
        Ok(CompletedLogin { pending, session })
    }

    /// Only the direct-token variant can log in without the user
    async fn authenticate(&self, user_id: &str) -> BrokerResult<SessionRecord> {
        let creds = self.credentials.require(BROKER, user_id).await?;
        match creds.transport_mode(BROKER)? {
            TransportMode::DirectToken => self.direct_session(&creds),
            _ => Err(BrokerError::InteractionRequired { broker: BROKER }),
        }
    }

    async fn abandon(&self, correlation: &str) {
        self.pending.discard(correlation).await;
    }

    fn connect(&self, session: &SessionRecord) -> BrokerResult<Arc<dyn BrokerApi>> {
        let client_id = session
            .identifier(CLIENT_ID)
            .ok_or_else(|| missing_field(BROKER, CLIENT_ID))?;
        debug!("Connecting Dhan client {}", client_id);
        Ok(Arc::new(DhanClient {
            http: self.http.clone(),
            api_base: self.settings.api_base.clone(),
            client_id: client_id.to_string(),
            access_token: session.access_token.clone(),
        }))
    }

    fn expiry_signal(&self) -> &ExpirySignal {
        &self.settings.expiry_signal
    }
}

/// Authenticated DhanHQ REST client
pub struct DhanClient {
    http: Client,
    api_base: String,
    client_id: String,
    access_token: String,
}

#[async_trait]
impl BrokerApi for DhanClient {
    fn broker(&self) -> Broker {
        BROKER
    }

    async fn fetch(&self, kind: DataKind) -> BrokerResult<Value> {
        let response = self
            .http
            .get(format!("{}/{}", self.api_base, kind.as_str()))
            .header("access-token", &self.access_token)
            .header("client-id", &self.client_id)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| BrokerError::transport(BROKER, &e))?;
        read_json(BROKER, response).await
    }
}
