//! Broker-specific authentication drivers and API clients

pub mod angel;
pub mod dhan;
pub mod totp;
pub mod zerodha;

use crate::error::{BrokerError, BrokerResult};
use crate::facade::DataKind;
use crate::pending::PendingAuth;
use crate::session::SessionRecord;
use crate::Broker;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub use angel::AngelDriver;
pub use dhan::DhanDriver;
pub use zerodha::ZerodhaDriver;

/// Outcome of starting a login
#[derive(Debug, Clone)]
pub enum LoginStep {
    /// Send the user to `url`; the callback must quote `correlation`
    Redirect { url: String, correlation: String },
    /// Session established without any user interaction
    Established(SessionRecord),
}

/// Result of a completed multi-step login
#[derive(Debug, Clone)]
pub struct CompletedLogin {
    /// Login attempt the callback belonged to
    pub pending: PendingAuth,
    /// Freshly minted session
    pub session: SessionRecord,
}

/// Authentication protocol for one broker
#[async_trait]
pub trait AuthDriver: Send + Sync {
    /// Broker served by this driver
    fn broker(&self) -> Broker;

    /// Start a login for `user_id`
    async fn begin(&self, user_id: &str, remember: bool) -> BrokerResult<LoginStep>;

    /// Finish a login from the provider callback
    async fn complete(&self, correlation: &str, provider_token: &str)
    -> BrokerResult<CompletedLogin>;

    /// Establish a session without user interaction
    ///
    /// Flows that need a browser round trip report `InteractionRequired`.
    async fn authenticate(&self, user_id: &str) -> BrokerResult<SessionRecord> {
        match self.begin(user_id, false).await? {
            LoginStep::Established(session) => Ok(session),
            LoginStep::Redirect { correlation, .. } => {
                self.abandon(&correlation).await;
                Err(BrokerError::InteractionRequired {
                    broker: self.broker(),
                })
            }
        }
    }

    /// Drop the pending context of a login that will not be completed
    async fn abandon(&self, _correlation: &str) {}

    /// Build a live API client from a session
    fn connect(&self, session: &SessionRecord) -> BrokerResult<Arc<dyn BrokerApi>>;

    /// How this broker reports an expired token
    fn expiry_signal(&self) -> &ExpirySignal;
}

/// Authenticated account-data calls against one broker
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Broker this client talks to
    fn broker(&self) -> Broker;

    /// Raw response for one data kind
    async fn fetch(&self, kind: DataKind) -> BrokerResult<Value>;
}

/// Broker-specific marker for an expired or invalid token
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExpirySignal {
    /// Exact upstream error codes
    #[serde(default)]
    pub codes: Vec<String>,
    /// Case-insensitive message fragments
    #[serde(default)]
    pub message_markers: Vec<String>,
}

impl ExpirySignal {
    /// Build from static code and marker lists
    #[must_use]
    pub fn new(codes: &[&str], markers: &[&str]) -> Self {
        Self {
            codes: codes.iter().map(|c| (*c).to_string()).collect(),
            message_markers: markers.iter().map(|m| m.to_lowercase()).collect(),
        }
    }

    /// Match a code and/or message pair
    #[must_use]
    pub fn matches(&self, code: Option<&str>, message: &str) -> bool {
        if let Some(code) = code
            && self.codes.iter().any(|c| c.eq_ignore_ascii_case(code))
        {
            return true;
        }
        let message = message.to_lowercase();
        self.message_markers
            .iter()
            .any(|m| !m.is_empty() && message.contains(&m.to_lowercase()))
    }

    /// Match a typed error
    #[must_use]
    pub fn matches_error(&self, err: &BrokerError) -> bool {
        match err {
            BrokerError::ProviderRejected { code, message, .. } => {
                self.matches(code.as_deref(), message)
            }
            BrokerError::CredentialsInvalid { message, .. }
            | BrokerError::Transport { message, .. }
            | BrokerError::BrokerCallFailed { message, .. } => self.matches(None, message),
            BrokerError::SessionExpired { .. } => true,
            _ => false,
        }
    }

    /// Match an error envelope that arrived with a success status
    #[must_use]
    pub fn matches_payload(&self, payload: &Value) -> bool {
        match error_envelope(payload) {
            Some((code, message)) => self.matches(code.as_deref(), &message),
            None => false,
        }
    }
}

/// Pull `(code, message)` out of an error-shaped JSON body
///
/// Recognises the Kite (`status: "error"`, `error_type`), Dhan (`errorCode`,
/// `errorMessage`) and SmartAPI (`status: false`, `errorcode`) envelopes.
#[must_use]
pub fn error_envelope(payload: &Value) -> Option<(Option<String>, String)> {
    let obj = payload.as_object()?;

    let failed_status = match obj.get("status") {
        Some(Value::Bool(ok)) => !ok,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("error") || s.eq_ignore_ascii_case("failure"),
        _ => false,
    };

    let code = ["errorcode", "errorCode", "error_type", "errorType"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    if !failed_status && code.is_none() {
        return None;
    }

    let message = ["message", "errorMessage", "error", "remarks"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .unwrap_or("no message")
        .to_string();

    Some((code, message))
}

/// First non-empty string among alias keys
#[must_use]
pub fn pick_str<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| {
        payload
            .get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    })
}

/// HTTP client shared by the drivers of one hub
#[must_use]
pub fn build_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("broker-auth/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Read a JSON body, folding non-2xx and error envelopes into typed errors
pub(crate) async fn read_json(broker: Broker, response: Response) -> BrokerResult<Value> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| BrokerError::transport(broker, &e))?;

    let body: Option<Value> = serde_json::from_str(&text).ok();

    if !status.is_success() {
        if let Some((code, message)) = body.as_ref().and_then(error_envelope) {
            return Err(BrokerError::ProviderRejected {
                broker,
                code,
                message,
            });
        }
        return Err(BrokerError::Transport {
            broker,
            message: format!("HTTP {status}: {}", truncate(&text, 200)),
        });
    }

    let body = body.ok_or_else(|| BrokerError::ProtocolViolation {
        broker,
        message: format!("response is not JSON: {}", truncate(&text, 200)),
    })?;

    if let Some((code, message)) = error_envelope(&body) {
        return Err(BrokerError::ProviderRejected {
            broker,
            code,
            message,
        });
    }

    Ok(body)
}

/// Explicit rejection from a login endpoint means the credentials are bad
pub(crate) fn credentials_rejected(err: BrokerError) -> BrokerError {
    match err {
        BrokerError::ProviderRejected {
            broker,
            code,
            message,
        } => BrokerError::CredentialsInvalid {
            broker,
            message: match code {
                Some(code) => format!("{message} [{code}]"),
                None => message,
            },
        },
        other => other,
    }
}

/// Missing field in a login payload
pub(crate) fn missing_field(broker: Broker, field: &str) -> BrokerError {
    BrokerError::ProtocolViolation {
        broker,
        message: format!("success response without {field}"),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}
