//! Error taxonomy shared by the credential store, auth drivers, session store
//! and the reauth guard.
//!
//! Every failure that crosses the crate boundary is a [`BrokerError`]; raw
//! provider payloads and transport errors are folded into one of these
//! variants before they reach a caller.

use crate::Broker;
use thiserror::Error;

/// Convenience alias used throughout the crate
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Typed broker failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Required credential fields are absent for the broker's transport mode
    #[error("{broker} credentials missing: {detail}")]
    CredentialsMissing { broker: Broker, detail: String },

    /// Credentials were presented and rejected by the provider
    #[error("{broker} rejected credentials: {message}")]
    CredentialsInvalid { broker: Broker, message: String },

    /// Provider answered with a success status but the payload is unusable
    #[error("{broker} protocol violation: {message}")]
    ProtocolViolation { broker: Broker, message: String },

    /// Network failure, timeout or a non-JSON error body
    #[error("{broker} transport error: {message}")]
    Transport { broker: Broker, message: String },

    /// Explicit error payload from the provider
    #[error("{broker} rejected request{}: {message}", code_suffix(.code))]
    ProviderRejected {
        broker: Broker,
        code: Option<String>,
        message: String,
    },

    /// No session was ever established for this pair
    #[error("not connected to {broker}")]
    NotConnected { broker: Broker },

    /// A session existed but is no longer valid and cannot be renewed silently
    #[error("{broker} session expired, reconnect required")]
    SessionExpired { broker: Broker },

    /// The login flow needs a browser round trip
    #[error("{broker} login requires user interaction")]
    InteractionRequired { broker: Broker },

    /// A connected broker call failed after the guard gave up
    #[error("{broker} call failed: {message}")]
    BrokerCallFailed {
        broker: Broker,
        message: String,
        expired: bool,
    },

    /// Broker name did not parse
    #[error("unknown broker: {0}")]
    UnknownBroker(String),

    /// Durable session storage failed
    #[error("session storage error: {0}")]
    Storage(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

impl BrokerError {
    /// Build a transport error from a reqwest failure
    pub(crate) fn transport(broker: Broker, err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("request timed out: {err}")
        } else {
            err.to_string()
        };
        Self::Transport { broker, message }
    }

    /// Broker the error relates to, if any
    #[must_use]
    pub const fn broker(&self) -> Option<Broker> {
        match self {
            Self::CredentialsMissing { broker, .. }
            | Self::CredentialsInvalid { broker, .. }
            | Self::ProtocolViolation { broker, .. }
            | Self::Transport { broker, .. }
            | Self::ProviderRejected { broker, .. }
            | Self::NotConnected { broker }
            | Self::SessionExpired { broker }
            | Self::InteractionRequired { broker }
            | Self::BrokerCallFailed { broker, .. } => Some(*broker),
            Self::UnknownBroker(_) | Self::Storage(_) => None,
        }
    }

    /// Upstream error code, when the provider supplied one
    #[must_use]
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            Self::ProviderRejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Whether repeating the same request may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Whether the web layer should prompt the user to log in again
    #[must_use]
    pub const fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            Self::NotConnected { .. }
                | Self::SessionExpired { .. }
                | Self::InteractionRequired { .. }
                | Self::BrokerCallFailed { expired: true, .. }
        )
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("serialization failed: {err}"))
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
