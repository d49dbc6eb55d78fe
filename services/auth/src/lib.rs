//! Broker Session Service
//!
//! Credential and session lifecycle management for personal brokerage
//! accounts. Drives each broker's login protocol, keeps the resulting
//! sessions in a memory mirror backed by durable storage, renews expired
//! tokens transparently and normalizes order/position/trade responses.

pub mod config;
pub mod credentials;
pub mod error;
pub mod facade;
pub mod guard;
pub mod hub;
pub mod pending;
pub mod providers;
pub mod session;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use config::{BrokerSettings, HubConfig, TotpPolicy};
pub use credentials::{CredentialRecord, CredentialStore};
pub use error::{BrokerError, BrokerResult};
pub use facade::{BrokerSnapshot, DataKind, normalize};
pub use guard::ReauthGuard;
pub use hub::{BrokerHub, ConnectionStatus, SavedSession, SessionSummary};
pub use pending::{PendingAuth, PendingAuthRegistry};
pub use providers::{AuthDriver, BrokerApi, CompletedLogin, ExpirySignal, LoginStep};
pub use session::{SessionKey, SessionRecord, SessionStore, TransportMode};

/// Supported brokers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Broker {
    /// Zerodha Kite Connect
    Kite,
    /// DhanHQ
    Dhan,
    /// Angel One SmartAPI
    Angel,
}

impl Broker {
    /// All brokers in display order
    pub const ALL: [Self; 3] = [Self::Kite, Self::Dhan, Self::Angel];

    /// Lowercase identifier used in storage keys and env prefixes
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Kite => "kite",
            Self::Dhan => "dhan",
            Self::Angel => "angel",
        }
    }
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Broker {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "kite" | "zerodha" => Ok(Self::Kite),
            "dhan" | "dhanhq" => Ok(Self::Dhan),
            "angel" | "angelone" | "angel_one" => Ok(Self::Angel),
            other => Err(BrokerError::UnknownBroker(other.to_string())),
        }
    }
}

/// Shorten a secret for log output
#[must_use]
pub fn redact(secret: &str) -> String {
    if secret.chars().count() > 8 {
        let head: String = secret.chars().take(6).collect();
        format!("{head}...")
    } else {
        "***".to_string()
    }
}
