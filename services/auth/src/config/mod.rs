//! Configuration management for the broker session service

use crate::Broker;
use crate::providers::ExpirySignal;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HubConfig {
    /// Directory for the file-backed session store
    pub cache_dir: String,
    /// Seconds before an uncompleted login is treated as abandoned
    pub pending_ttl_secs: u64,
    /// Hours a refreshed session is extended by
    pub refresh_extension_hours: i64,
    /// Timeout for every outbound broker request
    pub http_timeout_secs: u64,
    /// Retry policy for password+TOTP logins
    pub totp: TotpPolicy,
    /// Per-broker endpoints and expiry detection
    pub brokers: BrokerTable,
}

/// One settings block per broker
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerTable {
    #[serde(default = "kite_defaults")]
    pub kite: BrokerSettings,
    #[serde(default = "dhan_defaults")]
    pub dhan: BrokerSettings,
    #[serde(default = "angel_defaults")]
    pub angel: BrokerSettings,
}

fn kite_defaults() -> BrokerSettings {
    BrokerSettings::defaults_for(Broker::Kite)
}

fn dhan_defaults() -> BrokerSettings {
    BrokerSettings::defaults_for(Broker::Dhan)
}

fn angel_defaults() -> BrokerSettings {
    BrokerSettings::defaults_for(Broker::Angel)
}

impl Default for BrokerTable {
    fn default() -> Self {
        Self {
            kite: kite_defaults(),
            dhan: dhan_defaults(),
            angel: angel_defaults(),
        }
    }
}

impl BrokerTable {
    /// Settings for one broker
    #[must_use]
    pub const fn get(&self, broker: Broker) -> &BrokerSettings {
        match broker {
            Broker::Kite => &self.kite,
            Broker::Dhan => &self.dhan,
            Broker::Angel => &self.angel,
        }
    }

    /// Mutable settings for one broker
    pub fn get_mut(&mut self, broker: Broker) -> &mut BrokerSettings {
        match broker {
            Broker::Kite => &mut self.kite,
            Broker::Dhan => &mut self.dhan,
            Broker::Angel => &mut self.angel,
        }
    }
}

/// Broker-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerSettings {
    /// REST API endpoint for account data
    pub api_base: String,
    /// Endpoint serving token exchange / consent calls
    pub auth_base: String,
    /// Endpoint the end user is redirected to
    pub login_base: String,
    /// Lifetime stamped on new sessions
    pub session_ttl_hours: i64,
    /// How an expired token shows up in responses
    pub expiry_signal: ExpirySignal,
    /// How a stale one-time code shows up in login responses
    #[serde(default)]
    pub invalid_totp_signal: ExpirySignal,
}

/// Bounded retry for time-windowed one-time codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TotpPolicy {
    /// Total login attempts including the first
    pub max_attempts: u32,
    /// Validity window of one code in seconds
    pub window_secs: u64,
}

impl Default for TotpPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            window_secs: 30,
        }
    }
}

impl TotpPolicy {
    /// Delay between attempts
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl BrokerSettings {
    /// Shipping defaults for a broker
    #[must_use]
    pub fn defaults_for(broker: Broker) -> Self {
        match broker {
            Broker::Kite => Self {
                api_base: "https://api.kite.trade".to_string(),
                auth_base: "https://api.kite.trade".to_string(),
                login_base: "https://kite.zerodha.com".to_string(),
                // Zerodha tokens valid for ~12 hours
                session_ttl_hours: 12,
                expiry_signal: ExpirySignal::new(
                    &["TokenException"],
                    &["token is invalid", "token has expired"],
                ),
                invalid_totp_signal: ExpirySignal::default(),
            },
            Broker::Dhan => Self {
                api_base: "https://api.dhan.co/v2".to_string(),
                auth_base: "https://auth.dhan.co".to_string(),
                login_base: "https://auth.dhan.co".to_string(),
                session_ttl_hours: 24,
                expiry_signal: ExpirySignal::new(&["DH-901"], &["invalid or expired"]),
                invalid_totp_signal: ExpirySignal::default(),
            },
            Broker::Angel => Self {
                api_base: "https://apiconnect.angelone.in".to_string(),
                auth_base: "https://apiconnect.angelone.in".to_string(),
                login_base: "https://smartapi.angelone.in".to_string(),
                session_ttl_hours: 24,
                expiry_signal: ExpirySignal::new(
                    &["AG8001", "AG8002"],
                    &["invalid token", "token expired"],
                ),
                invalid_totp_signal: ExpirySignal::new(&["AB1050"], &["invalid totp"]),
            },
        }
    }

    /// Point every endpoint at one base URL
    #[must_use]
    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        self.api_base.clone_from(&base);
        self.auth_base.clone_from(&base);
        self.login_base = base;
        self
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            cache_dir: "./cache/broker_sessions".to_string(),
            pending_ttl_secs: 600,
            refresh_extension_hours: 24 * 30,
            http_timeout_secs: 30,
            totp: TotpPolicy::default(),
            brokers: BrokerTable::default(),
        }
    }
}

impl HubConfig {
    /// Parse a TOML document; missing sections keep their defaults
    ///
    /// # Errors
    /// Returns an error if the document is not valid TOML for this shape
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid hub configuration")
    }

    /// Load configuration from .env / process environment
    ///
    /// # Errors
    /// Returns an error if a numeric variable does not parse
    pub fn from_env_file() -> Result<Self> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Ok(dir) = std::env::var("BROKER_CACHE_DIR") {
            config.cache_dir = dir;
        }
        if let Ok(raw) = std::env::var("BROKER_PENDING_TTL_SECS") {
            config.pending_ttl_secs = raw
                .parse()
                .with_context(|| format!("BROKER_PENDING_TTL_SECS is not a number: {raw}"))?;
        }
        if let Ok(raw) = std::env::var("BROKER_HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = raw
                .parse()
                .with_context(|| format!("BROKER_HTTP_TIMEOUT_SECS is not a number: {raw}"))?;
        }

        for broker in Broker::ALL {
            let prefix = broker.as_str().to_uppercase();
            let settings = config.brokers.get_mut(broker);
            if let Ok(url) = std::env::var(format!("{prefix}_API_BASE")) {
                settings.api_base = url;
            }
            if let Ok(url) = std::env::var(format!("{prefix}_AUTH_BASE")) {
                settings.auth_base = url;
            }
            if let Ok(url) = std::env::var(format!("{prefix}_LOGIN_BASE")) {
                settings.login_base = url;
            }
        }

        Ok(config)
    }

    /// Settings for one broker
    #[must_use]
    pub const fn settings(&self, broker: Broker) -> &BrokerSettings {
        self.brokers.get(broker)
    }

    /// Route every broker to one base URL, used against local mock servers
    #[must_use]
    pub fn with_base_url(mut self, base: &str) -> Self {
        for broker in Broker::ALL {
            let settings = self.brokers.get_mut(broker);
            *settings = settings.clone().with_base_url(base);
        }
        self
    }

    /// Abandoned-login timeout
    #[must_use]
    pub const fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    /// Outbound request timeout
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
