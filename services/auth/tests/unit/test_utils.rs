//! Common test fixtures

use broker_auth::session::MemoryRepository;
use broker_auth::{BrokerHub, CredentialRecord, HubConfig, SessionRecord, TotpPolicy, TransportMode};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;

pub const USER: &str = "user-1";

/// Base32 seed long enough for the TOTP generator
pub const TOTP_SEED: &str = "JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP";

/// Configuration routing every broker to `base` with no TOTP wait
pub fn test_config(base: &str) -> HubConfig {
    HubConfig {
        totp: TotpPolicy {
            max_attempts: 3,
            window_secs: 0,
        },
        ..HubConfig::default()
    }
    .with_base_url(base)
}

/// Hub over an in-memory durable store, returned alongside the store
pub fn memory_hub(base: &str) -> (BrokerHub, Arc<MemoryRepository>) {
    memory_hub_with(test_config(base))
}

pub fn memory_hub_with(config: HubConfig) -> (BrokerHub, Arc<MemoryRepository>) {
    let repository = Arc::new(MemoryRepository::new());
    (BrokerHub::new(config, repository.clone()), repository)
}

pub fn kite_creds() -> CredentialRecord {
    CredentialRecord {
        api_key: Some("kite_api_key".to_string()),
        api_secret: Some("kite_api_secret".to_string()),
        ..Default::default()
    }
}

pub fn dhan_direct_creds() -> CredentialRecord {
    CredentialRecord {
        client_id: Some("1100003626".to_string()),
        static_access_token: Some("dhan-static-token".to_string()),
        ..Default::default()
    }
}

pub fn dhan_partner_creds() -> CredentialRecord {
    CredentialRecord {
        api_key: Some("partner-7".to_string()),
        api_secret: Some("partner-secret".to_string()),
        ..Default::default()
    }
}

pub fn angel_creds() -> CredentialRecord {
    CredentialRecord {
        api_key: Some("smartapi-key".to_string()),
        login_id: Some("A1234".to_string()),
        login_password: Some("1111".to_string()),
        totp_seed: Some(TOTP_SEED.to_string()),
        ..Default::default()
    }
}

pub fn session_record(token: &str, ttl_hours: i64, mode: TransportMode) -> SessionRecord {
    SessionRecord::new(token.to_string(), mode, ChronoDuration::hours(ttl_hours))
}
