//! Hub lifecycle: status, disconnect, refresh, listings and teardown

use super::test_utils::*;
use async_trait::async_trait;
use broker_auth::providers::DhanDriver;
use broker_auth::session::{MemoryRepository, PersistedSession, SessionRepository};
use broker_auth::{
    AuthDriver, Broker, BrokerApi, BrokerError, BrokerHub, BrokerResult, CompletedLogin,
    ConnectionStatus, CredentialRecord, DataKind, ExpirySignal, HubConfig, LoginStep,
    PendingAuthRegistry, SessionKey, SessionRecord, TransportMode,
};
use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Desk-side Dhan account served from memory
struct FixedBookApi;

#[async_trait]
impl BrokerApi for FixedBookApi {
    fn broker(&self) -> Broker {
        Broker::Dhan
    }

    async fn fetch(&self, kind: DataKind) -> BrokerResult<Value> {
        Ok(json!({"result": [{"kind": kind.as_str()}]}))
    }
}

struct FixedBookDriver {
    logins: AtomicU32,
    signal: ExpirySignal,
}

#[async_trait]
impl AuthDriver for FixedBookDriver {
    fn broker(&self) -> Broker {
        Broker::Dhan
    }

    async fn begin(&self, _user_id: &str, _remember: bool) -> BrokerResult<LoginStep> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(LoginStep::Established(
            SessionRecord::new(
                "desk-token".to_string(),
                TransportMode::DirectToken,
                ChronoDuration::hours(1),
            )
            .with_identifier("client_id", "DESK-1"),
        ))
    }

    async fn complete(&self, _correlation: &str, _provider_token: &str) -> BrokerResult<CompletedLogin> {
        Err(BrokerError::ProtocolViolation {
            broker: Broker::Dhan,
            message: "no callback for desk accounts".to_string(),
        })
    }

    fn connect(&self, _session: &SessionRecord) -> BrokerResult<Arc<dyn BrokerApi>> {
        Ok(Arc::new(FixedBookApi))
    }

    fn expiry_signal(&self) -> &ExpirySignal {
        &self.signal
    }
}

#[rstest]
#[case::kite(Broker::Kite, kite_creds())]
#[case::dhan_direct(Broker::Dhan, dhan_direct_creds())]
#[case::dhan_partner(Broker::Dhan, dhan_partner_creds())]
#[case::angel(Broker::Angel, angel_creds())]
#[tokio::test]
async fn test_registration_alone_is_not_connected(
    #[case] broker: Broker,
    #[case] creds: CredentialRecord,
) {
    let (hub, _) = memory_hub("http://127.0.0.1:9");
    hub.register_credentials(broker, USER, creds).await.unwrap();

    assert_eq!(
        hub.status(broker, USER).await.unwrap(),
        ConnectionStatus::NotConnected
    );
}

#[tokio::test]
async fn test_login_without_credentials() {
    let (hub, _) = memory_hub("http://127.0.0.1:9");
    let err = hub.begin_login(Broker::Angel, USER, false).await.unwrap_err();
    assert!(matches!(err, BrokerError::CredentialsMissing { broker: Broker::Angel, .. }));

    let err = hub
        .fetch(Broker::Angel, USER, DataKind::Orders)
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::NotConnected { broker: Broker::Angel });
}

#[tokio::test]
async fn test_disconnect_drops_session_and_client() {
    let (hub, repository) = memory_hub("http://127.0.0.1:9");
    hub.register_credentials(Broker::Dhan, USER, dhan_direct_creds())
        .await
        .unwrap();
    hub.begin_login(Broker::Dhan, USER, true).await.unwrap();

    let key = SessionKey::new(Broker::Dhan, USER);
    let session = hub.sessions().load(&key).await.unwrap().unwrap();
    let driver = DhanDriver::new(
        reqwest::Client::new(),
        hub.config().settings(Broker::Dhan).clone(),
        Arc::clone(hub.credentials()),
        Arc::new(PendingAuthRegistry::new(Duration::from_secs(60))),
    );
    hub.sessions()
        .attach_client(&key, driver.connect(&session).unwrap())
        .await;
    assert!(hub.sessions().client(&key).await.is_some());

    hub.disconnect(Broker::Dhan, USER).await.unwrap();

    assert!(hub.sessions().load(&key).await.unwrap().is_none());
    assert!(hub.sessions().client(&key).await.is_none());
    assert!(repository.is_empty().await);
    assert_eq!(
        hub.status(Broker::Dhan, USER).await.unwrap(),
        ConnectionStatus::NotConnected
    );
    // credentials survive a disconnect
    assert!(hub.credentials().get(Broker::Dhan, USER).await.is_some());
}

#[tokio::test]
async fn test_expired_durable_session_reports_expired() {
    let (hub, repository) = memory_hub("http://127.0.0.1:9");
    let key = SessionKey::new(Broker::Angel, USER);
    repository
        .upsert(PersistedSession::new(
            key.clone(),
            session_record("old-jwt", -1, TransportMode::PasswordTotp),
        ))
        .await
        .unwrap();

    assert!(hub.sessions().load(&key).await.unwrap().is_none());
    assert_eq!(hub.status(Broker::Angel, USER).await.unwrap(), ConnectionStatus::Expired);
    assert!(hub.connected_brokers(USER).await.unwrap().is_empty());

    // the row is still there until purged
    assert_eq!(repository.len().await, 1);
    assert_eq!(hub.purge_expired().await.unwrap(), 1);
    assert!(repository.is_empty().await);
}

#[tokio::test]
async fn test_refresh_and_saved_sessions() {
    let (hub, _) = memory_hub("http://127.0.0.1:9");
    hub.register_credentials(Broker::Dhan, USER, dhan_direct_creds())
        .await
        .unwrap();
    hub.begin_login(Broker::Dhan, USER, true).await.unwrap();

    let before = Utc::now();
    let new_expiry = hub.refresh_session(Broker::Dhan, USER).await.unwrap();
    assert!(new_expiry >= before + ChronoDuration::hours(hub.config().refresh_extension_hours));

    let saved = hub.saved_sessions().await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].broker, Broker::Dhan);
    assert_eq!(saved[0].expires_at, new_expiry);
    assert!(saved[0].is_active);

    let err = hub.refresh_session(Broker::Kite, USER).await.unwrap_err();
    assert_eq!(err, BrokerError::NotConnected { broker: Broker::Kite });
}

#[tokio::test]
async fn test_connected_brokers_lists_only_live_sessions() {
    let (hub, repository) = memory_hub("http://127.0.0.1:9");
    hub.register_credentials(Broker::Dhan, USER, dhan_direct_creds())
        .await
        .unwrap();
    hub.begin_login(Broker::Dhan, USER, false).await.unwrap();
    repository
        .upsert(PersistedSession::new(
            SessionKey::new(Broker::Angel, USER),
            session_record("jwt", 2, TransportMode::PasswordTotp),
        ))
        .await
        .unwrap();
    repository
        .upsert(PersistedSession::new(
            SessionKey::new(Broker::Kite, USER),
            session_record("stale", -2, TransportMode::RedirectDelegated),
        ))
        .await
        .unwrap();
    repository
        .upsert(PersistedSession::new(
            SessionKey::new(Broker::Kite, "someone-else"),
            session_record("other", 2, TransportMode::RedirectDelegated),
        ))
        .await
        .unwrap();

    assert_eq!(
        hub.connected_brokers(USER).await.unwrap(),
        vec![Broker::Dhan, Broker::Angel]
    );
}

#[tokio::test]
async fn test_warm_start_and_shutdown() {
    let repository = Arc::new(MemoryRepository::new());
    let config = test_config("http://127.0.0.1:9");

    let first = BrokerHub::new(config.clone(), repository.clone());
    first
        .register_credentials(Broker::Dhan, USER, dhan_direct_creds())
        .await
        .unwrap();
    first.begin_login(Broker::Dhan, USER, true).await.unwrap();
    first
        .register_credentials(Broker::Dhan, "ephemeral", dhan_direct_creds())
        .await
        .unwrap();
    first.begin_login(Broker::Dhan, "ephemeral", false).await.unwrap();
    first.shutdown().await;

    let second = BrokerHub::new(config, repository);
    assert_eq!(second.warm_start().await.unwrap(), 1);
    assert!(second.status(Broker::Dhan, USER).await.unwrap().is_connected());
    assert_eq!(
        second.status(Broker::Dhan, "ephemeral").await.unwrap(),
        ConnectionStatus::NotConnected
    );
}

#[tokio::test]
async fn test_abandoned_logins_are_reclaimed() {
    let config = HubConfig {
        pending_ttl_secs: 0,
        ..test_config("http://127.0.0.1:9")
    };
    let (hub, _) = memory_hub_with(config);
    hub.register_credentials(Broker::Kite, USER, kite_creds()).await.unwrap();

    let LoginStep::Redirect { correlation, .. } =
        hub.begin_login(Broker::Kite, USER, false).await.unwrap()
    else {
        panic!("kite login must redirect");
    };

    assert_eq!(hub.reclaim_abandoned_logins().await, 1);
    let err = hub
        .complete_login(Broker::Kite, &correlation, "req-token")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ProtocolViolation { .. }));
}

#[tokio::test]
async fn test_current_totp_uses_registered_seed() {
    let (hub, _) = memory_hub("http://127.0.0.1:9");
    assert!(hub.current_totp(Broker::Angel, USER).await.is_err());

    hub.register_credentials(Broker::Angel, USER, angel_creds())
        .await
        .unwrap();
    let code = hub.current_totp(Broker::Angel, USER).await.unwrap();
    assert_eq!(code.len(), 6);
}

#[tokio::test]
async fn test_injected_driver_serves_its_broker() {
    let driver = Arc::new(FixedBookDriver {
        logins: AtomicU32::new(0),
        signal: ExpirySignal::new(&[], &[]),
    });
    let (hub, _) = memory_hub("http://127.0.0.1:9");
    let hub = hub.with_driver(driver.clone());

    // no credentials registered: the injected driver decides how to log in
    let snapshot = hub.fetch_all(Broker::Dhan, USER).await.unwrap();
    assert_eq!(snapshot.get(DataKind::Orders), &[json!({"kind": "orders"})]);
    assert_eq!(snapshot.get(DataKind::Trades), &[json!({"kind": "trades"})]);
    assert_eq!(driver.logins.load(Ordering::SeqCst), 1);

    let ConnectionStatus::Connected(summary) = hub.status(Broker::Dhan, USER).await.unwrap() else {
        panic!("injected login must connect");
    };
    assert_eq!(summary.identifiers.get("client_id").map(String::as_str), Some("DESK-1"));
}
