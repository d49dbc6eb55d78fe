//! Angel One password+TOTP login and guarded data calls

use super::test_utils::*;
use broker_auth::{
    Broker, BrokerError, ConnectionStatus, DataKind, HubConfig, LoginStep, TotpPolicy, TransportMode,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LOGIN: &str = "/rest/auth/angelbroking/user/v1/loginByPassword";
const ORDER_BOOK: &str = "/rest/secure/angelbroking/order/v1/getOrderBook";

fn login_ok(jwt: &str) -> Value {
    json!({
        "status": true,
        "message": "SUCCESS",
        "errorcode": "",
        "data": {
            "jwtToken": format!("Bearer {jwt}"),
            "refreshToken": "refresh-1",
            "feedToken": "feed-1"
        }
    })
}

fn login_error(code: &str, message: &str) -> Value {
    json!({"status": false, "message": message, "errorcode": code, "data": null})
}

#[tokio::test]
async fn test_password_totp_login() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .and(header("X-PrivateKey", "smartapi-key"))
        .and(header("X-UserType", "USER"))
        .and(body_partial_json(json!({"clientcode": "A1234", "password": "1111"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_ok("jwt-1")))
        .expect(1)
        .mount(&server)
        .await;
    let (hub, repository) = memory_hub(&server.uri());
    hub.register_credentials(Broker::Angel, USER, angel_creds())
        .await
        .unwrap();

    let LoginStep::Established(session) = hub.begin_login(Broker::Angel, USER, true).await.unwrap() else {
        panic!("password+TOTP login never redirects");
    };
    assert_eq!(session.access_token, "jwt-1");
    assert_eq!(session.refresh_token.as_deref(), Some("refresh-1"));
    assert_eq!(session.feed_token.as_deref(), Some("feed-1"));
    assert_eq!(session.transport_mode, TransportMode::PasswordTotp);
    assert_eq!(repository.len().await, 1);

    let requests = server.received_requests().await.unwrap_or_default();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let totp = body["totp"].as_str().unwrap();
    assert_eq!(totp.len(), 6);
}

#[tokio::test]
async fn test_success_without_token_is_protocol_violation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "SUCCESS",
            "errorcode": "",
            "data": {"refreshToken": "refresh-1"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    let (hub, repository) = memory_hub(&server.uri());
    hub.register_credentials(Broker::Angel, USER, angel_creds())
        .await
        .unwrap();

    let err = hub.begin_login(Broker::Angel, USER, true).await.unwrap_err();
    assert!(matches!(err, BrokerError::ProtocolViolation { broker: Broker::Angel, .. }));
    assert!(!err.is_retryable());
    assert!(repository.is_empty().await);
    assert!(!hub.status(Broker::Angel, USER).await.unwrap().is_connected());
}

#[tokio::test]
async fn test_stale_code_is_retried_in_next_window() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_error("AB1050", "Invalid totp")))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_ok("jwt-3")))
        .mount(&server)
        .await;
    let (hub, _) = memory_hub(&server.uri());
    hub.register_credentials(Broker::Angel, USER, angel_creds())
        .await
        .unwrap();

    let step = hub.begin_login(Broker::Angel, USER, false).await.unwrap();
    assert!(matches!(step, LoginStep::Established(ref s) if s.access_token == "jwt-3"));
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 3);
}

#[tokio::test]
async fn test_stale_code_gives_up_after_three_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_error("AB1050", "Invalid totp")))
        .expect(3)
        .mount(&server)
        .await;
    let (hub, _) = memory_hub(&server.uri());
    hub.register_credentials(Broker::Angel, USER, angel_creds())
        .await
        .unwrap();

    let err = hub.begin_login(Broker::Angel, USER, false).await.unwrap_err();
    assert!(matches!(err, BrokerError::CredentialsInvalid { .. }));
}

#[tokio::test]
async fn test_code_window_wait_does_not_block_other_users() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_error("AB1050", "Invalid totp")))
        .mount(&server)
        .await;
    let config = HubConfig {
        totp: TotpPolicy {
            max_attempts: 3,
            window_secs: 30,
        },
        ..test_config(&server.uri())
    };
    let (hub, repository) = memory_hub_with(config);
    let hub = Arc::new(hub);
    hub.register_credentials(Broker::Angel, USER, angel_creds())
        .await
        .unwrap();

    let login = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move { hub.begin_login(Broker::Angel, USER, true).await })
    };

    // first attempt rejected; the login now waits out the code window
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.received_requests().await.unwrap_or_default().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(1), async {
        hub.register_credentials(Broker::Angel, "user-2", angel_creds())
            .await
            .unwrap();
        hub.register_credentials(Broker::Dhan, "user-2", dhan_direct_creds())
            .await
            .unwrap();
        hub.begin_login(Broker::Dhan, "user-2", false).await.unwrap();
        assert!(hub.status(Broker::Dhan, "user-2").await.unwrap().is_connected());
        assert_eq!(
            hub.status(Broker::Angel, USER).await.unwrap(),
            ConnectionStatus::NotConnected
        );
    })
    .await
    .expect("other requests must not wait on the code window");
    assert!(!login.is_finished());

    // dropping the waiting login abandons it
    login.abort();
    assert!(login.await.unwrap_err().is_cancelled());
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 1);
    assert!(repository.is_empty().await);
    assert_eq!(
        hub.status(Broker::Angel, USER).await.unwrap(),
        ConnectionStatus::NotConnected
    );
}

#[tokio::test]
async fn test_wrong_password_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_error("AB1011", "Invalid password")))
        .expect(1)
        .mount(&server)
        .await;
    let (hub, _) = memory_hub(&server.uri());
    hub.register_credentials(Broker::Angel, USER, angel_creds())
        .await
        .unwrap();

    let err = hub.begin_login(Broker::Angel, USER, false).await.unwrap_err();
    match err {
        BrokerError::CredentialsInvalid { message, .. } => assert!(message.contains("AB1011")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_expired_jwt_triggers_exactly_one_reauth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_ok("jwt-fresh")))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ORDER_BOOK))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_error("AG8001", "Invalid Token")))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ORDER_BOOK))
        .and(header("Authorization", "Bearer jwt-fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": true,
            "message": "SUCCESS",
            "errorcode": "",
            "data": [1, 2, 3]
        })))
        .expect(1)
        .mount(&server)
        .await;
    let (hub, _) = memory_hub(&server.uri());
    hub.register_credentials(Broker::Angel, USER, angel_creds())
        .await
        .unwrap();
    hub.begin_login(Broker::Angel, USER, false).await.unwrap();

    let orders = hub.fetch(Broker::Angel, USER, DataKind::Orders).await.unwrap();
    assert_eq!(orders, vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn test_persistent_expiry_fails_after_two_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_ok("jwt-any")))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ORDER_BOOK))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_error("AG8001", "Invalid Token")))
        .expect(2)
        .mount(&server)
        .await;
    let (hub, _) = memory_hub(&server.uri());
    hub.register_credentials(Broker::Angel, USER, angel_creds())
        .await
        .unwrap();
    hub.begin_login(Broker::Angel, USER, false).await.unwrap();

    let err = hub.fetch(Broker::Angel, USER, DataKind::Orders).await.unwrap_err();
    match err {
        BrokerError::BrokerCallFailed { broker, expired, .. } => {
            assert_eq!(broker, Broker::Angel);
            assert!(expired);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_other_call_failure_is_not_expiry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_json(login_ok("jwt-1")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ORDER_BOOK))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
        .expect(1)
        .mount(&server)
        .await;
    let (hub, _) = memory_hub(&server.uri());
    hub.register_credentials(Broker::Angel, USER, angel_creds())
        .await
        .unwrap();
    hub.begin_login(Broker::Angel, USER, false).await.unwrap();

    let err = hub.fetch(Broker::Angel, USER, DataKind::Orders).await.unwrap_err();
    assert!(matches!(err, BrokerError::BrokerCallFailed { expired: false, .. }));
    assert!(!err.needs_reconnect());
}
