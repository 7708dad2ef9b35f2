//! FCM client tests against a mock HTTP server.
//!
//! ```bash
//! cargo test -p beacon-notifier --test integration
//! ```

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use beacon_common::types::{NotificationType, Priority};
use beacon_notifier::fcm::{FcmAuth, FcmClient};
use beacon_notifier::{ErrorClass, ProviderErrorCode, PushProvider, build_message};

const SEND_PATH: &str = "/v1/projects/demo/messages:send";

fn client_with_timeout(server: &MockServer, timeout: Duration) -> FcmClient {
    FcmClient::new(
        "demo",
        server.uri(),
        FcmAuth::Static("test-token".to_string()),
        4,
        timeout,
    )
    .unwrap()
}

fn client(server: &MockServer) -> FcmClient {
    client_with_timeout(server, Duration::from_secs(10))
}

fn message(token: &str) -> beacon_notifier::PushMessage {
    build_message(
        token,
        NotificationType::Notification,
        "Hi",
        "test",
        &serde_json::Value::Null,
        Priority::High,
    )
}

#[tokio::test]
async fn test_send_returns_message_name() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({
            "validate_only": false,
            "message": {"token": "abc", "notification": {"title": "Hi", "body": "test"}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "msg-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let id = client(&server).send(&message("abc"), false).await.unwrap();
    assert_eq!(id, "msg-1");
}

#[tokio::test]
async fn test_send_maps_unregistered_to_token_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {
                "code": 404,
                "message": "Requested entity was not found.",
                "status": "NOT_FOUND",
                "details": [{"errorCode": "UNREGISTERED"}]
            }
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .send(&message("stale"), false)
        .await
        .unwrap_err();
    assert_eq!(err.code, ProviderErrorCode::RegistrationTokenNotRegistered);
    assert_eq!(err.class(), ErrorClass::TokenInvalid);
}

#[tokio::test]
async fn test_send_maps_unavailable_to_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": {"code": 503, "message": "Backend unavailable", "status": "UNAVAILABLE"}
        })))
        .mount(&server)
        .await;

    let err = client(&server).send(&message("abc"), false).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Retryable);
}

#[tokio::test]
async fn test_send_each_preserves_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .and(body_partial_json(json!({"message": {"token": "bad"}})))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": 400, "message": "Invalid registration token", "status": "INVALID_ARGUMENT"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "ok"})))
        .mount(&server)
        .await;

    let client = client(&server);
    let messages = vec![message("a"), message("bad"), message("c")];
    let results = client.send_each(&messages).await.unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert_eq!(
        results[1].as_ref().unwrap_err().code,
        ProviderErrorCode::InvalidRegistrationToken
    );
    assert!(results[2].is_ok());
}

#[tokio::test]
async fn test_validate_only_flag_is_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .and(body_partial_json(json!({"validate_only": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "dry-run"})))
        .expect(1)
        .mount(&server)
        .await;

    let id = client(&server).send(&message("abc"), true).await.unwrap();
    assert_eq!(id, "dry-run");
}

#[tokio::test]
async fn test_send_each_fans_out_many_messages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "ok"})))
        .expect(10)
        .mount(&server)
        .await;

    let messages: Vec<_> = (0..10).map(|i| message(&format!("tok-{i}"))).collect();
    let results = client(&server).send_each(&messages).await.unwrap();

    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|r| r.is_ok()));
}

#[tokio::test]
async fn test_hung_provider_times_out_as_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SEND_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"name": "late"}))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let client = client_with_timeout(&server, Duration::from_millis(200));
    let result = tokio::time::timeout(Duration::from_secs(5), client.send(&message("abc"), false))
        .await
        .expect("send should give up on its own");

    let err = result.unwrap_err();
    assert_eq!(err.code, ProviderErrorCode::Timeout);
    assert_eq!(err.class(), ErrorClass::Retryable);
}
