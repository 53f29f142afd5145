#![allow(clippy::unwrap_used)]
// Integration tests for `CloudRestClient` using wiremock.

use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use direktive_api::rest::Registration;
use direktive_api::{CloudRestClient, Error, TransportConfig};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, CloudRestClient) {
    let server = MockServer::start().await;
    let base_url = Url::parse(&server.uri()).unwrap();
    let key: secrecy::SecretString = "test-key".to_string().into();
    let client =
        CloudRestClient::new(&base_url, &key, "inst-1", &TransportConfig::default()).unwrap();
    (server, client)
}

// ── Health ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_sends_api_key() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .and(header("x-api-key", "test-key"))
        .and(header("x-instance-id", "inst-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "healthy"})))
        .expect(1)
        .mount(&server)
        .await;

    let health = client.health().await.unwrap();
    assert!(health.is_healthy());
}

#[tokio::test]
async fn test_health_reports_unhealthy() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "degraded", "error": "database lag"})),
        )
        .mount(&server)
        .await;

    let health = client.health().await.unwrap();
    assert!(!health.is_healthy());
    assert_eq!(health.error.as_deref(), Some("database lag"));
}

#[tokio::test]
async fn test_unauthorized_maps_to_invalid_api_key() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"message": "API key revoked"})),
        )
        .mount(&server)
        .await;

    let result = client.health().await;
    match result {
        Err(ref e @ Error::InvalidApiKey { ref message }) => {
            assert_eq!(message, "API key revoked");
            assert!(e.is_auth_failure());
        }
        other => panic!("expected InvalidApiKey, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/subscription"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = client.subscription().await.unwrap_err();
    assert!(err.is_transient(), "expected transient error, got: {err:?}");
}

// ── Subscription ────────────────────────────────────────────────────

#[tokio::test]
async fn test_subscription_defaults_plan() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/subscription"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let sub = client.subscription().await.unwrap();
    assert_eq!(sub.plan, "basic");
    assert!(!sub.encryption_required);
}

#[tokio::test]
async fn test_malformed_body_is_deserialization_error() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/subscription"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let result = client.subscription().await;
    assert!(
        matches!(result, Err(Error::Deserialization { ref body, .. }) if body == "not json"),
        "got: {result:?}"
    );
}

// ── Registration ────────────────────────────────────────────────────

#[tokio::test]
async fn test_register_posts_instance_details() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/bridge/register"))
        .and(body_json(json!({
            "instance_id": "inst-1",
            "ha_base_url": "http://homeassistant.local:8123",
            "timezone": "Europe/Berlin"
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    client
        .register(&Registration {
            instance_id: "inst-1".into(),
            ha_base_url: "http://homeassistant.local:8123".into(),
            country: None,
            timezone: Some("Europe/Berlin".into()),
            location: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_register_conflict_surfaces_status() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/bridge/register"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"error": "duplicate"})))
        .mount(&server)
        .await;

    let result = client
        .register(&Registration {
            instance_id: "inst-1".into(),
            ha_base_url: "http://ha".into(),
            country: None,
            timezone: None,
            location: None,
        })
        .await;

    assert!(
        matches!(
            result,
            Err(Error::CloudApi { status: 409, ref message }) if message == "duplicate"
        ),
        "got: {result:?}"
    );
}
