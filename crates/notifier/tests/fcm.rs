//! FCM gateway tests against a local mock of the OAuth and FCM endpoints.

use mockito::Matcher;
use serde_json::json;

use beacon_common::types::DispatchJob;
use beacon_notifier::auth::{AccessTokenProvider, ServiceAccountKey};
use beacon_notifier::fcm::FcmGateway;
use beacon_notifier::{DeliveryErrorCode, NotifierError, PushGateway, PushMessage, TokenOutcome};

const SERVICE_ACCOUNT: &str = include_str!("fixtures/service_account.json");
const SEND_PATH: &str = "/v1/projects/beacon-test/messages:send";
const GOOD: &str = "good-token-0123456789";
const GONE: &str = "gone-token-0123456789";

fn gateway(server: &mockito::ServerGuard) -> FcmGateway {
    let mut key = ServiceAccountKey::from_json(SERVICE_ACCOUNT).unwrap();
    key.token_uri = format!("{}/token", server.url());
    let client = reqwest::Client::new();
    let auth = AccessTokenProvider::new(key, client.clone());
    FcmGateway::new(client, auth, &server.url(), "beacon-test", 4)
}

fn message() -> PushMessage {
    PushMessage::from_job(&DispatchJob::pending(
        "job-1",
        vec!["u1".to_string()],
        "Hi",
        "there",
        1_700_000_000_000,
    ))
}

#[tokio::test]
async fn test_multicast_reports_per_token_results() {
    let mut server = mockito::Server::new_async().await;

    let token_mock = server
        .mock("POST", "/token")
        .match_body(Matcher::Regex("grant_type=urn".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"ya29.test","expires_in":3600,"token_type":"Bearer"}"#)
        .expect(1)
        .create_async()
        .await;

    let good_mock = server
        .mock("POST", SEND_PATH)
        .match_header("authorization", "Bearer ya29.test")
        .match_body(Matcher::PartialJson(json!({ "message": { "token": GOOD } })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"name":"projects/beacon-test/messages/0:1"}"#)
        .expect(2)
        .create_async()
        .await;

    let gone_mock = server
        .mock("POST", SEND_PATH)
        .match_body(Matcher::PartialJson(json!({ "message": { "token": GONE } })))
        .with_status(404)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "error": {
                    "code": 404,
                    "message": "Requested entity was not found.",
                    "status": "NOT_FOUND",
                    "details": [{
                        "@type": "type.googleapis.com/google.firebase.fcm.v1.FcmError",
                        "errorCode": "UNREGISTERED"
                    }]
                }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let gateway = gateway(&server);
    let tokens = vec![GOOD.to_string(), GONE.to_string()];

    let results = gateway.send_multicast(&message(), &tokens).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].token, GOOD);
    assert_eq!(
        results[0].outcome,
        TokenOutcome::Delivered {
            message_id: "projects/beacon-test/messages/0:1".to_string()
        }
    );
    match &results[1].outcome {
        TokenOutcome::Failed(error) => assert_eq!(error.code, DeliveryErrorCode::Unregistered),
        other => panic!("expected failure, got {:?}", other),
    }

    // The cached access token is reused for the next batch.
    let again = gateway
        .send_multicast(&message(), &[GOOD.to_string()])
        .await
        .unwrap();
    assert!(again[0].is_success());

    token_mock.assert_async().await;
    good_mock.assert_async().await;
    gone_mock.assert_async().await;
}

#[tokio::test]
async fn test_token_endpoint_failure_fails_whole_batch() {
    let mut server = mockito::Server::new_async().await;

    let _token_mock = server
        .mock("POST", "/token")
        .with_status(401)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;

    let send_mock = server
        .mock("POST", SEND_PATH)
        .expect(0)
        .create_async()
        .await;

    let result = gateway(&server)
        .send_multicast(&message(), &[GOOD.to_string()])
        .await;

    match result {
        Err(err @ NotifierError::Auth(_)) => assert_eq!(err.code(), DeliveryErrorCode::AuthError),
        other => panic!("expected auth error, got {:?}", other.map(|r| r.len())),
    }
    send_mock.assert_async().await;
}
