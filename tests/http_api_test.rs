mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use chrono::Utc;
use common::*;
use payrail::config::ENV_MAX_PAYLOAD_BYTES;
use payrail::connectors::stripe;
use payrail::infrastructure::Stores;
use serde_json::json;

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let request = Request::get("/healthz").body(Body::empty()).unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_valid_webhook_is_persisted_and_enqueued() {
    let app = TestApp::new();
    let body = stripe_payment_settled("evt_1", "p_123", 10000, Some("ord_1"));

    let (status, receipt) = app.send(stripe_delivery(STRIPE_KEY, body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["event_type"], "payment_intent.succeeded");
    assert!(receipt["raw_event_id"].is_string());
    assert!(receipt["job_id"].is_string());

    assert_eq!(app.stores.raw_events.count(ORG).await.unwrap(), 1);
    let (status, jobs) = app
        .send(internal(Method::GET, "/internal/jobs?status=queued"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["job_type"], "normalize_event");
    assert_eq!(jobs[0]["org_id"], ORG);
}

#[tokio::test]
async fn test_bad_signature_is_rejected_without_side_effects() {
    let app = TestApp::new();
    let body = stripe_payment_settled("evt_1", "p_123", 10000, None);
    let forged = stripe::signature_header("whsec_wrong", Utc::now().timestamp(), &body);
    let request = Request::post(format!("/webhooks/stripe?key={STRIPE_KEY}"))
        .header("stripe-signature", forged)
        .body(Body::from(body))
        .unwrap();

    let (status, error) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(error["error"].as_str().unwrap().contains("signature"));
    assert_eq!(app.stores.raw_events.count(ORG).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_key_or_provider_is_not_found() {
    let app = TestApp::new();
    let body = stripe_payment_settled("evt_1", "p_123", 10000, None);

    let (status, _) = app.send(stripe_delivery("wh_nope", body.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // A Shopify key does not open the Stripe endpoint.
    let (status, _) = app.send(stripe_delivery(SHOPIFY_KEY, body.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let request = Request::post("/webhooks/stripe")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let request = Request::post(format!("/webhooks/paypal?key={STRIPE_KEY}"))
        .body(Body::from(body))
        .unwrap();
    let (status, error) = app.send(request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(error["error"].as_str().unwrap().contains("paypal"));
}

#[tokio::test]
async fn test_oversized_payload_is_rejected() {
    let app = TestApp::with(&[(ENV_MAX_PAYLOAD_BYTES, "64")], Stores::in_memory());
    let body = stripe_payment_settled("evt_1", "p_123", 10000, None);
    assert!(body.len() > 64);

    let response = tower::ServiceExt::oneshot(app.router.clone(), stripe_delivery(STRIPE_KEY, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(app.stores.raw_events.count(ORG).await.unwrap(), 0);
}

#[tokio::test]
async fn test_verified_but_unparseable_webhook_is_kept() {
    let app = TestApp::new();
    let body = br#"{"not":"an event"}"#.to_vec();

    let (status, receipt) = app.send(stripe_delivery(STRIPE_KEY, body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["event_type"], "unparsed");

    app.drain().await;
    let (_, failed) = app
        .send(internal(Method::GET, "/internal/jobs?status=failed"))
        .await;
    let failed = failed.as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["attempts"], 1);
    assert!(
        failed[0]["last_error"]
            .as_str()
            .unwrap()
            .starts_with("malformed payload")
    );
    assert_eq!(app.stores.raw_events.count(ORG).await.unwrap(), 1);
}

#[tokio::test]
async fn test_internal_routes_require_the_shared_secret() {
    let app = TestApp::new();
    for (method, uri) in [
        (Method::POST, "/internal/worker"),
        (Method::POST, "/internal/consistency"),
        (Method::GET, "/internal/jobs"),
        (Method::GET, "/internal/anomalies?org_id=org_1"),
    ] {
        let anonymous = Request::builder()
            .method(method.clone())
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let (status, _) = app.send(anonymous).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri} without credentials");

        let wrong = authorized(method, uri, "not-the-secret", Body::empty());
        let (status, _) = app.send(wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri} with a wrong secret");
    }
}

#[tokio::test]
async fn test_operator_token_does_not_open_internal_routes() {
    let app = TestApp::new();
    let request = authorized(Method::POST, "/internal/worker", OPERATOR_TOKEN, Body::empty());
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_worker_endpoint_reports_the_poll() {
    let app = TestApp::new();
    let body = stripe_payment_settled("evt_1", "p_123", 10000, None);
    app.send(stripe_delivery(STRIPE_KEY, body)).await;

    let (status, report) = app.send(internal(Method::POST, "/internal/worker")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["success"], true);
    assert_eq!(report["claimed"], 1);
    assert_eq!(report["processed"], 1);
    assert_eq!(report["failed"], 0);
}

#[tokio::test]
async fn test_inspection_query_validation() {
    let app = TestApp::new();

    let (status, _) = app
        .send(internal(Method::GET, "/internal/anomalies"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .send(internal(Method::GET, "/internal/jobs?status=sleeping"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .send(internal(
            Method::POST,
            "/internal/jobs/8d3c4a52-0f5e-4a1b-9a57-3e8f7b1c2d90/requeue",
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
