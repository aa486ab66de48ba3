#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, Response, StatusCode};
use chrono::Utc;
use payrail::config::{self, Config};
use payrail::connectors::{ProviderKey, shopify, stripe};
use payrail::domain::context::TrustedContext;
use payrail::domain::project::ProjectBinding;
use payrail::infrastructure::Stores;
use payrail::interfaces::http::{AppState, AppStateBuilder, router};
use serde_json::{Value, json};
use tower::ServiceExt;

pub const INTERNAL_SECRET: &str = "internal-s3cret";
pub const STRIPE_KEY: &str = "wh_stripe_1";
pub const STRIPE_SECRET: &str = "whsec_test";
pub const SHOPIFY_KEY: &str = "wh_shop_1";
pub const SHOPIFY_SECRET: &str = "shpss_test";
pub const OPERATOR_TOKEN: &str = "op-token";
pub const ORG: &str = "org_1";

/// Configuration as `serve` would read it, with `overrides` applied on top.
pub fn config(overrides: &[(&str, &str)]) -> Config {
    let mut vars: Vec<(String, String)> = vec![
        (config::ENV_INTERNAL_API_SECRET.into(), INTERNAL_SECRET.into()),
        (
            config::ENV_OPERATOR_TOKENS.into(),
            format!("alice:{OPERATOR_TOKEN}:{ORG};bob:bob-token:org_2"),
        ),
    ];
    vars.extend(overrides.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    Config::from_lookup(move |key: &str| {
        vars.iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    })
    .unwrap()
}

pub fn bindings() -> Vec<ProjectBinding> {
    vec![
        ProjectBinding {
            webhook_key: STRIPE_KEY.into(),
            org_id: ORG.into(),
            project_id: "proj_stripe".into(),
            provider: ProviderKey::Stripe,
            signing_secret: STRIPE_SECRET.into(),
        },
        ProjectBinding {
            webhook_key: SHOPIFY_KEY.into(),
            org_id: ORG.into(),
            project_id: "proj_shop".into(),
            provider: ProviderKey::Shopify,
            signing_secret: SHOPIFY_SECRET.into(),
        },
    ]
}

pub struct TestApp {
    pub state: AppState,
    pub stores: Stores,
    pub router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with(&[], Stores::in_memory())
    }

    pub fn with(overrides: &[(&str, &str)], stores: Stores) -> Self {
        let state = AppStateBuilder::new(config(overrides))
            .stores(stores.clone())
            .bindings(bindings())
            .build()
            .unwrap();
        Self {
            router: router(state.clone()),
            state,
            stores,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        read_json(response).await
    }

    /// Context minted the way `/internal/*` routes mint it.
    pub fn internal_context(&self) -> TrustedContext {
        self.state
            .internal_context(INTERNAL_SECRET, "tests")
            .expect("internal secret accepted")
    }

    /// Polls the worker until a poll claims nothing.
    pub async fn drain(&self) {
        let ctx = self.internal_context();
        for _ in 0..10 {
            let report = self.state.worker.run_once(&ctx).await.unwrap();
            if report.claimed == 0 {
                return;
            }
        }
        panic!("queue did not drain");
    }
}

pub async fn read_json(response: Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
    };
    (status, value)
}

pub fn stripe_payment_settled(event_id: &str, payment_id: &str, amount: i64, order_id: Option<&str>) -> Vec<u8> {
    let metadata = match order_id {
        Some(order_id) => json!({ "order_id": order_id }),
        None => json!({}),
    };
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "payment_intent.succeeded",
        "created": Utc::now().timestamp() - 3600,
        "data": { "object": {
            "id": payment_id,
            "object": "payment_intent",
            "amount": amount,
            "amount_received": amount,
            "currency": "usd",
            "metadata": metadata
        }}
    }))
    .unwrap()
}

pub fn stripe_refund(event_id: &str, refund_id: &str, payment_id: &str, amount: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": "refund.created",
        "created": Utc::now().timestamp() - 1800,
        "data": { "object": {
            "id": refund_id,
            "object": "refund",
            "payment_intent": payment_id,
            "amount": amount,
            "currency": "usd"
        }}
    }))
    .unwrap()
}

pub fn shopify_order_created(order_id: u64, total: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": order_id,
        "name": "#1001",
        "total_price": total,
        "currency": "USD",
        "created_at": "2026-01-01T07:00:00-05:00"
    }))
    .unwrap()
}

pub fn stripe_delivery(key: &str, body: Vec<u8>) -> Request<Body> {
    let signature = stripe::signature_header(STRIPE_SECRET, Utc::now().timestamp(), &body);
    Request::builder()
        .method(Method::POST)
        .uri(format!("/webhooks/stripe?key={key}"))
        .header("content-type", "application/json")
        .header("stripe-signature", signature)
        .body(Body::from(body))
        .unwrap()
}

pub fn shopify_delivery(topic: &str, body: Vec<u8>) -> Request<Body> {
    let signature = shopify::signature_header(SHOPIFY_SECRET, &body);
    Request::builder()
        .method(Method::POST)
        .uri(format!("/webhooks/shopify?key={SHOPIFY_KEY}"))
        .header("content-type", "application/json")
        .header(shopify::HMAC_HEADER, signature)
        .header(shopify::TOPIC_HEADER, topic)
        .body(Body::from(body))
        .unwrap()
}

pub fn authorized(method: Method, uri: &str, token: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(body)
        .unwrap()
}

pub fn internal(method: Method, uri: &str) -> Request<Body> {
    authorized(method, uri, INTERNAL_SECRET, Body::empty())
}
