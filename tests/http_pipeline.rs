mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use common::{get_request, harness, json_request, send, FixedOracle, StubProvider, WEBHOOK_SECRET};
use rental_api::accounts::{AccountPatch, AccountStore, ApiUsage};
use rental_api::billing::{sign_payload, SubscriptionStatus};
use rental_api::routes;
use serde_json::{json, Value};
use std::sync::Arc;

fn webhook_request(body: &Value, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/billing/webhook")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("stripe-signature", signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn signed(body: &Value) -> Request<Body> {
    let raw = body.to_string();
    let signature = sign_payload(WEBHOOK_SECRET, raw.as_bytes(), Utc::now().timestamp()).unwrap();
    webhook_request(body, Some(signature))
}

#[tokio::test]
async fn register_login_and_profile() {
    let h = harness(
        Arc::new(FixedOracle(SubscriptionStatus::Active)),
        StubProvider::listing(),
    );
    let app = routes::app(h.state.clone());

    let register = json!({ "name": "Ana", "email": "Ana@Example.com", "password": "correct-horse" });
    let (status, body) = send(&app, json_request("POST", "/api/auth/register", None, register.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["user"]["email"], "ana@example.com");
    assert_eq!(body["user"]["subscriptionActive"], false);
    assert_eq!(body["user"]["monthlyLimit"], 100);

    let (status, body) = send(&app, json_request("POST", "/api/auth/register", None, register)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "User already exists");

    let short = json!({ "email": "short@example.com", "password": "abc" });
    let (status, _) = send(&app, json_request("POST", "/api/auth/register", None, short)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let wrong = json!({ "email": "ana@example.com", "password": "wrong-password" });
    let (status, body) = send(&app, json_request("POST", "/api/auth/login", None, wrong)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid credentials");

    let login = json!({ "email": "ana@example.com", "password": "correct-horse" });
    let (status, body) = send(&app, json_request("POST", "/api/auth/login", None, login)).await;
    assert_eq!(status, StatusCode::OK);
    let bearer = format!("Bearer {}", body["token"].as_str().unwrap());

    let (status, body) = send(&app, get_request("/api/auth/me", Some(&bearer))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Ana");

    let (status, _) = send(&app, get_request("/api/auth/me", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn gate_rejections_map_to_http_statuses() {
    let h = harness(
        Arc::new(FixedOracle(SubscriptionStatus::PastDue)),
        StubProvider::listing(),
    );
    let app = routes::app(h.state.clone());
    let lookup = json!({ "address": "1 Main St" });

    let (status, body) = send(&app, json_request("POST", "/api/house", None, lookup.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Authentication required");

    let (status, body) = send(
        &app,
        json_request("POST", "/api/house", Some("Basic Zm9vOmJhcg=="), lookup.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid token");

    let (_, bearer) = h
        .seed_account("pastdue@example.com", Utc::now(), |account| {
            account.subscription_id = Some("sub_pastdue".into());
        })
        .await;
    let (status, body) = send(&app, json_request("POST", "/api/house", Some(&bearer), lookup.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Please subscribe to access house data");

    let (account, bearer) = h
        .seed_account("limited@example.com", Utc::now(), |account| {
            account.subscription_active = true;
            account.monthly_limit = 0;
        })
        .await;
    let (status, body) = send(&app, json_request("POST", "/api/house", Some(&bearer), lookup)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["limit"], 0);
    assert_eq!(body["used"], 0);
    assert_eq!(h.stored(&account).await.usage, ApiUsage::default());
}

#[tokio::test]
async fn subscribed_lookups_are_metered() {
    let h = harness(
        Arc::new(FixedOracle(SubscriptionStatus::Active)),
        StubProvider::listing(),
    );
    let app = routes::app(h.state.clone());

    let register = json!({ "email": "meter@example.com", "password": "long-enough" });
    let (_, body) = send(&app, json_request("POST", "/api/auth/register", None, register)).await;
    let bearer = format!("Bearer {}", body["token"].as_str().unwrap());
    let account_id = body["user"]["id"].as_str().unwrap().to_string();

    let lookup = json!({ "address": "42 Rainey St", "bedrooms": 2, "bathrooms": 1.5 });
    let (status, _) = send(&app, json_request("POST", "/api/house", Some(&bearer), lookup.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let checkout = json!({
        "type": "checkout.session.completed",
        "data": { "object": {
            "customer": "cus_meter",
            "subscription": "sub_meter",
            "metadata": { "accountId": account_id },
        }},
    });
    let (status, body) = send(&app, signed(&checkout)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);

    let (status, body) = send(&app, get_request("/api/auth/check-subscription", Some(&bearer))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hasSubscription"], true);

    let (status, body) = send(&app, json_request("POST", "/api/house", Some(&bearer), lookup.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["fromCache"], false);
    assert_eq!(body["data"]["address"], "42 Rainey St");
    assert_eq!(body["data"]["zipcode"], "78701");

    let (status, body) = send(&app, json_request("POST", "/api/house", Some(&bearer), lookup)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fromCache"], true);

    let (status, body) = send(&app, get_request("/api/user/usage", Some(&bearer))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["usage"]["monthlyRequests"], 2);
    assert_eq!(body["usage"]["totalRequests"], 2);
    assert_eq!(body["remaining"], 98);

    let (status, body) = send(&app, get_request("/api/usage/all", Some(&bearer))).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["provider"], "AirDNA");
    assert_eq!(entries[0]["count"], 1);
}

#[tokio::test]
async fn failed_lookups_do_not_consume_quota() {
    let h = harness(
        Arc::new(FixedOracle(SubscriptionStatus::Active)),
        StubProvider::without_data(),
    );
    let app = routes::app(h.state.clone());
    let (account, bearer) = h
        .seed_account("nodata@example.com", Utc::now(), |account| {
            account.subscription_active = true;
        })
        .await;

    let (status, body) = send(
        &app,
        json_request("POST", "/api/house", Some(&bearer), json!({ "address": "1 Empty Lot" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let (status, _) = send(
        &app,
        json_request("POST", "/api/house", Some(&bearer), json!({ "address": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/api/house")
        .header("authorization", bearer.as_str())
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(h.stored(&account).await.usage, ApiUsage::default());
    let (_, body) = send(&app, get_request("/api/usage/all", Some(&bearer))).await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn usage_report_stays_reachable_when_quota_is_exhausted() {
    let h = harness(
        Arc::new(FixedOracle(SubscriptionStatus::Active)),
        StubProvider::listing(),
    );
    let app = routes::app(h.state.clone());
    let (account, bearer) = h
        .seed_account("exhausted@example.com", Utc::now(), |account| {
            account.subscription_active = true;
        })
        .await;
    h.accounts
        .update_fields(
            account.id,
            AccountPatch {
                monthly_limit: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (status, body) = send(&app, get_request("/api/user/usage", Some(&bearer))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 0);
    assert_eq!(body["remaining"], 0);
}

#[tokio::test]
async fn webhook_requires_a_valid_signature() {
    let h = harness(
        Arc::new(FixedOracle(SubscriptionStatus::Active)),
        StubProvider::listing(),
    );
    let app = routes::app(h.state.clone());
    let event = json!({ "type": "invoice.paid", "data": { "object": {} } });

    let (status, _) = send(&app, webhook_request(&event, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let forged = sign_payload("whsec_other", event.to_string().as_bytes(), Utc::now().timestamp()).unwrap();
    let (status, _) = send(&app, webhook_request(&event, Some(forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, signed(&event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);
}

#[tokio::test]
async fn subscription_deleted_webhook_revokes_access() {
    let h = harness(
        Arc::new(FixedOracle(SubscriptionStatus::Active)),
        StubProvider::listing(),
    );
    let app = routes::app(h.state.clone());
    let (account, bearer) = h
        .seed_account("revoked@example.com", Utc::now(), |account| {
            account.subscription_active = true;
            account.subscription_id = Some("sub_revoked".into());
            account.billing_customer_id = Some("cus_revoked".into());
        })
        .await;

    let deleted = json!({
        "type": "customer.subscription.deleted",
        "data": { "object": { "id": "sub_revoked", "customer": "cus_revoked", "status": "canceled" } },
    });
    let (status, _) = send(&app, signed(&deleted)).await;
    assert_eq!(status, StatusCode::OK);
    let stored = h.stored(&account).await;
    assert!(!stored.subscription_active);
    assert_eq!(stored.subscription_id, None);

    let (status, _) = send(
        &app,
        json_request("POST", "/api/house", Some(&bearer), json!({ "address": "1 Main St" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn subscription_created_webhook_links_account_from_metadata() {
    let h = harness(
        Arc::new(FixedOracle(SubscriptionStatus::Canceled)),
        StubProvider::listing(),
    );
    let app = routes::app(h.state.clone());
    let (account, bearer) = h
        .seed_account("created@example.com", Utc::now(), |_| {})
        .await;

    let created = json!({
        "type": "customer.subscription.created",
        "data": { "object": {
            "id": "sub_created",
            "customer": "cus_created",
            "status": "active",
            "metadata": { "userId": account.id.to_string() },
        }},
    });
    let (status, _) = send(&app, signed(&created)).await;
    assert_eq!(status, StatusCode::OK);
    let stored = h.stored(&account).await;
    assert!(stored.subscription_active);
    assert_eq!(stored.subscription_id.as_deref(), Some("sub_created"));
    assert_eq!(stored.billing_customer_id.as_deref(), Some("cus_created"));

    let (status, _) = send(
        &app,
        json_request("POST", "/api/house", Some(&bearer), json!({ "address": "9 Elm St" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn health_reports_in_memory_storage() {
    let h = harness(
        Arc::new(FixedOracle(SubscriptionStatus::Active)),
        StubProvider::listing(),
    );
    let app = routes::app(h.state);
    let (status, body) = send(&app, get_request("/healthz", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "memory");
}
