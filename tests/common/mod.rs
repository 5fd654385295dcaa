#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use rental_api::accounts::{Account, AccountStore, MemoryAccountStore};
use rental_api::billing::{BillingStatusOracle, OracleError, SubscriptionStatus, WebhookConfig};
use rental_api::extractor::TokenKeys;
use rental_api::houses::{MemoryHouseStore, RentalLookupService};
use rental_api::ledger::MemoryUsageLedger;
use rental_api::lookup::{LookupError, LookupProvider, LookupRequest, ProviderListing};
use rental_api::{AccessGate, AppState};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub const PROVIDER: &str = "AirDNA";
pub const WEBHOOK_SECRET: &str = "whsec_test";

pub struct FixedOracle(pub SubscriptionStatus);

#[async_trait]
impl BillingStatusOracle for FixedOracle {
    async fn subscription_status(&self, _id: &str) -> Result<SubscriptionStatus, OracleError> {
        Ok(self.0)
    }
}

/// Answers every address with the same listing; optionally reports no comparable data.
pub struct StubProvider {
    pub calls: AtomicUsize,
    pub no_data: bool,
}

impl StubProvider {
    pub fn listing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            no_data: false,
        })
    }

    pub fn without_data() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            no_data: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LookupProvider for StubProvider {
    async fn lookup(&self, request: &LookupRequest) -> Result<ProviderListing, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent lookups interleave on the runtime.
        tokio::task::yield_now().await;
        if self.no_data {
            return Err(LookupError::NoComparableData);
        }
        Ok(ProviderListing {
            address: request.address.to_uppercase(),
            zipcode: Some("78701".into()),
            bedrooms: request.bedrooms,
            bathrooms: request.bathrooms,
            accommodates: request.accommodates,
            adr: Some(185.0),
            revenue: Some(41_250.0),
            occupancy: Some(0.64),
        })
    }
}

pub struct Harness {
    pub state: AppState,
    pub accounts: Arc<MemoryAccountStore>,
    pub ledger: Arc<MemoryUsageLedger>,
    pub tokens: Arc<TokenKeys>,
}

pub fn harness(
    oracle: Arc<dyn BillingStatusOracle>,
    provider: Arc<dyn LookupProvider>,
) -> Harness {
    let accounts = Arc::new(MemoryAccountStore::new());
    let ledger = Arc::new(MemoryUsageLedger::new());
    let tokens = Arc::new(TokenKeys::new(
        b"integration-secret",
        chrono::Duration::hours(1),
    ));
    let gate = Arc::new(AccessGate::new(
        accounts.clone(),
        oracle,
        tokens.clone(),
        Duration::from_millis(200),
    ));
    let lookups = Arc::new(RentalLookupService::new(
        Arc::new(MemoryHouseStore::new()),
        provider,
        ledger.clone(),
        PROVIDER,
        Duration::from_secs(2),
    ));
    let state = AppState {
        accounts: accounts.clone(),
        ledger: ledger.clone(),
        gate,
        lookups,
        tokens: tokens.clone(),
        webhook: Some(WebhookConfig {
            secret: WEBHOOK_SECRET.into(),
            tolerance_secs: 300,
        }),
        default_monthly_limit: 100,
        database: None,
    };
    Harness {
        state,
        accounts,
        ledger,
        tokens,
    }
}

impl Harness {
    /// Stores an account built by `edit` and returns it with a ready `Authorization` value.
    pub async fn seed_account(
        &self,
        email: &str,
        created_at: DateTime<Utc>,
        edit: impl FnOnce(&mut Account),
    ) -> (Account, String) {
        let mut account = Account::new(None, email, "unused-hash".into(), 100, created_at);
        edit(&mut account);
        self.accounts.insert(&account).await.unwrap();
        let token = self
            .tokens
            .issue(account.id, &account.email, Utc::now())
            .unwrap();
        (account, format!("Bearer {token}"))
    }

    pub async fn stored(&self, account: &Account) -> Account {
        self.accounts.find_by_id(account.id).await.unwrap().unwrap()
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = serde_json::from_slice(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
    (status, value)
}

pub fn json_request(method: &str, uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(bearer) = bearer {
        builder = builder.header("authorization", bearer);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get_request(uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(bearer) = bearer {
        builder = builder.header("authorization", bearer);
    }
    builder.body(Body::empty()).unwrap()
}
