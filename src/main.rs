use anyhow::Context;
use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use rental_api::accounts::AccountStore;
use rental_api::billing::{BillingStatusOracle, DisabledOracle, StripeStatusOracle, WebhookConfig};
use rental_api::db::Database;
use rental_api::extractor::TokenKeys;
use rental_api::houses::RentalLookupService;
use rental_api::ledger::UsageLedger;
use rental_api::lookup::AirDnaClient;
use rental_api::{config, routes, AccessGate, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();

    let database = Database::connect(config::DATABASE_URL.as_str(), *config::DATABASE_MAX_CONNECTIONS)
        .await
        .context("connecting to database")?;
    if let Err(error) = database.migrate().await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error).context("running database migrations");
        }
    }

    let timeout = *config::UPSTREAM_TIMEOUT;
    let tokens = Arc::new(TokenKeys::new(
        config::JWT_SECRET.as_bytes(),
        chrono::Duration::hours(*config::JWT_TTL_HOURS),
    ));
    let accounts: Arc<dyn AccountStore> = Arc::new(database.accounts());
    let ledger: Arc<dyn UsageLedger> = Arc::new(database.usage_ledger());
    let oracle: Arc<dyn BillingStatusOracle> = match config::STRIPE_SECRET_KEY.as_deref() {
        Some(key) => Arc::new(StripeStatusOracle::new(
            config::STRIPE_API_BASE.as_str(),
            key,
            timeout,
        )?),
        None => {
            tracing::warn!("STRIPE_SECRET_KEY not set; subscription fallback checks will fail closed");
            Arc::new(DisabledOracle)
        }
    };
    let airdna_key = config::AIRDNA_API_KEY.clone().unwrap_or_else(|| {
        tracing::warn!("AIRDNA_API_KEY not set; rental lookups will be rejected upstream");
        String::new()
    });
    let provider = Arc::new(AirDnaClient::new(
        config::AIRDNA_API_BASE.as_str(),
        airdna_key,
        timeout,
    )?);
    let webhook = config::STRIPE_WEBHOOK_SECRET
        .clone()
        .map(|secret| WebhookConfig {
            secret,
            tolerance_secs: *config::STRIPE_WEBHOOK_TOLERANCE_SECS,
        });
    if webhook.is_none() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set; billing webhooks will be refused");
    }

    let gate = Arc::new(AccessGate::new(
        accounts.clone(),
        oracle,
        tokens.clone(),
        timeout,
    ));
    let lookups = Arc::new(RentalLookupService::new(
        Arc::new(database.houses()),
        provider,
        ledger.clone(),
        config::LOOKUP_PROVIDER_NAME.as_str(),
        timeout,
    ));
    let state = AppState {
        accounts,
        ledger,
        gate,
        lookups,
        tokens,
        webhook,
        default_monthly_limit: *config::DEFAULT_MONTHLY_LIMIT,
        database: Some(database),
    };

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(routes::app(state))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("parsing bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
