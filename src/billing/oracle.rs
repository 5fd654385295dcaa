use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Subscription lifecycle states reported by the billing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    pub fn grants_access(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("billing provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("billing provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("billing provider is not configured")]
    NotConfigured,
    #[error("invalid billing provider base url: {0}")]
    InvalidBase(String),
}

/// key: billing-oracle -> authoritative subscription state
#[async_trait]
pub trait BillingStatusOracle: Send + Sync {
    async fn subscription_status(&self, subscription_id: &str)
        -> Result<SubscriptionStatus, OracleError>;
}

/// Queries subscription state from the Stripe REST API.
pub struct StripeStatusOracle {
    base: Url,
    secret_key: String,
    client: Client,
}

#[derive(Deserialize)]
struct SubscriptionObject {
    status: SubscriptionStatus,
}

impl StripeStatusOracle {
    pub fn new(
        base: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, OracleError> {
        let base = base.into();
        let parsed = Url::parse(&base).map_err(|err| OracleError::InvalidBase(format!("{base}: {err}")))?;
        if parsed.cannot_be_a_base() {
            return Err(OracleError::InvalidBase(base));
        }
        Ok(Self {
            base: parsed,
            secret_key: secret_key.into(),
            client: Client::builder().timeout(timeout).build()?,
        })
    }

    /// `{base}/v1/subscriptions/{id}` with the id percent-encoded as a single path segment.
    fn subscription_url(&self, subscription_id: &str) -> Result<Url, OracleError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| OracleError::InvalidBase(self.base.to_string()))?
            .pop_if_empty()
            .extend(["v1", "subscriptions", subscription_id]);
        Ok(url)
    }
}

#[async_trait]
impl BillingStatusOracle for StripeStatusOracle {
    async fn subscription_status(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionStatus, OracleError> {
        let url = self.subscription_url(subscription_id)?;
        let subscription: SubscriptionObject = self
            .client
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(subscription.status)
    }
}

/// Stand-in used when no billing credentials are configured; every check fails closed.
pub struct DisabledOracle;

#[async_trait]
impl BillingStatusOracle for DisabledOracle {
    async fn subscription_status(&self, _subscription_id: &str) -> Result<SubscriptionStatus, OracleError> {
        Err(OracleError::NotConfigured)
    }
}
