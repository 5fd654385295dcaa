//! Two-phase access gate in front of metered operations.
//!
//! [`AccessGate::authorize`] runs before the operation: it authenticates the bearer token,
//! resolves subscription state (cached flag first, billing oracle as fallback) and checks the
//! monthly quota. [`AccessGate::record_usage`] runs after the operation with an explicit
//! [`OperationOutcome`] and counts the call only when it succeeded.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::accounts::{Account, AccountPatch, AccountStore, MonthTag, StoreError};
use crate::billing::{BillingStatusOracle, OracleError, SubscriptionStatus};
use crate::extractor::{parse_bearer, BearerError, TokenKeys};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateRejection {
    #[error("authentication required")]
    Unauthenticated,
    #[error("invalid token")]
    InvalidCredential,
    #[error("subscription required")]
    SubscriptionRequired,
    #[error("monthly limit of {limit} requests exceeded ({used} used)")]
    QuotaExceeded { limit: i64, used: i64 },
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            GateRejection::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                json!({ "success": false, "error": "Authentication required" }),
            ),
            GateRejection::InvalidCredential => (
                StatusCode::UNAUTHORIZED,
                json!({ "success": false, "error": "Invalid token" }),
            ),
            GateRejection::SubscriptionRequired => (
                StatusCode::FORBIDDEN,
                json!({
                    "success": false,
                    "error": "Subscription required",
                    "message": "Please subscribe to access house data",
                }),
            ),
            GateRejection::QuotaExceeded { limit, used } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "success": false,
                    "error": "Monthly limit exceeded",
                    "message": format!("You have exceeded your monthly limit of {limit} requests"),
                    "limit": limit,
                    "used": used,
                }),
            ),
            GateRejection::UpstreamUnavailable(detail) => {
                error!(%detail, "access gate could not complete");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "success": false, "error": "Server error during authentication" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Result of the protected operation, handed from the handler to the recording step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationOutcome {
    status: StatusCode,
}

impl OperationOutcome {
    pub fn from_status(status: StatusCode) -> Self {
        Self { status }
    }

    pub fn succeeded() -> Self {
        Self::from_status(StatusCode::OK)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Admission produced by [`AccessGate::authorize`]; lives for one request only.
#[derive(Debug, Clone)]
pub struct GateGrant {
    pub account: Account,
    pub month: MonthTag,
    pub effective_monthly_requests: i64,
}

impl GateGrant {
    pub fn remaining(&self) -> i64 {
        (self.account.monthly_limit - self.effective_monthly_requests).max(0)
    }
}

/// How the subscription of an account was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionCheck {
    /// Cached flag was already set.
    Active,
    /// Oracle confirmed access and the cached flag was flipped on.
    Activated,
    /// Oracle reported a state that does not grant access.
    Inactive(SubscriptionStatus),
    /// No subscription reference on file.
    Missing,
    /// Oracle could not be reached or timed out.
    OracleFailed,
}

impl SubscriptionCheck {
    pub fn grants_access(&self) -> bool {
        matches!(self, SubscriptionCheck::Active | SubscriptionCheck::Activated)
    }
}

/// key: access-gate -> authorize,record-usage
#[derive(Clone)]
pub struct AccessGate {
    accounts: Arc<dyn AccountStore>,
    oracle: Arc<dyn BillingStatusOracle>,
    tokens: Arc<TokenKeys>,
    oracle_timeout: Duration,
}

impl AccessGate {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        oracle: Arc<dyn BillingStatusOracle>,
        tokens: Arc<TokenKeys>,
        oracle_timeout: Duration,
    ) -> Self {
        Self {
            accounts,
            oracle,
            tokens,
            oracle_timeout,
        }
    }

    /// Resolves the account behind a raw `Authorization` header value.
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Account, GateRejection> {
        let token = parse_bearer(authorization).map_err(|err| match err {
            BearerError::Missing => GateRejection::Unauthenticated,
            BearerError::Malformed => GateRejection::InvalidCredential,
        })?;
        let claims = self.tokens.verify(token).map_err(|err| {
            debug!(?err, "bearer token rejected");
            GateRejection::InvalidCredential
        })?;
        self.accounts
            .find_by_id(claims.sub)
            .await
            .map_err(|err| GateRejection::UpstreamUnavailable(err.to_string()))?
            .ok_or(GateRejection::Unauthenticated)
    }

    /// Trusts the cached flag, otherwise asks the billing oracle and caches a positive answer.
    pub async fn resolve_subscription(
        &self,
        account: &mut Account,
    ) -> Result<SubscriptionCheck, GateRejection> {
        if account.subscription_active {
            return Ok(SubscriptionCheck::Active);
        }
        let Some(subscription_id) = account.subscription_id.clone() else {
            return Ok(SubscriptionCheck::Missing);
        };

        let status = match tokio::time::timeout(
            self.oracle_timeout,
            self.oracle.subscription_status(&subscription_id),
        )
        .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                warn!(?err, account_id = %account.id, "subscription status check failed");
                return Ok(SubscriptionCheck::OracleFailed);
            }
            Err(_) => {
                let err = OracleError::Timeout(self.oracle_timeout);
                warn!(?err, account_id = %account.id, "subscription status check timed out");
                return Ok(SubscriptionCheck::OracleFailed);
            }
        };

        if !status.grants_access() {
            debug!(account_id = %account.id, ?status, "subscription does not grant access");
            return Ok(SubscriptionCheck::Inactive(status));
        }

        self.accounts
            .update_fields(
                account.id,
                AccountPatch {
                    subscription_active: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| GateRejection::UpstreamUnavailable(err.to_string()))?;
        account.subscription_active = true;
        info!(account_id = %account.id, ?status, "subscription flag refreshed from billing provider");
        Ok(SubscriptionCheck::Activated)
    }

    /// Authentication, subscription and quota checks. Never touches usage counters.
    pub async fn authorize(
        &self,
        authorization: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<GateGrant, GateRejection> {
        let mut account = self.authenticate(authorization).await?;

        if !self.resolve_subscription(&mut account).await?.grants_access() {
            return Err(GateRejection::SubscriptionRequired);
        }

        // A stale month counts as zero here; the reset is written with the next increment.
        let month = MonthTag::of(now);
        let used = account.usage.effective_monthly_requests(&month);
        if used >= account.monthly_limit {
            info!(account_id = %account.id, used, limit = account.monthly_limit, "monthly quota exhausted");
            return Err(GateRejection::QuotaExceeded {
                limit: account.monthly_limit,
                used,
            });
        }

        Ok(GateGrant {
            account,
            month,
            effective_monthly_requests: used,
        })
    }

    /// Counts the call for successful outcomes. Failures here are logged, never surfaced.
    pub async fn record_usage(&self, grant: &GateGrant, outcome: OperationOutcome, now: DateTime<Utc>) {
        if !outcome.is_success() {
            debug!(
                account_id = %grant.account.id,
                status = %outcome.status(),
                "operation failed; usage not recorded"
            );
            return;
        }

        let account_id = grant.account.id;
        match self.accounts.record_usage(account_id, now).await {
            Ok(usage) => debug!(
                %account_id,
                monthly_requests = usage.monthly_requests,
                total_requests = usage.total_requests,
                "usage recorded"
            ),
            Err(StoreError::AccountNotFound(_)) => {
                warn!(%account_id, "account vanished before usage could be recorded")
            }
            Err(err) => error!(?err, %account_id, "failed to persist usage counters"),
        }
    }
}
