use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::oracle::SubscriptionStatus;
use crate::accounts::{Account, AccountPatch, AccountStore, StoreError};
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub secret: String,
    pub tolerance_secs: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("webhook signing secret is not configured")]
    NotConfigured,
    #[error("missing signature header")]
    MissingSignature,
    #[error("malformed signature header")]
    MalformedSignature,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
    #[error("invalid event payload: {0}")]
    Payload(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match self {
            WebhookError::Payload(_) | WebhookError::MissingSignature | WebhookError::MalformedSignature => {
                StatusCode::BAD_REQUEST
            }
            WebhookError::NotConfigured | WebhookError::Expired | WebhookError::Mismatch => {
                StatusCode::UNAUTHORIZED
            }
        };
        warn!(error = %self, "billing webhook rejected");
        (status, format!("Webhook Error: {self}")).into_response()
    }
}

/// Checks a `t=<unix>,v1=<hex>` signature header against `"{t}.{body}"`.
pub fn verify_signature(
    config: &WebhookConfig,
    header: &str,
    body: &[u8],
    now_unix: i64,
) -> Result<(), WebhookError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(WebhookError::MalformedSignature)?;
    if candidates.is_empty() {
        return Err(WebhookError::MalformedSignature);
    }
    if (now_unix - timestamp).abs() > config.tolerance_secs {
        return Err(WebhookError::Expired);
    }

    let matched = candidates.into_iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(config.secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    });
    if matched {
        Ok(())
    } else {
        Err(WebhookError::Mismatch)
    }
}

/// Produces a header value accepted by [`verify_signature`].
pub fn sign_payload(
    secret: &str,
    body: &[u8],
    timestamp: i64,
) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes())))
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    kind: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: Value,
}

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    customer: Option<String>,
    subscription: Option<String>,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Option<String>,
    status: SubscriptionStatus,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct DeletedSubscription {
    customer: Option<String>,
    #[serde(default)]
    metadata: Value,
}

/// Billing events that touch the subscription fields of an account.
///
/// `account_hint` comes from `metadata.accountId` (or the older `metadata.userId`) and is
/// used when no account is linked to the billing customer yet.
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    CheckoutCompleted {
        customer_id: Option<String>,
        subscription_id: Option<String>,
        account_hint: Option<Uuid>,
    },
    /// `customer.subscription.created` and `customer.subscription.updated`.
    SubscriptionUpdated {
        customer_id: Option<String>,
        subscription_id: String,
        status: SubscriptionStatus,
        account_hint: Option<Uuid>,
    },
    SubscriptionDeleted {
        customer_id: Option<String>,
        account_hint: Option<Uuid>,
    },
    Ignored(String),
}

fn account_hint(metadata: &Value) -> Option<Uuid> {
    ["accountId", "userId"]
        .iter()
        .filter_map(|key| metadata.get(*key).and_then(Value::as_str))
        .find_map(|raw| Uuid::parse_str(raw).ok())
}

fn decode<T: serde::de::DeserializeOwned>(object: Value) -> Result<T, WebhookError> {
    serde_json::from_value(object).map_err(|err| WebhookError::Payload(err.to_string()))
}

pub fn parse_event(body: &[u8]) -> Result<BillingEvent, WebhookError> {
    let envelope: EventEnvelope =
        serde_json::from_slice(body).map_err(|err| WebhookError::Payload(err.to_string()))?;
    let object = envelope.data.object;
    let event = match envelope.kind.as_str() {
        "checkout.session.completed" => {
            let session: CheckoutSession = decode(object)?;
            BillingEvent::CheckoutCompleted {
                account_hint: account_hint(&session.metadata),
                customer_id: session.customer,
                subscription_id: session.subscription,
            }
        }
        "customer.subscription.created" | "customer.subscription.updated" => {
            let subscription: SubscriptionObject = decode(object)?;
            BillingEvent::SubscriptionUpdated {
                account_hint: account_hint(&subscription.metadata),
                customer_id: subscription.customer,
                subscription_id: subscription.id,
                status: subscription.status,
            }
        }
        "customer.subscription.deleted" => {
            let subscription: DeletedSubscription = decode(object)?;
            BillingEvent::SubscriptionDeleted {
                account_hint: account_hint(&subscription.metadata),
                customer_id: subscription.customer,
            }
        }
        other => BillingEvent::Ignored(other.to_string()),
    };
    Ok(event)
}

/// Finds the account by billing customer, falling back to the metadata hint.
async fn locate_account(
    accounts: &dyn AccountStore,
    customer_id: Option<&str>,
    hint: Option<Uuid>,
) -> Result<Option<Account>, StoreError> {
    if let Some(customer) = customer_id {
        if let Some(account) = accounts.find_by_billing_customer(customer).await? {
            return Ok(Some(account));
        }
    }
    match hint {
        Some(id) => accounts.find_by_id(id).await,
        None => Ok(None),
    }
}

/// Links the billing customer when the account was only found through the hint.
fn customer_link(account: &Account, customer_id: Option<String>) -> Option<Option<String>> {
    match customer_id {
        Some(customer) if account.billing_customer_id.as_deref() != Some(customer.as_str()) => {
            Some(Some(customer))
        }
        _ => None,
    }
}

/// Applies `event` to the matching account. Returns the id of the account that changed.
pub async fn apply_event(
    accounts: &dyn AccountStore,
    event: BillingEvent,
) -> Result<Option<Uuid>, StoreError> {
    match event {
        BillingEvent::CheckoutCompleted {
            customer_id,
            subscription_id,
            account_hint,
        } => {
            let Some(account) =
                locate_account(accounts, customer_id.as_deref(), account_hint).await?
            else {
                warn!(?customer_id, "checkout completed for unknown account");
                return Ok(None);
            };
            let patch = AccountPatch {
                subscription_active: Some(true),
                subscription_id: subscription_id.map(Some),
                billing_customer_id: customer_link(&account, customer_id),
                ..Default::default()
            };
            accounts.update_fields(account.id, patch).await?;
            info!(account_id = %account.id, "subscription activated");
            Ok(Some(account.id))
        }
        BillingEvent::SubscriptionUpdated {
            customer_id,
            subscription_id,
            status,
            account_hint,
        } => {
            let Some(account) =
                locate_account(accounts, customer_id.as_deref(), account_hint).await?
            else {
                warn!(?customer_id, %subscription_id, "subscription event for unknown account");
                return Ok(None);
            };
            let active = status.grants_access();
            let patch = AccountPatch {
                subscription_active: Some(active),
                subscription_id: Some(Some(subscription_id)),
                billing_customer_id: customer_link(&account, customer_id),
                ..Default::default()
            };
            accounts.update_fields(account.id, patch).await?;
            info!(account_id = %account.id, ?status, active, "subscription updated");
            Ok(Some(account.id))
        }
        BillingEvent::SubscriptionDeleted {
            customer_id,
            account_hint,
        } => {
            let Some(account) =
                locate_account(accounts, customer_id.as_deref(), account_hint).await?
            else {
                return Ok(None);
            };
            // Clearing the reference keeps the gate from asking the oracle about a dead subscription.
            let patch = AccountPatch {
                subscription_active: Some(false),
                subscription_id: Some(None),
                ..Default::default()
            };
            accounts.update_fields(account.id, patch).await?;
            info!(account_id = %account.id, "subscription deactivated");
            Ok(Some(account.id))
        }
        BillingEvent::Ignored(_) => Ok(None),
    }
}

pub async fn billing_webhook(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, WebhookError> {
    let config = state.webhook.as_ref().ok_or(WebhookError::NotConfigured)?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .ok_or(WebhookError::MissingSignature)?
        .to_str()
        .map_err(|_| WebhookError::MalformedSignature)?;
    verify_signature(config, signature, &body, Utc::now().timestamp())?;

    let event = parse_event(&body)?;
    if let BillingEvent::Ignored(kind) = &event {
        info!(%kind, "ignoring billing event");
    } else if let Err(err) = apply_event(state.accounts.as_ref(), event).await {
        // Acknowledge anyway; the provider retries only on signature failures.
        error!(?err, "failed to apply billing event");
    }
    Ok(Json(json!({ "received": true })))
}
