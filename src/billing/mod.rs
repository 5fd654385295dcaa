pub mod oracle;
pub mod webhook;

pub use oracle::{
    BillingStatusOracle, DisabledOracle, OracleError, StripeStatusOracle, SubscriptionStatus,
};
pub use webhook::{
    apply_event, billing_webhook, parse_event, sign_payload, verify_signature, BillingEvent,
    WebhookConfig, WebhookError,
};
