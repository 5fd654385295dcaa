use std::sync::Arc;

use crate::accounts::AccountStore;
use crate::billing::{BillingStatusOracle, WebhookConfig};
use crate::db::Database;
use crate::extractor::TokenKeys;
use crate::gate::AccessGate;
use crate::houses::RentalLookupService;
use crate::ledger::UsageLedger;

/// Handles shared by every request. Built once at startup and injected as an `Extension`.
#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<dyn AccountStore>,
    pub ledger: Arc<dyn UsageLedger>,
    pub gate: Arc<AccessGate>,
    pub lookups: Arc<RentalLookupService>,
    pub tokens: Arc<TokenKeys>,
    pub webhook: Option<WebhookConfig>,
    pub default_monthly_limit: i64,
    /// `None` when running on in-memory stores.
    pub database: Option<Database>,
}
