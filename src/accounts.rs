//! Account records with embedded usage counters and the store seam they live behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Calendar month in UTC, rendered as `YYYY-MM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonthTag(String);

impl MonthTag {
    pub fn of(now: DateTime<Utc>) -> Self {
        Self(now.format("%Y-%m").to_string())
    }

    /// Wraps an already formatted tag, e.g. one read back from storage.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonthTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-account usage block. `monthly_requests` only counts toward `current_month`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiUsage {
    pub monthly_requests: i64,
    pub current_month: Option<MonthTag>,
    pub total_requests: i64,
    #[serde(rename = "lastRequestDate")]
    pub last_request_at: Option<DateTime<Utc>>,
}

impl ApiUsage {
    /// Monthly count as seen from `month`; a stale tag reads as zero.
    pub fn effective_monthly_requests(&self, month: &MonthTag) -> i64 {
        match &self.current_month {
            Some(current) if current == month => self.monthly_requests,
            _ => 0,
        }
    }

    /// View of the block with any pending rollover applied, without counting a call.
    pub fn rolled_over(&self, month: &MonthTag) -> ApiUsage {
        ApiUsage {
            monthly_requests: self.effective_monthly_requests(month),
            current_month: Some(month.clone()),
            total_requests: self.total_requests,
            last_request_at: self.last_request_at,
        }
    }

    /// Counts one successful call at `now`, resetting the monthly counter first when the
    /// month has turned.
    pub fn record(&mut self, now: DateTime<Utc>) {
        let month = MonthTag::of(now);
        if self.current_month.as_ref() != Some(&month) {
            self.monthly_requests = 0;
            self.current_month = Some(month);
        }
        self.monthly_requests += 1;
        self.total_requests += 1;
        self.last_request_at = Some(now);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: Uuid,
    pub name: Option<String>,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub billing_customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub subscription_active: bool,
    pub usage: ApiUsage,
    pub monthly_limit: i64,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        name: Option<String>,
        email: &str,
        password_hash: String,
        monthly_limit: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            email: normalize_email(email),
            password_hash,
            billing_customer_id: None,
            subscription_id: None,
            subscription_active: false,
            usage: ApiUsage::default(),
            monthly_limit,
            created_at: now,
        }
    }

    pub fn remaining_requests(&self, month: &MonthTag) -> i64 {
        (self.monthly_limit - self.usage.effective_monthly_requests(month)).max(0)
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Field-level update. `None` leaves a field untouched. Usage counters are only written
/// through [`AccountStore::record_usage`].
#[derive(Debug, Clone, Default)]
pub struct AccountPatch {
    pub subscription_active: Option<bool>,
    pub subscription_id: Option<Option<String>>,
    pub billing_customer_id: Option<Option<String>>,
    pub monthly_limit: Option<i64>,
}

impl AccountPatch {
    pub fn is_empty(&self) -> bool {
        self.subscription_active.is_none()
            && self.subscription_id.is_none()
            && self.billing_customer_id.is_none()
            && self.monthly_limit.is_none()
    }

    pub fn apply(self, account: &mut Account) {
        if let Some(active) = self.subscription_active {
            account.subscription_active = active;
        }
        if let Some(subscription_id) = self.subscription_id {
            account.subscription_id = subscription_id;
        }
        if let Some(customer) = self.billing_customer_id {
            account.billing_customer_id = customer;
        }
        if let Some(limit) = self.monthly_limit {
            account.monthly_limit = limit;
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("account {0} not found")]
    AccountNotFound(Uuid),
    #[error("email already registered")]
    DuplicateEmail,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// key: account-store -> persisted accounts
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Account>>;
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Account>>;
    async fn find_by_billing_customer(&self, customer_id: &str) -> StoreResult<Option<Account>>;
    /// Creates a new account, refusing duplicate emails.
    async fn insert(&self, account: &Account) -> StoreResult<()>;
    /// Upserts the full document.
    async fn save(&self, account: &Account) -> StoreResult<()>;
    async fn update_fields(&self, id: Uuid, patch: AccountPatch) -> StoreResult<()>;
    /// Counts one successful call in a single atomic step (rollover included) and returns
    /// the resulting usage block.
    async fn record_usage(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<ApiUsage>;
}

/// Process-local account store used by tests and database-less runs.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: DashMap<Uuid, Account>,
    emails: DashMap<String, Uuid>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Account>> {
        Ok(self.accounts.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let Some(id) = self.emails.get(&normalize_email(email)).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        self.find_by_id(id).await
    }

    async fn find_by_billing_customer(&self, customer_id: &str) -> StoreResult<Option<Account>> {
        Ok(self
            .accounts
            .iter()
            .find(|entry| entry.billing_customer_id.as_deref() == Some(customer_id))
            .map(|entry| entry.value().clone()))
    }

    async fn insert(&self, account: &Account) -> StoreResult<()> {
        // The email slot stays locked until the account is in place.
        match self.emails.entry(account.email.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateEmail),
            Entry::Vacant(slot) => {
                self.accounts.insert(account.id, account.clone());
                slot.insert(account.id);
                Ok(())
            }
        }
    }

    async fn save(&self, account: &Account) -> StoreResult<()> {
        match self.emails.entry(account.email.clone()) {
            Entry::Occupied(owner) if *owner.get() != account.id => {
                return Err(StoreError::DuplicateEmail)
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(account.id);
            }
        }
        if let Some(previous) = self.accounts.insert(account.id, account.clone()) {
            if previous.email != account.email {
                self.emails.remove(&previous.email);
            }
        }
        Ok(())
    }

    async fn update_fields(&self, id: Uuid, patch: AccountPatch) -> StoreResult<()> {
        let mut entry = self
            .accounts
            .get_mut(&id)
            .ok_or(StoreError::AccountNotFound(id))?;
        patch.apply(entry.value_mut());
        Ok(())
    }

    async fn record_usage(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<ApiUsage> {
        let mut entry = self
            .accounts
            .get_mut(&id)
            .ok_or(StoreError::AccountNotFound(id))?;
        let usage = &mut entry.value_mut().usage;
        usage.record(now);
        Ok(usage.clone())
    }
}
