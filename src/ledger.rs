//! Provider-wide monthly call counts, kept apart from the per-account counters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::accounts::{MonthTag, StoreResult};

/// key: usage-ledger-model -> (provider, month) aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLedgerEntry {
    pub provider: String,
    pub month: MonthTag,
    pub count: i64,
    pub last_updated: DateTime<Utc>,
}

#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Adds one call to the `(provider, month)` entry, creating it on first use. Must be a
    /// single atomic step at the storage layer.
    async fn increment(
        &self,
        provider: &str,
        month: &MonthTag,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageLedgerEntry>;

    async fn entry(&self, provider: &str, month: &MonthTag) -> StoreResult<Option<UsageLedgerEntry>>;

    /// All months recorded for `provider`, newest first.
    async fn entries_for(&self, provider: &str) -> StoreResult<Vec<UsageLedgerEntry>>;
}

#[derive(Default)]
pub struct MemoryUsageLedger {
    entries: DashMap<(String, MonthTag), UsageLedgerEntry>,
}

impl MemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageLedger for MemoryUsageLedger {
    async fn increment(
        &self,
        provider: &str,
        month: &MonthTag,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageLedgerEntry> {
        // The shard write lock held by `entry` makes the read-increment indivisible.
        let entry = self
            .entries
            .entry((provider.to_string(), month.clone()))
            .and_modify(|entry| {
                entry.count += 1;
                entry.last_updated = now;
            })
            .or_insert_with(|| UsageLedgerEntry {
                provider: provider.to_string(),
                month: month.clone(),
                count: 1,
                last_updated: now,
            });
        Ok(entry.value().clone())
    }

    async fn entry(&self, provider: &str, month: &MonthTag) -> StoreResult<Option<UsageLedgerEntry>> {
        Ok(self
            .entries
            .get(&(provider.to_string(), month.clone()))
            .map(|entry| entry.value().clone()))
    }

    async fn entries_for(&self, provider: &str) -> StoreResult<Vec<UsageLedgerEntry>> {
        let mut entries: Vec<UsageLedgerEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.provider == provider)
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| b.month.cmp(&a.month));
        Ok(entries)
    }
}
