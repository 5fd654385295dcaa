use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::accounts::{MonthTag, StoreResult};
use crate::ledger::{UsageLedger, UsageLedgerEntry};

// key: usage-ledger-db -> api_usage upsert-increment
#[derive(Clone)]
pub struct PgUsageLedger {
    pool: PgPool,
}

impl PgUsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> UsageLedgerEntry {
    let month: String = row.get("month");
    UsageLedgerEntry {
        provider: row.get("provider"),
        month: MonthTag::from_stored(month),
        count: row.get("count"),
        last_updated: row.get("last_updated"),
    }
}

#[async_trait]
impl UsageLedger for PgUsageLedger {
    async fn increment(
        &self,
        provider: &str,
        month: &MonthTag,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageLedgerEntry> {
        let row = sqlx::query(
            r#"
            INSERT INTO api_usage (provider, month, count, last_updated)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (provider, month)
            DO UPDATE SET
                count = api_usage.count + 1,
                last_updated = EXCLUDED.last_updated
            RETURNING provider, month, count, last_updated
            "#,
        )
        .bind(provider)
        .bind(month.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(entry_from_row(&row))
    }

    async fn entry(&self, provider: &str, month: &MonthTag) -> StoreResult<Option<UsageLedgerEntry>> {
        let row = sqlx::query(
            "SELECT provider, month, count, last_updated FROM api_usage WHERE provider = $1 AND month = $2",
        )
        .bind(provider)
        .bind(month.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(entry_from_row))
    }

    async fn entries_for(&self, provider: &str) -> StoreResult<Vec<UsageLedgerEntry>> {
        let rows = sqlx::query(
            "SELECT provider, month, count, last_updated FROM api_usage WHERE provider = $1 ORDER BY month DESC",
        )
        .bind(provider)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(entry_from_row).collect())
    }
}
