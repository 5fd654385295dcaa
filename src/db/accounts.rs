use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::accounts::{
    Account, AccountPatch, AccountStore, ApiUsage, MonthTag, StoreError, StoreResult,
};

const ACCOUNT_COLUMNS: &str = r#"
    id,
    name,
    email,
    password_hash,
    billing_customer_id,
    subscription_id,
    subscription_active,
    monthly_requests,
    current_month,
    total_requests,
    last_request_at,
    monthly_limit,
    created_at
"#;

// key: account-db -> accounts table
#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_one(&self, filter: &str, value: &str) -> StoreResult<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {filter} = $1 LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(account_from_row))
    }
}

fn account_from_row(row: &PgRow) -> Account {
    let current_month: Option<String> = row.get("current_month");
    Account {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        billing_customer_id: row.get("billing_customer_id"),
        subscription_id: row.get("subscription_id"),
        subscription_active: row.get("subscription_active"),
        usage: ApiUsage {
            monthly_requests: row.get("monthly_requests"),
            current_month: current_month.map(MonthTag::from_stored),
            total_requests: row.get("total_requests"),
            last_request_at: row.get("last_request_at"),
        },
        monthly_limit: row.get("monthly_limit"),
        created_at: row.get("created_at"),
    }
}

fn map_unique_violation(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.constraint() == Some("accounts_email_key") {
            return StoreError::DuplicateEmail;
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(account_from_row))
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        self.find_one("email", &crate::accounts::normalize_email(email))
            .await
    }

    async fn find_by_billing_customer(&self, customer_id: &str) -> StoreResult<Option<Account>> {
        self.find_one("billing_customer_id", customer_id).await
    }

    async fn insert(&self, account: &Account) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, name, email, password_hash, billing_customer_id, subscription_id,
                subscription_active, monthly_requests, current_month, total_requests,
                last_request_at, monthly_limit, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(account.id)
        .bind(&account.name)
        .bind(&account.email)
        .bind(&account.password_hash)
        .bind(&account.billing_customer_id)
        .bind(&account.subscription_id)
        .bind(account.subscription_active)
        .bind(account.usage.monthly_requests)
        .bind(account.usage.current_month.as_ref().map(MonthTag::as_str))
        .bind(account.usage.total_requests)
        .bind(account.usage.last_request_at)
        .bind(account.monthly_limit)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_unique_violation)?;
        Ok(())
    }

    async fn save(&self, account: &Account) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, name, email, password_hash, billing_customer_id, subscription_id,
                subscription_active, monthly_requests, current_month, total_requests,
                last_request_at, monthly_limit, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id)
            DO UPDATE SET
                name = EXCLUDED.name,
                email = EXCLUDED.email,
                password_hash = EXCLUDED.password_hash,
                billing_customer_id = EXCLUDED.billing_customer_id,
                subscription_id = EXCLUDED.subscription_id,
                subscription_active = EXCLUDED.subscription_active,
                monthly_requests = EXCLUDED.monthly_requests,
                current_month = EXCLUDED.current_month,
                total_requests = EXCLUDED.total_requests,
                last_request_at = EXCLUDED.last_request_at,
                monthly_limit = EXCLUDED.monthly_limit
            "#,
        )
        .bind(account.id)
        .bind(&account.name)
        .bind(&account.email)
        .bind(&account.password_hash)
        .bind(&account.billing_customer_id)
        .bind(&account.subscription_id)
        .bind(account.subscription_active)
        .bind(account.usage.monthly_requests)
        .bind(account.usage.current_month.as_ref().map(MonthTag::as_str))
        .bind(account.usage.total_requests)
        .bind(account.usage.last_request_at)
        .bind(account.monthly_limit)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_unique_violation)?;
        Ok(())
    }

    async fn update_fields(&self, id: Uuid, patch: AccountPatch) -> StoreResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE accounts SET ");
        let mut set = builder.separated(", ");
        if let Some(active) = patch.subscription_active {
            set.push("subscription_active = ").push_bind_unseparated(active);
        }
        if let Some(subscription_id) = patch.subscription_id {
            set.push("subscription_id = ").push_bind_unseparated(subscription_id);
        }
        if let Some(customer) = patch.billing_customer_id {
            set.push("billing_customer_id = ").push_bind_unseparated(customer);
        }
        if let Some(limit) = patch.monthly_limit {
            set.push("monthly_limit = ").push_bind_unseparated(limit);
        }
        builder.push(" WHERE id = ").push_bind(id);

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AccountNotFound(id));
        }
        Ok(())
    }

    async fn record_usage(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<ApiUsage> {
        let month = MonthTag::of(now);
        let row = sqlx::query(
            r#"
            UPDATE accounts SET
                monthly_requests = CASE
                    WHEN current_month = $2 THEN monthly_requests + 1
                    ELSE 1
                END,
                current_month = $2,
                total_requests = total_requests + 1,
                last_request_at = $3
            WHERE id = $1
            RETURNING monthly_requests, current_month, total_requests, last_request_at
            "#,
        )
        .bind(id)
        .bind(month.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::AccountNotFound(id))?;
        let current_month: Option<String> = row.get("current_month");
        Ok(ApiUsage {
            monthly_requests: row.get("monthly_requests"),
            current_month: current_month.map(MonthTag::from_stored),
            total_requests: row.get("total_requests"),
            last_request_at: row.get("last_request_at"),
        })
    }
}
