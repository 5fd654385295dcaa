//! Postgres-backed stores behind a single pool handle.

pub mod accounts;
pub mod houses;
pub mod usage_ledger;

use sqlx::migrate::MigrateError;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use accounts::PgAccountStore;
pub use houses::PgHouseStore;
pub use usage_ledger::PgUsageLedger;

/// Owns the connection pool. Opened once at startup and cloned into every store.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), MigrateError> {
        sqlx::migrate!().run(&self.pool).await
    }

    /// Reads connection state from the pool itself.
    pub fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    pub fn accounts(&self) -> PgAccountStore {
        PgAccountStore::new(self.pool.clone())
    }

    pub fn houses(&self) -> PgHouseStore {
        PgHouseStore::new(self.pool.clone())
    }

    pub fn usage_ledger(&self) -> PgUsageLedger {
        PgUsageLedger::new(self.pool.clone())
    }
}
