use async_trait::async_trait;
use sqlx::PgPool;

use crate::accounts::StoreResult;
use crate::houses::{HouseRecord, HouseStore};

#[derive(Clone)]
pub struct PgHouseStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct HouseRow {
    id: uuid::Uuid,
    address: String,
    zipcode: Option<String>,
    bedrooms: Option<i32>,
    bathrooms: Option<f64>,
    accommodates: Option<i32>,
    adr: Option<f64>,
    revenue: Option<f64>,
    occupancy: Option<f64>,
    last_fetched: chrono::DateTime<chrono::Utc>,
}

impl From<HouseRow> for HouseRecord {
    fn from(row: HouseRow) -> Self {
        HouseRecord {
            id: row.id,
            address: row.address,
            zipcode: row.zipcode,
            bedrooms: row.bedrooms,
            bathrooms: row.bathrooms,
            accommodates: row.accommodates,
            adr: row.adr,
            revenue: row.revenue,
            occupancy: row.occupancy,
            last_fetched: row.last_fetched,
        }
    }
}

impl PgHouseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HouseStore for PgHouseStore {
    async fn find_by_address(&self, address: &str) -> StoreResult<Option<HouseRecord>> {
        let row = sqlx::query_as::<_, HouseRow>("SELECT * FROM houses WHERE address = $1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(HouseRecord::from))
    }

    async fn upsert(&self, house: &HouseRecord) -> StoreResult<HouseRecord> {
        let row = sqlx::query_as::<_, HouseRow>(
            r#"
            INSERT INTO houses (
                id,
                address,
                zipcode,
                bedrooms,
                bathrooms,
                accommodates,
                adr,
                revenue,
                occupancy,
                last_fetched
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (address)
            DO UPDATE SET
                zipcode = EXCLUDED.zipcode,
                bedrooms = EXCLUDED.bedrooms,
                bathrooms = EXCLUDED.bathrooms,
                accommodates = EXCLUDED.accommodates,
                adr = EXCLUDED.adr,
                revenue = EXCLUDED.revenue,
                occupancy = EXCLUDED.occupancy,
                last_fetched = EXCLUDED.last_fetched
            RETURNING *
            "#,
        )
        .bind(house.id)
        .bind(&house.address)
        .bind(&house.zipcode)
        .bind(house.bedrooms)
        .bind(house.bathrooms)
        .bind(house.accommodates)
        .bind(house.adr)
        .bind(house.revenue)
        .bind(house.occupancy)
        .bind(house.last_fetched)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }
}
