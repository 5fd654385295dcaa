//! Rental-data lookups: cached house records, the lookup service and its gated handler.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::accounts::{MonthTag, StoreResult};
use crate::extractor::authorization_header;
use crate::gate::OperationOutcome;
use crate::ledger::UsageLedger;
use crate::lookup::{LookupError, LookupProvider, LookupRequest, ProviderListing};
use crate::state::AppState;

/// key: house-model -> cached provider result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseRecord {
    pub id: Uuid,
    pub address: String,
    pub zipcode: Option<String>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<f64>,
    pub accommodates: Option<i32>,
    pub adr: Option<f64>,
    pub revenue: Option<f64>,
    pub occupancy: Option<f64>,
    pub last_fetched: DateTime<Utc>,
}

impl HouseRecord {
    /// Keys the record by the address the caller asked for so repeat lookups hit the cache.
    pub fn from_listing(requested_address: &str, listing: ProviderListing, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: requested_address.to_string(),
            zipcode: listing.zipcode,
            bedrooms: listing.bedrooms,
            bathrooms: listing.bathrooms,
            accommodates: listing.accommodates,
            adr: listing.adr,
            revenue: listing.revenue,
            occupancy: listing.occupancy,
            last_fetched: now,
        }
    }
}

#[async_trait]
pub trait HouseStore: Send + Sync {
    async fn find_by_address(&self, address: &str) -> StoreResult<Option<HouseRecord>>;
    /// Inserts or replaces the record for `house.address` and returns the stored row.
    async fn upsert(&self, house: &HouseRecord) -> StoreResult<HouseRecord>;
}

#[derive(Default)]
pub struct MemoryHouseStore {
    houses: DashMap<String, HouseRecord>,
}

impl MemoryHouseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HouseStore for MemoryHouseStore {
    async fn find_by_address(&self, address: &str) -> StoreResult<Option<HouseRecord>> {
        Ok(self.houses.get(address).map(|entry| entry.value().clone()))
    }

    async fn upsert(&self, house: &HouseRecord) -> StoreResult<HouseRecord> {
        let mut entry = self
            .houses
            .entry(house.address.clone())
            .or_insert_with(|| house.clone());
        let id = entry.id;
        *entry.value_mut() = HouseRecord { id, ..house.clone() };
        Ok(entry.value().clone())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HouseLookup {
    pub house: HouseRecord,
    pub from_cache: bool,
}

/// key: rental-lookup -> protected operation
pub struct RentalLookupService {
    houses: Arc<dyn HouseStore>,
    provider: Arc<dyn LookupProvider>,
    ledger: Arc<dyn UsageLedger>,
    provider_name: String,
    timeout: Duration,
}

impl RentalLookupService {
    pub fn new(
        houses: Arc<dyn HouseStore>,
        provider: Arc<dyn LookupProvider>,
        ledger: Arc<dyn UsageLedger>,
        provider_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            houses,
            provider,
            ledger,
            provider_name: provider_name.into(),
            timeout,
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub async fn fetch(
        &self,
        mut request: LookupRequest,
        now: DateTime<Utc>,
    ) -> Result<HouseLookup, LookupError> {
        request.address = request.address.trim().to_string();
        if request.address.is_empty() {
            return Err(LookupError::InvalidRequest("Address is required".into()));
        }

        if let Some(house) = self.houses.find_by_address(&request.address).await? {
            return Ok(HouseLookup {
                house,
                from_cache: true,
            });
        }

        let listing = tokio::time::timeout(self.timeout, self.provider.lookup(&request))
            .await
            .map_err(|_| LookupError::Upstream(format!("lookup timed out after {:?}", self.timeout)))??;

        let house = self
            .houses
            .upsert(&HouseRecord::from_listing(&request.address, listing, now))
            .await?;

        let month = MonthTag::of(now);
        match self.ledger.increment(&self.provider_name, &month, now).await {
            Ok(entry) => info!(
                provider = %entry.provider,
                month = %entry.month,
                count = entry.count,
                "provider call counted"
            ),
            Err(err) => error!(?err, provider = %self.provider_name, %month, "failed to update usage ledger"),
        }

        Ok(HouseLookup {
            house,
            from_cache: false,
        })
    }
}

/// `POST /api/house`: gate, look up, record usage on success.
pub async fn lookup_house(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let grant = match state
        .gate
        .authorize(authorization_header(&headers), Utc::now())
        .await
    {
        Ok(grant) => grant,
        Err(rejection) => return rejection.into_response(),
    };

    // The body is only parsed once the caller has been admitted.
    let result = match serde_json::from_slice::<LookupRequest>(&body) {
        Ok(request) => state.lookups.fetch(request, Utc::now()).await,
        Err(err) => Err(LookupError::InvalidRequest(format!("Invalid request body: {err}"))),
    };
    let outcome = match &result {
        Ok(_) => OperationOutcome::succeeded(),
        Err(err) => OperationOutcome::from_status(err.status()),
    };
    state.gate.record_usage(&grant, outcome, Utc::now()).await;

    match result {
        Ok(lookup) => Json(json!({
            "success": true,
            "data": lookup.house,
            "fromCache": lookup.from_cache,
        }))
        .into_response(),
        Err(err) => err.into_response(),
    }
}
