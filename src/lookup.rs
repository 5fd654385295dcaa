//! Paid rental-data lookups against the AirDNA rentalizer API.

use async_trait::async_trait;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

use crate::accounts::StoreError;

/// AirDNA response id meaning "no comparable listings for this address".
pub const NO_COMP_DATA_RESPONSE_ID: &str = "API-E-063";

const RENTALIZER_PATH: &str = "/api/enterprise/v2/rentalizer/summary/individual";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LookupRequest {
    #[serde(default)]
    pub address: String,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<f64>,
    pub accommodates: Option<i32>,
}

/// Listing data as returned by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderListing {
    pub address: String,
    pub zipcode: Option<String>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<f64>,
    pub accommodates: Option<i32>,
    pub adr: Option<f64>,
    pub revenue: Option<f64>,
    pub occupancy: Option<f64>,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("no comparable data available")]
    NoComparableData,
    #[error("lookup provider failure: {0}")]
    Upstream(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LookupError {
    pub fn status(&self) -> StatusCode {
        match self {
            LookupError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            LookupError::NoComparableData => StatusCode::NOT_FOUND,
            LookupError::Upstream(_) => StatusCode::BAD_GATEWAY,
            LookupError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LookupError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            LookupError::InvalidRequest(message) => json!({
                "success": false,
                "error": message,
            }),
            LookupError::NoComparableData => json!({
                "success": false,
                "error": "No comparable data available",
                "message": "Sorry, we don't have rental data available for this address.",
            }),
            LookupError::Upstream(_) | LookupError::Store(_) => {
                error!(error = %self, "house lookup failed");
                json!({
                    "success": false,
                    "error": "Server error",
                })
            }
        };
        (status, Json(body)).into_response()
    }
}

/// key: lookup-provider -> paid data fetch
#[async_trait]
pub trait LookupProvider: Send + Sync {
    async fn lookup(&self, request: &LookupRequest) -> Result<ProviderListing, LookupError>;
}

pub struct AirDnaClient {
    base: String,
    api_key: String,
    client: Client,
}

#[derive(Serialize)]
struct RentalizerRequest<'a> {
    address: &'a str,
    bedrooms: Option<i32>,
    bathrooms: Option<f64>,
    currency: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    accommodates: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct RentalizerResponse {
    status: Option<ResponseStatus>,
    payload: Option<RentalizerPayload>,
}

#[derive(Debug, Deserialize)]
struct ResponseStatus {
    #[serde(rename = "type")]
    kind: Option<String>,
    response_id: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RentalizerPayload {
    details: ListingDetails,
    stats: ListingStats,
}

#[derive(Debug, Deserialize)]
struct ListingDetails {
    address: String,
    zipcode: Option<String>,
    accommodates: Option<i32>,
    bedrooms: Option<i32>,
    bathrooms: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ListingStats {
    future: FutureStats,
}

#[derive(Debug, Deserialize)]
struct FutureStats {
    summary: StatsSummary,
}

#[derive(Debug, Deserialize)]
struct StatsSummary {
    adr: Option<f64>,
    revenue: Option<f64>,
    occupancy: Option<f64>,
}

impl AirDnaClient {
    pub fn new(
        base: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl LookupProvider for AirDnaClient {
    async fn lookup(&self, request: &LookupRequest) -> Result<ProviderListing, LookupError> {
        let body = RentalizerRequest {
            address: &request.address,
            bedrooms: request.bedrooms,
            bathrooms: request.bathrooms,
            currency: "usd",
            accommodates: request.accommodates,
        };
        let response = self
            .client
            .post(format!("{}{}", self.base, RENTALIZER_PATH))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                warn!(?err, "AirDNA request failed");
                LookupError::Upstream("Failed to fetch data from AirDNA".into())
            })?;
        let http_status = response.status();
        let text = response.text().await.map_err(|err| {
            warn!(?err, "AirDNA response body unreadable");
            LookupError::Upstream("Failed to fetch data from AirDNA".into())
        })?;
        // Error bodies carry the same status envelope, so parse before checking the HTTP code.
        let parsed: Option<RentalizerResponse> = serde_json::from_str(&text).ok();
        interpret_response(http_status, parsed)
    }
}

fn interpret_response(
    http_status: reqwest::StatusCode,
    parsed: Option<RentalizerResponse>,
) -> Result<ProviderListing, LookupError> {
    if let Some(status) = parsed.as_ref().and_then(|body| body.status.as_ref()) {
        if status.response_id.as_deref() == Some(NO_COMP_DATA_RESPONSE_ID) {
            return Err(LookupError::NoComparableData);
        }
        if status.kind.as_deref() == Some("error") {
            let message = status
                .message
                .clone()
                .unwrap_or_else(|| "AirDNA API error".to_string());
            warn!(%message, "AirDNA reported an error");
            return Err(LookupError::Upstream(message));
        }
    }
    if !http_status.is_success() {
        warn!(%http_status, "AirDNA returned an error status");
        return Err(LookupError::Upstream("Failed to fetch data from AirDNA".into()));
    }
    let payload = parsed
        .and_then(|body| body.payload)
        .ok_or_else(|| LookupError::Upstream("Invalid response from AirDNA".into()))?;
    let summary = payload.stats.future.summary;
    Ok(ProviderListing {
        address: payload.details.address,
        zipcode: payload.details.zipcode,
        bedrooms: payload.details.bedrooms,
        bathrooms: payload.details.bathrooms,
        accommodates: payload.details.accommodates,
        adr: summary.adr,
        revenue: summary.revenue,
        occupancy: summary.occupancy,
    })
}
