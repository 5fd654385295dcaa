use axum::{extract::Extension, Json};
use chrono::Utc;
use serde::Serialize;

use crate::accounts::{ApiUsage, MonthTag};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::ledger::UsageLedgerEntry;
use crate::state::AppState;

#[derive(Serialize)]
pub struct UsageReport {
    pub success: bool,
    pub usage: ApiUsage,
    pub limit: i64,
    pub remaining: i64,
}

/// `GET /api/user/usage`: the caller's counters as of the current month.
pub async fn user_usage(
    Extension(state): Extension<AppState>,
    AuthUser { account_id, .. }: AuthUser,
) -> AppResult<Json<UsageReport>> {
    let account = state
        .accounts
        .find_by_id(account_id)
        .await?
        .ok_or(AppError::Unauthorized)?;
    let month = MonthTag::of(Utc::now());
    Ok(Json(UsageReport {
        success: true,
        usage: account.usage.rolled_over(&month),
        limit: account.monthly_limit,
        remaining: account.remaining_requests(&month),
    }))
}

/// `GET /api/usage/all`: provider-wide ledger, newest month first.
pub async fn provider_usage(
    Extension(state): Extension<AppState>,
    _user: AuthUser,
) -> AppResult<Json<Vec<UsageLedgerEntry>>> {
    let entries = state
        .ledger
        .entries_for(state.lookups.provider_name())
        .await?;
    Ok(Json(entries))
}
