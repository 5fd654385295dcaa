use crate::accounts::{normalize_email, Account, StoreError};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::gate::SubscriptionCheck;
use crate::state::AppState;
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::{extract::Extension, http::StatusCode, Json};
use chrono::Utc;
use once_cell::sync::Lazy;
use rand_core::OsRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: Option<String>,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: uuid::Uuid,
    pub name: Option<String>,
    pub email: String,
    pub billing_customer_id: Option<String>,
    pub subscription_active: bool,
    pub monthly_limit: i64,
}

impl From<&Account> for UserInfo {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            name: account.name.clone(),
            email: account.email.clone(),
            billing_customer_id: account.billing_customer_id.clone(),
            subscription_active: account.subscription_active,
            monthly_limit: account.monthly_limit,
        }
    }
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub success: bool,
    pub token: String,
    pub user: UserInfo,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub has_subscription: bool,
    pub message: &'static str,
}

fn issue_session(state: &AppState, account: &Account) -> AppResult<SessionResponse> {
    let token = state
        .tokens
        .issue(account.id, &account.email, Utc::now())
        .map_err(|e| {
            error!(?e, "Token encoding error");
            AppError::Message("Token error".into())
        })?;
    Ok(SessionResponse {
        success: true,
        token,
        user: UserInfo::from(account),
    })
}

pub async fn register_user(
    Extension(state): Extension<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<SessionResponse>)> {
    if !EMAIL_PATTERN.is_match(payload.email.trim()) {
        return Err(AppError::BadRequest("Valid email required".into()));
    }
    if payload.password.len() < 8 {
        return Err(AppError::BadRequest("Password too short".into()));
    }
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(payload.password.as_bytes(), &salt)
        .map_err(|e| AppError::Message(format!("Hashing failed: {}", e)))?;

    let name = payload
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());
    let account = Account::new(
        name,
        &payload.email,
        hash.to_string(),
        state.default_monthly_limit,
        Utc::now(),
    );
    match state.accounts.insert(&account).await {
        Ok(()) => {}
        Err(StoreError::DuplicateEmail) => {
            return Err(AppError::BadRequest("User already exists".into()))
        }
        Err(e) => return Err(e.into()),
    }
    info!(account_id = %account.id, "account registered");
    Ok((StatusCode::CREATED, Json(issue_session(&state, &account)?)))
}

pub async fn login_user(
    Extension(state): Extension<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<SessionResponse>> {
    let account = state
        .accounts
        .find_by_email(&normalize_email(&payload.email))
        .await
        .map_err(|e| {
            error!(?e, "DB error while fetching account");
            AppError::Store(e)
        })?
        .ok_or(AppError::Unauthorized)?;
    let parsed = PasswordHash::new(&account.password_hash).map_err(|e| {
        error!(?e, "Hash parse error");
        AppError::Message(format!("Hash error: {}", e))
    })?;
    if Argon2::default()
        .verify_password(payload.password.as_bytes(), &parsed)
        .is_err()
    {
        return Err(AppError::Unauthorized);
    }
    Ok(Json(issue_session(&state, &account)?))
}

pub async fn current_user(
    Extension(state): Extension<AppState>,
    AuthUser { account_id, .. }: AuthUser,
) -> AppResult<Json<UserInfo>> {
    let Some(account) = state.accounts.find_by_id(account_id).await? else {
        return Err(AppError::NotFound);
    };
    Ok(Json(UserInfo::from(&account)))
}

/// Reports subscription state, refreshing the cached flag from the billing provider if needed.
pub async fn check_subscription(
    Extension(state): Extension<AppState>,
    AuthUser { account_id, .. }: AuthUser,
) -> AppResult<Json<SubscriptionResponse>> {
    let Some(mut account) = state.accounts.find_by_id(account_id).await? else {
        return Err(AppError::NotFound);
    };
    let check = state
        .gate
        .resolve_subscription(&mut account)
        .await
        .map_err(|e| AppError::Message(e.to_string()))?;
    let response = match check {
        SubscriptionCheck::Active | SubscriptionCheck::Activated => SubscriptionResponse {
            has_subscription: true,
            message: "User has active subscription",
        },
        SubscriptionCheck::Inactive(_) | SubscriptionCheck::Missing => SubscriptionResponse {
            has_subscription: false,
            message: "No active subscription found",
        },
        SubscriptionCheck::OracleFailed => {
            return Err(AppError::BadGateway("Failed to check subscription".into()))
        }
    };
    Ok(Json(response))
}
