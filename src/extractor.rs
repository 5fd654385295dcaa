use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub exp: usize,
}

/// HS256 signing and verification keys for bearer tokens.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenKeys {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn issue(
        &self,
        account_id: Uuid,
        email: &str,
        now: DateTime<Utc>,
    ) -> jsonwebtoken::errors::Result<String> {
        let exp = (now + self.ttl).timestamp().max(0) as usize;
        let claims = Claims {
            sub: account_id,
            email: email.to_string(),
            exp,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }

    /// Checks signature and expiry.
    pub fn verify(&self, token: &str) -> jsonwebtoken::errors::Result<Claims> {
        decode::<Claims>(token, &self.decoding, &Validation::default()).map(|data| data.claims)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerError {
    Missing,
    Malformed,
}

/// Splits a raw `Authorization` value into its bearer token.
pub fn parse_bearer(authorization: Option<&str>) -> Result<&str, BearerError> {
    let raw = authorization
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(BearerError::Missing)?;
    let token = match raw.split_once(' ') {
        Some(("Bearer", token)) => token.trim(),
        None if raw == "Bearer" => "",
        _ => return Err(BearerError::Malformed),
    };
    if token.is_empty() {
        return Err(BearerError::Missing);
    }
    Ok(token)
}

pub fn authorization_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

/// Authenticated caller for endpoints that need identity but no subscription or quota check.
pub struct AuthUser {
    pub account_id: Uuid,
    pub email: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = match parse_bearer(authorization_header(&parts.headers)) {
            Ok(token) => token,
            Err(BearerError::Missing) => {
                return Err((StatusCode::UNAUTHORIZED, "Missing token".into()))
            }
            Err(BearerError::Malformed) => {
                return Err((StatusCode::UNAUTHORIZED, "Invalid token".into()))
            }
        };
        let app = parts.extensions.get::<AppState>().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Application state missing".into(),
        ))?;
        let claims = app
            .tokens
            .verify(token)
            .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token".into()))?;
        Ok(AuthUser {
            account_id: claims.sub,
            email: claims.email,
        })
    }
}
