use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use shared::{domain::UserId, error::ApiError, protocol::SessionClaims};
use tracing::{debug, error};

use crate::{error::HttpError, AppState};

/// HS256 signing material for session tokens.
#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl SessionKeys {
    pub fn new(secret: &str, ttl_hours: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::hours(ttl_hours.max(1)),
        }
    }

    pub fn issue(&self, user_id: UserId, email: &str) -> Result<String, ApiError> {
        let claims = SessionClaims::new(user_id, email, Utc::now() + self.ttl);
        encode(&Header::default(), &claims, &self.encoding).map_err(|err| {
            error!(%err, "failed to sign session token");
            ApiError::upstream()
        })
    }

    pub fn verify(&self, token: &str) -> Result<UserId, ApiError> {
        decode::<SessionClaims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims.user_id())
            .map_err(|err| {
                debug!(%err, "rejected session token");
                ApiError::unauthenticated()
            })
    }
}

/// The user a request acts for, taken from `Authorization: Bearer`.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub UserId);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = HttpError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(ApiError::unauthenticated)?;
        Ok(CurrentUser(state.sessions.verify(token)?))
    }
}
