use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use tracing::warn;
use uuid::Uuid;

use super::{cookies, jwt::JwtKeys};
use crate::error::ApiError;

/// Verified caller identity, taken from the `accessToken` cookie or a Bearer header.
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = JwtKeys::from_ref(state);

        let token = cookies::read(&parts.headers, cookies::ACCESS_COOKIE)
            .or_else(|| {
                parts
                    .headers
                    .get(axum::http::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")))
                    .map(|t| t.trim().to_string())
            })
            .ok_or_else(|| ApiError::unauthorized("Unauthorized request"))?;

        let claims = keys.verify_access(&token).map_err(|e| {
            warn!(error = %e, "invalid or expired access token");
            ApiError::unauthorized("Invalid access token")
        })?;

        Ok(AuthUser(claims.sub))
    }
}
