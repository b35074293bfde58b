//! `Set-Cookie` construction and `Cookie` header parsing for the session tokens.

use axum::http::{header, HeaderMap, HeaderValue};
use tracing::error;

use crate::error::ApiError;

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

fn session_cookie(name: &str, value: &str, max_age_secs: u64) -> String {
    format!("{name}={value}; HttpOnly; Secure; Path=/; SameSite=Lax; Max-Age={max_age_secs}")
}

fn expired_cookie(name: &str) -> String {
    format!("{name}=; HttpOnly; Secure; Path=/; SameSite=Lax; Max-Age=0")
}

fn append(headers: &mut HeaderMap, cookie: String) -> Result<(), ApiError> {
    let value = HeaderValue::from_str(&cookie).map_err(|e| {
        error!(error = %e, "session cookie is not a valid header value");
        ApiError::Server("Could not set session cookies".into())
    })?;
    headers.append(header::SET_COOKIE, value);
    Ok(())
}

/// Headers setting both session cookies. Either both are set or neither.
pub fn set_session(
    access_token: &str,
    access_ttl_secs: u64,
    refresh_token: &str,
    refresh_ttl_secs: u64,
) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    append(&mut headers, session_cookie(ACCESS_COOKIE, access_token, access_ttl_secs))?;
    append(&mut headers, session_cookie(REFRESH_COOKIE, refresh_token, refresh_ttl_secs))?;
    Ok(headers)
}

/// Headers expiring both session cookies.
pub fn clear_session() -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    append(&mut headers, expired_cookie(ACCESS_COOKIE))?;
    append(&mut headers, expired_cookie(REFRESH_COOKIE))?;
    Ok(headers)
}

/// Value of cookie `name` from the request's `Cookie` headers.
pub fn read(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|line| line.split(';'))
        .find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name && !v.is_empty()).then(|| v.to_string())
        })
}
