use serde::{Deserialize, Serialize};

use super::repo_types::PublicUser;

/// Request body for login. At least one of `username`/`email` is required.
#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: String,
}

/// Body fallback for token refresh when the cookie is absent.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// `data` of a successful login.
#[derive(Debug, Serialize)]
pub struct LoginData {
    pub user: PublicUser,
}

/// `data` of a successful refresh.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokensData {
    pub access_token: String,
    pub refresh_token: String,
}

/// Text fields of the registration form, already trimmed.
#[derive(Debug, Default, Clone)]
pub struct RegisterForm {
    pub full_name: String,
    pub username: String,
    pub email: String,
    pub password: String,
}
