use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::dto::{LoginRequest, RegisterForm};
use super::jwt::{JwtKeys, TokenPair};
use super::repo_types::{NewUser, PublicUser, StoreError, UniqueField, User};
use crate::error::ApiError;
use crate::media::{discard_uploaded, upload_on_media_host, UploadedMedia};
use crate::state::AppState;
use crate::uploads::TempUploads;

const INVALID_CREDENTIALS: &str = "Invalid user credentials";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn normalize_identity(value: &str) -> String {
    value.trim().to_lowercase()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| normalize_identity(&v))
        .filter(|v| !v.is_empty())
}

fn conflict(field: UniqueField) -> ApiError {
    match field {
        UniqueField::Username => ApiError::conflict("User already exists with this username"),
        UniqueField::Email => ApiError::conflict("User already exists with this email"),
        UniqueField::Unknown => ApiError::conflict("User already exists"),
    }
}

fn colliding_field(existing: &User, username: &str, email: &str) -> UniqueField {
    if existing.username == username {
        UniqueField::Username
    } else if existing.email == email {
        UniqueField::Email
    } else {
        UniqueField::Unknown
    }
}

/// Everything that can reject a registration before any media leaves the box.
async fn check_registration(
    st: &AppState,
    form: RegisterForm,
    uploads: &TempUploads,
) -> Result<RegisterForm, ApiError> {
    let required = [&form.full_name, &form.username, &form.email, &form.password];
    if required.iter().any(|f| f.trim().is_empty()) {
        return Err(ApiError::validation("Please provide all the required fields"));
    }

    let form = RegisterForm {
        full_name: form.full_name.trim().to_string(),
        username: normalize_identity(&form.username),
        email: normalize_identity(&form.email),
        password: form.password,
    };
    if !is_valid_email(&form.email) {
        return Err(ApiError::validation("Invalid email"));
    }

    let existing = st
        .users
        .find_by_username_or_email(Some(&form.username), Some(&form.email))
        .await?;
    if let Some(existing) = existing {
        let field = colliding_field(&existing, &form.username, &form.email);
        warn!(?field, user_id = %existing.id, "registration conflicts with existing account");
        return Err(conflict(field));
    }

    if uploads.avatar.is_none() {
        return Err(ApiError::validation("Missing required field: avatar image"));
    }
    Ok(form)
}

/// Registers an account from form fields plus held image files.
///
/// Held files never outlive the call: they are consumed by the media upload
/// or discarded on the error path. Media already uploaded is deleted again
/// when the account cannot be persisted.
#[instrument(skip_all, fields(username = %form.username))]
pub async fn register_user(
    st: &AppState,
    form: RegisterForm,
    uploads: TempUploads,
) -> Result<PublicUser, ApiError> {
    let form = match check_registration(st, form, &uploads).await {
        Ok(form) => form,
        Err(e) => {
            uploads.discard().await;
            return Err(e);
        }
    };

    let storage = st.storage.as_ref();
    let folder = st.config.media.folder.trim_end_matches('/');

    let avatar = match &uploads.avatar {
        Some(file) => upload_on_media_host(storage, file, &format!("{folder}/avatars")).await,
        None => None,
    };
    let Some(avatar) = avatar else {
        uploads.discard().await;
        return Err(ApiError::Upstream("Error uploading avatar image".into()));
    };

    let cover = match &uploads.cover_image {
        Some(file) => {
            let cover = upload_on_media_host(storage, file, &format!("{folder}/coverImages")).await;
            if cover.is_none() {
                warn!("cover image upload failed; continuing without it");
            }
            cover
        }
        None => None,
    };
    let uploaded: Vec<&UploadedMedia> = std::iter::once(&avatar).chain(cover.as_ref()).collect();

    let new_user = NewUser {
        username: form.username,
        email: form.email,
        full_name: form.full_name,
        password: form.password,
        avatar: avatar.url.clone(),
        cover_image: cover.as_ref().map(|c| c.url.clone()).unwrap_or_default(),
    };

    let id = match st.users.create(new_user).await {
        Ok(id) => id,
        Err(e) => {
            discard_uploaded(storage, &uploaded).await;
            return Err(match e {
                StoreError::Duplicate(field) => {
                    warn!(?field, "registration lost a uniqueness race");
                    conflict(field)
                }
                StoreError::Other(e) => ApiError::Unexpected(e),
            });
        }
    };

    match st.users.find_public_by_id(id).await? {
        Some(user) => {
            info!(user_id = %user.id, username = %user.username, "user registered");
            Ok(user)
        }
        None => {
            error!(user_id = %id, "created user not found on re-fetch");
            discard_uploaded(storage, &uploaded).await;
            Err(ApiError::Server("Error while registering the user".into()))
        }
    }
}

/// Mints a token pair and records the refresh token on the account.
async fn issue_session(st: &AppState, user_id: Uuid) -> Result<TokenPair, ApiError> {
    let keys = JwtKeys::from_ref(st);
    let pair = keys.issue_pair(user_id).map_err(|e| {
        error!(error = %e, %user_id, "jwt signing failed");
        ApiError::Server("Something went wrong while generating refresh and access token".into())
    })?;
    if !st
        .users
        .set_refresh_token(user_id, Some(&pair.refresh_token))
        .await?
    {
        return Err(ApiError::Server(
            "Something went wrong while generating refresh and access token".into(),
        ));
    }
    Ok(pair)
}

#[instrument(skip_all)]
pub async fn login_user(
    st: &AppState,
    req: LoginRequest,
) -> Result<(PublicUser, TokenPair), ApiError> {
    let username = non_blank(req.username);
    let email = non_blank(req.email);
    if username.is_none() && email.is_none() {
        return Err(ApiError::validation("Either username or email is required"));
    }
    if req.password.trim().is_empty() {
        return Err(ApiError::validation("Password is required"));
    }

    let Some(user) = st
        .users
        .find_by_username_or_email(username.as_deref(), email.as_deref())
        .await?
    else {
        warn!(?username, ?email, "login for unknown account");
        return Err(ApiError::unauthorized(INVALID_CREDENTIALS));
    };

    if !user.is_password_correct(&req.password)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(ApiError::unauthorized(INVALID_CREDENTIALS));
    }

    let pair = issue_session(st, user.id).await?;
    let public = st
        .users
        .find_public_by_id(user.id)
        .await?
        .ok_or_else(|| ApiError::Server("Error while logging in the user".into()))?;

    info!(user_id = %user.id, full_name = %user.full_name, "user logged in");
    Ok((public, pair))
}

#[instrument(skip(st))]
pub async fn logout_user(st: &AppState, user_id: Uuid) -> Result<(), ApiError> {
    if !st.users.set_refresh_token(user_id, None).await? {
        warn!(%user_id, "logout for missing account");
        return Err(ApiError::unauthorized("Invalid access token"));
    }
    info!(%user_id, "user logged out");
    Ok(())
}

/// Rotates the session: the presented refresh token must be the one on record.
#[instrument(skip_all)]
pub async fn refresh_session(
    st: &AppState,
    incoming: Option<String>,
) -> Result<TokenPair, ApiError> {
    let token = incoming
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Unauthorized request"))?;

    let keys = JwtKeys::from_ref(st);
    let claims = keys.verify_refresh(&token).map_err(|e| {
        warn!(error = %e, "invalid refresh token");
        ApiError::unauthorized("Invalid refresh token")
    })?;

    let user = st
        .users
        .find_by_id(claims.sub)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid refresh token"))?;

    if user.refresh_token.as_deref() != Some(token.as_str()) {
        warn!(user_id = %user.id, "refresh token does not match the stored one");
        return Err(ApiError::unauthorized("Refresh token is expired or used"));
    }

    let pair = issue_session(st, user.id).await?;
    info!(user_id = %user.id, "session refreshed");
    Ok(pair)
}
