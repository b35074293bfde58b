use axum::{
    body::Bytes,
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, FromRef,
        Multipart, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::json;
use tracing::{instrument, warn};

use super::{
    cookies,
    dto::{LoginData, LoginRequest, RefreshRequest, RegisterForm, TokensData},
    extractors::AuthUser,
    jwt::{JwtKeys, TokenPair},
    repo_types::PublicUser,
    services,
};
use crate::{
    error::{ApiError, ApiResponse},
    state::AppState,
    uploads::{hold, TempUploads},
};

const MAX_REGISTER_BODY: usize = 20 * 1024 * 1024; // 20MB

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/register",
            post(register).layer(DefaultBodyLimit::max(MAX_REGISTER_BODY)),
        )
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/refresh-token", post(refresh_token))
}

fn bad_multipart(e: impl std::fmt::Display) -> ApiError {
    ApiError::validation(format!("Malformed multipart body: {e}"))
}

/// Reads text fields into a form and parks file fields in the holding directory.
async fn read_register_form(
    st: &AppState,
    mp: &mut Multipart,
    uploads: &mut TempUploads,
) -> Result<RegisterForm, ApiError> {
    let mut form = RegisterForm::default();
    while let Some(field) = mp.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "avatar" | "coverImage" | "banner" => {
                let slot = if name == "avatar" {
                    &mut uploads.avatar
                } else {
                    &mut uploads.cover_image
                };
                if slot.is_some() {
                    return Err(ApiError::validation(format!("Unexpected field: {name}")));
                }
                let file_name = field.file_name().map(str::to_string);
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await.map_err(bad_multipart)?;
                if data.is_empty() {
                    // empty file input, treated as not supplied
                    continue;
                }
                *slot = Some(
                    hold(&st.config.upload_dir, file_name.as_deref(), &content_type, data).await?,
                );
            }
            "fullName" => form.full_name = field.text().await.map_err(bad_multipart)?,
            "username" => form.username = field.text().await.map_err(bad_multipart)?,
            "email" => form.email = field.text().await.map_err(bad_multipart)?,
            "password" => form.password = field.text().await.map_err(bad_multipart)?,
            _ if field.file_name().is_some() => {
                return Err(ApiError::validation(format!("Unexpected field: {name}")));
            }
            _ => warn!(field = %name, "ignoring unknown form field"),
        }
    }
    Ok(form)
}

#[instrument(skip(state, mp))]
pub async fn register(
    State(state): State<AppState>,
    mp: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<ApiResponse<PublicUser>>), ApiError> {
    let mut mp = mp.map_err(|e| ApiError::validation(e.body_text()))?;
    let mut uploads = TempUploads::default();
    let form = match read_register_form(&state, &mut mp, &mut uploads).await {
        Ok(form) => form,
        Err(e) => {
            uploads.discard().await;
            return Err(e);
        }
    };

    let user = services::register_user(&state, form, uploads).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::new(
            StatusCode::CREATED,
            user,
            "User registered successfully",
        )),
    ))
}

fn session_headers(state: &AppState, pair: &TokenPair) -> Result<HeaderMap, ApiError> {
    let keys = JwtKeys::from_ref(state);
    cookies::set_session(
        &pair.access_token,
        keys.access_ttl.as_secs(),
        &pair.refresh_token,
        keys.refresh_ttl.as_secs(),
    )
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::validation(e.body_text()))?;
    let (user, pair) = services::login_user(&state, req).await?;
    Ok((
        StatusCode::OK,
        session_headers(&state, &pair)?,
        Json(ApiResponse::new(
            StatusCode::OK,
            LoginData { user },
            "User logged in successfully",
        )),
    ))
}

#[instrument(skip(state))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    services::logout_user(&state, user_id).await?;
    Ok((
        StatusCode::OK,
        cookies::clear_session()?,
        Json(ApiResponse::new(
            StatusCode::OK,
            json!({}),
            "User logged out successfully",
        )),
    ))
}

#[instrument(skip_all)]
pub async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let incoming = cookies::read(&headers, cookies::REFRESH_COOKIE).or_else(|| {
        serde_json::from_slice::<RefreshRequest>(&body)
            .ok()
            .and_then(|r| r.refresh_token)
    });
    let pair = services::refresh_session(&state, incoming).await?;
    Ok((
        StatusCode::OK,
        session_headers(&state, &pair)?,
        Json(ApiResponse::new(
            StatusCode::OK,
            TokensData {
                access_token: pair.access_token.clone(),
                refresh_token: pair.refresh_token.clone(),
            },
            "Access token refreshed",
        )),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{header, Request, Response},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        app::build_app, auth::repo::memory::MemoryUserStore, storage::fake::FakeStorage,
        state::AppState,
    };

    const BOUNDARY: &str = "X-USERHUB-BOUNDARY";

    struct TestApp {
        state: AppState,
        users: Arc<MemoryUserStore>,
        _dir: tempfile::TempDir,
    }

    fn test_app() -> TestApp {
        let users = Arc::new(MemoryUserStore::default());
        let dir = tempfile::tempdir().unwrap();
        let mut state = AppState::fake_with(users.clone(), Arc::new(FakeStorage::default()));
        let mut cfg = (*state.config).clone();
        cfg.upload_dir = dir.path().to_path_buf();
        state.config = Arc::new(cfg);
        TestApp {
            state,
            users,
            _dir: dir,
        }
    }

    fn multipart(texts: &[(&str, &str)], files: &[(&str, &str, &str)]) -> Vec<u8> {
        let typed: Vec<_> = files
            .iter()
            .map(|(name, file_name, data)| (*name, *file_name, "image/png", *data))
            .collect();
        multipart_typed(texts, &typed)
    }

    fn multipart_typed(texts: &[(&str, &str)], files: &[(&str, &str, &str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in texts {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        for (name, file_name, content_type, data) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn ab_fields() -> Vec<(&'static str, &'static str)> {
        vec![
            ("fullName", "A B"),
            ("username", "ab"),
            ("email", "a@b.com"),
            ("password", "secret"),
        ]
    }

    async fn send(app: &TestApp, req: Request<Body>) -> Response<Body> {
        build_app(app.state.clone()).oneshot(req).await.unwrap()
    }

    async fn json_body(resp: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn set_cookies(resp: &Response<Body>) -> Vec<String> {
        resp.headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    fn register_req(texts: &[(&str, &str)], files: &[(&str, &str, &str)]) -> Request<Body> {
        register_body(multipart(texts, files))
    }

    fn register_body(body: Vec<u8>) -> Request<Body> {
        Request::post("/api/v1/users/register")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn login_req(body: Value) -> Request<Body> {
        Request::post("/api/v1/users/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn register_ab(app: &TestApp) -> Value {
        let resp = send(
            app,
            register_req(&ab_fields(), &[("avatar", "me.png", "PNG")]),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        json_body(resp).await
    }

    async fn login_ab(app: &TestApp) -> Response<Body> {
        send(
            app,
            login_req(serde_json::json!({"username": "ab", "password": "secret"})),
        )
        .await
    }

    fn cookie_value(cookies: &[String], name: &str) -> String {
        cookies
            .iter()
            .find_map(|c| c.strip_prefix(&format!("{name}=")))
            .and_then(|rest| rest.split(';').next())
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn register_returns_sanitized_user() {
        let app = test_app();
        let body = register_ab(&app).await;

        assert_eq!(body["statusCode"], 201);
        assert_eq!(body["success"], true);
        let data = &body["data"];
        assert!(data["avatar"].as_str().unwrap().starts_with("https://"));
        assert_eq!(data["username"], "ab");
        assert!(data.get("password").is_none());
        assert!(data.get("refreshToken").is_none());
    }

    #[tokio::test]
    async fn register_accepts_banner_as_cover() {
        let app = test_app();
        let resp = send(
            &app,
            register_req(
                &ab_fields(),
                &[("avatar", "a.png", "a"), ("banner", "b.png", "b")],
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = json_body(resp).await;
        assert!(body["data"]["coverImage"]
            .as_str()
            .unwrap()
            .contains("/coverImages/"));
    }

    #[tokio::test]
    async fn register_accepts_untyped_avatar() {
        let app = test_app();
        let resp = send(
            &app,
            register_body(multipart_typed(
                &ab_fields(),
                &[("avatar", "me", "application/octet-stream", "raw")],
            )),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = json_body(resp).await;
        let avatar = body["data"]["avatar"].as_str().unwrap();
        assert!(avatar.starts_with("https://"));
        assert!(avatar.ends_with(".bin"));
    }

    #[tokio::test]
    async fn register_missing_field_is_400() {
        let app = test_app();
        let resp = send(
            &app,
            register_req(
                &[("fullName", "A B"), ("username", "ab"), ("email", "a@b.com")],
                &[("avatar", "me.png", "x")],
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Please provide all the required fields");
    }

    #[tokio::test]
    async fn register_twice_is_409() {
        let app = test_app();
        register_ab(&app).await;
        let resp = send(
            &app,
            register_req(&ab_fields(), &[("avatar", "me.png", "x")]),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn register_with_two_avatars_is_400() {
        let app = test_app();
        let resp = send(
            &app,
            register_req(
                &ab_fields(),
                &[("avatar", "a.png", "a"), ("avatar", "b.png", "b")],
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(app.users.snapshot().is_empty());
    }

    #[tokio::test]
    async fn register_rejects_json_body() {
        let app = test_app();
        let resp = send(&app, login_req(serde_json::json!({"username": "ab"}))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = Request::post("/api/v1/users/register")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let resp = send(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["success"], false);
    }

    #[tokio::test]
    async fn login_sets_exactly_two_cookies() {
        let app = test_app();
        register_ab(&app).await;

        let resp = login_ab(&app).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cookies = set_cookies(&resp);
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().all(|c| c.contains("HttpOnly") && c.contains("Secure")));

        let refresh = cookie_value(&cookies, "refreshToken");
        let stored = app.users.snapshot()[0].refresh_token.clone();
        assert_eq!(stored.as_deref(), Some(refresh.as_str()));

        let body = json_body(resp).await;
        let user = &body["data"]["user"];
        assert_eq!(user["email"], "a@b.com");
        assert!(user.get("refreshToken").is_none());
        assert!(user.get("password").is_none());
        assert!(!body.to_string().contains(&refresh));
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let app = test_app();
        register_ab(&app).await;

        let unknown = send(
            &app,
            login_req(serde_json::json!({"email": "x@y.com", "password": "secret"})),
        )
        .await;
        let wrong = send(
            &app,
            login_req(serde_json::json!({"email": "a@b.com", "password": "nope"})),
        )
        .await;

        assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert!(set_cookies(&unknown).is_empty());
        assert_eq!(json_body(unknown).await, json_body(wrong).await);
    }

    #[tokio::test]
    async fn logout_requires_access_token() {
        let app = test_app();
        let resp = send(
            &app,
            Request::post("/api/v1/users/logout")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_clears_cookies_and_kills_refresh() {
        let app = test_app();
        register_ab(&app).await;
        let cookies = set_cookies(&login_ab(&app).await);
        let access = cookie_value(&cookies, "accessToken");
        let refresh = cookie_value(&cookies, "refreshToken");

        let resp = send(
            &app,
            Request::post("/api/v1/users/logout")
                .header(header::COOKIE, format!("accessToken={access}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cleared = set_cookies(&resp);
        assert_eq!(cleared.len(), 2);
        assert!(cleared.iter().all(|c| c.contains("Max-Age=0")));
        assert_eq!(json_body(resp).await["data"], serde_json::json!({}));
        assert!(app.users.snapshot()[0].refresh_token.is_none());

        let resp = send(
            &app,
            Request::post("/api/v1/users/refresh-token")
                .header(header::COOKIE, format!("refreshToken={refresh}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn refresh_accepts_body_token_and_rotates() {
        let app = test_app();
        register_ab(&app).await;
        let cookies = set_cookies(&login_ab(&app).await);
        let refresh = cookie_value(&cookies, "refreshToken");

        let resp = send(
            &app,
            Request::post("/api/v1/users/refresh-token")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({ "refreshToken": refresh }).to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(set_cookies(&resp).len(), 2);
        let body = json_body(resp).await;
        assert_ne!(body["data"]["refreshToken"], Value::String(refresh));
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = test_app();
        let resp = send(
            &app,
            Request::get("/api/v1/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
