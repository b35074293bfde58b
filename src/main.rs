mod app;
mod auth;
mod config;
mod error;
mod media;
mod state;
mod storage;
mod uploads;

use crate::config::AppConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "userhub=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = AppConfig::from_env()?;

    // Without the database there is nothing to serve.
    let (app_state, db) = match AppState::init(config).await {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = ?e, "startup failed");
            std::process::exit(1);
        }
    };

    let cfg = app_state.config.clone();
    let app = app::build_app(app_state);
    let served = app::serve(app, &cfg).await;

    db.close().await;
    tracing::info!("database pool closed");
    served
}
