//! Local holding area for multipart files between receipt and media upload.

use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::Bytes;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

/// A file parked on local disk.
#[derive(Debug, Clone)]
pub struct TempFile {
    pub path: PathBuf,
    pub content_type: String,
}

/// The image slots of a registration form.
#[derive(Debug, Default)]
pub struct TempUploads {
    pub avatar: Option<TempFile>,
    pub cover_image: Option<TempFile>,
}

impl TempUploads {
    /// Best-effort removal of every held file.
    pub async fn discard(&self) {
        for file in [&self.avatar, &self.cover_image].into_iter().flatten() {
            remove_quietly(&file.path).await;
        }
    }
}

fn sanitize_file_name(name: &str) -> String {
    lazy_static! {
        static ref UNSAFE: Regex = Regex::new(r"[^A-Za-z0-9._-]").unwrap();
    }
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned = UNSAFE.replace_all(base, "_");
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.chars().take(64).collect()
    }
}

/// Writes `body` into `dir` under a unique name.
pub async fn hold(
    dir: &Path,
    original_name: Option<&str>,
    content_type: &str,
    body: Bytes,
) -> anyhow::Result<TempFile> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create upload dir {}", dir.display()))?;
    let name = format!(
        "{}-{}",
        Uuid::new_v4(),
        sanitize_file_name(original_name.unwrap_or("upload"))
    );
    let path = dir.join(name);
    tokio::fs::write(&path, &body)
        .await
        .with_context(|| format!("write temp file {}", path.display()))?;
    debug!(path = %path.display(), bytes = body.len(), "temp file held");
    Ok(TempFile {
        path,
        content_type: content_type.to_string(),
    })
}

/// Removes a held file; a file that is already gone is fine.
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "temp file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, path = %path.display(), "temp file removal failed"),
    }
}
