use anyhow::Context;
use bytes::Bytes;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::storage::StorageClient;
use crate::uploads::{remove_quietly, TempFile};

/// Reference returned by the media host for a stored file.
#[derive(Debug, Clone)]
pub struct UploadedMedia {
    pub key: String,
    pub url: String,
}

/// Pushes a held file into `folder` on the media host.
///
/// Returns `None` when the upload failed; the local file is removed either way.
pub async fn upload_on_media_host(
    storage: &dyn StorageClient,
    file: &TempFile,
    folder: &str,
) -> Option<UploadedMedia> {
    let result = put_file(storage, file, folder).await;
    remove_quietly(&file.path).await;
    match result {
        Ok(media) => {
            info!(key = %media.key, "media uploaded");
            Some(media)
        }
        Err(e) => {
            error!(error = ?e, path = %file.path.display(), "media upload failed");
            None
        }
    }
}

async fn put_file(
    storage: &dyn StorageClient,
    file: &TempFile,
    folder: &str,
) -> anyhow::Result<UploadedMedia> {
    let body: Bytes = tokio::fs::read(&file.path)
        .await
        .with_context(|| format!("read temp file {}", file.path.display()))?
        .into();
    anyhow::ensure!(!body.is_empty(), "empty file");

    let ext: &str = match ext_from_mime(&file.content_type) {
        Some(ext) => ext,
        None => file
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin"),
    };
    let key = format!("{}/{}.{}", folder.trim_matches('/'), Uuid::new_v4(), ext);
    storage
        .put_object(&key, body, &file.content_type)
        .await
        .with_context(|| format!("put_object {}", key))?;

    let url = storage.public_url(&key);
    Ok(UploadedMedia { key, url })
}

/// Best-effort removal of media that ended up orphaned.
pub async fn discard_uploaded(storage: &dyn StorageClient, media: &[&UploadedMedia]) {
    for m in media {
        if let Err(e) = storage.delete_object(&m.key).await {
            warn!(error = %e, key = %m.key, "orphaned media not deleted");
        }
    }
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}

#[cfg(test)]
mod media_tests {
    use super::*;
    use crate::storage::fake::FakeStorage;
    use crate::uploads::hold;

    #[test]
    fn test_ext_from_mime() {
        assert_eq!(ext_from_mime("image/jpeg"), Some("jpg"));
        assert_eq!(ext_from_mime("image/jpg"), Some("jpg"));
        assert_eq!(ext_from_mime("image/png"), Some("png"));
        assert_eq!(ext_from_mime("image/webp"), Some("webp"));
        assert_eq!(ext_from_mime("application/octet-stream"), None);
    }

    #[tokio::test]
    async fn upload_stores_object_and_removes_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FakeStorage::default();
        let file = hold(dir.path(), Some("me.png"), "image/png", Bytes::from_static(b"img"))
            .await
            .unwrap();

        let media = upload_on_media_host(&storage, &file, "EchoStream/users/avatars")
            .await
            .expect("upload should succeed");

        assert!(media.key.starts_with("EchoStream/users/avatars/"));
        assert!(media.key.ends_with(".png"));
        assert_eq!(media.url, format!("https://media.test/{}", media.key));
        assert_eq!(storage.keys(), vec![media.key.clone()]);
        assert!(!file.path.exists());
    }

    #[tokio::test]
    async fn failed_upload_yields_none_and_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FakeStorage::failing();
        let file = hold(dir.path(), Some("me.png"), "image/png", Bytes::from_static(b"img"))
            .await
            .unwrap();

        assert!(upload_on_media_host(&storage, &file, "x").await.is_none());
        assert!(!file.path.exists());
    }

    #[tokio::test]
    async fn discard_uploaded_deletes_objects() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FakeStorage::default();
        let file = hold(dir.path(), None, "image/webp", Bytes::from_static(b"img"))
            .await
            .unwrap();
        let media = upload_on_media_host(&storage, &file, "f").await.unwrap();

        discard_uploaded(&storage, &[&media]).await;
        assert!(storage.keys().is_empty());
    }
}
