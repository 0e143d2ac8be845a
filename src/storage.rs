//! Object storage used to turn staged or local files into fetchable URLs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::errors::AppError;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` under a name derived from `file_name` and returns its public URL.
    async fn upload(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, AppError>;
}

/// Writes objects into a directory that the HTTP server exposes under `/files`.
#[derive(Debug, Clone)]
pub struct LocalDirectoryStorage {
    root: PathBuf,
    public_url: String,
}

impl LocalDirectoryStorage {
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalDirectoryStorage {
    async fn upload(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, AppError> {
        let key = format!("{}-{}", Uuid::new_v4().simple(), sanitize_file_name(file_name));

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| AppError::internal(format!("failed to create storage dir: {err}")))?;
        tokio::fs::write(self.root.join(&key), bytes)
            .await
            .map_err(|err| AppError::internal(format!("failed to write object {key}: {err}")))?;

        debug!(key = %key, content_type, "object stored");
        Ok(format!("{}/{}", self.public_url, key))
    }
}

/// Reduces a client-supplied name to a single safe path segment.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned = base
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        "upload.bin".to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn content_type_for(path: &str) -> &'static str {
    let extension = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("svg") => "image/svg+xml",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("m4a") => "audio/mp4",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_upload_writes_file_and_returns_public_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LocalDirectoryStorage::new(dir.path(), "http://localhost:3000/files/");

        let url = storage
            .upload("cat.png", b"png-bytes".to_vec(), "image/png")
            .await
            .expect("upload");

        assert!(url.starts_with("http://localhost:3000/files/"));
        assert!(url.ends_with("-cat.png"));
        let key = url.rsplit('/').next().expect("key");
        let stored = std::fs::read(dir.path().join(key)).expect("stored object");
        assert_eq!(stored, b"png-bytes");
    }

    #[test]
    fn sanitize_strips_directories_and_odd_characters() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\my photo.jpg"), "my_photo.jpg");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name("///"), "upload.bin");
    }

    #[test]
    fn content_type_from_extension() {
        assert_eq!(content_type_for("/mnt/user-data/a.JPG"), "image/jpeg");
        assert_eq!(content_type_for("clip.mp4"), "video/mp4");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
