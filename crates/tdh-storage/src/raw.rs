//! Append-only archive of raw provider payloads.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tdh_core::{RawDataId, RawPayload};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::StoreError;

/// Write-only sink for raw payloads. The engine never reads it back during
/// normal operation.
#[async_trait]
pub trait RawStore: Send + Sync {
    async fn store(&self, payload: &RawPayload) -> Result<RawDataId, StoreError>;
}

/// Hash-addressed raw store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileRawStore {
    root: PathBuf,
}

impl FileRawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn extension_for(content_type: &str) -> &'static str {
        match content_type.split(';').next().unwrap_or_default().trim() {
            "application/json" => "json",
            "application/xml" | "text/xml" => "xml",
            "text/csv" => "csv",
            "text/html" => "html",
            _ => "bin",
        }
    }

    pub fn payload_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        datasource: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(datasource)
            .join(stamp)
            .join(format!("{content_hash}.{extension}"))
    }

    /// Writes `bytes` through a temp file and an atomic rename. Returns `true`
    /// when an identical payload already existed at the target path.
    async fn write_atomic(&self, absolute_path: &Path, bytes: &[u8]) -> Result<bool, StoreError> {
        let parent = absolute_path
            .parent()
            .ok_or_else(|| StoreError::Unavailable(format!("{} has no parent", absolute_path.display())))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;

        if fs::try_exists(absolute_path)
            .await
            .map_err(|e| StoreError::io(absolute_path, e))?
        {
            return Ok(true);
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.flush().await.map_err(|e| StoreError::io(&temp_path, e))?;
        drop(file);

        match fs::rename(&temp_path, absolute_path).await {
            Ok(()) => Ok(false),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(true)
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::io(absolute_path, err))
            }
        }
    }
}

#[async_trait]
impl RawStore for FileRawStore {
    async fn store(&self, payload: &RawPayload) -> Result<RawDataId, StoreError> {
        let bytes = payload.payload.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.payload_relative_path(
            payload.captured_at,
            &payload.datasource,
            &content_hash,
            Self::extension_for(&payload.content_type),
        );
        let deduplicated = self.write_atomic(&self.root.join(&relative_path), bytes).await?;
        debug!(
            datasource = %payload.datasource,
            source_id = %payload.source_id,
            deduplicated,
            "stored raw payload"
        );
        Ok(RawDataId(relative_path.to_string_lossy().replace('\\', "/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn payload(body: &str) -> RawPayload {
        RawPayload {
            datasource: "lts".into(),
            source_id: "A1".into(),
            content_type: "application/json; charset=utf-8".into(),
            payload: body.into(),
            captured_at: DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn payload_hashing_is_stable() {
        assert_eq!(
            FileRawStore::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_payloads_share_one_raw_data_id() {
        let dir = tempdir().expect("tempdir");
        let store = FileRawStore::new(dir.path());

        let first = store.store(&payload("{\"id\":1}")).await.expect("first store");
        let second = store.store(&payload("{\"id\":1}")).await.expect("second store");
        let other = store.store(&payload("{\"id\":2}")).await.expect("third store");

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first.0.starts_with("lts/20260224_120000/"));
        assert!(first.0.ends_with(".json"));
        assert!(dir.path().join(&first.0).exists());
    }
}
