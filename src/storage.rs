//! Bucketed file storage on the local filesystem. Each bucket is a directory
//! under the storage root holding a `.bucket.json` manifest with its limits.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const RECEIPTS_BUCKET: &str = "receipts";
const MANIFEST: &str = ".bucket.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket {0} not found")]
    BucketNotFound(String),
    #[error("invalid bucket name {0:?}")]
    InvalidBucketName(String),
    #[error("mime type {0} is not supported")]
    MimeNotAllowed(String),
    #[error("object exceeded the maximum allowed size of {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("empty upload")]
    Empty,
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bucket manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketOptions {
    pub public: bool,
    pub allowed_mime_types: Vec<String>,
    pub file_size_limit: u64,
}

impl BucketOptions {
    /// Receipt photos: common image types up to 5 MiB.
    pub fn receipts() -> Self {
        BucketOptions {
            public: true,
            allowed_mime_types: ["image/jpeg", "image/png", "image/gif", "image/webp"]
                .into_iter()
                .map(String::from)
                .collect(),
            file_size_limit: 5 * 1024 * 1024,
        }
    }
}

/// Where an accepted upload must be written, and the URL it will be served at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub path: PathBuf,
    pub public_url: String,
}

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Storage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, name: &str) -> Result<PathBuf, StorageError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !valid {
            return Err(StorageError::InvalidBucketName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    /// Creates the bucket. Returns `false` when it already existed; its
    /// options are left untouched in that case.
    pub fn create_bucket(&self, name: &str, options: &BucketOptions) -> Result<bool, StorageError> {
        let dir = self.bucket_dir(name)?;
        let manifest = dir.join(MANIFEST);
        if manifest.exists() {
            return Ok(false);
        }
        fs::create_dir_all(&dir)?;
        fs::write(&manifest, serde_json::to_vec_pretty(options)?)?;
        Ok(true)
    }

    pub fn bucket(&self, name: &str) -> Result<BucketOptions, StorageError> {
        let manifest = self.bucket_dir(name)?.join(MANIFEST);
        if !manifest.exists() {
            return Err(StorageError::BucketNotFound(name.to_string()));
        }
        Ok(serde_json::from_slice(&fs::read(manifest)?)?)
    }

    /// Checks an upload against the bucket limits and picks a unique object
    /// name `<millis>_<random>.<ext>` for it.
    pub fn prepare_upload(
        &self,
        bucket: &str,
        file_name: Option<&str>,
        content_type: Option<&str>,
        len: u64,
        now_ms: i64,
    ) -> Result<PendingUpload, StorageError> {
        let options = self.bucket(bucket)?;
        if len == 0 {
            return Err(StorageError::Empty);
        }
        if len > options.file_size_limit {
            return Err(StorageError::TooLarge {
                limit: options.file_size_limit,
            });
        }
        let mime = content_type.unwrap_or("application/octet-stream");
        if !options.allowed_mime_types.is_empty()
            && !options.allowed_mime_types.iter().any(|allowed| allowed == mime)
        {
            return Err(StorageError::MimeNotAllowed(mime.to_string()));
        }

        let ext = file_name
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .filter(|ext| ext.chars().all(|ch| ch.is_ascii_alphanumeric()))
            .unwrap_or_else(|| extension_for(mime).to_string());
        let random = Uuid::new_v4().simple().to_string();
        let object = format!("{now_ms}_{}.{ext}", &random[..7]);

        Ok(PendingUpload {
            path: self.root.join(bucket).join(&object),
            public_url: public_url(bucket, &object),
        })
    }
}

pub fn public_url(bucket: &str, object: &str) -> String {
    format!("/storage/{bucket}/{object}")
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_bucket_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        assert!(storage.create_bucket(RECEIPTS_BUCKET, &BucketOptions::receipts()).unwrap());
        assert!(!storage.create_bucket(RECEIPTS_BUCKET, &BucketOptions::receipts()).unwrap());
        assert_eq!(storage.bucket(RECEIPTS_BUCKET).unwrap(), BucketOptions::receipts());
    }

    #[test]
    fn accepts_images_within_limits() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        storage.create_bucket(RECEIPTS_BUCKET, &BucketOptions::receipts()).unwrap();

        let upload = storage
            .prepare_upload(RECEIPTS_BUCKET, Some("nota.PNG"), Some("image/png"), 1024, 1_750_000_000_000)
            .unwrap();
        assert!(upload.public_url.starts_with("/storage/receipts/1750000000000_"));
        assert!(upload.public_url.ends_with(".png"));
        assert_eq!(upload.path.parent().unwrap(), dir.path().join(RECEIPTS_BUCKET));
    }

    #[test]
    fn rejects_wrong_type_size_and_missing_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        assert!(matches!(
            storage.prepare_upload(RECEIPTS_BUCKET, None, Some("image/png"), 10, 0),
            Err(StorageError::BucketNotFound(_))
        ));

        storage.create_bucket(RECEIPTS_BUCKET, &BucketOptions::receipts()).unwrap();
        assert!(matches!(
            storage.prepare_upload(RECEIPTS_BUCKET, Some("a.pdf"), Some("application/pdf"), 10, 0),
            Err(StorageError::MimeNotAllowed(_))
        ));
        assert!(matches!(
            storage.prepare_upload(RECEIPTS_BUCKET, Some("a.jpg"), Some("image/jpeg"), 6 * 1024 * 1024, 0),
            Err(StorageError::TooLarge { .. })
        ));
        assert!(matches!(
            storage.prepare_upload(RECEIPTS_BUCKET, Some("a.jpg"), Some("image/jpeg"), 0, 0),
            Err(StorageError::Empty)
        ));
    }

    #[test]
    fn bucket_names_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        assert!(matches!(
            storage.create_bucket("../etc", &BucketOptions::receipts()),
            Err(StorageError::InvalidBucketName(_))
        ));
    }
}
