//! Object storage client abstraction
//!
//! The sync engine only talks to storage through the [`ObjectStorageClient`]
//! trait. Implementations:
//! - `S3StorageClient`: AWS S3 and S3-compatible services (feature `cloud`)
//! - `InMemoryStorageClient`: paged in-memory buckets with fault injection

pub mod memory;
#[cfg(feature = "cloud")]
pub mod s3;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BucketSyncError, Result};

pub use memory::{FaultKind, InMemoryStorageClient, StoreStats};
#[cfg(feature = "cloud")]
pub use s3::S3StorageClient;

/// One object as returned by a list call, with its full storage key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a paginated listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<ListedObject>,
    /// Cursor to pass to the next call, if the service returned one
    pub next_cursor: Option<String>,
    /// Whether the service reports more results after this page
    pub truncated: bool,
}

/// Canned access policy applied to copied objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectAcl {
    Private,
    PublicRead,
}

impl ObjectAcl {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectAcl::Private => "private",
            ObjectAcl::PublicRead => "public-read",
        }
    }
}

/// Options for a server-side copy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyOptions {
    pub acl: Option<ObjectAcl>,
}

/// A key the service refused to delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteError {
    pub key: String,
    pub message: String,
}

/// Per-key result of a batched delete
#[derive(Debug, Clone, Default)]
pub struct DeleteOutcome {
    pub deleted: Vec<String>,
    pub errors: Vec<DeleteError>,
}

/// Capabilities the sync engine needs from a storage service
///
/// Every method is a single network round trip. Retrying is the caller's
/// business; implementations report failures through [`BucketSyncError`]
/// variants so that `is_retryable` classifies them correctly.
#[async_trait]
pub trait ObjectStorageClient: Send + Sync {
    /// Fetch one page of objects under `prefix`, starting after `cursor`
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        cursor: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage>;

    /// Copy an object within the service, without moving bytes through this process
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dest_bucket: &str,
        dest_key: &str,
        options: &CopyOptions,
    ) -> Result<()>;

    /// Delete up to one batch of keys; absent keys count as deleted
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<DeleteOutcome>;
}

/// Which storage service to talk to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    /// AWS S3 with the default credential chain
    S3 {
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
    /// DigitalOcean Spaces with static keys
    Space {
        bucket: String,
        /// Host name, e.g. `sfo3.digitaloceanspaces.com`
        endpoint: String,
        #[serde(rename = "accessKeyId", alias = "access_key_id")]
        access_key_id: String,
        #[serde(rename = "secretAccessKey", alias = "secret_access_key")]
        secret_access_key: String,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::S3 {
            region: None,
            endpoint: None,
        }
    }
}

impl BackendConfig {
    /// Load a backend description from a JSON file (`~` is expanded)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = path.as_ref().to_string_lossy();
        let expanded = shellexpand::tilde(&raw).to_string();
        let content = std::fs::read_to_string(&expanded).map_err(|e| {
            BucketSyncError::Config(format!("cannot read backend config {}: {}", expanded, e))
        })?;
        let config: BackendConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let BackendConfig::Space {
            bucket,
            endpoint,
            access_key_id,
            secret_access_key,
        } = self
        {
            let missing = [
                ("bucket", bucket),
                ("endpoint", endpoint),
                ("accessKeyId", access_key_id),
                ("secretAccessKey", secret_access_key),
            ]
            .into_iter()
            .find(|(_, value)| value.trim().is_empty());
            if let Some((name, _)) = missing {
                return Err(BucketSyncError::Config(format!(
                    "space backend config is missing {}",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Bucket pinned by the backend config, if any
    pub fn default_bucket(&self) -> Option<&str> {
        match self {
            BackendConfig::S3 { .. } => None,
            BackendConfig::Space { bucket, .. } => Some(bucket),
        }
    }

    /// Copy options this backend requires for objects it receives
    pub fn copy_options(&self) -> CopyOptions {
        match self {
            BackendConfig::S3 { .. } => CopyOptions::default(),
            BackendConfig::Space { .. } => CopyOptions {
                acl: Some(ObjectAcl::PublicRead),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_backend_config_defaults_to_s3() {
        let config = BackendConfig::default();
        assert_eq!(config.copy_options(), CopyOptions::default());
        assert_eq!(config.default_bucket(), None);
    }

    #[test]
    fn test_space_config_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"backend":"space","bucket":"media","endpoint":"sfo3.digitaloceanspaces.com","accessKeyId":"AK","secretAccessKey":"SK"}}"#
        )
        .unwrap();

        let config = BackendConfig::load(file.path()).unwrap();
        assert_eq!(config.default_bucket(), Some("media"));
        assert_eq!(config.copy_options().acl, Some(ObjectAcl::PublicRead));
    }

    #[test]
    fn test_space_config_rejects_blank_fields() {
        let config = BackendConfig::Space {
            bucket: "media".into(),
            endpoint: "nyc3.digitaloceanspaces.com".into(),
            access_key_id: " ".into(),
            secret_access_key: "SK".into(),
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("accessKeyId"));
    }

    #[test]
    fn test_missing_config_file_is_config_error() {
        let err = BackendConfig::load("/nonexistent/bucketsync/config.json").unwrap_err();
        assert!(matches!(err, BucketSyncError::Config(_)));
    }
}
