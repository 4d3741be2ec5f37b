//! Core types for bucketsync

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BucketSyncError, Result};

/// Largest page a list request may ask for (S3 `MaxKeys` ceiling)
pub const MAX_PAGE_SIZE: usize = 1000;

/// Largest number of keys in one batched delete request
pub const MAX_DELETE_BATCH: usize = 1000;

// =============================================================================
// Scope
// =============================================================================

/// A (bucket, prefix) pair identifying a logical directory in object storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    bucket: String,
    prefix: String,
}

impl Scope {
    /// Create a scope, normalizing the prefix
    ///
    /// A leading `/` is dropped and a non-empty prefix always ends with `/`,
    /// so `public/img` never matches keys under `public/images/`.
    pub fn new(bucket: impl Into<String>, prefix: impl AsRef<str>) -> Result<Self> {
        let bucket = bucket.into();
        validate_bucket(&bucket)?;

        let prefix = normalize_prefix(prefix.as_ref());
        if prefix.contains("//") {
            return Err(BucketSyncError::InvalidScope(format!(
                "prefix contains an empty path segment: {}",
                prefix
            )));
        }

        Ok(Self { bucket, prefix })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full storage key for a key relative to this scope
    pub fn full_key(&self, relative_key: &str) -> String {
        format!("{}{}", self.prefix, relative_key)
    }

    /// Strip this scope's prefix from a storage key
    pub fn relative_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.prefix)
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    }
}

fn validate_bucket(bucket: &str) -> Result<()> {
    if bucket.len() < 3 || bucket.len() > 63 {
        return Err(BucketSyncError::InvalidScope(format!(
            "bucket name must be 3-63 characters: {:?}",
            bucket
        )));
    }
    let valid = bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    if !valid {
        return Err(BucketSyncError::InvalidScope(format!(
            "bucket name may only contain lowercase letters, digits, '-' and '.': {:?}",
            bucket
        )));
    }
    Ok(())
}

// =============================================================================
// Object records and snapshots
// =============================================================================

/// One object within a scope, keyed by its path relative to the scope prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub relative_key: String,
    pub size: u64,
    /// Opaque content identity (ETag) as reported by the service
    pub fingerprint: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectRecord {
    pub fn new(relative_key: impl Into<String>, size: u64) -> Self {
        Self {
            relative_key: relative_key.into(),
            size,
            fingerprint: None,
            last_modified: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    /// Zero-byte trailing-slash key standing in for a directory
    pub fn is_directory_marker(&self) -> bool {
        self.size == 0 && self.relative_key.ends_with('/')
    }

    /// Fingerprint usable as a content hash
    ///
    /// Multipart uploads report `<hash>-<parts>`, which depends on the part size
    /// used by the uploader and is not comparable across copies.
    pub fn content_hash(&self) -> Option<&str> {
        let fingerprint = self.fingerprint.as_deref()?.trim_matches('"');
        if fingerprint.is_empty() {
            return None;
        }
        match fingerprint.rsplit_once('-') {
            Some((_, parts)) if !parts.is_empty() && parts.chars().all(|c| c.is_ascii_digit()) => {
                None
            }
            _ => Some(fingerprint),
        }
    }
}

/// Immutable, key-ordered listing of one scope
#[derive(Debug, Clone)]
pub struct DirectorySnapshot {
    scope: Scope,
    entries: BTreeMap<String, ObjectRecord>,
}

impl DirectorySnapshot {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            entries: BTreeMap::new(),
        }
    }

    /// Build a snapshot from records; a repeated key keeps its first record
    pub fn from_records(scope: Scope, records: impl IntoIterator<Item = ObjectRecord>) -> Self {
        let mut snapshot = Self::new(scope);
        for record in records {
            snapshot.insert(record);
        }
        snapshot
    }

    /// Returns false if the key was already present
    pub(crate) fn insert(&mut self, record: ObjectRecord) -> bool {
        match self.entries.entry(record.relative_key.clone()) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
            btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn get(&self, relative_key: &str) -> Option<&ObjectRecord> {
        self.entries.get(relative_key)
    }

    pub fn contains(&self, relative_key: &str) -> bool {
        self.entries.contains_key(relative_key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records in key order
    pub fn iter(&self) -> impl Iterator<Item = &ObjectRecord> {
        self.entries.values()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|r| r.size).sum()
    }
}

/// Work computed by the diff engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// Records from the source snapshot that must be copied
    pub to_copy: Vec<ObjectRecord>,
    /// Records from the destination snapshot that must be removed
    pub to_delete: Vec<ObjectRecord>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.to_copy.is_empty() && self.to_delete.is_empty()
    }

    pub fn copy_bytes(&self) -> u64 {
        self.to_copy.iter().map(|r| r.size).sum()
    }

    pub fn delete_bytes(&self) -> u64 {
        self.to_delete.iter().map(|r| r.size).sum()
    }
}

// =============================================================================
// Summary
// =============================================================================

/// Kind of mutation applied to the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Copy,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Copy => "copy",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An object-level operation that did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub key: String,
    pub operation: Operation,
    pub cause: String,
}

/// Outcome of one sync invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub count_add: u64,
    pub bytes_add: u64,
    pub count_remove: u64,
    pub bytes_remove: u64,
    pub failures: Vec<FailedOperation>,
    /// Set when the run was interrupted before all work was scheduled
    #[serde(default)]
    pub cancelled: bool,
}

impl SyncSummary {
    /// True when every planned operation succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Add {} files, {}",
            self.count_add,
            size_text(self.bytes_add)
        )?;
        write!(
            f,
            "Delete {} files, {}",
            self.count_remove,
            size_text(self.bytes_remove)
        )?;
        if !self.failures.is_empty() {
            write!(f, "\nFailed {} operations:", self.failures.len())?;
            for failure in &self.failures {
                write!(f, "\n  {} {}: {}", failure.operation, failure.key, failure.cause)?;
            }
        }
        if self.cancelled {
            write!(f, "\nInterrupted before completion")?;
        }
        Ok(())
    }
}

/// Human-readable byte count: KB below 10485 bytes, MB above
pub fn size_text(bytes: u64) -> String {
    if bytes < 10485 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.2} MB", bytes as f64 / 1024.0 / 1024.0)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Tuning for one sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Concurrent copy/delete workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Keys requested per list page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Attempts per operation, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Ceiling for the retry delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Keys per batched delete request
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,
}

fn default_concurrency() -> usize {
    5
}

fn default_page_size() -> usize {
    MAX_PAGE_SIZE
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_delete_batch_size() -> usize {
    MAX_DELETE_BATCH
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            delete_batch_size: default_delete_batch_size(),
        }
    }
}

impl SyncConfig {
    /// Reject settings the storage service or the worker pool cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(BucketSyncError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(BucketSyncError::Config(format!(
                "page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if self.delete_batch_size == 0 || self.delete_batch_size > MAX_DELETE_BATCH {
            return Err(BucketSyncError::Config(format!(
                "delete_batch_size must be between 1 and {}",
                MAX_DELETE_BATCH
            )));
        }
        if self.max_attempts == 0 {
            return Err(BucketSyncError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(BucketSyncError::Config(
                "initial_backoff_ms must not exceed max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stage of a sync invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Listing,
    Diffing,
    Copying,
    Deleting,
    Done,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Listing => "listing",
            SyncPhase::Diffing => "diffing",
            SyncPhase::Copying => "copying",
            SyncPhase::Deleting => "deleting",
            SyncPhase::Done => "done",
            SyncPhase::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_normalizes_prefix() {
        let scope = Scope::new("site-prod", "/public/img").unwrap();
        assert_eq!(scope.prefix(), "public/img/");
        assert_eq!(scope.full_key("a.png"), "public/img/a.png");

        let root = Scope::new("site-prod", "").unwrap();
        assert_eq!(root.prefix(), "");
        assert_eq!(root.full_key("a.png"), "a.png");
    }

    #[test]
    fn test_scope_prefix_does_not_match_sibling() {
        let scope = Scope::new("site-prod", "public/img").unwrap();
        assert_eq!(scope.relative_key("public/img/a.png"), Some("a.png"));
        assert_eq!(scope.relative_key("public/images/a.png"), None);
    }

    #[test]
    fn test_scope_rejects_bad_bucket() {
        assert!(Scope::new("", "public").is_err());
        assert!(Scope::new("My_Bucket", "public").is_err());
        assert!(Scope::new("ok-bucket", "public//img").is_err());
    }

    #[test]
    fn test_content_hash_skips_multipart_etag() {
        let simple = ObjectRecord::new("a", 1).with_fingerprint("\"9b2cf535f27731c974343645a3985328\"");
        assert_eq!(
            simple.content_hash(),
            Some("9b2cf535f27731c974343645a3985328")
        );

        let multipart = ObjectRecord::new("b", 1).with_fingerprint("\"d41d8cd98f00b204e9800998ecf8427e-12\"");
        assert_eq!(multipart.content_hash(), None);

        assert_eq!(ObjectRecord::new("c", 1).content_hash(), None);
    }

    #[test]
    fn test_directory_marker() {
        assert!(ObjectRecord::new("img/", 0).is_directory_marker());
        assert!(!ObjectRecord::new("img/", 3).is_directory_marker());
        assert!(!ObjectRecord::new("img", 0).is_directory_marker());
    }

    #[test]
    fn test_snapshot_keeps_first_record_per_key() {
        let scope = Scope::new("bucket-a", "public").unwrap();
        let snapshot = DirectorySnapshot::from_records(
            scope,
            vec![
                ObjectRecord::new("b", 2),
                ObjectRecord::new("a", 1),
                ObjectRecord::new("b", 99),
            ],
        );

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("b").unwrap().size, 2);
        let keys: Vec<_> = snapshot.iter().map(|r| r.relative_key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(snapshot.total_bytes(), 3);
    }

    #[test]
    fn test_size_text() {
        assert_eq!(size_text(0), "0.00 KB");
        assert_eq!(size_text(2048), "2.00 KB");
        assert_eq!(size_text(10485), "0.01 MB");
        assert_eq!(size_text(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_sync_config_validation() {
        assert!(SyncConfig::default().validate().is_ok());

        let zero_workers = SyncConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(zero_workers.validate().is_err());

        let huge_page = SyncConfig {
            page_size: 5000,
            ..Default::default()
        };
        assert!(huge_page.validate().is_err());

        let backwards_backoff = SyncConfig {
            initial_backoff_ms: 10_000,
            max_backoff_ms: 100,
            ..Default::default()
        };
        assert!(backwards_backoff.validate().is_err());
    }

    #[test]
    fn test_sync_config_deserializes_with_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"concurrency": 8}"#).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.page_size, MAX_PAGE_SIZE);
        assert_eq!(config.max_attempts, 4);
    }

    #[test]
    fn test_summary_display() {
        let summary = SyncSummary {
            count_add: 2,
            bytes_add: 2048,
            failures: vec![FailedOperation {
                key: "x".into(),
                operation: Operation::Copy,
                cause: "Access denied: x".into(),
            }],
            ..Default::default()
        };
        let text = summary.to_string();
        assert!(text.starts_with("Add 2 files, 2.00 KB"));
        assert!(text.contains("copy x: Access denied: x"));
        assert!(!summary.is_clean());
    }
}
