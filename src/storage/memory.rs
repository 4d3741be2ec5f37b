//! In-memory storage client for tests and local experiments
//!
//! Buckets are ordered maps, listings are paged with a start-after cursor the
//! way S3 pages `ListObjectsV2`, and faults can be scripted per key.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use super::{
    CopyOptions, DeleteError, DeleteOutcome, ListPage, ListedObject, ObjectAcl,
    ObjectStorageClient,
};
use crate::error::{BucketSyncError, Result};
use crate::types::{MAX_DELETE_BATCH, MAX_PAGE_SIZE};

/// Scripted failure for a single key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Service throttling, retryable
    Throttle,
    /// 5xx from the service, retryable
    ServerError,
    /// Access denied, never retryable
    AccessDenied,
}

impl FaultKind {
    fn to_error(self, key: &str) -> BucketSyncError {
        match self {
            FaultKind::Throttle => BucketSyncError::Throttled(format!("SlowDown: {}", key)),
            FaultKind::ServerError => BucketSyncError::Service {
                status: 500,
                message: format!("InternalError: {}", key),
            },
            FaultKind::AccessDenied => BucketSyncError::AccessDenied(key.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct Fault {
    kind: FaultKind,
    /// Remaining triggers; `None` fails forever
    remaining: Option<u32>,
}

impl Fault {
    /// Consume one trigger, returning the error to report if it fires
    fn fire(&mut self, key: &str) -> Option<BucketSyncError> {
        match self.remaining.as_mut() {
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(self.kind.to_error(key))
            }
            None => Some(self.kind.to_error(key)),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    size: u64,
    etag: String,
    last_modified: DateTime<Utc>,
    acl: Option<ObjectAcl>,
}

/// Call counters, readable after a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub list_calls: usize,
    pub copy_calls: usize,
    pub delete_calls: usize,
    /// Highest number of copy/delete calls observed in flight at once
    pub max_in_flight: usize,
}

#[derive(Debug, Default)]
struct FaultPlan {
    copy: HashMap<(String, String), Fault>,
    delete: HashMap<(String, String), Fault>,
    delete_batch: HashMap<String, Fault>,
    list: HashMap<String, BucketSyncError>,
    list_transient: HashMap<String, Fault>,
}

/// Multi-bucket in-memory object store
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorageClient {
    buckets: Arc<RwLock<HashMap<String, BTreeMap<String, StoredObject>>>>,
    faults: Arc<Mutex<FaultPlan>>,
    stats: Arc<Mutex<StoreStats>>,
    in_flight: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

impl InMemoryStorageClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every mutating call, so concurrent calls overlap
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.buckets.write().entry(bucket.to_string()).or_default();
    }

    /// Store an object whose ETag is the hex SHA-256 of `data`
    pub fn put(&self, bucket: &str, key: &str, data: &[u8]) {
        let etag = hex::encode(Sha256::digest(data));
        self.put_with_etag(bucket, key, data.len() as u64, &etag);
    }

    /// Store an object with an explicit size and ETag
    pub fn put_with_etag(&self, bucket: &str, key: &str, size: u64, etag: &str) {
        let object = StoredObject {
            size,
            etag: format!("\"{}\"", etag.trim_matches('"')),
            last_modified: Utc::now(),
            acl: None,
        };
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    pub fn head(&self, bucket: &str, key: &str) -> Option<ListedObject> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|obj| ListedObject {
                key: key.to_string(),
                size: obj.size,
                etag: Some(obj.etag.clone()),
                last_modified: Some(obj.last_modified),
            })
    }

    pub fn acl(&self, bucket: &str, key: &str) -> Option<ObjectAcl> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .and_then(|obj| obj.acl)
    }

    /// All keys in a bucket, in order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .read()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Fail copies into `dest_bucket/dest_key`; `times = None` fails forever
    pub fn fail_copy(&self, dest_bucket: &str, dest_key: &str, kind: FaultKind, times: Option<u32>) {
        self.faults.lock().copy.insert(
            (dest_bucket.to_string(), dest_key.to_string()),
            Fault {
                kind,
                remaining: times,
            },
        );
    }

    /// Report a per-key error for `key` inside batched deletes
    pub fn fail_delete(&self, bucket: &str, key: &str, kind: FaultKind, times: Option<u32>) {
        self.faults.lock().delete.insert(
            (bucket.to_string(), key.to_string()),
            Fault {
                kind,
                remaining: times,
            },
        );
    }

    /// Fail whole delete requests against `bucket`
    pub fn fail_delete_batch(&self, bucket: &str, kind: FaultKind, times: Option<u32>) {
        self.faults.lock().delete_batch.insert(
            bucket.to_string(),
            Fault {
                kind,
                remaining: times,
            },
        );
    }

    /// Fail every list call against `bucket`
    pub fn fail_listing(&self, bucket: &str, error: BucketSyncError) {
        self.faults.lock().list.insert(bucket.to_string(), error);
    }

    /// Fail list calls against `bucket` with a scripted fault
    pub fn fail_listing_with(&self, bucket: &str, kind: FaultKind, times: Option<u32>) {
        self.faults
            .lock()
            .list_transient
            .insert(bucket.to_string(), Fault { kind, remaining: times });
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }

    async fn enter_call(&self) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut stats = self.stats.lock();
            stats.max_in_flight = stats.max_in_flight.max(now);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        }
    }
}

struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStorageClient for InMemoryStorageClient {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        cursor: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage> {
        self.stats.lock().list_calls += 1;

        {
            let mut faults = self.faults.lock();
            if let Some(err) = faults.list.get(bucket) {
                return Err(clone_error(err));
            }
            if let Some(err) = faults
                .list_transient
                .get_mut(bucket)
                .and_then(|fault| fault.fire(bucket))
            {
                return Err(err);
            }
        }

        let max_keys = max_keys.clamp(1, MAX_PAGE_SIZE);
        let buckets = self.buckets.read();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| BucketSyncError::NoSuchBucket(bucket.to_string()))?;

        let mut matching = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| cursor.map_or(true, |after| key.as_str() > after));

        let items: Vec<ListedObject> = matching
            .by_ref()
            .take(max_keys)
            .map(|(key, obj)| ListedObject {
                key: key.clone(),
                size: obj.size,
                etag: Some(obj.etag.clone()),
                last_modified: Some(obj.last_modified),
            })
            .collect();
        let truncated = matching.next().is_some();
        let next_cursor = if truncated {
            items.last().map(|item| item.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            items,
            next_cursor,
            truncated,
        })
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dest_bucket: &str,
        dest_key: &str,
        options: &CopyOptions,
    ) -> Result<()> {
        self.stats.lock().copy_calls += 1;
        let _guard = self.enter_call().await;

        let fault = self
            .faults
            .lock()
            .copy
            .get_mut(&(dest_bucket.to_string(), dest_key.to_string()))
            .and_then(|fault| fault.fire(dest_key));
        if let Some(err) = fault {
            return Err(err);
        }

        let mut buckets = self.buckets.write();
        let source = buckets
            .get(src_bucket)
            .ok_or_else(|| BucketSyncError::NoSuchBucket(src_bucket.to_string()))?
            .get(src_key)
            .cloned()
            .ok_or_else(|| BucketSyncError::NotFound(format!("{}/{}", src_bucket, src_key)))?;
        let dest = buckets
            .get_mut(dest_bucket)
            .ok_or_else(|| BucketSyncError::NoSuchBucket(dest_bucket.to_string()))?;

        dest.insert(
            dest_key.to_string(),
            StoredObject {
                last_modified: Utc::now(),
                acl: options.acl,
                ..source
            },
        );
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<DeleteOutcome> {
        self.stats.lock().delete_calls += 1;
        let _guard = self.enter_call().await;

        if keys.len() > MAX_DELETE_BATCH {
            return Err(BucketSyncError::InvalidRequest(format!(
                "delete batch of {} keys exceeds {}",
                keys.len(),
                MAX_DELETE_BATCH
            )));
        }

        let batch_fault = self
            .faults
            .lock()
            .delete_batch
            .get_mut(bucket)
            .and_then(|fault| fault.fire(bucket));
        if let Some(err) = batch_fault {
            return Err(err);
        }

        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| BucketSyncError::NoSuchBucket(bucket.to_string()))?;

        let mut outcome = DeleteOutcome::default();
        let mut faults = self.faults.lock();
        for key in keys {
            let fault = faults
                .delete
                .get_mut(&(bucket.to_string(), key.clone()))
                .and_then(|fault| fault.fire(key));
            match fault {
                Some(err) => outcome.errors.push(DeleteError {
                    key: key.clone(),
                    message: err.to_string(),
                }),
                None => {
                    objects.remove(key);
                    outcome.deleted.push(key.clone());
                }
            }
        }
        Ok(outcome)
    }
}

/// Listing faults are reported on every call, so hand out a fresh copy
fn clone_error(err: &BucketSyncError) -> BucketSyncError {
    match err {
        BucketSyncError::Unauthorized(msg) => BucketSyncError::Unauthorized(msg.clone()),
        BucketSyncError::AccessDenied(msg) => BucketSyncError::AccessDenied(msg.clone()),
        BucketSyncError::NoSuchBucket(msg) => BucketSyncError::NoSuchBucket(msg.clone()),
        BucketSyncError::Throttled(msg) => BucketSyncError::Throttled(msg.clone()),
        BucketSyncError::Timeout(msg) => BucketSyncError::Timeout(msg.clone()),
        BucketSyncError::Unreachable(msg) => BucketSyncError::Unreachable(msg.clone()),
        BucketSyncError::Service { status, message } => BucketSyncError::Service {
            status: *status,
            message: message.clone(),
        },
        other => BucketSyncError::CloudStorage(other.to_string()),
    }
}
