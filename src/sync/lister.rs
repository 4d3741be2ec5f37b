//! Paginated enumeration of a scope

use crate::error::{BucketSyncError, Result};
use crate::storage::ObjectStorageClient;
use crate::types::{DirectorySnapshot, ObjectRecord, Scope, MAX_PAGE_SIZE};

use super::retry::RetryPolicy;

/// List every object under `scope`, following continuation cursors
///
/// An empty scope yields an empty snapshot. Keys are recorded once each even
/// if the service repeats one across a page boundary. The key equal to the
/// prefix itself (the scope's own folder marker) is not part of the snapshot.
pub async fn list_all(
    client: &dyn ObjectStorageClient,
    scope: &Scope,
    page_size: usize,
    retry: &RetryPolicy,
) -> Result<DirectorySnapshot> {
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
    let mut snapshot = DirectorySnapshot::new(scope.clone());
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;
    let mut repeated = 0usize;

    loop {
        let page = retry
            .run(&format!("list {}", scope), || {
                client.list_page(scope.bucket(), scope.prefix(), cursor.as_deref(), page_size)
            })
            .await?;
        pages += 1;

        for item in page.items {
            let Some(relative_key) = scope.relative_key(&item.key) else {
                tracing::warn!("Listing of {} returned foreign key {}", scope, item.key);
                continue;
            };
            if relative_key.is_empty() {
                continue;
            }

            let record = ObjectRecord {
                relative_key: relative_key.to_string(),
                size: item.size,
                fingerprint: item.etag,
                last_modified: item.last_modified,
            };
            if !snapshot.insert(record) {
                repeated += 1;
            }
        }

        if !page.truncated {
            break;
        }

        match page.next_cursor {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            Some(next) => {
                return Err(BucketSyncError::CloudStorage(format!(
                    "listing of {} did not advance past cursor {}",
                    scope, next
                )))
            }
            None => {
                return Err(BucketSyncError::CloudStorage(format!(
                    "listing of {} is truncated but has no continuation cursor",
                    scope
                )))
            }
        }
    }

    if repeated > 0 {
        tracing::debug!("Skipped {} repeated keys while listing {}", repeated, scope);
    }
    tracing::debug!(
        "Listed {} objects ({} bytes) in {} pages from {}",
        snapshot.len(),
        snapshot.total_bytes(),
        pages,
        scope
    );

    Ok(snapshot)
}
