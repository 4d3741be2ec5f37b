//! Directory sync between object-storage scopes
//!
//! A sync lists both scopes concurrently, diffs the snapshots, copies what the
//! destination lacks and optionally removes what the source no longer has.
//! Per-object failures are collected into the returned [`SyncSummary`]; only
//! invocation-level problems (bad scope, missing bucket, rejected credentials)
//! surface as `Err`.

pub mod aggregate;
pub mod diff;
pub mod lister;
pub mod reconcile;
pub mod retry;

pub use aggregate::{aggregate, Tally};
pub use diff::{classify, diff, ChangeReason};
pub use lister::list_all;
pub use reconcile::Reconciler;
pub use retry::RetryPolicy;

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{BucketSyncError, Result};
use crate::storage::{CopyOptions, ObjectStorageClient};
use crate::types::{
    size_text, DiffResult, DirectorySnapshot, Scope, SyncConfig, SyncPhase, SyncSummary,
};

/// One sync invocation: source scope, destination scope and the delete flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub source: Scope,
    pub destination: Scope,
    pub delete_extraneous: bool,
}

impl SyncRequest {
    /// Build a request, rejecting scopes that overlap within one bucket
    ///
    /// Copying `public/` onto `public/img/` of the same bucket would feed the
    /// destination back into the source listing.
    pub fn new(source: Scope, destination: Scope, delete_extraneous: bool) -> Result<Self> {
        if source.bucket() == destination.bucket()
            && (source.prefix().starts_with(destination.prefix())
                || destination.prefix().starts_with(source.prefix()))
        {
            return Err(BucketSyncError::InvalidScope(format!(
                "{} and {} overlap",
                source, destination
            )));
        }

        Ok(Self {
            source,
            destination,
            delete_extraneous,
        })
    }
}

/// Runs syncs against one storage backend
pub struct SyncEngine {
    client: Arc<dyn ObjectStorageClient>,
    config: SyncConfig,
    copy_options: CopyOptions,
    cancel: CancellationToken,
    phase: Arc<watch::Sender<SyncPhase>>,
}

impl SyncEngine {
    pub fn new(client: Arc<dyn ObjectStorageClient>, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let (phase, _) = watch::channel(SyncPhase::Done);
        Ok(Self {
            client,
            config,
            copy_options: CopyOptions::default(),
            cancel: CancellationToken::new(),
            phase: Arc::new(phase),
        })
    }

    /// Options applied to every copy written to the destination
    pub fn with_copy_options(mut self, options: CopyOptions) -> Self {
        self.copy_options = options;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that interrupts running syncs when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Watch phase transitions of the running sync
    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Snapshot of every object under `scope`
    pub async fn list(&self, scope: &Scope) -> Result<DirectorySnapshot> {
        list_all(
            self.client.as_ref(),
            scope,
            self.config.page_size,
            &RetryPolicy::from_config(&self.config),
        )
        .await
    }

    /// List both sides and compute what a sync would do, without mutating anything
    pub async fn plan(&self, request: &SyncRequest) -> Result<DiffResult> {
        let (source, dest) = self.list_both(request).await?;
        Ok(diff(&source, &dest, request.delete_extraneous))
    }

    /// Bring the destination scope in line with the source scope
    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncSummary> {
        tracing::info!(
            "Syncing {} -> {} (delete: {})",
            request.source,
            request.destination,
            request.delete_extraneous
        );

        self.enter(SyncPhase::Listing);
        let (source, dest) = match self.list_both(request).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                self.abort(&e);
                return Err(e);
            }
        };

        self.enter(SyncPhase::Diffing);
        let plan = diff(&source, &dest, request.delete_extraneous);
        tracing::info!(
            "Planned {} copies ({}) and {} deletes ({})",
            plan.to_copy.len(),
            size_text(plan.copy_bytes()),
            plan.to_delete.len(),
            size_text(plan.delete_bytes())
        );

        let tally = self
            .reconciler()
            .reconcile(&request.source, &request.destination, plan)
            .await;

        let summary = tally.into_summary(self.cancel.is_cancelled());
        self.enter(SyncPhase::Done);
        self.log_summary(&summary);
        Ok(summary)
    }

    /// Delete every object under `scope`
    pub async fn remove_all(&self, scope: &Scope) -> Result<SyncSummary> {
        self.enter(SyncPhase::Listing);
        let snapshot = match self.list(scope).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.abort(&e);
                return Err(e);
            }
        };
        tracing::info!(
            "Removing {} objects ({}) from {}",
            snapshot.len(),
            size_text(snapshot.total_bytes()),
            scope
        );

        self.enter(SyncPhase::Deleting);
        let records = snapshot.iter().cloned().collect();
        let tally = self.reconciler().delete_all(scope, records).await;

        let summary = tally.into_summary(self.cancel.is_cancelled());
        self.enter(SyncPhase::Done);
        self.log_summary(&summary);
        Ok(summary)
    }

    async fn list_both(&self, request: &SyncRequest) -> Result<(DirectorySnapshot, DirectorySnapshot)> {
        tokio::try_join!(self.list(&request.source), self.list(&request.destination))
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(Arc::clone(&self.client), &self.config)
            .with_copy_options(self.copy_options.clone())
            .with_cancellation(self.cancel.clone())
            .with_phase(Arc::clone(&self.phase))
    }

    /// Listing failures end the invocation whatever their kind
    fn abort(&self, err: &BucketSyncError) {
        self.enter(SyncPhase::Failed);
        if err.is_fatal() {
            tracing::error!("Sync aborted: {}", err);
        } else {
            tracing::error!("Sync aborted, listing failed: {}", err);
        }
    }

    fn enter(&self, phase: SyncPhase) {
        tracing::debug!("Sync phase: {}", phase.as_str());
        self.phase.send_replace(phase);
    }

    fn log_summary(&self, summary: &SyncSummary) {
        tracing::info!(
            "Added {} files ({}), removed {} files ({}), {} failures",
            summary.count_add,
            size_text(summary.bytes_add),
            summary.count_remove,
            size_text(summary.bytes_remove),
            summary.failures.len()
        );
        if summary.cancelled {
            tracing::warn!("Sync interrupted; summary covers completed operations only");
        }
    }
}

/// Sync `source_bucket/source_prefix` onto `dest_bucket/dest_prefix` in one call
pub async fn sync(
    client: Arc<dyn ObjectStorageClient>,
    config: SyncConfig,
    source_bucket: &str,
    source_prefix: &str,
    dest_bucket: &str,
    dest_prefix: &str,
    delete_extraneous: bool,
) -> Result<SyncSummary> {
    let request = SyncRequest::new(
        Scope::new(source_bucket, source_prefix)?,
        Scope::new(dest_bucket, dest_prefix)?,
        delete_extraneous,
    )?;
    SyncEngine::new(client, config)?.sync(&request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorageClient;

    fn scope(bucket: &str, prefix: &str) -> Scope {
        Scope::new(bucket, prefix).unwrap()
    }

    #[test]
    fn test_request_rejects_overlapping_scopes() {
        assert!(SyncRequest::new(scope("site", "public"), scope("site", "public/img"), false).is_err());
        assert!(SyncRequest::new(scope("site", ""), scope("site", "backup"), false).is_err());
        assert!(SyncRequest::new(scope("site", "public"), scope("site", "public"), false).is_err());
    }

    #[test]
    fn test_request_allows_sibling_prefixes() {
        assert!(SyncRequest::new(scope("site", "public"), scope("site", "publicity"), true).is_ok());
        assert!(SyncRequest::new(scope("site-a", "public"), scope("site-b", "public"), true).is_ok());
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let config = SyncConfig {
            concurrency: 0,
            ..Default::default()
        };
        let result = SyncEngine::new(Arc::new(InMemoryStorageClient::new()), config);
        assert!(matches!(result, Err(BucketSyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_plan_does_not_mutate_destination() {
        let store = InMemoryStorageClient::new();
        store.put("site-dev", "public/a", b"new");
        store.put("site-prod", "public/stale", b"old");

        let engine = SyncEngine::new(Arc::new(store.clone()), SyncConfig::default()).unwrap();
        let request =
            SyncRequest::new(scope("site-dev", "public"), scope("site-prod", "public"), true)
                .unwrap();
        let plan = engine.plan(&request).await.unwrap();

        assert_eq!(plan.to_copy.len(), 1);
        assert_eq!(plan.to_delete.len(), 1);
        assert_eq!(store.keys("site-prod"), vec!["public/stale"]);
        assert_eq!(store.stats().copy_calls, 0);
    }

    #[tokio::test]
    async fn test_phase_ends_done() {
        let store = InMemoryStorageClient::new();
        store.put("site-dev", "public/a", b"x");
        store.create_bucket("site-prod");

        let engine = SyncEngine::new(Arc::new(store), SyncConfig::default()).unwrap();
        let mut phases = engine.subscribe();
        let request =
            SyncRequest::new(scope("site-dev", "public"), scope("site-prod", "public"), false)
                .unwrap();

        engine.sync(&request).await.unwrap();
        assert_eq!(engine.phase(), SyncPhase::Done);
        assert!(phases.has_changed().unwrap());
        assert_eq!(*phases.borrow_and_update(), SyncPhase::Done);
    }
}
