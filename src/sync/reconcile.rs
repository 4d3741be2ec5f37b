//! Bounded-concurrency execution of copies and deletes
//!
//! Jobs are queued on an `async-channel` and drained by a fixed number of
//! tokio workers. Each job runs in its own task, so a job that panics is
//! still reported as a failure. Each worker keeps its own [`Tally`]; the
//! tallies are merged once every worker has returned.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::aggregate::Tally;
use super::retry::RetryPolicy;
use crate::storage::{CopyOptions, ObjectStorageClient};
use crate::types::{DiffResult, ObjectRecord, Operation, Scope, SyncConfig, SyncPhase};

/// Executes a [`DiffResult`] against the destination scope
#[derive(Clone)]
pub struct Reconciler {
    client: Arc<dyn ObjectStorageClient>,
    concurrency: usize,
    delete_batch_size: usize,
    retry: RetryPolicy,
    copy_options: CopyOptions,
    cancel: CancellationToken,
    phase: Option<Arc<watch::Sender<SyncPhase>>>,
}

impl Reconciler {
    pub fn new(client: Arc<dyn ObjectStorageClient>, config: &SyncConfig) -> Self {
        Self {
            client,
            concurrency: config.concurrency.max(1),
            delete_batch_size: config.delete_batch_size.max(1),
            retry: RetryPolicy::from_config(config),
            copy_options: CopyOptions::default(),
            cancel: CancellationToken::new(),
            phase: None,
        }
    }

    pub fn with_copy_options(mut self, options: CopyOptions) -> Self {
        self.copy_options = options;
        self
    }

    /// Stop handing out new jobs once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish `Copying` and `Deleting` on `phase` as the phases start
    pub fn with_phase(mut self, phase: Arc<watch::Sender<SyncPhase>>) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Run the copy phase, then the delete phase if there is anything to delete
    pub async fn reconcile(&self, source: &Scope, dest: &Scope, diff: DiffResult) -> Tally {
        self.enter(SyncPhase::Copying);
        let copied = self.copy_all(source, dest, diff.to_copy).await;
        if diff.to_delete.is_empty() || self.cancel.is_cancelled() {
            return copied;
        }
        self.enter(SyncPhase::Deleting);
        copied.merge(self.delete_all(dest, diff.to_delete).await)
    }

    fn enter(&self, phase: SyncPhase) {
        if let Some(sender) = &self.phase {
            tracing::debug!("Sync phase: {}", phase.as_str());
            sender.send_replace(phase);
        }
    }

    /// Server-side copy of every record from `source` to `dest`
    pub async fn copy_all(&self, source: &Scope, dest: &Scope, records: Vec<ObjectRecord>) -> Tally {
        let client = Arc::clone(&self.client);
        let retry = self.retry;
        let options = Arc::new(self.copy_options.clone());
        let source = Arc::new(source.clone());
        let dest = Arc::new(dest.clone());

        self.run_pool(records, Operation::Copy, copy_keys, move |record: ObjectRecord| {
            let client = Arc::clone(&client);
            let options = Arc::clone(&options);
            let source = Arc::clone(&source);
            let dest = Arc::clone(&dest);
            async move {
                let mut tally = Tally::default();
                let src_key = source.full_key(&record.relative_key);
                let dest_key = dest.full_key(&record.relative_key);

                let result = retry
                    .run(&format!("copy {}", record.relative_key), || {
                        client.copy_object(
                            source.bucket(),
                            &src_key,
                            dest.bucket(),
                            &dest_key,
                            &options,
                        )
                    })
                    .await;

                match result {
                    Ok(()) => {
                        tracing::debug!("Copied {} ({} bytes)", record.relative_key, record.size);
                        tally.record_copy(record);
                    }
                    Err(e) => {
                        tracing::error!("Copy of {} failed: {}", record.relative_key, e);
                        tally.record_failure(&record.relative_key, Operation::Copy, e.to_string());
                    }
                }
                tally
            }
        })
        .await
    }

    /// Remove every record from `dest` in batched delete requests
    pub async fn delete_all(&self, dest: &Scope, records: Vec<ObjectRecord>) -> Tally {
        let batches: Vec<Vec<ObjectRecord>> = records
            .chunks(self.delete_batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let client = Arc::clone(&self.client);
        let retry = self.retry;
        let dest = Arc::new(dest.clone());

        self.run_pool(batches, Operation::Delete, delete_keys, move |batch: Vec<ObjectRecord>| {
            let client = Arc::clone(&client);
            let dest = Arc::clone(&dest);
            async move { delete_batch(client.as_ref(), &dest, retry, batch).await }
        })
        .await
    }

    /// Drain `jobs` with at most `concurrency` running at once
    ///
    /// `keys_of` names the relative keys a job covers; they are recorded as
    /// failed if the job's task dies before producing a tally.
    async fn run_pool<J, F, Fut>(
        &self,
        jobs: Vec<J>,
        operation: Operation,
        keys_of: fn(&J) -> Vec<String>,
        work: F,
    ) -> Tally
    where
        J: Send + 'static,
        F: Fn(J) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Tally> + Send + 'static,
    {
        if jobs.is_empty() {
            return Tally::default();
        }

        let workers = self.concurrency.min(jobs.len());
        let (sender, receiver) = async_channel::bounded::<J>(jobs.len());
        for job in jobs {
            // Capacity covers every job and the receiver outlives this loop
            let _ = sender.try_send(job);
        }
        sender.close();

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let receiver = receiver.clone();
                let work = work.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    let mut tally = Tally::default();
                    while !cancel.is_cancelled() {
                        let Ok(job) = receiver.recv().await else {
                            break;
                        };
                        let keys = keys_of(&job);
                        match tokio::spawn(work(job)).await {
                            Ok(done) => tally = tally.merge(done),
                            Err(e) => {
                                tracing::error!(
                                    "{} job over {} keys aborted: {}",
                                    operation,
                                    keys.len(),
                                    e
                                );
                                let cause = format!("task aborted: {}", e);
                                for key in &keys {
                                    tally.record_failure(key, operation, cause.clone());
                                }
                            }
                        }
                    }
                    tally
                })
            })
            .collect();

        let mut total = Tally::default();
        for joined in join_all(handles).await {
            match joined {
                Ok(tally) => total = total.merge(tally),
                Err(e) => tracing::error!("Sync worker aborted: {}", e),
            }
        }

        let skipped = receiver.len();
        if skipped > 0 {
            tracing::warn!("Interrupted with {} queued operations not started", skipped);
        }
        total
    }
}

fn copy_keys(record: &ObjectRecord) -> Vec<String> {
    vec![record.relative_key.clone()]
}

#[allow(clippy::ptr_arg)]
fn delete_keys(batch: &Vec<ObjectRecord>) -> Vec<String> {
    batch.iter().map(|record| record.relative_key.clone()).collect()
}

async fn delete_batch(
    client: &dyn ObjectStorageClient,
    dest: &Scope,
    retry: RetryPolicy,
    batch: Vec<ObjectRecord>,
) -> Tally {
    let mut tally = Tally::default();
    let keys: Vec<String> = batch
        .iter()
        .map(|record| dest.full_key(&record.relative_key))
        .collect();

    let result = retry
        .run(&format!("delete {} objects", keys.len()), || {
            client.delete_objects(dest.bucket(), &keys)
        })
        .await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Delete batch of {} objects failed: {}", batch.len(), e);
            let cause = e.to_string();
            for record in &batch {
                tally.record_failure(&record.relative_key, Operation::Delete, cause.clone());
            }
            return tally;
        }
    };

    let mut errors: HashMap<String, String> = outcome
        .errors
        .into_iter()
        .map(|err| (err.key, err.message))
        .collect();
    let deleted: std::collections::HashSet<String> = outcome.deleted.into_iter().collect();

    for (record, key) in batch.into_iter().zip(keys) {
        if let Some(message) = errors.remove(&key) {
            tracing::error!("Delete of {} failed: {}", record.relative_key, message);
            tally.record_failure(&record.relative_key, Operation::Delete, message);
        } else if deleted.contains(&key) {
            tracing::debug!("Deleted {} ({} bytes)", record.relative_key, record.size);
            tally.record_delete(record);
        } else {
            tally.record_failure(
                &record.relative_key,
                Operation::Delete,
                "not acknowledged by the storage service",
            );
        }
    }
    tally
}
