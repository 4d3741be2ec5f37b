//! Folding per-worker results into a summary

use crate::types::{FailedOperation, ObjectRecord, Operation, SyncSummary};

/// Partial result of one worker
///
/// `merge` is associative and commutative up to the order of its lists, and
/// `into_summary` sorts failures, so the summary does not depend on which
/// worker finished first.
#[derive(Debug, Clone, Default)]
pub struct Tally {
    pub copied: Vec<ObjectRecord>,
    pub deleted: Vec<ObjectRecord>,
    pub failures: Vec<FailedOperation>,
}

impl Tally {
    pub fn record_copy(&mut self, record: ObjectRecord) {
        self.copied.push(record);
    }

    pub fn record_delete(&mut self, record: ObjectRecord) {
        self.deleted.push(record);
    }

    pub fn record_failure(&mut self, key: &str, operation: Operation, cause: impl Into<String>) {
        self.failures.push(FailedOperation {
            key: key.to_string(),
            operation,
            cause: cause.into(),
        });
    }

    pub fn merge(mut self, other: Tally) -> Tally {
        self.copied.extend(other.copied);
        self.deleted.extend(other.deleted);
        self.failures.extend(other.failures);
        self
    }

    pub fn into_summary(self, cancelled: bool) -> SyncSummary {
        let mut summary = aggregate(&self.copied, &self.deleted, self.failures);
        summary.cancelled = cancelled;
        summary
    }
}

/// Sum sizes over the successful sets and carry failures through
pub fn aggregate(
    copied: &[ObjectRecord],
    deleted: &[ObjectRecord],
    mut failures: Vec<FailedOperation>,
) -> SyncSummary {
    failures.sort_by(|a, b| {
        (a.operation.as_str(), a.key.as_str()).cmp(&(b.operation.as_str(), b.key.as_str()))
    });

    SyncSummary {
        count_add: copied.len() as u64,
        bytes_add: copied.iter().map(|r| r.size).sum(),
        count_remove: deleted.len() as u64,
        bytes_remove: deleted.iter().map(|r| r.size).sum(),
        failures,
        cancelled: false,
    }
}
