//! Snapshot reconciliation: what to copy, what to remove

use crate::types::{DiffResult, DirectorySnapshot, ObjectRecord};

/// Why a source object must be copied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// Absent from the destination
    Missing,
    /// Both sides carry comparable content hashes and they differ
    FingerprintChanged,
    /// No comparable hash on one side, and the sizes differ
    SizeChanged,
}

/// Decide whether `source` must be copied over `dest`
///
/// A marker on both sides compares by presence only. Otherwise content hashes win
/// when both sides have one; composite (multipart) fingerprints fall back to a
/// size comparison, which misses same-size edits of multipart objects.
pub fn classify(source: &ObjectRecord, dest: Option<&ObjectRecord>) -> Option<ChangeReason> {
    let Some(dest) = dest else {
        return Some(ChangeReason::Missing);
    };

    if source.is_directory_marker() && dest.is_directory_marker() {
        return None;
    }

    match (source.content_hash(), dest.content_hash()) {
        (Some(src_hash), Some(dest_hash)) if src_hash != dest_hash => {
            Some(ChangeReason::FingerprintChanged)
        }
        (Some(_), Some(_)) => None,
        _ if source.size != dest.size => Some(ChangeReason::SizeChanged),
        _ => None,
    }
}

/// Compute the copy set and, when `delete_extraneous` is set, the delete set
///
/// Pure: neither snapshot is modified and equal inputs give equal output.
/// Both sets come out in key order.
pub fn diff(
    source: &DirectorySnapshot,
    dest: &DirectorySnapshot,
    delete_extraneous: bool,
) -> DiffResult {
    let to_copy = source
        .iter()
        .filter(|record| {
            let reason = classify(record, dest.get(&record.relative_key));
            if let Some(reason) = reason {
                tracing::trace!("{} needs copy: {:?}", record.relative_key, reason);
            }
            reason.is_some()
        })
        .cloned()
        .collect();

    let to_delete = if delete_extraneous {
        dest.iter()
            .filter(|record| !source.contains(&record.relative_key))
            .cloned()
            .collect()
    } else {
        Vec::new()
    };

    DiffResult { to_copy, to_delete }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scope;
    use pretty_assertions::assert_eq;

    fn snapshot(bucket: &str, records: Vec<ObjectRecord>) -> DirectorySnapshot {
        DirectorySnapshot::from_records(Scope::new(bucket, "public").unwrap(), records)
    }

    fn keys(records: &[ObjectRecord]) -> Vec<&str> {
        records.iter().map(|r| r.relative_key.as_str()).collect()
    }

    #[test]
    fn test_empty_snapshots() {
        let result = diff(&snapshot("src-env", vec![]), &snapshot("dest-env", vec![]), true);
        assert!(result.is_empty());
    }

    #[test]
    fn test_add_and_delete_scenario() {
        let source = snapshot(
            "src-env",
            vec![
                ObjectRecord::new("a", 10).with_fingerprint("fa"),
                ObjectRecord::new("b", 20).with_fingerprint("fb"),
            ],
        );
        let dest = snapshot(
            "dest-env",
            vec![
                ObjectRecord::new("b", 20).with_fingerprint("fb"),
                ObjectRecord::new("c", 5).with_fingerprint("fc"),
            ],
        );

        let keep = diff(&source, &dest, false);
        assert_eq!(keys(&keep.to_copy), vec!["a"]);
        assert!(keep.to_delete.is_empty());
        assert_eq!(keep.copy_bytes(), 10);

        let prune = diff(&source, &dest, true);
        assert_eq!(keys(&prune.to_copy), vec!["a"]);
        assert_eq!(keys(&prune.to_delete), vec!["c"]);
        assert_eq!(prune.delete_bytes(), 5);
    }

    #[test]
    fn test_fingerprint_change_with_equal_size() {
        let source = snapshot("src-env", vec![ObjectRecord::new("x", 10).with_fingerprint("F1")]);
        let dest = snapshot("dest-env", vec![ObjectRecord::new("x", 10).with_fingerprint("F2")]);

        let result = diff(&source, &dest, false);
        assert_eq!(keys(&result.to_copy), vec!["x"]);
    }

    #[test]
    fn test_multipart_fingerprint_falls_back_to_size() {
        let src = ObjectRecord::new("video.mp4", 50).with_fingerprint("abc-3");
        let same_size = ObjectRecord::new("video.mp4", 50).with_fingerprint("def");
        let other_size = ObjectRecord::new("video.mp4", 51).with_fingerprint("abc-3");

        assert_eq!(classify(&src, Some(&same_size)), None);
        assert_eq!(
            classify(&src, Some(&other_size)),
            Some(ChangeReason::SizeChanged)
        );
    }

    #[test]
    fn test_missing_fingerprint_falls_back_to_size() {
        let src = ObjectRecord::new("doc", 3);
        assert_eq!(classify(&src, Some(&ObjectRecord::new("doc", 3))), None);
        assert_eq!(
            classify(&src, Some(&ObjectRecord::new("doc", 4).with_fingerprint("h"))),
            Some(ChangeReason::SizeChanged)
        );
    }

    #[test]
    fn test_directory_marker_compares_presence_only() {
        let marker = ObjectRecord::new("img/", 0).with_fingerprint("d41d8cd98f00b204e9800998ecf8427e");
        let other = ObjectRecord::new("img/", 0).with_fingerprint("ffff");

        assert_eq!(classify(&marker, Some(&other)), None);
        assert_eq!(classify(&marker, None), Some(ChangeReason::Missing));
    }

    #[test]
    fn test_marker_over_object_with_content_is_copied() {
        let marker = ObjectRecord::new("img/", 0).with_fingerprint("d41d8cd98f00b204e9800998ecf8427e");
        let filled = ObjectRecord::new("img/", 5).with_fingerprint("abcdef");
        let unhashed = ObjectRecord::new("img/", 5);

        assert_eq!(
            classify(&marker, Some(&filled)),
            Some(ChangeReason::FingerprintChanged)
        );
        assert_eq!(
            classify(&marker, Some(&unhashed)),
            Some(ChangeReason::SizeChanged)
        );
    }

    #[test]
    fn test_diff_does_not_mutate_inputs() {
        let source = snapshot("src-env", vec![ObjectRecord::new("a", 1)]);
        let dest = snapshot("dest-env", vec![ObjectRecord::new("z", 1)]);

        let first = diff(&source, &dest, true);
        let second = diff(&source, &dest, true);
        assert_eq!(first, second);
        assert_eq!(source.len(), 1);
        assert_eq!(dest.len(), 1);
    }
}
