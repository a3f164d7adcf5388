//! Reconciliation engine
//!
//! Pure classification of (local index, remote file list) into action
//! sets. `local` is the server-authoritative index; `remote` is the
//! caller-supplied list. The table is conservative: any pairing that is
//! not a clean one-sided change becomes a conflict, and conflict
//! resolution is left entirely to the caller.

use std::collections::HashMap;

use tracing::{debug, trace};

use mirra_proto::{ActionSet, FileRecord, FileState};

use crate::errors::{Result, SyncError};

/// Output of one reconciliation call.
///
/// `actions` is the wire-visible [`ActionSet`]; `stage_removals` names
/// local files the caller must hand to the staged-commit helper (they
/// carry no action-list entry).
#[derive(Debug, Default)]
pub struct Plan {
    pub actions: ActionSet,
    pub stage_removals: Vec<FileRecord>,
}

/// Classify every file into upload/download/remove/conflict.
///
/// Each remote record is consumed at most once; unmatched remote records
/// with a state other than `Deleted` are appended to `to_upload` after
/// the local pass.
pub fn reconcile(local: &[FileRecord], remote: &[FileRecord]) -> Result<Plan> {
    let mut remaining: HashMap<&str, &FileRecord> =
        remote.iter().map(|r| (r.path.as_str(), r)).collect();

    let mut plan = Plan::default();

    for record in local {
        match remaining.remove(record.path.as_str()) {
            None => {
                if record.state != FileState::Deleted {
                    trace!("No remote match, download: {}", record.path);
                    plan.actions.to_download.push(record.clone());
                }
            }
            Some(matched) => classify_pair(record, matched, &mut plan)?,
        }
    }

    // Remote-only files flow back to the remote side as uploads.
    for (_, record) in remaining {
        if record.state != FileState::Deleted {
            trace!("Unmatched remote record, upload: {}", record.path);
            plan.actions.to_upload.push(record.clone());
        }
    }

    debug!(
        "Reconciled {} local / {} remote records: {} up, {} down, {} remove, {} conflict, {} staged removals",
        local.len(),
        remote.len(),
        plan.actions.to_upload.len(),
        plan.actions.to_download.len(),
        plan.actions.to_remove.len(),
        plan.actions.conflicts.len(),
        plan.stage_removals.len(),
    );

    Ok(plan)
}

fn classify_pair(local: &FileRecord, remote: &FileRecord, plan: &mut Plan) -> Result<()> {
    use FileState::*;

    match (remote.state, local.state) {
        // Remote deleted a file the local side left alone (or also
        // deleted): stage the local copy for physical removal.
        (Deleted, NotChanged) | (Deleted, Deleted) => {
            plan.stage_removals.push(local.clone());
        }
        // Remote deleted, but local re-created it: local wins.
        (Deleted, New) => plan.actions.to_download.push(local.clone()),
        // Remote deleted what local modified: unresolvable here.
        (Deleted, Modified) => plan.actions.conflicts.push(local.clone()),

        // A remote `New` colliding with any local record means both
        // sides created the path independently.
        (New, _) => plan.actions.conflicts.push(local.clone()),

        // Clean remote-side edit. Note: the local record is pushed, not
        // the remote one; preserved as-is pending product-owner review.
        (Modified, NotChanged) => plan.actions.to_upload.push(local.clone()),
        (Modified, _) => plan.actions.conflicts.push(remote.clone()),

        (NotChanged, Modified) => plan.actions.to_download.push(local.clone()),
        (NotChanged, Deleted) => plan.actions.to_remove.push(remote.clone()),
        (NotChanged, New) => {
            // A matched remote record cannot be unchanged against a path
            // the ledger has never stored.
            return Err(SyncError::InvariantViolation(format!(
                "remote NotChanged paired with local New for {}",
                local.path
            )));
        }

        (NotChanged, NotChanged) => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, digest: &str, state: FileState) -> FileRecord {
        FileRecord::new(path, digest, state)
    }

    #[test]
    fn test_identical_lists_yield_empty_plan() {
        let files = vec![
            record("a.txt", "d1", FileState::NotChanged),
            record("b/c.txt", "d2", FileState::NotChanged),
        ];
        let plan = reconcile(&files, &files).unwrap();
        assert!(plan.actions.is_empty());
        assert!(plan.stage_removals.is_empty());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let local = vec![
            record("a.txt", "d1", FileState::NotChanged),
            record("b.txt", "d2", FileState::Modified),
        ];
        let remote = vec![
            record("a.txt", "d1", FileState::NotChanged),
            record("c.txt", "d3", FileState::New),
        ];

        let first = reconcile(&local, &remote).unwrap();
        let second = reconcile(&local, &remote).unwrap();

        assert_eq!(first.actions.to_upload, second.actions.to_upload);
        assert_eq!(first.actions.to_download, second.actions.to_download);
        assert_eq!(first.actions.to_remove, second.actions.to_remove);
        assert_eq!(first.actions.conflicts, second.actions.conflicts);
    }

    #[test]
    fn test_local_only_records() {
        let local = vec![
            record("present.txt", "d1", FileState::NotChanged),
            record("tombstone.txt", "d2", FileState::Deleted),
        ];
        let plan = reconcile(&local, &[]).unwrap();

        assert_eq!(plan.actions.to_download.len(), 1);
        assert_eq!(plan.actions.to_download[0].path, "present.txt");
        // Deleted local record with no remote match: no action at all.
        assert_eq!(plan.actions.len(), 1);
    }

    #[test]
    fn test_remote_deleted_rows() {
        let local = vec![
            record("quiet.txt", "d1", FileState::NotChanged),
            record("both.txt", "d2", FileState::Deleted),
            record("recreated.txt", "d3", FileState::New),
            record("edited.txt", "d4", FileState::Modified),
        ];
        let remote = vec![
            record("quiet.txt", "d1", FileState::Deleted),
            record("both.txt", "d2", FileState::Deleted),
            record("recreated.txt", "old", FileState::Deleted),
            record("edited.txt", "old", FileState::Deleted),
        ];
        let plan = reconcile(&local, &remote).unwrap();

        let staged: Vec<&str> = plan.stage_removals.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(staged, vec!["quiet.txt", "both.txt"]);
        assert_eq!(plan.actions.to_download.len(), 1);
        assert_eq!(plan.actions.to_download[0].path, "recreated.txt");
        assert_eq!(plan.actions.conflicts.len(), 1);
        assert_eq!(plan.actions.conflicts[0].path, "edited.txt");
    }

    #[test]
    fn test_remote_new_always_conflicts() {
        for state in [
            FileState::NotChanged,
            FileState::Modified,
            FileState::Deleted,
        ] {
            let local = vec![record("x.txt", "d1", state)];
            let remote = vec![record("x.txt", "d2", FileState::New)];
            let plan = reconcile(&local, &remote).unwrap();
            assert_eq!(plan.actions.conflicts.len(), 1, "state {:?}", state);
        }
    }

    #[test]
    fn test_remote_modified_rows() {
        let local = vec![
            record("clean.txt", "d1", FileState::NotChanged),
            record("dirty.txt", "d2", FileState::Modified),
        ];
        let remote = vec![
            record("clean.txt", "r1", FileState::Modified),
            record("dirty.txt", "r2", FileState::Modified),
        ];
        let plan = reconcile(&local, &remote).unwrap();

        // Documented asymmetry: the local record lands in to_upload.
        assert_eq!(plan.actions.to_upload.len(), 1);
        assert_eq!(plan.actions.to_upload[0].digest, "d1");

        // Both-sides-modified routes the remote record to conflicts.
        assert_eq!(plan.actions.conflicts.len(), 1);
        assert_eq!(plan.actions.conflicts[0].digest, "r2");
    }

    #[test]
    fn test_remote_not_changed_rows() {
        let local = vec![
            record("edited.txt", "d1", FileState::Modified),
            record("gone.txt", "d2", FileState::Deleted),
        ];
        let remote = vec![
            record("edited.txt", "r1", FileState::NotChanged),
            record("gone.txt", "r2", FileState::NotChanged),
        ];
        let plan = reconcile(&local, &remote).unwrap();

        assert_eq!(plan.actions.to_download.len(), 1);
        assert_eq!(plan.actions.to_download[0].path, "edited.txt");
        assert_eq!(plan.actions.to_remove.len(), 1);
        assert_eq!(plan.actions.to_remove[0].digest, "r2");
    }

    #[test]
    fn test_not_changed_new_is_invariant_violation() {
        let local = vec![record("x.txt", "d1", FileState::New)];
        let remote = vec![record("x.txt", "d1", FileState::NotChanged)];
        assert!(matches!(
            reconcile(&local, &remote),
            Err(SyncError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_unmatched_remote_records_upload() {
        let remote = vec![
            record("fresh.txt", "r1", FileState::New),
            record("tombstone.txt", "r2", FileState::Deleted),
        ];
        let plan = reconcile(&[], &remote).unwrap();

        assert_eq!(plan.actions.to_upload.len(), 1);
        assert_eq!(plan.actions.to_upload[0].path, "fresh.txt");
    }

    #[test]
    fn test_every_record_classified_at_most_once() {
        let local = vec![
            record("a.txt", "d1", FileState::NotChanged),
            record("b.txt", "d2", FileState::Modified),
            record("c.txt", "d3", FileState::Deleted),
            record("d.txt", "d4", FileState::New),
            record("e.txt", "d5", FileState::NotChanged),
        ];
        let remote = vec![
            record("a.txt", "r1", FileState::Modified),
            record("b.txt", "r2", FileState::NotChanged),
            record("c.txt", "r3", FileState::NotChanged),
            record("d.txt", "r4", FileState::Deleted),
            record("e.txt", "r5", FileState::Deleted),
            record("f.txt", "r6", FileState::New),
        ];
        let plan = reconcile(&local, &remote).unwrap();

        let mut seen = std::collections::HashSet::new();
        let lists = [
            &plan.actions.to_upload,
            &plan.actions.to_download,
            &plan.actions.to_remove,
            &plan.actions.conflicts,
        ];
        for list in lists {
            for r in list {
                assert!(seen.insert(r.path.clone()), "{} classified twice", r.path);
            }
        }
        for r in &plan.stage_removals {
            assert!(seen.insert(r.path.clone()), "{} classified twice", r.path);
        }
    }
}
