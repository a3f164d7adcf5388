//! Observer channel for sync progress
//!
//! Zero or more observers, fire-and-forget, no return value: events are
//! pushed onto an unbounded channel handed in at client construction and
//! drained by the caller. A closed channel is ignored.

use tokio::sync::mpsc;

use mirra_proto::FileRecord;

/// Human-relevant narration of one synchronization run.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    SessionOpened {
        session_id: String,
    },
    /// Action counts returned by the server's reconciliation.
    Classified {
        to_upload: usize,
        to_download: usize,
        to_remove: usize,
        conflicts: usize,
    },
    Downloaded {
        path: String,
        bytes: u64,
    },
    Uploaded {
        path: String,
        bytes: u64,
    },
    Removed {
        path: String,
    },
    /// A file changed on both sides; never auto-resolved.
    Conflict {
        record: FileRecord,
    },
    Finished {
        downloaded: usize,
        uploaded: usize,
        removed: usize,
        conflicts: usize,
    },
}

pub type EventSink = mpsc::UnboundedSender<SyncEvent>;

/// Emit an event if a sink is attached; delivery is best-effort.
pub(crate) fn emit(sink: &Option<EventSink>, event: SyncEvent) {
    if let Some(sink) = sink {
        let _ = sink.send(event);
    }
}
