use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

/// Correlation token for one outstanding reservation request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskId(u64);

/// Tracks which of a client's asynchronous requests are still awaiting their
/// single reply.
///
/// Every racer for a request (the deadline timer and each tube the request is
/// queued on) calls [`ack`](Self::ack) before replying; only the first gets
/// `true`, which makes the reply exactly-once.
#[derive(Debug, Default)]
pub struct AsyncTaskTracker {
    seq: AtomicU64,
    pending: Mutex<HashSet<TaskId>>,
}

impl AsyncTaskTracker {
    /// Allocates a fresh task id and marks it pending.
    pub fn new_task(&self) -> TaskId {
        let id = TaskId(self.seq.fetch_add(1, Ordering::Relaxed) + 1);
        trace!(task = id.0, "new task");
        self.pending.lock().insert(id);
        id
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        self.pending.lock().contains(&id)
    }

    /// Marks the task done, returning true only for the call that moved it
    /// out of the pending state.
    pub fn ack(&self, id: TaskId) -> bool {
        let acked = self.pending.lock().remove(&id);
        trace!(task = id.0, acked, "ack task");
        acked
    }

    /// Marks every outstanding task done so no late reply is attempted.
    pub fn ack_all(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
