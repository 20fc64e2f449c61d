use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::job::{Job, JobId};
use super::tracker::AsyncTaskTracker;
use super::tube::Tube;
use crate::types::tube_name::TubeName;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ContextId(pub(crate) u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

struct ContextInner {
    using: Arc<Tube>,
    /// In the order the tubes were first watched.
    watching: Vec<Arc<Tube>>,
    /// Held reservations, soonest deadline first.
    reserved: BTreeMap<(Instant, JobId), Arc<Job>>,
    closed: bool,
}

/// Per-connection state: the tube in use, the watch list, held reservations,
/// and the tracker for its outstanding reservation requests.
pub struct ClientContext {
    id: ContextId,
    tracker: AsyncTaskTracker,
    producer: AtomicBool,
    worker: AtomicBool,
    inner: Mutex<ContextInner>,
}

impl ClientContext {
    /// Creates a context using and watching `default`.
    pub fn new(id: ContextId, default: Arc<Tube>) -> Arc<Self> {
        default.add_user();
        default.add_watcher();

        Arc::new(Self {
            id,
            tracker: AsyncTaskTracker::default(),
            producer: AtomicBool::new(false),
            worker: AtomicBool::new(false),
            inner: Mutex::new(ContextInner {
                using: default.clone(),
                watching: vec![default],
                reserved: BTreeMap::new(),
                closed: false,
            }),
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn tracker(&self) -> &AsyncTaskTracker {
        &self.tracker
    }

    pub fn using(&self) -> Arc<Tube> {
        self.inner.lock().using.clone()
    }

    pub fn use_tube(&self, tube: Arc<Tube>) {
        tube.add_user();
        let previous = std::mem::replace(&mut self.inner.lock().using, tube);
        previous.remove_user();
    }

    /// Adds a tube to the watch list, returning the number watched.
    pub fn watch(&self, tube: Arc<Tube>) -> usize {
        let mut inner = self.inner.lock();
        if !inner.watching.iter().any(|t| Arc::ptr_eq(t, &tube)) {
            tube.add_watcher();
            inner.watching.push(tube);
        }
        inner.watching.len()
    }

    /// Removes a tube from the watch list, returning the number still
    /// watched, or `None` if it is the only tube watched. Ignoring a tube
    /// that isn't watched changes nothing.
    pub fn ignore(&self, name: &TubeName) -> Option<usize> {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.watching.iter().position(|t| t.name() == name)
        else {
            return Some(inner.watching.len());
        };

        if inner.watching.len() == 1 {
            return None;
        }

        inner.watching.remove(idx).remove_watcher();
        Some(inner.watching.len())
    }

    pub fn watching(&self) -> Vec<Arc<Tube>> {
        self.inner.lock().watching.clone()
    }

    pub fn watched_names(&self) -> Vec<TubeName> {
        self.inner
            .lock()
            .watching
            .iter()
            .map(|t| t.name().clone())
            .collect()
    }

    /// Records a new reservation. Refused once the context is closed.
    pub(crate) fn insert_reserved(
        &self,
        until: Instant,
        job: Arc<Job>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.reserved.insert((until, job.id()), job);
        true
    }

    /// Moves a held reservation to a new deadline under one lock.
    pub(crate) fn reschedule_reserved(
        &self,
        from: Instant,
        to: Instant,
        job: Arc<Job>,
    ) {
        let mut inner = self.inner.lock();
        inner.reserved.remove(&(from, job.id()));
        if !inner.closed {
            inner.reserved.insert((to, job.id()), job);
        }
    }

    pub(crate) fn remove_reserved(&self, until: Instant, id: JobId) {
        self.inner.lock().reserved.remove(&(until, id));
    }

    /// The held reservation with the soonest deadline, with that deadline.
    pub fn nearest_expiry(&self) -> Option<(Instant, Arc<Job>)> {
        self.inner
            .lock()
            .reserved
            .iter()
            .next()
            .map(|((until, _), job)| (*until, job.clone()))
    }

    pub fn reserved_count(&self) -> usize {
        self.inner.lock().reserved.len()
    }

    pub fn mark_producer(&self) {
        self.producer.store(true, Ordering::Relaxed);
    }

    pub fn mark_worker(&self) {
        self.worker.store(true, Ordering::Relaxed);
    }

    pub fn is_producer(&self) -> bool {
        self.producer.load(Ordering::Relaxed)
    }

    pub fn is_worker(&self) -> bool {
        self.worker.load(Ordering::Relaxed)
    }

    /// Whether a reservation request from this context is waiting for a job.
    pub fn is_waiting(&self) -> bool {
        self.tracker.pending_count() > 0
    }

    /// Tears the context down when its connection goes away: outstanding
    /// requests are abandoned and held jobs are released back to ready.
    pub fn close(self: &Arc<Self>) {
        self.tracker.ack_all();

        let (reserved, using, watching) = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            (
                std::mem::take(&mut inner.reserved),
                inner.using.clone(),
                std::mem::take(&mut inner.watching),
            )
        };

        let mut released = 0;
        for job in reserved.into_values() {
            if job.release_if_owned(self) {
                released += 1;
            }
        }

        using.remove_user();
        for tube in watching {
            tube.remove_watcher();
        }

        debug!(ctx = %self.id, released, "closed client context");
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
