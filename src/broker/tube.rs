use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::job::{Job, JobId};
use crate::types::protocol::TubeStats;
use crate::types::tube_name::TubeName;

/// Ready jobs with a priority below this count as urgent in stats.
pub const URGENT_PRIORITY: u32 = 1024;

/// Shortest pause `pause-tube` applies, even for a delay of zero.
pub const MIN_PAUSE: Duration = Duration::from_secs(1);

/// A party waiting for a job to become ready on one or more tubes.
///
/// Waiters sit in a tube's FIFO notify queue. They are always invoked with no
/// tube lock held, so they are free to take jobs from the tube.
pub(crate) trait Waiter: Send + Sync {
    /// Whether the waiter still wants a job. Stale waiters are pruned.
    fn is_pending(&self) -> bool;

    /// Offers the tube to the waiter. Returns false if the waiter was no
    /// longer interested, in which case the next waiter is tried.
    fn notify(self: Arc<Self>, tube: &Arc<Tube>) -> bool;
}

#[derive(Default)]
struct TubeInner {
    /// Ordered by priority, then job ID.
    ready: BTreeMap<(u32, JobId), Arc<Job>>,
    /// Ordered by the time the job becomes ready, then job ID.
    delayed: BTreeMap<(Instant, JobId), Arc<Job>>,
    /// Oldest burial first.
    buried: VecDeque<Arc<Job>>,
    reserved: HashMap<JobId, Arc<Job>>,
    waiters: VecDeque<Arc<dyn Waiter>>,
    paused_until: Option<Instant>,
    /// Length of the most recent pause.
    pause: Duration,
}

impl TubeInner {
    fn is_paused(&self, now: Instant) -> bool {
        matches!(self.paused_until, Some(until) if until > now)
    }
}

/// A named queue of jobs.
///
/// A job sits in exactly one of the tube's ready, delayed, buried or reserved
/// structures. Those structures are only changed by [`Job`] transitions,
/// which hold the job's lock while doing so; the tube lock is always taken
/// last and never held while calling out.
pub struct Tube {
    name: TubeName,
    inner: Mutex<TubeInner>,
    total_jobs: AtomicU64,
    cmd_delete: AtomicU64,
    cmd_pause: AtomicU64,
    using: AtomicU64,
    watching: AtomicU64,
}

impl Tube {
    pub fn new(name: TubeName) -> Arc<Self> {
        Arc::new(Self {
            name,
            inner: Mutex::default(),
            total_jobs: AtomicU64::new(0),
            cmd_delete: AtomicU64::new(0),
            cmd_pause: AtomicU64::new(0),
            using: AtomicU64::new(0),
            watching: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &TubeName {
        &self.name
    }

    /// Removes and returns the most urgent ready job, unless the tube is
    /// paused.
    ///
    /// The job keeps its ready state until it is reserved, so a caller must
    /// either reserve it or hand it back with [`Job::reserve`]'s lost-race
    /// path.
    pub fn get(&self) -> Option<Arc<Job>> {
        let mut inner = self.inner.lock();
        if inner.is_paused(Instant::now()) {
            return None;
        }
        inner.ready.pop_first().map(|(_, job)| job)
    }

    pub fn peek_ready(&self) -> Option<Arc<Job>> {
        self.inner.lock().ready.values().next().cloned()
    }

    pub fn peek_delayed(&self) -> Option<Arc<Job>> {
        self.inner.lock().delayed.values().next().cloned()
    }

    pub fn peek_buried(&self) -> Option<Arc<Job>> {
        self.inner.lock().buried.front().cloned()
    }

    /// Kicks up to `bound` jobs back to ready. Buried jobs are kicked oldest
    /// first; only when none are buried are delayed jobs kicked, soonest
    /// first. Returns how many jobs were kicked.
    pub fn kick(&self, bound: u32) -> u32 {
        let bound = bound as usize;
        let candidates: Vec<Arc<Job>> = {
            let inner = self.inner.lock();
            if !inner.buried.is_empty() {
                inner.buried.iter().take(bound).cloned().collect()
            } else {
                inner.delayed.values().take(bound).cloned().collect()
            }
        };

        // A candidate may have moved on since the lock was dropped; it is
        // then skipped rather than counted.
        let kicked = candidates.iter().filter(|job| job.kick()).count() as u32;

        debug!(tube = %self.name, bound, kicked, "kick");
        kicked
    }

    /// Stops reservations from this tube for `delay` (at least a second).
    /// Jobs still arrive as normal and waiting reservations are served once
    /// the pause lapses.
    pub fn pause(&self, delay: Duration) {
        let delay = delay.max(MIN_PAUSE);
        let until = Instant::now() + delay;
        {
            let mut inner = self.inner.lock();
            inner.paused_until = Some(until);
            inner.pause = delay;
        }
        self.cmd_pause.fetch_add(1, Ordering::Relaxed);
        info!(tube = %self.name, ?delay, "paused");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().is_paused(Instant::now())
    }

    /// Clears a lapsed pause and serves any waiters. Returns true if the tube
    /// was resumed.
    pub(crate) fn resume_if_due(self: &Arc<Self>, now: Instant) -> bool {
        {
            let mut inner = self.inner.lock();
            match inner.paused_until {
                Some(until) if until <= now => inner.paused_until = None,
                _ => return false,
            }
        }

        info!(tube = %self.name, "resumed");
        self.notify_waiters();
        true
    }

    /// Moves up to `cap` delayed jobs whose time has come to ready. Returns
    /// how many were moved.
    pub(crate) fn promote_delayed(&self, now: Instant, cap: usize) -> usize {
        let due: Vec<Arc<Job>> = {
            let inner = self.inner.lock();
            inner
                .delayed
                .iter()
                .take_while(|((until, _), _)| *until <= now)
                .take(cap)
                .map(|(_, job)| job.clone())
                .collect()
        };

        due.iter().filter(|job| job.promote_if_due(now)).count()
    }

    /// Queues a waiter at the back of the notify queue, dropping waiters that
    /// have since been served elsewhere.
    pub(crate) fn add_waiter(&self, waiter: Arc<dyn Waiter>) {
        let mut inner = self.inner.lock();
        inner.waiters.retain(|w| w.is_pending());
        inner.waiters.push_back(waiter);
    }

    /// Puts a waiter that found nothing to take back at the front of the
    /// queue, keeping its turn.
    pub(crate) fn requeue_waiter(&self, waiter: Arc<dyn Waiter>) {
        self.inner.lock().waiters.push_front(waiter);
    }

    /// Offers ready jobs to queued waiters in FIFO order, for as long as both
    /// remain and the tube isn't paused.
    pub(crate) fn notify_waiters(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut inner = self.inner.lock();
                if inner.ready.is_empty() || inner.is_paused(Instant::now()) {
                    return;
                }
                match inner.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => return,
                }
            };

            waiter.notify(self);
        }
    }

    pub fn waiting_count(&self) -> usize {
        self.inner
            .lock()
            .waiters
            .iter()
            .filter(|w| w.is_pending())
            .count()
    }

    pub(crate) fn count_put(&self) {
        self.total_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_delete(&self) {
        self.cmd_delete.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_user(&self) {
        self.using.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remove_user(&self) {
        self.using.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn add_watcher(&self) {
        self.watching.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remove_watcher(&self) {
        self.watching.fetch_sub(1, Ordering::Relaxed);
    }

    // Structure bookkeeping, only called by Job transitions.

    pub(crate) fn insert_ready(&self, pri: u32, job: Arc<Job>) {
        self.inner.lock().ready.insert((pri, job.id()), job);
    }

    pub(crate) fn remove_ready(&self, pri: u32, id: JobId) {
        self.inner.lock().ready.remove(&(pri, id));
    }

    pub(crate) fn insert_delayed(&self, until: Instant, job: Arc<Job>) {
        self.inner.lock().delayed.insert((until, job.id()), job);
    }

    pub(crate) fn remove_delayed(&self, until: Instant, id: JobId) {
        self.inner.lock().delayed.remove(&(until, id));
    }

    pub(crate) fn insert_buried(&self, job: Arc<Job>) {
        self.inner.lock().buried.push_back(job);
    }

    pub(crate) fn remove_buried(&self, id: JobId) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.buried.iter().position(|job| job.id() == id) {
            inner.buried.remove(idx);
        }
    }

    pub(crate) fn insert_reserved(&self, job: Arc<Job>) {
        self.inner.lock().reserved.insert(job.id(), job);
    }

    pub(crate) fn remove_reserved(&self, id: JobId) {
        self.inner.lock().reserved.remove(&id);
    }

    pub fn stats(&self) -> TubeStats {
        let now = Instant::now();
        let inner = self.inner.lock();

        let pause_time_left = inner
            .paused_until
            .map(|until| until.saturating_duration_since(now).as_secs())
            .unwrap_or(0);

        TubeStats {
            name: self.name.clone(),
            current_jobs_urgent: inner
                .ready
                .keys()
                .take_while(|(pri, _)| *pri < URGENT_PRIORITY)
                .count() as u64,
            current_jobs_ready: inner.ready.len() as u64,
            current_jobs_reserved: inner.reserved.len() as u64,
            current_jobs_delayed: inner.delayed.len() as u64,
            current_jobs_buried: inner.buried.len() as u64,
            total_jobs: self.total_jobs.load(Ordering::Relaxed),
            current_using: self.using.load(Ordering::Relaxed),
            current_waiting: inner
                .waiters
                .iter()
                .filter(|w| w.is_pending())
                .count() as u64,
            current_watching: self.watching.load(Ordering::Relaxed),
            pause: inner.pause.as_secs(),
            cmd_delete: self.cmd_delete.load(Ordering::Relaxed),
            cmd_pause_tube: self.cmd_pause.load(Ordering::Relaxed),
            pause_time_left,
        }
    }
}

impl std::fmt::Debug for Tube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tube").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;

    use super::*;
    use crate::broker::registry::JobRegistry;

    fn tube() -> Arc<Tube> {
        Tube::new(TubeName::default_tube())
    }

    fn put(
        jobs: &JobRegistry,
        tube: &Arc<Tube>,
        pri: u32,
        delay: u64,
    ) -> Arc<Job> {
        let job = jobs.create(
            tube,
            pri,
            Duration::from_secs(delay),
            Duration::from_secs(60),
            Bytes::from_static(b"x"),
        );
        assert!(job.enqueue());
        job
    }

    #[test]
    fn test_get_orders_by_priority_then_id() {
        let jobs = JobRegistry::default();
        let tube = tube();

        let a = put(&jobs, &tube, 10, 0);
        let b = put(&jobs, &tube, 5, 0);
        let c = put(&jobs, &tube, 10, 0);
        let d = put(&jobs, &tube, 5, 0);

        let order: Vec<JobId> =
            std::iter::from_fn(|| tube.get()).map(|j| j.id()).collect();
        assert_eq!(order, vec![b.id(), d.id(), a.id(), c.id()]);
    }

    #[test]
    fn test_peeks() {
        let jobs = JobRegistry::default();
        let tube = tube();
        assert!(tube.peek_ready().is_none());
        assert!(tube.peek_delayed().is_none());
        assert!(tube.peek_buried().is_none());

        let ready = put(&jobs, &tube, 3, 0);
        let late = put(&jobs, &tube, 0, 20);
        let soon = put(&jobs, &tube, 0, 10);

        assert_eq!(tube.peek_ready().unwrap().id(), ready.id());
        assert_eq!(tube.peek_delayed().unwrap().id(), soon.id());
        assert_ne!(tube.peek_delayed().unwrap().id(), late.id());

        // Peeking doesn't remove anything.
        assert_eq!(tube.stats().current_jobs_ready, 1);
        assert_eq!(tube.stats().current_jobs_delayed, 2);
    }

    #[test]
    fn test_kick_prefers_buried() {
        let jobs = JobRegistry::default();
        let tube = tube();
        let ctx = crate::broker::context::ClientContext::new(
            crate::broker::context::ContextId(1),
            tube.clone(),
        );

        let delayed = put(&jobs, &tube, 0, 30);
        let mut buried = vec![];
        for _ in 0..3 {
            let job = put(&jobs, &tube, 0, 0);
            let got = tube.get().unwrap();
            assert!(got.reserve(&ctx, || true).is_reserved());
            assert!(got.bury(&ctx, 7));
            buried.push(job);
        }
        assert_eq!(tube.peek_buried().unwrap().id(), buried[0].id());

        // Only buried jobs are kicked while any exist, oldest first.
        assert_eq!(tube.kick(2), 2);
        assert_eq!(tube.peek_buried().unwrap().id(), buried[2].id());
        assert_eq!(tube.kick(10), 1);
        assert!(matches!(
            delayed.state(),
            crate::types::states::JobState::Delayed { .. }
        ));

        // Then delayed ones.
        assert_eq!(tube.kick(10), 1);
        assert_eq!(tube.kick(10), 0);
        assert_eq!(tube.stats().current_jobs_ready, 4);
        assert_eq!(buried[0].counters().kicks, 1);
        assert_eq!(delayed.counters().kicks, 1);
    }

    #[test]
    fn test_kick_zero() {
        let jobs = JobRegistry::default();
        let tube = tube();
        put(&jobs, &tube, 0, 30);

        assert_eq!(tube.kick(0), 0);
        assert_eq!(tube.stats().current_jobs_delayed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause() {
        let jobs = JobRegistry::default();
        let tube = tube();
        put(&jobs, &tube, 0, 0);

        tube.pause(Duration::ZERO);
        assert!(tube.is_paused());
        assert!(tube.get().is_none());
        assert_eq!(tube.stats().pause, 1);
        assert_eq!(tube.stats().cmd_pause_tube, 1);

        // Jobs still arrive while paused.
        put(&jobs, &tube, 0, 0);
        assert_eq!(tube.stats().current_jobs_ready, 2);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!tube.resume_if_due(Instant::now()));
        assert!(tube.get().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(tube.resume_if_due(Instant::now()));
        assert!(!tube.is_paused());
        assert!(tube.get().is_some());
    }

    /// A waiter that records offers and takes a job when it can.
    struct Recorder {
        offers: AtomicUsize,
        pending: bool,
    }

    impl Waiter for Recorder {
        fn is_pending(&self) -> bool {
            self.pending
        }

        fn notify(self: Arc<Self>, tube: &Arc<Tube>) -> bool {
            self.offers.fetch_add(1, Ordering::SeqCst);
            if !self.pending {
                return false;
            }
            tube.get().is_some()
        }
    }

    #[test]
    fn test_notify_queue_is_fifo() {
        let jobs = JobRegistry::default();
        let tube = tube();

        let stale = Arc::new(Recorder {
            offers: AtomicUsize::new(0),
            pending: false,
        });
        let first = Arc::new(Recorder {
            offers: AtomicUsize::new(0),
            pending: true,
        });
        let second = Arc::new(Recorder {
            offers: AtomicUsize::new(0),
            pending: true,
        });

        tube.requeue_waiter(stale.clone());
        tube.add_waiter(first.clone());
        tube.add_waiter(second.clone());

        // Nothing is offered while nothing is ready.
        tube.notify_waiters();
        assert_eq!(first.offers.load(Ordering::SeqCst), 0);
        assert_eq!(tube.waiting_count(), 2);

        put(&jobs, &tube, 0, 0);
        assert_eq!(first.offers.load(Ordering::SeqCst), 1);
        assert_eq!(second.offers.load(Ordering::SeqCst), 0);

        put(&jobs, &tube, 0, 0);
        assert_eq!(second.offers.load(Ordering::SeqCst), 1);
        assert_eq!(tube.stats().current_jobs_ready, 0);
        assert_eq!(tube.waiting_count(), 0);
    }

    #[test]
    fn test_urgent_count() {
        let jobs = JobRegistry::default();
        let tube = tube();
        put(&jobs, &tube, 0, 0);
        put(&jobs, &tube, URGENT_PRIORITY - 1, 0);
        put(&jobs, &tube, URGENT_PRIORITY, 0);

        let stats = tube.stats();
        assert_eq!(stats.current_jobs_urgent, 2);
        assert_eq!(stats.current_jobs_ready, 3);
    }
}
