use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::trace;

use super::context::ClientContext;
use super::tube::Tube;
use crate::types::protocol::JobStats;
use crate::types::states::JobState;

pub type JobId = u32;

/// Shortest time-to-run a job may have; lower values are raised to it.
pub const MIN_TTR: Duration = Duration::from_secs(1);

/// How often a job has gone through each kind of transition.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct JobCounters {
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub buries: u64,
    pub kicks: u64,
}

/// Result of trying to reserve a job taken from a tube's ready set.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Claim {
    /// The job is now reserved by the caller.
    Reserved,
    /// The job had already left the ready state; try another one.
    Gone,
    /// The caller's reservation request was already answered. The job has
    /// been put back into the ready set.
    Lost,
}

impl Claim {
    pub(crate) fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved)
    }
}

struct JobInner {
    state: JobState,
    pri: u32,
    delay: Duration,
    /// The context holding the reservation while the job is reserved.
    owner: Option<Weak<ClientContext>>,
    counters: JobCounters,
}

/// A unit of work: an opaque body plus scheduling metadata.
///
/// All transitions lock the job first, take it out of whichever tube (and
/// context) structure its current state puts it in, then place it in the
/// structure for its new state. Transitions not allowed from the current state
/// leave the job untouched and return false.
pub struct Job {
    id: JobId,
    tube: Arc<Tube>,
    ttr: Duration,
    created: Instant,
    body: Bytes,
    inner: Mutex<JobInner>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        tube: Arc<Tube>,
        pri: u32,
        delay: Duration,
        ttr: Duration,
        body: Bytes,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            tube,
            ttr: ttr.max(MIN_TTR),
            created: Instant::now(),
            body,
            inner: Mutex::new(JobInner {
                state: JobState::New,
                pri,
                delay,
                owner: None,
                counters: JobCounters::default(),
            }),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn tube(&self) -> &Arc<Tube> {
        &self.tube
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn ttr(&self) -> Duration {
        self.ttr
    }

    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }

    pub fn priority(&self) -> u32 {
        self.inner.lock().pri
    }

    pub fn counters(&self) -> JobCounters {
        self.inner.lock().counters
    }

    /// Whether the job is currently reserved by `ctx`.
    pub fn is_reserved_by(&self, ctx: &ClientContext) -> bool {
        Self::owned_by(&self.inner.lock(), ctx)
    }

    fn owned_by(inner: &JobInner, ctx: &ClientContext) -> bool {
        inner.state.is_reserved()
            && inner
                .owner
                .as_ref()
                .is_some_and(|owner| std::ptr::eq(owner.as_ptr(), ctx))
    }

    /// Places a new job in its tube, ready or delayed depending on its delay.
    pub fn enqueue(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != JobState::New {
            return false;
        }

        if inner.delay.is_zero() {
            self.enter_ready(inner);
        } else {
            let delay = inner.delay;
            self.enter_delayed(&mut inner, delay);
        }
        true
    }

    /// Reserves a job taken from the ready set on behalf of `ctx`.
    ///
    /// `gate` is consulted under the job lock once the job is known to be
    /// ready. If it returns false the reservation request was already
    /// answered, so the job is put back and the tube's waiters notified. The
    /// same happens if `ctx` has been closed in the meantime.
    pub(crate) fn reserve(
        self: &Arc<Self>,
        ctx: &Arc<ClientContext>,
        gate: impl FnOnce() -> bool,
    ) -> Claim {
        let mut inner = self.inner.lock();
        if inner.state != JobState::Ready {
            return Claim::Gone;
        }

        self.leave(&mut inner);
        if !gate() || !self.enter_reserved(&mut inner, ctx) {
            self.enter_ready(inner);
            return Claim::Lost;
        }

        inner.counters.reserves += 1;
        Claim::Reserved
    }

    /// Reserves the job by ID. Allowed from ready, delayed and buried.
    pub fn reserve_direct(self: &Arc<Self>, ctx: &Arc<ClientContext>) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(
            inner.state,
            JobState::Ready | JobState::Delayed { .. } | JobState::Buried
        ) {
            return false;
        }

        self.leave(&mut inner);
        if !self.enter_reserved(&mut inner, ctx) {
            self.enter_ready(inner);
            return false;
        }

        inner.counters.reserves += 1;
        true
    }

    /// Restarts the time-to-run of a job reserved by `ctx`.
    pub fn touch(self: &Arc<Self>, ctx: &Arc<ClientContext>) -> bool {
        let mut inner = self.inner.lock();
        let JobState::Reserved { until } = inner.state else {
            return false;
        };
        if !Self::owned_by(&inner, ctx) {
            return false;
        }

        // Swapped under one context lock.
        let renewed = Instant::now() + self.ttr;
        inner.state = JobState::Reserved { until: renewed };
        ctx.reschedule_reserved(until, renewed, self.clone());
        true
    }

    /// Returns the job to ready if `ctx` still holds its reservation.
    pub fn release_if_owned(self: &Arc<Self>, ctx: &ClientContext) -> bool {
        let mut inner = self.inner.lock();
        if !Self::owned_by(&inner, ctx) {
            return false;
        }

        self.leave(&mut inner);
        self.enter_ready(inner);
        true
    }

    /// Buries a job reserved by `ctx` with a new priority.
    pub fn bury(self: &Arc<Self>, ctx: &ClientContext, pri: u32) -> bool {
        let mut inner = self.inner.lock();
        if !Self::owned_by(&inner, ctx) {
            return false;
        }

        self.leave(&mut inner);
        inner.pri = pri;
        inner.state = JobState::Buried;
        inner.counters.buries += 1;
        self.tube.insert_buried(self.clone());
        true
    }

    /// Releases a job reserved by `ctx` back to ready, or to delayed for a
    /// non-zero delay.
    pub fn release(
        self: &Arc<Self>,
        ctx: &ClientContext,
        pri: u32,
        delay: Duration,
    ) -> bool {
        let mut inner = self.inner.lock();
        if !Self::owned_by(&inner, ctx) {
            return false;
        }

        self.leave(&mut inner);
        inner.pri = pri;
        inner.counters.releases += 1;
        if delay.is_zero() {
            self.enter_ready(inner);
        } else {
            self.enter_delayed(&mut inner, delay);
        }
        true
    }

    /// Deletes the job. A reserved job can only be deleted by the context
    /// holding the reservation.
    pub fn delete(self: &Arc<Self>, ctx: &ClientContext) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            JobState::Deleted => return false,
            JobState::Reserved { .. } if !Self::owned_by(&inner, ctx) => {
                return false
            },
            _ => {},
        }

        self.leave(&mut inner);
        inner.state = JobState::Deleted;
        true
    }

    /// Moves a buried or delayed job to ready.
    pub fn kick(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, JobState::Buried | JobState::Delayed { .. }) {
            return false;
        }

        self.leave(&mut inner);
        inner.counters.kicks += 1;
        self.enter_ready(inner);
        true
    }

    /// Moves a delayed job to ready if its delay has passed by `now`.
    pub(crate) fn promote_if_due(self: &Arc<Self>, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            JobState::Delayed { until } if until <= now => {},
            _ => return false,
        }

        self.leave(&mut inner);
        self.enter_ready(inner);
        true
    }

    /// Returns a reserved job to ready once its time-to-run has run out by
    /// `now`, counting a timeout.
    pub(crate) fn expire(self: &Arc<Self>, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            JobState::Reserved { until } if until <= now => {},
            _ => return false,
        }

        self.leave(&mut inner);
        inner.counters.timeouts += 1;
        self.enter_ready(inner);
        true
    }

    /// Takes the job out of the structure its current state places it in.
    fn leave(&self, inner: &mut JobInner) {
        match inner.state {
            JobState::Ready => self.tube.remove_ready(inner.pri, self.id),
            JobState::Delayed { until } => {
                self.tube.remove_delayed(until, self.id)
            },
            JobState::Buried => self.tube.remove_buried(self.id),
            JobState::Reserved { until } => {
                self.tube.remove_reserved(self.id);
                let owner = inner.owner.take().and_then(|o| o.upgrade());
                if let Some(owner) = owner {
                    owner.remove_reserved(until, self.id);
                }
            },
            JobState::New | JobState::Deleted => {},
        }
    }

    /// Makes the job ready and wakes the tube's waiters once the job lock
    /// is released.
    fn enter_ready(self: &Arc<Self>, mut inner: MutexGuard<'_, JobInner>) {
        inner.state = JobState::Ready;
        self.tube.insert_ready(inner.pri, self.clone());
        trace!(id = self.id, tube = %self.tube.name(), "ready");
        drop(inner);

        self.tube.notify_waiters();
    }

    fn enter_delayed(self: &Arc<Self>, inner: &mut JobInner, delay: Duration) {
        let until = Instant::now() + delay;
        inner.delay = delay;
        inner.state = JobState::Delayed { until };
        self.tube.insert_delayed(until, self.clone());
    }

    /// Reserves the job for `ctx`. Returns false, leaving the job's state
    /// alone, if the context has already been closed.
    fn enter_reserved(
        self: &Arc<Self>,
        inner: &mut JobInner,
        ctx: &Arc<ClientContext>,
    ) -> bool {
        let until = Instant::now() + self.ttr;
        if !ctx.insert_reserved(until, self.clone()) {
            return false;
        }

        inner.state = JobState::Reserved { until };
        inner.owner = Some(Arc::downgrade(ctx));
        self.tube.insert_reserved(self.clone());
        true
    }

    pub fn stats(&self) -> JobStats {
        let now = Instant::now();
        let inner = self.inner.lock();

        let time_left = match inner.state {
            JobState::Delayed { until } | JobState::Reserved { until } => {
                until.saturating_duration_since(now).as_secs()
            },
            _ => 0,
        };

        JobStats {
            id: self.id,
            tube: self.tube.name().clone(),
            state: inner.state,
            pri: inner.pri,
            age: now.saturating_duration_since(self.created).as_secs(),
            delay: inner.delay.as_secs(),
            ttr: self.ttr.as_secs(),
            time_left,
            reserves: inner.counters.reserves,
            timeouts: inner.counters.timeouts,
            releases: inner.counters.releases,
            buries: inner.counters.buries,
            kicks: inner.counters.kicks,
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("tube", self.tube.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::context::{ClientContext, ContextId};
    use crate::types::tube_name::TubeName;

    fn setup() -> (Arc<Tube>, Arc<ClientContext>, Arc<ClientContext>) {
        let tube = Tube::new(TubeName::default_tube());
        let a = ClientContext::new(ContextId(1), tube.clone());
        let b = ClientContext::new(ContextId(2), tube.clone());
        (tube, a, b)
    }

    fn job(tube: &Arc<Tube>, id: JobId, delay: u64) -> Arc<Job> {
        let job = Job::new(
            id,
            tube.clone(),
            100,
            Duration::from_secs(delay),
            Duration::ZERO,
            Bytes::from_static(b"hello"),
        );
        assert!(job.enqueue());
        job
    }

    fn take(tube: &Arc<Tube>, ctx: &Arc<ClientContext>) -> Arc<Job> {
        let job = tube.get().unwrap();
        assert_eq!(job.reserve(ctx, || true), Claim::Reserved);
        job
    }

    #[test]
    fn test_ttr_floor() {
        let (tube, ..) = setup();
        assert_eq!(job(&tube, 1, 0).ttr(), MIN_TTR);
    }

    #[test]
    fn test_lifecycle() {
        let (tube, a, _) = setup();
        let j = job(&tube, 1, 0);
        assert_eq!(j.state(), JobState::Ready);
        assert!(!j.enqueue());

        let j = take(&tube, &a);
        assert!(j.is_reserved_by(&a));
        assert_eq!(a.reserved_count(), 1);
        assert_eq!(tube.stats().current_jobs_reserved, 1);

        assert!(j.bury(&a, 5));
        assert_eq!(j.state(), JobState::Buried);
        assert_eq!(j.priority(), 5);
        assert_eq!(a.reserved_count(), 0);
        assert_eq!(tube.stats().current_jobs_buried, 1);

        assert!(j.kick());
        assert_eq!(j.state(), JobState::Ready);

        let j = take(&tube, &a);
        assert!(j.release(&a, 9, Duration::ZERO));
        assert_eq!(j.state(), JobState::Ready);
        assert_eq!(j.priority(), 9);

        let j = take(&tube, &a);
        assert!(j.delete(&a));
        assert_eq!(j.state(), JobState::Deleted);
        assert!(!j.delete(&a));
        assert!(!j.release_if_owned(&a));

        let stats = tube.stats();
        assert_eq!(stats.current_jobs_ready, 0);
        assert_eq!(stats.current_jobs_reserved, 0);
        assert_eq!(stats.current_jobs_buried, 0);
        assert_eq!(
            j.counters(),
            JobCounters {
                reserves: 3,
                timeouts: 0,
                releases: 1,
                buries: 1,
                kicks: 1,
            }
        );
    }

    #[test]
    fn test_only_owner_may_act() {
        let (tube, a, b) = setup();
        job(&tube, 1, 0);
        let j = take(&tube, &a);

        assert!(!j.bury(&b, 0));
        assert!(!j.release(&b, 0, Duration::ZERO));
        assert!(!j.touch(&b));
        assert!(!j.delete(&b));
        assert!(j.is_reserved_by(&a));

        assert!(j.delete(&a));
    }

    #[test]
    fn test_disallowed_transitions_are_noops() {
        let (tube, a, _) = setup();
        let j = job(&tube, 1, 0);

        assert!(!j.kick());
        assert!(!j.bury(&a, 0));
        assert!(!j.release(&a, 0, Duration::ZERO));
        assert!(!j.expire(Instant::now()));
        assert_eq!(j.state(), JobState::Ready);
        assert_eq!(j.counters(), JobCounters::default());
    }

    #[test]
    fn test_lost_claim_is_put_back() {
        let (tube, a, _) = setup();
        let j = job(&tube, 1, 0);

        let got = tube.get().unwrap();
        assert_eq!(tube.stats().current_jobs_ready, 0);
        assert_eq!(got.reserve(&a, || false), Claim::Lost);
        assert_eq!(tube.stats().current_jobs_ready, 1);
        assert_eq!(j.state(), JobState::Ready);
        assert_eq!(j.counters().reserves, 0);
    }

    #[test]
    fn test_closed_context_cannot_reserve() {
        let (tube, a, _) = setup();
        let j = job(&tube, 1, 0);
        a.close();

        let got = tube.get().unwrap();
        assert_eq!(got.reserve(&a, || true), Claim::Lost);
        assert!(!j.reserve_direct(&a));
        assert_eq!(j.state(), JobState::Ready);
        assert_eq!(j.counters().reserves, 0);
        assert_eq!(tube.stats().current_jobs_ready, 1);
        assert_eq!(a.reserved_count(), 0);
    }

    #[test]
    fn test_release_if_owned() {
        let (tube, a, b) = setup();
        job(&tube, 1, 0);
        let j = take(&tube, &a);

        assert!(!j.release_if_owned(&b));
        assert!(j.is_reserved_by(&a));
        assert!(j.release_if_owned(&a));
        assert_eq!(j.state(), JobState::Ready);
        assert!(!j.release_if_owned(&a));
    }

    #[test]
    fn test_gone_claim() {
        let (tube, a, b) = setup();
        let j = job(&tube, 1, 0);

        let got = tube.get().unwrap();
        assert!(j.reserve_direct(&b));
        assert_eq!(got.reserve(&a, || true), Claim::Gone);
        assert!(j.is_reserved_by(&b));
    }

    #[test]
    fn test_reserve_direct() {
        let (tube, a, b) = setup();
        let delayed = job(&tube, 1, 30);
        assert!(delayed.reserve_direct(&a));
        assert!(delayed.is_reserved_by(&a));
        assert_eq!(tube.stats().current_jobs_delayed, 0);

        // Already reserved.
        assert!(!delayed.reserve_direct(&b));

        assert!(delayed.bury(&a, 0));
        assert!(delayed.reserve_direct(&b));
        assert_eq!(tube.stats().current_jobs_buried, 0);
        assert_eq!(delayed.counters().reserves, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_and_expire() {
        let (tube, a, _) = setup();
        job(&tube, 1, 0);
        let j = take(&tube, &a);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(j.touch(&a));
        assert_eq!(j.counters().reserves, 1);
        assert_eq!(a.reserved_count(), 1);
        let (until, _) = a.nearest_expiry().unwrap();
        assert_eq!(until, Instant::now() + j.ttr());

        // The original deadline has passed, but the touch moved it.
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!j.expire(Instant::now()));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(j.expire(Instant::now()));
        assert_eq!(j.state(), JobState::Ready);
        assert_eq!(j.counters().timeouts, 1);
        assert_eq!(a.reserved_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_with_delay_and_promote() {
        let (tube, a, _) = setup();
        job(&tube, 1, 0);
        let j = take(&tube, &a);

        assert!(j.release(&a, 1, Duration::from_secs(5)));
        assert!(matches!(j.state(), JobState::Delayed { .. }));
        assert_eq!(j.stats().delay, 5);
        assert_eq!(j.stats().time_left, 5);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!j.promote_if_due(Instant::now()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(j.promote_if_due(Instant::now()));
        assert_eq!(j.state(), JobState::Ready);
        assert_eq!(tube.stats().current_jobs_delayed, 0);
        assert_eq!(tube.stats().current_jobs_ready, 1);
    }

    #[test]
    fn test_stats() {
        let (tube, ..) = setup();
        let j = job(&tube, 42, 0);

        let stats = j.stats();
        assert_eq!(stats.id, 42);
        assert_eq!(stats.tube.as_str(), "default");
        assert_eq!(stats.state, JobState::Ready);
        assert_eq!(stats.pri, 100);
        assert_eq!(stats.ttr, 1);
        assert_eq!(stats.time_left, 0);
    }
}
