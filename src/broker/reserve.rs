//! Matches reservation requests with ready jobs across a client's watched
//! tubes, parking requests that can't be served yet.
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use super::context::ClientContext;
use super::expirer::ReservedJobsExpirer;
use super::job::{Claim, Job};
use super::tracker::TaskId;
use super::tube::{Tube, Waiter};

/// How long before a held reservation's deadline a blocked reserve gives up
/// with `DEADLINE_SOON`.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// Floor for the `DEADLINE_SOON` timer.
const MIN_DEADLINE_DELAY: Duration = Duration::from_millis(1);

/// The single reply to a reservation request.
#[derive(Debug)]
pub enum ReserveOutcome {
    Reserved(Arc<Job>),
    /// A zero timeout found nothing ready.
    NotFound,
    /// A reservation the client holds is about to run out.
    DeadlineSoon,
    TimedOut,
}

#[derive(Debug, Eq, PartialEq)]
enum Attempt {
    Reserved,
    /// The request was answered by someone else.
    Lost,
    Empty,
}

/// A reservation request that is queued on one or more tubes.
struct PendingReserve {
    task: TaskId,
    ctx: Arc<ClientContext>,
    expirer: Arc<ReservedJobsExpirer>,
    reply: Mutex<Option<oneshot::Sender<ReserveOutcome>>>,
}

impl PendingReserve {
    fn reply(&self, outcome: ReserveOutcome) {
        if let Some(tx) = self.reply.lock().take() {
            // The connection may have gone away; its context close releases
            // anything reserved.
            let _ = tx.send(outcome);
        }
    }

    /// Takes the most urgent ready job from `tube` if there is one.
    fn try_take(&self, tube: &Arc<Tube>) -> Attempt {
        while let Some(job) = tube.get() {
            match job.reserve(&self.ctx, || self.ctx.tracker().ack(self.task)) {
                Claim::Reserved => {
                    self.expirer.watch(&self.ctx);
                    debug!(
                        id = job.id(),
                        ctx = %self.ctx.id(),
                        tube = %tube.name(),
                        "reserved job"
                    );
                    self.reply(ReserveOutcome::Reserved(job));
                    return Attempt::Reserved;
                },
                Claim::Gone => continue,
                Claim::Lost => return Attempt::Lost,
            }
        }
        Attempt::Empty
    }

    /// Replies with `outcome` after `after`, if nothing else replied first.
    fn arm_timer(
        self: &Arc<Self>,
        after: Duration,
        outcome: fn() -> ReserveOutcome,
    ) {
        let pending = Arc::downgrade(self);
        tokio::spawn(async move {
            sleep(after).await;

            let Some(pending) = Weak::upgrade(&pending) else {
                return;
            };
            if pending.ctx.tracker().ack(pending.task) {
                let outcome = outcome();
                trace!(ctx = %pending.ctx.id(), ?outcome, "timer fired");
                pending.reply(outcome);
            }
        });
    }
}

impl Waiter for PendingReserve {
    fn is_pending(&self) -> bool {
        self.ctx.tracker().is_pending(self.task)
    }

    fn notify(self: Arc<Self>, tube: &Arc<Tube>) -> bool {
        if !self.is_pending() {
            return false;
        }

        match self.try_take(tube) {
            Attempt::Reserved => true,
            Attempt::Lost => false,
            Attempt::Empty => {
                tube.requeue_waiter(self);
                true
            },
        }
    }
}

/// Serves `reserve` and `reserve-with-timeout` requests.
pub struct ReservationCoordinator {
    expirer: Arc<ReservedJobsExpirer>,
}

impl ReservationCoordinator {
    pub fn new(expirer: Arc<ReservedJobsExpirer>) -> Self {
        Self { expirer }
    }

    /// Requests a job for `ctx` from any of its watched tubes.
    ///
    /// The receiver yields exactly one outcome. `timeout` of `None` waits
    /// until a job turns up; `Some(0)` never waits. With a timeout, if the
    /// context holds a reservation, the request is answered with
    /// `DEADLINE_SOON` once that reservation comes within [`SAFETY_MARGIN`]
    /// of its deadline, unless the timeout would fire first.
    pub fn reserve(
        &self,
        ctx: &Arc<ClientContext>,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<ReserveOutcome> {
        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(PendingReserve {
            task: ctx.tracker().new_task(),
            ctx: ctx.clone(),
            expirer: self.expirer.clone(),
            reply: Mutex::new(Some(tx)),
        });

        let now = Instant::now();
        let deadline_soon = ctx.nearest_expiry().map(|(until, _)| {
            until
                .saturating_duration_since(now + SAFETY_MARGIN)
                .max(MIN_DEADLINE_DELAY)
        });

        match (deadline_soon, timeout) {
            (Some(soon), Some(wait)) if soon <= wait => {
                pending.arm_timer(soon, || ReserveOutcome::DeadlineSoon)
            },
            (_, Some(wait)) if !wait.is_zero() => {
                pending.arm_timer(wait, || ReserveOutcome::TimedOut)
            },
            _ => {},
        }

        let tubes = ctx.watching();
        for tube in &tubes {
            if pending.try_take(tube) != Attempt::Empty {
                return rx;
            }
        }

        if timeout == Some(Duration::ZERO) {
            if ctx.tracker().ack(pending.task) {
                pending.reply(ReserveOutcome::NotFound);
            }
            return rx;
        }

        trace!(ctx = %ctx.id(), tubes = tubes.len(), "waiting for a job");
        for tube in &tubes {
            tube.add_waiter(pending.clone());
        }
        // Catches jobs that became ready between the scan and queueing.
        for tube in &tubes {
            tube.notify_waiters();
        }

        rx
    }
}
