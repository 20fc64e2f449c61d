//! The job lifecycle engine: tubes, jobs, client contexts, reservations and
//! the background sweepers that move jobs along in time.
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use self::context::{ClientContext, ContextId};
use self::counters::Counters;
use self::expirer::ReservedJobsExpirer;
use self::job::{Job, JobId};
use self::registry::{JobRegistry, TubeRegistry};
use self::reserve::{ReservationCoordinator, ReserveOutcome};
use self::tube::Tube;
use crate::types::protocol::{JobStats, ServerStats, TubeStats};
use crate::types::tube_name::TubeName;

pub mod context;
pub mod counters;
pub mod expirer;
pub mod job;
pub mod registry;
pub mod reserve;
pub mod tracker;
pub mod tube;

/// Pause between sweeps when the previous sweep had nothing to do.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_MAX_JOB_SIZE: u32 = 65_535;

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Largest job body accepted by `put`, in bytes.
    pub max_job_size: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_job_size: DEFAULT_MAX_JOB_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum BrokerError {
    /// The job or tube doesn't exist, or the job isn't in a state (or held
    /// by a client) that permits the operation.
    #[error("not found")]
    NotFound,
    /// Ignoring the tube would leave the client watching nothing.
    #[error("not ignored")]
    NotIgnored,
}

/// The broker service: owns every tube and job and mediates all operations
/// on them.
pub struct Broker {
    config: BrokerConfig,
    tubes: Arc<TubeRegistry>,
    jobs: JobRegistry,
    expirer: Arc<ReservedJobsExpirer>,
    coordinator: ReservationCoordinator,
    clients: DashMap<ContextId, Arc<ClientContext>>,
    next_client: AtomicU64,
    counters: Counters,
    started: Instant,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let expirer = Arc::new(ReservedJobsExpirer::default());
        Arc::new(Self {
            config,
            tubes: Arc::default(),
            jobs: JobRegistry::default(),
            coordinator: ReservationCoordinator::new(expirer.clone()),
            expirer,
            clients: DashMap::new(),
            next_client: AtomicU64::new(0),
            counters: Counters::default(),
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Starts the delayed-job and reservation-expiry sweepers. Both stop
    /// when `cancel` is cancelled.
    pub fn spawn_sweepers(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> [JoinHandle<()>; 2] {
        let tubes = self.tubes.clone();
        let delayed = tokio::spawn(sweep_loop(
            "delayed",
            cancel.clone(),
            move || tubes.sweep(Instant::now()),
        ));

        let broker = self.clone();
        let expiry = tokio::spawn(sweep_loop(
            "reservations",
            cancel.clone(),
            move || {
                let expired = broker.expirer.sweep(Instant::now());
                broker.counters.job_timed_out(expired as u64);
                false
            },
        ));

        [delayed, expiry]
    }

    /// Registers a new client, using and watching the default tube.
    pub fn connect(&self) -> Arc<ClientContext> {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        let id = ContextId(id);
        let ctx = ClientContext::new(id, self.tubes.default_tube());
        self.clients.insert(id, ctx.clone());
        self.counters.connection_opened();
        debug!(ctx = %id, "client connected");
        ctx
    }

    /// Forgets a client, releasing anything it still holds.
    pub fn disconnect(&self, ctx: &Arc<ClientContext>) {
        self.clients.remove(&ctx.id());
        ctx.close();
        debug!(ctx = %ctx.id(), "client disconnected");
    }

    pub fn use_tube(&self, ctx: &ClientContext, name: &TubeName) -> Arc<Tube> {
        let tube = self.tubes.get_or_create(name);
        ctx.use_tube(tube.clone());
        tube
    }

    pub fn watch(&self, ctx: &ClientContext, name: &TubeName) -> usize {
        ctx.watch(self.tubes.get_or_create(name))
    }

    pub fn ignore(
        &self,
        ctx: &ClientContext,
        name: &TubeName,
    ) -> Result<usize, BrokerError> {
        ctx.ignore(name).ok_or(BrokerError::NotIgnored)
    }

    /// Creates a job on `tube`, ready at once or after `delay`.
    pub fn put(
        &self,
        tube: &Arc<Tube>,
        pri: u32,
        delay: Duration,
        ttr: Duration,
        body: Bytes,
    ) -> Arc<Job> {
        let job = self.jobs.create(tube, pri, delay, ttr, body);
        tube.count_put();
        self.counters.job_created();
        debug!(id = job.id(), tube = %tube.name(), pri, ?delay, "put job");

        job.enqueue();
        job
    }

    /// Requests a job from the client's watched tubes. See
    /// [`ReservationCoordinator::reserve`].
    pub fn reserve(
        &self,
        ctx: &Arc<ClientContext>,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<ReserveOutcome> {
        ctx.mark_worker();
        self.coordinator.reserve(ctx, timeout)
    }

    /// Reserves a specific job that is ready, delayed or buried.
    pub fn reserve_job(
        &self,
        ctx: &Arc<ClientContext>,
        id: JobId,
    ) -> Result<Arc<Job>, BrokerError> {
        let job = self.job(id)?;
        if !job.reserve_direct(ctx) {
            return Err(BrokerError::NotFound);
        }

        ctx.mark_worker();
        self.expirer.watch(ctx);
        Ok(job)
    }

    pub fn delete(
        &self,
        ctx: &ClientContext,
        id: JobId,
    ) -> Result<(), BrokerError> {
        let job = self.job(id)?;
        if !job.delete(ctx) {
            return Err(BrokerError::NotFound);
        }

        self.jobs.remove(id);
        job.tube().count_delete();
        debug!(id, "deleted job");
        Ok(())
    }

    pub fn release(
        &self,
        ctx: &ClientContext,
        id: JobId,
        pri: u32,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        check(self.job(id)?.release(ctx, pri, delay))
    }

    pub fn bury(
        &self,
        ctx: &ClientContext,
        id: JobId,
        pri: u32,
    ) -> Result<(), BrokerError> {
        check(self.job(id)?.bury(ctx, pri))
    }

    pub fn touch(
        &self,
        ctx: &Arc<ClientContext>,
        id: JobId,
    ) -> Result<(), BrokerError> {
        check(self.job(id)?.touch(ctx))
    }

    pub fn kick_job(&self, id: JobId) -> Result<(), BrokerError> {
        check(self.job(id)?.kick())
    }

    pub fn kick(&self, tube: &Tube, bound: u32) -> u32 {
        tube.kick(bound)
    }

    pub fn peek(&self, id: JobId) -> Result<Arc<Job>, BrokerError> {
        self.job(id)
    }

    pub fn pause_tube(
        &self,
        name: &TubeName,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        self.tube(name)?.pause(delay);
        Ok(())
    }

    pub fn list_tubes(&self) -> Vec<TubeName> {
        self.tubes.names()
    }

    pub fn job_stats(&self, id: JobId) -> Result<JobStats, BrokerError> {
        Ok(self.job(id)?.stats())
    }

    pub fn tube_stats(
        &self,
        name: &TubeName,
    ) -> Result<TubeStats, BrokerError> {
        Ok(self.tube(name)?.stats())
    }

    pub fn stats(&self) -> ServerStats {
        let mut stats = ServerStats {
            max_job_size: self.config.max_job_size.into(),
            current_tubes: self.tubes.len() as u64,
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION"),
            uptime: self.started.elapsed().as_secs(),
            ..Default::default()
        };

        for tube in self.tubes.all() {
            let t = tube.stats();
            stats.current_jobs_urgent += t.current_jobs_urgent;
            stats.current_jobs_ready += t.current_jobs_ready;
            stats.current_jobs_reserved += t.current_jobs_reserved;
            stats.current_jobs_delayed += t.current_jobs_delayed;
            stats.current_jobs_buried += t.current_jobs_buried;
        }

        for client in self.clients.iter() {
            stats.current_connections += 1;
            stats.current_producers += u64::from(client.is_producer());
            stats.current_workers += u64::from(client.is_worker());
            stats.current_waiting += u64::from(client.is_waiting());
        }

        self.counters.fill(&mut stats);
        stats
    }

    fn job(&self, id: JobId) -> Result<Arc<Job>, BrokerError> {
        self.jobs.get(id).ok_or(BrokerError::NotFound)
    }

    fn tube(&self, name: &TubeName) -> Result<Arc<Tube>, BrokerError> {
        self.tubes.get(name).ok_or(BrokerError::NotFound)
    }
}

fn check(done: bool) -> Result<(), BrokerError> {
    if done {
        Ok(())
    } else {
        Err(BrokerError::NotFound)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Runs `tick` every [`SWEEP_INTERVAL`], or straight away again when the
/// last tick reported it did some work. A panicking tick is logged and the
/// loop carries on.
async fn sweep_loop(
    name: &'static str,
    cancel: CancellationToken,
    tick: impl Fn() -> bool,
) {
    info!(sweeper = name, "sweeper started");

    while !cancel.is_cancelled() {
        let busy = match panic::catch_unwind(AssertUnwindSafe(&tick)) {
            Ok(busy) => busy,
            Err(payload) => {
                error!(
                    sweeper = name,
                    panic = panic_message(payload.as_ref()),
                    "sweep panicked"
                );
                false
            },
        };

        if busy {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = sleep(SWEEP_INTERVAL) => {},
            _ = cancel.cancelled() => {},
        }
    }

    info!(sweeper = name, "sweeper stopped");
}
