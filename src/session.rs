//! Per-connection command handling on top of the broker.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::warn;

use crate::broker::context::ClientContext;
use crate::broker::job::Job;
use crate::broker::reserve::ReserveOutcome;
use crate::broker::{Broker, BrokerError};
use crate::parser::ParsingError;
use crate::types::protocol::{BeanstalkCommand, BeanstalkResponse};

/// What to do after a command has been handled.
#[derive(Debug)]
pub enum Reply {
    /// Send this response.
    Now(BeanstalkResponse),
    /// Send the response once the reservation resolves.
    Later(oneshot::Receiver<ReserveOutcome>),
    /// Close the connection without replying.
    Close,
}

impl From<BeanstalkResponse> for Reply {
    fn from(value: BeanstalkResponse) -> Self {
        Self::Now(value)
    }
}

impl From<ReserveOutcome> for BeanstalkResponse {
    fn from(value: ReserveOutcome) -> Self {
        match value {
            ReserveOutcome::Reserved(job) => reserved(&job),
            ReserveOutcome::NotFound => Self::NotFound,
            ReserveOutcome::DeadlineSoon => Self::DeadlineSoon,
            ReserveOutcome::TimedOut => Self::TimedOut,
        }
    }
}

impl From<BrokerError> for BeanstalkResponse {
    fn from(value: BrokerError) -> Self {
        match value {
            BrokerError::NotFound => Self::NotFound,
            BrokerError::NotIgnored => Self::NotIgnored,
        }
    }
}

impl From<ParsingError> for BeanstalkResponse {
    fn from(value: ParsingError) -> Self {
        match value {
            ParsingError::BadFormat => Self::BadFormat,
            ParsingError::UnknownCommand => Self::UnknownCommand,
        }
    }
}

fn reserved(job: &Job) -> BeanstalkResponse {
    BeanstalkResponse::Reserved {
        id: job.id(),
        data: job.body().clone(),
    }
}

fn found(job: Option<Arc<Job>>) -> BeanstalkResponse {
    match job {
        Some(job) => BeanstalkResponse::Found {
            id: job.id(),
            data: job.body().clone(),
        },
        None => BeanstalkResponse::NotFound,
    }
}

fn secs(n: u32) -> Duration {
    Duration::from_secs(n.into())
}

/// One client's view of the broker. Dropping the session disconnects the
/// client, releasing its reservations.
pub struct Session {
    broker: Arc<Broker>,
    ctx: Arc<ClientContext>,
}

impl Session {
    pub fn new(broker: Arc<Broker>) -> Self {
        let ctx = broker.connect();
        Self { broker, ctx }
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.ctx
    }

    /// Handles a parsed command. `body` carries the job body for `put`,
    /// already stripped of its trailing CRLF.
    pub fn dispatch(
        &self,
        cmd: BeanstalkCommand,
        body: Option<Bytes>,
    ) -> Reply {
        use BeanstalkCommand::*;
        use BeanstalkResponse as R;

        self.broker.counters().record(&cmd);

        let broker = &self.broker;
        let ctx = &self.ctx;

        let resp = match cmd {
            Put {
                pri, delay, ttr, ..
            } => {
                let Some(body) = body else {
                    warn!("put dispatched without a body");
                    return R::InternalError.into();
                };
                ctx.mark_producer();
                let job =
                    broker.put(&ctx.using(), pri, secs(delay), secs(ttr), body);
                R::Inserted { id: job.id() }
            },

            Reserve => return Reply::Later(broker.reserve(ctx, None)),
            ReserveWithTimeout { timeout } => {
                return Reply::Later(broker.reserve(ctx, Some(secs(timeout))))
            },
            ReserveJob { id } => match broker.reserve_job(ctx, id) {
                Ok(job) => reserved(&job),
                Err(error) => error.into(),
            },

            Delete { id } => match broker.delete(ctx, id) {
                Ok(()) => R::Deleted,
                Err(error) => error.into(),
            },
            Release { id, pri, delay } => {
                match broker.release(ctx, id, pri, secs(delay)) {
                    Ok(()) => R::Released,
                    Err(error) => error.into(),
                }
            },
            Bury { id, pri } => match broker.bury(ctx, id, pri) {
                Ok(()) => R::Buried,
                Err(error) => error.into(),
            },
            Touch { id } => match broker.touch(ctx, id) {
                Ok(()) => R::Touched,
                Err(error) => error.into(),
            },

            Use { tube } => R::Using {
                tube: broker.use_tube(ctx, &tube).name().clone(),
            },
            Watch { tube } => R::Watching {
                count: broker.watch(ctx, &tube),
            },
            Ignore { tube } => match broker.ignore(ctx, &tube) {
                Ok(count) => R::Watching { count },
                Err(error) => error.into(),
            },

            Peek { id } => found(broker.peek(id).ok()),
            PeekReady => found(ctx.using().peek_ready()),
            PeekDelayed => found(ctx.using().peek_delayed()),
            PeekBuried => found(ctx.using().peek_buried()),

            Kick { bound } => R::KickedCount {
                count: broker.kick(&ctx.using(), bound),
            },
            KickJob { id } => match broker.kick_job(id) {
                Ok(()) => R::Kicked,
                Err(error) => error.into(),
            },

            StatsJob { id } => match broker.job_stats(id) {
                Ok(data) => R::OkStatsJob { data },
                Err(error) => error.into(),
            },
            StatsTube { tube } => match broker.tube_stats(&tube) {
                Ok(data) => R::OkStatsTube { data },
                Err(error) => error.into(),
            },
            StatsServer => R::OkStats {
                data: broker.stats(),
            },

            ListTubes => R::OkListTubes {
                tubes: broker.list_tubes(),
            },
            ListTubeUsed => R::Using {
                tube: ctx.using().name().clone(),
            },
            ListTubesWatched => R::OkListTubes {
                tubes: ctx.watched_names(),
            },

            PauseTube { tube, delay } => {
                match broker.pause_tube(&tube, secs(delay)) {
                    Ok(()) => R::Paused,
                    Err(error) => error.into(),
                }
            },

            Quit => return Reply::Close,
        };

        resp.into()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.broker.disconnect(&self.ctx);
    }
}
