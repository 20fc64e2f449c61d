use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::protocol::{BeanstalkCommand, ServerStats};

/// Server-wide cumulative counters.
#[derive(Debug, Default)]
pub struct Counters {
    put: AtomicU64,
    peek: AtomicU64,
    peek_ready: AtomicU64,
    peek_delayed: AtomicU64,
    peek_buried: AtomicU64,
    reserve: AtomicU64,
    reserve_with_timeout: AtomicU64,
    reserve_job: AtomicU64,
    touch: AtomicU64,
    use_: AtomicU64,
    watch: AtomicU64,
    ignore: AtomicU64,
    delete: AtomicU64,
    release: AtomicU64,
    bury: AtomicU64,
    kick: AtomicU64,
    kick_job: AtomicU64,
    stats: AtomicU64,
    stats_job: AtomicU64,
    stats_tube: AtomicU64,
    list_tubes: AtomicU64,
    list_tube_used: AtomicU64,
    list_tubes_watched: AtomicU64,
    pause_tube: AtomicU64,

    job_timeouts: AtomicU64,
    total_jobs: AtomicU64,
    total_connections: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl Counters {
    /// Counts one use of `cmd`.
    pub fn record(&self, cmd: &BeanstalkCommand) {
        use BeanstalkCommand::*;

        let counter = match cmd {
            Put { .. } => &self.put,
            Peek { .. } => &self.peek,
            PeekReady => &self.peek_ready,
            PeekDelayed => &self.peek_delayed,
            PeekBuried => &self.peek_buried,
            Reserve => &self.reserve,
            ReserveWithTimeout { .. } => &self.reserve_with_timeout,
            ReserveJob { .. } => &self.reserve_job,
            Touch { .. } => &self.touch,
            Use { .. } => &self.use_,
            Watch { .. } => &self.watch,
            Ignore { .. } => &self.ignore,
            Delete { .. } => &self.delete,
            Release { .. } => &self.release,
            Bury { .. } => &self.bury,
            Kick { .. } => &self.kick,
            KickJob { .. } => &self.kick_job,
            StatsServer => &self.stats,
            StatsJob { .. } => &self.stats_job,
            StatsTube { .. } => &self.stats_tube,
            ListTubes => &self.list_tubes,
            ListTubeUsed => &self.list_tube_used,
            ListTubesWatched => &self.list_tubes_watched,
            PauseTube { .. } => &self.pause_tube,
            Quit => return,
        };
        bump(counter, 1);
    }

    pub fn job_timed_out(&self, n: u64) {
        bump(&self.job_timeouts, n);
    }

    pub fn job_created(&self) {
        bump(&self.total_jobs, 1);
    }

    pub fn connection_opened(&self) {
        bump(&self.total_connections, 1);
    }

    /// Copies the counters into `stats`.
    pub fn fill(&self, stats: &mut ServerStats) {
        stats.cmd_put = load(&self.put);
        stats.cmd_peek = load(&self.peek);
        stats.cmd_peek_ready = load(&self.peek_ready);
        stats.cmd_peek_delayed = load(&self.peek_delayed);
        stats.cmd_peek_buried = load(&self.peek_buried);
        stats.cmd_reserve = load(&self.reserve);
        stats.cmd_reserve_with_timeout = load(&self.reserve_with_timeout);
        stats.cmd_reserve_job = load(&self.reserve_job);
        stats.cmd_touch = load(&self.touch);
        stats.cmd_use = load(&self.use_);
        stats.cmd_watch = load(&self.watch);
        stats.cmd_ignore = load(&self.ignore);
        stats.cmd_delete = load(&self.delete);
        stats.cmd_release = load(&self.release);
        stats.cmd_bury = load(&self.bury);
        stats.cmd_kick = load(&self.kick);
        stats.cmd_kick_job = load(&self.kick_job);
        stats.cmd_stats = load(&self.stats);
        stats.cmd_stats_job = load(&self.stats_job);
        stats.cmd_stats_tube = load(&self.stats_tube);
        stats.cmd_list_tubes = load(&self.list_tubes);
        stats.cmd_list_tube_used = load(&self.list_tube_used);
        stats.cmd_list_tubes_watched = load(&self.list_tubes_watched);
        stats.cmd_pause_tube = load(&self.pause_tube);

        stats.job_timeouts = load(&self.job_timeouts);
        stats.total_jobs = load(&self.total_jobs);
        stats.total_connections = load(&self.total_connections);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record() {
        let counters = Counters::default();
        counters.record(&BeanstalkCommand::Reserve);
        counters.record(&BeanstalkCommand::Reserve);
        counters.record(&BeanstalkCommand::Kick { bound: 3 });
        counters.record(&BeanstalkCommand::Quit);
        counters.job_timed_out(2);

        let mut stats = ServerStats::default();
        counters.fill(&mut stats);
        assert_eq!(stats.cmd_reserve, 2);
        assert_eq!(stats.cmd_kick, 1);
        assert_eq!(stats.cmd_put, 0);
        assert_eq!(stats.job_timeouts, 2);
    }
}
