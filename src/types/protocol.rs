use bytes::Bytes;
use serde::Serialize;

use super::serialisable::BeanstalkSerialisable;
use super::states::JobState;
use super::tube_name::TubeName;

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkCommand {
    /// Places a job onto the currently `use`d queue. The `n_bytes` of job
    /// body follow on the next line.
    ///
    /// On the wire: `put <pri> <delay> <ttr> <n_bytes>`
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: u32,
    },
    /// Awaits a job from all the `watch`ed queues, blocking until one appears
    /// (or until a reserved job is about to exceed its TTR).
    ///
    /// On the wire: `reserve`
    Reserve,
    /// As `reserve`, but after `timeout` seconds pass, a `TIMED_OUT` response
    /// is sent instead. A timeout of zero never blocks and answers
    /// `NOT_FOUND` when no job is ready.
    ///
    /// On the wire: `reserve-with-timeout <seconds>`
    ReserveWithTimeout { timeout: u32 },
    /// Reserves a job with a given ID if it exists and is not already reserved,
    /// otherwise returning `NOT_FOUND`.
    ///
    /// On the wire: `reserve-job <id>`
    ReserveJob { id: u32 },
    /// Releases a job reserved by the same client, returning it to the ready
    /// queue (or the delayed queue for a non-zero `delay`). Returns `RELEASED`
    /// or `NOT_FOUND`.
    ///
    /// On the wire: `release <id> <pri> <delay>`
    Release { id: u32, pri: u32, delay: u32 },
    /// Deletes a job reserved by the same client, or in the ready, buried, or
    /// delayed states. Returns `DELETED` or `NOT_FOUND`.
    ///
    /// On the wire: `delete <id>`
    Delete { id: u32 },
    /// Buries a job reserved by the same client. Returns `BURIED` or
    /// `NOT_FOUND`.
    ///
    /// On the wire: `bury <id> <pri>`
    Bury { id: u32, pri: u32 },
    /// Refreshes the Time To Run (TTR) of a job reserved by the same client.
    /// Returns `TOUCHED` or `NOT_FOUND`.
    ///
    /// On the wire: `touch <id>`
    Touch { id: u32 },
    /// Adds a tube to the watchlist for this client. Always replies with
    /// `WATCHING <number of watched tubes>`.
    ///
    /// On the wire: `watch <tube>`
    Watch { tube: TubeName },
    /// Reverses the effect of `watch` on this client. Returns `WATCHING <n>` or
    /// `NOT_IGNORED` if this would remove the last queue in the watchlist.
    ///
    /// On the wire: `ignore <tube>`
    Ignore { tube: TubeName },
    /// Returns the data for the job with this ID, regardless of its state.
    /// Response is either `FOUND <id> <bytes>` or `NOT_FOUND`, in common with
    /// all requests in the `peek` family.
    ///
    /// On the wire: `peek <id>`
    Peek { id: u32 },
    /// Returns the data for the next ready job on the currently-used tube.
    ///
    /// On the wire: `peek-ready`
    PeekReady,
    /// Returns the data for the next delayed job that will become ready on the
    /// currently-used tube.
    ///
    /// On the wire: `peek-delayed`
    PeekDelayed,
    /// Returns the data for the oldest buried job on the currently-used tube,
    /// which is also the next one `kick` would promote.
    ///
    /// On the wire: `peek-buried`
    PeekBuried,
    /// Promotes up to `bound` jobs on the currently-used tube from buried to
    /// the ready states, returning `KICKED <count>` with the actual number of
    /// jobs kicked. If no buried jobs exist, it promotes delayed jobs instead.
    /// In other words, if at least one buried jobs exist, at least two kick
    /// commands must be executed for any delayed jobs to be kicked.
    ///
    /// On the wire: `kick <bound>`
    Kick { bound: u32 },
    /// Promotes a single job from buried or delayed to ready by its ID.
    /// Returns `KICKED` if successful, otherwise `NOT_FOUND` if the job ID
    /// doesn't exist or the job is not kickable.
    ///
    /// On the wire: `kick-job <id>`
    KickJob { id: u32 },
    /// Provides information about the job with the given ID, including which
    /// tube it's on, state, priority, timings, and the number of state
    /// transitions it's undergone.
    ///
    /// As with all responses from the `Stats` and `ListTubes` families of
    /// commands, returns an `OK <n_bytes>` response with associated data.
    ///
    /// As with all responses from the `Stats` family of commands, returns a
    /// YAML object.
    ///
    /// On the wire: `stats-job <id>`
    StatsJob { id: u32 },
    /// Returns information about a tube, including the number of jobs in each
    /// state, number of active consumers and producers, total jobs handled, and
    /// pause status.
    ///
    /// On the wire: `stats-tube <tube>`
    StatsTube { tube: TubeName },
    /// Exposes information about the server, including global job counts by
    /// state, number of each command executed, and various internal statuses.
    ///
    /// On the wire: `stats`
    StatsServer,
    /// Returns a list of which tubes currently exist (have been `use`d or
    /// `watch`ed by any client).
    ///
    /// As for all commands in the `ListTubes` family, returns an `OK <n_bytes>`
    /// response with associated data encoding a YAML-format list.
    ///
    /// On the wire: `list-tubes`
    ListTubes,
    /// Returns the tube name this client is currently using as `USING <tube>`.
    ///
    /// On the wire: `list-tube-used`
    ListTubeUsed,
    /// Returns any tubes this client is currently watching.
    ///
    /// On the wire: `list-tubes-watched`
    ListTubesWatched,
    /// Requests that the server close this connection, releasing any
    /// server-side resources in doing so.
    ///
    /// On the wire: `quit`
    Quit,
    /// Pause a tube for a given period, preventing new jobs being reserved for
    /// `delay` seconds (at least one). Returns `PAUSED` or `NOT_FOUND`.
    ///
    /// On the wire: `pause-tube <tube> <delay>`
    PauseTube { tube: TubeName, delay: u32 },
    /// Selects the tube that `put` and the `peek-*` family act on. Returns
    /// `USING <tube>`.
    ///
    /// On the wire: `use <tube>`
    Use { tube: TubeName },
}

/// All possible response types to a `BeanstalkCommand`.
#[derive(Debug)]
pub enum BeanstalkResponse {
    /// Indicates a server bug. Can be sent in response to any command.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// The client sent a bad request, typically because:
    ///
    /// * The request exceeded 224 bytes, including trailing CRLF.
    /// * A tube name exceeded 200 bytes or was invalid.
    /// * A non-number was provided where a number was expected, or the number
    ///   was out of range.
    ///
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// The client sent a bad request with an unrecognised command.
    ///
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// In response to a `put`, indicates a job was created with the given ID.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: u32 },
    /// In response to a `put`, indicates the job data was not terminated by a
    /// CRLF sequence.
    ///
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCRLF,
    /// In response to a `put`, indicates the job body was larger than what the
    /// server is configured to accept.
    ///
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// In response to a `use` or `list-tube-used`, names the tube the client
    /// is using.
    ///
    /// On the wire: `USING <tube>`.
    Using { tube: TubeName },
    /// In response to a `reserve` or `reserve-with-timeout`, indicates the
    /// client has reserved a job that will exceed its Time To Run (TTR) in the
    /// next second and so will be released automatically.
    ///
    /// On the wire: `DEADLINE_SOON`.
    DeadlineSoon,
    /// In response to a `reserve-with-timeout`, indicates the timeout provided
    /// expired with no job becoming available.
    ///
    /// On the wire: `TIMED_OUT`.
    TimedOut,
    /// In response to a `reserve`, `reserve-with-timeout`, or `reserve-job`,
    /// provides the ID and data of the job that was just reserved.
    ///
    /// On the wire: `RESERVED <id> <n_bytes>` plus data.
    Reserved { id: u32, data: Bytes },
    /// In response to any of the following commands, indicates a general state
    /// where a specific job isn't known to the server, or doesn't satisfy
    /// a precondition to be returned by the command.
    ///
    /// Specific cases include:
    ///
    /// * `reserve-with-timeout 0`: no job was ready on any watched tube.
    /// * `reserve-job`: the job is reserved or unknown.
    /// * `delete`: the job is unknown, or reserved by another client.
    /// * `release`, `bury`, or `touch`: the job is unknown or is not reserved
    ///   by this client.
    /// * `peek`: the job is unknown.
    /// * `peek-*` family: no such jobs exist on the currently `use`d tube.
    /// * `kick-job`: the job is unknown or is neither buried nor delayed.
    /// * `stats-job`, `stats-tube`: the job or tube is unknown.
    /// * `pause-tube`: the tube does not exist.
    ///
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// In response to a `delete` command, indicates the job was successfully
    /// deleted.
    ///
    /// On the wire: `DELETED`.
    Deleted,
    /// In response to a `release` command, indicates the job was successfully
    /// released back to the ready or delayed states.
    ///
    /// On the wire: `RELEASED`.
    Released,
    /// In response to a `bury`, indicates success.
    ///
    /// On the wire: `BURIED`.
    Buried,
    /// In response to a `touch`, indicates the job's TTR was refreshed.
    ///
    /// On the wire: `TOUCHED`.
    Touched,
    /// In response to a `watch` or `ignore`, indicates success and the number
    /// of tubes currently watched by the client.
    ///
    /// On the wire: `WATCHING <count>`.
    Watching { count: usize },
    /// In response to an `ignore`, indicates the command failed as it would
    /// leave the client with an empty watchlist.
    ///
    /// On the wire: `NOT_IGNORED`.
    NotIgnored,
    /// In response to a `peek`-family command, indicates success.
    ///
    /// On the wire: `FOUND <id> <n_bytes>` plus data.
    Found { id: u32, data: Bytes },
    /// In response to a `kick`, indicates success with the number of jobs
    /// kicked from the buried xor delayed states.
    ///
    /// On the wire: `KICKED <count>`.
    KickedCount { count: u32 },
    /// In response to a `kick-job`, indicates success.
    ///
    /// On the wire: `KICKED`.
    Kicked,
    /// In response to a `stats-job`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatsJob { data: JobStats },
    /// In response to a `stats`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStats { data: ServerStats },
    /// In response to a `stats-tube`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML dictionary format.
    OkStatsTube { data: TubeStats },
    /// In response to a `list-tubes` or `list-tubes-watched`, indicates success.
    ///
    /// On the wire: `OK <n_bytes>` plus data in YAML *list* format.
    OkListTubes { tubes: Vec<TubeName> },
    /// In response to a `pause-tube`, indicates success.
    ///
    /// On the wire: `PAUSED`.
    Paused,
}

/// Frames a YAML document as an `OK <n_bytes>` response.
fn ok_yaml<T: Serialize>(data: &T) -> Vec<u8> {
    match serde_yaml::to_string(data) {
        Ok(data) => format!("OK {}\r\n{data}\r\n", data.len()).into(),
        Err(_) => b"INTERNAL_ERROR\r\n".to_vec(),
    }
}

/// Frames a job body as `<token> <id> <n_bytes>` plus data.
fn with_body(token: &str, id: u32, data: &Bytes) -> Vec<u8> {
    let mut out = format!("{token} {id} {}\r\n", data.len()).into_bytes();
    out.reserve(data.len() + 2);
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

impl BeanstalkSerialisable for BeanstalkResponse {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use BeanstalkResponse::*;

        match self {
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            Inserted { id } => format!("INSERTED {id}\r\n").into(),
            ExpectedCRLF => b"EXPECTED_CRLF\r\n".to_vec(),
            JobTooBig => b"JOB_TOO_BIG\r\n".to_vec(),
            Using { tube } => format!("USING {tube}\r\n").into(),
            DeadlineSoon => b"DEADLINE_SOON\r\n".to_vec(),
            TimedOut => b"TIMED_OUT\r\n".to_vec(),
            Reserved { id, data } => with_body("RESERVED", *id, data),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            Released => b"RELEASED\r\n".to_vec(),
            Watching { count } => format!("WATCHING {count}\r\n").into(),
            NotIgnored => b"NOT_IGNORED\r\n".to_vec(),
            Found { id, data } => with_body("FOUND", *id, data),
            KickedCount { count } => format!("KICKED {count}\r\n").into(),
            Kicked => b"KICKED\r\n".to_vec(),
            OkStatsJob { data } => ok_yaml(data),
            OkStats { data } => ok_yaml(data),
            OkStatsTube { data } => ok_yaml(data),
            OkListTubes { tubes } => ok_yaml(tubes),
            Paused => b"PAUSED\r\n".to_vec(),
            Deleted => b"DELETED\r\n".to_vec(),
            Buried => b"BURIED\r\n".to_vec(),
            Touched => b"TOUCHED\r\n".to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobStats {
    /// job ID
    pub id: u32,
    /// tube containing job
    pub tube: TubeName,
    /// job state
    pub state: JobState,
    /// priority set by last put/release/bury
    pub pri: u32,

    /// time in seconds since creation
    pub age: u64,
    /// delay in seconds set by the last put/release
    pub delay: u64,
    /// allowed processing time in seconds
    pub ttr: u64,
    /// seconds until a reserved job times out or a delayed job becomes ready
    #[serde(rename = "time-left")]
    pub time_left: u64,

    /// number of times job reserved
    pub reserves: u64,
    /// number of times job timed out
    pub timeouts: u64,
    /// number of times job released
    pub releases: u64,
    /// number of times job buried
    pub buries: u64,
    /// number of times job kicked
    pub kicks: u64,
}

#[derive(Debug, Serialize)]
pub struct TubeStats {
    /// tube name
    pub name: TubeName,
    /// number of jobs in ready state with priority < 1024
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    /// number of jobs in ready state
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by clients
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    /// number of jobs in delayed state
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    /// number of jobs in buried state
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,
    /// total jobs created in this tube
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// number of clients currently `use`ing this tube
    #[serde(rename = "current-using")]
    pub current_using: u64,
    /// number of clients that have `watch`ed this tube and are waiting on a
    /// `reserve`
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// number of clients that have `watch`ed this tube
    #[serde(rename = "current-watching")]
    pub current_watching: u64,
    /// number of seconds the tube was last paused for
    pub pause: u64,
    /// number of `delete` commands issued for this tube
    #[serde(rename = "cmd-delete")]
    pub cmd_delete: u64,
    /// number of `pause-tube` commands issued for this tube
    #[serde(rename = "cmd-pause-tube")]
    pub cmd_pause_tube: u64,
    /// seconds remaining until the tube is un-paused.
    #[serde(rename = "pause-time-left")]
    pub pause_time_left: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct ServerStats {
    /// number of ready jobs with priority < 1024
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    /// number of jobs in the ready queue
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by all clients
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    /// number of delayed jobs
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    /// number of buried jobs
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,

    #[serde(rename = "cmd-put")]
    pub cmd_put: u64,
    #[serde(rename = "cmd-peek")]
    pub cmd_peek: u64,
    #[serde(rename = "cmd-peek-ready")]
    pub cmd_peek_ready: u64,
    #[serde(rename = "cmd-peek-delayed")]
    pub cmd_peek_delayed: u64,
    #[serde(rename = "cmd-peek-buried")]
    pub cmd_peek_buried: u64,
    #[serde(rename = "cmd-reserve")]
    pub cmd_reserve: u64,
    #[serde(rename = "cmd-reserve-with-timeout")]
    pub cmd_reserve_with_timeout: u64,
    #[serde(rename = "cmd-reserve-job")]
    pub cmd_reserve_job: u64,
    #[serde(rename = "cmd-touch")]
    pub cmd_touch: u64,
    #[serde(rename = "cmd-use")]
    pub cmd_use: u64,
    #[serde(rename = "cmd-watch")]
    pub cmd_watch: u64,
    #[serde(rename = "cmd-ignore")]
    pub cmd_ignore: u64,
    #[serde(rename = "cmd-delete")]
    pub cmd_delete: u64,
    #[serde(rename = "cmd-release")]
    pub cmd_release: u64,
    #[serde(rename = "cmd-bury")]
    pub cmd_bury: u64,
    #[serde(rename = "cmd-kick")]
    pub cmd_kick: u64,
    #[serde(rename = "cmd-kick-job")]
    pub cmd_kick_job: u64,
    #[serde(rename = "cmd-stats")]
    pub cmd_stats: u64,
    #[serde(rename = "cmd-stats-job")]
    pub cmd_stats_job: u64,
    #[serde(rename = "cmd-stats-tube")]
    pub cmd_stats_tube: u64,
    #[serde(rename = "cmd-list-tubes")]
    pub cmd_list_tubes: u64,
    #[serde(rename = "cmd-list-tube-used")]
    pub cmd_list_tube_used: u64,
    #[serde(rename = "cmd-list-tubes-watched")]
    pub cmd_list_tubes_watched: u64,
    #[serde(rename = "cmd-pause-tube")]
    pub cmd_pause_tube: u64,

    /// cumulative count of times a job has timed out
    #[serde(rename = "job-timeouts")]
    pub job_timeouts: u64,
    /// cumulative count of jobs created
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// maximum number of bytes in a job
    #[serde(rename = "max-job-size")]
    pub max_job_size: u64,
    /// number of currently-existing tubes
    #[serde(rename = "current-tubes")]
    pub current_tubes: u64,
    /// number of currently open connections
    #[serde(rename = "current-connections")]
    pub current_connections: u64,
    /// number of open connections that have each issued at least one put command
    #[serde(rename = "current-producers")]
    pub current_producers: u64,
    /// number of open connections that have each issued at least one reserve command
    #[serde(rename = "current-workers")]
    pub current_workers: u64,
    /// number of open connections that have issued a reserve command but not yet received a response
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// cumulative count of connections
    #[serde(rename = "total-connections")]
    pub total_connections: u64,
    /// process id of the server
    pub pid: u32,
    /// version string of the server
    pub version: &'static str,
    /// number of seconds since this server process started running
    pub uptime: u64,
}
