use serde::Serialize;
use tokio::time::Instant;

/// Lifecycle state of a job. Time-bound states carry their deadline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    /// Only seen between construction and the first placement in a tube.
    New,
    Ready,
    Delayed { until: Instant },
    Reserved { until: Instant },
    Buried,
    /// Terminal; the job is in no tube structure and no registry.
    Deleted,
}

impl JobState {
    pub fn is_reserved(&self) -> bool {
        matches!(self, JobState::Reserved { .. })
    }
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use JobState::*;

        serializer.serialize_str(match self {
            Ready => "ready",
            Delayed { until: _ } => "delayed",
            Reserved { until: _ } => "reserved",
            Buried => "buried",
            New | Deleted => "invalid",
        })
    }
}
