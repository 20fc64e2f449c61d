use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::info;

use super::job::{Job, JobId};
use super::tube::Tube;
use crate::types::tube_name::TubeName;

/// Most delayed jobs a single sweep promotes per tube.
pub const MAX_PROMOTIONS_PER_SWEEP: usize = 100;

#[derive(Default)]
struct TubeMap {
    by_name: HashMap<TubeName, Arc<Tube>>,
    /// Creation order, for listing.
    order: Vec<Arc<Tube>>,
}

/// All tubes known to the broker. Tubes are created on first reference and
/// live as long as the broker.
pub struct TubeRegistry {
    tubes: RwLock<TubeMap>,
}

impl Default for TubeRegistry {
    fn default() -> Self {
        let registry = Self {
            tubes: RwLock::default(),
        };
        registry.get_or_create(&TubeName::default_tube());
        registry
    }
}

impl TubeRegistry {
    pub fn get(&self, name: &TubeName) -> Option<Arc<Tube>> {
        self.tubes.read().by_name.get(name).cloned()
    }

    /// Returns the named tube, creating it if this is its first use.
    pub fn get_or_create(&self, name: &TubeName) -> Arc<Tube> {
        if let Some(tube) = self.get(name) {
            return tube;
        }

        let mut tubes = self.tubes.write();
        if let Some(tube) = tubes.by_name.get(name) {
            return tube.clone();
        }

        let tube = Tube::new(name.clone());
        tubes.by_name.insert(name.clone(), tube.clone());
        tubes.order.push(tube.clone());
        info!(tube = %name, "created tube");
        tube
    }

    pub fn default_tube(&self) -> Arc<Tube> {
        self.get_or_create(&TubeName::default_tube())
    }

    pub fn names(&self) -> Vec<TubeName> {
        self.tubes
            .read()
            .order
            .iter()
            .map(|t| t.name().clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Tube>> {
        self.tubes.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.tubes.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Promotes due delayed jobs and resumes lapsed pauses on every tube.
    /// Returns true if any delayed job was promoted.
    pub fn sweep(&self, now: Instant) -> bool {
        let mut promoted = 0;
        for tube in self.all() {
            promoted += tube.promote_delayed(now, MAX_PROMOTIONS_PER_SWEEP);
            tube.resume_if_due(now);
        }
        promoted > 0
    }
}

/// Maps job IDs to live jobs.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<Job>>,
    seq: AtomicU32,
}

impl JobRegistry {
    /// Allocates an ID and registers a new job. The job is not placed in its
    /// tube until it is enqueued.
    ///
    /// IDs count up from 1 and wrap around, skipping 0 and IDs still in use.
    pub fn create(
        &self,
        tube: &Arc<Tube>,
        pri: u32,
        delay: Duration,
        ttr: Duration,
        body: Bytes,
    ) -> Arc<Job> {
        loop {
            let id = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id == 0 {
                continue;
            }

            if let Entry::Vacant(entry) = self.jobs.entry(id) {
                let job = Job::new(id, tube.clone(), pri, delay, ttr, body);
                entry.insert(job.clone());
                return job;
            }
        }
    }

    pub fn get(&self, id: JobId) -> Option<Arc<Job>> {
        self.jobs.get(&id).map(|job| job.clone())
    }

    pub fn remove(&self, id: JobId) -> Option<Arc<Job>> {
        self.jobs.remove(&id).map(|(_, job)| job)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
