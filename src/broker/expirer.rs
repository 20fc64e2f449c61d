use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::context::{ClientContext, ContextId};

/// Returns reserved jobs to ready once their time-to-run runs out.
///
/// Only contexts holding reservations are watched. A context is dropped from
/// the watch set once a sweep finds it holds nothing.
#[derive(Default)]
pub struct ReservedJobsExpirer {
    watched: Mutex<BTreeMap<ContextId, Arc<ClientContext>>>,
}

impl ReservedJobsExpirer {
    pub fn watch(&self, ctx: &Arc<ClientContext>) {
        self.watched
            .lock()
            .entry(ctx.id())
            .or_insert_with(|| ctx.clone());
    }

    pub fn watched_count(&self) -> usize {
        self.watched.lock().len()
    }

    /// Expires every reservation whose deadline is at or before `now`.
    /// Returns how many jobs timed out.
    pub fn sweep(&self, now: Instant) -> usize {
        let contexts: Vec<Arc<ClientContext>> =
            self.watched.lock().values().cloned().collect();

        let mut expired = 0;
        for ctx in contexts {
            while let Some((until, job)) = ctx.nearest_expiry() {
                if until > now || !job.expire(now) {
                    break;
                }

                debug!(id = job.id(), ctx = %ctx.id(), "reservation timed out");
                expired += 1;
            }

            // Checked under the watch lock so a concurrent watch() of a
            // fresh reservation isn't lost.
            let mut watched = self.watched.lock();
            if ctx.reserved_count() == 0 {
                watched.remove(&ctx.id());
            }
        }

        expired
    }
}
