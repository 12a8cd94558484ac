use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::warn;

/// Tracks requests currently being processed, keyed by the caller-supplied
/// request id. `try_begin` is atomic per id (dashmap's entry API holds the
/// shard lock), so of N concurrent attempts exactly one is accepted.
///
/// Records left behind by a crashed run are force-reclaimed once older than
/// `reclaim_after`, so a request id is never permanently stuck.
pub struct InFlightRegistry {
    records: DashMap<String, InFlightRecord>,
    reclaim_after: Duration,
    generations: AtomicU64,
}

#[derive(Debug)]
struct InFlightRecord {
    started_at: Instant,
    // Distinguishes a reclaimed record from the one an old guard still holds,
    // so a late drop of the abandoned guard cannot release the new run.
    generation: u64,
}

pub enum Begin {
    Accepted(InFlightGuard),
    Duplicate,
}

impl InFlightRegistry {
    pub fn new(reclaim_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            records: DashMap::new(),
            reclaim_after,
            generations: AtomicU64::new(0),
        })
    }

    pub fn try_begin(self: &Arc<Self>, request_id: &str) -> Begin {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let record = InFlightRecord {
            started_at: Instant::now(),
            generation,
        };
        match self.records.entry(request_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if slot.get().started_at.elapsed() < self.reclaim_after {
                    return Begin::Duplicate;
                }
                warn!(request_id, "reclaiming abandoned in-flight record");
                slot.insert(record);
            }
        }
        Begin::Accepted(InFlightGuard {
            registry: Arc::clone(self),
            request_id: request_id.to_string(),
            generation,
        })
    }

    /// Unconditional removal; unknown ids are a no-op.
    pub fn end(&self, request_id: &str) {
        self.records.remove(request_id);
    }

    pub fn in_flight(&self) -> usize {
        self.records.len()
    }

    fn release(&self, request_id: &str, generation: u64) {
        self.records
            .remove_if(request_id, |_, record| record.generation == generation);
    }
}

/// Scoped ownership of one in-flight record. Dropping the guard releases the
/// record, which covers every exit path out of the orchestrator: success,
/// error, deadline, and client disconnect.
pub struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    request_id: String,
    generation: u64,
}

impl InFlightGuard {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.release(&self.request_id, self.generation);
    }
}
