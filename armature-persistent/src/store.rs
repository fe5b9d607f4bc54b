//! Per-worker connection tables.

use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::connection::{Connection, ConnectionId};
use crate::error::Diagnostics;
use crate::generation::Track;

static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);

/// Worker stores of one pool, by worker.
pub(crate) type Registry = RwLock<HashMap<WorkerId, Arc<Mutex<WorkerStore>>>>;

thread_local! {
    static THREAD_WORKER: ThreadWorker = ThreadWorker {
        id: WorkerId::next(),
        registries: RefCell::new(Vec::new()),
    };
}

/// Implicit worker of an OS thread.
///
/// Remembers every registry holding a store for this thread and removes
/// those stores when the thread exits.
struct ThreadWorker {
    id: WorkerId,
    registries: RefCell<Vec<Weak<Registry>>>,
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        for registry in self.registries.get_mut().drain(..) {
            let Some(registry) = registry.upgrade() else {
                continue;
            };
            let store = registry.write().remove(&self.id);
            if let Some(store) = store {
                let closed = store.lock().shutdown();
                debug!(worker = %self.id, closed, "Thread exited, worker store dropped");
            }
        }
    }
}

/// Tie the calling thread's store in `registry` to the thread's lifetime.
///
/// Entries for registries that no longer exist are pruned on the way.
pub(crate) fn bind_to_thread(registry: &Arc<Registry>) {
    let _ = THREAD_WORKER.try_with(|worker| {
        let mut registries = worker.registries.borrow_mut();
        registries.retain(|known| known.strong_count() > 0);
        if !registries
            .iter()
            .any(|known| std::ptr::eq(known.as_ptr(), Arc::as_ptr(registry)))
        {
            registries.push(Arc::downgrade(registry));
        }
    });
}

/// Identity of a unit of execution owning its own connections.
///
/// Every OS thread gets an implicit id on first use; callers running their
/// own scheduling can allocate ids with [`WorkerId::next`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Allocate a fresh, process-unique id.
    pub fn next() -> Self {
        Self(NEXT_WORKER.fetch_add(1, Ordering::Relaxed))
    }

    /// Implicit id of the calling thread.
    pub fn current() -> Self {
        THREAD_WORKER.with(|worker| worker.id)
    }

    /// Numeric value of the id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Location of a connection inside a [`WorkerStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Slot {
    pub(crate) track: Track,
    pub(crate) generation: u64,
    pub(crate) id: ConnectionId,
    pub(crate) key: u64,
}

type Bucket = HashMap<ConnectionId, Connection>;

/// Connections and bookkeeping owned by one worker.
#[derive(Debug, Default)]
pub(crate) struct WorkerStore {
    buckets: HashMap<Track, BTreeMap<u64, Bucket>>,
    request_counts: HashMap<u64, u64>,
    last_used: HashMap<u64, Instant>,
}

impl WorkerStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Bucket for a track and generation, created on demand.
    pub(crate) fn bucket_mut(&mut self, track: Track, generation: u64) -> &mut Bucket {
        self.buckets
            .entry(track)
            .or_default()
            .entry(generation)
            .or_default()
    }

    pub(crate) fn connection_mut(&mut self, slot: &Slot) -> Option<&mut Connection> {
        self.buckets
            .get_mut(&slot.track)?
            .get_mut(&slot.generation)?
            .get_mut(&slot.id)
    }

    /// Move a connection out of its bucket while it is in use.
    pub(crate) fn check_out(&mut self, slot: &Slot) -> Option<Connection> {
        self.buckets
            .get_mut(&slot.track)?
            .get_mut(&slot.generation)?
            .remove(&slot.id)
    }

    /// Put a checked-out connection back.
    ///
    /// A connection opened for the same identity in the meantime is closed
    /// and replaced.
    pub(crate) fn check_in(&mut self, slot: &Slot, connection: Connection) {
        if let Some(displaced) = self
            .bucket_mut(slot.track, slot.generation)
            .insert(slot.id.clone(), connection)
        {
            self.forget(displaced.key());
        }
    }

    /// Count one attempt on a connection; returns the new total.
    pub(crate) fn record_request(&mut self, key: u64) -> u64 {
        let count = self.request_counts.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// Attempts made on a connection since it was last (re)started.
    pub(crate) fn request_count(&self, key: u64) -> u64 {
        self.request_counts.get(&key).copied().unwrap_or(0)
    }

    /// Stamp a connection as used at `now`.
    pub(crate) fn touch(&mut self, key: u64, now: Instant) {
        self.last_used.insert(key, now);
    }

    /// Time since a connection was last used.
    pub(crate) fn idle_for(&self, key: u64, now: Instant) -> Option<Duration> {
        self.last_used
            .get(&key)
            .map(|last| now.saturating_duration_since(*last))
    }

    /// Whether a connection has sat idle for too long to be trusted.
    ///
    /// No timeout means never; a zero timeout means always; a connection
    /// that was never used counts as expired.
    pub(crate) fn is_expired(&self, key: u64, idle_timeout: Option<Duration>, now: Instant) -> bool {
        match idle_timeout {
            None => false,
            Some(timeout) if timeout.is_zero() => true,
            Some(timeout) => self
                .idle_for(key, now)
                .is_none_or(|idle| idle > timeout),
        }
    }

    /// Drop the bookkeeping of a connection.
    pub(crate) fn forget(&mut self, key: u64) {
        self.request_counts.remove(&key);
        self.last_used.remove(&key);
    }

    pub(crate) fn diagnostics(&self, key: u64, now: Instant) -> Diagnostics {
        Diagnostics {
            connection: key,
            requests: self.request_count(key),
            idle: self.idle_for(key, now),
        }
    }

    /// Finish and drop every connection of `track` older than `active`.
    ///
    /// Returns the number of connections reclaimed.
    pub(crate) fn reclaim(&mut self, track: Track, active: u64) -> usize {
        let Some(generations) = self.buckets.get_mut(&track) else {
            return 0;
        };
        let current = generations.split_off(&active);
        let stale = std::mem::replace(generations, current);

        let mut reclaimed = 0;
        for (generation, bucket) in stale {
            for (_, mut connection) in bucket {
                connection.finish();
                self.request_counts.remove(&connection.key());
                self.last_used.remove(&connection.key());
                reclaimed += 1;
            }
            debug!(?track, generation, active, "Reclaimed stale generation");
        }
        reclaimed
    }

    /// Finish every connection on both tracks and clear all bookkeeping.
    pub(crate) fn shutdown(&mut self) -> usize {
        let mut finished = 0;
        for (_, generations) in self.buckets.drain() {
            for (_, bucket) in generations {
                for (_, mut connection) in bucket {
                    connection.finish();
                    finished += 1;
                }
            }
        }
        self.request_counts.clear();
        self.last_used.clear();
        finished
    }

    /// Connections currently held, started or not.
    pub(crate) fn connection_count(&self) -> usize {
        self.buckets
            .values()
            .flat_map(BTreeMap::values)
            .map(HashMap::len)
            .sum()
    }

    #[cfg(test)]
    pub(crate) fn bucket_len(&self, track: Track, generation: u64) -> usize {
        self.buckets
            .get(&track)
            .and_then(|generations| generations.get(&generation))
            .map_or(0, HashMap::len)
    }
}
