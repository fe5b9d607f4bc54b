//! Closing connections.

use tracing::{info, warn};

use crate::pool::PersistentPool;
use crate::store::WorkerId;

impl PersistentPool {
    /// Close every connection held by `worker` and forget the worker.
    ///
    /// Both generations are bumped, so other workers replace their
    /// connections on next use as well. Returns the number of connections
    /// closed for `worker`.
    pub fn shutdown(&self, worker: WorkerId) -> usize {
        let (transport, ssl) = self.generations.bump_both();
        let store = self.workers.write().remove(&worker);
        let closed = store.map_or(0, |store| store.lock().shutdown());
        info!(pool = %self.name, %worker, closed, transport, ssl, "Worker connections shut down");
        closed
    }

    /// Close every connection held by the calling thread.
    pub fn shutdown_current(&self) -> usize {
        self.shutdown(WorkerId::current())
    }

    /// Close the connections of every worker and forget all workers.
    ///
    /// This reaches into stores owned by other workers. A connection in the
    /// middle of an exchange is closed once its request completes. Prefer
    /// [`PersistentPool::shutdown`] from each worker; use this only when that
    /// is not possible.
    pub fn shutdown_all(&self) -> usize {
        let (transport, ssl) = self.generations.bump_both();
        let stores: Vec<_> = self.workers.write().drain().collect();
        let workers = stores.len();

        let mut closed = 0;
        for (worker, store) in stores {
            let count = store.lock().shutdown();
            if count > 0 {
                info!(pool = %self.name, %worker, closed = count, "Worker connections shut down");
            }
            closed += count;
        }
        warn!(
            pool = %self.name,
            workers,
            closed,
            transport,
            ssl,
            "Shut down connections of all workers"
        );
        closed
    }
}
