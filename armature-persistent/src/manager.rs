//! Connection lookup for a worker.

use std::collections::hash_map::Entry;
use std::time::Instant;
use tracing::debug;

use crate::connection::{ConnectOptions, Connection, ConnectionId, Destination};
use crate::generation::Track;
use crate::pool::PersistentPool;
use crate::store::{Slot, WorkerStore};
use crate::Result;

impl PersistentPool {
    /// Find or create the started connection for `destination`.
    ///
    /// Stale generations of the destination's track are reclaimed first.
    /// An existing connection that sat idle too long is reset in place.
    /// Starting a connection restarts its request count.
    pub(crate) fn connection_for(
        &self,
        store: &mut WorkerStore,
        destination: &Destination,
        options: &ConnectOptions,
    ) -> Result<Slot> {
        let track = if destination.tls {
            Track::Tls
        } else {
            Track::Transport
        };
        let generation = self.generations.current(track);
        let reclaimed = store.reclaim(track, generation);
        if reclaimed > 0 {
            debug!(pool = %self.name, ?track, generation, reclaimed, "Dropped stale connections");
        }

        let (proxy, idle_timeout) = {
            let settings = self.settings.read();
            (
                settings
                    .proxy
                    .for_destination(&destination.host, destination.port)
                    .cloned(),
                settings.config.idle_timeout,
            )
        };
        let id = ConnectionId {
            host: destination.host.clone(),
            port: destination.port,
            proxy: proxy.clone(),
        };

        let existing = store.bucket_mut(track, generation).get(&id).map(Connection::key);
        if let Some(key) = existing
            && store.is_expired(key, idle_timeout, Instant::now())
        {
            store.forget(key);
            if let Some(connection) = store.bucket_mut(track, generation).get_mut(&id)
                && connection.finish()
            {
                debug!(
                    pool = %self.name,
                    connection = key,
                    id = %connection.id(),
                    "Idle connection expired"
                );
            }
        }

        let connection = match store.bucket_mut(track, generation).entry(id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let tls = if destination.tls {
                    Some(self.tls_client_config()?)
                } else {
                    None
                };
                entry.insert(Connection::new(destination.clone(), proxy, tls))
            }
        };

        let started = connection.is_started();
        if !started {
            connection.start(options)?;
        }
        let key = connection.key();
        if !started {
            store.forget(key);
        }

        Ok(Slot {
            track,
            generation,
            key,
            id,
        })
    }

    /// Restart the connection at `slot` under the same identity.
    pub(crate) fn reset(
        &self,
        store: &mut WorkerStore,
        slot: &Slot,
        options: &ConnectOptions,
    ) -> Result<()> {
        store.forget(slot.key);
        match store.connection_mut(slot) {
            Some(connection) => connection.reset(options),
            None => Ok(()),
        }
    }
}
