// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{debug, info, o, Drain, Logger};
use timer::Guard;

use crate::cluster::{Cluster, ClusterKey};
use crate::connection::{Connection, ConnectionFactory};
use crate::connection_provider::types::PoolStats;
use crate::connection_provider::{ConnectionProvider, ProviderConnection};
use crate::error::Error;
use crate::server_manager::{connection_probe, ServerManager};

// How often zero-reference registry entries are collected.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

struct RegistryEntry<C>
where
    C: Connection,
{
    provider: Arc<ConnectionProvider<C>>,
    manager: Arc<ServerManager>,
    refs: Arc<AtomicUsize>,
}

type EntryMap<C> = Arc<Mutex<HashMap<ClusterKey, RegistryEntry<C>>>>;

/// A cache of shared, reference-counted provider and server-manager pairs
/// keyed by cluster identity.
///
/// Multiple logical client sessions targeting the same servers share one
/// provider (and therefore one pool and one health view) instead of each
/// opening their own. Handles returned by [`get`](ProviderRegistry::get)
/// decrement the entry's reference count when dropped; teardown of
/// zero-reference entries is deferred to a periodic sweep so that a client
/// that disposes and promptly reconnects to the same configuration does not
/// thrash the pool.
pub struct ProviderRegistry<C>
where
    C: Connection,
{
    entries: EntryMap<C>,
    create_connection: ConnectionFactory<C>,
    log: Logger,
    // Behind a lock because timer::Timer is not Sync and a registry is
    // typically shared process-wide.
    _cleanup: Mutex<(timer::Timer, Guard)>,
}

impl<C> ProviderRegistry<C>
where
    C: Connection,
{
    /// Return a new registry building providers from `create_connection`,
    /// sweeping unreferenced entries every 30 seconds.
    pub fn new(
        create_connection: ConnectionFactory<C>,
        log: Option<Logger>,
    ) -> Self {
        Self::with_cleanup_interval(create_connection, CLEANUP_INTERVAL, log)
    }

    /// Return a new registry with an explicit cleanup sweep interval.
    pub fn with_cleanup_interval(
        create_connection: ConnectionFactory<C>,
        cleanup_interval: Duration,
        log: Option<Logger>,
    ) -> Self {
        let log = log.unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });

        let entries: EntryMap<C> = Arc::new(Mutex::new(HashMap::new()));

        let cleanup_timer = timer::Timer::new();
        let cleanup_entries = Arc::clone(&entries);
        let cleanup_log = log.clone();
        let cleanup_guard = cleanup_timer.schedule_repeating(
            chrono::Duration::milliseconds(
                cleanup_interval.as_millis() as i64
            ),
            move || cleanup(&cleanup_entries, &cleanup_log),
        );

        ProviderRegistry {
            entries,
            create_connection,
            log,
            _cleanup: Mutex::new((cleanup_timer, cleanup_guard)),
        }
    }

    /// Resolve or create the shared provider for `cluster`.
    ///
    /// Structurally identical clusters resolve to the same underlying
    /// provider while at least one handle (or the pre-sweep grace window)
    /// keeps the entry alive. Fails with [`Error::Config`] when a new
    /// provider must be built and the configuration is invalid.
    pub fn get(&self, cluster: &Cluster) -> Result<ProviderHandle<C>, Error> {
        let mut entries = self.entries.lock().unwrap();
        let key = cluster.key();

        if let Some(entry) = entries.get(&key) {
            entry.refs.fetch_add(1, Ordering::SeqCst);
            debug!(self.log, "sharing existing provider for {}", key);
            return Ok(ProviderHandle {
                provider: Arc::clone(&entry.provider),
                refs: Arc::clone(&entry.refs),
            });
        }

        let probe = connection_probe(Arc::clone(&self.create_connection));
        let manager = Arc::new(ServerManager::new(
            cluster,
            probe,
            self.log.clone(),
        ));
        let provider = Arc::new(ConnectionProvider::new(
            cluster,
            Arc::clone(&manager),
            Arc::clone(&self.create_connection),
            Some(self.log.clone()),
        )?);
        let refs = Arc::new(AtomicUsize::new(1));

        info!(self.log, "created provider for {}", key);
        entries.insert(
            key,
            RegistryEntry {
                provider: Arc::clone(&provider),
                manager,
                refs: Arc::clone(&refs),
            },
        );

        Ok(ProviderHandle { provider, refs })
    }
}

// One cleanup pass: remove every entry whose reference count has dropped to
// zero and dispose its provider and server manager. Disposal happens after
// the registry lock is released so a slow pool teardown does not block
// concurrent get() calls.
fn cleanup<C>(entries: &EntryMap<C>, log: &Logger)
where
    C: Connection,
{
    let swept: Vec<(ClusterKey, RegistryEntry<C>)> = {
        let mut entries = entries.lock().unwrap();
        let dead: Vec<ClusterKey> = entries
            .iter()
            .filter(|(_, e)| e.refs.load(Ordering::SeqCst) == 0)
            .map(|(k, _)| k.clone())
            .collect();
        dead.into_iter()
            .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
            .collect()
    };

    for (key, entry) in swept {
        info!(log, "disposing unreferenced provider for {}", key);
        entry.provider.dispose();
        entry.manager.dispose();
    }
}

/// A disposal-aware handle to a shared [`ConnectionProvider`].
///
/// Dropping the handle decrements the entry's reference count. The shared
/// provider is not torn down immediately -- other live handles, or a
/// soon-arriving caller for the same configuration, may still need it; the
/// registry's periodic sweep collects entries once their count reaches zero.
pub struct ProviderHandle<C>
where
    C: Connection,
{
    provider: Arc<ConnectionProvider<C>>,
    refs: Arc<AtomicUsize>,
}

impl<C> ProviderHandle<C>
where
    C: Connection,
{
    /// Acquire a connection from the shared provider.
    pub fn open(&self) -> Result<ProviderConnection<C>, Error> {
        self.provider.open()
    }

    /// Release a connection back to the shared provider.
    pub fn close(&self, conn: ProviderConnection<C>) {
        self.provider.close(conn);
    }

    /// Report that a connection failed in use.
    pub fn error_occurred(
        &self,
        conn: ProviderConnection<C>,
        cause: Option<&dyn StdError>,
    ) {
        self.provider.error_occurred(conn, cause);
    }

    /// Current pool counts, or `None` for the non-pooling variant.
    pub fn stats(&self) -> Option<PoolStats> {
        self.provider.stats()
    }

    /// The shared provider backing this handle.
    pub fn provider(&self) -> &Arc<ConnectionProvider<C>> {
        &self.provider
    }
}

impl<C> Drop for ProviderHandle<C>
where
    C: Connection,
{
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}
