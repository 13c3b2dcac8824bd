// Copyright 2020 Joyent, Inc.

pub mod types;

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use slog::{debug, info, o, warn, Drain, Logger};
use timer::Guard;

use crate::cluster::{Cluster, TransportKind};
use crate::connection::{Connection, ConnectionFactory};
use crate::connection_provider::types::{
    IdleConnection, PoolData, PoolStats, ProtectedPool,
};
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::server_manager::ServerManager;

// Ceiling on how long an open() call will wait for a pool slot.
const POOL_WAIT_CEILING: Duration = Duration::from_secs(30);

/// Hands out ready-to-use connections for a cluster.
///
/// The variant is selected once at construction time from the cluster
/// configuration: [`Normal`](ConnectionProvider::Normal) opens a fresh
/// connection per request and fails over across endpoints;
/// [`Pooled`](ConnectionProvider::Pooled) caches and reuses connections
/// within configured bounds. Either way the caller receives a
/// [`ProviderConnection`] that releases itself back to the provider when
/// dropped.
pub enum ConnectionProvider<C>
where
    C: Connection,
{
    Normal(NormalProvider<C>),
    Pooled(PooledProvider<C>),
}

impl<C> ConnectionProvider<C>
where
    C: Connection,
{
    /// Build the provider variant selected by `cluster.pooling`.
    ///
    /// Fails with [`Error::Config`] if the configuration is invalid: a
    /// non-pooling provider over multiple endpoints requires every endpoint
    /// to carry a non-zero timeout, otherwise a dead server could stall
    /// failover indefinitely.
    pub fn new(
        cluster: &Cluster,
        manager: Arc<ServerManager>,
        create_connection: ConnectionFactory<C>,
        log: Option<Logger>,
    ) -> Result<Self, Error> {
        let log = log.unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });
        if cluster.pooling {
            Ok(ConnectionProvider::Pooled(PooledProvider::new(
                cluster,
                manager,
                create_connection,
                log,
            )))
        } else {
            Ok(ConnectionProvider::Normal(NormalProvider::new(
                cluster,
                manager,
                create_connection,
                log,
            )?))
        }
    }

    /// Acquire a healthy, open connection.
    ///
    /// The pooled variant may block the calling thread for up to 30 seconds
    /// waiting for a slot when the pool is saturated.
    pub fn open(&self) -> Result<ProviderConnection<C>, Error> {
        match self {
            ConnectionProvider::Normal(p) => {
                let (conn, endpoint) = p.open()?;
                Ok(ProviderConnection {
                    conn: Some(conn),
                    endpoint,
                    created: Instant::now(),
                    owner: Owner::Normal,
                    log: p.log.clone(),
                })
            }
            ConnectionProvider::Pooled(p) => {
                let (conn, endpoint, created) = p.open()?;
                Ok(ProviderConnection {
                    conn: Some(conn),
                    endpoint,
                    created,
                    owner: Owner::Pooled {
                        pool: p.protected.clone(),
                        connection_lifetime: p.connection_lifetime,
                    },
                    log: p.log.clone(),
                })
            }
        }
    }

    /// Release a connection back to the provider. Equivalent to dropping
    /// the guard.
    pub fn close(&self, conn: ProviderConnection<C>) {
        drop(conn);
    }

    /// Report that a connection failed in use.
    ///
    /// The connection is closed and never returned to a pool, and the
    /// failure is forwarded to the server manager, quarantining the
    /// endpoint. The pooled variant additionally discards every idle
    /// connection bound to the same endpoint: a confirmed socket failure
    /// discredits all cached sessions to that server.
    pub fn error_occurred(
        &self,
        mut conn: ProviderConnection<C>,
        cause: Option<&dyn StdError>,
    ) {
        let endpoint = conn.endpoint.clone();
        if let Some(cause) = cause {
            warn!(
                self.log(),
                "connection to {} failed: {}", endpoint, cause
            );
        }
        match self {
            ConnectionProvider::Normal(p) => {
                if let Some(mut c) = conn.conn.take() {
                    if c.is_open() {
                        let _ = c.close();
                    }
                }
                p.manager.error_occurred(&endpoint);
            }
            ConnectionProvider::Pooled(p) => {
                let c = conn.conn.take();
                p.fail(c, &endpoint);
            }
        }
    }

    /// Current pool counts, or `None` for the non-pooling variant and for a
    /// disposed pool.
    pub fn stats(&self) -> Option<PoolStats> {
        match self {
            ConnectionProvider::Normal(_) => None,
            ConnectionProvider::Pooled(p) => p.stats(),
        }
    }

    /// Close every held connection and stop background sweeps. Subsequent
    /// `open` calls on the pooled variant fail with
    /// [`Error::ProviderDisposed`].
    pub fn dispose(&self) {
        match self {
            ConnectionProvider::Normal(_) => (),
            ConnectionProvider::Pooled(p) => p.dispose(),
        }
    }

    fn log(&self) -> &Logger {
        match self {
            ConnectionProvider::Normal(p) => &p.log,
            ConnectionProvider::Pooled(p) => &p.log,
        }
    }
}

/// A connection checked out from a [`ConnectionProvider`].
///
/// Dereferences to the underlying connection. Dropping the guard releases
/// the connection: the non-pooling variant closes it, the pooled variant
/// returns it to the free queue when it is still alive and within its
/// lifetime cap, closing it otherwise.
pub struct ProviderConnection<C>
where
    C: Connection,
{
    conn: Option<C>,
    endpoint: Endpoint,
    created: Instant,
    owner: Owner<C>,
    log: Logger,
}

enum Owner<C>
where
    C: Connection,
{
    Normal,
    Pooled {
        pool: ProtectedPool<C>,
        connection_lifetime: Duration,
    },
}

impl<C> ProviderConnection<C>
where
    C: Connection,
{
    /// The endpoint this connection is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl<C> Deref for ProviderConnection<C>
where
    C: Connection,
{
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().unwrap()
    }
}

impl<C> DerefMut for ProviderConnection<C>
where
    C: Connection,
{
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap()
    }
}

impl<C> Drop for ProviderConnection<C>
where
    C: Connection,
{
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            // Already consumed by error_occurred.
            None => return,
        };
        match &self.owner {
            Owner::Normal => {
                let mut conn = conn;
                if conn.is_open() {
                    if let Err(e) = conn.close() {
                        warn!(
                            self.log,
                            "failed to close connection to {}: {}",
                            self.endpoint,
                            e
                        );
                    }
                }
            }
            Owner::Pooled {
                pool,
                connection_lifetime,
            } => {
                replace_in_pool(
                    pool,
                    conn,
                    self.endpoint.clone(),
                    self.created,
                    *connection_lifetime,
                    &self.log,
                );
            }
        }
    }
}

/// A provider that opens a fresh connection on every request.
///
/// `open` walks the server manager's selections until a connection opens or
/// the manager runs out of live endpoints. Each transport failure
/// quarantines exactly one endpoint before the next pick, so the loop makes
/// at most one attempt per configured endpoint. Connection opening happens
/// outside any provider lock.
pub struct NormalProvider<C>
where
    C: Connection,
{
    manager: Arc<ServerManager>,
    create_connection: ConnectionFactory<C>,
    transport_kind: TransportKind,
    buffer_size: usize,
    log: Logger,
}

impl<C> NormalProvider<C>
where
    C: Connection,
{
    pub fn new(
        cluster: &Cluster,
        manager: Arc<ServerManager>,
        create_connection: ConnectionFactory<C>,
        log: Logger,
    ) -> Result<Self, Error> {
        if cluster.endpoints.len() > 1
            && cluster
                .endpoints
                .iter()
                .any(|e| e.timeout == Duration::from_secs(0))
        {
            return Err(Error::Config(String::from(
                "a connection timeout must be specified when using \
                 multiple servers",
            )));
        }
        Ok(NormalProvider {
            manager,
            create_connection,
            transport_kind: cluster.transport_kind,
            buffer_size: cluster.buffer_size,
            log,
        })
    }

    fn open(&self) -> Result<(C, Endpoint), Error> {
        while let Some(endpoint) = self.manager.get_server() {
            let mut conn = (self.create_connection)(
                &endpoint,
                self.transport_kind,
                self.buffer_size,
            );
            match conn.open() {
                Ok(()) => {
                    debug!(self.log, "opened connection to {}", endpoint);
                    return Ok((conn, endpoint));
                }
                Err(e) => {
                    warn!(
                        self.log,
                        "failed to open connection to {}: {}", endpoint, e
                    );
                    self.manager.error_occurred(&endpoint);
                    let _ = conn.close();
                }
            }
        }
        Err(Error::AllServersFailed)
    }
}

/// A provider that maintains bounded free and used connection partitions.
///
/// Idle connections are reused in FIFO order once the pool has grown past
/// `min_pool_size`; below the minimum a new connection is opened even when
/// idle ones exist, so the pool warms up to its floor. At `max_pool_size`
/// callers wait on the pool's condition variable for a slot. A periodic
/// sweep at the cluster polling interval evicts idle connections that died
/// or outlived the lifetime cap.
pub struct PooledProvider<C>
where
    C: Connection,
{
    protected: ProtectedPool<C>,
    manager: Arc<ServerManager>,
    create_connection: ConnectionFactory<C>,
    min_pool_size: u32,
    max_pool_size: u32,
    transport_kind: TransportKind,
    buffer_size: usize,
    connection_lifetime: Duration,
    sweep_guard: Mutex<Option<Guard>>,
    // Behind a lock because timer::Timer is not Sync and providers are
    // shared across request and timer threads.
    _sweep_timer: Mutex<timer::Timer>,
    log: Logger,
}

impl<C> PooledProvider<C>
where
    C: Connection,
{
    pub fn new(
        cluster: &Cluster,
        manager: Arc<ServerManager>,
        create_connection: ConnectionFactory<C>,
        log: Logger,
    ) -> Self {
        let protected =
            ProtectedPool::new(PoolData::new(cluster.max_pool_size as usize));

        let sweep_timer = timer::Timer::new();
        let sweep_pool = protected.clone();
        let sweep_lifetime = cluster.connection_lifetime;
        let sweep_log = log.clone();
        let sweep_guard = sweep_timer.schedule_repeating(
            chrono::Duration::milliseconds(
                cluster.polling_interval.as_millis() as i64,
            ),
            move || evict_idle(&sweep_pool, sweep_lifetime, &sweep_log),
        );

        PooledProvider {
            protected,
            manager,
            create_connection,
            min_pool_size: cluster.min_pool_size,
            max_pool_size: cluster.max_pool_size,
            transport_kind: cluster.transport_kind,
            buffer_size: cluster.buffer_size,
            connection_lifetime: cluster.connection_lifetime,
            sweep_guard: Mutex::new(Some(sweep_guard)),
            _sweep_timer: Mutex::new(sweep_timer),
            log,
        }
    }

    fn open(&self) -> Result<(C, Endpoint, Instant), Error> {
        let mut data = self.protected.pool_lock();
        loop {
            if data.disposed {
                return Err(Error::ProviderDisposed);
            }
            let pool_size = u32::from(data.pool_size());

            // The free queue is only consulted once the pool has reached
            // its floor; below min_pool_size a fresh connection is opened
            // even when idle ones exist.
            if pool_size >= self.min_pool_size && !data.free.is_empty() {
                let idle = data.free.pop_front().unwrap();
                if !idle.conn.is_open() {
                    // Died while idle. Drop it and look again.
                    debug!(
                        self.log,
                        "discarding dead idle connection to {}", idle.endpoint
                    );
                    continue;
                }
                data.used += 1.into();
                debug!(
                    self.log,
                    "reusing idle connection to {}", idle.endpoint
                );
                return Ok((idle.conn, idle.endpoint, idle.created));
            }

            if pool_size >= self.max_pool_size {
                let (guard, timed_out) =
                    self.protected.condvar_wait(data, POOL_WAIT_CEILING);
                data = guard;
                if timed_out {
                    return Err(Error::PoolTimeout);
                }
                continue;
            }

            let endpoint = match self.manager.get_server() {
                Some(endpoint) => endpoint,
                None => return Err(Error::AllServersFailed),
            };
            let mut conn = (self.create_connection)(
                &endpoint,
                self.transport_kind,
                self.buffer_size,
            );
            match conn.open() {
                Ok(()) => {
                    data.used += 1.into();
                    info!(self.log, "opened connection to {}", endpoint);
                    return Ok((conn, endpoint, Instant::now()));
                }
                Err(e) => {
                    warn!(
                        self.log,
                        "failed to open connection to {}: {}", endpoint, e
                    );
                    let _ = conn.close();
                    self.manager.error_occurred(&endpoint);
                }
            }
        }
    }

    fn fail(&self, conn: Option<C>, endpoint: &Endpoint) {
        {
            let mut data = self.protected.pool_lock();
            if data.used > 0.into() {
                data.used -= 1.into();
            }
            if let Some(mut conn) = conn {
                let _ = conn.close();
            }

            let mut kept = VecDeque::with_capacity(data.free.len());
            let mut dropped = 0;
            while let Some(mut idle) = data.free.pop_front() {
                if idle.endpoint == *endpoint {
                    let _ = idle.conn.close();
                    dropped += 1;
                } else {
                    kept.push_back(idle);
                }
            }
            data.free = kept;
            if dropped > 0 {
                warn!(
                    self.log,
                    "discarded {} idle connections to failed endpoint {}",
                    dropped,
                    endpoint
                );
            }
        }
        self.protected.condvar_notify();
        self.manager.error_occurred(endpoint);
    }

    fn stats(&self) -> Option<PoolStats> {
        let data = self.protected.pool_lock();
        if data.disposed {
            None
        } else {
            Some(data.stats())
        }
    }

    fn dispose(&self) {
        {
            let mut data = self.protected.pool_lock();
            if data.disposed {
                return;
            }
            data.disposed = true;
            while let Some(mut idle) = data.free.pop_front() {
                let _ = idle.conn.close();
            }
            data.used = 0.into();
            info!(self.log, "connection pool disposed");
        }
        self.sweep_guard.lock().unwrap().take();
        self.protected.condvar_notify_all();
    }
}

// Return a connection to the pool. The connection is kept when the pool is
// still running, it is open, and it is within the lifetime cap; otherwise it
// is closed and dropped. One waiter is notified either way: returning a
// connection frees a slot even when the connection itself is discarded.
fn replace_in_pool<C>(
    pool: &ProtectedPool<C>,
    mut conn: C,
    endpoint: Endpoint,
    created: Instant,
    connection_lifetime: Duration,
    log: &Logger,
) where
    C: Connection,
{
    {
        let mut data = pool.pool_lock();
        if data.used > 0.into() {
            data.used -= 1.into();
        }
        if !data.disposed && idle_is_alive(&conn, created, connection_lifetime)
        {
            data.free.push_back(IdleConnection {
                conn,
                endpoint,
                created,
            });
        } else {
            debug!(log, "dropping returned connection to {}", endpoint);
            let _ = conn.close();
        }
    }
    pool.condvar_notify();
}

fn idle_is_alive<C>(conn: &C, created: Instant, lifetime: Duration) -> bool
where
    C: Connection,
{
    if lifetime > Duration::from_secs(0) && created.elapsed() > lifetime {
        return false;
    }
    conn.is_open()
}

// One eviction pass: re-partition the free queue into still-alive and
// dead-or-expired, closing the latter. Runs on the sweep timer thread and
// never lets a failure escape the tick.
fn evict_idle<C>(
    protected: &ProtectedPool<C>,
    connection_lifetime: Duration,
    log: &Logger,
) where
    C: Connection,
{
    let mut data = protected.pool_lock();
    if data.disposed || data.free.is_empty() {
        return;
    }
    let before = data.free.len();
    let mut live = VecDeque::with_capacity(before);
    while let Some(mut idle) = data.free.pop_front() {
        if idle_is_alive(&idle.conn, idle.created, connection_lifetime) {
            live.push_back(idle);
        } else if idle.conn.is_open() {
            let _ = idle.conn.close();
        }
    }
    data.free = live;
    let evicted = before - data.free.len();
    if evicted > 0 {
        debug!(log, "evicted {} dead or expired idle connections", evicted);
    }
}
