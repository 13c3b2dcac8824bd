// Copyright 2020 Joyent, Inc.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use derive_more::{
    Add, AddAssign, Display, From, Into, Sub, SubAssign,
};

use crate::connection::Connection;
use crate::endpoint::Endpoint;

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the pooled provider.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// The connection counts for the pooled provider.
#[derive(Copy, Clone, Debug)]
pub struct PoolStats {
    /// The total number of live connections, idle and checked out.
    pub total_connections: ConnectionCount,
    /// The count of idle connections in the free queue.
    pub idle_connections: ConnectionCount,
}

// An idle pool member: the connection, the endpoint it is bound to, and the
// instant it was first opened. The creation instant drives lifetime capping;
// the endpoint lets a confirmed failure evict every cached connection to the
// same server.
#[doc(hidden)]
#[derive(Debug)]
pub struct IdleConnection<C> {
    pub conn: C,
    pub endpoint: Endpoint,
    pub created: Instant,
}

// The internal data structures used to manage the pooled provider. The free
// queue holds idle connections in FIFO order; used counts the connections
// currently checked out to callers.
#[doc(hidden)]
#[derive(Debug)]
pub struct PoolData<C> {
    pub free: VecDeque<IdleConnection<C>>,
    pub used: ConnectionCount,
    pub disposed: bool,
}

impl<C> PoolData<C>
where
    C: Connection,
{
    #[doc(hidden)]
    pub fn new(max_size: usize) -> Self {
        PoolData {
            free: VecDeque::with_capacity(max_size),
            used: ConnectionCount::from(0),
            disposed: false,
        }
    }

    pub fn pool_size(&self) -> ConnectionCount {
        ConnectionCount::from(self.free.len() as u32) + self.used
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_connections: self.pool_size(),
            idle_connections: ConnectionCount::from(self.free.len() as u32),
        }
    }
}

// Protected access to the pool's internal data structures: the free/used
// partitions and the condition variable callers wait on when the pool is
// saturated.
#[doc(hidden)]
#[derive(Debug)]
pub struct ProtectedPool<C>(Arc<(Mutex<PoolData<C>>, Condvar)>);

impl<C> ProtectedPool<C>
where
    C: Connection,
{
    pub fn new(pool_data: PoolData<C>) -> Self {
        ProtectedPool(Arc::new((Mutex::new(pool_data), Condvar::new())))
    }

    pub fn pool_lock(&self) -> MutexGuard<PoolData<C>> {
        (self.0).0.lock().unwrap()
    }

    pub fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, PoolData<C>>,
        timeout: Duration,
    ) -> (MutexGuard<'a, PoolData<C>>, bool) {
        let wait_result = (self.0).1.wait_timeout(g, timeout).unwrap();
        (wait_result.0, wait_result.1.timed_out())
    }

    pub fn condvar_notify(&self) {
        (self.0).1.notify_one()
    }

    pub fn condvar_notify_all(&self) {
        (self.0).1.notify_all()
    }
}

impl<C> Clone for ProtectedPool<C>
where
    C: Connection,
{
    fn clone(&self) -> ProtectedPool<C> {
        ProtectedPool(Arc::clone(&self.0))
    }
}
