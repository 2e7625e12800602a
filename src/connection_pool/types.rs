// Copyright 2020 Joyent, Inc.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::connection::{Connection, ConnectionOptions};
use crate::connection_pool::pinning::Connections;
use crate::owner::Owner;

/// The connection counts for the connection pool
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ConnectionPoolStats {
    /// The number of connections created and not yet discarded by a reset
    pub total_connections: ConnectionCount,
    /// Connections not checked out: idle pinned ones plus unpinned ones
    pub idle_connections: ConnectionCount,
    /// Connections pinned to an owner, checked out or not
    pub pinned_connections: ConnectionCount,
    /// Connections pinned to no owner
    pub unpinned_connections: ConnectionCount,
}

impl ConnectionPoolStats {
    /// Create a new instance of `ConnectionPoolStats`
    pub fn new() -> Self {
        ConnectionPoolStats {
            total_connections: ConnectionCount::from(0),
            idle_connections: ConnectionCount::from(0),
            pinned_connections: ConnectionCount::from(0),
            unpinned_connections: ConnectionCount::from(0),
        }
    }
}

impl Default for ConnectionPoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The configuration options for a pinball connection pool. Every field is
/// optional; `ConnectionPoolOptions::default()` gives a pool of ten
/// connections with a 500 millisecond checkout timeout.
#[derive(Debug, Default)]
pub struct ConnectionPoolOptions {
    /// An optional maximum number of connections across all addresses. If
    /// not specified the default is 10.
    pub max_size: Option<u32>,
    /// An optional default timeout in milliseconds for `checkout` to wait
    /// when the pool is saturated. If not specified the default is 500
    /// milliseconds. `checkout_with_timeout` overrides it per call.
    pub checkout_timeout: Option<u64>,
    /// An optional timeout in milliseconds handed to `Connection::connect`.
    /// The pool itself never enforces it.
    pub connect_timeout: Option<u64>,
    /// Options handed to `Connection::connect` unchanged.
    pub connection_options: Option<ConnectionOptions>,
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the connection pool.
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

/// Identifies a connection for the lifetime of the process. Identifiers are
/// never reused, not even after a reset.
#[derive(Clone, Copy, Debug, Display, Eq, From, Hash, Into, PartialEq)]
pub struct ConnectionId(u64);

// The internal data structures used to manage the connection pool.
#[derive(Debug)]
pub(crate) struct ConnectionData<C, O> {
    pub(crate) connections: Connections<C, O>,
    pub(crate) instantiated: ConnectionCount,
    next_id: u64,
}

impl<C, O> ConnectionData<C, O>
where
    C: Connection,
    O: Owner,
{
    pub(crate) fn new() -> Self {
        ConnectionData {
            connections: Connections::new(),
            instantiated: ConnectionCount::from(0),
            next_id: 0,
        }
    }

    pub(crate) fn next_connection_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId::from(self.next_id)
    }
}

// Protected access to the internal connection pool data structures
#[derive(Debug)]
pub(crate) struct ProtectedData<C, O>(
    Arc<(Mutex<ConnectionData<C, O>>, Condvar)>,
);

impl<C, O> ProtectedData<C, O>
where
    C: Connection,
    O: Owner,
{
    pub(crate) fn new(connection_data: ConnectionData<C, O>) -> Self {
        ProtectedData(Arc::new((Mutex::new(connection_data), Condvar::new())))
    }

    pub(crate) fn connection_data_lock(
        &self,
    ) -> MutexGuard<ConnectionData<C, O>> {
        (self.0).0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Wait for a broadcast, or until `timeout` passes. No timeout waits
    // indefinitely.
    pub(crate) fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, ConnectionData<C, O>>,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, ConnectionData<C, O>>, bool) {
        let condvar = &(self.0).1;
        match timeout {
            Some(timeout) => {
                let (g, wait_result) = condvar
                    .wait_timeout(g, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
                (g, wait_result.timed_out())
            }
            None => {
                let g = condvar.wait(g).unwrap_or_else(PoisonError::into_inner);
                (g, false)
            }
        }
    }

    // Every waiter re-checks its own (owner, address) condition, so wake them
    // all.
    pub(crate) fn condvar_broadcast(&self) {
        (self.0).1.notify_all()
    }

    pub(crate) fn ptr_eq(&self, other: &ProtectedData<C, O>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<C, O> Clone for ProtectedData<C, O> {
    fn clone(&self) -> ProtectedData<C, O> {
        ProtectedData(Arc::clone(&self.0))
    }
}
