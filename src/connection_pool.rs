// Copyright 2020 Joyent, Inc.

mod pinning;
pub mod types;

use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use slog::{debug, info, o, trace, warn, Drain, Logger};

use crate::address::Address;
use crate::connection::{Connection, ConnectionOptions};
use crate::connection_pool::types::{
    ConnectionCount, ConnectionData, ConnectionId, ConnectionPoolOptions,
    ConnectionPoolStats, ProtectedData,
};
use crate::error::Error;
use crate::owner::{Owner, OwnerLiveness};

// Default number of maximum pool connections
const DEFAULT_MAX_SIZE: u32 = 10;
// Default checkout wait in milliseconds
const DEFAULT_CHECKOUT_TIMEOUT: u64 = 500;

/// The function the pool calls to establish a new connection. It receives the
/// address being checked out, the configured connect timeout and the
/// configured connection options.
pub type Connector<C> = Arc<
    dyn Fn(
            &Address,
            Option<Duration>,
            &ConnectionOptions,
        ) -> Result<C, <C as Connection>::Error>
        + Send
        + Sync,
>;

/// A pool of connections to one or more addresses, pinned to owners
pub struct ConnectionPool<C, O>
where
    C: Connection,
    O: Owner,
{
    protected_data: ProtectedData<C, O>,
    max_size: ConnectionCount,
    checkout_timeout: Duration,
    connect_timeout: Option<Duration>,
    connection_options: Arc<ConnectionOptions>,
    connector: Connector<C>,
    liveness: Arc<dyn OwnerLiveness<O>>,
    log: Logger,
}

impl<C, O> Debug for ConnectionPool<C, O>
where
    C: Connection,
    O: Owner,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("ConnectionPool")
            .field("max_size", &self.max_size)
            .field("checkout_timeout", &self.checkout_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("connection_options", &self.connection_options)
            .field("log", &self.log)
            .finish()
    }
}

impl<C, O> Clone for ConnectionPool<C, O>
where
    C: Connection,
    O: Owner,
{
    fn clone(&self) -> ConnectionPool<C, O> {
        ConnectionPool {
            protected_data: self.protected_data.clone(),
            max_size: self.max_size,
            checkout_timeout: self.checkout_timeout,
            connect_timeout: self.connect_timeout,
            connection_options: Arc::clone(&self.connection_options),
            connector: Arc::clone(&self.connector),
            liveness: Arc::clone(&self.liveness),
            log: self.log.clone(),
        }
    }
}

impl<C, O> ConnectionPool<C, O>
where
    C: Connection,
    O: Owner,
{
    /// Create a pool that establishes connections with `Connection::connect`.
    /// `liveness` decides which owners still hold on to their pinned
    /// connections; the connections of every other owner are reclaimed on
    /// the next checkout.
    pub fn new<L>(cpo: ConnectionPoolOptions, liveness: L) -> Self
    where
        L: OwnerLiveness<O> + 'static,
    {
        Self::with_connector(cpo, liveness, C::connect)
    }

    /// Create a pool that establishes connections by calling `connector`.
    pub fn with_connector<L, F>(
        cpo: ConnectionPoolOptions,
        liveness: L,
        connector: F,
    ) -> Self
    where
        L: OwnerLiveness<O> + 'static,
        F: Fn(
                &Address,
                Option<Duration>,
                &ConnectionOptions,
            ) -> Result<C, C::Error>
            + Send
            + Sync
            + 'static,
    {
        let max_size = cpo.max_size.unwrap_or(DEFAULT_MAX_SIZE);
        let checkout_timeout = Duration::from_millis(
            cpo.checkout_timeout.unwrap_or(DEFAULT_CHECKOUT_TIMEOUT),
        );

        let logger = cpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        debug!(
            logger,
            "Creating connection pool: max_size {}, checkout timeout {}ms",
            max_size,
            checkout_timeout.as_millis()
        );

        ConnectionPool {
            protected_data: ProtectedData::new(ConnectionData::new()),
            max_size: ConnectionCount::from(max_size),
            checkout_timeout,
            connect_timeout: cpo.connect_timeout.map(Duration::from_millis),
            connection_options: Arc::new(
                cpo.connection_options.unwrap_or_default(),
            ),
            connector: Arc::new(connector),
            liveness: Arc::new(liveness),
            log: logger,
        }
    }

    /// Check out a connection to `address` for `owner`, waiting up to the
    /// pool's checkout timeout if the pool is saturated.
    pub fn checkout(
        &self,
        owner: &O,
        address: &str,
    ) -> Result<PoolConnection<C, O>, Error> {
        self.checkout_with_timeout(owner, address, self.checkout_timeout)
    }

    /// Check out a connection to `address` for `owner`.
    ///
    /// The owner gets back the connection already pinned to it for this
    /// address if there is one, otherwise an unpinned connection to the
    /// address, otherwise a new connection if the pool is below `max_size`.
    /// When the pool is saturated the call blocks until a connection to the
    /// address is checked in or unpinned, failing with
    /// `Error::CapacityExceeded` once `timeout` has elapsed. Errors from
    /// establishing a new connection are returned as
    /// `Error::ConnectionFailure` and never retried.
    pub fn checkout_with_timeout(
        &self,
        owner: &O,
        address: &str,
        timeout: Duration,
    ) -> Result<PoolConnection<C, O>, Error> {
        let started = Instant::now();
        // None only when the timeout is too large to represent, in which case
        // there is no deadline.
        let deadline = started.checked_add(timeout);

        let mut connection_data = self.protected_data.connection_data_lock();
        self.cleanup_connections(&mut connection_data);

        if let Some(connection) =
            connection_data.connections.get(address).get(owner)
        {
            trace!(
                self.log,
                "Checked out connection {} to {} for {:?}",
                connection.id(),
                address,
                owner
            );
            return Ok(connection);
        }

        if self.is_saturated(&connection_data) {
            self.wait_for_available(
                connection_data,
                owner,
                address,
                started,
                deadline,
            )
        } else {
            self.create_connection(&mut connection_data, owner, address)
        }
    }

    /// Return a connection to the pool. It stays pinned to its owner, and
    /// every caller blocked in `checkout` is woken to look for a connection
    /// again.
    pub fn checkin(&self, connection: PoolConnection<C, O>) {
        let mut connection_data = self.protected_data.connection_data_lock();
        let tracked = connection_data
            .connections
            .existing(connection.address())
            .map(|pinning| pinning.set(&connection))
            .unwrap_or(false);

        if tracked {
            trace!(
                self.log,
                "Checked in connection {} to {}",
                connection.id(),
                connection.address()
            );
        } else {
            debug!(
                self.log,
                "Ignoring checkin of connection {} to {}: it was reclaimed, \
                 unpinned or reset while checked out",
                connection.id(),
                connection.address()
            );
        }

        drop(connection_data);
        self.protected_data.condvar_broadcast();
    }

    /// Unpin every connection pinned to `owner`, on every address, making
    /// them available to any other owner. The owner must not check those
    /// connections in afterwards; such checkins are ignored.
    pub fn unpin_connections(&self, owner: &O) {
        let mut connection_data = self.protected_data.connection_data_lock();
        let unpinned = connection_data.connections.unpin(owner);
        drop(connection_data);

        if unpinned > 0 {
            debug!(
                self.log,
                "Unpinned {} connections from {:?}", unpinned, owner
            );
            self.protected_data.condvar_broadcast();
        }
    }

    /// Whether the number of instantiated connections has reached `max_size`.
    pub fn saturated(&self) -> bool {
        let connection_data = self.protected_data.connection_data_lock();
        self.is_saturated(&connection_data)
    }

    /// Disconnect every connection the pool tracks and return it to its
    /// initial state. Connections still checked out are disconnected too;
    /// checking them in later has no effect.
    ///
    /// The pool is emptied first and the connections are disconnected after
    /// the pool lock is released, so an owner holding `lock()` on one of them
    /// can keep using the pool while `reset` waits for that connection.
    pub fn reset(&self) {
        let mut connection_data = self.protected_data.connection_data_lock();
        let drained = connection_data.connections.reset();
        connection_data.instantiated = ConnectionCount::from(0);
        drop(connection_data);
        self.protected_data.condvar_broadcast();

        for connection in drained.iter() {
            if let Err(err) = connection.disconnect() {
                warn!(
                    self.log,
                    "Failed to disconnect connection {} to {}: {}",
                    connection.id(),
                    connection.address(),
                    err
                );
            }
        }
        info!(
            self.log,
            "Reset pool, disconnected {} connections",
            drained.len()
        );
    }

    /// The number of connections created since the pool was built or last
    /// reset.
    pub fn instantiated(&self) -> ConnectionCount {
        self.protected_data.connection_data_lock().instantiated
    }

    pub fn max_size(&self) -> ConnectionCount {
        self.max_size
    }

    pub fn get_stats(&self) -> ConnectionPoolStats {
        let connection_data = self.protected_data.connection_data_lock();
        connection_data
            .connections
            .stats(connection_data.instantiated)
    }

    /// Whether two handles refer to the same pool.
    pub fn ptr_eq(&self, other: &ConnectionPool<C, O>) -> bool {
        self.protected_data.ptr_eq(&other.protected_data)
    }

    fn is_saturated(&self, connection_data: &ConnectionData<C, O>) -> bool {
        connection_data.instantiated >= self.max_size
    }

    // Reclaim the connections of owners that are no longer live, across all
    // addresses, not only the one being checked out.
    fn cleanup_connections(&self, connection_data: &mut ConnectionData<C, O>) {
        let reclaimed = connection_data
            .connections
            .cleanup(self.liveness.as_ref());
        if reclaimed > 0 {
            debug!(
                self.log,
                "Reclaimed {} connections from owners no longer live",
                reclaimed
            );
            self.protected_data.condvar_broadcast();
        }
    }

    fn create_connection(
        &self,
        connection_data: &mut ConnectionData<C, O>,
        owner: &O,
        address: &str,
    ) -> Result<PoolConnection<C, O>, Error> {
        let endpoint = connection_data.connections.get(address).address();
        let connection = (self.connector)(
            &*endpoint,
            self.connect_timeout,
            &*self.connection_options,
        )
        .map_err(|err| {
            warn!(
                self.log,
                "Failed to establish connection to {}: {}", address, err
            );
            Error::ConnectionFailure(Box::new(err))
        })?;

        let id = connection_data.next_connection_id();
        connection_data.instantiated += 1.into();
        let pooled = PoolConnection::new(id, address, connection);
        let checked_out =
            connection_data.connections.get(address).pin(pooled, owner);

        info!(
            self.log,
            "Created connection {} to {} for {:?} ({} of {})",
            id,
            address,
            owner,
            connection_data.instantiated,
            self.max_size
        );
        Ok(checked_out)
    }

    // Wait on the condition variable until a connection to `address` can be
    // handed to `owner`. Every wakeup re-checks from scratch: the broadcast
    // that woke us may have been for another address or another owner.
    fn wait_for_available<'a>(
        &'a self,
        mut connection_data: MutexGuard<'a, ConnectionData<C, O>>,
        owner: &O,
        address: &str,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<PoolConnection<C, O>, Error> {
        trace!(
            self.log,
            "Pool saturated, {:?} waiting for a connection to {}",
            owner,
            address
        );

        loop {
            let pinning = connection_data.connections.get(address);
            if let Some(connection) = pinning.get(owner) {
                return Ok(connection);
            }
            if let Some(connection) = pinning.steal_idle(owner) {
                debug!(
                    self.log,
                    "Re-pinned idle connection {} to {} for {:?}",
                    connection.id(),
                    address,
                    owner
                );
                return Ok(connection);
            }
            // A reset while we slept frees capacity.
            if !self.is_saturated(&connection_data) {
                return self.create_connection(
                    &mut connection_data,
                    owner,
                    address,
                );
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(
                            self.log,
                            "Timed out waiting for a connection to {} for {:?}",
                            address,
                            owner
                        );
                        return Err(Error::CapacityExceeded {
                            address: address.to_string(),
                            max_size: self.max_size,
                            waited: now - started,
                        });
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            connection_data = self
                .protected_data
                .condvar_wait(connection_data, remaining)
                .0;
        }
    }
}

/// A process-wide slot for a shared connection pool.
///
/// Most code should build a `ConnectionPool` and pass it (or clones of it)
/// to whatever needs it. Where one instance genuinely has to be reachable from
/// unrelated call sites, declare a `static` `GlobalPool`. The pool is built by
/// the first call to `global`; `terminate` empties the slot so the next call
/// builds a fresh pool, for example in a child process after a fork.
///
/// ```rust,ignore
/// static POOL: GlobalPool<StreamConnection, ThreadOwner> = GlobalPool::new();
///
/// let pool = POOL.global(ConnectionPoolOptions::default(), ThreadLiveness);
/// ```
pub struct GlobalPool<C, O>
where
    C: Connection,
    O: Owner,
{
    pool: Mutex<Option<ConnectionPool<C, O>>>,
}

impl<C, O> GlobalPool<C, O>
where
    C: Connection,
    O: Owner,
{
    pub const fn new() -> Self {
        GlobalPool {
            pool: Mutex::new(None),
        }
    }

    /// The shared pool, built from `cpo` and `liveness` if the slot is empty.
    /// Once built, later arguments are ignored.
    pub fn global<L>(
        &self,
        cpo: ConnectionPoolOptions,
        liveness: L,
    ) -> ConnectionPool<C, O>
    where
        L: OwnerLiveness<O> + 'static,
    {
        self.global_with(|| ConnectionPool::new(cpo, liveness))
    }

    /// The shared pool, built by `init` if the slot is empty.
    pub fn global_with<F>(&self, init: F) -> ConnectionPool<C, O>
    where
        F: FnOnce() -> ConnectionPool<C, O>,
    {
        self.pool_lock().get_or_insert_with(init).clone()
    }

    /// The shared pool, if it has been built.
    pub fn get(&self) -> Option<ConnectionPool<C, O>> {
        self.pool_lock().clone()
    }

    /// Empty the slot, returning the pool it held. The returned pool keeps
    /// working for anyone still holding a clone of it; call `reset` on it to
    /// disconnect its connections.
    pub fn terminate(&self) -> Option<ConnectionPool<C, O>> {
        self.pool_lock().take()
    }

    fn pool_lock(&self) -> MutexGuard<Option<ConnectionPool<C, O>>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C, O> Default for GlobalPool<C, O>
where
    C: Connection,
    O: Owner,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C, O> Debug for GlobalPool<C, O>
where
    C: Connection,
    O: Owner,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("GlobalPool")
            .field("pool", &*self.pool_lock())
            .finish()
    }
}

// The pin an owner holds on a connection. `lease` changes every time the
// connection is pinned or unpinned, so a handle can tell whether the pin it
// was issued under still holds.
#[derive(Debug)]
struct PinState<O> {
    owner: Option<O>,
    lease: u64,
}

struct SharedConnection<C, O> {
    id: ConnectionId,
    address: String,
    pin: Mutex<PinState<O>>,
    connection: Mutex<C>,
}

/// A connection managed by the pool.
///
/// Checking out the same address twice for the same owner, without a checkin
/// in between, gives two handles to the same connection (`is_same` returns
/// true). Handles are returned to the pool with `ConnectionPool::checkin`.
pub struct PoolConnection<C, O> {
    shared: Arc<SharedConnection<C, O>>,
    // The lease of the pin this handle was issued under.
    lease: u64,
}

impl<C, O> PoolConnection<C, O>
where
    C: Connection,
    O: Owner,
{
    pub(crate) fn new(id: ConnectionId, address: &str, connection: C) -> Self {
        PoolConnection {
            shared: Arc::new(SharedConnection {
                id,
                address: address.to_string(),
                pin: Mutex::new(PinState {
                    owner: None,
                    lease: 0,
                }),
                connection: Mutex::new(connection),
            }),
            lease: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// The address string the connection was checked out for.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// The owner the connection is currently pinned to.
    pub fn pinned_to(&self) -> Option<O> {
        self.pin_lock().owner.clone()
    }

    /// Exclusive access to the underlying connection.
    pub fn lock(&self) -> MutexGuard<C> {
        self.shared
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both handles refer to the same underlying connection.
    pub fn is_same(&self, other: &PoolConnection<C, O>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // A new handle under the current pin.
    pub(crate) fn share(&self) -> Self {
        PoolConnection {
            shared: Arc::clone(&self.shared),
            lease: self.pin_lock().lease,
        }
    }

    pub(crate) fn pin_to(&self, owner: O) {
        let mut pin = self.pin_lock();
        pin.owner = Some(owner);
        pin.lease += 1;
    }

    pub(crate) fn unpin(&self) {
        let mut pin = self.pin_lock();
        pin.owner = None;
        pin.lease += 1;
    }

    // The pinned owner, if the pin this handle was issued under still holds.
    pub(crate) fn leased_to(&self) -> Option<O> {
        let pin = self.pin_lock();
        if pin.lease == self.lease {
            pin.owner.clone()
        } else {
            None
        }
    }

    pub(crate) fn disconnect(&self) -> Result<(), C::Error> {
        self.lock().disconnect()
    }

    fn pin_lock(&self) -> MutexGuard<PinState<O>> {
        self.shared
            .pin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C, O> Debug for PoolConnection<C, O>
where
    O: Debug,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let pin = self
            .shared
            .pin
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("PoolConnection")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("pinned_to", &pin.owner)
            .field("lease", &self.lease)
            .finish()
    }
}
