// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::error;
use std::time::Duration;

use crate::address::Address;

/// Options handed through untouched to `Connection::connect`.
pub type ConnectionOptions = HashMap<String, String>;

/// Pinball connection
///
/// The `Connection` trait defines the interface that must be implemented in
/// order to participate in a pinball connection pool. The pool never reads or
/// writes through a connection; it only creates connections when it has spare
/// capacity and disconnects them when the pool is reset. Everything the pool
/// needs to know about the identity of a connection (its address and which
/// owner it is pinned to) is tracked by the pool itself.
pub trait Connection: Send + Sized + 'static {
    /// The error type returned by `connect` and `disconnect`. Errors returned
    /// from `connect` are surfaced to the caller of `checkout` unmodified,
    /// wrapped in [`Error::ConnectionFailure`](../error/enum.Error.html).
    type Error: error::Error + Send + Sync + 'static;

    /// Establish a connection to `address`. The address has not necessarily
    /// been resolved; for a unix-domain endpoint `address.unix()` is set,
    /// otherwise `address.host()` and `address.port()` are. `timeout` comes
    /// from the pool's `connect_timeout` option.
    fn connect(
        address: &Address,
        timeout: Option<Duration>,
        options: &ConnectionOptions,
    ) -> Result<Self, Self::Error>;

    /// Tear down the transport.
    fn disconnect(&mut self) -> Result<(), Self::Error>;
}
