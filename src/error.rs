// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use crate::connection_pool::types::ConnectionCount;

/// The errors returned by the connection pool.
///
/// A caller can tell a saturated pool apart from a transport failure by the
/// variant alone, so the two can be given different retry policies.
#[derive(Debug)]
pub enum Error {
    /// The pool was saturated and no connection for the requested address
    /// became available before the checkout deadline passed.
    CapacityExceeded {
        address: String,
        max_size: ConnectionCount,
        waited: Duration,
    },
    /// The connection could not be established. The inner error is the one
    /// returned by the `Connection` implementation, unmodified.
    ConnectionFailure(Box<dyn StdError + Send + Sync>),
}

impl Error {
    pub fn is_capacity_exceeded(&self) -> bool {
        match self {
            Error::CapacityExceeded { .. } => true,
            Error::ConnectionFailure(_) => false,
        }
    }

    pub fn is_connection_failure(&self) -> bool {
        !self.is_capacity_exceeded()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::CapacityExceeded {
                address,
                max_size,
                waited,
            } => write!(
                fmt,
                "connection pool saturated ({} connections): no connection \
                 for {} became available within {}ms",
                max_size,
                address,
                waited.as_millis()
            ),
            Error::ConnectionFailure(err) => {
                write!(fmt, "failed to establish connection: {}", err)
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::CapacityExceeded { .. } => None,
            Error::ConnectionFailure(err) => Some(err.as_ref()),
        }
    }
}
