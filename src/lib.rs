// Copyright 2020 Joyent, Inc.

//! An owner-affine connection pool for database wire-protocol clients
//!
//! Pinball manages the connections a client holds open to one or more database
//! servers. Every connection the pool hands out is *pinned* to the owner that
//! checked it out, and the same owner gets the same connection back for as
//! long as the pin holds. Pinning matters for wire protocols where a
//! connection carries session state: an open cursor, a transaction, or the
//! result of an authentication exchange.
//!
//! ## Owners
//!
//! An *owner* is any value that identifies the unit of execution connections
//! should stick to. It could be a thread, a task, a request or a fiber of some
//! green threads library; the pool only compares and hashes owner tokens. The
//! [`owner`](owner/index.html) module provides
//! [`ThreadOwner`](owner/struct.ThreadOwner.html) for OS threads.
//!
//! Owners come and go, and the pool has to know when one is gone so that its
//! connections can be used by someone else. It asks an
//! [`OwnerLiveness`](owner/trait.OwnerLiveness.html) implementation supplied
//! when the pool is built. Every checkout first reclaims the connections of
//! owners that are no longer live, on every address.
//!
//! ## Connections
//!
//! A *connection* is whatever implements the
//! [`Connection`](connection/trait.Connection.html) trait: something that can
//! be established to an [`Address`](address/struct.Address.html) and later
//! disconnected. The pool never retries a failed connect; the error is handed
//! back to the caller wrapped in
//! [`Error::ConnectionFailure`](error/enum.Error.html).
//!
//! ## Capacity
//!
//! The pool holds at most `max_size` connections across all addresses. When
//! it is full a checkout waits until a connection to the requested address is
//! checked in, unpinned or reclaimed, and gives up with
//! [`Error::CapacityExceeded`](error/enum.Error.html) when its timeout
//! passes. A connection that another owner has checked in but not released
//! is re-pinned to a waiting owner rather than left idle.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Mutex;
//! use std::thread;
//!
//! use slog::{o, Drain, Logger};
//!
//! use pinball::connection_pool::types::ConnectionPoolOptions;
//! use pinball::connection_pool::ConnectionPool;
//! use pinball::owner::{ThreadLiveness, ThreadOwner};
//! use pinball_tcp_stream_connection::StreamConnection;
//!
//! fn main() {
//!     let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//!     let log = Logger::root(
//!         Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!         o!("build-id" => "0.1.0"),
//!     );
//!
//!     let pool_opts = ConnectionPoolOptions {
//!         max_size: Some(4),
//!         checkout_timeout: Some(1000),
//!         log: Some(log),
//!         ..Default::default()
//!     };
//!
//!     let pool = ConnectionPool::<StreamConnection, ThreadOwner>::new(
//!         pool_opts,
//!         ThreadLiveness,
//!     );
//!
//!     for _ in 0..8 {
//!         let pool = pool.clone();
//!         thread::spawn(move || {
//!             let owner = ThreadOwner::current();
//!             let conn = pool.checkout(&owner, "db1.example.com:27017")?;
//!             // Do stuff here
//!             pool.checkin(conn);
//!             // Once this thread exits its connection is reclaimed.
//!         });
//!     }
//! }
//! ```

#![allow(missing_docs)]

pub mod address;
pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod owner;
