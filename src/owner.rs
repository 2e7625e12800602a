// Copyright 2020 Joyent, Inc.

//! Owner tokens and owner liveness.
//!
//! The pool pins each connection to an *owner*: whatever unit of execution the
//! caller wants connections to stick to. The pool only compares and hashes
//! owner tokens. Whether an owner is still around is answered by an
//! [`OwnerLiveness`] implementation supplied when the pool is built; owners
//! that are no longer live have their connections reclaimed on the next
//! checkout.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

/// Marker for types usable as owner tokens.
pub trait Owner: Clone + fmt::Debug + Eq + Hash + Send + Sync + 'static {}

impl<T> Owner for T where T: Clone + fmt::Debug + Eq + Hash + Send + Sync + 'static
{}

/// Tells the pool whether an owner is still live.
///
/// This is consulted with the pool lock held, so implementations must not
/// call back into the pool.
pub trait OwnerLiveness<O>: Send + Sync {
    fn is_live(&self, owner: &O) -> bool;
}

impl<O, F> OwnerLiveness<O> for F
where
    F: Fn(&O) -> bool + Send + Sync,
{
    fn is_live(&self, owner: &O) -> bool {
        self(owner)
    }
}

/// Treats every owner as live, so pinned connections are only released by
/// `unpin_connections` or `reset`.
#[derive(Clone, Copy, Debug, Default)]
pub struct AssumeLive;

impl<O> OwnerLiveness<O> for AssumeLive {
    fn is_live(&self, _owner: &O) -> bool {
        true
    }
}

/// An explicit, shareable set of live owners. Clones share the same set.
#[derive(Debug)]
pub struct LiveOwners<O>(Arc<Mutex<HashSet<O>>>);

impl<O> LiveOwners<O>
where
    O: Owner,
{
    pub fn new() -> Self {
        LiveOwners(Arc::new(Mutex::new(HashSet::new())))
    }

    /// Add an owner to the live set. Returns false if it was already there.
    pub fn register(&self, owner: O) -> bool {
        self.owners_lock().insert(owner)
    }

    /// Remove an owner from the live set. Its connections are reclaimed by
    /// the next checkout.
    pub fn deregister(&self, owner: &O) -> bool {
        self.owners_lock().remove(owner)
    }

    pub fn len(&self) -> usize {
        self.owners_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners_lock().is_empty()
    }

    fn owners_lock(&self) -> MutexGuard<HashSet<O>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<O> Clone for LiveOwners<O> {
    fn clone(&self) -> LiveOwners<O> {
        LiveOwners(Arc::clone(&self.0))
    }
}

impl<O> Default for LiveOwners<O>
where
    O: Owner,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<O> OwnerLiveness<O> for LiveOwners<O>
where
    O: Owner,
{
    fn is_live(&self, owner: &O) -> bool {
        self.owners_lock().contains(owner)
    }
}

thread_local! {
    // Dropped when the thread exits, which is what ThreadOwner watches.
    static THREAD_SENTINEL: Arc<()> = Arc::new(());
}

/// An owner token for an OS thread.
///
/// Two tokens are equal when they were taken on the same thread. A token
/// stops being alive once its thread has exited.
#[derive(Clone)]
pub struct ThreadOwner {
    id: ThreadId,
    sentinel: Weak<()>,
}

impl ThreadOwner {
    /// The token for the calling thread.
    pub fn current() -> Self {
        THREAD_SENTINEL.with(|sentinel| ThreadOwner {
            id: thread::current().id(),
            sentinel: Arc::downgrade(sentinel),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.sentinel.upgrade().is_some()
    }
}

impl PartialEq for ThreadOwner {
    fn eq(&self, other: &ThreadOwner) -> bool {
        self.id == other.id
    }
}

impl Eq for ThreadOwner {}

impl Hash for ThreadOwner {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl fmt::Debug for ThreadOwner {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("ThreadOwner")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Liveness for `ThreadOwner` tokens: an owner is live while its thread runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadLiveness;

impl OwnerLiveness<ThreadOwner> for ThreadLiveness {
    fn is_live(&self, owner: &ThreadOwner) -> bool {
        owner.is_alive()
    }
}
