// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::sync::Arc;

use crate::address::Address;
use crate::connection::Connection;
use crate::connection_pool::types::{ConnectionCount, ConnectionPoolStats};
use crate::connection_pool::PoolConnection;
use crate::owner::{Owner, OwnerLiveness};

// One Pinning per address string, created the first time the address is asked
// for. The Pinning owns the Address, so its resolution is shared by every
// connection made to it.
#[derive(Debug)]
pub(crate) struct Connections<C, O> {
    pinnings: HashMap<String, Pinning<C, O>>,
}

impl<C, O> Connections<C, O>
where
    C: Connection,
    O: Owner,
{
    pub(crate) fn new() -> Self {
        Connections {
            pinnings: HashMap::new(),
        }
    }

    pub(crate) fn get(&mut self, address: &str) -> &mut Pinning<C, O> {
        self.pinnings
            .entry(address.to_string())
            .or_insert_with(|| Pinning::new(address))
    }

    pub(crate) fn existing(
        &mut self,
        address: &str,
    ) -> Option<&mut Pinning<C, O>> {
        self.pinnings.get_mut(address)
    }

    // Unpin every connection, on every address, whose owner is not live.
    // Returns the number of connections reclaimed.
    pub(crate) fn cleanup(
        &mut self,
        liveness: &dyn OwnerLiveness<O>,
    ) -> usize {
        self.pinnings
            .values_mut()
            .map(|pinning| pinning.cleanup(liveness))
            .sum()
    }

    pub(crate) fn unpin(&mut self, owner: &O) -> usize {
        self.pinnings
            .values_mut()
            .map(|pinning| pinning.unpin(owner))
            .filter(|unpinned| *unpinned)
            .count()
    }

    // Forget every connection, returning them unpinned. The caller
    // disconnects them once the pool lock is released.
    pub(crate) fn reset(&mut self) -> Vec<PoolConnection<C, O>> {
        let drained = self
            .pinnings
            .values_mut()
            .flat_map(|pinning| pinning.reset())
            .collect();
        self.pinnings.clear();
        drained
    }

    pub(crate) fn stats(&self, total: ConnectionCount) -> ConnectionPoolStats {
        let mut stats = ConnectionPoolStats::new();
        stats.total_connections = total;
        for pinning in self.pinnings.values() {
            stats.idle_connections += count(pinning.idle_count());
            stats.pinned_connections += count(pinning.pinned.len());
            stats.unpinned_connections += count(pinning.unpinned.len());
        }
        stats
    }
}

fn count(n: usize) -> ConnectionCount {
    ConnectionCount::from(n as u32)
}

#[derive(Debug)]
struct Pinned<C, O> {
    connection: PoolConnection<C, O>,
    checked_out: bool,
}

// The connections for a single address: at most one pinned to each owner,
// plus a stack of connections pinned to nobody. A connection is never in both.
#[derive(Debug)]
pub(crate) struct Pinning<C, O> {
    address: Arc<Address>,
    pinned: HashMap<O, Pinned<C, O>>,
    unpinned: Vec<PoolConnection<C, O>>,
}

impl<C, O> Pinning<C, O>
where
    C: Connection,
    O: Owner,
{
    fn new(address: &str) -> Self {
        Pinning {
            address: Arc::new(Address::new(address)),
            pinned: HashMap::new(),
            unpinned: Vec::new(),
        }
    }

    pub(crate) fn address(&self) -> Arc<Address> {
        Arc::clone(&self.address)
    }

    // The connection pinned to `owner`, else the most recently unpinned
    // connection, now pinned to `owner`.
    pub(crate) fn get(&mut self, owner: &O) -> Option<PoolConnection<C, O>> {
        if let Some(pinned) = self.pinned.get_mut(owner) {
            pinned.checked_out = true;
            return Some(pinned.connection.share());
        }
        self.next_unpinned(owner)
    }

    fn next_unpinned(&mut self, owner: &O) -> Option<PoolConnection<C, O>> {
        let connection = self.unpinned.pop()?;
        Some(self.pin(connection, owner))
    }

    // Track `connection` as pinned to `owner` and checked out. Returns the
    // handle for the caller.
    pub(crate) fn pin(
        &mut self,
        connection: PoolConnection<C, O>,
        owner: &O,
    ) -> PoolConnection<C, O> {
        connection.pin_to(owner.clone());
        let checked_out = connection.share();
        let pinned = Pinned {
            connection,
            checked_out: true,
        };
        if let Some(previous) = self.pinned.insert(owner.clone(), pinned) {
            previous.connection.unpin();
            self.unpinned.push(previous.connection);
        }
        checked_out
    }

    // Take a connection that is pinned to another owner but not checked out,
    // and pin it to `owner` instead.
    pub(crate) fn steal_idle(
        &mut self,
        owner: &O,
    ) -> Option<PoolConnection<C, O>> {
        let idle_owner = self
            .pinned
            .iter()
            .find(|&(other, pinned)| other != owner && !pinned.checked_out)
            .map(|(other, _)| other.clone())?;
        let pinned = self.pinned.remove(&idle_owner)?;
        Some(self.pin(pinned.connection, owner))
    }

    // Mark a checked in connection idle under the owner it is pinned to. A
    // handle whose pin has changed since it was handed out is not tracked.
    pub(crate) fn set(&mut self, connection: &PoolConnection<C, O>) -> bool {
        let owner = match connection.leased_to() {
            Some(owner) => owner,
            None => return false,
        };
        match self.pinned.get_mut(&owner) {
            Some(pinned) if pinned.connection.id() == connection.id() => {
                pinned.checked_out = false;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn unpin(&mut self, owner: &O) -> bool {
        match self.pinned.remove(owner) {
            Some(pinned) => {
                pinned.connection.unpin();
                self.unpinned.push(pinned.connection);
                true
            }
            None => false,
        }
    }

    pub(crate) fn cleanup(
        &mut self,
        liveness: &dyn OwnerLiveness<O>,
    ) -> usize {
        let abandoned: Vec<O> = self
            .pinned
            .keys()
            .filter(|owner| !liveness.is_live(owner))
            .cloned()
            .collect();
        let mut reclaimed = 0;
        for owner in abandoned.iter() {
            if self.unpin(owner) {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    // Unpinning bumps each lease, so outstanding handles become stale.
    fn reset(&mut self) -> Vec<PoolConnection<C, O>> {
        let connections: Vec<PoolConnection<C, O>> = self
            .pinned
            .drain()
            .map(|(_, pinned)| pinned.connection)
            .chain(self.unpinned.drain(..))
            .collect();
        for connection in connections.iter() {
            connection.unpin();
        }
        connections
    }

    fn idle_count(&self) -> usize {
        let idle_pinned =
            self.pinned.values().filter(|p| !p.checked_out).count();
        idle_pinned + self.unpinned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::time::Duration;

    use crate::address::Address;
    use crate::connection::ConnectionOptions;
    use crate::connection_pool::types::ConnectionId;

    #[derive(Debug)]
    struct NullConnection {
        disconnects: usize,
    }

    impl Connection for NullConnection {
        type Error = io::Error;

        fn connect(
            _address: &Address,
            _timeout: Option<Duration>,
            _options: &ConnectionOptions,
        ) -> Result<Self, io::Error> {
            Ok(NullConnection { disconnects: 0 })
        }

        fn disconnect(&mut self) -> Result<(), io::Error> {
            self.disconnects += 1;
            Ok(())
        }
    }

    fn connection(id: u64) -> PoolConnection<NullConnection, &'static str> {
        PoolConnection::new(
            ConnectionId::from(id),
            "db1:27017",
            NullConnection { disconnects: 0 },
        )
    }

    #[test]
    fn pinned_connection_is_returned_to_its_owner() {
        let mut pinning = Pinning::new("db1:27017");
        let first = pinning.pin(connection(1), &"a");
        assert_eq!(first.pinned_to(), Some("a"));

        let again = pinning.get(&"a").expect("pinned connection");
        assert!(again.is_same(&first));
        assert!(pinning.get(&"b").is_none());
    }

    #[test]
    fn unpinned_connections_are_reused_last_in_first_out() {
        let mut pinning = Pinning::new("db1:27017");
        let one = pinning.pin(connection(1), &"a");
        let two = pinning.pin(connection(2), &"b");
        assert!(pinning.unpin(&"a"));
        assert!(pinning.unpin(&"b"));
        assert!(!pinning.unpin(&"b"));
        assert_eq!(one.pinned_to(), None);

        let reused = pinning.get(&"c").expect("unpinned connection");
        assert!(reused.is_same(&two));
        assert_eq!(reused.pinned_to(), Some("c"));
        let reused = pinning.get(&"d").expect("unpinned connection");
        assert!(reused.is_same(&one));
        assert!(pinning.get(&"e").is_none());
    }

    #[test]
    fn checkin_marks_idle_and_idle_can_be_stolen() {
        let mut pinning = Pinning::new("db1:27017");
        let held = pinning.pin(connection(1), &"a");

        // Checked out connections are never taken from their owner.
        assert!(pinning.steal_idle(&"b").is_none());

        assert!(pinning.set(&held));
        assert_eq!(pinning.idle_count(), 1);
        let stolen = pinning.steal_idle(&"b").expect("idle connection");
        assert!(stolen.is_same(&held));
        assert_eq!(stolen.pinned_to(), Some("b"));

        // The old handle was issued under a pin that no longer exists.
        assert!(!pinning.set(&held));
        assert!(pinning.get(&"a").is_none());
        assert_eq!(pinning.idle_count(), 0);
    }

    #[test]
    fn cleanup_reclaims_only_dead_owners() {
        let mut pinning = Pinning::new("db1:27017");
        let alive = pinning.pin(connection(1), &"alive");
        let dead = pinning.pin(connection(2), &"dead");

        let liveness = |owner: &&'static str| *owner == "alive";
        assert_eq!(pinning.cleanup(&liveness), 1);
        assert_eq!(alive.pinned_to(), Some("alive"));
        assert_eq!(dead.pinned_to(), None);
        assert_eq!(pinning.unpinned.len(), 1);
        assert_eq!(pinning.cleanup(&liveness), 0);
    }

    #[test]
    fn reset_drains_without_disconnecting() {
        let mut connections: Connections<NullConnection, &'static str> =
            Connections::new();
        let a = connections.get("db1").pin(connection(1), &"a");
        let b = connections.get("db2").pin(connection(2), &"b");
        connections.get("db2").unpin(&"b");

        let drained = connections.reset();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().any(|c| c.is_same(&a)));
        assert!(drained.iter().any(|c| c.is_same(&b)));
        assert_eq!(a.pinned_to(), None);
        assert_eq!(a.lock().disconnects, 0);
        assert!(connections.existing("db1").is_none());
        assert!(connections.reset().is_empty());
    }

    #[test]
    fn one_address_per_pinning() {
        let mut connections: Connections<NullConnection, &'static str> =
            Connections::new();
        let first = connections.get("db1:27018").address();
        let again = connections.get("db1:27018").address();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.port(), Some(27018));

        let other = connections.get("db2:27018").address();
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
