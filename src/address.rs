// Copyright 2020 Joyent, Inc.

//! Connection endpoints and their lazy resolution.
//!
//! An [`Address`] is built once from the string a user supplied, either a
//! `host:port` pair or the path of a unix-domain socket. Resolving it turns the
//! host into a numeric IPv4 address. A successful resolution is remembered for
//! the lifetime of the `Address`; a failed one is reported to the owning
//! [`Node`] and is attempted again on the next call.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use slog::Level;

/// The port used when an address does not name one.
pub const DEFAULT_PORT: u16 = 27017;

/// The `ip` recorded for unix-domain endpoints.
pub const UNIX_LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// The two kinds of endpoint an `Address` can describe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

/// Something that happened while resolving an address that the node owning
/// the address should know about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeEvent {
    ResolutionFailed { address: String, reason: String },
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeEvent::ResolutionFailed { address, reason } => write!(
                fmt,
                "could not resolve IP for {}: {}",
                address, reason
            ),
        }
    }
}

/// The node an address belongs to. Health tracking lives with the node; the
/// address only tells it when resolution fails.
pub trait Node {
    /// Record an event at the given level.
    fn instrument(&self, level: Level, event: NodeEvent);
    /// Mark the node unreachable.
    fn down(&self);
}

/// Looks up the IPv4 address of a host name.
pub trait HostLookup {
    fn lookup(&self, host: &str) -> io::Result<IpAddr>;
}

impl<F> HostLookup for F
where
    F: Fn(&str) -> io::Result<IpAddr>,
{
    fn lookup(&self, host: &str) -> io::Result<IpAddr> {
        self(host)
    }
}

/// Host lookup through the system resolver (`getaddrinfo`), keeping only
/// IPv4 results.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLookup;

impl HostLookup for SystemLookup {
    fn lookup(&self, host: &str) -> io::Result<IpAddr> {
        (host, 0)
            .to_socket_addrs()?
            .find(|addr| addr.is_ipv4())
            .map(|addr| addr.ip())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no IPv4 address found for {}", host),
                )
            })
    }
}

#[derive(Clone, Debug)]
enum Resolution {
    Unresolved,
    Resolved { ip: IpAddr, resolved: String },
    // The last attempt failed. Nothing is cached, the next call looks up
    // again.
    Failed,
}

/// A connection endpoint, either `host:port` or a unix-domain socket path.
#[derive(Debug)]
pub struct Address {
    original: String,
    endpoint: Endpoint,
    resolution: Mutex<Resolution>,
}

impl Address {
    /// Parse an address string. Strings naming an existing socket file or
    /// starting with `/` are unix-domain endpoints. Anything else is split on
    /// its last `:`; a missing or unparsable port becomes `DEFAULT_PORT`.
    pub fn new<S: Into<String>>(address: S) -> Self {
        let original = address.into();
        let endpoint = if original.starts_with('/') || is_socket(&original) {
            Endpoint::Unix(PathBuf::from(&original))
        } else {
            let (host, port) = match original.rsplit_once(':') {
                Some((host, port)) => {
                    (host, port.parse::<u16>().unwrap_or(DEFAULT_PORT))
                }
                None => (original.as_str(), DEFAULT_PORT),
            };
            Endpoint::Tcp {
                host: host.to_string(),
                port,
            }
        };

        Address {
            original,
            endpoint,
            resolution: Mutex::new(Resolution::Unresolved),
        }
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_unix(&self) -> bool {
        self.unix().is_some()
    }

    pub fn host(&self) -> Option<&str> {
        match &self.endpoint {
            Endpoint::Tcp { host, .. } => Some(host),
            Endpoint::Unix(_) => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match &self.endpoint {
            Endpoint::Tcp { port, .. } => Some(*port),
            Endpoint::Unix(_) => None,
        }
    }

    pub fn unix(&self) -> Option<&Path> {
        match &self.endpoint {
            Endpoint::Unix(path) => Some(path),
            Endpoint::Tcp { .. } => None,
        }
    }

    /// The resolved IP, if resolution has succeeded.
    pub fn ip(&self) -> Option<IpAddr> {
        match &*self.resolution_lock() {
            Resolution::Resolved { ip, .. } => Some(*ip),
            _ => None,
        }
    }

    /// The resolved `ip:port` (or socket path), if resolution has succeeded.
    pub fn resolved(&self) -> Option<String> {
        match &*self.resolution_lock() {
            Resolution::Resolved { resolved, .. } => Some(resolved.clone()),
            _ => None,
        }
    }

    /// Whether the most recent resolution attempt failed.
    pub fn resolution_failed(&self) -> bool {
        matches!(&*self.resolution_lock(), Resolution::Failed)
    }

    /// Resolve the address using the system resolver. See `resolve_with`.
    pub fn resolve<N>(&self, node: &N) -> Option<String>
    where
        N: Node + ?Sized,
    {
        self.resolve_with(node, &SystemLookup)
    }

    /// Resolve the address, looking the host up through `lookup`.
    ///
    /// Returns the resolved form, or `None` if the host could not be looked
    /// up. In that case `node` receives a warning event and is marked down.
    /// Once resolution succeeds the result is returned from then on without
    /// another lookup. Concurrent callers wait for an in-flight lookup rather
    /// than starting their own.
    pub fn resolve_with<N, L>(&self, node: &N, lookup: &L) -> Option<String>
    where
        N: Node + ?Sized,
        L: HostLookup + ?Sized,
    {
        let mut resolution = self.resolution_lock();
        if let Resolution::Resolved { resolved, .. } = &*resolution {
            return Some(resolved.clone());
        }

        let outcome = match &self.endpoint {
            Endpoint::Unix(path) => {
                Ok((UNIX_LOOPBACK, path.display().to_string()))
            }
            Endpoint::Tcp { host, port } => lookup
                .lookup(host)
                .map(|ip| (ip, format!("{}:{}", ip, port))),
        };

        match outcome {
            Ok((ip, resolved)) => {
                *resolution = Resolution::Resolved {
                    ip,
                    resolved: resolved.clone(),
                };
                Some(resolved)
            }
            Err(err) => {
                *resolution = Resolution::Failed;
                // The node may look at this address while handling the event.
                drop(resolution);
                node.instrument(
                    Level::Warning,
                    NodeEvent::ResolutionFailed {
                        address: self.original.clone(),
                        reason: err.to_string(),
                    },
                );
                node.down();
                None
            }
        }
    }

    fn resolution_lock(&self) -> MutexGuard<Resolution> {
        self.resolution
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self.resolved() {
            Some(resolved) => fmt::Display::fmt(&resolved, fmt),
            None => fmt::Display::fmt(&self.original, fmt),
        }
    }
}

#[cfg(unix)]
fn is_socket(path: &str) -> bool {
    use std::os::unix::fs::FileTypeExt;

    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_socket(_path: &str) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::{Cell, RefCell};

    use quickcheck::{quickcheck, Arbitrary, Gen};

    #[derive(Default)]
    struct RecordingNode {
        events: RefCell<Vec<(Level, NodeEvent)>>,
        downs: Cell<usize>,
    }

    impl Node for RecordingNode {
        fn instrument(&self, level: Level, event: NodeEvent) {
            self.events.borrow_mut().push((level, event));
        }

        fn down(&self) {
            self.downs.set(self.downs.get() + 1);
        }
    }

    struct CountingLookup {
        calls: Cell<usize>,
        answer: Option<IpAddr>,
    }

    impl CountingLookup {
        fn answering(ip: Ipv4Addr) -> Self {
            CountingLookup {
                calls: Cell::new(0),
                answer: Some(IpAddr::V4(ip)),
            }
        }

        fn failing() -> Self {
            CountingLookup {
                calls: Cell::new(0),
                answer: None,
            }
        }
    }

    impl HostLookup for CountingLookup {
        fn lookup(&self, host: &str) -> io::Result<IpAddr> {
            self.calls.set(self.calls.get() + 1);
            self.answer.ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, host.to_string())
            })
        }
    }

    #[derive(Clone, Debug)]
    struct HostName(String);

    impl Arbitrary for HostName {
        fn arbitrary(g: &mut Gen) -> Self {
            const CHARS: &[char] = &[
                'a', 'b', 'c', 'd', 'm', 'o', 'x', 'z', '0', '1', '7', '9',
                '-', '.',
            ];
            let len = usize::arbitrary(g) % 24 + 1;
            let mut name: String =
                (0..len).filter_map(|_| g.choose(CHARS)).collect();
            // Host names never start with a separator or a slash.
            name.insert(0, 'h');
            HostName(name)
        }
    }

    quickcheck! {
        fn prop_host_port_strings_parse_as_tcp(
            host: HostName,
            port: u16
        ) -> bool
        {
            let address = Address::new(format!("{}:{}", host.0, port));
            !address.is_unix()
                && address.host() == Some(host.0.as_str())
                && address.port() == Some(port)
                && address.resolved().is_none()
                && address.ip().is_none()
        }
    }

    quickcheck! {
        fn prop_leading_slash_strings_are_unix(path: HostName) -> bool {
            let raw = format!("/{}", path.0);
            let address = Address::new(raw.clone());
            address.is_unix()
                && address.unix() == Some(Path::new(&raw))
                && address.host().is_none()
                && address.port().is_none()
        }
    }

    #[test]
    fn missing_or_bad_port_defaults() {
        let address = Address::new("localhost");
        assert_eq!(address.host(), Some("localhost"));
        assert_eq!(address.port(), Some(DEFAULT_PORT));

        let address = Address::new("localhost:notaport");
        assert_eq!(address.host(), Some("localhost"));
        assert_eq!(address.port(), Some(DEFAULT_PORT));

        let address = Address::new("localhost:");
        assert_eq!(address.port(), Some(DEFAULT_PORT));

        // Only the last colon separates the port.
        let address = Address::new("a:b:27018");
        assert_eq!(address.host(), Some("a:b"));
        assert_eq!(address.port(), Some(27018));
    }

    #[test]
    fn display_prefers_resolved_form() {
        let node = RecordingNode::default();
        let lookup = CountingLookup::answering(Ipv4Addr::new(10, 0, 0, 7));
        let address = Address::new("db1.example.com:27019");

        assert_eq!(address.to_string(), "db1.example.com:27019");
        assert_eq!(
            address.resolve_with(&node, &lookup),
            Some(String::from("10.0.0.7:27019"))
        );
        assert_eq!(address.to_string(), "10.0.0.7:27019");
        assert_eq!(address.original(), "db1.example.com:27019");
    }

    #[test]
    fn successful_resolution_is_memoized() {
        let node = RecordingNode::default();
        let lookup = CountingLookup::answering(Ipv4Addr::new(192, 168, 1, 20));
        let address = Address::new("db2:27017");

        let first = address.resolve_with(&node, &lookup);
        let second = address.resolve_with(&node, &lookup);

        assert_eq!(first, Some(String::from("192.168.1.20:27017")));
        assert_eq!(first, second);
        assert_eq!(lookup.calls.get(), 1);
        assert_eq!(address.ip(), Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))));
        assert!(node.events.borrow().is_empty());
        assert_eq!(node.downs.get(), 0);
    }

    #[test]
    fn unix_addresses_resolve_without_lookup() {
        let node = RecordingNode::default();
        let lookup = CountingLookup::failing();
        let address = Address::new("/tmp/mongodb-27017.sock");

        assert!(address.is_unix());
        assert_eq!(
            address.resolve_with(&node, &lookup),
            Some(String::from("/tmp/mongodb-27017.sock"))
        );
        assert_eq!(address.ip(), Some(UNIX_LOOPBACK));
        assert_eq!(lookup.calls.get(), 0);
        assert_eq!(node.downs.get(), 0);
    }

    #[test]
    fn failed_resolution_notifies_node_and_is_retried() {
        let node = RecordingNode::default();
        let lookup = CountingLookup::failing();
        let address = Address::new("nowhere.invalid:27017");

        assert_eq!(address.resolve_with(&node, &lookup), None);
        assert!(address.resolution_failed());
        assert!(address.resolved().is_none());
        assert_eq!(address.to_string(), "nowhere.invalid:27017");
        assert_eq!(node.downs.get(), 1);
        {
            let events = node.events.borrow();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].0, Level::Warning);
            match &events[0].1 {
                NodeEvent::ResolutionFailed { address, .. } => {
                    assert_eq!(address, "nowhere.invalid:27017")
                }
            }
        }

        // No negative caching: the next call performs exactly one more lookup.
        assert_eq!(address.resolve_with(&node, &lookup), None);
        assert_eq!(lookup.calls.get(), 2);
        assert_eq!(node.downs.get(), 2);
    }

    #[test]
    fn system_lookup_resolves_numeric_hosts() {
        let node = RecordingNode::default();
        let address = Address::new("127.0.0.1:27020");
        assert_eq!(
            address.resolve(&node),
            Some(String::from("127.0.0.1:27020"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn socket_files_are_unix_without_leading_slash() {
        use std::os::unix::net::UnixListener;

        let relative = format!("pinball-address-{}.sock", std::process::id());
        let _ = std::fs::remove_file(&relative);
        let listener = UnixListener::bind(&relative).expect("bind socket");

        let address = Address::new(relative.clone());
        assert!(address.is_unix());
        assert_eq!(address.unix(), Some(Path::new(&relative)));

        drop(listener);
        let _ = std::fs::remove_file(&relative);
    }
}
