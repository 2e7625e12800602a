// Copyright 2020 Joyent, Inc.

//! A pinball [`Connection`] that is a plain byte stream: a `TcpStream` for
//! `host:port` addresses or a `UnixStream` for socket paths.
//!
//! Host names are resolved through the address's memoized resolution, so a
//! pool reconnecting to the same `Address` only looks the host up once.
//!
//! The streams are plaintext; TLS is not supported.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use pinball::address::{Address, Endpoint, Node, NodeEvent};
use pinball::connection::{Connection, ConnectionOptions};
use slog::Level;

/// Connection option that turns on `TCP_NODELAY` when set to `"true"`.
pub const TCP_NODELAY_OPTION: &str = "tcp_nodelay";

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

#[derive(Debug)]
pub struct StreamConnection {
    stream: Option<Stream>,
    peer: String,
}

impl StreamConnection {
    /// What the stream is connected to: `ip:port` or a socket path.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&mut self) -> io::Result<&mut Stream> {
        self.stream.as_mut().ok_or_else(not_connected)
    }
}

// Keeps the reason the most recent resolution failed so it can be returned
// as the connect error.
#[derive(Default)]
struct ConnectNode {
    failure: RefCell<Option<String>>,
}

impl Node for ConnectNode {
    fn instrument(&self, _level: Level, event: NodeEvent) {
        *self.failure.borrow_mut() = Some(event.to_string());
    }

    fn down(&self) {}
}

fn connect_tcp(
    address: &Address,
    port: u16,
    timeout: Option<Duration>,
    options: &ConnectionOptions,
) -> io::Result<(Stream, String)> {
    let node = ConnectNode::default();
    let resolved = address.resolve(&node);
    let ip = match (resolved, address.ip()) {
        (Some(_), Some(ip)) => ip,
        _ => {
            let reason = node
                .failure
                .into_inner()
                .unwrap_or_else(|| format!("could not resolve {}", address));
            return Err(io::Error::new(io::ErrorKind::NotFound, reason));
        }
    };

    let addr = SocketAddr::new(ip, port);
    let stream = match timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
        None => TcpStream::connect(addr)?,
    };
    if options.get(TCP_NODELAY_OPTION).map(String::as_str) == Some("true") {
        stream.set_nodelay(true)?;
    }
    Ok((Stream::Tcp(stream), addr.to_string()))
}

impl Connection for StreamConnection {
    type Error = io::Error;

    fn connect(
        address: &Address,
        timeout: Option<Duration>,
        options: &ConnectionOptions,
    ) -> Result<Self, Self::Error> {
        let (stream, peer) = match address.endpoint() {
            Endpoint::Tcp { port, .. } => {
                connect_tcp(address, *port, timeout, options)?
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => (
                Stream::Unix(UnixStream::connect(path)?),
                path.display().to_string(),
            ),
            #[cfg(not(unix))]
            Endpoint::Unix(path) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "unix-domain sockets are unsupported: {}",
                        path.display()
                    ),
                ))
            }
        };

        Ok(StreamConnection {
            stream: Some(stream),
            peer,
        })
    }

    fn disconnect(&mut self) -> Result<(), Self::Error> {
        let result = match self.stream.take() {
            Some(Stream::Tcp(stream)) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Some(Stream::Unix(stream)) => stream.shutdown(Shutdown::Both),
            None => Ok(()),
        };
        // The peer may have gone away first.
        match result {
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl Read for StreamConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream()? {
            Stream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for StreamConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream()? {
            Stream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stream()? {
            Stream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.flush(),
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::TcpListener;
    use std::thread;

    fn options() -> ConnectionOptions {
        let mut options = ConnectionOptions::new();
        options.insert(TCP_NODELAY_OPTION.to_string(), "true".to_string());
        options
    }

    #[test]
    fn tcp_round_trip_and_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).expect("read");
            stream.write_all(&buf).expect("echo");
        });

        let address = Address::new(format!("127.0.0.1:{}", port));
        let mut conn = StreamConnection::connect(
            &address,
            Some(Duration::from_secs(5)),
            &options(),
        )
        .expect("connect");
        assert_eq!(conn.peer(), format!("127.0.0.1:{}", port));
        assert_eq!(address.resolved(), Some(conn.peer().to_string()));

        conn.write_all(b"ping").expect("write");
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"ping");
        server.join().expect("server thread panicked");

        conn.disconnect().expect("disconnect");
        assert!(!conn.is_connected());
        // A second disconnect is a no-op.
        conn.disconnect().expect("disconnect again");
        let err = conn.write(b"x").expect_err("write after disconnect");
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn refused_connection_is_an_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("local addr").port()
        };
        let address = Address::new(format!("127.0.0.1:{}", port));
        let result = StreamConnection::connect(
            &address,
            Some(Duration::from_secs(5)),
            &ConnectionOptions::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn unresolvable_host_reports_the_resolution_failure() {
        let address = Address::new("no-such-host.invalid:27017");
        let err =
            StreamConnection::connect(&address, None, &ConnectionOptions::new())
                .expect_err("lookup must fail");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("no-such-host.invalid"));
        assert!(address.resolution_failed());
    }

    #[cfg(unix)]
    #[test]
    fn unix_socket_connection() {
        use std::os::unix::net::UnixListener;

        let path = std::env::temp_dir()
            .join(format!("pinball-stream-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).expect("bind socket");

        let address = Address::new(path.display().to_string());
        assert!(address.is_unix());
        let mut conn =
            StreamConnection::connect(&address, None, &ConnectionOptions::new())
                .expect("connect");
        let (mut server, _) = listener.accept().expect("accept");

        conn.write_all(b"hi").expect("write");
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"hi");

        conn.disconnect().expect("disconnect");
        std::fs::remove_file(&path).expect("remove socket");
    }
}
