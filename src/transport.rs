use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::error::{AdbError, Result};

pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// One TCP connection to a device. Lives for a single session.
pub struct Transport {
    stream: TcpStream,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer_addr", &self.stream.peer_addr().ok())
            .finish()
    }
}

impl Transport {
    /// Connects with a wall-clock deadline spanning name resolution and every
    /// candidate address.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let addrs = resolve(host, port)?;

        let mut last_err: Option<std::io::Error> = None;
        for addr in addrs {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return Err(AdbError::ConnectionTimeout),
            };
            log::debug!("connecting to {addr} (budget {remaining:?})");
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    log::debug!("connected to {addr}");
                    return Ok(Self { stream });
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(AdbError::ConnectionTimeout);
                }
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(AdbError::Io(e)),
            None => Err(AdbError::InvalidHost(host.to_string())),
        }
    }

    /// Completes only once the whole buffer is handed to the OS.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).map_err(map_eof)
    }

    /// Returns exactly `n` bytes or fails; there is no partial-read API.
    pub fn receive_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).map_err(map_eof)?;
        Ok(buf)
    }
}

fn map_eof(e: std::io::Error) -> AdbError {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            AdbError::ConnectionClosed
        }
        _ => AdbError::Io(e),
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(AdbError::InvalidHost(host.to_string()));
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| AdbError::InvalidHost(host.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(AdbError::InvalidHost(host.to_string()));
    }
    Ok(addrs)
}

/// Splits `host`, `host:port`, `[v6]:port` or a bare IPv6 address, defaulting
/// the port to 5555.
pub fn parse_endpoint(address: &str) -> Result<(String, u16)> {
    let address = address.trim();
    if address.is_empty() {
        return Err(AdbError::InvalidHost(address.to_string()));
    }
    let bad = || AdbError::InvalidHost(address.to_string());

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| bad())?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(bad()),
        };
        return Ok((host.to_string(), port));
    }

    match address.matches(':').count() {
        0 => Ok((address.to_string(), DEFAULT_PORT)),
        1 => {
            let (host, port) = address.split_once(':').ok_or_else(bad)?;
            if host.is_empty() {
                return Err(bad());
            }
            Ok((host.to_string(), port.parse().map_err(|_| bad())?))
        }
        // more than one colon and no brackets: a bare IPv6 address
        _ => Ok((address.to_string(), DEFAULT_PORT)),
    }
}
