use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, trace};

use super::{RecvResult, SendResult, Transport};

/// Largest single write handed to the kernel.
const SEND_CHUNK_SIZE: usize = 1024 * 1024;

/// Default bound on a blocking read.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Plain TCP transport.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    recv_timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_recv_timeout(DEFAULT_RECV_TIMEOUT)
    }

    pub fn with_recv_timeout(recv_timeout: Duration) -> Self {
        Self {
            stream: None,
            recv_timeout,
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, addr: &str) -> io::Result<()> {
        let mut last_err = None;
        for resolved in addr.to_socket_addrs()? {
            match connect_socket(resolved, self.recv_timeout) {
                Ok(stream) => {
                    debug!(addr = %resolved, "Connected");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    debug!(addr = %resolved, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing")
        }))
    }

    fn send(&self, data: &[u8]) -> SendResult {
        let Some(mut stream) = self.stream.as_ref() else {
            return SendResult::Closed;
        };

        let mut sent = 0;
        while sent < data.len() {
            let end = data.len().min(sent + SEND_CHUNK_SIZE);
            match stream.write(&data[sent..end]) {
                Ok(0) => return SendResult::Closed,
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return SendResult::BufferFull(sent);
                }
                Err(e) => {
                    debug!(error = %e, "Send failed");
                    return SendResult::Closed;
                }
            }
        }
        SendResult::All
    }

    fn recv(&self, buf: &mut [u8]) -> RecvResult {
        let Some(mut stream) = self.stream.as_ref() else {
            return RecvResult::Closed;
        };

        loop {
            match stream.read(buf) {
                Ok(0) => return RecvResult::Closed,
                Ok(n) => {
                    trace!(bytes = n, "Received");
                    return RecvResult::Data(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return RecvResult::NoData;
                }
                Err(e) => {
                    debug!(error = %e, "Receive failed");
                    return RecvResult::Closed;
                }
            }
        }
    }

    fn shutdown(&self) {
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Create a connected socket: dual-stack for IPv6, Nagle off, bounded reads.
fn connect_socket(addr: SocketAddr, recv_timeout: Duration) -> io::Result<TcpStream> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.connect(&addr.into())?;
    socket.set_nodelay(true)?;
    socket.set_read_timeout(Some(recv_timeout))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_unconnected_reports_closed() {
        let transport = TcpTransport::new();
        assert_eq!(transport.send(b"x"), SendResult::Closed);
        assert_eq!(transport.recv(&mut [0u8; 4]), RecvResult::Closed);
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut transport = TcpTransport::with_recv_timeout(Duration::from_millis(50));
        transport.connect(&addr).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        // nothing sent yet: the bounded read times out
        let mut buf = [0u8; 16];
        assert_eq!(transport.recv(&mut buf), RecvResult::NoData);

        assert_eq!(transport.send(b"ping"), SendResult::All);
        let mut got = [0u8; 4];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");

        peer.write_all(b"pong").unwrap();
        assert_eq!(transport.recv(&mut buf), RecvResult::Data(4));
        assert_eq!(&buf[..4], b"pong");

        drop(peer);
        assert_eq!(transport.recv(&mut buf), RecvResult::Closed);
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut transport = TcpTransport::new();
        assert!(transport.connect(&addr).is_err());
        assert_eq!(transport.send(b"x"), SendResult::Closed);
    }
}
