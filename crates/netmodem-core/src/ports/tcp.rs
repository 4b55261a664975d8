//! TCP networking over `std::net`
//!
//! Sockets are put in non-blocking mode once connected so the engine can
//! poll them from its single loop.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Accepted, Listener, Network, Socket};
use crate::connection::ConnFlags;
use crate::protocol::ModemError;

/// How long a dial may take before it counts as no answer
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected TCP stream
pub struct TcpSocket {
    stream: TcpStream,
    connected: bool,
}

impl TcpSocket {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            connected: true,
        })
    }

    fn drop_connection(&mut self, reason: &str) {
        if self.connected {
            debug!("tcp connection closed: {}", reason);
            self.connected = false;
        }
    }
}

impl Socket for TcpSocket {
    fn available(&mut self) -> usize {
        if !self.connected {
            return 0;
        }
        // peek() returns min(available, buffer size)
        let mut buf = [0u8; 8192];
        match self.stream.peek(&mut buf) {
            Ok(0) => {
                self.drop_connection("eof");
                0
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                self.drop_connection(&e.to_string());
                0
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        match self.stream.read(buf) {
            Ok(0) => {
                self.drop_connection("eof");
                0
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                self.drop_connection(&e.to_string());
                0
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> usize {
        if !self.connected {
            return 0;
        }
        let mut written = 0;
        while written < data.len() {
            match self.stream.write(&data[written..]) {
                Ok(0) => {
                    self.drop_connection("write returned 0");
                    break;
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    self.drop_connection(&e.to_string());
                    break;
                }
            }
        }
        written
    }

    fn is_connected(&mut self) -> bool {
        if self.connected {
            self.available();
        }
        self.connected
    }

    fn close(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("tcp shutdown: {}", e);
        }
        self.connected = false;
    }
}

/// A bound, non-blocking TCP listener
pub struct TcpPortListener {
    listener: TcpListener,
    port: u16,
}

impl Listener for TcpPortListener {
    fn port(&self) -> u16 {
        self.port
    }

    fn accept(&mut self) -> Option<Accepted> {
        match self.listener.accept() {
            Ok((stream, addr)) => match TcpSocket::new(stream) {
                Ok(socket) => Some(Accepted {
                    socket: Box::new(socket),
                    host: addr.ip().to_string(),
                    port: addr.port(),
                }),
                Err(e) => {
                    warn!("accept on port {}: {}", self.port, e);
                    None
                }
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                warn!("accept on port {}: {}", self.port, e);
                None
            }
        }
    }
}

/// [`Network`] over the host's TCP/IP stack
#[derive(Debug, Default)]
pub struct TcpNetwork;

impl TcpNetwork {
    pub fn new() -> Self {
        Self
    }
}

impl Network for TcpNetwork {
    fn connect(&mut self, host: &str, port: u16, flags: ConnFlags) -> Result<Box<dyn Socket>, ModemError> {
        if flags.secure {
            return Err(ModemError::ConnectionFailed("TLS is not supported".to_string()));
        }
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| ModemError::ConnectionFailed(format!("{}: {}", host, e)))?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    info!("connected to {}:{} ({})", host, port, addr);
                    return Ok(Box::new(TcpSocket::new(stream)?));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(ModemError::ConnectionFailed(match last_err {
            Some(e) => format!("{}:{}: {}", host, port, e),
            None => format!("{}: no addresses", host),
        }))
    }

    fn listen(&mut self, port: u16) -> Result<Box<dyn Listener>, ModemError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| ModemError::ListenFailed {
            port,
            reason: e.to_string(),
        })?;
        listener.set_nonblocking(true)?;
        info!("listening on port {}", port);
        Ok(Box::new(TcpPortListener { listener, port }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_roundtrip() {
        let mut net = TcpNetwork::new();
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let mut client = net.connect("127.0.0.1", port, ConnFlags::default()).unwrap();
        let (mut peer, _) = server.accept().unwrap();

        assert_eq!(client.write(b"ping"), 4);
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").unwrap();
        let mut got = Vec::new();
        for _ in 0..200 {
            let mut chunk = [0u8; 8];
            let n = client.read(&mut chunk);
            got.extend_from_slice(&chunk[..n]);
            if got.len() >= 4 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(got, b"pong");
    }

    #[test]
    fn test_secure_dial_rejected() {
        let mut net = TcpNetwork::new();
        let flags = ConnFlags {
            secure: true,
            ..Default::default()
        };
        assert!(net.connect("127.0.0.1", 1, flags).is_err());
    }
}
