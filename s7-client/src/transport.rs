//! Blocking TCP transport without any protocol knowledge.
use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use s7_protocol::error::{ErrorCode, S7Error};

/// Deadlines of one connection. A zero duration disables the deadline.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timeouts {
    pub connect: Duration,
    pub send: Duration,
    pub recv: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Duration::from_millis(3000),
            send: Duration::from_millis(500),
            recv: Duration::from_millis(1000),
        }
    }
}

fn deadline(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

/// Owns one TCP connection.
#[derive(Debug)]
pub struct TransportSocket {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TransportSocket {
    /// Connects with `TCP_NODELAY` and keepalive set. There is no retry.
    pub fn connect(host: &str, port: u16, timeouts: &Timeouts) -> Result<Self, S7Error> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|err| {
                log::debug!("Cannot resolve {}: {}", host, err);
                S7Error::Connection(ErrorCode::TCP_UNREACHABLE_HOST)
            })?
            .collect();
        let mut last_error = S7Error::Connection(ErrorCode::TCP_UNREACHABLE_HOST);
        for addr in addrs {
            match Self::connect_addr(addr, timeouts) {
                Ok(socket) => return Ok(socket),
                Err(err) => {
                    log::debug!("Connecting to {} failed: {}", addr, err);
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    fn connect_addr(addr: SocketAddr, timeouts: &Timeouts) -> Result<Self, S7Error> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|_| S7Error::Connection(ErrorCode::TCP_SOCKET_CREATION))?;
        let target = SockAddr::from(addr);
        let connected = match deadline(timeouts.connect) {
            Some(timeout) => socket.connect_timeout(&target, timeout),
            None => socket.connect(&target),
        };
        connected.map_err(|err| match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                S7Error::Timeout(ErrorCode::TCP_CONNECTION_TIMEOUT)
            }
            ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
                S7Error::Connection(ErrorCode::TCP_UNREACHABLE_HOST)
            }
            _ => S7Error::Connection(ErrorCode::TCP_CONNECTION_FAILED),
        })?;
        if let Err(err) = socket.set_keepalive(true) {
            log::warn!("Cannot enable keepalive for {}: {}", addr, err);
        }
        Self::from_stream(socket.into())
    }

    /// Wraps an accepted stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self, S7Error> {
        let peer = stream.peer_addr().map_err(S7Error::from_receive)?;
        stream
            .set_nodelay(true)
            .map_err(|_| S7Error::Connection(ErrorCode::TCP_SOCKET_CREATION))?;
        Ok(TransportSocket { stream, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn set_timeouts(&self, timeouts: &Timeouts) -> Result<(), S7Error> {
        self.stream
            .set_write_timeout(deadline(timeouts.send))
            .and_then(|_| self.stream.set_read_timeout(deadline(timeouts.recv)))
            .map_err(|_| S7Error::Client(ErrorCode::INVALID_PARAMS))
    }

    /// Writes all of `bytes`.
    pub fn send_exact(&mut self, bytes: &[u8]) -> Result<(), S7Error> {
        log::trace!("Sending {:02x?}", bytes);
        self.stream.write_all(bytes).map_err(S7Error::from_send)
    }

    /// Reads exactly `n` bytes. A closed peer is an error, never a short read.
    pub fn receive_exact(&mut self, n: usize) -> Result<Vec<u8>, S7Error> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).map_err(S7Error::from_receive)?;
        log::trace!("Received {:02x?}", buf);
        Ok(buf)
    }

    /// Waits up to `timeout` for incoming bytes without consuming them.
    ///
    /// Returns `false` when nothing arrived. A closed peer is an error.
    pub fn wait_readable(&mut self, timeout: Duration, restore: &Timeouts) -> Result<bool, S7Error> {
        let timeout = timeout.max(Duration::from_millis(1));
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|_| S7Error::Client(ErrorCode::INVALID_PARAMS))?;
        let mut probe = [0u8; 1];
        let result = match self.stream.peek(&mut probe) {
            Ok(0) => Err(S7Error::Connection(ErrorCode::TCP_CONNECTION_RESET)),
            Ok(_) => Ok(true),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(err) => Err(S7Error::from_receive(err)),
        };
        self.set_timeouts(restore)?;
        result
    }

    /// The underlying stream, for frame level I/O.
    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Drop for TransportSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    #[test]
    fn exact_send_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let echo = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });
        let mut socket = TransportSocket::connect("127.0.0.1", port, &Timeouts::default()).unwrap();
        socket.set_timeouts(&Timeouts::default()).unwrap();
        socket.send_exact(b"hello").unwrap();
        assert_eq!(socket.receive_exact(5).unwrap(), b"hello".to_vec());
        echo.join().unwrap();
        match socket.receive_exact(1) {
            Err(S7Error::Connection(code)) => assert_eq!(code, ErrorCode::TCP_CONNECTION_RESET),
            other => panic!("expected connection error, got {:?}", other),
        }
    }

    #[test]
    fn receive_timeout_is_distinct() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let timeouts = Timeouts {
            recv: Duration::from_millis(50),
            ..Timeouts::default()
        };
        let mut socket = TransportSocket::connect("127.0.0.1", port, &timeouts).unwrap();
        socket.set_timeouts(&timeouts).unwrap();
        let _peer = listener.accept().unwrap();
        match socket.receive_exact(1) {
            Err(S7Error::Timeout(code)) => assert_eq!(code, ErrorCode::TCP_RECEIVE_TIMEOUT),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn readiness_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut socket = TransportSocket::connect("127.0.0.1", port, &Timeouts::default()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        assert!(!socket
            .wait_readable(Duration::from_millis(20), &Timeouts::default())
            .unwrap());
        peer.write_all(&[7]).unwrap();
        assert!(socket
            .wait_readable(Duration::from_secs(2), &Timeouts::default())
            .unwrap());
        assert_eq!(socket.receive_exact(1).unwrap(), vec![7]);
        drop(peer);
        assert!(socket
            .wait_readable(Duration::from_secs(2), &Timeouts::default())
            .is_err());
    }

    #[test]
    fn refused_connection() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        match TransportSocket::connect("127.0.0.1", port, &Timeouts::default()) {
            Err(S7Error::Connection(_)) => {}
            other => panic!("expected connection error, got {:?}", other),
        }
    }
}
