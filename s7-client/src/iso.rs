//! ISO-on-TCP connection: the COTP handshake and PDU exchange over TPKT frames.
use std::{net::TcpStream, time::Duration};

use s7_protocol::{
    error::{ErrorCode, S7Error},
    frame::{ConnectionParams, Frame, MAX_FRAME_LEN},
};

use crate::transport::{Timeouts, TransportSocket};

/// Endpoint parameters for the COTP handshake.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IsoParams {
    pub local_tsap: u16,
    pub remote_tsap: u16,
    /// Source reference announced in the connection request.
    pub src_ref: u16,
    /// PDU size used to pick the TPDU size parameter.
    pub pdu_size: u16,
    pub timeouts: Timeouts,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IsoState {
    Disconnected,
    TcpConnected,
    IsoConnected,
}

#[derive(Debug)]
pub struct IsoConnection {
    socket: Option<TransportSocket>,
    state: IsoState,
    src_ref: u16,
    dst_ref: u16,
}

impl Default for IsoConnection {
    fn default() -> Self {
        IsoConnection::new()
    }
}

impl IsoConnection {
    pub fn new() -> Self {
        IsoConnection {
            socket: None,
            state: IsoState::Disconnected,
            src_ref: 0,
            dst_ref: 0,
        }
    }

    pub fn state(&self) -> IsoState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == IsoState::IsoConnected
    }

    /// Connects to `host:port` and performs the COTP CR/CC handshake.
    ///
    /// On failure the socket is closed and the connection stays [IsoState::Disconnected].
    pub fn connect(&mut self, host: &str, port: u16, params: &IsoParams) -> Result<(), S7Error> {
        self.disconnect();
        let socket = TransportSocket::connect(host, port, &params.timeouts)?;
        socket.set_timeouts(&params.timeouts)?;
        self.socket = Some(socket);
        self.state = IsoState::TcpConnected;
        log::debug!("TCP connection to {}:{} established", host, port);

        let request = ConnectionParams::request(
            params.src_ref,
            params.local_tsap,
            params.remote_tsap,
            params.pdu_size,
        );
        let result = self
            .send_frame(&Frame::ConnectionRequest(request))
            .and_then(|_| self.receive_frame());
        match result {
            Ok(Frame::ConnectionConfirm(confirm)) => {
                self.src_ref = params.src_ref;
                self.dst_ref = confirm.src_ref;
                self.state = IsoState::IsoConnected;
                log::debug!(
                    "ISO connection established, remote reference {:#06x}",
                    confirm.src_ref
                );
                Ok(())
            }
            Ok(other) => {
                self.teardown();
                Err(S7Error::protocol(
                    ErrorCode::ISO_CONNECT,
                    format!("expected connection confirm, got {:?}", other),
                ))
            }
            Err(err) => {
                self.teardown();
                Err(match err {
                    S7Error::Protocol { .. } => {
                        S7Error::protocol(ErrorCode::ISO_CONNECT, err.to_string())
                    }
                    other => other,
                })
            }
        }
    }

    /// Serves the responder side of the handshake on an accepted stream.
    ///
    /// When `local_tsap` is given, requests for another TSAP are refused.
    pub fn accept(
        stream: TcpStream,
        local_tsap: Option<u16>,
        src_ref: u16,
        timeouts: &Timeouts,
    ) -> Result<IsoConnection, S7Error> {
        let socket = TransportSocket::from_stream(stream)?;
        socket.set_timeouts(timeouts)?;
        let mut conn = IsoConnection {
            socket: Some(socket),
            state: IsoState::TcpConnected,
            src_ref,
            dst_ref: 0,
        };
        let request = match conn.receive_frame()? {
            Frame::ConnectionRequest(request) => request,
            other => {
                conn.teardown();
                return Err(S7Error::protocol(
                    ErrorCode::ISO_CONNECT,
                    format!("expected connection request, got {:?}", other),
                ));
            }
        };
        if let (Some(expected), Some(called)) = (local_tsap, request.called_tsap)
            && expected != called
        {
            conn.teardown();
            return Err(S7Error::protocol(
                ErrorCode::ISO_INVALID_PARAMS,
                format!("connection request for TSAP {:#06x}", called),
            ));
        }
        conn.send_frame(&Frame::ConnectionConfirm(request.confirm(src_ref)))?;
        conn.dst_ref = request.src_ref;
        conn.state = IsoState::IsoConnected;
        Ok(conn)
    }

    fn socket(&mut self) -> Result<&mut TransportSocket, S7Error> {
        self.socket.as_mut().ok_or_else(S7Error::not_connected)
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<(), S7Error> {
        frame.write_to(self.socket()?.stream())
    }

    fn receive_frame(&mut self) -> Result<Frame, S7Error> {
        Frame::from_reader(self.socket()?.stream(), MAX_FRAME_LEN)
    }

    pub fn set_timeouts(&self, timeouts: &Timeouts) -> Result<(), S7Error> {
        match &self.socket {
            Some(socket) => socket.set_timeouts(timeouts),
            None => Ok(()),
        }
    }

    /// Waits up to `timeout` for the next PDU to start arriving. A peer that closed
    /// the connection tears it down.
    pub fn wait_data(&mut self, timeout: Duration, timeouts: &Timeouts) -> Result<bool, S7Error> {
        if !self.is_connected() {
            return Err(S7Error::not_connected());
        }
        let result = self.socket()?.wait_readable(timeout, timeouts);
        if result.is_err() {
            self.teardown();
        }
        result
    }

    /// Sends one PDU inside a single data TPDU.
    pub fn send_data(&mut self, payload: &[u8]) -> Result<(), S7Error> {
        if !self.is_connected() {
            return Err(S7Error::not_connected());
        }
        log::trace!("Sending PDU {:02x?}", payload);
        let result = self.send_frame(&Frame::Data(payload.to_vec()));
        if result.is_err() {
            self.teardown();
        }
        result
    }

    /// Receives the next PDU.
    pub fn receive_data(&mut self) -> Result<Vec<u8>, S7Error> {
        if !self.is_connected() {
            return Err(S7Error::not_connected());
        }
        let result = match self.receive_frame() {
            Ok(Frame::Data(payload)) => Ok(payload),
            Ok(Frame::DisconnectRequest { reason, .. }) => {
                log::debug!("Peer disconnected, reason {:#04x}", reason);
                Err(S7Error::Connection(ErrorCode::ISO_DISCONNECT))
            }
            Ok(other) => Err(S7Error::invalid_pdu(format!(
                "expected data, got {:?}",
                other
            ))),
            Err(err) => Err(err),
        };
        match &result {
            Ok(payload) => log::trace!("Received PDU {:02x?}", payload),
            Err(_) => self.teardown(),
        }
        result
    }

    /// Sends a request PDU and waits for the answer.
    pub fn exchange(&mut self, payload: &[u8]) -> Result<Vec<u8>, S7Error> {
        self.send_data(payload)?;
        self.receive_data()
    }

    fn teardown(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.state = IsoState::Disconnected;
    }

    /// Best effort disconnect request, then close. Idempotent.
    pub fn disconnect(&mut self) {
        if self.is_connected() {
            let request = Frame::DisconnectRequest {
                dst_ref: self.dst_ref,
                src_ref: self.src_ref,
                reason: 0x00,
            };
            if let Err(err) = self.send_frame(&request) {
                log::debug!("Disconnect request not delivered: {}", err);
            }
        }
        self.teardown();
    }
}

impl Drop for IsoConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    fn params() -> IsoParams {
        IsoParams {
            local_tsap: 0x0100,
            remote_tsap: 0x0102,
            src_ref: 0x0001,
            pdu_size: 480,
            timeouts: Timeouts::default(),
        }
    }

    #[test]
    fn handshake_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut conn =
                IsoConnection::accept(stream, Some(0x0102), 0x0042, &Timeouts::default()).unwrap();
            let request = conn.receive_data().unwrap();
            conn.send_data(&request.iter().rev().copied().collect::<Vec<_>>())
                .unwrap();
        });

        let mut conn = IsoConnection::new();
        conn.connect("127.0.0.1", port, &params()).unwrap();
        assert_eq!(conn.state(), IsoState::IsoConnected);
        assert_eq!(conn.exchange(&[1, 2, 3]).unwrap(), vec![3, 2, 1]);
        peer.join().unwrap();

        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.state(), IsoState::Disconnected);
        assert!(conn.send_data(&[1]).is_err());
    }

    #[test]
    fn wrong_tsap_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            IsoConnection::accept(stream, Some(0x0200), 1, &Timeouts::default()).is_err()
        });
        let mut conn = IsoConnection::new();
        assert!(conn.connect("127.0.0.1", port, &params()).is_err());
        assert_eq!(conn.state(), IsoState::Disconnected);
        assert!(peer.join().unwrap());
    }

    #[test]
    fn handshake_failures_keep_their_kind() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
            let (mut stream, _) = listener.accept().unwrap();
            Frame::from_reader(&mut stream, MAX_FRAME_LEN).unwrap();
            Frame::Data(vec![0x32]).write_to(&mut stream).unwrap();
        });

        let mut conn = IsoConnection::new();
        match conn.connect("127.0.0.1", port, &params()) {
            Err(S7Error::Connection(_)) => {}
            other => panic!("expected connection error, got {:?}", other),
        }
        assert_eq!(conn.state(), IsoState::Disconnected);

        match conn.connect("127.0.0.1", port, &params()) {
            Err(S7Error::Protocol { code, .. }) => assert_eq!(code, ErrorCode::ISO_CONNECT),
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert_eq!(conn.state(), IsoState::Disconnected);
        peer.join().unwrap();
    }
}
