//! Helpers shared by the integration tests.
use std::{
    net::{IpAddr, Ipv4Addr, TcpListener},
    time::Duration,
};

use s7_client::client::{Client, ClientConfig};
use s7_server::server::{Builder, Server};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// A port nothing listens on (at least right after the call).
pub fn free_port() -> u16 {
    TcpListener::bind((LOCALHOST, 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(0)
}

/// Builder with a short polling interval, so tests start and stop quickly.
pub fn builder() -> Builder {
    Builder::new().work_interval(Duration::from_millis(10))
}

/// Starts `server` on a free localhost port.
pub fn start(server: Server) -> Server {
    server
        .start_to(LOCALHOST, 0)
        .unwrap_or_else(|err| panic!("server did not start: {}", err));
    server
}

/// A client connected to `server`.
pub fn connect(server: &Server) -> Client {
    let port = server
        .local_addr()
        .map(|addr| addr.port())
        .unwrap_or_else(|| panic!("server is not running"));
    let mut client = Client::with_config(ClientConfig {
        port,
        ..ClientConfig::default()
    });
    client
        .connect_to("127.0.0.1", 0, 2)
        .unwrap_or_else(|err| panic!("client did not connect: {}", err));
    client
}
