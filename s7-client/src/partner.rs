//! Peer to peer data exchange between two stations.
//!
//! An active partner connects out, a passive partner listens for its peer. Both sides
//! run the same stop-and-wait exchange: every data PDU is answered by an
//! acknowledgement before the next one is sent. Sends and receives on one partner
//! share its link and run one at a time.
use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use s7_protocol::{
    error::{ErrorCode, S7Error},
    pdu,
    types::ISO_TCP_PORT,
};

use crate::{
    iso::{IsoConnection, IsoParams},
    job::{Completion, Job, destroying},
    transport::Timeouts,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartnerConfig {
    pub local_address: IpAddr,
    /// Peer to connect to (active) or to accept exclusively (passive, unless unspecified).
    pub remote_address: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub local_tsap: u16,
    pub remote_tsap: u16,
    pub src_ref: u16,
    pub dst_ref: u16,
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
    /// Connect timeout of an active partner.
    pub ping_timeout: Duration,
}

impl Default for PartnerConfig {
    fn default() -> Self {
        PartnerConfig {
            local_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_address: "127.0.0.1".to_string(),
            local_port: ISO_TCP_PORT,
            remote_port: ISO_TCP_PORT,
            local_tsap: 0x0100,
            remote_tsap: 0x0102,
            src_ref: 0x0100,
            dst_ref: 0x0000,
            send_timeout: Duration::from_millis(3000),
            recv_timeout: Duration::from_millis(3000),
            ping_timeout: Duration::from_millis(1000),
        }
    }
}

impl PartnerConfig {
    fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: self.ping_timeout,
            send: self.send_timeout,
            recv: self.recv_timeout,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartnerStatus {
    Stopped,
    /// Started, but no peer is connected.
    Running,
    Linked,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PartnerStats {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
}

/// Durations of the last completed send and receive.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PartnerTimes {
    pub send: Duration,
    pub recv: Duration,
}

struct Inner {
    active: bool,
    config: Mutex<PartnerConfig>,
    link: Mutex<Option<IsoConnection>>,
    running: AtomicBool,
    stats: Mutex<PartnerStats>,
    times: Mutex<PartnerTimes>,
    last_error: Mutex<Option<S7Error>>,
}

impl Inner {
    fn config(&self) -> Result<PartnerConfig, S7Error> {
        self.config.lock().map(|c| c.clone()).map_err(destroying)
    }

    fn lock_link(&self) -> Result<MutexGuard<'_, Option<IsoConnection>>, S7Error> {
        self.link.lock().map_err(destroying)
    }

    fn is_linked(&self) -> bool {
        self.link
            .try_lock()
            .map(|link| link.as_ref().is_some_and(IsoConnection::is_connected))
            // A send or receive in progress holds the link.
            .unwrap_or(true)
    }

    fn connect(&self, config: &PartnerConfig) -> Result<IsoConnection, S7Error> {
        let params = IsoParams {
            local_tsap: config.local_tsap,
            remote_tsap: config.remote_tsap,
            src_ref: config.src_ref,
            pdu_size: u16::MAX,
            timeouts: config.timeouts(),
        };
        let mut conn = IsoConnection::new();
        conn.connect(&config.remote_address, config.remote_port, &params)?;
        log::info!(
            "Partner linked to {}:{}",
            config.remote_address,
            config.remote_port
        );
        Ok(conn)
    }

    /// Returns the locked link once it is up. An active partner (re)connects, a
    /// passive one waits for its peer until `deadline`.
    fn linked(
        &self,
        config: &PartnerConfig,
        deadline: Instant,
    ) -> Result<MutexGuard<'_, Option<IsoConnection>>, S7Error> {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(S7Error::not_connected());
            }
            let mut link = self.lock_link()?;
            if link.as_ref().is_some_and(IsoConnection::is_connected) {
                return Ok(link);
            }
            if self.active {
                *link = Some(self.connect(config)?);
                return Ok(link);
            }
            drop(link);
            if Instant::now() >= deadline {
                return Err(S7Error::not_connected());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn b_send(&self, data: &[u8]) -> Result<(), S7Error> {
        let started = Instant::now();
        let result = self.send(data);
        match &result {
            Ok(()) => {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.bytes_sent += data.len() as u64;
                }
                if let Ok(mut times) = self.times.lock() {
                    times.send = started.elapsed();
                }
            }
            Err(err) => {
                log::debug!("Partner send failed: {}", err);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.send_errors += 1;
                }
                self.set_last_error(err);
            }
        }
        result
    }

    fn send(&self, data: &[u8]) -> Result<(), S7Error> {
        let config = self.config()?;
        let request = pdu::partner_data(data)?;
        let mut link = self.linked(&config, Instant::now() + config.send_timeout)?;
        let conn = link.as_mut().ok_or_else(S7Error::not_connected)?;
        let ack = conn.exchange(&request)?;
        pdu::parse_partner_ack(&ack)
    }

    fn b_recv(&self) -> Result<Vec<u8>, S7Error> {
        let started = Instant::now();
        let result = self.recv();
        match &result {
            Ok(data) => {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.bytes_recv += data.len() as u64;
                }
                if let Ok(mut times) = self.times.lock() {
                    times.recv = started.elapsed();
                }
            }
            Err(err) => {
                log::debug!("Partner receive failed: {}", err);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.recv_errors += 1;
                }
                self.set_last_error(err);
            }
        }
        result
    }

    fn recv(&self) -> Result<Vec<u8>, S7Error> {
        let config = self.config()?;
        let deadline = Instant::now() + config.recv_timeout;
        let mut link = self.linked(&config, deadline)?;
        let conn = link.as_mut().ok_or_else(S7Error::not_connected)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !conn.wait_data(remaining, &config.timeouts())? {
            return Err(S7Error::Timeout(ErrorCode::TCP_RECEIVE_TIMEOUT));
        }
        let data = pdu::parse_partner_data(&conn.receive_data()?)?;
        conn.send_data(&pdu::partner_ack(0))?;
        Ok(data)
    }

    fn set_last_error(&self, err: &S7Error) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err.clone());
        }
    }

    /// Completes the handshake of an incoming connection and makes it the link.
    fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), S7Error> {
        let config = self.config()?;
        if let Ok(expected) = config.remote_address.parse::<IpAddr>()
            && !expected.is_unspecified()
            && expected != peer.ip()
        {
            log::warn!("Refusing partner connection from {}", peer);
            return Ok(());
        }
        stream.set_nonblocking(false).map_err(S7Error::from_receive)?;
        let conn = IsoConnection::accept(
            stream,
            Some(config.local_tsap),
            config.src_ref,
            &config.timeouts(),
        )?;
        log::info!("Partner linked with {}", peer);
        *self.lock_link()? = Some(conn);
        Ok(())
    }

    fn listen(&self, listener: TcpListener) {
        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = self.accept(stream, peer) {
                        log::error!("Partner handshake with {} failed: {}", peer, err);
                        self.set_last_error(&err);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
                Err(err) => {
                    log::error!("Partner accept failed: {}", err);
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }
}

/// One end of a peer to peer link.
pub struct Partner {
    inner: Arc<Inner>,
    listener: Mutex<Option<JoinHandle<()>>>,
    send_job: Mutex<Option<Job<()>>>,
    recv_job: Mutex<Option<Job<Vec<u8>>>>,
    send_callback: Mutex<Option<Completion<()>>>,
    recv_callback: Mutex<Option<Completion<Vec<u8>>>>,
}

impl std::fmt::Debug for Partner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partner")
            .field("active", &self.inner.active)
            .field("status", &self.status())
            .finish()
    }
}

impl Partner {
    /// Creates an active (`true`) or passive partner.
    pub fn new(active: bool) -> Partner {
        Partner::with_config(active, PartnerConfig::default())
    }

    pub fn with_config(active: bool, config: PartnerConfig) -> Partner {
        Partner {
            inner: Arc::new(Inner {
                active,
                config: Mutex::new(config),
                link: Mutex::new(None),
                running: AtomicBool::new(false),
                stats: Mutex::new(PartnerStats::default()),
                times: Mutex::new(PartnerTimes::default()),
                last_error: Mutex::new(None),
            }),
            listener: Mutex::new(None),
            send_job: Mutex::new(None),
            recv_job: Mutex::new(None),
            send_callback: Mutex::new(None),
            recv_callback: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active
    }

    /// Starts with the configured addresses and TSAPs. Starting a running partner does
    /// nothing.
    ///
    /// An active partner tries to connect once; if the peer is not there yet, the next
    /// send or receive connects. A passive partner starts listening.
    pub fn start(&self) -> Result<(), S7Error> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let config = self.inner.config()?;
        if self.inner.active {
            match self.inner.connect(&config) {
                Ok(conn) => *self.inner.lock_link()? = Some(conn),
                Err(err) => {
                    log::warn!("Partner peer not reachable yet: {}", err);
                    self.inner.set_last_error(&err);
                }
            }
            return Ok(());
        }
        let addr = SocketAddr::new(config.local_address, config.local_port);
        let listener = TcpListener::bind(addr)
            .and_then(|listener| listener.set_nonblocking(true).map(|_| listener))
            .map_err(|err| {
                log::error!("Partner cannot listen on {}: {}", addr, err);
                self.inner.running.store(false, Ordering::SeqCst);
                S7Error::Connection(ErrorCode::TCP_SOCKET_CREATION)
            })?;
        log::info!("Partner listening on {}", addr);
        let inner = Arc::clone(&self.inner);
        let handle = thread::spawn(move || inner.listen(listener));
        *self.listener.lock().map_err(destroying)? = Some(handle);
        Ok(())
    }

    /// Sets addresses and TSAPs, then starts.
    pub fn start_to(
        &self,
        local_address: IpAddr,
        remote_address: &str,
        local_tsap: u16,
        remote_tsap: u16,
    ) -> Result<(), S7Error> {
        {
            let mut config = self.inner.config.lock().map_err(destroying)?;
            config.local_address = local_address;
            config.remote_address = remote_address.to_string();
            config.local_tsap = local_tsap;
            config.remote_tsap = remote_tsap;
        }
        self.start()
    }

    /// Stops listening and drops the link. Calling it again is a no-op.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut listener) = self.listener.lock()
            && let Some(handle) = listener.take()
            && handle.join().is_err()
        {
            log::error!("Partner listener panicked");
        }
        if let Ok(mut link) = self.inner.link.lock()
            && let Some(mut conn) = link.take()
        {
            conn.disconnect();
        }
        log::info!("Partner stopped");
    }

    pub fn status(&self) -> PartnerStatus {
        if !self.inner.running.load(Ordering::SeqCst) {
            PartnerStatus::Stopped
        } else if self.inner.is_linked() {
            PartnerStatus::Linked
        } else {
            PartnerStatus::Running
        }
    }

    pub fn stats(&self) -> PartnerStats {
        self.inner.stats.lock().map(|s| *s).unwrap_or_default()
    }

    pub fn times(&self) -> PartnerTimes {
        self.inner.times.lock().map(|t| *t).unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<S7Error> {
        self.inner.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn config(&self) -> Result<PartnerConfig, S7Error> {
        self.inner.config()
    }

    /// Parameters by Snap7 number: `LocalPort`=1, `RemotePort`=2, `PingTimeout`=3,
    /// `SendTimeout`=4, `RecvTimeout`=5, `SrcRef`=7, `DstRef`=8, `SrcTsap`=9.
    pub fn get_param(&self, number: u8) -> Result<u32, S7Error> {
        let config = self.inner.config()?;
        Ok(match number {
            1 => config.local_port as u32,
            2 => config.remote_port as u32,
            3 => config.ping_timeout.as_millis() as u32,
            4 => config.send_timeout.as_millis() as u32,
            5 => config.recv_timeout.as_millis() as u32,
            7 => config.src_ref as u32,
            8 => config.dst_ref as u32,
            9 => config.local_tsap as u32,
            _ => return Err(S7Error::Client(ErrorCode::INVALID_PARAM_NUMBER)),
        })
    }

    pub fn set_param(&self, number: u8, value: u32) -> Result<(), S7Error> {
        let running = self.inner.running.load(Ordering::SeqCst);
        let mut config = self.inner.config.lock().map_err(destroying)?;
        let as_u16 =
            |value: u32| u16::try_from(value).map_err(|_| S7Error::Client(ErrorCode::INVALID_PARAMS));
        match number {
            1 | 2 | 9 if running => return Err(S7Error::Client(ErrorCode::CANNOT_CHANGE_PARAM)),
            1 => config.local_port = as_u16(value)?,
            2 => config.remote_port = as_u16(value)?,
            3 => config.ping_timeout = Duration::from_millis(value.into()),
            4 => config.send_timeout = Duration::from_millis(value.into()),
            5 => config.recv_timeout = Duration::from_millis(value.into()),
            7 => config.src_ref = as_u16(value)?,
            8 => config.dst_ref = as_u16(value)?,
            9 => config.local_tsap = as_u16(value)?,
            _ => return Err(S7Error::Client(ErrorCode::INVALID_PARAM_NUMBER)),
        }
        Ok(())
    }

    /// Sends `data` and waits for the peer's acknowledgement.
    pub fn b_send(&self, data: &[u8]) -> Result<(), S7Error> {
        self.inner.b_send(data)
    }

    /// Waits for data from the peer and acknowledges it.
    pub fn b_recv(&self) -> Result<Vec<u8>, S7Error> {
        self.inner.b_recv()
    }

    /// Registers the callback run on the worker when an asynchronous send completes.
    pub fn set_send_callback(&self, callback: Option<Completion<()>>) {
        if let Ok(mut slot) = self.send_callback.lock() {
            *slot = callback;
        }
    }

    /// Registers the callback run on the worker when an asynchronous receive completes.
    pub fn set_recv_callback(&self, callback: Option<Completion<Vec<u8>>>) {
        if let Ok(mut slot) = self.recv_callback.lock() {
            *slot = callback;
        }
    }

    /// Starts a send in the background. Only one may be pending.
    pub fn as_b_send(&self, data: Vec<u8>) -> Result<(), S7Error> {
        let mut slot = self.send_job.lock().map_err(destroying)?;
        if slot.as_ref().is_some_and(|job| !job.is_finished()) {
            return Err(S7Error::Client(ErrorCode::JOB_PENDING));
        }
        let callback = self.send_callback.lock().map_err(destroying)?.clone();
        let inner = Arc::clone(&self.inner);
        *slot = Some(Job::spawn(move || inner.b_send(&data), callback));
        Ok(())
    }

    /// `None` while the background send is running.
    pub fn check_as_b_send_completion(&self) -> Option<Result<(), S7Error>> {
        match self.send_job.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(job) => job.poll(),
                None => Some(Err(S7Error::Client(ErrorCode::FUNCTION_REFUSED))),
            },
            Err(_) => Some(Err(S7Error::Client(ErrorCode::DESTROYING))),
        }
    }

    pub fn wait_as_b_send_completion(&self, timeout: Duration) -> Result<(), S7Error> {
        // the slot lock is released before blocking
        let job = self.send_job.lock().map_err(destroying)?.clone();
        match job {
            Some(job) => job.wait(timeout),
            None => Err(S7Error::Client(ErrorCode::FUNCTION_REFUSED)),
        }
    }

    /// Starts a receive in the background. Only one may be pending.
    pub fn as_b_recv(&self) -> Result<(), S7Error> {
        let mut slot = self.recv_job.lock().map_err(destroying)?;
        if slot.as_ref().is_some_and(|job| !job.is_finished()) {
            return Err(S7Error::Client(ErrorCode::JOB_PENDING));
        }
        let callback = self.recv_callback.lock().map_err(destroying)?.clone();
        let inner = Arc::clone(&self.inner);
        *slot = Some(Job::spawn(move || inner.b_recv(), callback));
        Ok(())
    }

    /// `None` while the background receive is running.
    pub fn check_as_b_recv_completion(&self) -> Option<Result<Vec<u8>, S7Error>> {
        match self.recv_job.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(job) => job.poll(),
                None => Some(Err(S7Error::Client(ErrorCode::FUNCTION_REFUSED))),
            },
            Err(_) => Some(Err(S7Error::Client(ErrorCode::DESTROYING))),
        }
    }

    pub fn wait_as_b_recv_completion(&self, timeout: Duration) -> Result<Vec<u8>, S7Error> {
        // the slot lock is released before blocking
        let job = self.recv_job.lock().map_err(destroying)?.clone();
        match job {
            Some(job) => job.wait(timeout),
            None => Err(S7Error::Client(ErrorCode::FUNCTION_REFUSED)),
        }
    }
}

impl Drop for Partner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn pair(port: u16) -> (Partner, Partner) {
        let passive = Partner::with_config(
            false,
            PartnerConfig {
                local_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                remote_address: "0.0.0.0".to_string(),
                local_port: port,
                local_tsap: 0x0102,
                remote_tsap: 0x0100,
                ..PartnerConfig::default()
            },
        );
        let active = Partner::with_config(
            true,
            PartnerConfig {
                remote_port: port,
                local_tsap: 0x0100,
                remote_tsap: 0x0102,
                ..PartnerConfig::default()
            },
        );
        (passive, active)
    }

    #[test]
    fn blocking_exchange() {
        let (passive, active) = pair(free_port());
        passive.start().unwrap();
        active.start().unwrap();
        assert_eq!(active.status(), PartnerStatus::Linked);

        let receiver = thread::spawn(move || {
            let data = passive.b_recv().unwrap();
            (data, passive.stats())
        });
        active.b_send(b"hello partner").unwrap();
        let (data, stats) = receiver.join().unwrap();
        assert_eq!(data, b"hello partner".to_vec());
        assert_eq!(stats.bytes_recv, 13);
        assert_eq!(active.stats().bytes_sent, 13);
        assert_eq!(active.stats().send_errors, 0);

        active.stop();
        active.stop();
        assert_eq!(active.status(), PartnerStatus::Stopped);
    }

    #[test]
    fn asynchronous_send() {
        let (passive, active) = pair(free_port());
        passive.start().unwrap();
        active.start().unwrap();

        active.as_b_send(vec![1, 2, 3]).unwrap();
        assert_eq!(
            active.as_b_send(vec![4]),
            Err(S7Error::Client(ErrorCode::JOB_PENDING))
        );
        assert_eq!(active.check_as_b_send_completion(), None);

        let receiver = thread::spawn(move || passive.b_recv());
        active
            .wait_as_b_send_completion(Duration::from_secs(5))
            .unwrap();
        assert_eq!(receiver.join().unwrap().unwrap(), vec![1, 2, 3]);
        assert_eq!(active.check_as_b_send_completion(), Some(Ok(())));
    }

    #[test]
    fn receive_times_out_without_data() {
        let (passive, active) = pair(free_port());
        passive.set_param(5, 100).unwrap();
        passive.start().unwrap();
        active.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while passive.status() != PartnerStatus::Linked && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        match passive.b_recv() {
            Err(S7Error::Timeout(code)) => assert_eq!(code, ErrorCode::TCP_RECEIVE_TIMEOUT),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(passive.stats().recv_errors, 1);
        assert!(passive.last_error().is_some());
    }

    #[test]
    fn params_locked_while_running() {
        let partner = Partner::with_config(
            false,
            PartnerConfig {
                local_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                local_port: free_port(),
                ..PartnerConfig::default()
            },
        );
        partner.set_param(4, 1500).unwrap();
        assert_eq!(partner.get_param(4).unwrap(), 1500);
        partner.start().unwrap();
        assert_eq!(partner.status(), PartnerStatus::Running);
        assert_eq!(
            partner.set_param(1, 2000),
            Err(S7Error::Client(ErrorCode::CANNOT_CHANGE_PARAM))
        );
        assert_eq!(
            partner.get_param(6),
            Err(S7Error::Client(ErrorCode::INVALID_PARAM_NUMBER))
        );
        partner.stop();
    }
}
