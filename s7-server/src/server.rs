use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::TimeDelta;
use s7_protocol::{
    error::S7Error,
    frame::{Frame, MAX_FRAME_LEN},
    types::{Area, CpuStatus, ISO_TCP_PORT},
    userdata::{CpuInfo, OrderCode},
};

use crate::{
    area::AreaTable,
    error::ServerError,
    event::{
        CLIENT_ADDED, CLIENT_DISCONNECTED, CLIENT_EXCEPTION, CLIENT_NO_ROOM, CLIENT_REJECTED,
        CLIENT_TERMINATED, CLIENTS_DROPPED, Event, EventCallback, EventQueue,
        LISTENER_CANNOT_START, SERVER_STARTED, SERVER_STOPPED,
    },
    handler::Session,
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Largest PDU granted during negotiation.
    pub max_pdu: u16,
    pub read_write_timeout: Duration,
    pub max_clients: usize,
    /// Polling period of the accept loop and of idle connections.
    pub work_interval: Duration,
    pub local_port: u16,
    /// Reported through SZL 0x001C.
    pub cpu_info: CpuInfo,
    /// Reported through SZL 0x0011.
    pub order_code: OrderCode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_pdu: 480,
            read_write_timeout: Duration::from_secs(30),
            max_clients: 1024,
            work_interval: Duration::from_millis(100),
            local_port: ISO_TCP_PORT,
            cpu_info: CpuInfo {
                module_type_name: "CPU 315-2 PN/DP".to_string(),
                serial_number: "S C-C2UR28922012".to_string(),
                as_name: "SNAP7-SERVER".to_string(),
                copyright: "Original Siemens Equipment".to_string(),
                module_name: "CPU 315-2 PN/DP".to_string(),
            },
            order_code: OrderCode {
                code: "6ES7 315-2EH14-0AB0 ".to_string(),
                v1: 3,
                v2: 2,
                v3: 6,
            },
        }
    }
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```
/// use s7_server::server::Builder;
/// use std::time::Duration;
///
/// let server = Builder::new()
///     .max_pdu(240)
///     .rw_timeout(Duration::from_secs(20))
///     .build();
/// assert_eq!(server.config().max_pdu, 240);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the largest PDU the server agrees to during negotiation.
    pub fn max_pdu(mut self, size: u16) -> Self {
        self.config.max_pdu = size;
        self
    }

    /// Set the TCP read and write timeout
    pub fn rw_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_write_timeout = timeout;
        self
    }

    pub fn max_clients(mut self, count: usize) -> Self {
        self.config.max_clients = count;
        self
    }

    pub fn work_interval(mut self, interval: Duration) -> Self {
        self.config.work_interval = interval;
        self
    }

    /// Set the port used by [Server::start]
    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    pub fn cpu_info(mut self, info: CpuInfo) -> Self {
        self.config.cpu_info = info;
        self
    }

    pub fn order_code(mut self, code: OrderCode) -> Self {
        self.config.order_code = code;
        self
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Build and return the server
    pub fn build(self) -> Server {
        Server::new(self.config)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServerStatus {
    Stopped,
    Running,
    /// The listener could not be started.
    Error,
}

/// Runtime parameters, numbered like the Snap7 parameter ids.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Param {
    LocalPort,
    WorkInterval,
    PduRequest,
    MaxClients,
}

impl Param {
    pub fn from_number(number: u8) -> Result<Param, ServerError> {
        match number {
            1 => Ok(Param::LocalPort),
            6 => Ok(Param::WorkInterval),
            10 => Ok(Param::PduRequest),
            11 => Ok(Param::MaxClients),
            _ => Err(ServerError::InvalidParamNumber(number)),
        }
    }
}

/// State shared between the owner, the accept loop and every connection.
#[derive(Debug)]
pub(crate) struct Shared {
    config: RwLock<Config>,
    pub(crate) areas: AreaTable,
    pub(crate) events: EventQueue,
    running: AtomicBool,
    status: Mutex<ServerStatus>,
    cpu: Mutex<CpuStatus>,
    clients: AtomicUsize,
    next_ref: AtomicU16,
    clock_offset: Mutex<TimeDelta>,
    password: Mutex<Option<[u8; 8]>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl Shared {
    pub(crate) fn new(config: Config) -> Shared {
        Shared {
            config: RwLock::new(config),
            areas: AreaTable::default(),
            events: EventQueue::default(),
            running: AtomicBool::new(false),
            status: Mutex::new(ServerStatus::Stopped),
            cpu: Mutex::new(CpuStatus::Run),
            clients: AtomicUsize::new(0),
            next_ref: AtomicU16::new(1),
            clock_offset: Mutex::new(TimeDelta::zero()),
            password: Mutex::new(None),
        }
    }

    pub(crate) fn config(&self) -> Config {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn lock_cpu(&self) -> MutexGuard<'_, CpuStatus> {
        lock(&self.cpu)
    }

    pub(crate) fn lock_clock_offset(&self) -> MutexGuard<'_, TimeDelta> {
        lock(&self.clock_offset)
    }

    pub(crate) fn lock_password(&self) -> MutexGuard<'_, Option<[u8; 8]>> {
        lock(&self.password)
    }

    fn event(&self, sender: Option<IpAddr>, code: u32, ret_code: u16, params: [u16; 4]) {
        self.events.push(Event::new(sender, code, ret_code, params));
    }

    /// Source reference for the next connection confirm, never zero.
    fn next_reference(&self) -> u16 {
        loop {
            let reference = self.next_ref.fetch_add(1, Ordering::Relaxed);
            if reference != 0 {
                return reference;
            }
        }
    }
}

/// How a connection ended.
enum Closed {
    ByPeer,
    ByServer,
}

/// A software S7 PLC serving registered memory areas.
///
/// The accept loop runs on its own thread and every accepted connection gets a
/// thread of its own. Each area has its own lock, so clients working on different
/// areas never wait for each other.
#[derive(Debug)]
pub struct Server {
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Default for Server {
    fn default() -> Self {
        Server::new(Config::default())
    }
}

impl Server {
    pub fn new(config: Config) -> Server {
        Server {
            shared: Arc::new(Shared::new(config)),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn config(&self) -> Config {
        self.shared.config()
    }

    /// Starts listening on all interfaces at the configured port.
    pub fn start(&self) -> Result<(), ServerError> {
        let port = self.shared.config().local_port;
        self.start_to(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    /// Starts listening on `ip:port`. Does nothing if the server already runs;
    /// port `0` picks a free port, see [Server::local_addr].
    pub fn start_to(&self, ip: IpAddr, port: u16) -> Result<(), ServerError> {
        let mut slot = lock(&self.listener);
        if slot.is_some() {
            return Ok(());
        }
        let listener = match TcpListener::bind((ip, port)) {
            Ok(listener) => listener,
            Err(err) => {
                log::error!("Cannot listen on {}:{}: {}", ip, port, err);
                let os_error = err.raw_os_error().unwrap_or(0) as u16;
                self.shared.event(None, LISTENER_CANNOT_START, os_error, [0; 4]);
                *lock(&self.shared.status) = ServerStatus::Error;
                return Err(ServerError::Bind(err));
            }
        };
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        *lock(&self.local_addr) = Some(addr);
        self.shared.running.store(true, Ordering::SeqCst);
        *lock(&self.shared.status) = ServerStatus::Running;
        self.shared.event(None, SERVER_STARTED, 0, [0; 4]);
        log::info!("Server listening on {}", addr);

        let shared = Arc::clone(&self.shared);
        *slot = Some(thread::spawn(move || accept_loop(shared, listener)));
        Ok(())
    }

    /// Stops listening and waits for every connection to close. Does nothing if
    /// the server is not running.
    pub fn stop(&self) {
        let Some(handle) = lock(&self.listener).take() else {
            return;
        };
        self.shared.running.store(false, Ordering::SeqCst);
        if handle.join().is_err() {
            log::error!("Listener thread panicked");
        }
        *lock(&self.local_addr) = None;
        *lock(&self.shared.status) = ServerStatus::Stopped;
        self.shared.event(None, SERVER_STOPPED, 0, [0; 4]);
        log::info!("Server stopped");
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Server state, emulated CPU state and number of connected clients.
    pub fn status(&self) -> (ServerStatus, CpuStatus, usize) {
        (
            *lock(&self.shared.status),
            *self.shared.lock_cpu(),
            self.shared.clients.load(Ordering::SeqCst),
        )
    }

    pub fn set_cpu_status(&self, status: CpuStatus) {
        *self.shared.lock_cpu() = status;
    }

    /// Registers `data` as the contents of `area`. `index` selects the data block
    /// number and is ignored for other areas.
    pub fn register_area(&self, area: Area, index: u16, data: Vec<u8>) -> Result<(), ServerError> {
        self.shared.areas.register(area, index, data)
    }

    /// Removes an area and returns its final contents.
    pub fn unregister_area(&self, area: Area, index: u16) -> Result<Vec<u8>, ServerError> {
        self.shared.areas.unregister(area, index)
    }

    /// Runs `f` on the contents of an area while holding its lock.
    pub fn with_area<R>(
        &self,
        area: Area,
        index: u16,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, ServerError> {
        let memory = self
            .shared
            .areas
            .get(area, index)
            .ok_or(ServerError::UnknownArea { area, index })?;
        Ok(memory.with(f))
    }

    /// Runs `f` on the contents of an area while holding its lock.
    pub fn with_area_mut<R>(
        &self,
        area: Area,
        index: u16,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, ServerError> {
        let memory = self
            .shared
            .areas
            .get(area, index)
            .ok_or(ServerError::UnknownArea { area, index })?;
        Ok(memory.with_mut(f))
    }

    pub fn pick_event(&self) -> Option<Event> {
        self.shared.events.pick()
    }

    pub fn clear_events(&self) {
        self.shared.events.clear();
    }

    pub fn get_mask(&self) -> u32 {
        self.shared.events.get_mask()
    }

    /// Only events whose code shares a bit with `mask` are recorded.
    pub fn set_mask(&self, mask: u32) {
        self.shared.events.set_mask(mask);
    }

    /// Called for every recorded event, from the thread that raised it.
    pub fn set_event_callback(&self, callback: Option<EventCallback>) {
        self.shared.events.set_callback(callback);
    }

    pub fn get_param(&self, number: u8) -> Result<u32, ServerError> {
        let config = self.shared.config();
        Ok(match Param::from_number(number)? {
            Param::LocalPort => config.local_port as u32,
            Param::WorkInterval => config.work_interval.as_millis() as u32,
            Param::PduRequest => config.max_pdu as u32,
            Param::MaxClients => config.max_clients as u32,
        })
    }

    pub fn set_param(&self, number: u8, value: u32) -> Result<(), ServerError> {
        let param = Param::from_number(number)?;
        let running = self.shared.running.load(Ordering::SeqCst);
        let mut config = self
            .shared
            .config
            .write()
            .unwrap_or_else(|p| p.into_inner());
        match param {
            Param::LocalPort if running => return Err(ServerError::CannotChangeParam(number)),
            Param::LocalPort => {
                config.local_port = u16::try_from(value)
                    .map_err(|_| ServerError::InvalidParams(format!("port {}", value)))?
            }
            Param::WorkInterval => config.work_interval = Duration::from_millis(value.into()),
            Param::PduRequest => {
                config.max_pdu = u16::try_from(value)
                    .ok()
                    .filter(|size| (240..=960).contains(size))
                    .ok_or_else(|| ServerError::InvalidParams(format!("PDU size {}", value)))?
            }
            Param::MaxClients => config.max_clients = value as usize,
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    while shared.running.load(Ordering::SeqCst) {
        let config = shared.config();
        match listener.accept() {
            Ok((tcp, peer)) => {
                workers.retain(|worker| !worker.is_finished());
                if shared.clients.load(Ordering::SeqCst) >= config.max_clients {
                    log::warn!("Refusing {}, {} clients connected", peer, config.max_clients);
                    shared.event(Some(peer.ip()), CLIENT_NO_ROOM, 0, [0; 4]);
                    continue;
                }
                log::info!("New client connection from {}", peer);
                shared.clients.fetch_add(1, Ordering::SeqCst);
                shared.event(Some(peer.ip()), CLIENT_ADDED, 0, [0; 4]);
                let worker = Arc::clone(&shared);
                workers.push(thread::spawn(move || serve_client(worker, tcp, peer)));
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(config.work_interval)
            }
            Err(err) => {
                log::error!("Connection error: {}", err);
                thread::sleep(config.work_interval);
            }
        }
    }
    let dropped = workers.iter().filter(|worker| !worker.is_finished()).count();
    for worker in workers {
        if worker.join().is_err() {
            log::error!("Client thread panicked");
        }
    }
    if dropped > 0 {
        shared.event(None, CLIENTS_DROPPED, 0, [dropped as u16, 0, 0, 0]);
    }
}

fn serve_client(shared: Arc<Shared>, mut tcp: TcpStream, peer: SocketAddr) {
    let sender = Some(peer.ip());
    match handle_client(&shared, &mut tcp, sender) {
        Ok(Closed::ByPeer) => {
            log::info!("Client {} disconnected", peer);
            shared.event(sender, CLIENT_DISCONNECTED, 0, [0; 4]);
        }
        Ok(Closed::ByServer) => {
            log::info!("Closed connection to {}", peer);
            shared.event(sender, CLIENT_TERMINATED, 0, [0; 4]);
        }
        Err(err) => {
            log::error!("Client error: {}", err);
            shared.event(sender, CLIENT_EXCEPTION, 0, [0; 4]);
        }
    }
    shared.clients.fetch_sub(1, Ordering::SeqCst);
}

fn handle_client(
    shared: &Shared,
    tcp: &mut TcpStream,
    sender: Option<IpAddr>,
) -> Result<Closed, S7Error> {
    let config = shared.config();
    let poll = config.work_interval.max(Duration::from_millis(1));
    tcp.set_nonblocking(false)?;
    tcp.set_read_timeout(Some(config.read_write_timeout))?;
    tcp.set_write_timeout(Some(config.read_write_timeout))?;

    match Frame::from_reader(tcp, MAX_FRAME_LEN)? {
        Frame::ConnectionRequest(request) => {
            log::debug!(
                "Connection request: calling={:?}, called={:?}",
                request.calling_tsap,
                request.called_tsap
            );
            Frame::ConnectionConfirm(request.confirm(shared.next_reference())).write_to(tcp)?;
        }
        other => {
            log::warn!("Expected a connection request, got {:?}", other);
            shared.event(sender, CLIENT_REJECTED, 0, [0; 4]);
            return Ok(Closed::ByServer);
        }
    }

    let mut session = Session::new(shared, sender);
    let mut idle = Duration::ZERO;
    let mut probe = [0u8; 1];
    while shared.running.load(Ordering::SeqCst) {
        tcp.set_read_timeout(Some(poll))?;
        match tcp.peek(&mut probe) {
            Ok(0) => return Ok(Closed::ByPeer),
            Ok(_) => {
                idle = Duration::ZERO;
                tcp.set_read_timeout(Some(config.read_write_timeout))?;
                match Frame::from_reader(tcp, MAX_FRAME_LEN)? {
                    Frame::Data(raw) => {
                        let answer = session.handle_pdu(&raw);
                        log::trace!("Answer: {:02x?}", answer.encode());
                        Frame::Data(answer.encode()).write_to(tcp)?;
                    }
                    Frame::DisconnectRequest { .. } => return Ok(Closed::ByPeer),
                    other => log::warn!("Ignoring unexpected frame {:?}", other),
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                idle += poll;
                if idle >= config.read_write_timeout {
                    log::error!("Client read timeout, closing connection");
                    return Ok(Closed::ByServer);
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                ) =>
            {
                return Ok(Closed::ByPeer);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(Closed::ByServer)
}
