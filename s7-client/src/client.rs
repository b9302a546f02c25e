use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};

use s7_protocol::{
    error::{ErrorCode, S7Error},
    types::{
        Area, BlockType, ConnectionType, CpuStatus, DEFAULT_PDU_SIZE, DataItem,
        ISO_TCP_PORT, SzlRecord, WordLen, remote_tsap,
    },
    userdata::{
        self, BlocksList, CpuInfo, OrderCode, SZL_COMPONENT_ID, SZL_CPU_STATE, SZL_ID_LIST,
        SZL_ORDER_CODE,
    },
};

use crate::{
    engine::{Partial, S7ConnectionEngine, transfer_len},
    iso::{IsoConnection, IsoParams},
    transport::Timeouts,
};

/// Largest offset probed when sizing a data block.
const MAX_DB_SIZE: u32 = 0x1_0000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientConfig {
    /// PDU length asked for during setup communication.
    pub pdu_request: u16,
    pub port: u16,
    pub connection_type: ConnectionType,
    pub timeouts: Timeouts,
    pub local_tsap: u16,
    pub src_ref: u16,
    pub dst_ref: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            pdu_request: DEFAULT_PDU_SIZE,
            port: ISO_TCP_PORT,
            connection_type: ConnectionType::PG,
            timeouts: Timeouts::default(),
            local_tsap: 0x0100,
            src_ref: 0x0001,
            dst_ref: 0x0000,
        }
    }
}

/// Runtime parameters, numbered like the Snap7 parameter ids.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Param {
    RemotePort,
    PingTimeout,
    SendTimeout,
    RecvTimeout,
    SrcRef,
    DstRef,
    SrcTsap,
    PduRequest,
}

impl Param {
    pub fn from_number(number: u8) -> Result<Param, S7Error> {
        match number {
            2 => Ok(Param::RemotePort),
            3 => Ok(Param::PingTimeout),
            4 => Ok(Param::SendTimeout),
            5 => Ok(Param::RecvTimeout),
            7 => Ok(Param::SrcRef),
            8 => Ok(Param::DstRef),
            9 => Ok(Param::SrcTsap),
            10 => Ok(Param::PduRequest),
            _ => Err(S7Error::Client(ErrorCode::INVALID_PARAM_NUMBER)),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClientState {
    Created,
    Connected,
    Disconnected,
}

/// Size of a block, as far as it could be determined.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockInfo {
    pub block_type: BlockType,
    pub number: u16,
    /// Size of the block's data in bytes.
    pub size: usize,
}

/// Blocking S7 client.
///
/// Every operation waits for its complete answer before returning, so requests on one
/// client never overlap.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    host: Option<String>,
    remote_tsap: u16,
    engine: Option<S7ConnectionEngine>,
    state: ClientState,
    exec_time: Duration,
    last_error: Option<S7Error>,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    pub fn new() -> Client {
        Client::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Client {
        Client {
            remote_tsap: (config.connection_type.code() << 8) + 0x02,
            config,
            host: None,
            engine: None,
            state: ClientState::Created,
            exec_time: Duration::ZERO,
            last_error: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// True while the session is usable. A link lost during an operation reports `false`.
    pub fn connected(&self) -> bool {
        self.state == ClientState::Connected
            && self
                .engine
                .as_ref()
                .is_some_and(|engine| engine.iso().is_connected())
    }

    /// Sets the target host and both TSAPs for a following [Client::connect].
    pub fn set_connection_params(&mut self, host: &str, local_tsap: u16, remote_tsap: u16) {
        self.host = Some(host.to_string());
        self.config.local_tsap = local_tsap;
        self.remote_tsap = remote_tsap;
    }

    /// Selects the connection resource used by [Client::connect_to].
    pub fn set_connection_type(&mut self, connection_type: ConnectionType) {
        self.config.connection_type = connection_type;
    }

    /// Connects to the CPU at `rack`/`slot` of `host`.
    pub fn connect_to(&mut self, host: &str, rack: u16, slot: u16) -> Result<(), S7Error> {
        let remote = remote_tsap(self.config.connection_type, rack, slot)?;
        self.set_connection_params(host, self.config.local_tsap, remote);
        self.connect()
    }

    /// Connects with the parameters set before: TCP, then the ISO handshake, then the
    /// PDU negotiation. On failure the client stays disconnected.
    pub fn connect(&mut self) -> Result<(), S7Error> {
        let started = Instant::now();
        let result = self.establish();
        self.exec_time = started.elapsed();
        match &result {
            Ok(pdu_length) => {
                self.state = ClientState::Connected;
                log::info!(
                    "Connected to {}, PDU length {}",
                    self.host.as_deref().unwrap_or_default(),
                    pdu_length
                );
            }
            Err(err) => {
                log::debug!("Connect failed: {}", err);
                self.engine = None;
                if self.state == ClientState::Connected {
                    self.state = ClientState::Disconnected;
                }
                self.last_error = Some(err.clone());
            }
        }
        result.map(|_| ())
    }

    fn establish(&mut self) -> Result<u16, S7Error> {
        self.close_session();
        let host = self
            .host
            .clone()
            .ok_or(S7Error::Client(ErrorCode::INVALID_PARAMS))?;
        let params = IsoParams {
            local_tsap: self.config.local_tsap,
            remote_tsap: self.remote_tsap,
            src_ref: self.config.src_ref,
            pdu_size: self.config.pdu_request,
            timeouts: self.config.timeouts,
        };
        let mut iso = IsoConnection::new();
        iso.connect(&host, self.config.port, &params)?;
        let mut engine = S7ConnectionEngine::new(iso);
        let pdu_length = engine.setup_communication(self.config.pdu_request)?;
        self.engine = Some(engine);
        Ok(pdu_length)
    }

    /// Closes the session and leaves the client [ClientState::Disconnected], whatever
    /// state it was in. Calling it again is a no-op.
    pub fn disconnect(&mut self) {
        self.close_session();
        self.state = ClientState::Disconnected;
    }

    fn close_session(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.disconnect();
            log::info!("Disconnected");
        }
    }

    /// Negotiated PDU length, zero while disconnected.
    pub fn get_pdu_length(&self) -> u16 {
        match &self.engine {
            Some(engine) if self.connected() => engine.pdu_length(),
            _ => 0,
        }
    }

    /// Duration of the last operation.
    pub fn exec_time(&self) -> Duration {
        self.exec_time
    }

    pub fn last_error(&self) -> Option<&S7Error> {
        self.last_error.as_ref()
    }

    pub fn get_param(&self, number: u8) -> Result<u32, S7Error> {
        let config = &self.config;
        Ok(match Param::from_number(number)? {
            Param::RemotePort => config.port as u32,
            Param::PingTimeout => config.timeouts.connect.as_millis() as u32,
            Param::SendTimeout => config.timeouts.send.as_millis() as u32,
            Param::RecvTimeout => config.timeouts.recv.as_millis() as u32,
            Param::SrcRef => config.src_ref as u32,
            Param::DstRef => config.dst_ref as u32,
            Param::SrcTsap => config.local_tsap as u32,
            Param::PduRequest => config.pdu_request as u32,
        })
    }

    pub fn set_param(&mut self, number: u8, value: u32) -> Result<(), S7Error> {
        let param = Param::from_number(number)?;
        let connected = self.connected();
        let as_u16 =
            |value: u32| u16::try_from(value).map_err(|_| S7Error::Client(ErrorCode::INVALID_PARAMS));
        match param {
            Param::RemotePort | Param::SrcTsap | Param::PduRequest if connected => {
                return Err(S7Error::Client(ErrorCode::CANNOT_CHANGE_PARAM));
            }
            Param::RemotePort => self.config.port = as_u16(value)?,
            Param::SrcTsap => self.config.local_tsap = as_u16(value)?,
            Param::PduRequest => {
                let size = as_u16(value)?;
                if !(240..=960).contains(&size) {
                    return Err(S7Error::Client(ErrorCode::INVALID_PARAMS));
                }
                self.config.pdu_request = size;
            }
            Param::PingTimeout => self.config.timeouts.connect = Duration::from_millis(value.into()),
            Param::SendTimeout => self.config.timeouts.send = Duration::from_millis(value.into()),
            Param::RecvTimeout => self.config.timeouts.recv = Duration::from_millis(value.into()),
            Param::SrcRef => self.config.src_ref = as_u16(value)?,
            Param::DstRef => self.config.dst_ref = as_u16(value)?,
        }
        if let Some(engine) = &self.engine {
            engine.iso().set_timeouts(&self.config.timeouts)?;
        }
        Ok(())
    }

    /// Runs `op` on the live session, timing it and recording its error.
    fn run<T, E>(&mut self, op: impl FnOnce(&mut S7ConnectionEngine) -> Result<T, E>) -> Result<T, E>
    where
        E: From<S7Error> + Clone + Into<S7Error>,
    {
        let started = Instant::now();
        let result = match self.engine.as_mut() {
            Some(engine) if self.state == ClientState::Connected && engine.iso().is_connected() => {
                op(engine)
            }
            _ => Err(S7Error::not_connected().into()),
        };
        self.exec_time = started.elapsed();
        if let Err(err) = &result {
            self.last_error = Some(err.clone().into());
        }
        result
    }

    /// Reads into `buffer`. On failure, the error tells how many bytes arrived.
    pub fn read_area_into(
        &mut self,
        area: Area,
        db_number: u16,
        start: u32,
        amount: u16,
        word_len: WordLen,
        buffer: &mut [u8],
    ) -> Result<(), Partial> {
        self.run(|engine| engine.read_area(area, db_number, start, word_len, amount, buffer))
    }

    /// Writes from `data`. On failure, the error tells how many bytes were written.
    pub fn write_area_from(
        &mut self,
        area: Area,
        db_number: u16,
        start: u32,
        amount: u16,
        word_len: WordLen,
        data: &[u8],
    ) -> Result<(), Partial> {
        self.run(|engine| engine.write_area(area, db_number, start, word_len, amount, data))
    }

    /// Reads `amount` elements of `word_len` starting at `start`.
    pub fn read_area(
        &mut self,
        area: Area,
        db_number: u16,
        start: u32,
        amount: u16,
        word_len: WordLen,
    ) -> Result<Vec<u8>, S7Error> {
        let mut buffer = vec![0u8; transfer_len(area, word_len, amount)];
        self.read_area_into(area, db_number, start, amount, word_len, &mut buffer)?;
        Ok(buffer)
    }

    pub fn write_area(
        &mut self,
        area: Area,
        db_number: u16,
        start: u32,
        amount: u16,
        word_len: WordLen,
        data: &[u8],
    ) -> Result<(), S7Error> {
        Ok(self.write_area_from(area, db_number, start, amount, word_len, data)?)
    }

    fn byte_count(size: usize) -> Result<u16, S7Error> {
        u16::try_from(size).map_err(|_| S7Error::Client(ErrorCode::INVALID_PARAMS))
    }

    fn read_bytes(&mut self, area: Area, db: u16, start: u32, size: usize) -> Result<Vec<u8>, S7Error> {
        let amount = Self::byte_count(size)?;
        self.read_area(area, db, start, amount, WordLen::Byte)
    }

    fn write_bytes(&mut self, area: Area, db: u16, start: u32, data: &[u8]) -> Result<(), S7Error> {
        let amount = Self::byte_count(data.len())?;
        self.write_area(area, db, start, amount, WordLen::Byte, data)
    }

    pub fn db_read(&mut self, db_number: u16, start: u32, size: usize) -> Result<Vec<u8>, S7Error> {
        self.read_bytes(Area::DB, db_number, start, size)
    }

    pub fn db_write(&mut self, db_number: u16, start: u32, data: &[u8]) -> Result<(), S7Error> {
        self.write_bytes(Area::DB, db_number, start, data)
    }

    /// Process outputs.
    pub fn ab_read(&mut self, start: u32, size: usize) -> Result<Vec<u8>, S7Error> {
        self.read_bytes(Area::PA, 0, start, size)
    }

    pub fn ab_write(&mut self, start: u32, data: &[u8]) -> Result<(), S7Error> {
        self.write_bytes(Area::PA, 0, start, data)
    }

    /// Process inputs.
    pub fn eb_read(&mut self, start: u32, size: usize) -> Result<Vec<u8>, S7Error> {
        self.read_bytes(Area::PE, 0, start, size)
    }

    pub fn eb_write(&mut self, start: u32, data: &[u8]) -> Result<(), S7Error> {
        self.write_bytes(Area::PE, 0, start, data)
    }

    /// Merkers.
    pub fn mb_read(&mut self, start: u32, size: usize) -> Result<Vec<u8>, S7Error> {
        self.read_bytes(Area::MK, 0, start, size)
    }

    pub fn mb_write(&mut self, start: u32, data: &[u8]) -> Result<(), S7Error> {
        self.write_bytes(Area::MK, 0, start, data)
    }

    /// Reads `amount` timers, two bytes each.
    pub fn tm_read(&mut self, start: u32, amount: u16) -> Result<Vec<u8>, S7Error> {
        self.read_area(Area::TM, 0, start, amount, WordLen::Timer)
    }

    /// Writes `data.len() / 2` timers.
    pub fn tm_write(&mut self, start: u32, data: &[u8]) -> Result<(), S7Error> {
        let amount = Self::element_count(data)?;
        self.write_area(Area::TM, 0, start, amount, WordLen::Timer, data)
    }

    /// Reads `amount` counters, two bytes each.
    pub fn ct_read(&mut self, start: u32, amount: u16) -> Result<Vec<u8>, S7Error> {
        self.read_area(Area::CT, 0, start, amount, WordLen::Counter)
    }

    pub fn ct_write(&mut self, start: u32, data: &[u8]) -> Result<(), S7Error> {
        let amount = Self::element_count(data)?;
        self.write_area(Area::CT, 0, start, amount, WordLen::Counter, data)
    }

    fn element_count(data: &[u8]) -> Result<u16, S7Error> {
        if data.len() % 2 != 0 {
            return Err(S7Error::Client(ErrorCode::INVALID_PARAMS));
        }
        Self::byte_count(data.len() / 2)
    }

    /// Reads up to 20 items in one request; see [DataItem::result] for each outcome.
    pub fn read_multi_vars(&mut self, items: &mut [DataItem]) -> Result<(), S7Error> {
        self.run(|engine| engine.read_multi_vars(items))
    }

    pub fn write_multi_vars(&mut self, items: &mut [DataItem]) -> Result<(), S7Error> {
        self.run(|engine| engine.write_multi_vars(items))
    }

    pub fn read_szl(&mut self, id: u16, index: u16) -> Result<SzlRecord, S7Error> {
        self.run(|engine| engine.read_szl(id, index))
    }

    /// IDs of all system status lists the CPU provides.
    pub fn read_szl_list(&mut self) -> Result<Vec<u16>, S7Error> {
        let record = self.read_szl(SZL_ID_LIST, 0x0000)?;
        Ok(userdata::parse_szl_list(&record))
    }

    pub fn get_cpu_info(&mut self) -> Result<CpuInfo, S7Error> {
        let record = self.read_szl(SZL_COMPONENT_ID, 0x0000)?;
        CpuInfo::from_szl(&record)
    }

    pub fn get_order_code(&mut self) -> Result<OrderCode, S7Error> {
        let record = self.read_szl(SZL_ORDER_CODE, 0x0000)?;
        OrderCode::from_szl(&record)
    }

    pub fn get_cpu_state(&mut self) -> Result<CpuStatus, S7Error> {
        let record = self.read_szl(SZL_CPU_STATE, 0x0000)?;
        userdata::parse_cpu_state(&record)
    }

    pub fn list_blocks(&mut self) -> Result<BlocksList, S7Error> {
        self.run(|engine| engine.list_blocks())
    }

    pub fn list_blocks_of_type(&mut self, block_type: BlockType) -> Result<Vec<u16>, S7Error> {
        self.run(|engine| engine.list_blocks_of_type(block_type))
    }

    /// Determines the size of a data block by probing single byte reads: the offset is
    /// doubled until a read is refused as out of range, then bisected.
    ///
    /// This is a heuristic. Only data blocks can be probed.
    // TODO: size blocks exactly with the block info user data function (group 3,
    // subfunction 3) and support the other block types.
    pub fn get_block_info(&mut self, block_type: BlockType, number: u16) -> Result<BlockInfo, S7Error> {
        if block_type != BlockType::DB {
            return Err(S7Error::Client(ErrorCode::INVALID_BLOCK_TYPE));
        }
        let size = self.run(|engine| probe_db_size(engine, number))?;
        Ok(BlockInfo {
            block_type,
            number,
            size,
        })
    }

    /// Reads a whole data block.
    pub fn db_get(&mut self, db_number: u16) -> Result<Vec<u8>, S7Error> {
        let info = self.get_block_info(BlockType::DB, db_number)?;
        if info.size == 0 {
            return Ok(Vec::new());
        }
        self.db_read(db_number, 0, info.size)
    }

    pub fn plc_stop(&mut self) -> Result<(), S7Error> {
        self.run(|engine| engine.plc_stop())
    }

    pub fn plc_hot_start(&mut self) -> Result<(), S7Error> {
        self.run(|engine| engine.plc_hot_start())
    }

    pub fn plc_cold_start(&mut self) -> Result<(), S7Error> {
        self.run(|engine| engine.plc_cold_start())
    }

    pub fn get_plc_datetime(&mut self) -> Result<NaiveDateTime, S7Error> {
        self.run(|engine| engine.get_plc_datetime())
    }

    pub fn set_plc_datetime(&mut self, value: NaiveDateTime) -> Result<(), S7Error> {
        self.run(|engine| engine.set_plc_datetime(value))
    }

    /// Sets the PLC clock to the local time of this machine.
    pub fn set_plc_system_datetime(&mut self) -> Result<(), S7Error> {
        self.set_plc_datetime(Local::now().naive_local())
    }

    pub fn set_session_password(&mut self, password: &str) -> Result<(), S7Error> {
        self.run(|engine| engine.set_session_password(password))
    }

    pub fn clear_session_password(&mut self) -> Result<(), S7Error> {
        self.run(|engine| engine.clear_session_password())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn probe_db_size(engine: &mut S7ConnectionEngine, number: u16) -> Result<usize, S7Error> {
    let mut readable = |offset: u32| -> Result<bool, S7Error> {
        if offset >= MAX_DB_SIZE {
            return Ok(false);
        }
        let mut byte = [0u8; 1];
        match engine.read_area(Area::DB, number, offset, WordLen::Byte, 1, &mut byte) {
            Ok(()) => Ok(true),
            Err(Partial { error, .. }) if error.code() == ErrorCode::ADDRESS_OUT_OF_RANGE => Ok(false),
            Err(partial) => Err(partial.error),
        }
    };
    if !readable(0)? {
        return Ok(0);
    }
    let (mut low, mut high) = (0u32, 1u32);
    while readable(high)? {
        low = high;
        high = (high * 2).min(MAX_DB_SIZE);
    }
    while high - low > 1 {
        let mid = low + (high - low) / 2;
        if readable(mid)? {
            low = mid;
        } else {
            high = mid;
        }
    }
    log::debug!("DB{} probed at {} bytes", number, high);
    Ok(high as usize)
}

#[test]
fn params_by_number() {
    let mut client = Client::new();
    assert_eq!(client.get_param(2).unwrap(), 102);
    assert_eq!(client.get_param(3).unwrap(), 3000);
    assert_eq!(client.get_param(9).unwrap(), 0x0100);
    client.set_param(10, 960).unwrap();
    assert_eq!(client.config().pdu_request, 960);
    client.set_param(5, 250).unwrap();
    assert_eq!(client.config().timeouts.recv, Duration::from_millis(250));
    match client.get_param(42) {
        Err(S7Error::Client(code)) => assert_eq!(code, ErrorCode::INVALID_PARAM_NUMBER),
        other => panic!("expected invalid parameter number, got {:?}", other),
    }
    assert!(client.set_param(2, 70_000).is_err());
}

#[test]
fn operations_need_a_connection() {
    let mut client = Client::new();
    assert_eq!(client.state(), ClientState::Created);
    match client.db_read(1, 0, 4) {
        Err(S7Error::Connection(code)) => assert_eq!(code, ErrorCode::TCP_NOT_CONNECTED),
        other => panic!("expected not connected, got {:?}", other),
    }
    assert_eq!(client.last_error(), Some(&S7Error::not_connected()));
    assert!(client.list_blocks().is_err());
    assert!(client.connect().is_err());
    assert_eq!(client.get_pdu_length(), 0);
    assert_eq!(client.state(), ClientState::Created);
    client.disconnect();
    assert_eq!(client.state(), ClientState::Disconnected);
    client.disconnect();
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(!client.connected());
}

#[test]
fn block_info_only_for_data_blocks() {
    let mut client = Client::new();
    match client.get_block_info(BlockType::OB, 1) {
        Err(S7Error::Client(code)) => assert_eq!(code, ErrorCode::INVALID_BLOCK_TYPE),
        other => panic!("expected invalid block type, got {:?}", other),
    }
}
