//! User data PDUs: system status lists, block directory, clock and session security.
//!
//! A request is answered by one or more responses. While a response reports
//! `more_follows`, the requester sends a continuation carrying the sequence number
//! the responder assigned, until the final part arrives.
use chrono::{Datelike, NaiveDateTime};

use crate::{
    error::{ErrorCode, S7Error, cpu_error},
    pdu::{ITEM_NOT_AVAILABLE, ITEM_OK, Pdu, PduType},
    types::{BlockType, CpuStatus, SzlRecord},
    wire,
};

pub const GROUP_BLOCKS: u8 = 0x03;
pub const GROUP_SZL: u8 = 0x04;
pub const GROUP_SECURITY: u8 = 0x05;
pub const GROUP_CLOCK: u8 = 0x07;

pub const SUB_READ_SZL: u8 = 0x01;
pub const SUB_LIST_BLOCKS: u8 = 0x01;
pub const SUB_LIST_BLOCKS_OF_TYPE: u8 = 0x02;
pub const SUB_READ_CLOCK: u8 = 0x01;
pub const SUB_SET_CLOCK: u8 = 0x02;
pub const SUB_SET_PASSWORD: u8 = 0x01;
pub const SUB_CLEAR_PASSWORD: u8 = 0x02;

pub const SZL_ID_LIST: u16 = 0x0000;
pub const SZL_ORDER_CODE: u16 = 0x0011;
pub const SZL_COMPONENT_ID: u16 = 0x001C;
pub const SZL_CPU_STATE: u16 = 0x0424;

const TRANSPORT_OCTET: u8 = 0x09;
const NO_DATA: [u8; 4] = [0x0A, 0x00, 0x00, 0x00];
const BLOCK_PREFIX: u8 = 0x30;

/// The parameter part of a user data PDU.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UserDataParams {
    pub group: u8,
    pub subfunction: u8,
    pub sequence: u8,
    pub response: bool,
    /// Request continuing a multi part answer.
    pub continuation: bool,
    /// Set on responses when further parts are pending.
    pub more_follows: bool,
    pub error: u16,
}

impl UserDataParams {
    pub fn request(group: u8, subfunction: u8) -> Self {
        UserDataParams {
            group,
            subfunction,
            sequence: 0,
            response: false,
            continuation: false,
            more_follows: false,
            error: 0,
        }
    }

    pub fn continuation(group: u8, subfunction: u8, sequence: u8) -> Self {
        UserDataParams {
            sequence,
            continuation: true,
            ..UserDataParams::request(group, subfunction)
        }
    }

    pub fn response(request: &UserDataParams, sequence: u8, more_follows: bool, error: u16) -> Self {
        UserDataParams {
            group: request.group,
            subfunction: request.subfunction,
            sequence,
            response: true,
            continuation: false,
            more_follows,
            error,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let kind = if self.response { 0x80 } else { 0x40 };
        let long = self.response || self.continuation;
        let mut params = vec![
            0x00,
            0x01,
            0x12,
            if long { 0x08 } else { 0x04 },
            if long { 0x12 } else { 0x11 },
            kind | (self.group & 0x0F),
            self.subfunction,
            self.sequence,
        ];
        if long {
            params.extend_from_slice(&[0x00, if self.more_follows { 0x01 } else { 0x00 }]);
            params.extend_from_slice(&self.error.to_be_bytes());
        }
        params
    }

    pub fn decode(params: &[u8]) -> Result<Self, S7Error> {
        let &[0x00, 0x01, 0x12, len, method, kind, subfunction, sequence, ..] = params else {
            return Err(S7Error::invalid_pdu(format!(
                "malformed user data parameters {:02x?}",
                params
            )));
        };
        let (more_follows, error) = match params.get(8..12) {
            Some(&[_, last, e0, e1]) if len >= 8 => (last != 0, u16::from_be_bytes([e0, e1])),
            _ => (false, 0),
        };
        let response = kind & 0xF0 == 0x80;
        Ok(UserDataParams {
            group: kind & 0x0F,
            subfunction,
            sequence,
            response,
            continuation: !response && method == 0x12,
            more_follows,
            error,
        })
    }
}

/// A decoded user data PDU.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UserData {
    pub reference: u16,
    pub params: UserDataParams,
    /// Return code of the data part, `0xFF` when a payload is present.
    pub return_code: u8,
    pub payload: Vec<u8>,
}

impl UserData {
    pub fn decode(pdu: &Pdu) -> Result<UserData, S7Error> {
        if pdu.pdu_type != PduType::UserData {
            return Err(S7Error::invalid_answer(format!(
                "expected user data, got {:?}",
                pdu.pdu_type
            )));
        }
        let params = UserDataParams::decode(&pdu.params)?;
        let (return_code, payload) = match pdu.data.as_slice() {
            &[code, _, l0, l1, ref rest @ ..] => {
                let len = (u16::from_be_bytes([l0, l1]) as usize).min(rest.len());
                (code, rest[..len].to_vec())
            }
            _ => (ITEM_NOT_AVAILABLE, Vec::new()),
        };
        Ok(UserData {
            reference: pdu.reference,
            params,
            return_code,
            payload,
        })
    }

    /// Fails with the translated error of a rejected response.
    pub fn check(&self) -> Result<(), S7Error> {
        cpu_error(self.params.error)?;
        if self.return_code != ITEM_OK {
            return cpu_error(self.return_code as u16);
        }
        Ok(())
    }
}

fn octet_data(payload: &[u8]) -> Vec<u8> {
    let mut data = vec![ITEM_OK, TRANSPORT_OCTET];
    data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    data.extend_from_slice(payload);
    data
}

/// First request of a user data exchange. `None` sends an empty data part.
pub fn request(reference: u16, group: u8, subfunction: u8, payload: Option<&[u8]>) -> Pdu {
    let data = payload.map(octet_data).unwrap_or_else(|| NO_DATA.to_vec());
    Pdu::user_data(
        reference,
        UserDataParams::request(group, subfunction).encode(),
        data,
    )
}

/// Asks for the next part of a multi part answer.
pub fn next_request(reference: u16, group: u8, subfunction: u8, sequence: u8) -> Pdu {
    Pdu::user_data(
        reference,
        UserDataParams::continuation(group, subfunction, sequence).encode(),
        NO_DATA.to_vec(),
    )
}

/// Response to a user data request. An `error` other than zero sends no payload.
pub fn response(
    reference: u16,
    params: UserDataParams,
    payload: &[u8],
) -> Pdu {
    let data = if params.error == 0 {
        octet_data(payload)
    } else {
        NO_DATA.to_vec()
    };
    Pdu::user_data(reference, params.encode(), data)
}

pub fn szl_request(reference: u16, id: u16, index: u16) -> Pdu {
    let mut payload = id.to_be_bytes().to_vec();
    payload.extend_from_slice(&index.to_be_bytes());
    request(reference, GROUP_SZL, SUB_READ_SZL, Some(payload.as_slice()))
}

/// Parses the system status list request payload into `(id, index)`.
pub fn parse_szl_request(payload: &[u8]) -> Result<(u16, u16), S7Error> {
    match payload {
        &[i0, i1, x0, x1, ..] => Ok((u16::from_be_bytes([i0, i1]), u16::from_be_bytes([x0, x1]))),
        _ => Err(S7Error::invalid_pdu("system status list request without id")),
    }
}

/// Payload of a system status list answer: header followed by the records.
pub fn szl_payload(id: u16, index: u16, record_len: u16, records: &[u8]) -> Vec<u8> {
    let count = if record_len == 0 {
        0
    } else {
        records.len() / record_len as usize
    };
    let mut payload = Vec::with_capacity(8 + records.len());
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&record_len.to_be_bytes());
    payload.extend_from_slice(&(count as u16).to_be_bytes());
    payload.extend_from_slice(records);
    payload
}

/// Starts a record from the first answer part; later parts are appended to `data`.
pub fn parse_szl_header(payload: &[u8]) -> Result<SzlRecord, S7Error> {
    match payload {
        &[i0, i1, x0, x1, l0, l1, n0, n1, ref data @ ..] => Ok(SzlRecord {
            id: u16::from_be_bytes([i0, i1]),
            index: u16::from_be_bytes([x0, x1]),
            record_len: u16::from_be_bytes([l0, l1]),
            record_count: u16::from_be_bytes([n0, n1]),
            data: data.to_vec(),
        }),
        _ => Err(S7Error::protocol(
            ErrorCode::INVALID_DATA_SIZE_RECVD,
            "system status list answer shorter than its header",
        )),
    }
}

/// IDs of all available lists (SZL 0x0000).
pub fn parse_szl_list(record: &SzlRecord) -> Vec<u16> {
    record
        .data
        .chunks_exact(2)
        .map(|id| u16::from_be_bytes([id[0], id[1]]))
        .collect()
}

fn text(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|b| **b != 0)
        .map(|b| char::from(*b))
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Order number and firmware version (SZL 0x0011).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OrderCode {
    pub code: String,
    pub v1: u8,
    pub v2: u8,
    pub v3: u8,
}

impl OrderCode {
    pub fn from_szl(record: &SzlRecord) -> Result<OrderCode, S7Error> {
        let data = &record.data;
        if data.len() < 22 {
            return Err(S7Error::protocol(
                ErrorCode::INVALID_DATA_SIZE_RECVD,
                format!("order code list of {} bytes", data.len()),
            ));
        }
        let n = data.len();
        Ok(OrderCode {
            code: text(&data[2..22]),
            v1: data[n - 3],
            v2: data[n - 2],
            v3: data[n - 1],
        })
    }

    /// Records of SZL 0x0011: the order number record and the firmware record.
    pub fn to_szl(&self) -> Vec<u8> {
        let mut records = Vec::with_capacity(56);
        records.extend_from_slice(&0x0001u16.to_be_bytes());
        records.extend_from_slice(&padded(&self.code, 20));
        records.extend_from_slice(&[0x00, 0xC0, 0x00, 0x01, 0x00, 0x00]);
        records.extend_from_slice(&0x0007u16.to_be_bytes());
        records.extend_from_slice(&padded("", 20));
        records.extend_from_slice(&[0x00, 0x00, b'V', self.v1, self.v2, self.v3]);
        records
    }
}

/// Identification of the CPU module (SZL 0x001C).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CpuInfo {
    pub module_type_name: String,
    pub serial_number: String,
    pub as_name: String,
    pub copyright: String,
    pub module_name: String,
}

const COMPONENT_RECORD_LEN: usize = 34;

fn padded(value: &str, len: usize) -> Vec<u8> {
    let mut raw: Vec<u8> = value.bytes().filter(u8::is_ascii).take(len).collect();
    raw.resize(len, b' ');
    raw
}

impl CpuInfo {
    pub fn from_szl(record: &SzlRecord) -> Result<CpuInfo, S7Error> {
        let field = |index: u16| -> String {
            record
                .data
                .chunks_exact(COMPONENT_RECORD_LEN)
                .find(|r| u16::from_be_bytes([r[0], r[1]]) == index)
                .map(|r| text(&r[2..]))
                .unwrap_or_default()
        };
        if record.data.len() < COMPONENT_RECORD_LEN {
            return Err(S7Error::protocol(
                ErrorCode::INVALID_DATA_SIZE_RECVD,
                format!("component list of {} bytes", record.data.len()),
            ));
        }
        Ok(CpuInfo {
            as_name: field(1),
            module_name: field(2),
            copyright: field(4),
            serial_number: field(5),
            module_type_name: field(7),
        })
    }

    pub fn to_szl(&self) -> Vec<u8> {
        let fields: [(u16, &str); 7] = [
            (1, self.as_name.as_str()),
            (2, self.module_name.as_str()),
            (3, ""),
            (4, self.copyright.as_str()),
            (5, self.serial_number.as_str()),
            (7, self.module_type_name.as_str()),
            (8, ""),
        ];
        let mut records = Vec::with_capacity(fields.len() * COMPONENT_RECORD_LEN);
        for (index, value) in fields {
            records.extend_from_slice(&index.to_be_bytes());
            records.extend_from_slice(&padded(value, COMPONENT_RECORD_LEN - 2));
        }
        records
    }
}

/// Operating state from SZL 0x0424.
pub fn parse_cpu_state(record: &SzlRecord) -> Result<CpuStatus, S7Error> {
    match record.data.get(3) {
        Some(status) => Ok(CpuStatus::from_code(*status)),
        None => Err(S7Error::protocol(
            ErrorCode::INVALID_DATA_SIZE_RECVD,
            "CPU state list too short",
        )),
    }
}

/// Record of SZL 0x0424 reporting `status`.
pub fn cpu_state_record(status: CpuStatus) -> Vec<u8> {
    let mut record = vec![0u8; 20];
    record[0] = 0x51;
    record[1] = 0x44;
    record[2] = 0xFF;
    record[3] = status.code();
    record
}

/// Number of blocks per block type.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BlocksList {
    pub ob: u16,
    pub fb: u16,
    pub fc: u16,
    pub sfb: u16,
    pub sfc: u16,
    pub db: u16,
    pub sdb: u16,
}

impl BlocksList {
    pub fn get(&self, block_type: BlockType) -> u16 {
        match block_type {
            BlockType::OB => self.ob,
            BlockType::FB => self.fb,
            BlockType::FC => self.fc,
            BlockType::SFB => self.sfb,
            BlockType::SFC => self.sfc,
            BlockType::DB => self.db,
            BlockType::SDB => self.sdb,
        }
    }

    fn slot(&mut self, block_type: BlockType) -> &mut u16 {
        match block_type {
            BlockType::OB => &mut self.ob,
            BlockType::FB => &mut self.fb,
            BlockType::FC => &mut self.fc,
            BlockType::SFB => &mut self.sfb,
            BlockType::SFC => &mut self.sfc,
            BlockType::DB => &mut self.db,
            BlockType::SDB => &mut self.sdb,
        }
    }

    pub fn parse(payload: &[u8]) -> BlocksList {
        let mut list = BlocksList::default();
        for entry in payload.chunks_exact(4) {
            if let Some(block_type) = BlockType::from_code(entry[1]) {
                *list.slot(block_type) = u16::from_be_bytes([entry[2], entry[3]]);
            }
        }
        list
    }

    pub fn encode(&self) -> Vec<u8> {
        BlockType::ALL
            .iter()
            .flat_map(|t| {
                let [hi, lo] = self.get(*t).to_be_bytes();
                [BLOCK_PREFIX, t.code(), hi, lo]
            })
            .collect()
    }
}

pub fn list_blocks_request(reference: u16) -> Pdu {
    request(reference, GROUP_BLOCKS, SUB_LIST_BLOCKS, None)
}

pub fn list_blocks_of_type_request(reference: u16, block_type: BlockType) -> Pdu {
    request(
        reference,
        GROUP_BLOCKS,
        SUB_LIST_BLOCKS_OF_TYPE,
        Some(&[BLOCK_PREFIX, block_type.code()][..]),
    )
}

/// Block type requested by a list-blocks-of-type request.
pub fn parse_list_blocks_of_type(payload: &[u8]) -> Result<BlockType, S7Error> {
    payload
        .get(1)
        .and_then(|code| BlockType::from_code(*code))
        .ok_or(S7Error::Plc {
            raw: 0xD209,
            code: ErrorCode::INVALID_BLOCK_TYPE,
        })
}

/// Block numbers from list-blocks-of-type answers (4 bytes per block).
pub fn parse_block_numbers(payload: &[u8]) -> Vec<u16> {
    payload
        .chunks_exact(4)
        .map(|entry| u16::from_be_bytes([entry[0], entry[1]]))
        .collect()
}

pub fn block_numbers_payload(numbers: &[u16]) -> Vec<u8> {
    numbers
        .iter()
        .flat_map(|n| {
            let [hi, lo] = n.to_be_bytes();
            [hi, lo, 0x22, 0x05]
        })
        .collect()
}

pub fn read_clock_request(reference: u16) -> Pdu {
    request(reference, GROUP_CLOCK, SUB_READ_CLOCK, None)
}

/// Clock payload: reserved byte, BCD century and a DATE_AND_TIME.
pub fn clock_payload(value: NaiveDateTime) -> Result<Vec<u8>, S7Error> {
    let mut payload = vec![0u8; 10];
    payload[1] = wire::byte_to_bcd((value.year() / 100) as u8);
    wire::set_date_time(&mut payload, 2, value)?;
    Ok(payload)
}

pub fn parse_clock(payload: &[u8]) -> Result<NaiveDateTime, S7Error> {
    if payload.len() < 10 {
        return Err(S7Error::protocol(
            ErrorCode::INVALID_DATA_SIZE_RECVD,
            format!("clock answer of {} bytes", payload.len()),
        ));
    }
    Ok(wire::get_date_time(payload, 2)?)
}

pub fn set_clock_request(reference: u16, value: NaiveDateTime) -> Result<Pdu, S7Error> {
    Ok(request(
        reference,
        GROUP_CLOCK,
        SUB_SET_CLOCK,
        Some(clock_payload(value)?.as_slice()),
    ))
}

/// Scrambles a session password: space padded to 8 bytes, each byte xor 0x55,
/// from the third byte on also xor the scrambled byte two positions back.
pub fn encode_password(password: &str) -> Result<[u8; 8], S7Error> {
    if password.is_empty() || password.len() > 8 || !password.is_ascii() {
        return Err(S7Error::Client(ErrorCode::INVALID_PARAMS));
    }
    let mut raw = [b' '; 8];
    raw[..password.len()].copy_from_slice(password.as_bytes());
    let mut encoded = [0u8; 8];
    for i in 0..8 {
        encoded[i] = raw[i] ^ 0x55;
        if i >= 2 {
            encoded[i] ^= encoded[i - 2];
        }
    }
    Ok(encoded)
}

pub fn set_password_request(reference: u16, password: &str) -> Result<Pdu, S7Error> {
    let encoded = encode_password(password)?;
    Ok(request(
        reference,
        GROUP_SECURITY,
        SUB_SET_PASSWORD,
        Some(&encoded[..]),
    ))
}

pub fn clear_password_request(reference: u16) -> Pdu {
    request(reference, GROUP_SECURITY, SUB_CLEAR_PASSWORD, None)
}
