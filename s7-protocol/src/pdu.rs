//! S7 PDUs: the 10/12 byte header and the job functions (setup communication,
//! read/write variable, PLC control).
use crate::{
    error::{ErrorCode, S7Error, cpu_error},
    types::{AddressSpec, Area, MAX_VARS, TransportSize, WordLen, decode_start},
};

pub const PROTOCOL_ID: u8 = 0x32;

pub const FUNC_SETUP_COMMUNICATION: u8 = 0xF0;
pub const FUNC_READ_VAR: u8 = 0x04;
pub const FUNC_WRITE_VAR: u8 = 0x05;
pub const FUNC_PLC_CONTROL: u8 = 0x28;
pub const FUNC_PLC_STOP: u8 = 0x29;

/// Item return codes of read/write variable responses.
pub const ITEM_OK: u8 = 0xFF;
/// Return code field of the data items in a write request.
pub const ITEM_RESERVED: u8 = 0x00;
pub const ITEM_HARDWARE_FAULT: u8 = 0x01;
pub const ITEM_ACCESS_DENIED: u8 = 0x03;
pub const ITEM_ADDRESS_OUT_OF_RANGE: u8 = 0x05;
pub const ITEM_TYPE_NOT_SUPPORTED: u8 = 0x06;
pub const ITEM_TYPE_INCONSISTENT: u8 = 0x07;
pub const ITEM_NOT_AVAILABLE: u8 = 0x0A;

/// Status byte of a PLC control response when the CPU already was in the requested state.
pub const ALREADY_RUN: u8 = 0x02;
pub const ALREADY_STOP: u8 = 0x07;

const PROGRAM_SERVICE: &[u8] = b"P_PROGRAM";
const ITEM_SPEC_LEN: usize = 12;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PduType {
    Job,
    Ack,
    AckData,
    UserData,
}

impl PduType {
    pub fn code(self) -> u8 {
        match self {
            PduType::Job => 0x01,
            PduType::Ack => 0x02,
            PduType::AckData => 0x03,
            PduType::UserData => 0x07,
        }
    }

    pub fn from_code(code: u8) -> Option<PduType> {
        match code {
            0x01 => Some(PduType::Job),
            0x02 => Some(PduType::Ack),
            0x03 => Some(PduType::AckData),
            0x07 => Some(PduType::UserData),
            _ => None,
        }
    }

    /// Ack and AckData headers carry two additional error bytes.
    pub fn header_len(self) -> usize {
        match self {
            PduType::Ack | PduType::AckData => 12,
            PduType::Job | PduType::UserData => 10,
        }
    }
}

/// One S7 PDU as carried inside a COTP data TPDU.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pdu {
    pub pdu_type: PduType,
    /// Correlates a response with its request.
    pub reference: u16,
    /// Error class and code of Ack/AckData headers, zero otherwise.
    pub error: u16,
    pub params: Vec<u8>,
    pub data: Vec<u8>,
}

impl Pdu {
    pub fn job(reference: u16, params: Vec<u8>, data: Vec<u8>) -> Pdu {
        Pdu {
            pdu_type: PduType::Job,
            reference,
            error: 0,
            params,
            data,
        }
    }

    pub fn ack_data(reference: u16, error: u16, params: Vec<u8>, data: Vec<u8>) -> Pdu {
        Pdu {
            pdu_type: PduType::AckData,
            reference,
            error,
            params,
            data,
        }
    }

    pub fn user_data(reference: u16, params: Vec<u8>, data: Vec<u8>) -> Pdu {
        Pdu {
            pdu_type: PduType::UserData,
            reference,
            error: 0,
            params,
            data,
        }
    }

    /// Size of the encoded PDU.
    pub fn encoded_len(&self) -> usize {
        self.pdu_type.header_len() + self.params.len() + self.data.len()
    }

    /// Function code, the first parameter byte.
    pub fn function(&self) -> Option<u8> {
        self.params.first().copied()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&[PROTOCOL_ID, self.pdu_type.code(), 0x00, 0x00]);
        out.extend_from_slice(&self.reference.to_be_bytes());
        out.extend_from_slice(&(self.params.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        if self.pdu_type.header_len() == 12 {
            out.extend_from_slice(&self.error.to_be_bytes());
        }
        out.extend_from_slice(&self.params);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Pdu, S7Error> {
        if raw.len() < 10 {
            return Err(S7Error::invalid_pdu(format!(
                "S7 header needs 10 bytes, got {}",
                raw.len()
            )));
        }
        if raw[0] != PROTOCOL_ID {
            return Err(S7Error::invalid_pdu(format!(
                "unexpected protocol id {:#04x}",
                raw[0]
            )));
        }
        let pdu_type = PduType::from_code(raw[1])
            .ok_or_else(|| S7Error::invalid_pdu(format!("unknown PDU type {:#04x}", raw[1])))?;
        let header_len = pdu_type.header_len();
        if raw.len() < header_len {
            return Err(S7Error::invalid_pdu("truncated ack header"));
        }
        let reference = u16::from_be_bytes([raw[4], raw[5]]);
        let param_len = u16::from_be_bytes([raw[6], raw[7]]) as usize;
        let data_len = u16::from_be_bytes([raw[8], raw[9]]) as usize;
        let error = if header_len == 12 {
            u16::from_be_bytes([raw[10], raw[11]])
        } else {
            0
        };
        if header_len + param_len + data_len > raw.len() {
            return Err(S7Error::protocol(
                ErrorCode::ISO_INVALID_DATA_SIZE,
                format!(
                    "PDU announces {} parameter and {} data bytes, but only {} follow the header",
                    param_len,
                    data_len,
                    raw.len() - header_len
                ),
            ));
        }
        let params = raw[header_len..header_len + param_len].to_vec();
        let data = raw[header_len + param_len..header_len + param_len + data_len].to_vec();
        Ok(Pdu {
            pdu_type,
            reference,
            error,
            params,
            data,
        })
    }

    /// Checks the header error of an AckData answer and that it answers `function`.
    pub fn expect_ack(&self, function: u8) -> Result<(), S7Error> {
        if self.pdu_type != PduType::AckData {
            return Err(S7Error::invalid_answer(format!(
                "expected ack data, got {:?}",
                self.pdu_type
            )));
        }
        cpu_error(self.error)?;
        match self.function() {
            Some(f) if f == function => Ok(()),
            other => Err(S7Error::invalid_answer(format!(
                "expected function {:#04x}, got {:02x?}",
                function, other
            ))),
        }
    }
}

#[test]
fn header_layout() {
    let pdu = Pdu::job(0x0500, vec![0xF0, 0x00], vec![0xAA]);
    assert_eq!(
        pdu.encode(),
        vec![0x32, 0x01, 0x00, 0x00, 0x05, 0x00, 0x00, 0x02, 0x00, 0x01, 0xF0, 0x00, 0xAA]
    );
    let ack = Pdu::ack_data(7, 0x8104, vec![0x04, 0x01], vec![]);
    let encoded = ack.encode();
    assert_eq!(encoded[10..12], [0x81, 0x04]);
    assert_eq!(Pdu::decode(&encoded).unwrap(), ack);
}

#[test]
fn truncated_pdu() {
    let mut raw = Pdu::job(1, vec![0x04, 0x01], vec![]).encode();
    raw.pop();
    assert!(Pdu::decode(&raw).is_err());
    assert!(Pdu::decode(&[0x33; 10]).is_err());
}

/// Setup communication request asking for `pdu_size` bytes.
pub fn setup_communication(reference: u16, pdu_size: u16) -> Pdu {
    let mut params = vec![FUNC_SETUP_COMMUNICATION, 0x00, 0x00, 0x01, 0x00, 0x01];
    params.extend_from_slice(&pdu_size.to_be_bytes());
    Pdu::job(reference, params, Vec::new())
}

/// Answer to a setup communication request, echoing the request with the granted size.
pub fn setup_communication_response(request: &Pdu, pdu_size: u16) -> Pdu {
    let mut params = request.params.clone();
    params.resize(8, 0);
    params[6..8].copy_from_slice(&pdu_size.to_be_bytes());
    Pdu::ack_data(request.reference, 0, params, Vec::new())
}

/// The PDU size granted by the peer.
pub fn parse_setup_communication(pdu: &Pdu) -> Result<u16, S7Error> {
    pdu.expect_ack(FUNC_SETUP_COMMUNICATION)
        .map_err(|err| S7Error::protocol(ErrorCode::NEGOTIATING_PDU, err.to_string()))?;
    match pdu.params.get(6..8) {
        Some(&[hi, lo]) if u16::from_be_bytes([hi, lo]) > 0 => Ok(u16::from_be_bytes([hi, lo])),
        _ => Err(S7Error::protocol(
            ErrorCode::NEGOTIATING_PDU,
            "setup communication answer carries no PDU size",
        )),
    }
}

/// Requested PDU size of a setup communication job.
pub fn requested_pdu_size(pdu: &Pdu) -> Result<u16, S7Error> {
    match pdu.params.get(6..8) {
        Some(&[hi, lo]) => Ok(u16::from_be_bytes([hi, lo])),
        _ => Err(S7Error::invalid_pdu("setup communication without PDU size")),
    }
}

/// Appends the 12 byte any-pointer describing `spec`.
pub fn encode_item_spec(spec: &AddressSpec, out: &mut Vec<u8>) {
    out.extend_from_slice(&[0x12, 0x0A, 0x10, spec.word_len.code()]);
    out.extend_from_slice(&spec.amount.to_be_bytes());
    out.extend_from_slice(&spec.db_number.to_be_bytes());
    out.push(spec.area.code());
    out.extend_from_slice(&spec.wire_address().to_be_bytes()[1..]);
}

/// Parses one any-pointer. Failures carry the item return code to answer with.
pub fn decode_item_spec(raw: &[u8]) -> Result<AddressSpec, u8> {
    let &[0x12, 0x0A, 0x10, word_len, a0, a1, d0, d1, area, s0, s1, s2] = raw else {
        return Err(ITEM_ADDRESS_OUT_OF_RANGE);
    };
    let word_len = WordLen::from_code(word_len).ok_or(ITEM_TYPE_NOT_SUPPORTED)?;
    let area = Area::from_code(area).ok_or(ITEM_NOT_AVAILABLE)?;
    let start = decode_start(word_len, u32::from_be_bytes([0, s0, s1, s2]));
    Ok(AddressSpec::new(
        area,
        u16::from_be_bytes([d0, d1]),
        start,
        word_len,
        u16::from_be_bytes([a0, a1]),
    ))
}

fn check_item_count(count: usize) -> Result<(), S7Error> {
    if count > MAX_VARS {
        return Err(S7Error::Client(ErrorCode::TOO_MANY_ITEMS));
    }
    Ok(())
}

/// Read variable job for up to [MAX_VARS] items.
pub fn read_request(reference: u16, specs: &[AddressSpec]) -> Result<Pdu, S7Error> {
    check_item_count(specs.len())?;
    let mut params = Vec::with_capacity(2 + specs.len() * ITEM_SPEC_LEN);
    params.extend_from_slice(&[FUNC_READ_VAR, specs.len() as u8]);
    for spec in specs {
        encode_item_spec(spec, &mut params);
    }
    Ok(Pdu::job(reference, params, Vec::new()))
}

/// Write variable job for up to [MAX_VARS] items.
pub fn write_request(reference: u16, items: &[(AddressSpec, &[u8])]) -> Result<Pdu, S7Error> {
    check_item_count(items.len())?;
    let mut params = Vec::with_capacity(2 + items.len() * ITEM_SPEC_LEN);
    params.extend_from_slice(&[FUNC_WRITE_VAR, items.len() as u8]);
    let mut data = Vec::new();
    for (index, (spec, payload)) in items.iter().enumerate() {
        encode_item_spec(spec, &mut params);
        let transport = spec.word_len.transport_size();
        data.extend_from_slice(&[ITEM_RESERVED, transport.code()]);
        data.extend_from_slice(&transport.encode_length(payload.len()).to_be_bytes());
        data.extend_from_slice(payload);
        if payload.len() % 2 == 1 && index + 1 < items.len() {
            data.push(0x00);
        }
    }
    Ok(Pdu::job(reference, params, data))
}

/// One data item of a read response or write request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataField {
    /// Return code in responses, reserved (zero) in requests.
    pub code: u8,
    pub transport: u8,
    pub payload: Vec<u8>,
}

/// Splits the data section into `count` items, honouring fill bytes.
pub fn parse_data_fields(data: &[u8], count: usize) -> Result<Vec<DataField>, S7Error> {
    let mut fields = Vec::with_capacity(count);
    let mut offset = 0;
    for index in 0..count {
        let Some(&[code, transport, l0, l1]) = data.get(offset..offset + 4) else {
            return Err(S7Error::invalid_answer(format!(
                "data item {} of {} is truncated",
                index + 1,
                count
            )));
        };
        offset += 4;
        let len = match TransportSize::from_code(transport) {
            Some(ts) => ts.decode_length(u16::from_be_bytes([l0, l1])),
            // failed items carry no transport size and no payload
            None if code != ITEM_OK && code != ITEM_RESERVED => 0,
            None => {
                return Err(S7Error::protocol(
                    ErrorCode::INVALID_TRANSPORT_SIZE,
                    format!("unknown transport size {:#04x}", transport),
                ));
            }
        };
        let payload = data
            .get(offset..offset + len)
            .ok_or_else(|| S7Error::invalid_answer(format!("payload of item {} is truncated", index + 1)))?
            .to_vec();
        offset += len;
        if len % 2 == 1 && index + 1 < count {
            offset += 1;
        }
        fields.push(DataField {
            code,
            transport,
            payload,
        });
    }
    Ok(fields)
}

fn item_result(code: u8) -> Result<(), S7Error> {
    if code == ITEM_OK {
        Ok(())
    } else {
        cpu_error(code as u16)
    }
}

/// Per item outcome of a read response.
pub fn parse_read_response(pdu: &Pdu, count: usize) -> Result<Vec<Result<Vec<u8>, S7Error>>, S7Error> {
    pdu.expect_ack(FUNC_READ_VAR)?;
    if pdu.params.get(1).copied() != Some(count as u8) {
        return Err(S7Error::invalid_answer(format!(
            "expected {} items, got {:?}",
            count,
            pdu.params.get(1)
        )));
    }
    Ok(parse_data_fields(&pdu.data, count)?
        .into_iter()
        .map(|field| item_result(field.code).map(|()| field.payload))
        .collect())
}

/// Per item outcome of a write response.
pub fn parse_write_response(pdu: &Pdu, count: usize) -> Result<Vec<Result<(), S7Error>>, S7Error> {
    pdu.expect_ack(FUNC_WRITE_VAR)?;
    if pdu.data.len() < count {
        return Err(S7Error::invalid_answer(format!(
            "expected {} return codes, got {}",
            count,
            pdu.data.len()
        )));
    }
    Ok(pdu.data[..count].iter().map(|code| item_result(*code)).collect())
}

/// Builds the data section of a read response from per item results.
pub fn read_response_data(items: &[(WordLen, Result<Vec<u8>, u8>)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (index, (word_len, item)) in items.iter().enumerate() {
        match item {
            Ok(payload) => {
                let transport = word_len.transport_size();
                data.extend_from_slice(&[ITEM_OK, transport.code()]);
                data.extend_from_slice(&transport.encode_length(payload.len()).to_be_bytes());
                data.extend_from_slice(payload);
                if payload.len() % 2 == 1 && index + 1 < items.len() {
                    data.push(0x00);
                }
            }
            Err(code) => data.extend_from_slice(&[*code, 0x00, 0x00, 0x00]),
        }
    }
    data
}

/// A parsed job, as seen by a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Job {
    SetupCommunication { pdu_size: u16 },
    Read(Vec<Result<AddressSpec, u8>>),
    Write(Vec<(Result<AddressSpec, u8>, Vec<u8>)>),
    Start { cold: bool },
    Stop,
    Unsupported(u8),
}

/// Parses the parameters (and data) of a job PDU.
pub fn parse_job(pdu: &Pdu) -> Result<Job, S7Error> {
    let function = pdu
        .function()
        .ok_or_else(|| S7Error::invalid_pdu("job without parameters"))?;
    match function {
        FUNC_SETUP_COMMUNICATION => Ok(Job::SetupCommunication {
            pdu_size: requested_pdu_size(pdu)?,
        }),
        FUNC_READ_VAR => Ok(Job::Read(item_specs(pdu)?)),
        FUNC_WRITE_VAR => {
            let specs = item_specs(pdu)?;
            let fields = parse_data_fields(&pdu.data, specs.len())?;
            Ok(Job::Write(
                specs
                    .into_iter()
                    .zip(fields)
                    .map(|(spec, field)| (spec, field.payload))
                    .collect(),
            ))
        }
        FUNC_PLC_CONTROL => {
            let arg_len = match pdu.params.get(8..10) {
                Some(&[hi, lo]) => u16::from_be_bytes([hi, lo]) as usize,
                _ => 0,
            };
            let cold = arg_len > 0 && pdu.params.get(10) == Some(&b'C');
            Ok(Job::Start { cold })
        }
        FUNC_PLC_STOP => Ok(Job::Stop),
        other => Ok(Job::Unsupported(other)),
    }
}

fn item_specs(pdu: &Pdu) -> Result<Vec<Result<AddressSpec, u8>>, S7Error> {
    let count = pdu.params.get(1).copied().unwrap_or(0) as usize;
    if count > MAX_VARS {
        return Err(S7Error::Client(ErrorCode::TOO_MANY_ITEMS));
    }
    let specs = pdu.params.get(2..).unwrap_or_default();
    if specs.len() < count * ITEM_SPEC_LEN {
        return Err(S7Error::invalid_pdu(format!(
            "{} item specs announced, {} bytes present",
            count,
            specs.len()
        )));
    }
    Ok(specs
        .chunks(ITEM_SPEC_LEN)
        .take(count)
        .map(decode_item_spec)
        .collect())
}

pub fn hot_start(reference: u16) -> Pdu {
    let mut params = vec![FUNC_PLC_CONTROL, 0, 0, 0, 0, 0, 0, 0xFD, 0x00, 0x00];
    params.push(PROGRAM_SERVICE.len() as u8);
    params.extend_from_slice(PROGRAM_SERVICE);
    Pdu::job(reference, params, Vec::new())
}

pub fn cold_start(reference: u16) -> Pdu {
    let mut params = vec![FUNC_PLC_CONTROL, 0, 0, 0, 0, 0, 0, 0xFD, 0x00, 0x02, b'C', b' '];
    params.push(PROGRAM_SERVICE.len() as u8);
    params.extend_from_slice(PROGRAM_SERVICE);
    Pdu::job(reference, params, Vec::new())
}

pub fn plc_stop(reference: u16) -> Pdu {
    let mut params = vec![FUNC_PLC_STOP, 0, 0, 0, 0, 0];
    params.push(PROGRAM_SERVICE.len() as u8);
    params.extend_from_slice(PROGRAM_SERVICE);
    Pdu::job(reference, params, Vec::new())
}

/// Answer to a start or stop job; `status` is zero or [ALREADY_RUN]/[ALREADY_STOP].
pub fn control_response(request: &Pdu, status: u8) -> Pdu {
    let function = request.function().unwrap_or(FUNC_PLC_CONTROL);
    Pdu::ack_data(request.reference, 0, vec![function, status], Vec::new())
}

/// Interprets the answer to a start (`0x28`) or stop (`0x29`) job.
pub fn parse_control_response(pdu: &Pdu, function: u8) -> Result<(), S7Error> {
    let refused = if function == FUNC_PLC_STOP {
        ErrorCode::CANNOT_STOP_PLC
    } else {
        ErrorCode::CANNOT_START_PLC
    };
    if pdu.pdu_type == PduType::AckData && pdu.error != 0 {
        return Err(S7Error::Plc {
            raw: pdu.error,
            code: refused,
        });
    }
    pdu.expect_ack(function)?;
    match (function, pdu.params.get(1).copied()) {
        (FUNC_PLC_CONTROL, Some(ALREADY_RUN)) => Err(S7Error::Plc {
            raw: ALREADY_RUN as u16,
            code: ErrorCode::ALREADY_RUN,
        }),
        (FUNC_PLC_STOP, Some(ALREADY_STOP)) => Err(S7Error::Plc {
            raw: ALREADY_STOP as u16,
            code: ErrorCode::ALREADY_STOP,
        }),
        _ => Ok(()),
    }
}

/// Generic error answer, used for functions a server does not implement.
pub fn error_response(request: &Pdu, error: u16) -> Pdu {
    let function = request.function().unwrap_or(0);
    Pdu::ack_data(request.reference, error, vec![function, 0x00], Vec::new())
}

/// Partner (peer to peer) data PDU type.
pub const PARTNER_DATA: u8 = 0x07;
/// Partner acknowledgement PDU type.
pub const PARTNER_ACK: u8 = 0x08;

/// Wraps `data` for a partner exchange: `32 07 len(2) 00 00 data`.
pub fn partner_data(data: &[u8]) -> Result<Vec<u8>, S7Error> {
    let len = u16::try_from(data.len())
        .map_err(|_| S7Error::Client(ErrorCode::SIZE_OVER_PDU))?;
    let mut pdu = Vec::with_capacity(6 + data.len());
    pdu.extend_from_slice(&[PROTOCOL_ID, PARTNER_DATA]);
    pdu.extend_from_slice(&len.to_be_bytes());
    pdu.extend_from_slice(&[0x00, 0x00]);
    pdu.extend_from_slice(data);
    Ok(pdu)
}

pub fn parse_partner_data(pdu: &[u8]) -> Result<Vec<u8>, S7Error> {
    let &[PROTOCOL_ID, PARTNER_DATA, l0, l1, _, _, ref data @ ..] = pdu else {
        return Err(S7Error::invalid_pdu(format!(
            "invalid partner data PDU {:02x?}",
            &pdu[..pdu.len().min(6)]
        )));
    };
    let len = (u16::from_be_bytes([l0, l1]) as usize).min(data.len());
    Ok(data[..len].to_vec())
}

pub fn partner_ack(status: u16) -> Vec<u8> {
    let mut pdu = vec![PROTOCOL_ID, PARTNER_ACK, 0x00, 0x00];
    pdu.extend_from_slice(&status.to_be_bytes());
    pdu
}

/// Checks an acknowledgement; a non-zero status is reported as a PLC error.
pub fn parse_partner_ack(pdu: &[u8]) -> Result<(), S7Error> {
    match pdu {
        &[_, PARTNER_ACK, _, _, s0, s1, ..] => cpu_error(u16::from_be_bytes([s0, s1])),
        &[_, other, _, _, _, _, ..] => Err(S7Error::invalid_answer(format!(
            "expected partner ACK, got {:#04x}",
            other
        ))),
        _ => Err(S7Error::invalid_answer("partner ACK too short")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn db_bytes(start: u32, amount: u16) -> AddressSpec {
        AddressSpec::new(Area::DB, 1, start, WordLen::Byte, amount)
    }

    #[test]
    fn setup_communication_layout() {
        let pdu = setup_communication(0x0100, 480);
        assert_eq!(pdu.params, vec![0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x01, 0xE0]);
        let response = setup_communication_response(&pdu, 240);
        assert_eq!(parse_setup_communication(&response).unwrap(), 240);
        assert_eq!(parse_job(&pdu).unwrap(), Job::SetupCommunication { pdu_size: 480 });
    }

    #[test]
    fn item_spec_layout() {
        let mut out = Vec::new();
        encode_item_spec(&db_bytes(10, 4), &mut out);
        assert_eq!(
            out,
            vec![0x12, 0x0A, 0x10, 0x02, 0x00, 0x04, 0x00, 0x01, 0x84, 0x00, 0x00, 0x50]
        );
        assert_eq!(decode_item_spec(&out), Ok(db_bytes(10, 4)));
    }

    #[test]
    fn unknown_transport_size_needs_an_error_code() {
        let failed = parse_data_fields(&[ITEM_NOT_AVAILABLE, 0x00, 0x00, 0x00], 1).unwrap();
        assert_eq!(failed[0].payload, Vec::<u8>::new());

        let mut request = write_request(1, &[(db_bytes(0, 2), &[1, 2][..])]).unwrap();
        request.data[1] = 0x0B;
        match parse_job(&request) {
            Err(S7Error::Protocol { code, .. }) => {
                assert_eq!(code, ErrorCode::INVALID_TRANSPORT_SIZE)
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
        match parse_data_fields(&[ITEM_OK, 0x0B, 0x00, 0x10], 1) {
            Err(S7Error::Protocol { code, .. }) => {
                assert_eq!(code, ErrorCode::INVALID_TRANSPORT_SIZE)
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn bit_address_is_not_shifted() {
        let spec = AddressSpec::new(Area::MK, 0, 8 * 3 + 5, WordLen::Bit, 1);
        let mut out = Vec::new();
        encode_item_spec(&spec, &mut out);
        assert_eq!(out[9..12], [0x00, 0x00, 29]);
        assert_eq!(decode_item_spec(&out), Ok(spec));
    }

    #[test]
    fn malformed_item_specs() {
        assert_eq!(decode_item_spec(&[0x12, 0x0A]), Err(ITEM_ADDRESS_OUT_OF_RANGE));
        let mut out = Vec::new();
        encode_item_spec(&db_bytes(0, 1), &mut out);
        out[8] = 0x99;
        assert_eq!(decode_item_spec(&out), Err(ITEM_NOT_AVAILABLE));
        out[3] = 0x42;
        assert_eq!(decode_item_spec(&out), Err(ITEM_TYPE_NOT_SUPPORTED));
    }

    #[test]
    fn too_many_items() {
        let specs = vec![db_bytes(0, 1); MAX_VARS + 1];
        match read_request(1, &specs) {
            Err(S7Error::Client(code)) => assert_eq!(code, ErrorCode::TOO_MANY_ITEMS),
            other => panic!("expected client error, got {:?}", other),
        }
    }

    #[test]
    fn read_response_with_fill_bytes() {
        let request = read_request(3, &[db_bytes(0, 3), db_bytes(10, 2)]).unwrap();
        let data = read_response_data(&[
            (WordLen::Byte, Ok(vec![1, 2, 3])),
            (WordLen::Byte, Ok(vec![4, 5])),
        ]);
        assert_eq!(data.len(), 4 + 3 + 1 + 4 + 2);
        let response = Pdu::ack_data(3, 0, vec![FUNC_READ_VAR, 2], data);
        let items = parse_read_response(&response, 2).unwrap();
        assert_eq!(items, vec![Ok(vec![1, 2, 3]), Ok(vec![4, 5])]);
        assert_eq!(request.params.len(), 2 + 2 * 12);
    }

    #[test]
    fn read_response_partial_failure() {
        let data = read_response_data(&[
            (WordLen::Byte, Err(ITEM_ADDRESS_OUT_OF_RANGE)),
            (WordLen::Word, Ok(vec![0, 7])),
        ]);
        let response = Pdu::ack_data(3, 0, vec![FUNC_READ_VAR, 2], data);
        let items = parse_read_response(&response, 2).unwrap();
        assert_eq!(items[0].as_ref().unwrap_err().code(), ErrorCode::ADDRESS_OUT_OF_RANGE);
        assert_eq!(items[1], Ok(vec![0, 7]));
    }

    #[test]
    fn write_request_round_trips_through_job_parser() {
        let pdu = write_request(9, &[(db_bytes(0, 1), &[0xAA][..]), (db_bytes(4, 2), &[1, 2][..])])
            .unwrap();
        assert_eq!(pdu.data, vec![0, 4, 0, 8, 0xAA, 0, 0, 4, 0, 16, 1, 2]);
        match parse_job(&pdu).unwrap() {
            Job::Write(items) => {
                assert_eq!(items[0], (Ok(db_bytes(0, 1)), vec![0xAA]));
                assert_eq!(items[1], (Ok(db_bytes(4, 2)), vec![1, 2]));
            }
            other => panic!("expected write job, got {:?}", other),
        }
    }

    #[test]
    fn write_response() {
        let response = Pdu::ack_data(1, 0, vec![FUNC_WRITE_VAR, 2], vec![ITEM_OK, ITEM_NOT_AVAILABLE]);
        let results = parse_write_response(&response, 2).unwrap();
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().code(), ErrorCode::ITEM_NOT_AVAILABLE);
    }

    #[test]
    fn header_error_is_translated() {
        let response = Pdu::ack_data(1, 0x8500, vec![FUNC_READ_VAR, 1], vec![]);
        match parse_read_response(&response, 1) {
            Err(S7Error::Plc { raw, code }) => {
                assert_eq!(raw, 0x8500);
                assert_eq!(code, ErrorCode::SIZE_OVER_PDU);
            }
            other => panic!("expected PLC error, got {:?}", other),
        }
    }

    #[test]
    fn control_jobs() {
        assert_eq!(parse_job(&hot_start(1)).unwrap(), Job::Start { cold: false });
        assert_eq!(parse_job(&cold_start(1)).unwrap(), Job::Start { cold: true });
        assert_eq!(parse_job(&plc_stop(1)).unwrap(), Job::Stop);
        assert_eq!(&hot_start(1).params[11..], b"P_PROGRAM");

        let already = control_response(&plc_stop(1), ALREADY_STOP);
        match parse_control_response(&already, FUNC_PLC_STOP) {
            Err(S7Error::Plc { code, .. }) => assert_eq!(code, ErrorCode::ALREADY_STOP),
            other => panic!("expected already stopped, got {:?}", other),
        }
        let ok = control_response(&hot_start(1), 0);
        assert!(parse_control_response(&ok, FUNC_PLC_CONTROL).is_ok());
    }

    #[test]
    fn partner_pdus() {
        let pdu = partner_data(b"hello").unwrap();
        assert_eq!(pdu[..6], [0x32, 0x07, 0x00, 0x05, 0x00, 0x00]);
        assert_eq!(parse_partner_data(&pdu).unwrap(), b"hello".to_vec());
        assert!(parse_partner_data(&[0x32, 0x08, 0, 0, 0, 0]).is_err());
        assert_eq!(partner_ack(0), vec![0x32, 0x08, 0x00, 0x00, 0x00, 0x00]);
        assert!(parse_partner_ack(&partner_ack(0)).is_ok());
        assert!(parse_partner_ack(&pdu).is_err());
        assert!(parse_partner_ack(&[0x32, 0x08]).is_err());
    }

    #[test]
    fn unsupported_function() {
        let pdu = Pdu::job(1, vec![0x1A, 0x00], vec![]);
        assert_eq!(parse_job(&pdu).unwrap(), Job::Unsupported(0x1A));
        let response = error_response(&pdu, 0x8104);
        match response.expect_ack(0x1A) {
            Err(S7Error::Plc { code, .. }) => assert_eq!(code, ErrorCode::FUN_NOT_AVAILABLE),
            other => panic!("expected PLC error, got {:?}", other),
        }
    }
}
