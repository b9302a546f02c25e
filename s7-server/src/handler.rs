//! Answers the S7 PDUs of one connection.
use std::{collections::VecDeque, net::IpAddr};

use chrono::{Local, TimeDelta};
use s7_protocol::{
    pdu::{
        self, ALREADY_RUN, ALREADY_STOP, FUNC_READ_VAR, FUNC_WRITE_VAR, ITEM_OK, Job, Pdu,
        PduType,
    },
    types::{AddressSpec, BlockType, CpuStatus, WordLen},
    userdata::{
        self, BlocksList, GROUP_BLOCKS, GROUP_CLOCK, GROUP_SECURITY, GROUP_SZL,
        SUB_CLEAR_PASSWORD, SUB_LIST_BLOCKS, SUB_LIST_BLOCKS_OF_TYPE, SUB_READ_CLOCK,
        SUB_READ_SZL, SUB_SET_CLOCK, SUB_SET_PASSWORD, SZL_COMPONENT_ID, SZL_CPU_STATE,
        SZL_ID_LIST, SZL_ORDER_CODE, UserData, UserDataParams,
    },
};

use crate::{
    event::{
        CLOCK, CONTROL, DATA_READ, DATA_WRITE, DIRECTORY, Event, NEGOTIATE_PDU, PDU_INCOMING,
        READ_SZL, SECURITY,
    },
    server::Shared,
};

/// Function not available.
pub const ERR_FUNCTION: u16 = 0x8104;
/// Answer does not fit the negotiated PDU.
pub const ERR_PDU_SIZE: u16 = 0x8500;
/// Requested object does not exist.
pub const ERR_NOT_AVAILABLE: u16 = 0xD209;
pub const ERR_INVALID_PASSWORD: u16 = 0xD602;
pub const ERR_NO_PASSWORD: u16 = 0xD605;
pub const ERR_INVALID_VALUE: u16 = 0xDC01;

/// S7 header, user data parameters and the data header of a user data answer.
const USER_DATA_OVERHEAD: usize = 10 + 12 + 4;

const SZL_IDS: [u16; 4] = [SZL_ID_LIST, SZL_ORDER_CODE, SZL_COMPONENT_ID, SZL_CPU_STATE];

/// Remaining parts of a user data answer that did not fit one PDU.
#[derive(Debug)]
struct Pending {
    group: u8,
    subfunction: u8,
    sequence: u8,
    parts: VecDeque<Vec<u8>>,
}

/// Per connection state: negotiated PDU length and any pending multi part answer.
#[derive(Debug)]
pub(crate) struct Session<'a> {
    shared: &'a Shared,
    peer: Option<IpAddr>,
    pdu_length: u16,
    pending: Option<Pending>,
    sequence: u8,
}

impl<'a> Session<'a> {
    pub fn new(shared: &'a Shared, peer: Option<IpAddr>) -> Session<'a> {
        Session {
            shared,
            peer,
            pdu_length: shared.config().max_pdu,
            pending: None,
            sequence: 0,
        }
    }

    fn event(&self, code: u32, ret_code: u16, params: [u16; 4]) {
        self.shared
            .events
            .push(Event::new(self.peer, code, ret_code, params));
    }

    /// Answers one raw S7 PDU. Malformed requests get an error answer.
    pub fn handle_pdu(&mut self, raw: &[u8]) -> Pdu {
        log::trace!("Incoming PDU: {:02x?}", raw);
        self.event(PDU_INCOMING, 0, [0; 4]);
        let request = match Pdu::decode(raw) {
            Ok(request) => request,
            Err(err) => {
                log::warn!("Cannot decode request: {}", err);
                let reference = match raw.get(4..6) {
                    Some(&[hi, lo]) => u16::from_be_bytes([hi, lo]),
                    _ => 0,
                };
                return Pdu::ack_data(reference, ERR_FUNCTION, Vec::new(), Vec::new());
            }
        };
        match request.pdu_type {
            PduType::Job => self.handle_job(&request),
            PduType::UserData => self.handle_user_data(&request),
            other => {
                log::warn!("Unexpected {:?} PDU from client", other);
                pdu::error_response(&request, ERR_FUNCTION)
            }
        }
    }

    fn handle_job(&mut self, request: &Pdu) -> Pdu {
        let job = match pdu::parse_job(request) {
            Ok(job) => job,
            Err(err) => {
                log::warn!("Rejecting malformed job: {}", err);
                return pdu::error_response(request, ERR_FUNCTION);
            }
        };
        match job {
            Job::SetupCommunication { pdu_size } => {
                let max = self.shared.config().max_pdu;
                let granted = if pdu_size == 0 { max } else { pdu_size.min(max) };
                log::debug!("Received setup communication: requested={}, granted={}", pdu_size, granted);
                self.pdu_length = granted;
                self.event(NEGOTIATE_PDU, 0, [pdu_size, granted, 0, 0]);
                pdu::setup_communication_response(request, granted)
            }
            Job::Read(specs) => self.read(request, specs),
            Job::Write(items) => self.write(request, items),
            Job::Start { cold } => {
                let status = {
                    let mut cpu = self.shared.lock_cpu();
                    if *cpu == CpuStatus::Run {
                        ALREADY_RUN
                    } else {
                        *cpu = CpuStatus::Run;
                        0
                    }
                };
                log::info!("Received {} start, status={}", if cold { "cold" } else { "hot" }, status);
                self.event(CONTROL, status as u16, [if cold { 2 } else { 1 }, 0, 0, 0]);
                pdu::control_response(request, status)
            }
            Job::Stop => {
                let status = {
                    let mut cpu = self.shared.lock_cpu();
                    if *cpu == CpuStatus::Stop {
                        ALREADY_STOP
                    } else {
                        *cpu = CpuStatus::Stop;
                        0
                    }
                };
                log::info!("Received stop, status={}", status);
                self.event(CONTROL, status as u16, [0; 4]);
                pdu::control_response(request, status)
            }
            Job::Unsupported(function) => {
                log::debug!("Unsupported job function {:#04x}", function);
                pdu::error_response(request, ERR_FUNCTION)
            }
        }
    }

    fn read(&mut self, request: &Pdu, specs: Vec<Result<AddressSpec, u8>>) -> Pdu {
        log::debug!("Received read request with {} items", specs.len());
        let items: Vec<(WordLen, Result<Vec<u8>, u8>)> = specs
            .iter()
            .map(|spec| match spec {
                Ok(spec) => {
                    let result = self.shared.areas.read_item(spec);
                    self.event(
                        DATA_READ,
                        result.as_ref().err().map_or(0, |code| *code as u16),
                        [
                            spec.area.code() as u16,
                            spec.start as u16,
                            spec.amount,
                            spec.db_number,
                        ],
                    );
                    (spec.word_len, result)
                }
                Err(code) => {
                    self.event(DATA_READ, *code as u16, [0; 4]);
                    (WordLen::Byte, Err(*code))
                }
            })
            .collect();
        let response = Pdu::ack_data(
            request.reference,
            0,
            vec![FUNC_READ_VAR, items.len() as u8],
            pdu::read_response_data(&items),
        );
        if response.encoded_len() > self.pdu_length as usize {
            log::warn!(
                "Read answer of {} bytes exceeds the PDU length {}",
                response.encoded_len(),
                self.pdu_length
            );
            return pdu::error_response(request, ERR_PDU_SIZE);
        }
        response
    }

    fn write(
        &mut self,
        request: &Pdu,
        items: Vec<(Result<AddressSpec, u8>, Vec<u8>)>,
    ) -> Pdu {
        log::debug!("Received write request with {} items", items.len());
        let codes: Vec<u8> = items
            .iter()
            .map(|(spec, payload)| match spec {
                Ok(spec) => {
                    let code = match self.shared.areas.write_item(spec, payload) {
                        Ok(()) => ITEM_OK,
                        Err(code) => code,
                    };
                    self.event(
                        DATA_WRITE,
                        if code == ITEM_OK { 0 } else { code as u16 },
                        [
                            spec.area.code() as u16,
                            spec.start as u16,
                            spec.amount,
                            spec.db_number,
                        ],
                    );
                    code
                }
                Err(code) => {
                    self.event(DATA_WRITE, *code as u16, [0; 4]);
                    *code
                }
            })
            .collect();
        Pdu::ack_data(
            request.reference,
            0,
            vec![FUNC_WRITE_VAR, codes.len() as u8],
            codes,
        )
    }

    fn handle_user_data(&mut self, request: &Pdu) -> Pdu {
        let request = match UserData::decode(request) {
            Ok(request) => request,
            Err(err) => {
                log::warn!("Rejecting malformed user data: {}", err);
                return pdu::error_response(request, ERR_FUNCTION);
            }
        };
        let params = request.params;
        log::debug!(
            "Received user data: group={}, subfunction={}, sequence={}",
            params.group,
            params.subfunction,
            params.sequence
        );
        if params.continuation {
            return self.continue_answer(&request);
        }
        self.pending = None;
        match (params.group, params.subfunction) {
            (GROUP_SZL, SUB_READ_SZL) => self.read_szl(&request),
            (GROUP_CLOCK, SUB_READ_CLOCK) => {
                let now = Local::now().naive_local();
                let offset = *self.shared.lock_clock_offset();
                let value = now.checked_add_signed(offset).unwrap_or(now);
                self.event(CLOCK, 0, [0; 4]);
                match userdata::clock_payload(value) {
                    Ok(payload) => self.answer(&request, payload),
                    Err(err) => {
                        log::warn!("Cannot encode clock {}: {}", value, err);
                        self.error(&request, ERR_INVALID_VALUE)
                    }
                }
            }
            (GROUP_CLOCK, SUB_SET_CLOCK) => match userdata::parse_clock(&request.payload) {
                Ok(value) => {
                    let offset: TimeDelta = value.signed_duration_since(Local::now().naive_local());
                    *self.shared.lock_clock_offset() = offset;
                    log::info!("Clock set to {}", value);
                    self.event(CLOCK, 0, [1, 0, 0, 0]);
                    self.answer(&request, Vec::new())
                }
                Err(err) => {
                    log::warn!("Rejecting clock value: {}", err);
                    self.event(CLOCK, ERR_INVALID_VALUE, [1, 0, 0, 0]);
                    self.error(&request, ERR_INVALID_VALUE)
                }
            },
            (GROUP_SECURITY, SUB_SET_PASSWORD) => {
                match <[u8; 8]>::try_from(request.payload.as_slice()) {
                    Ok(password) => {
                        *self.shared.lock_password() = Some(password);
                        self.event(SECURITY, 0, [0; 4]);
                        self.answer(&request, Vec::new())
                    }
                    Err(_) => {
                        self.event(SECURITY, ERR_INVALID_PASSWORD, [0; 4]);
                        self.error(&request, ERR_INVALID_PASSWORD)
                    }
                }
            }
            (GROUP_SECURITY, SUB_CLEAR_PASSWORD) => {
                if self.shared.lock_password().take().is_some() {
                    self.event(SECURITY, 0, [1, 0, 0, 0]);
                    self.answer(&request, Vec::new())
                } else {
                    self.event(SECURITY, ERR_NO_PASSWORD, [1, 0, 0, 0]);
                    self.error(&request, ERR_NO_PASSWORD)
                }
            }
            (GROUP_BLOCKS, SUB_LIST_BLOCKS) => {
                let list = BlocksList {
                    db: self.shared.areas.db_numbers().len() as u16,
                    ..BlocksList::default()
                };
                self.event(DIRECTORY, 0, [0; 4]);
                self.answer(&request, list.encode())
            }
            (GROUP_BLOCKS, SUB_LIST_BLOCKS_OF_TYPE) => {
                match userdata::parse_list_blocks_of_type(&request.payload) {
                    Ok(block_type) => {
                        let numbers = match block_type {
                            BlockType::DB => self.shared.areas.db_numbers(),
                            _ => Vec::new(),
                        };
                        self.event(DIRECTORY, 0, [block_type.code() as u16, 0, 0, 0]);
                        self.answer(&request, userdata::block_numbers_payload(&numbers))
                    }
                    Err(_) => {
                        self.event(DIRECTORY, ERR_NOT_AVAILABLE, [0; 4]);
                        self.error(&request, ERR_NOT_AVAILABLE)
                    }
                }
            }
            (group, subfunction) => {
                log::debug!("Unsupported user data group {} function {}", group, subfunction);
                self.error(&request, ERR_FUNCTION)
            }
        }
    }

    fn read_szl(&mut self, request: &UserData) -> Pdu {
        let (id, index) = match userdata::parse_szl_request(&request.payload) {
            Ok(ids) => ids,
            Err(_) => {
                self.event(READ_SZL, ERR_NOT_AVAILABLE, [0; 4]);
                return self.error(request, ERR_NOT_AVAILABLE);
            }
        };
        let (record_len, records) = match id {
            SZL_ID_LIST => (2, SZL_IDS.iter().flat_map(|id| id.to_be_bytes()).collect()),
            SZL_ORDER_CODE => (28, self.shared.config().order_code.to_szl()),
            SZL_COMPONENT_ID => (34, self.shared.config().cpu_info.to_szl()),
            SZL_CPU_STATE => (20, userdata::cpu_state_record(*self.shared.lock_cpu())),
            _ => {
                log::debug!("SZL {:#06x} is not available", id);
                self.event(READ_SZL, ERR_NOT_AVAILABLE, [id, index, 0, 0]);
                return self.error(request, ERR_NOT_AVAILABLE);
            }
        };
        self.event(READ_SZL, 0, [id, index, 0, 0]);
        self.answer(request, userdata::szl_payload(id, index, record_len, &records))
    }

    /// Sends `payload`, split into as many parts as the PDU length requires.
    fn answer(&mut self, request: &UserData, payload: Vec<u8>) -> Pdu {
        let chunk = (self.pdu_length as usize)
            .saturating_sub(USER_DATA_OVERHEAD)
            .max(1);
        if payload.len() <= chunk {
            return self.reply(request, 0, false, 0, &payload);
        }
        let mut parts: VecDeque<Vec<u8>> = payload.chunks(chunk).map(<[u8]>::to_vec).collect();
        let first = parts.pop_front().unwrap_or_default();
        let sequence = self.next_sequence();
        log::debug!(
            "Answer of {} bytes split into {} parts",
            payload.len(),
            parts.len() + 1
        );
        self.pending = Some(Pending {
            group: request.params.group,
            subfunction: request.params.subfunction,
            sequence,
            parts,
        });
        self.reply(request, sequence, true, 0, &first)
    }

    fn continue_answer(&mut self, request: &UserData) -> Pdu {
        let params = request.params;
        let Some(pending) = self.pending.as_mut().filter(|p| {
            p.group == params.group
                && p.subfunction == params.subfunction
                && p.sequence == params.sequence
        }) else {
            log::warn!("Continuation with sequence {} has nothing pending", params.sequence);
            return self.error(request, ERR_FUNCTION);
        };
        let part = pending.parts.pop_front().unwrap_or_default();
        let more = !pending.parts.is_empty();
        let sequence = pending.sequence;
        if !more {
            self.pending = None;
        }
        self.reply(request, sequence, more, 0, &part)
    }

    fn error(&self, request: &UserData, error: u16) -> Pdu {
        self.reply(request, 0, false, error, &[])
    }

    fn reply(&self, request: &UserData, sequence: u8, more: bool, error: u16, payload: &[u8]) -> Pdu {
        userdata::response(
            request.reference,
            UserDataParams::response(&request.params, sequence, more, error),
            payload,
        )
    }

    fn next_sequence(&mut self) -> u8 {
        self.sequence = self.sequence.wrapping_add(1).max(1);
        self.sequence
    }
}

#[cfg(test)]
mod test {
    use chrono::NaiveDate;
    use s7_protocol::{
        error::{ErrorCode, S7Error},
        pdu::{ITEM_ADDRESS_OUT_OF_RANGE, ITEM_NOT_AVAILABLE},
        types::Area,
    };

    use super::*;
    use crate::server::{Builder, Shared};

    fn shared(max_pdu: u16) -> Shared {
        let shared = Shared::new(Builder::new().max_pdu(max_pdu).into_config());
        shared.areas.register(Area::DB, 1, (1..=50).collect()).unwrap();
        shared
    }

    fn ask(session: &mut Session, request: Pdu) -> Pdu {
        session.handle_pdu(&request.encode())
    }

    #[test]
    fn negotiates_pdu() {
        let shared = shared(240);
        let mut session = Session::new(&shared, None);
        let answer = ask(&mut session, pdu::setup_communication(1, 480));
        assert_eq!(pdu::parse_setup_communication(&answer).unwrap(), 240);
        let answer = ask(&mut session, pdu::setup_communication(2, 0));
        assert_eq!(pdu::parse_setup_communication(&answer).unwrap(), 240);
        let answer = ask(&mut session, pdu::setup_communication(3, 200));
        assert_eq!(pdu::parse_setup_communication(&answer).unwrap(), 200);
        assert_eq!(session.pdu_length, 200);
    }

    #[test]
    fn reads_and_writes_items() {
        let shared = shared(480);
        let mut session = Session::new(&shared, None);
        let specs = [
            AddressSpec::new(Area::DB, 1, 10, WordLen::Byte, 4),
            AddressSpec::new(Area::DB, 1, 60, WordLen::Byte, 1),
            AddressSpec::new(Area::DB, 9, 0, WordLen::Byte, 1),
        ];
        let answer = ask(&mut session, pdu::read_request(5, &specs).unwrap());
        assert_eq!(answer.reference, 5);
        let items = pdu::parse_read_response(&answer, 3).unwrap();
        assert_eq!(items[0], Ok(vec![11, 12, 13, 14]));
        assert_eq!(items[1].as_ref().unwrap_err().code(), ErrorCode::ADDRESS_OUT_OF_RANGE);
        assert_eq!(items[2].as_ref().unwrap_err().code(), ErrorCode::ITEM_NOT_AVAILABLE);

        let write = pdu::write_request(
            6,
            &[
                (specs[0], &[0xAA, 0xBB, 0xCC, 0xDD][..]),
                (specs[2], &[0x01][..]),
            ],
        )
        .unwrap();
        let answer = ask(&mut session, write);
        assert_eq!(answer.data, vec![ITEM_OK, ITEM_NOT_AVAILABLE]);
        let area = shared.areas.get(Area::DB, 1).unwrap();
        assert_eq!(area.with(|d| d[10..14].to_vec()), vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(
            shared.areas.read_item(&AddressSpec::new(Area::DB, 1, 50, WordLen::Byte, 1)),
            Err(ITEM_ADDRESS_OUT_OF_RANGE)
        );
    }

    #[test]
    fn oversized_read_is_refused() {
        let shared = shared(240);
        shared.areas.register(Area::DB, 2, vec![0; 400]).unwrap();
        let mut session = Session::new(&shared, None);
        ask(&mut session, pdu::setup_communication(1, 240));
        let spec = AddressSpec::new(Area::DB, 2, 0, WordLen::Byte, 300);
        let answer = ask(&mut session, pdu::read_request(2, &[spec]).unwrap());
        assert_eq!(answer.error, ERR_PDU_SIZE);
    }

    #[test]
    fn garbage_gets_an_error_answer() {
        let shared = shared(480);
        let mut session = Session::new(&shared, None);
        let answer = session.handle_pdu(&[0x32, 0x01, 0x00, 0x00, 0x12, 0x34]);
        assert_eq!(answer.reference, 0x1234);
        assert_eq!(answer.error, ERR_FUNCTION);
    }

    #[test]
    fn control_reports_current_state() {
        let shared = shared(480);
        let mut session = Session::new(&shared, None);
        let answer = ask(&mut session, pdu::hot_start(1));
        match pdu::parse_control_response(&answer, pdu::FUNC_PLC_CONTROL) {
            Err(S7Error::Plc { code, .. }) => assert_eq!(code, ErrorCode::ALREADY_RUN),
            other => panic!("expected already running, got {:?}", other),
        }
        let answer = ask(&mut session, pdu::plc_stop(2));
        assert_eq!(pdu::parse_control_response(&answer, pdu::FUNC_PLC_STOP), Ok(()));
        assert_eq!(*shared.lock_cpu(), CpuStatus::Stop);
        let answer = ask(&mut session, pdu::plc_stop(3));
        assert!(pdu::parse_control_response(&answer, pdu::FUNC_PLC_STOP).is_err());
        let answer = ask(&mut session, pdu::cold_start(4));
        assert_eq!(pdu::parse_control_response(&answer, pdu::FUNC_PLC_CONTROL), Ok(()));
        assert_eq!(*shared.lock_cpu(), CpuStatus::Run);
    }

    #[test]
    fn szl_answer_is_split_by_pdu_length() {
        let shared = shared(120);
        let mut session = Session::new(&shared, None);
        let first = UserData::decode(&ask(&mut session, userdata::szl_request(1, SZL_COMPONENT_ID, 0)))
            .unwrap();
        first.check().unwrap();
        assert!(first.params.more_follows);
        assert_ne!(first.params.sequence, 0);
        let mut payload = first.payload.clone();
        let mut parts = 1;
        let mut more = true;
        while more {
            let next = ask(
                &mut session,
                userdata::next_request(2, GROUP_SZL, SUB_READ_SZL, first.params.sequence),
            );
            let next = UserData::decode(&next).unwrap();
            next.check().unwrap();
            payload.extend_from_slice(&next.payload);
            more = next.params.more_follows;
            parts += 1;
        }
        assert_eq!(parts, 3);
        let expected = shared.config().cpu_info.to_szl();
        let record = userdata::parse_szl_header(&payload).unwrap();
        assert_eq!(record.data, expected);

        // Nothing left to continue.
        let stray = ask(
            &mut session,
            userdata::next_request(3, GROUP_SZL, SUB_READ_SZL, first.params.sequence),
        );
        assert!(UserData::decode(&stray).unwrap().check().is_err());
    }

    #[test]
    fn unknown_szl_is_not_available() {
        let shared = shared(480);
        let mut session = Session::new(&shared, None);
        let answer = UserData::decode(&ask(&mut session, userdata::szl_request(1, 0x0132, 4))).unwrap();
        assert_eq!(answer.check().unwrap_err().code(), ErrorCode::ITEM_NOT_AVAILABLE);
    }

    #[test]
    fn clock_keeps_offset() {
        let shared = shared(480);
        let mut session = Session::new(&shared, None);
        let value = NaiveDate::from_ymd_opt(2020, 2, 29)
            .unwrap()
            .and_hms_milli_opt(13, 14, 15, 0)
            .unwrap();
        let answer = ask(&mut session, userdata::set_clock_request(1, value).unwrap());
        UserData::decode(&answer).unwrap().check().unwrap();
        let answer = UserData::decode(&ask(&mut session, userdata::read_clock_request(2))).unwrap();
        answer.check().unwrap();
        let read = userdata::parse_clock(&answer.payload).unwrap();
        let drift = read.signed_duration_since(value);
        assert!(drift >= TimeDelta::zero() && drift < TimeDelta::seconds(5), "{}", drift);
    }

    #[test]
    fn session_password() {
        let shared = shared(480);
        let mut session = Session::new(&shared, None);
        fn clear(session: &mut Session, reference: u16) -> Result<(), S7Error> {
            UserData::decode(&ask(session, userdata::clear_password_request(reference)))
                .unwrap()
                .check()
        }
        assert_eq!(
            clear(&mut session, 1).unwrap_err().code(),
            ErrorCode::NO_PASSWORD_TO_SET_OR_CLEAR
        );
        let answer = ask(&mut session, userdata::set_password_request(2, "secret").unwrap());
        UserData::decode(&answer).unwrap().check().unwrap();
        assert_eq!(
            *shared.lock_password(),
            Some(userdata::encode_password("secret").unwrap())
        );
        assert_eq!(clear(&mut session, 3), Ok(()));
    }

    #[test]
    fn lists_registered_data_blocks() {
        let shared = shared(480);
        shared.areas.register(Area::DB, 7, vec![0; 4]).unwrap();
        let mut session = Session::new(&shared, None);
        let answer = UserData::decode(&ask(&mut session, userdata::list_blocks_request(1))).unwrap();
        answer.check().unwrap();
        let list = BlocksList::parse(&answer.payload);
        assert_eq!(list.get(BlockType::DB), 2);
        assert_eq!(list.get(BlockType::OB), 0);

        let answer = UserData::decode(&ask(
            &mut session,
            userdata::list_blocks_of_type_request(2, BlockType::DB),
        ))
        .unwrap();
        assert_eq!(userdata::parse_block_numbers(&answer.payload), vec![1, 7]);
        let answer = UserData::decode(&ask(
            &mut session,
            userdata::list_blocks_of_type_request(3, BlockType::FC),
        ))
        .unwrap();
        assert!(userdata::parse_block_numbers(&answer.payload).is_empty());
    }
}
