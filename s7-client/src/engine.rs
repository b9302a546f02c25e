//! S7 session on top of an [IsoConnection]: PDU size negotiation, chunked area
//! access, multi variable access and the user data functions.
use chrono::NaiveDateTime;

use s7_protocol::{
    error::{ErrorCode, S7Error},
    pdu::{self, FUNC_PLC_CONTROL, FUNC_PLC_STOP, Pdu},
    types::{
        AddressSpec, Area, BlockType, DataItem, MAX_VARS, READ_OVERHEAD, SzlRecord,
        WRITE_OVERHEAD, WordLen, max_start,
    },
    userdata::{self, BlocksList, UserData},
};

use crate::iso::IsoConnection;

/// An area transfer that stopped early.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Partial {
    /// Bytes transferred before the failing request.
    pub done: usize,
    pub error: S7Error,
}

impl From<Partial> for S7Error {
    fn from(value: Partial) -> Self {
        value.error
    }
}

impl From<S7Error> for Partial {
    fn from(error: S7Error) -> Self {
        Partial { done: 0, error }
    }
}

/// Element layout of one area transfer after normalisation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Layout {
    word_len: WordLen,
    elements: usize,
    /// Wire bytes per element.
    element_size: usize,
}

impl Layout {
    /// Counter and timer areas force their word length; bit access moves one bit;
    /// every other word length is transferred as bytes.
    fn new(area: Area, word_len: WordLen, amount: u16) -> Layout {
        let word_len = area.implied_word_len().unwrap_or(word_len);
        match word_len {
            WordLen::Bit => Layout {
                word_len,
                elements: 1,
                element_size: 1,
            },
            WordLen::Counter | WordLen::Timer => Layout {
                word_len,
                elements: amount as usize,
                element_size: word_len.size(),
            },
            _ => Layout {
                word_len: WordLen::Byte,
                elements: amount as usize * word_len.size(),
                element_size: 1,
            },
        }
    }

    fn max_elements(&self, pdu_length: u16, overhead: usize) -> usize {
        (pdu_length as usize).saturating_sub(overhead) / self.element_size
    }

    /// Every chunk start from `start` up to the last element must fit the 24 bit
    /// address field.
    fn check_range(&self, start: u32) -> Result<(), S7Error> {
        let last = u32::try_from(self.elements.saturating_sub(1))
            .ok()
            .and_then(|extent| start.checked_add(extent));
        match last {
            Some(last) if last <= max_start(self.word_len) => Ok(()),
            _ => Err(S7Error::Client(ErrorCode::INVALID_PARAMS)),
        }
    }

    /// Advances the start address past `elements` transferred elements. Byte
    /// layouts count bytes, counters and timers count elements.
    fn advance(&self, start: u32, elements: usize) -> Result<u32, S7Error> {
        u32::try_from(elements)
            .ok()
            .and_then(|elements| start.checked_add(elements))
            .ok_or(S7Error::Client(ErrorCode::INVALID_PARAMS))
    }
}

/// Refuses a start that would not survive the 24 bit address encoding.
fn check_start(spec: &AddressSpec) -> Result<(), S7Error> {
    if spec.start > max_start(spec.word_len) {
        return Err(S7Error::Client(ErrorCode::INVALID_PARAMS));
    }
    Ok(())
}

/// Bytes transferred for an access of `amount` elements of `word_len` in `area`.
pub fn transfer_len(area: Area, word_len: WordLen, amount: u16) -> usize {
    let layout = Layout::new(area, word_len, amount);
    layout.elements * layout.element_size
}

#[derive(Debug)]
pub struct S7ConnectionEngine {
    iso: IsoConnection,
    pdu_length: u16,
    reference: u16,
}

impl S7ConnectionEngine {
    /// Takes over an ISO connection; [S7ConnectionEngine::setup_communication] must run next.
    pub fn new(iso: IsoConnection) -> Self {
        S7ConnectionEngine {
            iso,
            pdu_length: 0,
            reference: 0,
        }
    }

    pub fn iso(&self) -> &IsoConnection {
        &self.iso
    }

    pub fn iso_mut(&mut self) -> &mut IsoConnection {
        &mut self.iso
    }

    /// The negotiated PDU length, zero before negotiation.
    pub fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    fn next_reference(&mut self) -> u16 {
        self.reference = self.reference.wrapping_add(1);
        self.reference
    }

    /// Sends one PDU and returns the answer carrying the same reference.
    pub fn exchange(&mut self, request: &Pdu) -> Result<Pdu, S7Error> {
        if self.pdu_length != 0 && request.encoded_len() > self.pdu_length as usize {
            return Err(S7Error::Client(ErrorCode::SIZE_OVER_PDU));
        }
        let answer = self.iso.exchange(&request.encode())?;
        let response = Pdu::decode(&answer)?;
        if response.reference != request.reference {
            return Err(S7Error::invalid_answer(format!(
                "answer for reference {:#06x} while waiting for {:#06x}",
                response.reference, request.reference
            )));
        }
        Ok(response)
    }

    /// Negotiates the PDU length. Runs once, right after the ISO handshake.
    pub fn setup_communication(&mut self, requested: u16) -> Result<u16, S7Error> {
        let reference = self.next_reference();
        let response = self.exchange(&pdu::setup_communication(reference, requested))?;
        let granted = pdu::parse_setup_communication(&response)?;
        self.pdu_length = granted.min(requested);
        log::debug!(
            "Negotiated PDU length {} (requested {})",
            self.pdu_length,
            requested
        );
        Ok(self.pdu_length)
    }

    fn require_session(&self) -> Result<(), S7Error> {
        if !self.iso.is_connected() || self.pdu_length == 0 {
            return Err(S7Error::not_connected());
        }
        Ok(())
    }

    /// Reads `amount` elements into `buffer`, splitting the transfer so that every
    /// answer fits the negotiated PDU length.
    pub fn read_area(
        &mut self,
        area: Area,
        db_number: u16,
        start: u32,
        word_len: WordLen,
        amount: u16,
        buffer: &mut [u8],
    ) -> Result<(), Partial> {
        self.require_session()?;
        let layout = Layout::new(area, word_len, amount);
        let total = layout.elements * layout.element_size;
        if buffer.len() < total {
            return Err(S7Error::Client(ErrorCode::BUFFER_TOO_SMALL).into());
        }
        let max_elements = layout.max_elements(self.pdu_length, READ_OVERHEAD);
        if max_elements == 0 {
            return Err(S7Error::Client(ErrorCode::SIZE_OVER_PDU).into());
        }
        layout.check_range(start)?;
        let mut remaining = layout.elements;
        let mut start = start;
        let mut offset = 0;
        while remaining > 0 {
            let elements = remaining.min(max_elements);
            let spec = AddressSpec::new(area, db_number, start, layout.word_len, elements as u16);
            let size = elements * layout.element_size;
            let chunk = self.read_chunk(spec).map_err(|error| Partial {
                done: offset,
                error,
            })?;
            if chunk.len() < size {
                return Err(Partial {
                    done: offset,
                    error: S7Error::protocol(
                        ErrorCode::INVALID_DATA_SIZE_RECVD,
                        format!("asked for {} bytes, got {}", size, chunk.len()),
                    ),
                });
            }
            buffer[offset..offset + size].copy_from_slice(&chunk[..size]);
            log::trace!("Read {} bytes at {} of {}", size, start, area);
            offset += size;
            remaining -= elements;
            if remaining > 0 {
                start = layout.advance(start, elements).map_err(|error| Partial {
                    done: offset,
                    error,
                })?;
            }
        }
        Ok(())
    }

    fn read_chunk(&mut self, spec: AddressSpec) -> Result<Vec<u8>, S7Error> {
        let reference = self.next_reference();
        let response = self.exchange(&pdu::read_request(reference, &[spec])?)?;
        pdu::parse_read_response(&response, 1)?
            .pop()
            .unwrap_or_else(|| Err(S7Error::invalid_answer("read answer without items")))
    }

    /// Writes `amount` elements from `data`, chunked like [S7ConnectionEngine::read_area].
    pub fn write_area(
        &mut self,
        area: Area,
        db_number: u16,
        start: u32,
        word_len: WordLen,
        amount: u16,
        data: &[u8],
    ) -> Result<(), Partial> {
        self.require_session()?;
        let layout = Layout::new(area, word_len, amount);
        let total = layout.elements * layout.element_size;
        if data.len() < total {
            return Err(S7Error::Client(ErrorCode::BUFFER_TOO_SMALL).into());
        }
        let max_elements = layout.max_elements(self.pdu_length, WRITE_OVERHEAD);
        if max_elements == 0 {
            return Err(S7Error::Client(ErrorCode::SIZE_OVER_PDU).into());
        }
        layout.check_range(start)?;
        let mut remaining = layout.elements;
        let mut start = start;
        let mut offset = 0;
        while remaining > 0 {
            let elements = remaining.min(max_elements);
            let spec = AddressSpec::new(area, db_number, start, layout.word_len, elements as u16);
            let size = elements * layout.element_size;
            self.write_chunk(spec, &data[offset..offset + size])
                .map_err(|error| Partial {
                    done: offset,
                    error,
                })?;
            log::trace!("Wrote {} bytes at {} of {}", size, start, area);
            offset += size;
            remaining -= elements;
            if remaining > 0 {
                start = layout.advance(start, elements).map_err(|error| Partial {
                    done: offset,
                    error,
                })?;
            }
        }
        Ok(())
    }

    fn write_chunk(&mut self, spec: AddressSpec, data: &[u8]) -> Result<(), S7Error> {
        let reference = self.next_reference();
        let response = self.exchange(&pdu::write_request(reference, &[(spec, data)])?)?;
        pdu::parse_write_response(&response, 1)?
            .pop()
            .unwrap_or_else(|| Err(S7Error::invalid_answer("write answer without items")))
    }

    /// Reads all items with one request. Item failures are stored per item.
    pub fn read_multi_vars(&mut self, items: &mut [DataItem]) -> Result<(), S7Error> {
        if items.len() > MAX_VARS {
            return Err(S7Error::Client(ErrorCode::TOO_MANY_ITEMS));
        }
        for item in items.iter() {
            check_start(&item.spec)?;
        }
        self.require_session()?;
        let specs: Vec<AddressSpec> = items.iter().map(|item| item.spec).collect();
        let answer_len = 14 + specs
            .iter()
            .map(|spec| 4 + spec.byte_len() + spec.byte_len() % 2)
            .sum::<usize>();
        if answer_len > self.pdu_length as usize {
            return Err(S7Error::Client(ErrorCode::SIZE_OVER_PDU));
        }
        let reference = self.next_reference();
        let response = self.exchange(&pdu::read_request(reference, &specs)?)?;
        let results = pdu::parse_read_response(&response, items.len())?;
        for (item, result) in items.iter_mut().zip(results) {
            match result {
                Ok(data) => {
                    item.data = data;
                    item.result = Ok(());
                }
                Err(err) => {
                    item.data.clear();
                    item.result = Err(err);
                }
            }
        }
        Ok(())
    }

    /// Writes all items with one request. Item failures are stored per item.
    pub fn write_multi_vars(&mut self, items: &mut [DataItem]) -> Result<(), S7Error> {
        if items.len() > MAX_VARS {
            return Err(S7Error::Client(ErrorCode::TOO_MANY_ITEMS));
        }
        for item in items.iter() {
            check_start(&item.spec)?;
        }
        self.require_session()?;
        let reference = self.next_reference();
        let request = {
            let payloads: Vec<(AddressSpec, &[u8])> = items
                .iter()
                .map(|item| (item.spec, item.data.as_slice()))
                .collect();
            pdu::write_request(reference, &payloads)?
        };
        let response = self.exchange(&request)?;
        let results = pdu::parse_write_response(&response, items.len())?;
        for (item, result) in items.iter_mut().zip(results) {
            item.result = result;
        }
        Ok(())
    }

    /// Runs a user data exchange, following continuation parts, and returns the
    /// concatenated payload.
    fn user_data(&mut self, request: Pdu) -> Result<Vec<u8>, S7Error> {
        self.require_session()?;
        let first = UserData::decode(&self.exchange(&request)?)?;
        first.check()?;
        let group = first.params.group;
        let subfunction = first.params.subfunction;
        let mut more = first.params.more_follows;
        let mut sequence = first.params.sequence;
        let mut payload = first.payload;
        let mut parts = 1;
        while more {
            let reference = self.next_reference();
            let next = UserData::decode(&self.exchange(&userdata::next_request(
                reference,
                group,
                subfunction,
                sequence,
            ))?)?;
            next.check()?;
            payload.extend_from_slice(&next.payload);
            more = next.params.more_follows;
            sequence = next.params.sequence;
            parts += 1;
        }
        log::debug!(
            "User data group {} function {}: {} bytes in {} parts",
            group,
            subfunction,
            payload.len(),
            parts
        );
        Ok(payload)
    }

    /// Reads a system status list, following continuation parts until complete.
    pub fn read_szl(&mut self, id: u16, index: u16) -> Result<SzlRecord, S7Error> {
        let reference = self.next_reference();
        let payload = self.user_data(userdata::szl_request(reference, id, index))?;
        let record = userdata::parse_szl_header(&payload)?;
        if record.id != id && id != 0 {
            log::debug!("Asked for SZL {:#06x}, got {:#06x}", id, record.id);
        }
        Ok(record)
    }

    pub fn list_blocks(&mut self) -> Result<BlocksList, S7Error> {
        let reference = self.next_reference();
        let payload = self.user_data(userdata::list_blocks_request(reference))?;
        Ok(BlocksList::parse(&payload))
    }

    pub fn list_blocks_of_type(&mut self, block_type: BlockType) -> Result<Vec<u16>, S7Error> {
        let reference = self.next_reference();
        let payload = self.user_data(userdata::list_blocks_of_type_request(reference, block_type))?;
        Ok(userdata::parse_block_numbers(&payload))
    }

    pub fn plc_hot_start(&mut self) -> Result<(), S7Error> {
        self.require_session()?;
        let reference = self.next_reference();
        let response = self.exchange(&pdu::hot_start(reference))?;
        pdu::parse_control_response(&response, FUNC_PLC_CONTROL)
    }

    pub fn plc_cold_start(&mut self) -> Result<(), S7Error> {
        self.require_session()?;
        let reference = self.next_reference();
        let response = self.exchange(&pdu::cold_start(reference))?;
        pdu::parse_control_response(&response, FUNC_PLC_CONTROL)
    }

    pub fn plc_stop(&mut self) -> Result<(), S7Error> {
        self.require_session()?;
        let reference = self.next_reference();
        let response = self.exchange(&pdu::plc_stop(reference))?;
        pdu::parse_control_response(&response, FUNC_PLC_STOP)
    }

    pub fn get_plc_datetime(&mut self) -> Result<NaiveDateTime, S7Error> {
        let reference = self.next_reference();
        let payload = self.user_data(userdata::read_clock_request(reference))?;
        userdata::parse_clock(&payload)
    }

    pub fn set_plc_datetime(&mut self, value: NaiveDateTime) -> Result<(), S7Error> {
        let reference = self.next_reference();
        self.user_data(userdata::set_clock_request(reference, value)?)
            .map(|_| ())
    }

    pub fn set_session_password(&mut self, password: &str) -> Result<(), S7Error> {
        let reference = self.next_reference();
        self.user_data(userdata::set_password_request(reference, password)?)
            .map(|_| ())
    }

    pub fn clear_session_password(&mut self) -> Result<(), S7Error> {
        let reference = self.next_reference();
        self.user_data(userdata::clear_password_request(reference))
            .map(|_| ())
    }

    /// Closes the session. Idempotent.
    pub fn disconnect(&mut self) {
        self.iso.disconnect();
        self.pdu_length = 0;
    }
}

#[test]
fn layout_normalisation() {
    let words = Layout::new(Area::DB, WordLen::Word, 10);
    assert_eq!(words.word_len, WordLen::Byte);
    assert_eq!(words.elements, 20);
    assert_eq!(words.max_elements(480, READ_OVERHEAD), 462);

    let counters = Layout::new(Area::CT, WordLen::Byte, 10);
    assert_eq!(counters.word_len, WordLen::Counter);
    assert_eq!(counters.element_size, 2);
    assert_eq!(counters.max_elements(480, WRITE_OVERHEAD), 222);

    let bit = Layout::new(Area::MK, WordLen::Bit, 8);
    assert_eq!((bit.elements, bit.element_size), (1, 1));
    assert_eq!(transfer_len(Area::DB, WordLen::Real, 3), 12);
}

#[test]
fn address_range() {
    let bytes = Layout::new(Area::DB, WordLen::Byte, 4);
    assert_eq!(bytes.check_range(0x1F_FFFC), Ok(()));
    assert_eq!(
        bytes.check_range(0x1F_FFFD),
        Err(S7Error::Client(ErrorCode::INVALID_PARAMS))
    );
    assert_eq!(
        bytes.check_range(0x20_0000),
        Err(S7Error::Client(ErrorCode::INVALID_PARAMS))
    );

    let timers = Layout::new(Area::TM, WordLen::Timer, 2);
    assert_eq!(timers.check_range(0xFF_FFFE), Ok(()));
    assert_eq!(
        timers.check_range(u32::MAX),
        Err(S7Error::Client(ErrorCode::INVALID_PARAMS))
    );

    assert_eq!(bytes.advance(10, 4), Ok(14));
    assert_eq!(
        bytes.advance(u32::MAX, 1),
        Err(S7Error::Client(ErrorCode::INVALID_PARAMS))
    );
    assert_eq!(
        check_start(&AddressSpec::new(Area::DB, 1, 0x20_0000, WordLen::Byte, 1)),
        Err(S7Error::Client(ErrorCode::INVALID_PARAMS))
    );
}
