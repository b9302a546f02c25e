use std::fmt::Display;

use crate::error::{ErrorCode, S7Error};

/// Default ISO-on-TCP port.
pub const ISO_TCP_PORT: u16 = 102;
/// PDU size a client asks for unless configured otherwise.
pub const DEFAULT_PDU_SIZE: u16 = 480;
/// Upper bound for items in a single multi-variable request.
pub const MAX_VARS: usize = 20;
/// Protocol overhead of a read request/response pair.
pub const READ_OVERHEAD: usize = 18;
/// Protocol overhead of a write request.
pub const WRITE_OVERHEAD: usize = 35;

/// Addressable PLC memory areas.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Area {
    /// Process inputs
    PE,
    /// Process outputs
    PA,
    /// Merkers (flags)
    MK,
    /// Data blocks
    DB,
    /// Counters
    CT,
    /// Timers
    TM,
}

impl Area {
    pub const ALL: [Area; 6] = [Area::PE, Area::PA, Area::MK, Area::DB, Area::CT, Area::TM];

    pub fn code(self) -> u8 {
        match self {
            Area::PE => 0x81,
            Area::PA => 0x82,
            Area::MK => 0x83,
            Area::DB => 0x84,
            Area::CT => 0x1C,
            Area::TM => 0x1D,
        }
    }

    pub fn from_code(code: u8) -> Option<Area> {
        match code {
            0x81 => Some(Area::PE),
            0x82 => Some(Area::PA),
            0x83 => Some(Area::MK),
            0x84 => Some(Area::DB),
            0x1C => Some(Area::CT),
            0x1D => Some(Area::TM),
            _ => None,
        }
    }

    /// Counter and timer areas imply their own word length.
    pub fn implied_word_len(self) -> Option<WordLen> {
        match self {
            Area::CT => Some(WordLen::Counter),
            Area::TM => Some(WordLen::Timer),
            Area::PE | Area::PA | Area::MK | Area::DB => None,
        }
    }
}

impl Display for Area {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Area::PE => "PE",
            Area::PA => "PA",
            Area::MK => "MK",
            Area::DB => "DB",
            Area::CT => "CT",
            Area::TM => "TM",
        };
        write!(f, "{}", name)
    }
}

/// Element type of an area access.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum WordLen {
    Bit,
    Byte,
    Char,
    Word,
    Int,
    DWord,
    DInt,
    Real,
    Counter,
    Timer,
}

impl WordLen {
    pub fn code(self) -> u8 {
        match self {
            WordLen::Bit => 0x01,
            WordLen::Byte => 0x02,
            WordLen::Char => 0x03,
            WordLen::Word => 0x04,
            WordLen::Int => 0x05,
            WordLen::DWord => 0x06,
            WordLen::DInt => 0x07,
            WordLen::Real => 0x08,
            WordLen::Counter => 0x1C,
            WordLen::Timer => 0x1D,
        }
    }

    pub fn from_code(code: u8) -> Option<WordLen> {
        match code {
            0x01 => Some(WordLen::Bit),
            0x02 => Some(WordLen::Byte),
            0x03 => Some(WordLen::Char),
            0x04 => Some(WordLen::Word),
            0x05 => Some(WordLen::Int),
            0x06 => Some(WordLen::DWord),
            0x07 => Some(WordLen::DInt),
            0x08 => Some(WordLen::Real),
            0x1C => Some(WordLen::Counter),
            0x1D => Some(WordLen::Timer),
            _ => None,
        }
    }

    /// Bytes per element on the wire.
    pub fn size(self) -> usize {
        match self {
            WordLen::Bit | WordLen::Byte | WordLen::Char => 1,
            WordLen::Word | WordLen::Int | WordLen::Counter | WordLen::Timer => 2,
            WordLen::DWord | WordLen::DInt | WordLen::Real => 4,
        }
    }

    /// Word lengths whose start address is an element index instead of a byte offset.
    pub fn addresses_elements(self) -> bool {
        matches!(self, WordLen::Bit | WordLen::Counter | WordLen::Timer)
    }

    /// Transport size used for data items carrying this word length.
    pub fn transport_size(self) -> TransportSize {
        match self {
            WordLen::Bit => TransportSize::Bit,
            WordLen::Counter | WordLen::Timer => TransportSize::Octet,
            WordLen::Real => TransportSize::Real,
            WordLen::Int | WordLen::DInt => TransportSize::Int,
            WordLen::Byte | WordLen::Char | WordLen::Word | WordLen::DWord => {
                TransportSize::Byte
            }
        }
    }
}

/// Transport size byte of a data item.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportSize {
    Bit,
    Byte,
    Int,
    Real,
    Octet,
}

impl TransportSize {
    pub fn code(self) -> u8 {
        match self {
            TransportSize::Bit => 0x03,
            TransportSize::Byte => 0x04,
            TransportSize::Int => 0x05,
            TransportSize::Real => 0x07,
            TransportSize::Octet => 0x09,
        }
    }

    pub fn from_code(code: u8) -> Option<TransportSize> {
        match code {
            0x03 => Some(TransportSize::Bit),
            0x04 => Some(TransportSize::Byte),
            0x05 => Some(TransportSize::Int),
            0x07 => Some(TransportSize::Real),
            0x09 => Some(TransportSize::Octet),
            _ => None,
        }
    }

    /// Whether the length field of a data item counts bytes rather than bits.
    pub fn length_in_bytes(self) -> bool {
        matches!(
            self,
            TransportSize::Bit | TransportSize::Real | TransportSize::Octet
        )
    }

    /// Value for the length field of a data item holding `bytes` bytes.
    pub fn encode_length(self, bytes: usize) -> u16 {
        if self.length_in_bytes() {
            bytes as u16
        } else {
            (bytes << 3) as u16
        }
    }

    /// Number of payload bytes announced by a data item length field.
    pub fn decode_length(self, length: u16) -> usize {
        if self.length_in_bytes() {
            length as usize
        } else {
            (length as usize).div_ceil(8)
        }
    }
}

/// Block types as used by the block functions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlockType {
    OB,
    DB,
    SDB,
    FC,
    SFC,
    FB,
    SFB,
}

impl BlockType {
    pub const ALL: [BlockType; 7] = [
        BlockType::OB,
        BlockType::FB,
        BlockType::FC,
        BlockType::DB,
        BlockType::SDB,
        BlockType::SFC,
        BlockType::SFB,
    ];

    pub fn code(self) -> u8 {
        match self {
            BlockType::OB => 0x38,
            BlockType::DB => 0x41,
            BlockType::SDB => 0x42,
            BlockType::FC => 0x43,
            BlockType::SFC => 0x44,
            BlockType::FB => 0x45,
            BlockType::SFB => 0x46,
        }
    }

    pub fn from_code(code: u8) -> Option<BlockType> {
        BlockType::ALL.into_iter().find(|t| t.code() == code)
    }
}

/// Connection resource requested from the PLC, encoded in the high byte of the remote TSAP.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum ConnectionType {
    #[default]
    PG,
    OP,
    Basic,
}

impl ConnectionType {
    pub fn code(self) -> u16 {
        match self {
            ConnectionType::PG => 0x01,
            ConnectionType::OP => 0x02,
            ConnectionType::Basic => 0x03,
        }
    }
}

/// Remote TSAP addressing the CPU at `rack`/`slot`.
pub fn remote_tsap(connection_type: ConnectionType, rack: u16, slot: u16) -> Result<u16, S7Error> {
    if rack > 7 || slot > 31 {
        return Err(S7Error::Client(ErrorCode::INVALID_PARAMS));
    }
    Ok((connection_type.code() << 8) + rack * 0x20 + slot)
}

/// Run state of a CPU.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum CpuStatus {
    #[default]
    Unknown,
    Run,
    Stop,
}

impl CpuStatus {
    pub fn code(self) -> u8 {
        match self {
            CpuStatus::Unknown => 0x00,
            CpuStatus::Run => 0x08,
            CpuStatus::Stop => 0x04,
        }
    }

    pub fn from_code(code: u8) -> CpuStatus {
        match code {
            0x08 => CpuStatus::Run,
            0x04 => CpuStatus::Stop,
            _ => CpuStatus::Unknown,
        }
    }
}

impl Display for CpuStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CpuStatus::Unknown => write!(f, "Unknown"),
            CpuStatus::Run => write!(f, "Run"),
            CpuStatus::Stop => write!(f, "Stop"),
        }
    }
}

/// Location and shape of one area access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressSpec {
    pub area: Area,
    /// Only meaningful for [Area::DB].
    pub db_number: u16,
    /// Element index for bit/counter/timer word lengths, byte offset otherwise.
    /// Bit addresses are `byte * 8 + bit`.
    pub start: u32,
    pub word_len: WordLen,
    pub amount: u16,
}

impl AddressSpec {
    pub fn new(area: Area, db_number: u16, start: u32, word_len: WordLen, amount: u16) -> Self {
        AddressSpec {
            area,
            db_number: if area == Area::DB { db_number } else { 0 },
            start,
            word_len,
            amount,
        }
    }

    /// Payload bytes described by this access.
    pub fn byte_len(&self) -> usize {
        self.amount as usize * self.word_len.size()
    }

    /// The 24 bit wire address.
    pub fn wire_address(&self) -> u32 {
        encode_start(self.word_len, self.start)
    }
}

/// Largest start value that fits the 24 bit address field for `word_len`.
pub fn max_start(word_len: WordLen) -> u32 {
    if word_len.addresses_elements() {
        0x00FF_FFFF
    } else {
        0x00FF_FFFF >> 3
    }
}

/// Converts a start value into the wire address (bits for byte-addressed lengths).
pub fn encode_start(word_len: WordLen, start: u32) -> u32 {
    if word_len.addresses_elements() {
        start & 0x00FF_FFFF
    } else {
        (start << 3) & 0x00FF_FFFF
    }
}

/// Inverse of [encode_start].
pub fn decode_start(word_len: WordLen, address: u32) -> u32 {
    if word_len.addresses_elements() {
        address & 0x00FF_FFFF
    } else {
        (address & 0x00FF_FFFF) >> 3
    }
}

/// One element of a multi-variable read or write.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataItem {
    pub spec: AddressSpec,
    /// Payload to write, or the data read back.
    pub data: Vec<u8>,
    /// Outcome of this item after the request completed.
    pub result: Result<(), S7Error>,
}

impl DataItem {
    pub fn read(spec: AddressSpec) -> DataItem {
        DataItem {
            spec,
            data: Vec::new(),
            result: Ok(()),
        }
    }

    pub fn write(spec: AddressSpec, data: Vec<u8>) -> DataItem {
        DataItem {
            spec,
            data,
            result: Ok(()),
        }
    }
}

/// A system status list answer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SzlRecord {
    pub id: u16,
    pub index: u16,
    /// Declared length of one record.
    pub record_len: u16,
    /// Declared number of records.
    pub record_count: u16,
    pub data: Vec<u8>,
}

impl SzlRecord {
    pub fn records(&self) -> impl Iterator<Item = &[u8]> {
        let len = (self.record_len as usize).max(1);
        self.data.chunks(len)
    }
}

#[test]
fn start_address_round_trip() {
    for word_len in [
        WordLen::Byte,
        WordLen::Char,
        WordLen::Word,
        WordLen::Int,
        WordLen::DWord,
        WordLen::DInt,
        WordLen::Real,
        WordLen::Counter,
        WordLen::Timer,
    ] {
        for start in [0, 1, max_start(word_len)] {
            assert_eq!(decode_start(word_len, encode_start(word_len, start)), start);
        }
    }
    assert_eq!(encode_start(WordLen::Byte, 10), 80);
    assert_eq!(encode_start(WordLen::Bit, 83), 83);
}

#[test]
fn tsap_from_rack_and_slot() {
    assert_eq!(remote_tsap(ConnectionType::PG, 0, 2).unwrap(), 0x0102);
    assert_eq!(remote_tsap(ConnectionType::OP, 1, 3).unwrap(), 0x0223);
    assert_eq!(remote_tsap(ConnectionType::Basic, 7, 31).unwrap(), 0x03FF);
    assert!(remote_tsap(ConnectionType::PG, 8, 0).is_err());
}

#[test]
fn transport_length_units() {
    assert_eq!(TransportSize::Byte.encode_length(4), 32);
    assert_eq!(TransportSize::Octet.encode_length(4), 4);
    assert_eq!(TransportSize::Byte.decode_length(32), 4);
    assert_eq!(TransportSize::Bit.decode_length(1), 1);
}
