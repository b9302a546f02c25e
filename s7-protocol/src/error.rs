use std::{
    error::Error,
    fmt::Display,
    io::{self, ErrorKind},
};

/// Numeric error code, compatible with the Snap7 code space.
///
/// The lower 16 bits carry TCP errors, bits 16..20 carry ISO errors and the
/// upper bits carry client errors, so a single value may combine several layers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const OK: ErrorCode = ErrorCode(0);

    pub const TCP_SOCKET_CREATION: ErrorCode = ErrorCode(0x0000_0001);
    pub const TCP_CONNECTION_TIMEOUT: ErrorCode = ErrorCode(0x0000_0002);
    pub const TCP_CONNECTION_FAILED: ErrorCode = ErrorCode(0x0000_0003);
    pub const TCP_RECEIVE_TIMEOUT: ErrorCode = ErrorCode(0x0000_0004);
    pub const TCP_DATA_RECEIVE: ErrorCode = ErrorCode(0x0000_0005);
    pub const TCP_SEND_TIMEOUT: ErrorCode = ErrorCode(0x0000_0006);
    pub const TCP_DATA_SEND: ErrorCode = ErrorCode(0x0000_0007);
    pub const TCP_CONNECTION_RESET: ErrorCode = ErrorCode(0x0000_0008);
    pub const TCP_NOT_CONNECTED: ErrorCode = ErrorCode(0x0000_0009);
    pub const TCP_UNREACHABLE_HOST: ErrorCode = ErrorCode(0x0000_2751);

    pub const ISO_CONNECT: ErrorCode = ErrorCode(0x0001_0000);
    pub const ISO_DISCONNECT: ErrorCode = ErrorCode(0x0002_0000);
    pub const ISO_INVALID_PDU: ErrorCode = ErrorCode(0x0003_0000);
    pub const ISO_INVALID_DATA_SIZE: ErrorCode = ErrorCode(0x0004_0000);
    pub const ISO_SHORT_PACKET: ErrorCode = ErrorCode(0x0006_0000);
    pub const ISO_TOO_MANY_FRAGMENTS: ErrorCode = ErrorCode(0x0007_0000);
    pub const ISO_PDU_OVERFLOW: ErrorCode = ErrorCode(0x0008_0000);
    pub const ISO_SEND_PACKET: ErrorCode = ErrorCode(0x0009_0000);
    pub const ISO_RECV_PACKET: ErrorCode = ErrorCode(0x000A_0000);
    pub const ISO_INVALID_PARAMS: ErrorCode = ErrorCode(0x000B_0000);

    pub const NEGOTIATING_PDU: ErrorCode = ErrorCode(0x0010_0000);
    pub const INVALID_PARAMS: ErrorCode = ErrorCode(0x0020_0000);
    pub const JOB_PENDING: ErrorCode = ErrorCode(0x0030_0000);
    pub const TOO_MANY_ITEMS: ErrorCode = ErrorCode(0x0040_0000);
    pub const INVALID_WORD_LEN: ErrorCode = ErrorCode(0x0050_0000);
    pub const PARTIAL_DATA_WRITTEN: ErrorCode = ErrorCode(0x0060_0000);
    pub const SIZE_OVER_PDU: ErrorCode = ErrorCode(0x0070_0000);
    pub const INVALID_PLC_ANSWER: ErrorCode = ErrorCode(0x0080_0000);
    pub const ADDRESS_OUT_OF_RANGE: ErrorCode = ErrorCode(0x0090_0000);
    pub const INVALID_TRANSPORT_SIZE: ErrorCode = ErrorCode(0x00A0_0000);
    pub const WRITE_DATA_SIZE_MISMATCH: ErrorCode = ErrorCode(0x00B0_0000);
    pub const ITEM_NOT_AVAILABLE: ErrorCode = ErrorCode(0x00C0_0000);
    pub const INVALID_VALUE: ErrorCode = ErrorCode(0x00D0_0000);
    pub const CANNOT_START_PLC: ErrorCode = ErrorCode(0x00E0_0000);
    pub const ALREADY_RUN: ErrorCode = ErrorCode(0x00F0_0000);
    pub const CANNOT_STOP_PLC: ErrorCode = ErrorCode(0x0100_0000);
    pub const CANNOT_COPY_RAM_TO_ROM: ErrorCode = ErrorCode(0x0110_0000);
    pub const CANNOT_COMPRESS: ErrorCode = ErrorCode(0x0120_0000);
    pub const ALREADY_STOP: ErrorCode = ErrorCode(0x0130_0000);
    pub const FUN_NOT_AVAILABLE: ErrorCode = ErrorCode(0x0140_0000);
    pub const UPLOAD_SEQUENCE_FAILED: ErrorCode = ErrorCode(0x0150_0000);
    pub const INVALID_DATA_SIZE_RECVD: ErrorCode = ErrorCode(0x0160_0000);
    pub const INVALID_BLOCK_TYPE: ErrorCode = ErrorCode(0x0170_0000);
    pub const INVALID_BLOCK_NUMBER: ErrorCode = ErrorCode(0x0180_0000);
    pub const INVALID_BLOCK_SIZE: ErrorCode = ErrorCode(0x0190_0000);
    pub const NEED_PASSWORD: ErrorCode = ErrorCode(0x01D0_0000);
    pub const INVALID_PASSWORD: ErrorCode = ErrorCode(0x01E0_0000);
    pub const NO_PASSWORD_TO_SET_OR_CLEAR: ErrorCode = ErrorCode(0x01F0_0000);
    pub const JOB_TIMEOUT: ErrorCode = ErrorCode(0x0200_0000);
    pub const PARTIAL_DATA_READ: ErrorCode = ErrorCode(0x0210_0000);
    pub const BUFFER_TOO_SMALL: ErrorCode = ErrorCode(0x0220_0000);
    pub const FUNCTION_REFUSED: ErrorCode = ErrorCode(0x0230_0000);
    pub const DESTROYING: ErrorCode = ErrorCode(0x0240_0000);
    pub const INVALID_PARAM_NUMBER: ErrorCode = ErrorCode(0x0250_0000);
    pub const CANNOT_CHANGE_PARAM: ErrorCode = ErrorCode(0x0260_0000);
    pub const FUNCTION_NOT_IMPLEMENTED: ErrorCode = ErrorCode(0x0270_0000);

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    /// Human readable description, see [error_text].
    pub fn text(&self) -> String {
        error_text(self.0)
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

fn tcp_text(code: u32) -> &'static str {
    match code {
        0x0001 => "TCP : Error creating the Socket",
        0x0002 => "TCP : Connection Timeout",
        0x0003 => "TCP : Connection Error",
        0x0004 => "TCP : Data receive Timeout",
        0x0005 => "TCP : Error receiving Data",
        0x0006 => "TCP : Data send Timeout",
        0x0007 => "TCP : Error sending Data",
        0x0008 => "TCP : Connection reset by the Peer",
        0x0009 => "TCP : Not connected",
        0x2751 => "TCP : Unreachable host",
        _ => "TCP : Unknown error",
    }
}

fn iso_text(code: u32) -> &'static str {
    match code {
        0x0001_0000 => "ISO : Connection error",
        0x0002_0000 => "ISO : Disconnect error",
        0x0003_0000 => "ISO : Bad PDU format",
        0x0004_0000 => "ISO : Datasize passed to send/recv buffer is invalid",
        0x0006_0000 => "ISO : Short packet received",
        0x0007_0000 => "ISO : Too many packets without EoT flag",
        0x0008_0000 => "ISO : The sum of fragments data exceded maximum packet size",
        0x0009_0000 => "ISO : An error occurred during send",
        0x000A_0000 => "ISO : An error occurred during recv",
        0x000B_0000 => "ISO : Invalid connection params (wrong TSAPs)",
        _ => "ISO : Unknown error",
    }
}

fn client_text(code: u32) -> &'static str {
    match code {
        0x0010_0000 => "CPU : Error in PDU negotiation",
        0x0020_0000 => "CLI : invalid param(s) supplied",
        0x0030_0000 => "CLI : Job pending",
        0x0040_0000 => "CLI : too may items (>20) in multi read/write",
        0x0050_0000 => "CLI : invalid WordLength",
        0x0060_0000 => "CLI : Partial data written",
        0x0070_0000 => "CPU : total data exceeds the PDU size",
        0x0080_0000 => "CLI : invalid CPU answer",
        0x0090_0000 => "CPU : Address out of range",
        0x00A0_0000 => "CPU : Invalid Transport size",
        0x00B0_0000 => "CPU : Data size mismatch",
        0x00C0_0000 => "CPU : Item not available",
        0x00D0_0000 => "CPU : Invalid value supplied",
        0x00E0_0000 => "CPU : Cannot start PLC",
        0x00F0_0000 => "CPU : PLC already RUN",
        0x0100_0000 => "CPU : Cannot stop PLC",
        0x0110_0000 => "CPU : Cannot copy RAM to ROM",
        0x0120_0000 => "CPU : Cannot compress",
        0x0130_0000 => "CPU : PLC already STOP",
        0x0140_0000 => "CPU : Function not available",
        0x0150_0000 => "CPU : Upload sequence failed",
        0x0160_0000 => "CLI : Invalid data size received",
        0x0170_0000 => "CLI : Invalid block type",
        0x0180_0000 => "CLI : Invalid block number",
        0x0190_0000 => "CLI : Invalid block size",
        0x01D0_0000 => "CPU : Function not authorized for current protection level",
        0x01E0_0000 => "CPU : Invalid password",
        0x01F0_0000 => "CPU : No password to set or clear",
        0x0200_0000 => "CLI : Job Timeout",
        0x0210_0000 => "CLI : Partial data read",
        0x0220_0000 => "CLI : The buffer supplied is too small to accomplish the operation",
        0x0230_0000 => "CLI : function refused by CPU (Unknown error)",
        0x0240_0000 => "CLI : Cannot perform (destroying)",
        0x0250_0000 => "CLI : Invalid Param Number",
        0x0260_0000 => "CLI : Cannot change this param now",
        0x0270_0000 => "CLI : Function not implemented",
        _ => "CLI : Unknown error",
    }
}

/// Renders any error code, including codes combining several layers.
pub fn error_text(code: u32) -> String {
    if code == 0 {
        return "OK".to_string();
    }
    let mut parts = Vec::with_capacity(3);
    if code & 0xFFF0_0000 != 0 {
        parts.push(client_text(code & 0xFFF0_0000));
    }
    if code & 0x000F_0000 != 0 {
        parts.push(iso_text(code & 0x000F_0000));
    }
    if code & 0x0000_FFFF != 0 {
        parts.push(tcp_text(code & 0x0000_FFFF));
    }
    parts.join(", ")
}

/// Errors produced by the S7 stack.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum S7Error {
    /// TCP or ISO link failure. The connection is unusable afterwards.
    Connection(ErrorCode),
    /// A connect, send or receive deadline elapsed.
    Timeout(ErrorCode),
    /// A frame or PDU did not have the expected shape.
    Protocol { code: ErrorCode, detail: String },
    /// The PLC rejected the request. `raw` is the code reported on the wire.
    Plc { raw: u16, code: ErrorCode },
    /// Refused locally before anything was sent.
    Client(ErrorCode),
}

impl S7Error {
    pub fn not_connected() -> S7Error {
        S7Error::Connection(ErrorCode::TCP_NOT_CONNECTED)
    }

    pub fn protocol(code: ErrorCode, detail: impl Into<String>) -> S7Error {
        S7Error::Protocol {
            code,
            detail: detail.into(),
        }
    }

    pub fn invalid_pdu(detail: impl Into<String>) -> S7Error {
        S7Error::protocol(ErrorCode::ISO_INVALID_PDU, detail)
    }

    pub fn invalid_answer(detail: impl Into<String>) -> S7Error {
        S7Error::protocol(ErrorCode::INVALID_PLC_ANSWER, detail)
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            S7Error::Connection(code)
            | S7Error::Timeout(code)
            | S7Error::Client(code)
            | S7Error::Protocol { code, .. }
            | S7Error::Plc { code, .. } => *code,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, S7Error::Timeout(_))
    }

    /// Classifies an I/O error raised while sending.
    pub fn from_send(err: io::Error) -> S7Error {
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                S7Error::Timeout(ErrorCode::TCP_SEND_TIMEOUT)
            }
            _ => classify_link_error(&err).unwrap_or(S7Error::Connection(ErrorCode::TCP_DATA_SEND)),
        }
    }

    /// Classifies an I/O error raised while receiving.
    pub fn from_receive(err: io::Error) -> S7Error {
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                S7Error::Timeout(ErrorCode::TCP_RECEIVE_TIMEOUT)
            }
            _ => classify_link_error(&err)
                .unwrap_or(S7Error::Connection(ErrorCode::TCP_DATA_RECEIVE)),
        }
    }
}

fn classify_link_error(err: &io::Error) -> Option<S7Error> {
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => Some(S7Error::Connection(ErrorCode::TCP_CONNECTION_RESET)),
        ErrorKind::NotConnected => Some(S7Error::not_connected()),
        ErrorKind::ConnectionRefused => {
            Some(S7Error::Connection(ErrorCode::TCP_CONNECTION_FAILED))
        }
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
            Some(S7Error::Connection(ErrorCode::TCP_UNREACHABLE_HOST))
        }
        _ => None,
    }
}

impl From<io::Error> for S7Error {
    fn from(value: io::Error) -> Self {
        S7Error::from_receive(value)
    }
}

impl From<CodecError> for S7Error {
    fn from(value: CodecError) -> Self {
        S7Error::Client(match value {
            CodecError::OutOfBounds { .. } => ErrorCode::BUFFER_TOO_SMALL,
            CodecError::InvalidValue(_) => ErrorCode::INVALID_VALUE,
        })
    }
}

impl Display for S7Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            S7Error::Connection(code) => write!(f, "{}", code.text()),
            S7Error::Timeout(code) => write!(f, "{}", code.text()),
            S7Error::Protocol { code, detail } => write!(f, "{} ({})", code.text(), detail),
            S7Error::Plc { raw, code } => {
                write!(f, "{} (PLC code 0x{:04X})", code.text(), raw)
            }
            S7Error::Client(code) => write!(f, "{}", code.text()),
        }
    }
}

impl Error for S7Error {}

/// Translates a PLC-reported code into the client code space.
///
/// Unknown codes map to [ErrorCode::FUNCTION_REFUSED] and keep the raw value.
pub fn cpu_error(raw: u16) -> Result<(), S7Error> {
    let code = match raw {
        0 => return Ok(()),
        0x0005 => ErrorCode::ADDRESS_OUT_OF_RANGE,
        0x0006 => ErrorCode::INVALID_TRANSPORT_SIZE,
        0x0007 => ErrorCode::WRITE_DATA_SIZE_MISMATCH,
        0x000A | 0xD209 => ErrorCode::ITEM_NOT_AVAILABLE,
        0x8500 => ErrorCode::SIZE_OVER_PDU,
        0xDC01 => ErrorCode::INVALID_VALUE,
        0x8104 => ErrorCode::FUN_NOT_AVAILABLE,
        0xD241 => ErrorCode::NEED_PASSWORD,
        0xD602 => ErrorCode::INVALID_PASSWORD,
        0xD604 | 0xD605 => ErrorCode::NO_PASSWORD_TO_SET_OR_CLEAR,
        _ => ErrorCode::FUNCTION_REFUSED,
    };
    Err(S7Error::Plc { raw, code })
}

/// Errors of the scalar get/set helpers in [crate::wire].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CodecError {
    OutOfBounds {
        index: usize,
        needed: usize,
        len: usize,
    },
    InvalidValue(String),
}

impl Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::OutOfBounds { index, needed, len } => write!(
                f,
                "Access of {} bytes at index {} exceeds buffer of length {}",
                needed, index, len
            ),
            CodecError::InvalidValue(reason) => write!(f, "{}", reason),
        }
    }
}

impl Error for CodecError {}
