//! TPKT (RFC 1006) and COTP (ISO 8073) framing.
//!
//! Only single fragment data transfer is supported. A data TPDU without the
//! end-of-transmission mark is rejected with [ErrorCode::ISO_TOO_MANY_FRAGMENTS].
use crate::error::{ErrorCode, S7Error};

pub const TPKT_VERSION: u8 = 0x03;
pub const TPKT_HEADER_LEN: usize = 4;
/// Length of the COTP data transfer header (`len`, `type`, `eot|seq`).
pub const DT_HEADER_LEN: usize = 3;
/// Largest frame the length field can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

pub const COTP_CR: u8 = 0xE0;
pub const COTP_CC: u8 = 0xD0;
pub const COTP_DR: u8 = 0x80;
pub const COTP_DT: u8 = 0xF0;
const EOT: u8 = 0x80;

const PARAM_TPDU_SIZE: u8 = 0xC0;
const PARAM_CALLING_TSAP: u8 = 0xC1;
const PARAM_CALLED_TSAP: u8 = 0xC2;

/// Parameters carried by connection request and confirm TPDUs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionParams {
    pub dst_ref: u16,
    pub src_ref: u16,
    /// TSAP of the side that initiated the connection.
    pub calling_tsap: Option<u16>,
    /// TSAP the initiator wants to reach.
    pub called_tsap: Option<u16>,
    /// Size code, the TPDU holds `1 << code` bytes.
    pub tpdu_size: Option<u8>,
}

impl ConnectionParams {
    /// Parameters of a connection request from `local_tsap` to `remote_tsap`.
    pub fn request(src_ref: u16, local_tsap: u16, remote_tsap: u16, pdu_size: u16) -> Self {
        ConnectionParams {
            dst_ref: 0,
            src_ref,
            calling_tsap: Some(local_tsap),
            called_tsap: Some(remote_tsap),
            tpdu_size: Some(tpdu_size_code(pdu_size)),
        }
    }

    /// The confirm answering this request, with `src_ref` assigned by the responder.
    pub fn confirm(&self, src_ref: u16) -> Self {
        ConnectionParams {
            dst_ref: self.src_ref,
            src_ref,
            ..*self
        }
    }

    /// TPDU size in bytes, if the peer announced one.
    pub fn tpdu_len(&self) -> Option<usize> {
        self.tpdu_size.map(|code| 1usize << code.min(13))
    }
}

/// One TPKT packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    ConnectionRequest(ConnectionParams),
    ConnectionConfirm(ConnectionParams),
    DisconnectRequest { dst_ref: u16, src_ref: u16, reason: u8 },
    /// A single fragment data TPDU carrying one S7 PDU.
    Data(Vec<u8>),
}

/// Smallest TPDU size code (7..=13) able to carry a PDU of `pdu_size` bytes,
/// never below 1024 bytes.
pub fn tpdu_size_code(pdu_size: u16) -> u8 {
    let needed = pdu_size as usize + DT_HEADER_LEN;
    (0x0A..=0x0D)
        .find(|code| (1usize << code) >= needed)
        .unwrap_or(0x0D)
}

/// Prepends the TPKT header to `payload`.
pub fn build_tpkt(payload: &[u8]) -> Result<Vec<u8>, S7Error> {
    let total = TPKT_HEADER_LEN + payload.len();
    if total > MAX_FRAME_LEN {
        return Err(S7Error::protocol(
            ErrorCode::ISO_PDU_OVERFLOW,
            format!("frame of {} bytes exceeds the TPKT length field", total),
        ));
    }
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&[TPKT_VERSION, 0x00]);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Validates a TPKT header and returns the total frame length it announces.
pub fn parse_tpkt_header(header: &[u8]) -> Result<usize, S7Error> {
    if header.len() < TPKT_HEADER_LEN {
        return Err(S7Error::protocol(
            ErrorCode::ISO_SHORT_PACKET,
            format!("TPKT header needs 4 bytes, got {}", header.len()),
        ));
    }
    if header[0] != TPKT_VERSION {
        return Err(S7Error::invalid_pdu(format!(
            "unexpected TPKT version {:#04x}",
            header[0]
        )));
    }
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    if len < TPKT_HEADER_LEN + 3 {
        return Err(S7Error::protocol(
            ErrorCode::ISO_INVALID_DATA_SIZE,
            format!("TPKT length {} is too short", len),
        ));
    }
    Ok(len)
}

fn connect_tpdu(kind: u8, params: &ConnectionParams) -> Vec<u8> {
    let mut cotp = vec![0, kind];
    cotp.extend_from_slice(&params.dst_ref.to_be_bytes());
    cotp.extend_from_slice(&params.src_ref.to_be_bytes());
    cotp.push(0x00);
    if let Some(size) = params.tpdu_size {
        cotp.extend_from_slice(&[PARAM_TPDU_SIZE, 1, size]);
    }
    if let Some(tsap) = params.calling_tsap {
        cotp.extend_from_slice(&[PARAM_CALLING_TSAP, 2]);
        cotp.extend_from_slice(&tsap.to_be_bytes());
    }
    if let Some(tsap) = params.called_tsap {
        cotp.extend_from_slice(&[PARAM_CALLED_TSAP, 2]);
        cotp.extend_from_slice(&tsap.to_be_bytes());
    }
    cotp[0] = (cotp.len() - 1) as u8;
    cotp
}

fn parse_connect_tpdu(cotp: &[u8]) -> Result<ConnectionParams, S7Error> {
    if cotp.len() < 7 {
        return Err(S7Error::protocol(
            ErrorCode::ISO_SHORT_PACKET,
            "connection TPDU shorter than its fixed part",
        ));
    }
    let mut params = ConnectionParams {
        dst_ref: u16::from_be_bytes([cotp[2], cotp[3]]),
        src_ref: u16::from_be_bytes([cotp[4], cotp[5]]),
        ..ConnectionParams::default()
    };
    let mut rest = &cotp[7..];
    while !rest.is_empty() {
        let &[code, len, ..] = rest else {
            return Err(S7Error::invalid_pdu("truncated COTP parameter"));
        };
        let value = rest
            .get(2..2 + len as usize)
            .ok_or_else(|| S7Error::invalid_pdu("truncated COTP parameter value"))?;
        match (code, value) {
            (PARAM_TPDU_SIZE, &[size]) => params.tpdu_size = Some(size),
            (PARAM_CALLING_TSAP, &[hi, lo]) => {
                params.calling_tsap = Some(u16::from_be_bytes([hi, lo]))
            }
            (PARAM_CALLED_TSAP, &[hi, lo]) => {
                params.called_tsap = Some(u16::from_be_bytes([hi, lo]))
            }
            _ => log::trace!("ignoring COTP parameter {:#04x} {:02x?}", code, value),
        }
        rest = &rest[2 + len as usize..];
    }
    Ok(params)
}

/// COTP connection request (without TPKT header).
pub fn build_cotp_connection_request(local_tsap: u16, remote_tsap: u16, pdu_size: u16) -> Vec<u8> {
    connect_tpdu(
        COTP_CR,
        &ConnectionParams::request(0x0001, local_tsap, remote_tsap, pdu_size),
    )
}

/// Parses a COTP connection confirm (without TPKT header).
pub fn parse_cotp_connection_confirm(cotp: &[u8]) -> Result<ConnectionParams, S7Error> {
    match Frame::decode_cotp(cotp)? {
        Frame::ConnectionConfirm(params) => Ok(params),
        other => Err(S7Error::protocol(
            ErrorCode::ISO_CONNECT,
            format!("expected connection confirm, got {}", other.kind()),
        )),
    }
}

/// COTP data transfer TPDU (without TPKT header).
pub fn build_cotp_data_transfer(payload: &[u8]) -> Vec<u8> {
    let mut cotp = Vec::with_capacity(DT_HEADER_LEN + payload.len());
    cotp.extend_from_slice(&[0x02, COTP_DT, EOT]);
    cotp.extend_from_slice(payload);
    cotp
}

/// Returns the payload of a COTP data transfer TPDU (without TPKT header).
pub fn parse_cotp_data_transfer(cotp: &[u8]) -> Result<&[u8], S7Error> {
    let &[li, kind, eot, ..] = cotp else {
        return Err(S7Error::protocol(
            ErrorCode::ISO_SHORT_PACKET,
            "data TPDU shorter than its header",
        ));
    };
    if kind != COTP_DT || li != 0x02 {
        return Err(S7Error::invalid_pdu(format!(
            "expected data TPDU, got type {:#04x} with header length {}",
            kind, li
        )));
    }
    if eot & EOT == 0 {
        return Err(S7Error::protocol(
            ErrorCode::ISO_TOO_MANY_FRAGMENTS,
            "fragmented COTP data is not supported",
        ));
    }
    Ok(&cotp[DT_HEADER_LEN..])
}

impl Frame {
    fn kind(&self) -> &'static str {
        match self {
            Frame::ConnectionRequest(_) => "connection request",
            Frame::ConnectionConfirm(_) => "connection confirm",
            Frame::DisconnectRequest { .. } => "disconnect request",
            Frame::Data(_) => "data",
        }
    }

    /// The COTP part of this frame.
    pub fn encode_cotp(&self) -> Vec<u8> {
        match self {
            Frame::ConnectionRequest(params) => connect_tpdu(COTP_CR, params),
            Frame::ConnectionConfirm(params) => connect_tpdu(COTP_CC, params),
            Frame::DisconnectRequest {
                dst_ref,
                src_ref,
                reason,
            } => {
                let mut cotp = vec![0x06, COTP_DR];
                cotp.extend_from_slice(&dst_ref.to_be_bytes());
                cotp.extend_from_slice(&src_ref.to_be_bytes());
                cotp.push(*reason);
                cotp
            }
            Frame::Data(payload) => build_cotp_data_transfer(payload),
        }
    }

    /// The complete frame including the TPKT header.
    pub fn encode(&self) -> Result<Vec<u8>, S7Error> {
        build_tpkt(&self.encode_cotp())
    }

    pub fn decode_cotp(cotp: &[u8]) -> Result<Frame, S7Error> {
        let &[li, kind, ..] = cotp else {
            return Err(S7Error::protocol(
                ErrorCode::ISO_SHORT_PACKET,
                "COTP header missing",
            ));
        };
        if li as usize + 1 > cotp.len() {
            return Err(S7Error::protocol(
                ErrorCode::ISO_INVALID_DATA_SIZE,
                format!(
                    "COTP header length {} exceeds the {} bytes received",
                    li,
                    cotp.len()
                ),
            ));
        }
        let header = &cotp[..li as usize + 1];
        match kind & 0xF0 {
            COTP_CR => parse_connect_tpdu(header).map(Frame::ConnectionRequest),
            COTP_CC => parse_connect_tpdu(header).map(Frame::ConnectionConfirm),
            COTP_DR => {
                let &[_, _, d0, d1, s0, s1, reason, ..] = header else {
                    return Err(S7Error::protocol(
                        ErrorCode::ISO_SHORT_PACKET,
                        "disconnect request too short",
                    ));
                };
                Ok(Frame::DisconnectRequest {
                    dst_ref: u16::from_be_bytes([d0, d1]),
                    src_ref: u16::from_be_bytes([s0, s1]),
                    reason,
                })
            }
            COTP_DT => parse_cotp_data_transfer(cotp).map(|payload| Frame::Data(payload.to_vec())),
            other => Err(S7Error::invalid_pdu(format!(
                "unsupported COTP type {:#04x}",
                other
            ))),
        }
    }

    /// Decodes one complete frame including the TPKT header.
    pub fn decode(frame: &[u8]) -> Result<Frame, S7Error> {
        let len = parse_tpkt_header(frame)?;
        if len != frame.len() {
            return Err(S7Error::protocol(
                ErrorCode::ISO_INVALID_DATA_SIZE,
                format!("TPKT announces {} bytes, got {}", len, frame.len()),
            ));
        }
        Frame::decode_cotp(&frame[TPKT_HEADER_LEN..])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tpkt_header() {
        let frame = build_tpkt(&[0xAA, 0xBB]).unwrap();
        assert_eq!(frame, vec![0x03, 0x00, 0x00, 0x06, 0xAA, 0xBB]);
        assert_eq!(parse_tpkt_header(&frame).unwrap(), 6);
    }

    #[test]
    fn connection_request_layout() {
        let cotp = build_cotp_connection_request(0x0100, 0x0102, 480);
        assert_eq!(
            cotp,
            vec![
                0x11, 0xE0, 0x00, 0x00, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A, 0xC1, 0x02, 0x01,
                0x00, 0xC2, 0x02, 0x01, 0x02
            ]
        );
        let frame = build_tpkt(&cotp).unwrap();
        assert_eq!(frame.len(), 22);
        match Frame::decode(&frame).unwrap() {
            Frame::ConnectionRequest(params) => {
                assert_eq!(params.calling_tsap, Some(0x0100));
                assert_eq!(params.called_tsap, Some(0x0102));
                assert_eq!(params.tpdu_len(), Some(1024));
            }
            other => panic!("expected connection request, got {:?}", other),
        }
    }

    #[test]
    fn confirm_echoes_request() {
        let request = ConnectionParams::request(0x0001, 0x0100, 0x0102, 480);
        let confirm = request.confirm(0x4431);
        let cotp = Frame::ConnectionConfirm(confirm).encode_cotp();
        let parsed = parse_cotp_connection_confirm(&cotp).unwrap();
        assert_eq!(parsed.dst_ref, 0x0001);
        assert_eq!(parsed.src_ref, 0x4431);
        assert_eq!(parsed.called_tsap, Some(0x0102));
    }

    #[test]
    fn confirm_rejects_other_types() {
        let cotp = build_cotp_data_transfer(&[1, 2, 3]);
        match parse_cotp_connection_confirm(&cotp) {
            Err(S7Error::Protocol { code, .. }) => assert_eq!(code, ErrorCode::ISO_CONNECT),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn data_transfer() {
        let cotp = build_cotp_data_transfer(&[0x32, 0x01]);
        assert_eq!(cotp, vec![0x02, 0xF0, 0x80, 0x32, 0x01]);
        assert_eq!(parse_cotp_data_transfer(&cotp).unwrap(), &[0x32, 0x01]);
    }

    #[test]
    fn fragmented_data_is_rejected() {
        match parse_cotp_data_transfer(&[0x02, 0xF0, 0x00, 0x32]) {
            Err(S7Error::Protocol { code, .. }) => {
                assert_eq!(code, ErrorCode::ISO_TOO_MANY_FRAGMENTS)
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn malformed_headers() {
        assert!(parse_tpkt_header(&[0x04, 0x00, 0x00, 0x10]).is_err());
        assert!(parse_tpkt_header(&[0x03, 0x00, 0x00, 0x05]).is_err());
        assert!(Frame::decode(&[0x03, 0x00, 0x00, 0x09, 0x02, 0xF0, 0x80]).is_err());
        assert!(Frame::decode_cotp(&[0x10, 0xE0, 0x00]).is_err());
        assert!(Frame::decode_cotp(&[0x02, 0x70, 0x80]).is_err());
    }

    #[test]
    fn disconnect_request() {
        let frame = Frame::DisconnectRequest {
            dst_ref: 0x1234,
            src_ref: 0x0001,
            reason: 0x80,
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), 11);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn tpdu_size_codes() {
        assert_eq!(tpdu_size_code(240), 0x0A);
        assert_eq!(tpdu_size_code(960), 0x0A);
        assert_eq!(tpdu_size_code(1920), 0x0B);
        assert_eq!(tpdu_size_code(u16::MAX), 0x0D);
    }
}
