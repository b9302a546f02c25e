/// Read and write implementations for TPKT frames
use std::io::{Read, Write};

use crate::{
    error::{ErrorCode, S7Error},
    frame::{Frame, TPKT_HEADER_LEN, parse_tpkt_header},
};

impl Frame {
    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), S7Error> {
        let bytes = self.encode()?;
        writer.write_all(&bytes).map_err(S7Error::from_send)?;
        writer.flush().map_err(S7Error::from_send)
    }

    /// Reads exactly one frame. Frames longer than `max_len` bytes are rejected.
    pub fn from_reader(reader: &mut impl Read, max_len: usize) -> Result<Frame, S7Error> {
        let mut header = [0u8; TPKT_HEADER_LEN];
        reader
            .read_exact(&mut header)
            .map_err(S7Error::from_receive)?;
        let len = parse_tpkt_header(&header)?;
        if len > max_len {
            return Err(S7Error::protocol(
                ErrorCode::ISO_PDU_OVERFLOW,
                format!("frame of {} bytes exceeds the limit of {}", len, max_len),
            ));
        }
        let mut body = vec![0u8; len - TPKT_HEADER_LEN];
        reader.read_exact(&mut body).map_err(S7Error::from_receive)?;
        Frame::decode_cotp(&body)
    }
}


/// Async framing for [tokio_util::codec::Framed].
#[cfg(feature = "tokio")]
pub mod tokio {
    use bytes::{Buf, BufMut, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use crate::{
        error::{ErrorCode, S7Error},
        frame::{Frame, MAX_FRAME_LEN, TPKT_HEADER_LEN, parse_tpkt_header},
    };

    /// Splits a byte stream into TPKT frames.
    #[derive(Debug, Clone)]
    pub struct TpktCodec {
        max_len: usize,
    }

    impl TpktCodec {
        pub fn new(max_len: usize) -> Self {
            TpktCodec { max_len }
        }
    }

    impl Default for TpktCodec {
        fn default() -> Self {
            TpktCodec::new(MAX_FRAME_LEN)
        }
    }

    impl Decoder for TpktCodec {
        type Item = Frame;
        type Error = S7Error;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, S7Error> {
            if src.len() < TPKT_HEADER_LEN {
                return Ok(None);
            }
            let len = parse_tpkt_header(&src[..TPKT_HEADER_LEN])?;
            if len > self.max_len {
                return Err(S7Error::protocol(
                    ErrorCode::ISO_PDU_OVERFLOW,
                    format!("frame of {} bytes exceeds the limit of {}", len, self.max_len),
                ));
            }
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            let mut frame = src.split_to(len);
            frame.advance(TPKT_HEADER_LEN);
            Frame::decode_cotp(&frame).map(Some)
        }
    }

    impl Encoder<Frame> for TpktCodec {
        type Error = S7Error;

        fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), S7Error> {
            let bytes = item.encode()?;
            dst.reserve(bytes.len());
            dst.put_slice(&bytes);
            Ok(())
        }
    }

}
