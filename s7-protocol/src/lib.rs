//! # S7 Protocol Library
//!
//! This crate implements the byte level parts of the Siemens S7 communication protocol
//! as spoken by S7-300/400/1200/1500 PLCs over ISO-on-TCP (RFC 1006).
//!
//! ## Overview
//!
//! The protocol is layered:
//!
//! - **TPKT** frames a byte stream into packets (`[0x03, 0x00, len_hi, len_lo]`)
//! - **COTP** performs the connection handshake (CR/CC) and carries data TPDUs
//! - **S7 PDUs** carry jobs (setup communication, read/write variable, PLC control)
//!   and user data (system status lists, block directory, clock, security)
//!
//! This library provides:
//!
//! - [`wire`]: conversions between PLC memory encodings and native values
//! - [`frame`]: TPKT and COTP frame construction and parsing
//! - [`codec`]: blocking frame I/O over [`std::io::Read`]/[`std::io::Write`], plus an
//!   optional `tokio_util` codec (feature `tokio`)
//! - [`pdu`] and [`userdata`]: request builders and response parsers
//! - [`error`]: the error taxonomy and the Snap7 compatible error code table
//!
//! Networking is left to the `s7-client` and `s7-server` crates.
//!
//! ## Basic Usage
//!
//! ### Interpreting PLC memory
//!
//! ```
//! use s7_protocol::wire;
//!
//! let mut buffer = [0u8; 8];
//! wire::set_real(&mut buffer, 0, 3.14159).unwrap();
//! wire::set_int(&mut buffer, 4, -42).unwrap();
//! wire::set_bit(&mut buffer, 6, 3, true).unwrap();
//!
//! assert!((wire::get_real(&buffer, 0).unwrap() - 3.14159).abs() < 1e-5);
//! assert_eq!(wire::get_int(&buffer, 4).unwrap(), -42);
//! assert_eq!(buffer[6], 0x08);
//! ```
//!
//! ### Framing a read request
//!
//! ```
//! use s7_protocol::{frame::Frame, pdu, types::{AddressSpec, Area, WordLen}};
//!
//! let spec = AddressSpec::new(Area::DB, 1, 10, WordLen::Byte, 4);
//! let request = pdu::read_request(1, &[spec]).unwrap();
//!
//! let mut out = Vec::new();
//! Frame::Data(request.encode()).write_to(&mut out).unwrap();
//! assert_eq!(out[..7], [0x03, 0x00, 0x00, 0x1F, 0x02, 0xF0, 0x80]);
//! ```
//!
//! ### Reading frames from a stream
//!
//! ```
//! use s7_protocol::frame::{Frame, MAX_FRAME_LEN};
//! use std::io::Cursor;
//!
//! let mut reader = Cursor::new(vec![0x03, 0x00, 0x00, 0x09, 0x02, 0xF0, 0x80, 0x32, 0x03]);
//! let frame = Frame::from_reader(&mut reader, MAX_FRAME_LEN).unwrap();
//! assert_eq!(frame, Frame::Data(vec![0x32, 0x03]));
//! ```
//!
//! ## Error Handling
//!
//! Everything that talks to a peer returns [`error::S7Error`]. Each error carries a numeric
//! [`error::ErrorCode`] from the Snap7 code space, which [`error::error_text`] renders.
//! The scalar helpers in [`wire`] use the narrower [`error::CodecError`].
//!
//! ## Limitations
//!
//! COTP data is single fragment only. Frames without the end-of-transmission mark are rejected.

pub mod codec;
pub mod error;
pub mod frame;
pub mod pdu;
pub mod types;
pub mod userdata;
pub mod wire;
