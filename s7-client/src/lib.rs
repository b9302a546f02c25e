//! # S7 Client
//!
//! A blocking client for Siemens S7 PLCs, and the peer to peer partner, built on the
//! [`s7_protocol`] crate.
//!
//! ## Overview
//!
//! The connection is assembled from layers, each usable on its own:
//!
//! - [`transport::TransportSocket`]: TCP with exact reads and writes and distinct timeouts
//! - [`iso::IsoConnection`]: the COTP handshake and one PDU per data TPDU
//! - [`engine::S7ConnectionEngine`]: PDU negotiation and all S7 functions, splitting area
//!   transfers so that every request and answer fits the negotiated PDU length
//! - [`client::Client`]: the connection state machine with the familiar Snap7 surface
//! - [`async_client::AsyncClient`]: area transfers on a background job, polled or waited on
//! - [`partner::Partner`]: block oriented send/receive between two stations
//!
//! ## Basic Usage
//!
//! ### Reading and writing a data block
//!
//! ```ignore
//! use s7_client::client::Client;
//! use s7_protocol::wire;
//!
//! let mut client = Client::new();
//! client.connect_to("192.168.0.1", 0, 2)?;
//!
//! let data = client.db_read(1, 0, 8)?;
//! println!("DB1.DBD0 = {}", wire::get_real(&data, 0)?);
//!
//! client.db_write(1, 4, &[0x00, 0x2A])?;
//! client.disconnect();
//! ```
//!
//! ### Several variables in one request
//!
//! ```ignore
//! use s7_protocol::types::{AddressSpec, Area, DataItem, WordLen};
//!
//! let mut items = vec![
//!     DataItem::read(AddressSpec::new(Area::DB, 1, 0, WordLen::Byte, 4)),
//!     DataItem::read(AddressSpec::new(Area::MK, 0, 10, WordLen::Word, 1)),
//! ];
//! client.read_multi_vars(&mut items)?;
//! for item in &items {
//!     println!("{:?}: {:02x?}", item.result, item.data);
//! }
//! ```
//!
//! ### Exchanging data with a partner
//!
//! ```ignore
//! use s7_client::partner::Partner;
//!
//! let partner = Partner::new(true);
//! partner.start_to("0.0.0.0".parse()?, "192.168.0.2", 0x1002, 0x1002)?;
//! partner.b_send(b"recipe 7")?;
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`s7_protocol::error::S7Error`]. A timeout or a lost link leaves
//! the connection unusable: disconnect and connect again. Area transfers that fail midway
//! report how many bytes were moved through [`engine::Partial`].
//!
//! ## Related Crates
//!
//! - [`s7_protocol`](https://docs.rs/s7-protocol/) - Frames, PDUs and value encodings
//! - [`s7_server`](https://docs.rs/s7-server/) - Server implementation
pub mod async_client;
pub mod client;
pub mod engine;
pub mod iso;
pub mod job;
pub mod partner;
pub mod transport;
