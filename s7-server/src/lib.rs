//! # S7 Server Library
//!
//! A software S7 PLC: it accepts ISO-on-TCP connections from S7 clients and serves
//! memory areas registered by the application.
//!
//! ## Overview
//!
//! The server answers the functions a client needs to talk to a real CPU:
//!
//! - **Setup communication**: PDU negotiation, capped at [`server::Config::max_pdu`]
//! - **Read/Write var**: single and multi item access to registered areas
//! - **PLC control/stop**: switches the emulated CPU between RUN and STOP
//! - **User data**: system status lists 0x0000, 0x0011, 0x001C and 0x0424 (split
//!   over several PDUs when needed), clock read/set, session password, block lists
//!
//! Anything else is answered with an error PDU. A malformed request never closes the
//! connection.
//!
//! ## Basic Usage
//!
//! ```ignore
//! use s7_protocol::types::Area;
//! use s7_server::server::Builder;
//!
//! let server = Builder::new().local_port(1102).build();
//! server.register_area(Area::DB, 1, vec![0; 100])?;
//! server.start()?;
//!
//! while let Some(event) = server.pick_event() {
//!     println!("{}", s7_server::event::event_text(&event));
//! }
//!
//! server.with_area(Area::DB, 1, |data| println!("{:02x?}", &data[..8]))?;
//! server.stop();
//! ```
//!
//! ## Areas
//!
//! [`area::AreaTable`] keys areas by `(Area, index)`. The index is the data block
//! number for [`s7_protocol::types::Area::DB`] and ignored otherwise. Every area has its
//! own lock: clients on different areas proceed in parallel, accesses to one area are
//! serialized. Reads running past the end of an area are zero padded, writes are
//! truncated; both are logged as warnings.
//!
//! ## Events
//!
//! Connections, requests and lifecycle changes are recorded as [`event::Event`]s in a
//! bounded queue. Use [`server::Server::set_mask`] to filter them and
//! [`server::Server::set_event_callback`] to observe them as they happen.
//!
//! ## Logging
//!
//! This crate uses the `log` crate for diagnostics. Configure logging with an
//! implementation like `env_logger`:
//!
//! ```ignore
//! env_logger::init();
//! ```
//!
//! ## Thread Model
//!
//! The accept loop runs on its own thread and starts one thread per client.
//! [`server::Server::stop`] waits for all of them to finish.
pub mod area;
pub mod error;
pub mod event;
mod handler;
pub mod server;
