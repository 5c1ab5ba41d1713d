// Copyright 2020 Joyent, Inc.

//! DSI: the session transport underneath the Apple Filing Protocol
//!
//! The Data Stream Interface carries AFP commands over a reliable byte stream
//! (TCP port 548).  This crate is the client side of that transport: packet
//! framing, the OpenSession handshake, matching concurrent requests to their
//! responses over one connection, and answering server keepalives.  AFP
//! payloads are opaque here.
//!
//! Protocol definition
//!
//! Every DSI packet is a 16-byte header followed by a body:
//!
//! ```text
//! 0        1        2        4            8            12           16
//! +--------+--------+--------+------------+------------+------------+----
//! | FLAGS  |  CMD   | REQID  | ERRCODE    | DATALEN    | RESERVED   | DATA
//! +--------+--------+--------+------------+------------+------------+----
//! ```
//!
//! * FLAGS     1-byte integer.  0x0 for a request, 0x1 for a response.
//!
//! * CMD       1-byte integer command code:
//!
//!     * DSICloseSession  0x1
//!     * DSICommand       0x2
//!     * DSIGetStatus     0x3
//!     * DSIOpenSession   0x4
//!     * DSITickle        0x5
//!     * DSIWrite         0x6
//!     * DSIAttention     0x8
//!
//! * REQID     2-byte big-endian request identifier.  A response carries the
//!             identifier of the request it answers.
//!
//! * ERRCODE   4-byte big-endian result code, meaningful in responses only.
//!
//! * DATALEN   4-byte big-endian count of body bytes following the header.
//!
//! * RESERVED  4 bytes, always zero.
//!
//! DSIOpenSession bodies hold a sequence of options, each a 1-byte type, a
//! 1-byte length and that many bytes of data.
//!
//! Request IDs: each session draws identifiers from a random seed and
//! increments them with 16-bit wraparound.
//!
//! Framing has no resynchronization marker, so any malformed or truncated
//! frame ends the session.

#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod protocol;
mod receiver;

pub use client::{Session, SessionState};
pub use config::SessionConfig;
pub use error::{DsiError, Result};
pub use protocol::{DsiCommand, DsiHeader, DsiOption, DsiPacket};
