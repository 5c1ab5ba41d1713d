// Copyright 2020 Joyent, Inc.

//! Error type shared by every layer of the DSI transport.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DsiError {
    /// Fewer than 16 bytes were available for a header.
    #[error("malformed DSI header: need 16 bytes, got {available}")]
    MalformedHeader { available: usize },

    /// An option declared more data bytes than remain in the buffer.
    #[error("malformed DSI options: option declares {declared} bytes, {remaining} remain")]
    MalformedOptions { declared: usize, remaining: usize },

    /// Option data too long for the 1-byte length field.
    #[error("DSI option data of {len} bytes exceeds the {max}-byte maximum")]
    OptionTooLong { len: usize, max: usize },

    /// A header announced a body larger than the configured limit.
    #[error("DSI body of {declared} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge { declared: usize, limit: usize },

    #[error("DSI handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("DSI connection closed")]
    ConnectionClosed,

    #[error("unexpected DSI command code: {0}")]
    UnexpectedCommand(u8),

    #[error("timed out waiting for DSI response")]
    Timeout,

    #[error("too many pending DSI requests (limit {limit})")]
    TooManyPending { limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DsiError>;
