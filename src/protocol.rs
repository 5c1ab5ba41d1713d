// Copyright 2020 Joyent, Inc.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DsiError, Result};

const DSI_OFF_FLAGS: usize = 0x0;
const DSI_OFF_COMMAND: usize = 0x1;
const DSI_OFF_REQID: usize = 0x2;
const DSI_OFF_ERRCODE: usize = 0x4;
const DSI_OFF_DATALEN: usize = 0x8;
const DSI_OFF_RESERVED: usize = 0xc;

pub const DSI_HEADER_SZ: usize = 0x10;

/// Largest body the codec will buffer unless told otherwise.
pub const DSI_DEFAULT_MAX_BODY: usize = 16 * 1024 * 1024;

/// Option type for the attention quantum a client offers in OpenSession.
pub const DSI_OPT_ATTENTION_QUANTUM: u8 = 0x01;

const DSI_OPT_HEADER_SZ: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DsiFlags {
    Request = 0,
    Response = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DsiCommand {
    CloseSession = 1,
    Command = 2,
    GetStatus = 3,
    OpenSession = 4,
    Tickle = 5,
    Write = 6,
    Attention = 8,
}

impl DsiCommand {
    pub fn name(self) -> &'static str {
        match self {
            DsiCommand::CloseSession => "DSICloseSession",
            DsiCommand::Command => "DSICommand",
            DsiCommand::GetStatus => "DSIGetStatus",
            DsiCommand::OpenSession => "DSIOpenSession",
            DsiCommand::Tickle => "DSITickle",
            DsiCommand::Write => "DSIWrite",
            DsiCommand::Attention => "DSIAttention",
        }
    }
}

/// The fixed 16-byte header that precedes every DSI packet.
///
/// `flags` and `command` are kept as the raw wire bytes so that a packet with
/// an unknown command code still decodes and can be reported by whoever
/// dispatches it.  The reserved word is always written as zero and ignored
/// when reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DsiHeader {
    pub flags: u8,
    pub command: u8,
    pub request_id: u16,
    pub error_code: u32,
    pub total_data_length: u32,
}

impl DsiHeader {
    pub fn request(command: DsiCommand, request_id: u16) -> DsiHeader {
        DsiHeader {
            flags: DsiFlags::Request as u8,
            command: command as u8,
            request_id,
            error_code: 0,
            total_data_length: 0,
        }
    }

    pub fn response(
        command: DsiCommand,
        request_id: u16,
        error_code: u32,
    ) -> DsiHeader {
        DsiHeader {
            flags: DsiFlags::Response as u8,
            command: command as u8,
            request_id,
            error_code,
            total_data_length: 0,
        }
    }

    pub fn flags(&self) -> Option<DsiFlags> {
        DsiFlags::from_u8(self.flags)
    }

    pub fn is_request(&self) -> bool {
        self.flags() == Some(DsiFlags::Request)
    }

    pub fn is_response(&self) -> bool {
        self.flags() == Some(DsiFlags::Response)
    }

    pub fn command(&self) -> Result<DsiCommand> {
        DsiCommand::from_u8(self.command)
            .ok_or(DsiError::UnexpectedCommand(self.command))
    }

    pub fn encode(&self) -> [u8; DSI_HEADER_SZ] {
        let mut buf = [0; DSI_HEADER_SZ];
        buf[DSI_OFF_FLAGS] = self.flags;
        buf[DSI_OFF_COMMAND] = self.command;
        BigEndian::write_u16(&mut buf[DSI_OFF_REQID..DSI_OFF_ERRCODE], self.request_id);
        BigEndian::write_u32(&mut buf[DSI_OFF_ERRCODE..DSI_OFF_DATALEN], self.error_code);
        BigEndian::write_u32(
            &mut buf[DSI_OFF_DATALEN..DSI_OFF_RESERVED],
            self.total_data_length,
        );
        buf
    }

    /// Decode the first 16 bytes of `buf`.  Anything past the header is left
    /// for the caller.
    pub fn decode(buf: &[u8]) -> Result<DsiHeader> {
        if buf.len() < DSI_HEADER_SZ {
            return Err(DsiError::MalformedHeader {
                available: buf.len(),
            });
        }

        Ok(DsiHeader {
            flags: buf[DSI_OFF_FLAGS],
            command: buf[DSI_OFF_COMMAND],
            request_id: BigEndian::read_u16(&buf[DSI_OFF_REQID..DSI_OFF_ERRCODE]),
            error_code: BigEndian::read_u32(&buf[DSI_OFF_ERRCODE..DSI_OFF_DATALEN]),
            total_data_length: BigEndian::read_u32(
                &buf[DSI_OFF_DATALEN..DSI_OFF_RESERVED],
            ),
        })
    }
}

impl fmt::Display for DsiHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = self.command().map(DsiCommand::name).unwrap_or("unknown");
        write!(
            f,
            "DSI {{flags={:#x}, command={}({}), requestID={:#x}, \
             errorCode={}, totalDataLength={:#x}}}",
            self.flags,
            name,
            self.command,
            self.request_id,
            self.error_code,
            self.total_data_length
        )
    }
}

/// One `(type, length, data)` triple from an OpenSession body.  The data is
/// opaque at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsiOption {
    option_type: u8,
    data: Bytes,
}

impl DsiOption {
    /// Fails if `data` does not fit the one-byte length field.
    pub fn new<B: Into<Bytes>>(option_type: u8, data: B) -> Result<DsiOption> {
        let data = data.into();
        if data.len() > usize::from(u8::max_value()) {
            return Err(DsiError::OptionTooLong {
                len: data.len(),
                max: usize::from(u8::max_value()),
            });
        }
        Ok(DsiOption { option_type, data })
    }

    pub fn attention_quantum(quantum: u32) -> DsiOption {
        DsiOption {
            option_type: DSI_OPT_ATTENTION_QUANTUM,
            data: Bytes::copy_from_slice(&quantum.to_be_bytes()),
        }
    }

    pub fn option_type(&self) -> u8 {
        self.option_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn encoded_len(&self) -> usize {
        DSI_OPT_HEADER_SZ + self.data.len()
    }
}

/// Parse a sequence of options that exactly fills `buf`.  Every declared
/// length is checked against what remains before the data is sliced.
pub fn parse_options(buf: &[u8]) -> Result<Vec<DsiOption>> {
    let mut options = Vec::new();
    let mut rest = buf;

    while !rest.is_empty() {
        if rest.len() < DSI_OPT_HEADER_SZ {
            return Err(DsiError::MalformedOptions {
                declared: DSI_OPT_HEADER_SZ,
                remaining: rest.len(),
            });
        }
        let option_type = rest[0];
        let length = usize::from(rest[1]);
        rest = &rest[DSI_OPT_HEADER_SZ..];

        if length > rest.len() {
            return Err(DsiError::MalformedOptions {
                declared: length,
                remaining: rest.len(),
            });
        }
        let (data, tail) = rest.split_at(length);
        options.push(DsiOption {
            option_type,
            data: Bytes::copy_from_slice(data),
        });
        rest = tail;
    }

    Ok(options)
}

pub fn encode_options(options: &[DsiOption], buf: &mut BytesMut) {
    let total: usize = options.iter().map(DsiOption::encoded_len).sum();
    buf.reserve(total);
    for opt in options {
        buf.put_u8(opt.option_type);
        // DsiOption::new guarantees the length fits in a byte
        buf.put_u8(opt.data.len() as u8);
        buf.put_slice(&opt.data);
    }
}

/// A complete frame: header plus exactly `total_data_length` body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsiPacket {
    pub header: DsiHeader,
    pub body: Bytes,
}

/// Request identifiers are scoped to a session.  They start from a seed and
/// increment with 16-bit wraparound.
#[derive(Debug, Clone)]
pub struct DsiRequestId {
    next: u16,
}

impl DsiRequestId {
    pub fn new() -> DsiRequestId {
        DsiRequestId::with_seed(rand::random())
    }

    pub fn with_seed(seed: u16) -> DsiRequestId {
        DsiRequestId { next: seed }
    }

    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

impl Default for DsiRequestId {
    fn default() -> Self {
        DsiRequestId::new()
    }
}

pub struct DsiCodec {
    max_body_len: usize,
}

impl DsiCodec {
    pub fn new() -> DsiCodec {
        DsiCodec::with_max_body(DSI_DEFAULT_MAX_BODY)
    }

    pub fn with_max_body(max_body_len: usize) -> DsiCodec {
        DsiCodec { max_body_len }
    }
}

impl Default for DsiCodec {
    fn default() -> Self {
        DsiCodec::new()
    }
}

impl Decoder for DsiCodec {
    type Item = DsiPacket;
    type Error = DsiError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<DsiPacket>> {
        if buf.len() < DSI_HEADER_SZ {
            buf.reserve(DSI_HEADER_SZ - buf.len());
            return Ok(None);
        }

        let header = DsiHeader::decode(&buf[..DSI_HEADER_SZ])?;
        let body_len = header.total_data_length as usize;
        if body_len > self.max_body_len {
            return Err(DsiError::BodyTooLarge {
                declared: body_len,
                limit: self.max_body_len,
            });
        }

        let frame_len = DSI_HEADER_SZ + body_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(DSI_HEADER_SZ);
        let body = buf.split_to(body_len).freeze();
        Ok(Some(DsiPacket { header, body }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<DsiPacket>> {
        match self.decode(buf)? {
            Some(packet) => Ok(Some(packet)),
            None if buf.is_empty() => Ok(None),
            // A partial frame at end of stream can never be completed
            None => Err(DsiError::ConnectionClosed),
        }
    }
}

impl Encoder<DsiPacket> for DsiCodec {
    type Error = DsiError;

    fn encode(&mut self, packet: DsiPacket, buf: &mut BytesMut) -> Result<()> {
        let DsiPacket { mut header, body } = packet;
        if body.len() > u32::max_value() as usize {
            return Err(DsiError::BodyTooLarge {
                declared: body.len(),
                limit: u32::max_value() as usize,
            });
        }
        header.total_data_length = body.len() as u32;

        buf.reserve(DSI_HEADER_SZ + body.len());
        buf.put_slice(&header.encode());
        buf.put_slice(&body);
        Ok(())
    }
}
