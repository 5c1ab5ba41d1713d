// Copyright 2020 Joyent, Inc.

//! Whole-packet reads and writes over an ordered byte stream.
//!
//! The stream is split so that exactly one owner reads while writers take
//! turns on the other half.  Each write hands a complete frame to the codec,
//! so a packet is never interleaved with another on the wire.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{DsiError, Result};
use crate::protocol::{DsiCodec, DsiHeader, DsiPacket};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub struct PacketReader {
    inner: FramedRead<BoxedRead, DsiCodec>,
}

pub struct PacketWriter {
    inner: FramedWrite<BoxedWrite, DsiCodec>,
}

pub fn split<S>(stream: S, max_body_len: usize) -> (PacketReader, PacketWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader: BoxedRead = Box::new(read_half);
    let writer: BoxedWrite = Box::new(write_half);

    (
        PacketReader {
            inner: FramedRead::new(reader, DsiCodec::with_max_body(max_body_len)),
        },
        PacketWriter {
            inner: FramedWrite::new(writer, DsiCodec::with_max_body(max_body_len)),
        },
    )
}

impl PacketReader {
    /// Read the next complete packet.  End of stream, a short read, or any
    /// stream error is reported as `ConnectionClosed`; codec errors are
    /// passed through.  Either way the connection is unusable afterwards.
    pub async fn read_packet(&mut self) -> Result<DsiPacket> {
        match self.inner.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(DsiError::Io(_))) | None => Err(DsiError::ConnectionClosed),
            Some(Err(e)) => Err(e),
        }
    }
}

impl PacketWriter {
    /// Write `header` followed by `body`.  The header's data length is
    /// always taken from `body`.
    pub async fn write_packet(&mut self, header: DsiHeader, body: Bytes) -> Result<()> {
        self.inner
            .send(DsiPacket { header, body })
            .await
            .map_err(|e| match e {
                DsiError::Io(_) => DsiError::ConnectionClosed,
                e => e,
            })
    }

    /// Flush and shut down the write half.
    pub async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}
