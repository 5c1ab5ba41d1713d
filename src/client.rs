// Copyright 2020 Joyent, Inc.

//! A client-side DSI session.
//!
//! `Session::open` connects and performs the OpenSession handshake before
//! anything else may use the connection.  Once open, a supervised receive
//! task owns every read while any number of callers issue requests through
//! `send_command`; writes are serialized so frames never interleave and
//! request ids are assigned and registered atomically.
//!
//! A write that fails or is abandoned part way through leaves a torn frame
//! on the wire, and there is no way to resynchronize after that.  Such a
//! session is torn down at once: the writer is never handed back, every
//! waiter fails with `ConnectionClosed`, and nobody blocked on the writer
//! stays blocked.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use slog::{debug, error, info, o, trace, warn, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::connection::{self, PacketReader, PacketWriter};
use crate::correlator::{Correlator, PendingRequest};
use crate::error::{DsiError, Result};
use crate::protocol::{
    encode_options, parse_options, DsiCommand, DsiHeader, DsiOption, DsiPacket,
    DsiRequestId,
};
use crate::receiver;

/// AFP `FPGetSrvrInfo` command byte, sent as the body of a DSIGetStatus.
const AFP_GET_SRVR_INFO: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// The write side of the connection and the id generator live behind one
/// lock: holding it is what makes "mint id, register, write" atomic.
pub(crate) struct Outbound {
    /// Lent out for each write and only returned once the frame is fully
    /// written.  `None` once the connection is unusable.
    writer: Option<PacketWriter>,
    ids: DsiRequestId,
}

pub(crate) struct Shared {
    outbound: tokio::sync::Mutex<Outbound>,
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) log: Logger,
    /// Cancelled when the session must come down.  Everything that waits on
    /// the writer also waits on this.
    pub(crate) shutdown: CancellationToken,
    state: Mutex<SessionState>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.lock_state() = state;
        debug!(self.log, "session state changed"; "state" => ?state);
    }

    /// Move an open session to `Closing`.  Returns false if someone else
    /// already started closing it or the connection is gone.
    fn begin_close(&self) -> bool {
        let mut state = self.lock_state();
        match *state {
            SessionState::Closing | SessionState::Closed => false,
            _ => {
                *state = SessionState::Closing;
                true
            }
        }
    }

    /// Write one frame with the lock already held.  An error, or dropping
    /// this future before it finishes, cancels `shutdown`.
    async fn write_frame(
        &self,
        out: &mut Outbound,
        header: DsiHeader,
        body: Bytes,
    ) -> Result<()> {
        let mut writer = out.writer.take().ok_or(DsiError::ConnectionClosed)?;
        let torn = self.shutdown.clone().drop_guard();
        writer.write_packet(header, body).await?;
        torn.disarm();
        out.writer = Some(writer);
        Ok(())
    }

    /// Send a frame that expects no response, such as a tickle reply or a
    /// CloseSession.  Gives up once the session is shutting down.
    pub(crate) async fn send_control<F>(&self, make_header: F) -> Result<()>
    where
        F: FnOnce(&mut DsiRequestId) -> DsiHeader,
    {
        tokio::select! {
            sent = async move {
                let mut out = self.outbound.lock().await;
                let header = make_header(&mut out.ids);
                self.write_frame(&mut out, header, Bytes::new()).await
            } => sent,
            _ = self.shutdown.cancelled() => Err(DsiError::ConnectionClosed),
        }
    }

    /// Mint an id, register it and write the request.  Returns the waiter
    /// once the whole frame is on the wire.
    async fn send_request(
        &self,
        command: DsiCommand,
        payload: Bytes,
    ) -> Result<PendingRequest> {
        let mut out = self.outbound.lock().await;
        let pending = self.register_next(&mut out.ids)?;
        let header = DsiHeader::request(command, pending.request_id());
        trace!(self.log, "sending request";
               "command" => command.name(),
               "request_id" => header.request_id,
               "length" => payload.len());
        self.write_frame(&mut out, header, payload).await?;
        Ok(pending)
    }

    /// Shut the write half down, or drop it if a write never finished.
    /// Called once, by the receive task, after `shutdown` is cancelled; every
    /// other holder of the lock lets go at that point.
    pub(crate) async fn release_writer(&self) {
        let writer = self.outbound.lock().await.writer.take();
        match writer {
            // Every completed write was flushed, so this only shuts down.
            Some(mut writer) => {
                let _ = writer.close().await;
            }
            None => debug!(self.log, "write half abandoned mid-frame"),
        }
    }

    /// Draw ids until one is free.  The correlator's limit is below the id
    /// space, so a free id always exists.
    fn register_next(&self, ids: &mut DsiRequestId) -> Result<PendingRequest> {
        for _ in 0..=usize::from(u16::max_value()) {
            if let Some(pending) = self.correlator.register(ids.next_id())? {
                return Ok(pending);
            }
        }
        Err(DsiError::TooManyPending {
            limit: usize::from(u16::max_value()),
        })
    }
}

pub struct Session {
    shared: Arc<Shared>,
    server_options: Vec<DsiOption>,
    request_timeout: Option<Duration>,
    close_timeout: Duration,
    receiver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect to a DSI server over TCP and open a session.
    pub async fn open<A: ToSocketAddrs>(
        addr: A,
        config: &SessionConfig,
        log: Option<&Logger>,
    ) -> Result<Session> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        debug!(log, "session state changed"; "state" => ?SessionState::Connecting);
        let stream =
            tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
                .await
                .map_err(|_| DsiError::Timeout)??;
        stream.set_nodelay(true)?;

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| String::from("unknown"));
        Session::handshake(stream, config, log.new(o!("peer" => peer))).await
    }

    /// Open a session over an already connected byte stream.
    pub async fn open_stream<S>(
        stream: S,
        config: &SessionConfig,
        log: Option<&Logger>,
    ) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Session::handshake(stream, config, log).await
    }

    async fn handshake<S>(
        stream: S,
        config: &SessionConfig,
        log: Logger,
    ) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        debug!(log, "session state changed"; "state" => ?SessionState::Handshaking);
        let (mut reader, mut writer) = connection::split(stream, config.max_body_len);
        let mut ids = config
            .request_id_seed
            .map(DsiRequestId::with_seed)
            .unwrap_or_default();

        let request_id = ids.next_id();
        let result =
            open_session(&mut reader, &mut writer, request_id, config, &log).await;

        let server_options = match result {
            Ok(options) => options,
            Err(e) => {
                warn!(log, "DSIOpenSession failed"; "err" => %e);
                let _ = writer.close().await;
                return Err(e);
            }
        };

        let shared = Arc::new(Shared {
            outbound: tokio::sync::Mutex::new(Outbound {
                writer: Some(writer),
                ids,
            }),
            correlator: Arc::new(Correlator::new(config.max_pending())),
            log,
            shutdown: CancellationToken::new(),
            state: Mutex::new(SessionState::Handshaking),
        });
        shared.set_state(SessionState::Open);

        let handle = tokio::spawn(receiver::receive_loop(Arc::clone(&shared), reader));

        info!(shared.log, "DSI session open";
              "server_options" => server_options.len());

        Ok(Session {
            shared,
            server_options,
            request_timeout: config.request_timeout(),
            close_timeout: config.close_timeout(),
            receiver: tokio::sync::Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Options the server returned in its OpenSession reply.
    pub fn server_options(&self) -> &[DsiOption] {
        &self.server_options
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.len()
    }

    /// Send `payload` as a `command` request and wait for the correlated
    /// response, returning it whole so the caller can inspect its error code.
    ///
    /// The request timeout covers the whole call: waiting for other writers,
    /// writing the frame and waiting for the reply.  Timing out part way
    /// through a write tears the session down.
    pub async fn request<B: Into<Bytes>>(
        &self,
        command: DsiCommand,
        payload: B,
    ) -> Result<DsiPacket> {
        if self.state() != SessionState::Open {
            return Err(DsiError::ConnectionClosed);
        }
        let payload = payload.into();

        let exchange = async move {
            let pending = tokio::select! {
                sent = self.shared.send_request(command, payload) => sent?,
                _ = self.shared.shutdown.cancelled() => {
                    return Err(DsiError::ConnectionClosed);
                }
            };
            pending.wait(None).await
        };

        match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| DsiError::Timeout)?,
            None => exchange.await,
        }
    }

    /// Send `payload` as a `command` request and return the response body.
    pub async fn send_command<B: Into<Bytes>>(
        &self,
        command: DsiCommand,
        payload: B,
    ) -> Result<Bytes> {
        self.request(command, payload).await.map(|reply| reply.body)
    }

    /// Ask the server for its status block (the AFP server-info reply).
    pub async fn get_status(&self) -> Result<Bytes> {
        self.send_command(
            DsiCommand::GetStatus,
            Bytes::from_static(&[AFP_GET_SRVR_INFO, 0]),
        )
        .await
    }

    /// Send a best-effort CloseSession, shut the connection and wait for the
    /// receive task to finish.  If the writer stays busy past the close
    /// timeout the connection comes down without a CloseSession.  Calling
    /// this again is a no-op.
    pub async fn close(&self) {
        if self.shared.begin_close() {
            let goodbye = self.shared.send_control(|ids| {
                DsiHeader::request(DsiCommand::CloseSession, ids.next_id())
            });
            match tokio::time::timeout(self.close_timeout, goodbye).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(self.shared.log, "DSICloseSession not sent"; "err" => %e)
                }
                Err(_) => debug!(self.shared.log, "DSICloseSession not sent";
                                 "err" => "writer busy"),
            }
        }

        self.shared.shutdown.cancel();

        if let Some(handle) = self.receiver.lock().await.take() {
            if let Err(e) = handle.await {
                error!(self.shared.log, "receive task failed"; "err" => %e);
            }
        }
    }
}

/// A session dropped without `close` still stops its receive task, which
/// then shuts the connection down.
impl Drop for Session {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn open_session(
    reader: &mut PacketReader,
    writer: &mut PacketWriter,
    request_id: u16,
    config: &SessionConfig,
    log: &Logger,
) -> Result<Vec<DsiOption>> {
    let mut body = BytesMut::new();
    encode_options(&config.open_options(), &mut body);
    writer
        .write_packet(
            DsiHeader::request(DsiCommand::OpenSession, request_id),
            body.freeze(),
        )
        .await?;

    let reply = tokio::time::timeout(config.connect_timeout(), reader.read_packet())
        .await
        .map_err(|_| DsiError::Timeout)??;
    debug!(log, "DSIOpenSession reply"; "header" => %reply.header);

    let header = reply.header;
    if !header.is_response() {
        return Err(DsiError::HandshakeFailed(format!(
            "DSIOpenSession reply was not a response: {}",
            header
        )));
    }
    if header.command != DsiCommand::OpenSession as u8 {
        return Err(DsiError::HandshakeFailed(format!(
            "expected a DSIOpenSession reply: {}",
            header
        )));
    }
    if header.request_id != request_id {
        return Err(DsiError::HandshakeFailed(format!(
            "request id did not match, expected={}, actual={}",
            request_id, header.request_id
        )));
    }
    if header.error_code != 0 {
        return Err(DsiError::HandshakeFailed(format!(
            "server refused the session: error code {}",
            header.error_code as i32
        )));
    }

    parse_options(&reply.body)
}
