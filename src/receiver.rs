// Copyright 2020 Joyent, Inc.

//! The receive loop: the only reader of a session's connection.
//!
//! Responses are routed to the correlator by request id, server tickles are
//! answered from a task of their own so the loop never waits on the writer,
//! and a server CloseSession ends the session.  Whatever ends the loop, every
//! caller still waiting is failed with `ConnectionClosed` before it returns.

use std::sync::Arc;

use slog::{debug, error, info, trace, warn};

use crate::client::{SessionState, Shared};
use crate::connection::PacketReader;
use crate::error::DsiError;
use crate::protocol::{DsiCommand, DsiFlags, DsiHeader, DsiPacket, DsiRequestId};

enum Flow {
    Continue,
    Stop,
}

pub(crate) async fn receive_loop(shared: Arc<Shared>, mut reader: PacketReader) {
    loop {
        let result = tokio::select! {
            result = reader.read_packet() => result,
            _ = shared.shutdown.cancelled() => {
                if shared.state() == SessionState::Closing {
                    debug!(shared.log, "receive loop asked to stop");
                } else {
                    warn!(shared.log, "write failed, tearing down the connection");
                }
                break;
            }
        };

        match result {
            Ok(packet) => {
                if let Flow::Stop = dispatch(&shared, packet) {
                    break;
                }
            }
            Err(e) => {
                if shared.state() == SessionState::Closing {
                    debug!(shared.log, "connection ended during close"; "err" => %e);
                } else {
                    warn!(shared.log, "connection read failed"; "err" => %e);
                }
                break;
            }
        }
    }

    drop(reader);
    shared.shutdown.cancel();
    shared.release_writer().await;
    shared.set_state(SessionState::Closed);
    let failed = shared.correlator.close();
    info!(shared.log, "DSI session closed"; "failed_requests" => failed);
}

fn dispatch(shared: &Arc<Shared>, packet: DsiPacket) -> Flow {
    let header = packet.header;
    trace!(shared.log, "received packet"; "header" => %header);

    match header.flags() {
        Some(DsiFlags::Response) => {
            if !shared.correlator.resolve(packet) {
                warn!(shared.log, "dropping unmatched response";
                      "request_id" => header.request_id,
                      "command" => header.command);
            }
            Flow::Continue
        }
        Some(DsiFlags::Request) => match header.command() {
            Ok(DsiCommand::Tickle) => {
                answer_tickle(shared, header.request_id);
                Flow::Continue
            }
            Ok(DsiCommand::CloseSession) => {
                info!(shared.log, "server closed the session");
                Flow::Stop
            }
            Ok(command) => {
                debug!(shared.log, "ignoring unsolicited request";
                       "command" => command.name(),
                       "request_id" => header.request_id);
                Flow::Continue
            }
            Err(e) => {
                warn!(shared.log, "protocol violation"; "err" => %e);
                Flow::Continue
            }
        },
        None => {
            warn!(shared.log, "protocol violation: unknown flags";
                  "flags" => header.flags);
            Flow::Continue
        }
    }
}

/// Echo the server's own request id back with an empty body.  The reply
/// queues behind any write in progress, so it is sent from its own task.
fn answer_tickle(shared: &Arc<Shared>, request_id: u16) {
    debug!(shared.log, "answering tickle"; "request_id" => request_id);
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let reply = |_: &mut DsiRequestId| {
            DsiHeader::response(DsiCommand::Tickle, request_id, 0)
        };
        match shared.send_control(reply).await {
            Ok(()) => {}
            Err(DsiError::ConnectionClosed) if shared.shutdown.is_cancelled() => {
                debug!(shared.log, "tickle not answered, session closing";
                       "request_id" => request_id);
            }
            Err(e) => error!(shared.log, "failed to answer tickle"; "err" => %e),
        }
    });
}
