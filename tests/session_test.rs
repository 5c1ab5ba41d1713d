// Copyright 2020 Joyent, Inc.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use slog::{info, o, Drain, Level, LevelFilter, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

use dsi_client::protocol::DsiCodec;
use dsi_client::{
    DsiCommand, DsiError, DsiHeader, DsiPacket, Session, SessionConfig,
    SessionState,
};

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn config() -> SessionConfig {
    SessionConfig {
        attention_quantum: None,
        ..SessionConfig::default()
    }
}

/// The server end of a simulated DSI connection.
struct Peer {
    framed: Framed<DuplexStream, DsiCodec>,
}

impl Peer {
    async fn recv(&mut self) -> DsiPacket {
        self.framed
            .next()
            .await
            .expect("client hung up")
            .expect("client sent a malformed packet")
    }

    async fn send(&mut self, header: DsiHeader, body: &[u8]) {
        self.framed
            .send(DsiPacket {
                header,
                body: Bytes::copy_from_slice(body),
            })
            .await
            .expect("failed to write to client");
    }

    async fn reply(&mut self, request: &DsiPacket, body: &[u8]) {
        let command = request.header.command().unwrap();
        let header = DsiHeader::response(command, request.header.request_id, 0);
        self.send(header, body).await;
    }

    async fn expect_hangup(&mut self) {
        let next = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("client never hung up");
        assert!(next.is_none(), "expected end of stream");
    }
}

async fn open_pair(config: SessionConfig) -> (Session, Peer) {
    open_pair_with_capacity(config, 64 * 1024).await
}

/// A small `capacity` makes the client's writes stall until the peer reads.
async fn open_pair_with_capacity(
    config: SessionConfig,
    capacity: usize,
) -> (Session, Peer) {
    let (client, server) = tokio::io::duplex(capacity);
    let mut peer = Peer {
        framed: Framed::new(server, DsiCodec::new()),
    };

    let open =
        tokio::spawn(async move { Session::open_stream(client, &config, None).await });
    let request = peer.recv().await;
    assert!(request.header.is_request());
    assert_eq!(request.header.command().unwrap(), DsiCommand::OpenSession);
    peer.reply(&request, &[]).await;

    let session = open.await.unwrap().expect("handshake failed");
    assert_eq!(session.state(), SessionState::Open);
    (session, peer)
}

async fn wait_for_state(session: &Session, state: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.state() != state {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("session never reached the expected state");
}

async fn wait_for_pending(session: &Session, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.pending_requests() != count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("requests never registered");
}

#[tokio::test]
async fn open_get_status_close_over_tcp() {
    let log = test_log();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    info!(log, "listening for DSI sessions"; "address" => addr);

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut open = [0u8; 16];
        stream.read_exact(&mut open).await.unwrap();
        assert_eq!(&open[..4], &[0, 4, 0x12, 0x34]);
        assert_eq!(&open[4..], &[0; 12]);
        let mut reply = open;
        reply[0] = 1;
        stream.write_all(&reply).await.unwrap();

        let mut status = [0u8; 18];
        stream.read_exact(&mut status).await.unwrap();
        assert_eq!(
            status,
            [0, 3, 0x12, 0x35, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 15, 0]
        );
        let body = b"AFP server info";
        let mut reply = DsiHeader::response(DsiCommand::GetStatus, 0x1235, 0);
        reply.total_data_length = body.len() as u32;
        stream.write_all(&reply.encode()).await.unwrap();
        stream.write_all(body).await.unwrap();

        let mut close = [0u8; 16];
        stream.read_exact(&mut close).await.unwrap();
        assert_eq!(&close[..4], &[0, 1, 0x12, 0x36]);

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    });

    let config = SessionConfig {
        request_id_seed: Some(0x1234),
        ..config()
    };
    let session = Session::open(addr, &config, Some(&log)).await.unwrap();
    let body = session
        .send_command(DsiCommand::GetStatus, vec![15, 0])
        .await
        .unwrap();
    assert_eq!(&body[..], b"AFP server info");

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_matched_by_id() {
    let (session, mut peer) = open_pair(config()).await;
    let session = Arc::new(session);

    let mut callers = Vec::new();
    for i in 0..8u8 {
        let session = Arc::clone(&session);
        callers.push(tokio::spawn(async move {
            let payload = vec![i; usize::from(i) + 1];
            let body = session
                .send_command(DsiCommand::Command, payload.clone())
                .await
                .unwrap();
            assert_eq!(&body[..], &payload[..]);
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..8 {
        requests.push(peer.recv().await);
    }
    let ids: HashSet<u16> = requests.iter().map(|r| r.header.request_id).collect();
    assert_eq!(ids.len(), 8);
    for request in &requests {
        assert_eq!(request.header.total_data_length as usize, request.body.len());
    }

    for request in requests.iter().rev() {
        let body = request.body.clone();
        peer.reply(request, &body).await;
    }

    for caller in callers {
        caller.await.unwrap();
    }
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn tickle_answered_while_request_pending() {
    let (session, mut peer) = open_pair(config()).await;
    let session = Arc::new(session);

    let caller = Arc::clone(&session);
    let status = tokio::spawn(async move { caller.get_status().await });

    let request = peer.recv().await;
    assert_eq!(request.header.command().unwrap(), DsiCommand::GetStatus);
    assert_eq!(&request.body[..], &[15, 0]);

    peer.send(DsiHeader::request(DsiCommand::Tickle, 0x7777), &[])
        .await;
    let tickle = peer.recv().await;
    assert!(tickle.header.is_response());
    assert_eq!(tickle.header.command().unwrap(), DsiCommand::Tickle);
    assert_eq!(tickle.header.request_id, 0x7777);
    assert_eq!(tickle.header.total_data_length, 0);
    assert!(tickle.body.is_empty());

    peer.reply(&request, b"server-info").await;
    assert_eq!(&status.await.unwrap().unwrap()[..], b"server-info");
}

#[tokio::test]
async fn dropped_connection_fails_every_pending_request() {
    let (session, mut peer) = open_pair(config()).await;
    let session = Arc::new(session);

    let mut callers = Vec::new();
    for i in 0..4u8 {
        let session = Arc::clone(&session);
        callers.push(tokio::spawn(async move {
            session.send_command(DsiCommand::Command, vec![i]).await
        }));
    }
    for _ in 0..4 {
        peer.recv().await;
    }
    drop(peer);

    for caller in callers {
        let result = tokio::time::timeout(Duration::from_secs(5), caller)
            .await
            .expect("caller left hanging")
            .unwrap();
        assert!(matches!(result, Err(DsiError::ConnectionClosed)));
    }

    wait_for_state(&session, SessionState::Closed).await;
    assert!(matches!(
        session.send_command(DsiCommand::Command, vec![0]).await,
        Err(DsiError::ConnectionClosed)
    ));
    session.close().await;
}

#[tokio::test]
async fn server_close_session_ends_session() {
    let (session, mut peer) = open_pair(config()).await;
    let session = Arc::new(session);

    let caller = Arc::clone(&session);
    let pending =
        tokio::spawn(async move { caller.send_command(DsiCommand::Command, vec![1]).await });
    peer.recv().await;

    peer.send(DsiHeader::request(DsiCommand::CloseSession, 3), &[])
        .await;
    assert!(matches!(
        pending.await.unwrap(),
        Err(DsiError::ConnectionClosed)
    ));
    wait_for_state(&session, SessionState::Closed).await;
    peer.expect_hangup().await;

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn handshake_id_mismatch_closes_connection() {
    let (client, server) = tokio::io::duplex(4096);
    let mut peer = Peer {
        framed: Framed::new(server, DsiCodec::new()),
    };

    let open =
        tokio::spawn(async move { Session::open_stream(client, &config(), None).await });
    let request = peer.recv().await;
    let wrong_id = request.header.request_id.wrapping_add(1);
    peer.send(
        DsiHeader::response(DsiCommand::OpenSession, wrong_id, 0),
        &[],
    )
    .await;

    assert!(matches!(
        open.await.unwrap(),
        Err(DsiError::HandshakeFailed(_))
    ));
    peer.expect_hangup().await;
}

#[tokio::test]
async fn timed_out_request_is_forgotten() {
    let config = SessionConfig {
        request_timeout_ms: 50,
        ..config()
    };
    let (session, mut peer) = open_pair(config).await;
    let session = Arc::new(session);

    let caller = Arc::clone(&session);
    let slow =
        tokio::spawn(async move { caller.send_command(DsiCommand::Command, vec![1]).await });
    let late = peer.recv().await;
    assert!(matches!(slow.await.unwrap(), Err(DsiError::Timeout)));
    assert_eq!(session.pending_requests(), 0);

    peer.reply(&late, b"late").await;

    let caller = Arc::clone(&session);
    let fresh =
        tokio::spawn(async move { caller.send_command(DsiCommand::Command, vec![2]).await });
    let request = peer.recv().await;
    assert_ne!(request.header.request_id, late.header.request_id);
    peer.reply(&request, b"fresh").await;
    assert_eq!(&fresh.await.unwrap().unwrap()[..], b"fresh");
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn cancelled_request_releases_its_slot() {
    let (session, mut peer) = open_pair(config()).await;
    let session = Arc::new(session);

    let caller = Arc::clone(&session);
    let call =
        tokio::spawn(async move { caller.send_command(DsiCommand::Command, vec![9]).await });
    let abandoned = peer.recv().await;
    assert_eq!(session.pending_requests(), 1);

    call.abort();
    assert!(call.await.unwrap_err().is_cancelled());
    assert_eq!(session.pending_requests(), 0);

    peer.reply(&abandoned, b"nobody home").await;

    let caller = Arc::clone(&session);
    let next =
        tokio::spawn(async move { caller.send_command(DsiCommand::Command, vec![10]).await });
    let request = peer.recv().await;
    peer.reply(&request, b"ok").await;
    assert_eq!(&next.await.unwrap().unwrap()[..], b"ok");
}

#[tokio::test]
async fn unsolicited_packets_do_not_end_session() {
    let config = SessionConfig {
        request_id_seed: Some(1000),
        ..config()
    };
    let (session, mut peer) = open_pair(config).await;
    let session = Arc::new(session);

    peer.send(DsiHeader::request(DsiCommand::Attention, 40), &[0x80, 0x00])
        .await;
    let unknown_command = DsiHeader {
        flags: 0,
        command: 7,
        request_id: 41,
        error_code: 0,
        total_data_length: 0,
    };
    peer.send(unknown_command, &[]).await;
    let unknown_flags = DsiHeader {
        flags: 2,
        ..DsiHeader::request(DsiCommand::Command, 42)
    };
    peer.send(unknown_flags, &[]).await;
    peer.send(DsiHeader::response(DsiCommand::Command, 43, 0), b"stray")
        .await;

    let caller = Arc::clone(&session);
    let call =
        tokio::spawn(async move { caller.request(DsiCommand::Command, vec![5]).await });
    let request = peer.recv().await;
    let reply = DsiHeader::response(DsiCommand::Command, request.header.request_id, 77);
    peer.send(reply, b"still here").await;

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.header.error_code, 77);
    assert_eq!(&response.body[..], b"still here");
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn close_is_idempotent() {
    let (session, mut peer) = open_pair(config()).await;

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);

    let close = peer.recv().await;
    assert!(close.header.is_request());
    assert_eq!(close.header.command().unwrap(), DsiCommand::CloseSession);
    assert!(close.body.is_empty());
    peer.expect_hangup().await;

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.get_status().await,
        Err(DsiError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn tickle_does_not_hold_up_responses_behind_a_stalled_write() {
    let (session, mut peer) = open_pair_with_capacity(config(), 64).await;
    let session = Arc::new(session);

    let caller = Arc::clone(&session);
    let status = tokio::spawn(async move { caller.get_status().await });
    let status_request = peer.recv().await;

    // The peer stops reading, so this frame stalls with the writer held.
    let caller = Arc::clone(&session);
    let bulk = tokio::spawn(async move {
        caller
            .send_command(DsiCommand::Write, vec![0x42; 8192])
            .await
    });
    wait_for_pending(&session, 2).await;

    peer.send(DsiHeader::request(DsiCommand::Tickle, 0x0909), &[])
        .await;
    peer.reply(&status_request, b"server-info").await;
    let status = tokio::time::timeout(Duration::from_secs(2), status)
        .await
        .expect("status reply held up behind the tickle")
        .unwrap()
        .unwrap();
    assert_eq!(&status[..], b"server-info");

    let write = peer.recv().await;
    assert_eq!(write.header.command().unwrap(), DsiCommand::Write);
    assert_eq!(write.body.len(), 8192);
    let tickle = peer.recv().await;
    assert!(tickle.header.is_response());
    assert_eq!(tickle.header.command().unwrap(), DsiCommand::Tickle);
    assert_eq!(tickle.header.request_id, 0x0909);

    peer.reply(&write, &[]).await;
    assert!(bulk.await.unwrap().unwrap().is_empty());
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn request_timeout_covers_a_stalled_write() {
    let config = SessionConfig {
        request_timeout_ms: 200,
        ..config()
    };
    let (session, _peer) = open_pair_with_capacity(config, 64).await;

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        session.send_command(DsiCommand::Write, vec![0x42; 8192]),
    )
    .await
    .expect("request outlived its timeout");
    assert!(matches!(result, Err(DsiError::Timeout)));

    // Half a frame went out, so the connection cannot carry anything else.
    wait_for_state(&session, SessionState::Closed).await;
    assert_eq!(session.pending_requests(), 0);
    assert!(matches!(
        session.get_status().await,
        Err(DsiError::ConnectionClosed)
    ));
    session.close().await;
}

#[tokio::test]
async fn close_completes_behind_a_stalled_write() {
    let config = SessionConfig {
        close_timeout_ms: 100,
        ..config()
    };
    let (session, mut peer) = open_pair_with_capacity(config, 64).await;
    let session = Arc::new(session);

    let caller = Arc::clone(&session);
    let bulk = tokio::spawn(async move {
        caller
            .send_command(DsiCommand::Write, vec![0x42; 8192])
            .await
    });
    wait_for_pending(&session, 1).await;

    tokio::time::timeout(Duration::from_secs(2), session.close())
        .await
        .expect("close hung behind a stalled write");
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        bulk.await.unwrap(),
        Err(DsiError::ConnectionClosed)
    ));

    // The peer gets the torn Write frame and then end of stream, with no
    // CloseSession after it.
    let next = tokio::time::timeout(Duration::from_secs(5), peer.framed.next())
        .await
        .expect("client never hung up");
    assert!(matches!(next, Some(Err(DsiError::ConnectionClosed))));
}
