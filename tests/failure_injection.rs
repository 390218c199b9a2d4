//! Failure injection: misbehaving peers must not disturb the server.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use wirelink::{Blacklist, CloseReason, Event};

mod common;
use common::{handshaken_client, local_config, raw_client, start_server, wait_for, wait_ready, TIMEOUT};

#[tokio::test]
async fn oversized_line_faults_only_its_session() {
    let config = wirelink::config::ServerConfig {
        max_line_bytes: 128,
        ..local_config()
    };
    let (server, mut events, addr) = start_server(config, None, Blacklist::new()).await;

    let bystander = handshaken_client(addr).await;
    let offender = handshaken_client(addr).await;
    wait_ready(&mut events, 2).await;

    offender.write_line(&"x".repeat(1024)).await.unwrap();

    let error = wait_for(&mut events, |e| match e {
        Event::ConnectionException { session: Some(_), error } => Some(error),
        _ => None,
    })
    .await;
    assert!(error.contains("128"), "unexpected error: {error}");

    let (remote, reason) = wait_for(&mut events, |e| match e {
        Event::ConnectionClosed { session, reason } => Some((session.connection().remote_endpoint(), reason)),
        _ => None,
    })
    .await;
    assert_eq!(remote, offender.local_endpoint());
    assert!(matches!(reason, CloseReason::Faulted(_)));

    bystander.write_line("still here").await.unwrap();
    let payload = wait_for(&mut events, |e| match e {
        Event::DataReceived { payload, .. } => Some(payload),
        _ => None,
    })
    .await;
    assert_eq!(payload, "still here");
    assert_eq!(server.registry().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn abrupt_disconnect_is_an_ordinary_close() {
    let (server, mut events, addr) = start_server(local_config(), None, Blacklist::new()).await;

    let client = handshaken_client(addr).await;
    wait_ready(&mut events, 1).await;
    client.dispose().await;

    let reason = wait_for(&mut events, |e| match e {
        Event::ConnectionClosed { reason, .. } => Some(reason),
        Event::ConnectionException { error, .. } => panic!("teardown reported as fault: {error}"),
        _ => None,
    })
    .await;
    assert_eq!(reason, CloseReason::RemoteClosed);
    assert!(server.registry().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn garbage_before_handshake_keeps_server_accepting() {
    let (server, mut events, addr) = start_server(local_config(), None, Blacklist::new()).await;

    for _ in 0..5 {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        drop(socket);
    }
    for _ in 0..5 {
        wait_for(&mut events, |e| matches!(e, Event::HandshakeFailed { .. }).then_some(())).await;
    }

    let client = handshaken_client(addr).await;
    wait_ready(&mut events, 1).await;
    assert_eq!(server.registry().len(), 1);

    client.dispose().await;
    server.stop().await;
}

#[tokio::test]
async fn peer_closing_mid_handshake_is_not_registered() {
    let (server, mut events, addr) = start_server(local_config(), None, Blacklist::new()).await;

    let client = raw_client(addr).await;
    wait_for(&mut events, |e| matches!(e, Event::HandshakeBegun { .. }).then_some(())).await;
    client.close().await;

    let reason = wait_for(&mut events, |e| match e {
        Event::ConnectionClosed { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, CloseReason::HandshakeFailed);
    assert!(server.registry().is_empty());

    tokio::time::timeout(TIMEOUT, server.stop()).await.unwrap();
}

#[tokio::test]
async fn stop_during_pending_handshakes_finishes_promptly() {
    let (server, mut events, addr) = start_server(local_config(), None, Blacklist::new()).await;

    let mut pending = Vec::new();
    for _ in 0..4 {
        pending.push(raw_client(addr).await);
    }
    for _ in 0..4 {
        wait_for(&mut events, |e| matches!(e, Event::HandshakeBegun { .. }).then_some(())).await;
    }

    tokio::time::timeout(Duration::from_secs(2), server.stop()).await.unwrap();

    for client in &pending {
        assert_eq!(client.read_line_within(Some(TIMEOUT)).await.unwrap(), None);
    }
}

#[tokio::test]
async fn stop_is_bounded_when_a_peer_stops_reading() {
    let (server, mut events, addr) = start_server(local_config(), None, Blacklist::new()).await;

    let stalled = handshaken_client(addr).await;
    let session = wait_for(&mut events, |e| match e {
        Event::ConnectionReady { session } => Some(session),
        _ => None,
    })
    .await;

    // Fill the socket buffers until a send blocks.
    let sender = {
        let session = session.clone();
        tokio::spawn(async move {
            let chunk = "x".repeat(1 << 20);
            loop {
                if let Err(e) = session.send(&chunk).await {
                    return e;
                }
            }
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!sender.is_finished());

    tokio::time::timeout(Duration::from_secs(4), server.stop())
        .await
        .expect("stop hung behind a blocked send");
    assert!(!server.is_running().await);
    assert!(server.registry().is_empty());

    tokio::time::timeout(TIMEOUT, sender).await.unwrap().unwrap();
    assert_eq!(session.state(), wirelink::SessionState::Closed);
    drop(stalled);
}

#[tokio::test]
async fn local_close_is_bounded_when_a_peer_stops_reading() {
    let (server, mut events, addr) = start_server(local_config(), None, Blacklist::new()).await;

    let _stalled = handshaken_client(addr).await;
    let session = wait_for(&mut events, |e| match e {
        Event::ConnectionReady { session } => Some(session),
        _ => None,
    })
    .await;

    let sender = {
        let session = session.clone();
        tokio::spawn(async move {
            let chunk = "x".repeat(1 << 20);
            while session.send(&chunk).await.is_ok() {}
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    tokio::time::timeout(Duration::from_secs(2), session.close()).await.unwrap();
    tokio::time::timeout(TIMEOUT, sender).await.unwrap().unwrap();
    assert!(session.connection().is_disposed());

    let reason = wait_for(&mut events, |e| match e {
        Event::ConnectionClosed { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, CloseReason::LocalClose);

    server.stop().await;
}
