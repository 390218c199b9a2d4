//! Server and client engines talking over an upgraded connection.

use std::io::Write;
use std::sync::Arc;

use wirelink::config::ClientConfig;
use wirelink::net::tls::{ClientTls, StrictValidator};
use wirelink::session::SessionError;
use wirelink::{Blacklist, ClientEngine, ClientError, CloseReason, Event};

mod common;
use common::{local_config, start_server, wait_for, Identity};

fn client_config(port: u16) -> ClientConfig {
    ClientConfig {
        host: "127.0.0.1".to_string(),
        port,
        server_name: Some("localhost".to_string()),
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn lines_flow_both_ways_after_upgrade() {
    let identity = Identity::generate();
    let (server, mut server_events, addr) =
        start_server(local_config(), Some(identity.server_tls()), Blacklist::new()).await;

    let tls = ClientTls::new("localhost", identity.roots(), Arc::new(StrictValidator)).unwrap();
    let client = ClientEngine::new(client_config(addr.port()), Some(tls));
    let mut client_events = client.subscribe();

    let session = client.connect().await.unwrap();
    assert!(session.is_active());
    assert!(session.connection().is_upgraded());
    let client_security = wait_for(&mut client_events, |e| match e {
        Event::TlsReady { security, .. } => Some(security),
        _ => None,
    })
    .await;

    let server_security = wait_for(&mut server_events, |e| match e {
        Event::TlsReady { security, .. } => Some(security),
        _ => None,
    })
    .await;
    assert_eq!(server_security, client_security);
    let server_session = wait_for(&mut server_events, |e| match e {
        Event::ConnectionReady { session } => Some(session),
        _ => None,
    })
    .await;
    assert!(server_session.connection().is_upgraded());

    client.send("secure hello").await.unwrap();
    let payload = wait_for(&mut server_events, |e| match e {
        Event::DataReceived { payload, .. } => Some(payload),
        _ => None,
    })
    .await;
    assert_eq!(payload, "secure hello");

    server_session.send("secure reply").await.unwrap();
    let reply = wait_for(&mut client_events, |e| match e {
        Event::DataReceived { payload, .. } => Some(payload),
        _ => None,
    })
    .await;
    assert_eq!(reply, "secure reply");

    client.disconnect().await;
    let reason = wait_for(&mut server_events, |e| match e {
        Event::ConnectionClosed { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, CloseReason::RemoteClosed);
    assert!(server.registry().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn untrusted_server_is_refused_by_default() {
    let identity = Identity::generate();
    let (server, mut server_events, addr) =
        start_server(local_config(), Some(identity.server_tls()), Blacklist::new()).await;

    let client = ClientEngine::from_config(ClientConfig {
        tls_enabled: true,
        ..client_config(addr.port())
    })
    .unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::Session(SessionError::Tls(_))));
    assert!(client.session().await.is_none());

    wait_for(&mut server_events, |e| matches!(e, Event::TlsFailed { .. }).then_some(())).await;
    let reason = wait_for(&mut server_events, |e| match e {
        Event::ConnectionClosed { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, CloseReason::TlsFailed);
    assert!(server.registry().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn configured_ca_file_is_trusted() {
    let identity = Identity::generate();
    let (server, _events, addr) = start_server(local_config(), Some(identity.server_tls()), Blacklist::new()).await;

    let mut ca = tempfile::NamedTempFile::new().unwrap();
    ca.write_all(identity.cert_pem.as_bytes()).unwrap();

    let client = ClientEngine::from_config(ClientConfig {
        tls_enabled: true,
        ca_path: Some(ca.path().to_string_lossy().into_owned()),
        ..client_config(addr.port())
    })
    .unwrap();

    let session = client.connect().await.unwrap();
    assert!(session.connection().is_upgraded());

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn accept_invalid_certs_skips_validation() {
    let identity = Identity::generate();
    let (server, _events, addr) = start_server(local_config(), Some(identity.server_tls()), Blacklist::new()).await;

    let client = ClientEngine::from_config(ClientConfig {
        tls_enabled: true,
        accept_invalid_certs: true,
        ..client_config(addr.port())
    })
    .unwrap();

    client.connect().await.unwrap();
    client.send("trusting").await.unwrap();

    client.disconnect().await;
    server.stop().await;
}
