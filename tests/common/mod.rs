//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use tokio::sync::broadcast;

use wirelink::config::ServerConfig;
use wirelink::net::stream::DEFAULT_MAX_LINE_BYTES;
use wirelink::net::tls::ServerTls;
use wirelink::net::Connection;
use wirelink::protocol::Initiator;
use wirelink::{Blacklist, Event, ServerEngine};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Server config bound to an ephemeral loopback port.
pub fn local_config() -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        drain_timeout_secs: 2,
        ..ServerConfig::default()
    }
}

/// Start a server and subscribe before anything can happen.
pub async fn start_server(
    config: ServerConfig,
    tls: Option<ServerTls>,
    blacklist: Blacklist,
) -> (ServerEngine, broadcast::Receiver<Event>, SocketAddr) {
    let server = ServerEngine::new(config, tls, blacklist);
    let events = server.subscribe();
    let addr = server.start().await.unwrap();
    (server, events, addr)
}

/// A bare connection to `addr`, no handshake yet.
pub async fn raw_client(addr: SocketAddr) -> Connection {
    Connection::connect(&addr.to_string(), TIMEOUT, DEFAULT_MAX_LINE_BYTES)
        .await
        .unwrap()
}

/// A connection that has completed the digest handshake.
pub async fn handshaken_client(addr: SocketAddr) -> Connection {
    let conn = raw_client(addr).await;
    Initiator::new(Some(TIMEOUT)).initiate(&conn).await.unwrap();
    conn
}

/// Wait for the first event `pick` maps to `Some`, failing after [`TIMEOUT`].
pub async fn wait_for<T>(events: &mut broadcast::Receiver<Event>, mut pick: impl FnMut(Event) -> Option<T>) -> T {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait until `count` sessions have reached Active.
pub async fn wait_ready(events: &mut broadcast::Receiver<Event>, count: usize) {
    for _ in 0..count {
        wait_for(events, |e| matches!(e, Event::ConnectionReady { .. }).then_some(())).await;
    }
}

/// Self-signed identity for "localhost".
pub struct Identity {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
    pub cert_pem: String,
}

impl Identity {
    pub fn generate() -> Self {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        Self {
            cert: cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
            cert_pem: cert.pem(),
        }
    }

    pub fn server_tls(&self) -> ServerTls {
        ServerTls::new(vec![self.cert.clone()], self.key.clone_key()).unwrap()
    }

    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.clone()).unwrap();
        roots
    }
}
