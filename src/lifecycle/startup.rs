//! Startup orchestration.
//!
//! # Responsibilities
//! - Turn a validated configuration into a ready-to-start server
//! - Load the TLS identity before anything binds
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The listener binds last, in `ServerEngine::start`

use std::path::Path;

use thiserror::Error;

use crate::config::schema::WirelinkConfig;
use crate::net::tls::{ServerTls, TlsError};
use crate::security::blacklist::{Blacklist, BlacklistError};
use crate::server::ServerEngine;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to load TLS identity: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Blacklist(#[from] BlacklistError),
}

/// Build a server from `config`. Nothing is bound yet.
pub fn build_server(config: &WirelinkConfig) -> Result<ServerEngine, StartupError> {
    let tls = if config.tls.enabled {
        let identity = ServerTls::from_pem_files(Path::new(&config.tls.cert_path), Path::new(&config.tls.key_path))?
            .with_handshake_timeout(config.tls.handshake_timeout());
        tracing::info!(cert_path = %config.tls.cert_path, "TLS identity loaded");
        Some(identity)
    } else {
        None
    };

    let blacklist = Blacklist::from_entries(&config.server.blacklist)?;

    Ok(ServerEngine::new(config.server.clone(), tls, blacklist))
}
