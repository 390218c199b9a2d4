//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for wirelink.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct WirelinkConfig {
    /// Accepting side: listener, handshake, admission.
    pub server: ServerConfig,

    /// Server TLS identity.
    pub tls: TlsConfig,

    /// Connecting side, used by `wirelink-client`.
    pub client: ClientConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:7400").
    pub bind_address: String,

    /// Maximum concurrent connections. Further sockets are turned away.
    pub max_connections: usize,

    /// Accept any handshake line instead of checking the digest.
    pub ignore_handshake: bool,

    /// How long to wait for the initiator's handshake line.
    pub handshake_timeout_ms: u64,

    /// Longest accepted line, terminator excluded.
    pub max_line_bytes: usize,

    /// Line sent to every live session when the server stops.
    pub shutdown_notice: String,

    /// How long to wait for the write side when sending the shutdown notice.
    pub notice_timeout_ms: u64,

    /// How long `stop` waits for session tasks before aborting them.
    pub drain_timeout_secs: u64,

    /// Peer IP addresses refused at accept time.
    pub blacklist: Vec<String>,

    /// Notification buffer per subscriber.
    pub event_capacity: usize,
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn notice_timeout(&self) -> Duration {
        Duration::from_millis(self.notice_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7400".to_string(),
            max_connections: 10_000,
            ignore_handshake: false,
            handshake_timeout_ms: 5000,
            max_line_bytes: 64 * 1024,
            shutdown_notice: "Server is shutting down.".to_string(),
            notice_timeout_ms: 1000,
            drain_timeout_secs: 5,
            blacklist: Vec::new(),
            event_capacity: 1024,
        }
    }
}

/// Server TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// Upgrade every session to TLS after the handshake.
    pub enabled: bool,

    /// Path to certificate chain (PEM).
    pub cert_path: String,

    /// Path to private key (PEM).
    pub key_path: String,

    /// Deadline for the TLS handshake.
    pub handshake_timeout_ms: u64,
}

impl TlsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: String::new(),
            key_path: String::new(),
            handshake_timeout_ms: 10_000,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or IP address.
    pub host: String,

    /// Server port.
    pub port: u16,

    /// Name to verify the server certificate against. Defaults to `host`.
    pub server_name: Option<String>,

    /// TCP connect timeout.
    pub connect_timeout_ms: u64,

    /// How long to wait for the handshake acknowledgment. Unset waits forever.
    pub handshake_timeout_ms: Option<u64>,

    /// Upgrade to TLS after the handshake.
    pub tls_enabled: bool,

    /// Extra trust anchors (PEM). Without it only the anchors in this file
    /// are trusted, so strict validation needs one.
    pub ca_path: Option<String>,

    /// Accept any server certificate. Testing only.
    pub accept_invalid_certs: bool,

    /// Reconnect backoff settings.
    pub reconnect: ReconnectConfig,

    /// Longest accepted line, terminator excluded.
    pub max_line_bytes: usize,
}

impl ClientConfig {
    /// `host:port` as passed to the resolver.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7400,
            server_name: None,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: Some(10_000),
            tls_enabled: false,
            ca_path: None,
            accept_invalid_certs: false,
            reconnect: ReconnectConfig::default(),
            max_line_bytes: 64 * 1024,
        }
    }
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts before giving up. Zero means a single attempt.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 5000,
            max_attempts: 5,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level when `RUST_LOG` is unset (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Serve Prometheus metrics.
    pub metrics_enabled: bool,

    /// Metrics endpoint address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
