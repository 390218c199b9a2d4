use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use wirelink::config::{load_config, WirelinkConfig};
use wirelink::observability::logging;
use wirelink::{ClientEngine, Event};

#[derive(Parser)]
#[command(name = "wirelink-client")]
#[command(about = "Send stdin lines to a wirelink server and print what comes back", long_about = None)]
struct Cli {
    /// TOML configuration file; only the `client` and `observability` sections are used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Upgrade to TLS after the handshake.
    #[arg(long)]
    tls: bool,

    /// Name to verify the server certificate against.
    #[arg(long)]
    server_name: Option<String>,

    /// PEM file with trust anchors for the server certificate.
    #[arg(long)]
    ca: Option<String>,

    /// Accept any server certificate.
    #[arg(long)]
    insecure: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => WirelinkConfig::default(),
    };
    let client = &mut config.client;
    if let Some(host) = cli.host {
        client.host = host;
    }
    if let Some(port) = cli.port {
        client.port = port;
    }
    client.tls_enabled |= cli.tls;
    client.accept_invalid_certs |= cli.insecure;
    if cli.server_name.is_some() {
        client.server_name = cli.server_name;
    }
    if cli.ca.is_some() {
        client.ca_path = cli.ca;
    }

    logging::init_logging(&config.observability)?;

    let engine = ClientEngine::from_config(config.client)?;
    engine.notifier().spawn_subscriber(|event| match event {
        Event::DataReceived { payload, .. } => println!("{payload}"),
        Event::TlsReady { security, .. } => {
            eprintln!("* TLS {:?} {:?}", security.protocol, security.cipher_suite)
        }
        Event::ConnectionClosed { reason, .. } => eprintln!("* connection closed: {reason}"),
        _ => {}
    });

    let session = engine.connect_with_retry().await?;
    eprintln!("* connected to {}", session.connection().remote_endpoint());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.as_str() {
            "/quit" => break,
            "/reconnect" => match engine.reconnect().await {
                Ok(session) => eprintln!("* reconnected to {}", session.connection().remote_endpoint()),
                Err(e) => eprintln!("* reconnect failed: {e}"),
            },
            _ => {
                if let Err(e) = engine.send(&line).await {
                    eprintln!("* send failed: {e}");
                }
            }
        }
    }

    engine.disconnect().await;
    Ok(())
}
