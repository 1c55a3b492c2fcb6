//! Nahan - DNS Tunnel Client
//!
//! Listens for local TCP connections and carries each one through a DNS
//! tunnel to the server responsible for DOMAIN.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info};
use std::path::PathBuf;

use nahan::config::{read_public_key_file, ResolverEntry, ServerEntry};
use nahan::{ClientConfig, Outbound, ResolverKind};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "nahan-client")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "DNS tunnel client", long_about = None)]
struct Cli {
    /// Resolver address (host:port) to send DNS queries to over UDP
    #[arg(long, value_name = "ADDR", group = "resolver")]
    udp: Option<String>,

    /// DNS over TLS resolver address (not supported)
    #[arg(long, value_name = "ADDR", group = "resolver")]
    dot: Option<String>,

    /// DNS over HTTPS resolver URL (not supported)
    #[arg(long, value_name = "URL", group = "resolver")]
    doh: Option<String>,

    /// Server public key, 64 hex digits
    #[arg(long, value_name = "HEX", conflicts_with = "pubkey_file")]
    pubkey: Option<String>,

    /// File holding the server public key in hex
    #[arg(long, value_name = "FILE")]
    pubkey_file: Option<PathBuf>,

    /// Maximum number of concurrently bridged connections
    #[arg(long, value_name = "N")]
    max_connections: Option<usize>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Tunnel domain, e.g. t.example.com
    #[arg(value_name = "DOMAIN", required_unless_present = "config")]
    domain: Option<String>,

    /// Local address to listen on, e.g. 127.0.0.1:7000
    #[arg(value_name = "LISTEN_ADDR", required_unless_present = "config")]
    listen: Option<String>,
}

impl Cli {
    /// Merge command-line endpoints into the file configuration. Endpoints
    /// given on the command line are preferred over the file's.
    fn into_config(self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ClientConfig::default(),
        };

        let resolver = match (self.udp, self.dot, self.doh) {
            (Some(address), _, _) => Some((ResolverKind::Udp, address)),
            (_, Some(address), _) => Some((ResolverKind::DnsOverTls, address)),
            (_, _, Some(address)) => Some((ResolverKind::DnsOverHttps, address)),
            _ => None,
        };
        if let Some((kind, address)) = resolver {
            config.resolvers.insert(0, ResolverEntry { kind, address });
        }

        if let Some(domain) = self.domain {
            let pubkey = match (self.pubkey, &self.pubkey_file) {
                (Some(hex), _) => hex,
                (None, Some(path)) => read_public_key_file(path)
                    .with_context(|| format!("cannot read pubkey from file {}", path.display()))?,
                (None, None) => bail!("the --pubkey or --pubkey-file option is required"),
            };
            config.servers.insert(
                0,
                ServerEntry {
                    domain,
                    pubkey: Some(pubkey),
                    pubkey_file: None,
                },
            );
        }

        if let Some(listen) = self.listen {
            config.listen = Some(listen);
        }
        if self.max_connections.is_some() {
            config.tunnel.max_connections = self.max_connections;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    let mut logger = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        if cli.verbose {
            logger.filter_level(log::LevelFilter::Debug);
        } else {
            logger.filter_level(log::LevelFilter::Info);
        }
    }
    logger.format_timestamp_millis().init();

    let config = cli.into_config()?;
    let listen = config
        .listen
        .clone()
        .context("no listen address given on the command line or in the config file")?;
    let endpoints = config.validate().context("invalid configuration")?;

    info!("nahan-client {}", LONG_VERSION);
    let outbound = Outbound::from_endpoints(endpoints, config.tunnel.clone());

    tokio::select! {
        result = outbound.start(&listen) => {
            result.with_context(|| format!("serving on {}", listen))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }

    let report = outbound.close().await;
    debug!("teardown: {}", report);
    Ok(())
}
