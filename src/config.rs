//! Client configuration
//!
//! Endpoint values ([`Resolver`], [`RemoteServer`]) are validated at
//! construction and immutable afterwards. [`ClientConfig`] is the TOML file
//! form, turned into validated endpoints by [`ClientConfig::validate`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dns::{name_capacity, DomainName};
use crate::error::{Result, TunnelError};
use crate::transport::MuxConfig;

/// Length of a Noise static public key
pub const KEY_LEN: usize = 32;

/// Random padding bytes in data-carrying DNS queries
pub const MAX_PADDING: usize = crate::dns::packet_conn::NUM_PADDING;

/// Client id prefixed to every upstream query
pub const CLIENT_ID_LEN: usize = 8;

/// Smallest transport unit the ordered transport can work with
pub const MIN_MTU: usize = 80;

/// Number of queued packets per direction; flow-control windows are half
pub const QUEUE_SIZE: usize = crate::dns::packet_conn::QUEUE_SIZE;

/// How DNS queries reach the recursive resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    Udp,
    #[serde(rename = "dot")]
    DnsOverTls,
    #[serde(rename = "doh")]
    DnsOverHttps,
}

impl fmt::Display for ResolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolverKind::Udp => "udp",
            ResolverKind::DnsOverTls => "dot",
            ResolverKind::DnsOverHttps => "doh",
        })
    }
}

/// A recursive resolver the tunnel sends its queries through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolver {
    kind: ResolverKind,
    address: String,
}

impl Resolver {
    /// Only plain UDP resolvers are supported.
    pub fn new(kind: ResolverKind, address: impl Into<String>) -> Result<Self> {
        if kind != ResolverKind::Udp {
            return Err(TunnelError::UnsupportedResolverKind(kind.to_string()));
        }
        Ok(Self {
            kind,
            address: address.into(),
        })
    }

    pub fn kind(&self) -> ResolverKind {
        self.kind
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

/// The tunnel server: its domain and Noise static public key, plus the
/// transport unit size that fits under the domain.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteServer {
    domain: DomainName,
    public_key_hex: String,
    public_key: [u8; KEY_LEN],
    mtu: usize,
}

impl RemoteServer {
    pub fn new(domain: &str, public_key_hex: &str) -> Result<Self> {
        let domain_name =
            DomainName::parse(domain).map_err(|e| TunnelError::InvalidDomain {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;

        let public_key = decode_public_key(public_key_hex)?;

        let mtu = name_capacity(&domain_name) as isize
            - CLIENT_ID_LEN as isize
            - 1
            - MAX_PADDING as isize
            - 1;
        if mtu < MIN_MTU as isize {
            return Err(TunnelError::MtuTooSmall {
                domain: domain_name.to_string(),
                mtu,
            });
        }

        Ok(Self {
            domain: domain_name,
            public_key_hex: public_key_hex.trim().to_ascii_lowercase(),
            public_key,
            mtu: mtu as usize,
        })
    }

    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public_key
    }

    /// Largest packet the ordered transport may hand to the DNS transport
    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

impl fmt::Debug for RemoteServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteServer")
            .field("domain", &self.domain.to_string())
            .field("public_key", &self.public_key_hex)
            .field("mtu", &self.mtu)
            .finish()
    }
}

/// Decode a hex-encoded static public key.
pub fn decode_public_key(s: &str) -> Result<[u8; KEY_LEN]> {
    let s = s.trim();
    if s.len() != KEY_LEN * 2 {
        return Err(TunnelError::InvalidPublicKey(format!(
            "length is {}, expected {}",
            s.len(),
            KEY_LEN * 2
        )));
    }
    let bytes = hex::decode(s).map_err(|e| TunnelError::InvalidPublicKey(e.to_string()))?;
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Read a public key from a file holding its hex encoding.
pub fn read_public_key_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| TunnelError::Config(format!("reading {}: {}", path.display(), e)))
}

/// Session tuning knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Session and streams close after this long without traffic
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Receive buffer per multiplexed stream
    pub max_stream_buffer: u32,

    pub max_frame_size: u16,

    /// Cap on concurrently bridged connections; unlimited when unset
    pub max_connections: Option<usize>,

    #[serde(with = "humantime_serde")]
    pub accept_backoff_initial: Duration,

    #[serde(with = "humantime_serde")]
    pub accept_backoff_max: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        let mux = MuxConfig::default();
        Self {
            idle_timeout: mux.idle_timeout,
            keepalive_interval: mux.keepalive_interval,
            max_stream_buffer: mux.max_stream_buffer,
            max_frame_size: mux.max_frame_size,
            max_connections: None,
            accept_backoff_initial: Duration::from_millis(5),
            accept_backoff_max: Duration::from_secs(1),
        }
    }
}

impl TunnelSettings {
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            idle_timeout: self.idle_timeout,
            keepalive_interval: self.keepalive_interval,
            max_stream_buffer: self.max_stream_buffer,
            max_frame_size: self.max_frame_size,
            ..MuxConfig::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.keepalive_interval.is_zero() || self.idle_timeout.is_zero() {
            return Err(TunnelError::Config(
                "idle_timeout and keepalive_interval must be non-zero".into(),
            ));
        }
        if self.keepalive_interval >= self.idle_timeout {
            return Err(TunnelError::Config(format!(
                "keepalive_interval ({}) must be shorter than idle_timeout ({})",
                humantime::format_duration(self.keepalive_interval),
                humantime::format_duration(self.idle_timeout)
            )));
        }
        if self.max_frame_size == 0 || self.max_stream_buffer < self.max_frame_size as u32 {
            return Err(TunnelError::Config(
                "max_stream_buffer must hold at least one frame".into(),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(TunnelError::Config("max_connections must be at least 1".into()));
        }
        if self.accept_backoff_initial > self.accept_backoff_max {
            return Err(TunnelError::Config(
                "accept_backoff_initial exceeds accept_backoff_max".into(),
            ));
        }
        Ok(())
    }
}

/// Resolver entry of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverEntry {
    #[serde(default = "default_resolver_kind")]
    pub kind: ResolverKind,
    pub address: String,
}

fn default_resolver_kind() -> ResolverKind {
    ResolverKind::Udp
}

/// Server entry of the configuration file; exactly one of `pubkey` and
/// `pubkey_file` is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub domain: String,
    #[serde(default)]
    pub pubkey: Option<String>,
    #[serde(default)]
    pub pubkey_file: Option<PathBuf>,
}

impl ServerEntry {
    fn public_key_hex(&self) -> Result<String> {
        match (&self.pubkey, &self.pubkey_file) {
            (Some(_), Some(_)) => Err(TunnelError::Config(format!(
                "server {}: only one of pubkey and pubkey_file may be set",
                self.domain
            ))),
            (Some(hex), None) => Ok(hex.clone()),
            (None, Some(path)) => read_public_key_file(path),
            (None, None) => Err(TunnelError::Config(format!(
                "server {}: pubkey or pubkey_file is required",
                self.domain
            ))),
        }
    }
}

/// Validated endpoint lists, in preference order
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub resolvers: Vec<Resolver>,
    pub servers: Vec<RemoteServer>,
}

/// Client configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local TCP listen address
    #[serde(default)]
    pub listen: Option<String>,

    #[serde(default)]
    pub resolvers: Vec<ResolverEntry>,

    #[serde(default)]
    pub servers: Vec<ServerEntry>,

    #[serde(default)]
    pub tunnel: TunnelSettings,
}

impl ClientConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TunnelError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| TunnelError::Config(e.to_string()))
    }

    /// Build validated resolvers and servers. Empty lists are rejected.
    pub fn validate(&self) -> Result<Endpoints> {
        self.tunnel.validate()?;

        if self.resolvers.is_empty() {
            return Err(TunnelError::NoEndpointsConfigured("resolvers"));
        }
        if self.servers.is_empty() {
            return Err(TunnelError::NoEndpointsConfigured("servers"));
        }

        let resolvers = self
            .resolvers
            .iter()
            .map(|r| Resolver::new(r.kind, r.address.clone()))
            .collect::<Result<Vec<_>>>()?;

        let servers = self
            .servers
            .iter()
            .map(|s| RemoteServer::new(&s.domain, &s.public_key_hex()?))
            .collect::<Result<Vec<_>>>()?;

        Ok(Endpoints { resolvers, servers })
    }
}
