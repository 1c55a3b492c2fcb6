//! Error types for tunnel configuration, bring-up and steady-state operation

use std::fmt;
use std::io;

/// Bring-up stage of a tunnel session, in strict forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Idle,
    ResolverBound,
    TransportOpen,
    OrderedTransportOpen,
    SecureChannelOpen,
    MultiplexReady,
    Serving,
    Closed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::ResolverBound => "resolver bound",
            Stage::TransportOpen => "dns transport open",
            Stage::OrderedTransportOpen => "ordered transport open",
            Stage::SecureChannelOpen => "secure channel open",
            Stage::MultiplexReady => "multiplex ready",
            Stage::Serving => "serving",
            Stage::Closed => "closed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunnel error types
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Resolver kind other than UDP
    #[error("unsupported resolver type: {0}")]
    UnsupportedResolverKind(String),

    #[error("invalid domain {domain:?}: {reason}")]
    InvalidDomain { domain: String, reason: String },

    #[error("pubkey format error: {0}")]
    InvalidPublicKey(String),

    /// The domain suffix leaves too little room in a DNS name for payload
    #[error("domain {domain} leaves only {mtu} bytes for payload")]
    MtuTooSmall { domain: String, mtu: isize },

    #[error("no {0} configured")]
    NoEndpointsConfigured(&'static str),

    /// The ordered transport refused the requested unit size
    #[error("invalid transport unit size {mtu}: {reason}")]
    InvalidMtuConfiguration { mtu: usize, reason: String },

    #[error("opening local listener: {0}")]
    Listen(#[source] io::Error),

    #[error("failed to bind resolver {address}: {source}")]
    ResolverBind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to open DNS transport: {0}")]
    TransportOpen(#[source] io::Error),

    #[error("noise handshake failed: {0}")]
    Handshake(String),

    #[error("opening multiplex session: {0}")]
    MultiplexSetup(#[source] io::Error),

    #[error("session {session:08x} opening stream: {source}")]
    StreamOpen {
        session: u32,
        #[source]
        source: io::Error,
    },

    #[error("tunnel session is closed")]
    SessionClosed,

    /// A bring-up step was attempted out of order
    #[error("cannot {attempted} while tunnel is {current}")]
    IllegalTransition {
        attempted: &'static str,
        current: Stage,
    },

    /// Bring-up failed at `stage`; `source` is the underlying cause
    #[error("bring-up failed while entering {stage}: {source}")]
    BringUp {
        stage: Stage,
        #[source]
        source: Box<TunnelError>,
    },

    #[error("configuration file error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Wrap a stage failure so callers can tell which layer broke.
    pub fn at_stage(stage: Stage, source: TunnelError) -> Self {
        match source {
            err @ TunnelError::BringUp { .. } => err,
            other => TunnelError::BringUp {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Stage that was being entered when bring-up failed, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            TunnelError::BringUp { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Underlying cause for stage-wrapped errors, `self` otherwise.
    pub fn root(&self) -> &TunnelError {
        match self {
            TunnelError::BringUp { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for operator errors detected before any network I/O.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self.root(),
            TunnelError::UnsupportedResolverKind(_)
                | TunnelError::InvalidDomain { .. }
                | TunnelError::InvalidPublicKey(_)
                | TunnelError::MtuTooSmall { .. }
                | TunnelError::NoEndpointsConfigured(_)
                | TunnelError::InvalidMtuConfiguration { .. }
                | TunnelError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// True for errors a copy loop should treat as a normal end of stream.
pub(crate) fn is_benign_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
