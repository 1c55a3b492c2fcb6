//! Nahan: DNS Tunnel Client
//!
//! Nahan carries local TCP connections to a remote tunnel server inside DNS
//! queries and responses sent through an ordinary recursive resolver. Every
//! local connection becomes one stream of a single multiplexed, encrypted,
//! reliable session.
//!
//! ## Quick Start
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use nahan::{Outbound, RemoteServer, Resolver, ResolverKind, TunnelSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), nahan::TunnelError> {
//!     let resolver = Resolver::new(ResolverKind::Udp, "9.9.9.9:53")?;
//!     let server = RemoteServer::new(
//!         "t.example.com",
//!         "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
//!     )?;
//!
//!     let outbound = Outbound::new(vec![resolver], vec![server], TunnelSettings::default());
//!     outbound.start("127.0.0.1:7000").await
//! }
//! ```
//!
//! ### As a Command-Line Tool
//!
//! ```bash
//! nahan-client --udp 9.9.9.9:53 --pubkey-file server.pub t.example.com 127.0.0.1:7000
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────────────────────────────┐
//! │    Local    │────▶│ Outbound (TCP listener)                  │
//! │ Application │     │   └─ StreamBridge per connection         │
//! └─────────────┘     └──────────────────────────────────────────┘
//!                            │ one stream per connection
//!                            ▼
//!                     ┌──────────────┐
//!                     │  Multiplexer │  smux v2
//!                     ├──────────────┤
//!                     │    Secure    │  Noise NK
//!                     │   Channel    │
//!                     ├──────────────┤
//!                     │   Ordered    │  KCP
//!                     │  Transport   │
//!                     ├──────────────┤
//!                     │     DNS      │  TXT queries via resolver
//!                     │  Transport   │
//!                     └──────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod dns;
pub mod error;
pub mod mux;
pub mod noise_transport;
pub mod outbound;
pub mod reliable_transport;
pub mod stack;
pub mod transport;
pub mod tunnel;

// Re-export core types
pub use bridge::{BridgeStats, StreamBridge};
pub use config::{
    ClientConfig, Endpoints, RemoteServer, Resolver, ResolverKind, TunnelSettings, KEY_LEN,
    MIN_MTU,
};
pub use dns::{name_capacity, DomainName};
pub use error::{Result, Stage, TunnelError};
pub use noise_transport::NoiseKeypair;
pub use outbound::{Acceptor, Outbound};
pub use stack::DefaultStack;
pub use transport::{
    BoundResolver, BoxedStream, DuplexStream, Layer, LayerHandle, MuxConfig, MuxSession,
    MuxStream, OrderedTransportConfig, PacketConn, TunnelStack,
};
pub use tunnel::{LayerKind, LayerOutcome, TeardownReport, Tunnel};
