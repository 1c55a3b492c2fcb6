//! Transport Abstraction Layer
//!
//! The tunnel is a stack of four nested layers. Each one is consumed through
//! the traits in this module so that any conforming implementation (the
//! defaults in [`crate::stack`], or in-memory doubles in tests) can be
//! substituted:
//!
//! ```text
//! MuxSession          many streams over one duplex channel
//!     ↓
//! Secure channel      BoxedStream (encrypted)
//!     ↓
//! Ordered transport   BoxedStream (reliable, ordered)
//!     ↓
//! PacketConn          unreliable datagrams (DNS)
//!     ↓
//! BoundResolver       local UDP socket + resolver address
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;

use crate::config::{RemoteServer, Resolver};
use crate::dns::DomainName;
use crate::error::Result;

/// Connection-oriented, reliable, ordered byte stream
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// Connectionless, message-oriented datagrams
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Queue one packet for sending. Packets may be dropped.
    async fn send(&self, packet: Bytes) -> io::Result<()>;

    /// Receive the next packet.
    async fn recv(&self) -> io::Result<Bytes>;

    /// Largest packet accepted by `send`
    fn max_packet_size(&self) -> usize;

    async fn close(&self) -> io::Result<()>;
}

/// Teardown handle for one layer, independent of the stream it produced
/// (which is usually owned by the layer above).
#[async_trait]
pub trait LayerHandle: Send + Sync {
    async fn close(&self) -> io::Result<()>;
}

/// Closes a packet channel as a layer.
pub struct PacketConnHandle(pub Arc<dyn PacketConn>);

#[async_trait]
impl LayerHandle for PacketConnHandle {
    async fn close(&self) -> io::Result<()> {
        self.0.close().await
    }
}

/// Output of a bring-up stage: what the next stage consumes, plus the handle
/// the tunnel keeps for teardown.
pub struct Layer<T> {
    pub io: T,
    pub handle: Arc<dyn LayerHandle>,
}

impl<T> Layer<T> {
    pub fn new(io: T, handle: Arc<dyn LayerHandle>) -> Self {
        Self { io, handle }
    }
}

/// A resolver socket ready to exchange datagrams with the resolver
pub struct BoundResolver {
    pub socket: Arc<UdpSocket>,
    pub remote: SocketAddr,
}

/// Ordered transport parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedTransportConfig {
    /// Fresh identifier for this session
    pub session_id: u32,
    /// Transport unit size
    pub mtu: usize,
    /// Allow adjacent writes to be coalesced
    pub stream_mode: bool,
    pub congestion_control: bool,
    pub send_window: u16,
    pub recv_window: u16,
}

/// Multiplexer parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Protocol version, pinned for interoperability
    pub version: u8,
    /// Session and streams close after this long without traffic
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Receive window advertised for each stream
    pub max_stream_buffer: u32,
    pub max_frame_size: u16,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            version: 2,
            idle_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(10),
            max_stream_buffer: 1024 * 1024,
            max_frame_size: 32768,
        }
    }
}

/// One logical stream of a multiplexed session
pub struct MuxStream {
    pub id: u32,
    pub io: BoxedStream,
}

#[async_trait]
pub trait MuxSession: Send + Sync {
    async fn open_stream(&self) -> io::Result<MuxStream>;

    async fn close(&self) -> io::Result<()>;

    fn is_closed(&self) -> bool;

    /// Number of streams currently open
    fn num_streams(&self) -> usize;
}

/// Constructors for every layer of a tunnel session, called by
/// [`crate::tunnel::Tunnel`] strictly in declaration order.
#[async_trait]
pub trait TunnelStack: Send + Sync {
    async fn bind_resolver(&self, resolver: &Resolver) -> Result<Layer<BoundResolver>>;

    async fn open_dns_transport(
        &self,
        resolver: &Resolver,
        bound: &BoundResolver,
        server: &RemoteServer,
        domain: &DomainName,
    ) -> Result<Layer<Arc<dyn PacketConn>>>;

    async fn open_ordered_transport(
        &self,
        packets: Arc<dyn PacketConn>,
        config: &OrderedTransportConfig,
    ) -> Result<Layer<BoxedStream>>;

    async fn open_secure_channel(
        &self,
        conn: BoxedStream,
        remote_public_key: &[u8],
    ) -> Result<Layer<BoxedStream>>;

    async fn open_multiplexer(
        &self,
        conn: BoxedStream,
        config: &MuxConfig,
    ) -> Result<Arc<dyn MuxSession>>;
}

/// Layer handle that only releases a value it holds; used for layers with no
/// shutdown protocol of their own (the resolver socket).
pub struct ReleaseHandle<T: Send + Sync> {
    value: std::sync::Mutex<Option<T>>,
}

impl<T: Send + Sync> ReleaseHandle<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: std::sync::Mutex::new(Some(value)),
        }
    }

    pub fn is_released(&self) -> bool {
        self.value
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }
}

#[async_trait]
impl<T: Send + Sync> LayerHandle for ReleaseHandle<T> {
    async fn close(&self) -> io::Result<()> {
        let released = self
            .value
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "release handle poisoned"))?
            .take();
        drop(released);
        Ok(())
    }
}
