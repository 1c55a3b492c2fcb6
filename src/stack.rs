//! Default tunnel stack: UDP resolver, DNS packets, KCP, Noise, smux

use async_trait::async_trait;
use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::config::{RemoteServer, Resolver, ResolverKind};
use crate::dns::{DnsPacketConn, DomainName};
use crate::error::{Result, TunnelError};
use crate::mux::Session;
use crate::noise_transport;
use crate::reliable_transport::ReliableTransport;
use crate::transport::{
    BoundResolver, BoxedStream, Layer, MuxConfig, MuxSession, OrderedTransportConfig,
    PacketConn, PacketConnHandle, ReleaseHandle, TunnelStack,
};

/// Layers as deployed against a real tunnel server
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStack;

impl DefaultStack {
    pub fn new() -> Self {
        Self
    }
}

fn require_udp(resolver: &Resolver) -> Result<()> {
    match resolver.kind() {
        ResolverKind::Udp => Ok(()),
        other => Err(TunnelError::UnsupportedResolverKind(other.to_string())),
    }
}

async fn resolve(address: &str) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host(address).await?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} resolved to no addresses", address),
        )
    })
}

#[async_trait]
impl TunnelStack for DefaultStack {
    async fn bind_resolver(&self, resolver: &Resolver) -> Result<Layer<BoundResolver>> {
        require_udp(resolver)?;

        let bind_err = |source| TunnelError::ResolverBind {
            address: resolver.address().to_string(),
            source,
        };
        let remote = resolve(resolver.address()).await.map_err(bind_err)?;
        let local: SocketAddr = if remote.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = Arc::new(UdpSocket::bind(local).await.map_err(bind_err)?);

        debug!(
            "resolver socket {} → {}",
            socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into()),
            remote
        );

        let handle = Arc::new(ReleaseHandle::new(Arc::clone(&socket)));
        Ok(Layer::new(BoundResolver { socket, remote }, handle))
    }

    async fn open_dns_transport(
        &self,
        resolver: &Resolver,
        bound: &BoundResolver,
        server: &RemoteServer,
        domain: &DomainName,
    ) -> Result<Layer<Arc<dyn PacketConn>>> {
        require_udp(resolver)?;

        let conn = DnsPacketConn::new(
            Arc::clone(&bound.socket),
            bound.remote,
            domain.clone(),
            server.mtu(),
        );
        let packets: Arc<dyn PacketConn> = conn;
        let handle = Arc::new(PacketConnHandle(Arc::clone(&packets)));
        Ok(Layer::new(packets, handle))
    }

    async fn open_ordered_transport(
        &self,
        packets: Arc<dyn PacketConn>,
        config: &OrderedTransportConfig,
    ) -> Result<Layer<BoxedStream>> {
        let (stream, handle) = ReliableTransport::open(packets, config)?;
        let io: BoxedStream = Box::new(stream);
        Ok(Layer::new(io, handle))
    }

    async fn open_secure_channel(
        &self,
        conn: BoxedStream,
        remote_public_key: &[u8],
    ) -> Result<Layer<BoxedStream>> {
        let (stream, handle) = noise_transport::client_handshake(conn, remote_public_key).await?;
        let io: BoxedStream = Box::new(stream);
        Ok(Layer::new(io, handle))
    }

    async fn open_multiplexer(
        &self,
        conn: BoxedStream,
        config: &MuxConfig,
    ) -> Result<Arc<dyn MuxSession>> {
        let session =
            Session::client(conn, config).map_err(|e| TunnelError::MultiplexSetup(e.into()))?;
        Ok(Arc::new(session))
    }
}
