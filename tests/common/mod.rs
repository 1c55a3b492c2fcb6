//! In-memory tunnel stack for integration tests
//!
//! The ordered transport is a `tokio::io::duplex` pipe whose far end is
//! served by a server-role mux session; the secure channel passes bytes
//! through. Every stage and every close is recorded in order.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Notify;

use nahan::mux::Session;
use nahan::{
    BoundResolver, BoxedStream, DomainName, Layer, LayerHandle, MuxConfig, MuxSession, MuxStream,
    OrderedTransportConfig, Outbound, PacketConn, RemoteServer, Resolver, ResolverKind, Stage,
    TunnelError, TunnelSettings, TunnelStack,
};

pub const SERVER_KEY: &str = "2b8d6a2f6a9e6b2a1e7c0f5d4c3b2a190817161514131211100f0e0d0c0b0a09";

/// What the far end does with each stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remote {
    /// Copy every byte back as it arrives
    Echo,
    /// Read to EOF, then answer with the byte count and close
    CountThenReply,
    /// Send [`GREETING`] and FIN first, then read to EOF and record
    /// `counted <n>`
    GreetThenCount,
}

pub const GREETING: &[u8] = b"hello from the far end";

pub type Events = Arc<Mutex<Vec<String>>>;

pub fn events(log: &Events) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn record(log: &Events, event: impl Into<String>) {
    log.lock().unwrap().push(event.into());
}

pub struct FakeStack {
    pub log: Events,
    pub remote: Remote,
    /// Stage whose constructor fails
    pub fail_at: Option<Stage>,
    /// Layer whose close reports an error
    pub fail_close: Option<&'static str>,
    /// Holds `bind_resolver` after it is recorded until notified
    pub gate: Option<Arc<Notify>>,
}

impl FakeStack {
    pub fn new(remote: Remote) -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            remote,
            fail_at: None,
            fail_close: None,
            gate: None,
        }
    }

    fn handle(&self, name: &'static str) -> Arc<dyn LayerHandle> {
        Arc::new(RecordingHandle {
            name,
            log: Arc::clone(&self.log),
            fail: self.fail_close == Some(name),
        })
    }

    fn enter(&self, stage: Stage, name: &str) -> Result<(), TunnelError> {
        record(&self.log, name);
        if self.fail_at == Some(stage) {
            return Err(match stage {
                Stage::ResolverBound => TunnelError::ResolverBind {
                    address: "fake".into(),
                    source: io::Error::new(io::ErrorKind::AddrNotAvailable, "injected"),
                },
                Stage::TransportOpen => TunnelError::TransportOpen(io::Error::new(
                    io::ErrorKind::Other,
                    "injected",
                )),
                Stage::SecureChannelOpen => TunnelError::Handshake("injected".into()),
                Stage::MultiplexReady => TunnelError::MultiplexSetup(io::Error::new(
                    io::ErrorKind::Other,
                    "injected",
                )),
                _ => TunnelError::InvalidMtuConfiguration {
                    mtu: 0,
                    reason: "injected".into(),
                },
            });
        }
        Ok(())
    }
}

struct RecordingHandle {
    name: &'static str,
    log: Events,
    fail: bool,
}

#[async_trait]
impl LayerHandle for RecordingHandle {
    async fn close(&self) -> io::Result<()> {
        record(&self.log, format!("close {}", self.name));
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::Other, "close failed"));
        }
        Ok(())
    }
}

struct NullPacketConn;

#[async_trait]
impl PacketConn for NullPacketConn {
    async fn send(&self, _packet: Bytes) -> io::Result<()> {
        Ok(())
    }

    async fn recv(&self) -> io::Result<Bytes> {
        std::future::pending().await
    }

    fn max_packet_size(&self) -> usize {
        134
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

struct RecordingMux {
    session: Session,
    log: Events,
    fail: bool,
}

#[async_trait]
impl MuxSession for RecordingMux {
    async fn open_stream(&self) -> io::Result<MuxStream> {
        self.session.open_stream().await
    }

    async fn close(&self) -> io::Result<()> {
        record(&self.log, "close mux");
        self.session.close().await?;
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::Other, "close failed"));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    fn num_streams(&self) -> usize {
        self.session.num_streams()
    }
}

async fn serve_remote(conn: BoxedStream, remote: Remote, log: Events) {
    let server = match Session::server(conn, &MuxConfig::default()) {
        Ok(server) => server,
        Err(_) => return,
    };
    while let Ok(stream) = server.accept_stream().await {
        let log = Arc::clone(&log);
        tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(stream.io);
            match remote {
                Remote::Echo => {
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                }
                Remote::CountThenReply => {
                    let mut request = Vec::new();
                    if read.read_to_end(&mut request).await.is_ok() {
                        let reply = format!("received {} bytes", request.len());
                        let _ = write.write_all(reply.as_bytes()).await;
                    }
                }
                Remote::GreetThenCount => {
                    let _ = write.write_all(GREETING).await;
                    let _ = write.shutdown().await;
                    let mut request = Vec::new();
                    if read.read_to_end(&mut request).await.is_ok() {
                        record(&log, format!("counted {}", request.len()));
                    }
                }
            }
            let _ = write.shutdown().await;
        });
    }
}

#[async_trait]
impl TunnelStack for FakeStack {
    async fn bind_resolver(&self, resolver: &Resolver) -> Result<Layer<BoundResolver>, TunnelError> {
        self.enter(Stage::ResolverBound, "bind")?;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let remote: SocketAddr = resolver
            .address()
            .parse()
            .unwrap_or_else(|_| "127.0.0.1:53".parse().unwrap());
        Ok(Layer::new(BoundResolver { socket, remote }, self.handle("resolver")))
    }

    async fn open_dns_transport(
        &self,
        _resolver: &Resolver,
        _bound: &BoundResolver,
        _server: &RemoteServer,
        _domain: &DomainName,
    ) -> Result<Layer<Arc<dyn PacketConn>>, TunnelError> {
        self.enter(Stage::TransportOpen, "dns")?;
        let packets: Arc<dyn PacketConn> = Arc::new(NullPacketConn);
        Ok(Layer::new(packets, self.handle("dns")))
    }

    async fn open_ordered_transport(
        &self,
        _packets: Arc<dyn PacketConn>,
        config: &OrderedTransportConfig,
    ) -> Result<Layer<BoxedStream>, TunnelError> {
        self.enter(Stage::OrderedTransportOpen, "ordered")?;
        record(
            &self.log,
            format!(
                "ordered mtu={} windows={}/{} stream={} cc={}",
                config.mtu,
                config.send_window,
                config.recv_window,
                config.stream_mode,
                config.congestion_control
            ),
        );
        let (local, far) = tokio::io::duplex(256 * 1024);
        tokio::spawn(serve_remote(Box::new(far), self.remote, Arc::clone(&self.log)));
        let io: BoxedStream = Box::new(local);
        Ok(Layer::new(io, self.handle("ordered")))
    }

    async fn open_secure_channel(
        &self,
        conn: BoxedStream,
        remote_public_key: &[u8],
    ) -> Result<Layer<BoxedStream>, TunnelError> {
        self.enter(Stage::SecureChannelOpen, "secure")?;
        assert_eq!(remote_public_key.len(), 32);
        Ok(Layer::new(conn, self.handle("secure")))
    }

    async fn open_multiplexer(
        &self,
        conn: BoxedStream,
        config: &MuxConfig,
    ) -> Result<Arc<dyn MuxSession>, TunnelError> {
        self.enter(Stage::MultiplexReady, "mux")?;
        let session =
            Session::client(conn, config).map_err(|e| TunnelError::MultiplexSetup(e.into()))?;
        Ok(Arc::new(RecordingMux {
            session,
            log: Arc::clone(&self.log),
            fail: self.fail_close == Some("mux"),
        }))
    }
}

pub fn resolver() -> Resolver {
    Resolver::new(ResolverKind::Udp, "127.0.0.1:53").unwrap()
}

pub fn server() -> RemoteServer {
    RemoteServer::new("t.example.com", SERVER_KEY).unwrap()
}

/// Outbound over `stack`, serving on an ephemeral local port
pub struct Running {
    pub outbound: Arc<Outbound>,
    pub addr: SocketAddr,
    pub serve: tokio::task::JoinHandle<Result<(), TunnelError>>,
}

pub async fn start_outbound(stack: Arc<FakeStack>, settings: TunnelSettings) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let outbound = Arc::new(Outbound::with_stack(
        vec![resolver()],
        vec![server()],
        settings,
        stack,
    ));

    let serving = Arc::clone(&outbound);
    let serve = tokio::spawn(async move { serving.serve(listener).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while outbound.local_addr().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("outbound did not start serving");

    Running {
        outbound,
        addr,
        serve,
    }
}

/// Send `data` through a fresh local connection, half-close, and collect
/// everything that comes back.
pub async fn round_trip(addr: SocketAddr, data: Vec<u8>) -> Vec<u8> {
    let conn = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (mut read, mut write) = conn.into_split();
    let writer = tokio::spawn(async move {
        write.write_all(&data).await.unwrap();
        write.shutdown().await.unwrap();
        write
    });
    let mut received = Vec::new();
    read.read_to_end(&mut received).await.unwrap();
    let _write = writer.await.unwrap();
    received
}

/// Poll `done` until it holds, failing the test after ten seconds
pub async fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Layers constructed and layers closed so far, by recorded events
pub fn opened_and_closed(log: &Events) -> (usize, usize) {
    let events = events(log);
    let opened = events
        .iter()
        .filter(|e| matches!(e.as_str(), "bind" | "dns" | "ordered" | "secure" | "mux"))
        .count();
    let closed = events.iter().filter(|e| e.starts_with("close ")).count();
    (opened, closed)
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}
