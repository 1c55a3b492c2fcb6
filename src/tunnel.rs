//! Tunnel session orchestration
//!
//! A [`Tunnel`] brings up the layer stack one stage at a time, strictly in
//! order:
//!
//! ```text
//! Idle → ResolverBound → TransportOpen → OrderedTransportOpen
//!      → SecureChannelOpen → MultiplexReady → Serving
//! ```
//!
//! and tears it down in reverse. `Closed` is reachable from every stage.
//! Every method takes `&self`, so one tunnel is shared by the listener and
//! all stream bridges.

use log::{debug, info};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{RemoteServer, Resolver, QUEUE_SIZE};
use crate::error::{Result, Stage, TunnelError};
use crate::transport::{
    BoundResolver, BoxedStream, LayerHandle, MuxConfig, MuxSession, MuxStream,
    OrderedTransportConfig, PacketConn, TunnelStack,
};

/// One of the torn-down layers, in teardown order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Multiplexer,
    SecureChannel,
    OrderedTransport,
    DnsTransport,
    Resolver,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LayerKind::Multiplexer => "multiplexer",
            LayerKind::SecureChannel => "secure channel",
            LayerKind::OrderedTransport => "ordered transport",
            LayerKind::DnsTransport => "dns transport",
            LayerKind::Resolver => "resolver socket",
        })
    }
}

/// Result of closing one layer
#[derive(Debug)]
pub struct LayerOutcome {
    pub layer: LayerKind,
    pub result: io::Result<()>,
}

/// Per-layer outcomes of a teardown. Only layers that were open appear.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub outcomes: Vec<LayerOutcome>,
}

impl TeardownReport {
    /// True when every layer closed without error
    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn layers(&self) -> Vec<LayerKind> {
        self.outcomes.iter().map(|o| o.layer).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.outcomes.is_empty() {
            return f.write_str("nothing to close");
        }
        for (i, outcome) in self.outcomes.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match &outcome.result {
                Ok(()) => write!(f, "{} closed", outcome.layer)?,
                Err(e) => write!(f, "{} failed: {}", outcome.layer, e)?,
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Handles {
    resolver: Option<Arc<dyn LayerHandle>>,
    dns: Option<Arc<dyn LayerHandle>>,
    ordered: Option<Arc<dyn LayerHandle>>,
    secure: Option<Arc<dyn LayerHandle>>,
    mux: Option<Arc<dyn MuxSession>>,
}

struct Inner {
    stage: Stage,
    handles: Handles,
    /// Products of the last completed stage, consumed by the next one
    bound: Option<BoundResolver>,
    packets: Option<Arc<dyn PacketConn>>,
    conn: Option<BoxedStream>,
}

/// A tunnel session to one server through one resolver
pub struct Tunnel {
    id: u32,
    resolver: Resolver,
    server: RemoteServer,
    mux_config: MuxConfig,
    stack: Arc<dyn TunnelStack>,
    inner: Mutex<Inner>,
    closing: AtomicBool,
}

impl Tunnel {
    pub fn new(
        resolver: Resolver,
        server: RemoteServer,
        mux_config: MuxConfig,
        stack: Arc<dyn TunnelStack>,
    ) -> Self {
        Self {
            id: rand::random(),
            resolver,
            server,
            mux_config,
            stack,
            inner: Mutex::new(Inner {
                stage: Stage::Idle,
                handles: Handles::default(),
                bound: None,
                packets: None,
                conn: None,
            }),
            closing: AtomicBool::new(false),
        }
    }

    /// Session identifier, also the ordered transport's conversation id
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn server(&self) -> &RemoteServer {
        &self.server
    }

    pub fn stage(&self) -> Stage {
        self.lock().stage
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Check that the tunnel sits at `from`, the stage right before the one
    /// `attempted` enters.
    fn expect_stage(&self, from: Stage, attempted: &'static str) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock();
        if self.is_closing() || inner.stage != from {
            return Err(TunnelError::IllegalTransition {
                attempted,
                current: inner.stage,
            });
        }
        Ok(inner)
    }

    /// Record the stage just entered. A teardown that raced with the stage
    /// leaves the new layer to be closed by the caller.
    fn enter(&self, stage: Stage, store: impl FnOnce(&mut Inner)) -> Result<()> {
        let mut inner = self.lock();
        if self.is_closing() {
            return Err(TunnelError::SessionClosed);
        }
        store(&mut inner);
        inner.stage = stage;
        debug!("session {:08x}: {}", self.id, stage);
        Ok(())
    }

    /// Bind a local socket for talking to the resolver.
    pub async fn bind_resolver(&self) -> Result<()> {
        drop(self.expect_stage(Stage::Idle, "bind resolver")?);

        let layer = self
            .stack
            .bind_resolver(&self.resolver)
            .await
            .map_err(|e| TunnelError::at_stage(Stage::ResolverBound, e))?;

        let handle = Arc::clone(&layer.handle);
        self.enter(Stage::ResolverBound, |inner| {
            inner.handles.resolver = Some(layer.handle);
            inner.bound = Some(layer.io);
        })
        .or_else(|e| self.discard(LayerKind::Resolver, handle, e))
    }

    /// Start the DNS packet channel to the server's domain.
    pub async fn open_dns_transport(&self) -> Result<()> {
        let bound = {
            let mut inner = self.expect_stage(Stage::ResolverBound, "open dns transport")?;
            inner.bound.take()
        };
        let bound = bound.ok_or(TunnelError::IllegalTransition {
            attempted: "open dns transport",
            current: Stage::ResolverBound,
        })?;

        let layer = self
            .stack
            .open_dns_transport(&self.resolver, &bound, &self.server, self.server.domain())
            .await
            .map_err(|e| TunnelError::at_stage(Stage::TransportOpen, e))?;

        let handle = Arc::clone(&layer.handle);
        self.enter(Stage::TransportOpen, |inner| {
            inner.handles.dns = Some(layer.handle);
            inner.packets = Some(layer.io);
        })
        .or_else(|e| self.discard(LayerKind::DnsTransport, handle, e))
    }

    /// Start the ordered transport over the DNS packets with the server's
    /// derived MTU.
    pub async fn open_ordered_transport(&self) -> Result<()> {
        let packets = {
            let mut inner = self.expect_stage(Stage::TransportOpen, "open ordered transport")?;
            inner.packets.take()
        };
        let packets = packets.ok_or(TunnelError::IllegalTransition {
            attempted: "open ordered transport",
            current: Stage::TransportOpen,
        })?;

        let config = OrderedTransportConfig {
            session_id: self.id,
            mtu: self.server.mtu(),
            stream_mode: true,
            congestion_control: false,
            send_window: (QUEUE_SIZE / 2) as u16,
            recv_window: (QUEUE_SIZE / 2) as u16,
        };

        let layer = self
            .stack
            .open_ordered_transport(packets, &config)
            .await
            .map_err(|e| TunnelError::at_stage(Stage::OrderedTransportOpen, e))?;
        info!("begin session {:08x}", self.id);

        let handle = Arc::clone(&layer.handle);
        self.enter(Stage::OrderedTransportOpen, |inner| {
            inner.handles.ordered = Some(layer.handle);
            inner.conn = Some(layer.io);
        })
        .or_else(|e| self.discard(LayerKind::OrderedTransport, handle, e))
    }

    /// Handshake with the server, authenticating its public key.
    pub async fn open_secure_channel(&self) -> Result<()> {
        let conn = {
            let mut inner =
                self.expect_stage(Stage::OrderedTransportOpen, "open secure channel")?;
            inner.conn.take()
        };
        let conn = conn.ok_or(TunnelError::IllegalTransition {
            attempted: "open secure channel",
            current: Stage::OrderedTransportOpen,
        })?;

        let layer = self
            .stack
            .open_secure_channel(conn, self.server.public_key())
            .await
            .map_err(|e| TunnelError::at_stage(Stage::SecureChannelOpen, e))?;
        info!("Noise channel established for session {:08x}", self.id);

        let handle = Arc::clone(&layer.handle);
        self.enter(Stage::SecureChannelOpen, |inner| {
            inner.handles.secure = Some(layer.handle);
            inner.conn = Some(layer.io);
        })
        .or_else(|e| self.discard(LayerKind::SecureChannel, handle, e))
    }

    /// Start the stream multiplexer over the secure channel.
    pub async fn open_multiplex_session(&self) -> Result<()> {
        let conn = {
            let mut inner =
                self.expect_stage(Stage::SecureChannelOpen, "open multiplex session")?;
            inner.conn.take()
        };
        let conn = conn.ok_or(TunnelError::IllegalTransition {
            attempted: "open multiplex session",
            current: Stage::SecureChannelOpen,
        })?;

        let session = self
            .stack
            .open_multiplexer(conn, &self.mux_config)
            .await
            .map_err(|e| TunnelError::at_stage(Stage::MultiplexReady, e))?;
        info!("smux session established for session {:08x}", self.id);

        let raced = {
            let mut inner = self.lock();
            if self.is_closing() {
                Some(session)
            } else {
                inner.handles.mux = Some(session);
                inner.stage = Stage::MultiplexReady;
                None
            }
        };
        if let Some(session) = raced {
            // the racing close() reports the other layers
            if let Err(e) = session.close().await {
                debug!(
                    "session {:08x}: closing abandoned {}: {}",
                    self.id,
                    LayerKind::Multiplexer,
                    e
                );
            }
            return Err(TunnelError::SessionClosed);
        }
        debug!("session {:08x}: {}", self.id, Stage::MultiplexReady);
        Ok(())
    }

    /// Mark the tunnel as carrying traffic.
    pub fn mark_serving(&self) -> Result<()> {
        let mut inner = self.expect_stage(Stage::MultiplexReady, "start serving")?;
        inner.stage = Stage::Serving;
        Ok(())
    }

    /// Close a layer opened by a stage that lost the race with `close()`.
    fn discard(&self, layer: LayerKind, handle: Arc<dyn LayerHandle>, err: TunnelError) -> Result<()> {
        let id = self.id;
        tokio::spawn(async move {
            if let Err(e) = handle.close().await {
                debug!("session {:08x}: closing abandoned {}: {}", id, layer, e);
            }
        });
        Err(err)
    }

    /// Run every stage in order. On failure the layers already open are torn
    /// down and the error names the stage that failed.
    pub async fn bring_up(&self) -> Result<()> {
        debug!(
            "session {:08x}: bringing up via {} to {} (MTU {})",
            self.id,
            self.resolver.address(),
            self.server.domain(),
            self.server.mtu()
        );

        let result = async {
            self.bind_resolver().await?;
            self.open_dns_transport().await?;
            self.open_ordered_transport().await?;
            self.open_secure_channel().await?;
            self.open_multiplex_session().await
        }
        .await;

        if let Err(e) = result {
            let report = self.close().await;
            debug!("session {:08x} bring-up teardown: {}", self.id, report);
            return Err(e);
        }
        Ok(())
    }

    /// Open a new stream on the multiplexed session.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        if self.is_closing() {
            return Err(TunnelError::SessionClosed);
        }
        let session = {
            let inner = self.lock();
            match (&inner.handles.mux, inner.stage) {
                (Some(mux), Stage::MultiplexReady | Stage::Serving) => Arc::clone(mux),
                (_, current) => {
                    return Err(TunnelError::IllegalTransition {
                        attempted: "open stream",
                        current,
                    })
                }
            }
        };

        match session.open_stream().await {
            Ok(stream) => Ok(stream),
            Err(_) if self.is_closing() => Err(TunnelError::SessionClosed),
            Err(source) => Err(TunnelError::StreamOpen {
                session: self.id,
                source,
            }),
        }
    }

    /// Number of streams open on the session
    pub fn num_streams(&self) -> usize {
        self.lock()
            .handles
            .mux
            .as_ref()
            .map(|mux| mux.num_streams())
            .unwrap_or(0)
    }

    /// Close every open layer, multiplexer first. Safe to call repeatedly
    /// and at any stage; only the first call closes anything.
    pub async fn close(&self) -> TeardownReport {
        if self.closing.swap(true, Ordering::AcqRel) {
            return TeardownReport::default();
        }

        let handles = {
            let mut inner = self.lock();
            inner.stage = Stage::Closed;
            inner.bound = None;
            inner.packets = None;
            inner.conn = None;
            std::mem::take(&mut inner.handles)
        };

        let mut report = TeardownReport::default();
        if let Some(mux) = handles.mux {
            report.outcomes.push(LayerOutcome {
                layer: LayerKind::Multiplexer,
                result: mux.close().await,
            });
        }
        let layers = [
            (LayerKind::SecureChannel, handles.secure),
            (LayerKind::OrderedTransport, handles.ordered),
            (LayerKind::DnsTransport, handles.dns),
            (LayerKind::Resolver, handles.resolver),
        ];
        for (layer, handle) in layers {
            if let Some(handle) = handle {
                report.outcomes.push(LayerOutcome {
                    layer,
                    result: handle.close().await,
                });
            }
        }

        if !report.is_empty() {
            info!("end session {:08x}", self.id);
        }
        debug!("session {:08x} teardown: {}", self.id, report);
        report
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &format_args!("{:08x}", self.id))
            .field("resolver", &self.resolver.address())
            .field("server", &self.server)
            .field("stage", &self.stage())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_display() {
        let report = TeardownReport {
            outcomes: vec![
                LayerOutcome {
                    layer: LayerKind::Multiplexer,
                    result: Ok(()),
                },
                LayerOutcome {
                    layer: LayerKind::SecureChannel,
                    result: Err(io::Error::new(io::ErrorKind::Other, "boom")),
                },
            ],
        };
        assert!(!report.is_clean());
        assert_eq!(
            report.layers(),
            vec![LayerKind::Multiplexer, LayerKind::SecureChannel]
        );
        assert_eq!(
            report.to_string(),
            "multiplexer closed, secure channel failed: boom"
        );
        assert_eq!(TeardownReport::default().to_string(), "nothing to close");
    }

    #[tokio::test]
    async fn test_fresh_tunnel_rejects_out_of_order_steps() {
        let tunnel = Tunnel::new(
            Resolver::new(crate::config::ResolverKind::Udp, "127.0.0.1:53").unwrap(),
            RemoteServer::new("t.example.com", &"00".repeat(32)).unwrap(),
            MuxConfig::default(),
            Arc::new(crate::stack::DefaultStack),
        );
        assert_eq!(tunnel.stage(), Stage::Idle);

        let err = tunnel.open_secure_channel().await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::IllegalTransition {
                current: Stage::Idle,
                ..
            }
        ));
        assert!(tunnel.mark_serving().is_err());
        assert!(matches!(
            tunnel.open_stream().await,
            Err(TunnelError::IllegalTransition { .. })
        ));

        let report = tunnel.close().await;
        assert!(report.is_empty());
        assert_eq!(tunnel.stage(), Stage::Closed);
        assert!(matches!(
            tunnel.open_stream().await,
            Err(TunnelError::SessionClosed)
        ));
    }
}
