//! Outbound listener supervisor
//!
//! Owns the local TCP listener and the one live tunnel. Every accepted
//! connection is bridged onto its own stream by an independently spawned
//! task.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

use crate::bridge::StreamBridge;
use crate::config::{Endpoints, RemoteServer, Resolver, TunnelSettings};
use crate::error::{Result, TunnelError};
use crate::stack::DefaultStack;
use crate::transport::TunnelStack;
use crate::tunnel::{TeardownReport, Tunnel};

/// Source of accepted local connections
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Exponential delay between failed accepts, reset by a successful one
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// Listener supervisor
pub struct Outbound {
    resolvers: Vec<Resolver>,
    servers: Vec<RemoteServer>,
    settings: TunnelSettings,
    stack: Arc<dyn TunnelStack>,
    tunnel: Mutex<Option<Arc<Tunnel>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Outbound {
    /// Supervisor over the default UDP/DNS layer stack
    pub fn new(resolvers: Vec<Resolver>, servers: Vec<RemoteServer>, settings: TunnelSettings) -> Self {
        Self::with_stack(resolvers, servers, settings, Arc::new(DefaultStack::new()))
    }

    pub fn from_endpoints(endpoints: Endpoints, settings: TunnelSettings) -> Self {
        Self::new(endpoints.resolvers, endpoints.servers, settings)
    }

    pub fn with_stack(
        resolvers: Vec<Resolver>,
        servers: Vec<RemoteServer>,
        settings: TunnelSettings,
        stack: Arc<dyn TunnelStack>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            resolvers,
            servers,
            settings,
            stack,
            tunnel: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    pub fn resolvers(&self) -> &[Resolver] {
        &self.resolvers
    }

    pub fn servers(&self) -> &[RemoteServer] {
        &self.servers
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    /// The live tunnel, once bring-up has started
    pub fn tunnel(&self) -> Option<Arc<Tunnel>> {
        lock(&self.tunnel).clone()
    }

    /// Address of the listener, once serving
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bind `local_address` and serve on it until [`Outbound::close`].
    pub async fn start(&self, local_address: &str) -> Result<()> {
        let listener = TcpListener::bind(local_address)
            .await
            .map_err(TunnelError::Listen)?;
        self.serve(listener).await
    }

    /// Bring the tunnel up, then accept on `acceptor` until closed.
    ///
    /// The acceptor is dropped when bring-up fails.
    pub async fn serve<A: Acceptor>(&self, acceptor: A) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        let resolver = self
            .resolvers
            .first()
            .ok_or(TunnelError::NoEndpointsConfigured("resolvers"))?;
        let server = self
            .servers
            .first()
            .ok_or(TunnelError::NoEndpointsConfigured("servers"))?;

        let tunnel = Arc::new(Tunnel::new(
            resolver.clone(),
            server.clone(),
            self.settings.mux_config(),
            Arc::clone(&self.stack),
        ));
        {
            let mut slot = lock(&self.tunnel);
            // close() flips the flag before it empties the slot
            if self.is_closed() {
                return Err(TunnelError::SessionClosed);
            }
            if let Some(existing) = slot.as_ref() {
                return Err(TunnelError::IllegalTransition {
                    attempted: "start a second tunnel",
                    current: existing.stage(),
                });
            }
            *slot = Some(Arc::clone(&tunnel));
        }
        info!("effective MTU {}", server.mtu());

        if let Err(e) = tunnel.bring_up().await {
            error!("tunnel bring-up failed: {}", e);
            lock(&self.tunnel).take();
            return Err(e);
        }
        tunnel.mark_serving()?;

        let addr = acceptor.local_addr().map_err(TunnelError::Listen)?;
        *lock(&self.local_addr) = Some(addr);
        info!("listening on {}", addr);

        self.accept_loop(&acceptor, tunnel).await;
        Ok(())
    }

    async fn accept_loop<A: Acceptor>(&self, acceptor: &A, tunnel: Arc<Tunnel>) {
        let bridge = StreamBridge::new(tunnel);
        let permits = self
            .settings
            .max_connections
            .map(|n| Arc::new(Semaphore::new(n)));
        let mut backoff = Backoff::new(
            self.settings.accept_backoff_initial,
            self.settings.accept_backoff_max,
        );
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() || self.is_closed() {
                break;
            }
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = acceptor.accept() => accepted,
            };

            match accepted {
                Ok((lconn, peer)) => {
                    backoff.reset();
                    debug!("accepted {}", peer);
                    let bridge = bridge.clone();
                    let permits = permits.clone();
                    tokio::spawn(async move {
                        // queued connections wait here while the cap is reached
                        let _permit = match permits {
                            Some(permits) => match permits.acquire_owned().await {
                                Ok(permit) => Some(permit),
                                Err(_) => return,
                            },
                            None => None,
                        };
                        if let Err(e) = bridge.run(lconn, Some(peer)).await {
                            warn!("handle {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("accept: {} (retrying in {:?})", e, delay);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!("accept loop stopped");
    }

    /// Stop accepting and tear the tunnel down. Only the first call closes
    /// anything; later calls return an empty report.
    pub async fn close(&self) -> TeardownReport {
        if self.closed.swap(true, Ordering::AcqRel) {
            return TeardownReport::default();
        }
        self.shutdown.send_replace(true);

        let tunnel = lock(&self.tunnel).take();
        let report = match tunnel {
            Some(tunnel) => tunnel.close().await,
            None => TeardownReport::default(),
        };
        debug!("outbound closed: {}", report);
        report
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
