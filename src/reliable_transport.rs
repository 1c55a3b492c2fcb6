//! KCP Reliability Layer over a packet channel
//!
//! Turns the lossy, unordered [`PacketConn`] below it into a reliable,
//! ordered byte stream.
//!
//! ## Architecture
//!
//! ```text
//! Noise Encryption
//!     ↓
//! KCP Reliability Layer  ← This module
//!     ↓
//! DNS Transport (PacketConn)
//! ```
//!
//! Three background tasks drive the protocol: an update ticker, an input pump
//! feeding received packets into KCP, and an output pump handing KCP's
//! packets to the packet channel.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use kcp::Kcp;
use log::{debug, trace};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::error::{Result, TunnelError};
use crate::transport::{LayerHandle, OrderedTransportConfig, PacketConn};

/// KCP update interval in milliseconds
pub const UPDATE_INTERVAL_MS: i32 = 10;

/// KCP segment header length
const KCP_OVERHEAD: usize = 24;

/// Segments per `send` call; KCP refuses a single send spanning its whole
/// receive window.
const MAX_SEGMENTS_PER_WRITE: usize = 64;

/// Output callback for KCP - hands packets to the output pump
struct KcpOutput {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl std::io::Write for KcpOutput {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "KCP output closed"))?;
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct KcpState {
    kcp: Kcp<KcpOutput>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    closed: bool,
}

impl KcpState {
    fn wake_all(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

struct Shared {
    conv: u32,
    state: Mutex<KcpState>,
    start: Instant,
    /// Queued segments above which writers wait
    send_limit: usize,
    /// Largest buffer handed to one KCP `send`
    max_write: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, KcpState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    fn shut(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            state.wake_all();
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "ordered transport closed")
}

fn kcp_error(what: &str, e: kcp::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("KCP {} error: {:?}", what, e))
}

/// KCP-based reliable transport
pub struct ReliableTransport;

impl ReliableTransport {
    /// Start a KCP conversation over `packets`.
    ///
    /// Returns the byte stream for the layer above and the handle that tears
    /// the conversation down.
    pub fn open(
        packets: Arc<dyn PacketConn>,
        config: &OrderedTransportConfig,
    ) -> Result<(ReliableStream, Arc<ReliableTransportHandle>)> {
        let max_packet = packets.max_packet_size();
        if config.mtu > max_packet {
            return Err(TunnelError::InvalidMtuConfiguration {
                mtu: config.mtu,
                reason: format!("packet channel carries at most {} bytes", max_packet),
            });
        }

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let output = KcpOutput { tx: output_tx };

        let mut kcp = if config.stream_mode {
            Kcp::new_stream(config.session_id, output)
        } else {
            Kcp::new(config.session_id, output)
        };

        kcp.set_nodelay(false, UPDATE_INTERVAL_MS, 0, !config.congestion_control);
        kcp.set_wndsize(config.send_window, config.recv_window);
        kcp.set_mtu(config.mtu)
            .map_err(|e| TunnelError::InvalidMtuConfiguration {
                mtu: config.mtu,
                reason: format!("{:?}", e),
            })?;

        // KCP requires at least one update call before use
        kcp.update(0)
            .map_err(|e| TunnelError::TransportOpen(kcp_error("update", e)))?;

        let mss = config.mtu.saturating_sub(KCP_OVERHEAD).max(1);
        let shared = Arc::new(Shared {
            conv: config.session_id,
            state: Mutex::new(KcpState {
                kcp,
                read_waker: None,
                write_waker: None,
                closed: false,
            }),
            start: Instant::now(),
            send_limit: 2 * config.send_window as usize,
            max_write: mss * MAX_SEGMENTS_PER_WRITE,
        });

        let tasks = vec![
            tokio::spawn(update_loop(Arc::clone(&shared))),
            tokio::spawn(input_loop(Arc::clone(&shared), Arc::clone(&packets))),
            tokio::spawn(output_loop(Arc::clone(&shared), packets, output_rx)),
        ];

        debug!(
            "KCP conversation {:08x} open, mtu {}, windows {}/{}",
            config.session_id, config.mtu, config.send_window, config.recv_window
        );

        let handle = Arc::new(ReliableTransportHandle {
            shared: Arc::clone(&shared),
            tasks: Mutex::new(tasks),
        });
        let stream = ReliableStream {
            shared,
            pending: BytesMut::new(),
        };
        Ok((stream, handle))
    }
}

async fn update_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(UPDATE_INTERVAL_MS as u64));
    loop {
        ticker.tick().await;
        let now = shared.now_ms();
        let mut state = shared.lock();
        if state.closed {
            return;
        }
        if let Err(e) = state.kcp.update(now) {
            debug!("KCP {:08x} update: {:?}", shared.conv, e);
            state.closed = true;
            state.wake_all();
            return;
        }
        if state.kcp.wait_snd() < shared.send_limit {
            if let Some(waker) = state.write_waker.take() {
                waker.wake();
            }
        }
    }
}

async fn input_loop(shared: Arc<Shared>, packets: Arc<dyn PacketConn>) {
    loop {
        let packet = match packets.recv().await {
            Ok(packet) => packet,
            Err(e) => {
                debug!("KCP {:08x} input closed: {}", shared.conv, e);
                shared.shut();
                return;
            }
        };

        let mut state = shared.lock();
        if state.closed {
            return;
        }
        if let Err(e) = state.kcp.input(&packet) {
            // stray or corrupted packets are dropped
            trace!("KCP {:08x} input: {:?}", shared.conv, e);
            continue;
        }
        // input may carry data, acks, or both
        state.wake_all();
    }
}

async fn output_loop(
    shared: Arc<Shared>,
    packets: Arc<dyn PacketConn>,
    mut output: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(packet) = output.recv().await {
        if let Err(e) = packets.send(packet).await {
            debug!("KCP {:08x} output closed: {}", shared.conv, e);
            shared.shut();
            return;
        }
    }
}

/// Reliable, ordered byte stream of one KCP conversation
pub struct ReliableStream {
    shared: Arc<Shared>,
    pending: BytesMut,
}

impl ReliableStream {
    pub fn conv(&self) -> u32 {
        self.shared.conv
    }
}

impl AsyncRead for ReliableStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pending.is_empty() {
            let mut state = this.shared.lock();
            if state.closed {
                return Poll::Ready(Err(closed_error()));
            }
            let size = match state.kcp.peeksize() {
                Ok(size) if size > 0 => size,
                _ => {
                    state.read_waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            };
            this.pending.resize(size, 0);
            match state.kcp.recv(&mut this.pending) {
                Ok(n) => this.pending.truncate(n),
                Err(e) => {
                    this.pending.clear();
                    return Poll::Ready(Err(kcp_error("recv", e)));
                }
            }
        }

        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ReliableStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let shared = &self.shared;
        let mut state = shared.lock();
        if state.closed {
            return Poll::Ready(Err(closed_error()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if state.kcp.wait_snd() >= shared.send_limit {
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let len = buf.len().min(shared.max_write);
        let n = match state.kcp.send(&buf[..len]) {
            Ok(n) => n,
            Err(e) => return Poll::Ready(Err(kcp_error("send", e))),
        };
        if let Err(e) = state.kcp.flush() {
            return Poll::Ready(Err(kcp_error("flush", e)));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();
        if state.closed {
            return Poll::Ready(Err(closed_error()));
        }
        Poll::Ready(state.kcp.flush().map_err(|e| kcp_error("flush", e)))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // KCP has no half-close; the conversation ends with the layer handle
        self.poll_flush(cx)
    }
}

/// Teardown handle for a KCP conversation
pub struct ReliableTransportHandle {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReliableTransportHandle {
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    fn abort_tasks(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl LayerHandle for ReliableTransportHandle {
    async fn close(&self) -> io::Result<()> {
        self.shared.shut();
        self.abort_tasks();
        debug!("KCP conversation {:08x} closed", self.shared.conv);
        Ok(())
    }
}

impl Drop for ReliableTransportHandle {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
