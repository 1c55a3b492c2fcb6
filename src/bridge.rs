//! Stream bridge: one local TCP connection spliced onto one tunnel stream

use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::net::Shutdown;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

use crate::error::{is_benign_close, Result};
use crate::tunnel::Tunnel;

const COPY_BUFFER: usize = 16 * 1024;

/// Bytes carried in each direction by one bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Local connection to tunnel stream
    pub upstream: u64,
    /// Tunnel stream to local connection
    pub downstream: u64,
}

/// Splices accepted connections onto streams of a shared tunnel.
#[derive(Clone)]
pub struct StreamBridge {
    tunnel: Arc<Tunnel>,
}

impl StreamBridge {
    pub fn new(tunnel: Arc<Tunnel>) -> Self {
        Self { tunnel }
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    /// Copy bytes between `lconn` and a fresh stream until both directions
    /// reach EOF. Only a failure to open the stream is returned; copy errors
    /// end their own direction and are logged.
    pub async fn run(&self, lconn: TcpStream, peer: Option<SocketAddr>) -> Result<BridgeStats> {
        let session = self.tunnel.id();
        let stream = match self.tunnel.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                drop(lconn);
                return Err(e);
            }
        };
        let id = stream.id;
        match peer {
            Some(peer) => info!("begin stream {:08x}:{} for {}", session, id, peer),
            None => info!("begin stream {:08x}:{}", session, id),
        }

        let (mut local_read, mut local_write) = lconn.into_split();
        let (mut stream_read, mut stream_write) = tokio::io::split(stream.io);

        let upstream = async {
            let result = pipe(&mut local_read, &mut stream_write).await;
            shutdown_read(&local_read);
            if let Err(e) = stream_write.shutdown().await {
                log_copy_error(session, id, "closing stream write side", &e);
            }
            result
        };
        let downstream = async {
            let result = pipe(&mut stream_read, &mut local_write).await;
            if let Err(e) = local_write.shutdown().await {
                log_copy_error(session, id, "closing local write side", &e);
            }
            result
        };

        let (up, down) = tokio::join!(upstream, downstream);
        let stats = BridgeStats {
            upstream: count(session, id, "local → stream", up),
            downstream: count(session, id, "stream → local", down),
        };

        // both halves go here, which releases the stream and the socket
        drop(stream_read.unsplit(stream_write));
        drop(local_read.reunite(local_write));

        info!("end stream {:08x}:{}", session, id);
        debug!(
            "stream {:08x}:{} carried {} bytes up, {} bytes down",
            session, id, stats.upstream, stats.downstream
        );
        Ok(stats)
    }
}

/// Copy `reader` into `writer` until EOF. The byte count is kept when the
/// copy fails part way.
async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut carried = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return (carried, Ok(())),
            Ok(n) => n,
            Err(e) => return (carried, Err(e)),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return (carried, Err(e));
        }
        if let Err(e) = writer.flush().await {
            return (carried, Err(e));
        }
        carried += n as u64;
    }
}

fn count(session: u32, id: u32, direction: &str, (carried, result): (u64, io::Result<()>)) -> u64 {
    if let Err(e) = result {
        log_copy_error(session, id, direction, &e);
        debug!("stream {:08x}:{} {} stopped after {} bytes", session, id, direction, carried);
    }
    carried
}

fn log_copy_error(session: u32, id: u32, what: &str, err: &io::Error) {
    if is_benign_close(err) {
        debug!("stream {:08x}:{} {}: {}", session, id, what, err);
    } else {
        warn!("stream {:08x}:{} {}: {}", session, id, what, err);
    }
}

/// Stop reading from the local socket once the upstream copy is finished.
fn shutdown_read(half: &OwnedReadHalf) {
    let stream: &TcpStream = half.as_ref();
    if let Err(e) = socket2::SockRef::from(stream).shutdown(Shutdown::Read) {
        debug!("shutdown(read): {}", e);
    }
}
