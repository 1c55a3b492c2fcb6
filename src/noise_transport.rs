//! Noise Protocol encrypted channel over the ordered transport
//!
//! Pattern **Noise_NK_25519_ChaChaPoly_BLAKE2s**: the server proves its
//! identity with a static key the client knows in advance; the client stays
//! anonymous. Handshake and transport messages are framed with a 2-byte
//! big-endian length prefix.

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::task::AtomicWaker;
use log::debug;
use snow::{params::NoiseParams, Builder, HandshakeState, TransportState};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::config::KEY_LEN;
use crate::error::{Result, TunnelError};
use crate::transport::LayerHandle;

/// Noise protocol name
pub const NOISE_PROTOCOL: &str = "Noise_NK_25519_ChaChaPoly_BLAKE2s";

/// Prologue mixed into the handshake hash; both sides must agree
pub const NOISE_PROLOGUE: &[u8] = b"dnstt 2020-04-13";

/// Maximum message size for Noise protocol
const MAX_MESSAGE_SIZE: usize = 65535;

/// Largest plaintext carried by one transport message
pub const MAX_PLAINTEXT_CHUNK: usize = 4096;

fn noise_params() -> Result<NoiseParams> {
    NOISE_PROTOCOL
        .parse()
        .map_err(|e: snow::Error| TunnelError::Handshake(e.to_string()))
}

/// Noise keypair
#[derive(Clone)]
pub struct NoiseKeypair {
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl NoiseKeypair {
    /// Generate a new X25519 keypair
    pub fn generate() -> Result<Self> {
        let keypair = Builder::new(noise_params()?)
            .generate_keypair()
            .map_err(|e| TunnelError::Handshake(e.to_string()))?;

        Ok(Self {
            private_key: keypair.private.to_vec(),
            public_key: keypair.public.to_vec(),
        })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(&self.public_key)
    }
}

impl std::fmt::Debug for NoiseKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseKeypair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Run the initiator side of the handshake, authenticating the server's
/// static `remote_public_key`.
pub async fn client_handshake<S>(
    mut conn: S,
    remote_public_key: &[u8],
) -> Result<(NoiseStream<S>, Arc<NoiseHandle>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if remote_public_key.len() != KEY_LEN {
        return Err(TunnelError::InvalidPublicKey(format!(
            "length is {} bytes, expected {}",
            remote_public_key.len(),
            KEY_LEN
        )));
    }

    let noise = Builder::new(noise_params()?)
        .prologue(NOISE_PROLOGUE)
        .remote_public_key(remote_public_key)
        .build_initiator()
        .map_err(|e| TunnelError::Handshake(e.to_string()))?;

    let transport = perform_handshake(&mut conn, noise, true).await?;
    debug!("noise handshake complete (initiator)");
    Ok(NoiseStream::new(conn, transport))
}

/// Run the responder side of the handshake with the server's static
/// `local_private_key`.
pub async fn server_handshake<S>(
    mut conn: S,
    local_private_key: &[u8],
) -> Result<(NoiseStream<S>, Arc<NoiseHandle>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let noise = Builder::new(noise_params()?)
        .prologue(NOISE_PROLOGUE)
        .local_private_key(local_private_key)
        .build_responder()
        .map_err(|e| TunnelError::Handshake(e.to_string()))?;

    let transport = perform_handshake(&mut conn, noise, false).await?;
    debug!("noise handshake complete (responder)");
    Ok(NoiseStream::new(conn, transport))
}

/// Perform Noise handshake
async fn perform_handshake<S>(
    stream: &mut S,
    mut noise: HandshakeState,
    is_initiator: bool,
) -> Result<TransportState>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake_err = |e: snow::Error| TunnelError::Handshake(e.to_string());
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    if is_initiator {
        // -> e, es
        let len = noise.write_message(&[], &mut buf).map_err(handshake_err)?;
        write_message(stream, &buf[..len]).await?;

        // <- e, ee
        let msg = read_message(stream).await?;
        let payload_len = noise.read_message(&msg, &mut buf).map_err(handshake_err)?;
        if payload_len != 0 {
            return Err(TunnelError::Handshake(
                "unexpected payload in handshake response".into(),
            ));
        }
    } else {
        let msg = read_message(stream).await?;
        noise.read_message(&msg, &mut buf).map_err(handshake_err)?;

        let len = noise.write_message(&[], &mut buf).map_err(handshake_err)?;
        write_message(stream, &buf[..len]).await?;
    }

    if !noise.is_handshake_finished() {
        return Err(TunnelError::Handshake("handshake not completed".into()));
    }

    noise.into_transport_mode().map_err(handshake_err)
}

/// Read length-prefixed message (2-byte big-endian length + payload)
async fn read_message<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TunnelError::Handshake("connection closed during handshake".into())
        } else {
            TunnelError::Handshake(format!("failed to read message length: {}", e))
        }
    })?;

    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| TunnelError::Handshake(format!("failed to read message payload: {}", e)))?;
    Ok(buf)
}

/// Write length-prefixed message
async fn write_message<S>(stream: &mut S, data: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut framed = Vec::with_capacity(2 + data.len());
    framed.extend_from_slice(&(data.len() as u16).to_be_bytes());
    framed.extend_from_slice(data);

    stream
        .write_all(&framed)
        .await
        .map_err(|e| TunnelError::Handshake(format!("failed to write message: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| TunnelError::Handshake(format!("failed to flush message: {}", e)))
}

struct CloseState {
    closed: AtomicBool,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
}

/// Teardown handle for a secure channel. Closing it fails the stream's
/// pending and future I/O.
pub struct NoiseHandle {
    state: Arc<CloseState>,
}

impl NoiseHandle {
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl LayerHandle for NoiseHandle {
    async fn close(&self) -> io::Result<()> {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            self.state.read_waker.wake();
            self.state.write_waker.wake();
            debug!("noise channel closed");
        }
        Ok(())
    }
}

/// Encrypted duplex stream after a completed handshake
pub struct NoiseStream<S> {
    inner: S,
    transport: TransportState,
    close: Arc<CloseState>,
    /// Ciphertext received but not yet decrypted
    read_buf: BytesMut,
    /// Decrypted bytes not yet handed to the reader
    plaintext: BytesMut,
    /// Framed ciphertext not yet written to `inner`
    write_buf: BytesMut,
    scratch: Vec<u8>,
}

impl<S> NoiseStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(inner: S, transport: TransportState) -> (Self, Arc<NoiseHandle>) {
        let close = Arc::new(CloseState {
            closed: AtomicBool::new(false),
            read_waker: AtomicWaker::new(),
            write_waker: AtomicWaker::new(),
        });
        let handle = Arc::new(NoiseHandle {
            state: Arc::clone(&close),
        });
        let stream = Self {
            inner,
            transport,
            close,
            read_buf: BytesMut::new(),
            plaintext: BytesMut::new(),
            write_buf: BytesMut::new(),
            scratch: vec![0u8; MAX_MESSAGE_SIZE],
        };
        (stream, handle)
    }

    fn is_closed(&self) -> bool {
        self.close.closed.load(Ordering::Acquire)
    }

    /// Decrypt one complete message from `read_buf`, if there is one.
    fn decrypt_next(&mut self) -> io::Result<bool> {
        if self.read_buf.len() < 2 {
            return Ok(false);
        }
        let len = u16::from_be_bytes([self.read_buf[0], self.read_buf[1]]) as usize;
        if self.read_buf.len() < 2 + len {
            return Ok(false);
        }
        let frame = self.read_buf.split_to(2 + len);
        let n = self
            .transport
            .read_message(&frame[2..], &mut self.scratch)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.plaintext.extend_from_slice(&self.scratch[..n]);
        Ok(true)
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "secure channel closed")
}

impl<S> AsyncRead for NoiseStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.close.read_waker.register(cx.waker());

        loop {
            if this.is_closed() {
                return Poll::Ready(Err(closed_error()));
            }

            if !this.plaintext.is_empty() {
                let n = buf.remaining().min(this.plaintext.len());
                buf.put_slice(&this.plaintext[..n]);
                this.plaintext.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.decrypt_next()? {
                continue;
            }

            let mut chunk = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk))?;
            let filled = chunk.filled();
            if filled.is_empty() {
                if this.read_buf.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "secure channel closed mid-message",
                )));
            }
            this.read_buf.extend_from_slice(filled);
        }
    }
}

impl<S> AsyncWrite for NoiseStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.close.write_waker.register(cx.waker());
        if this.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }

        // one message in flight at a time
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_PLAINTEXT_CHUNK);
        let len = this
            .transport
            .write_message(&buf[..n], &mut this.scratch)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        this.write_buf.reserve(2 + len);
        this.write_buf.put_u16(len as u16);
        this.write_buf.put_slice(&this.scratch[..len]);

        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.close.write_waker.register(cx.waker());
        if this.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.is_closed() {
            return Poll::Ready(Ok(()));
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    const TAG_LEN: usize = 16;

    async fn connected_pair() -> (
        (NoiseStream<DuplexStream>, Arc<NoiseHandle>),
        (NoiseStream<DuplexStream>, Arc<NoiseHandle>),
    ) {
        let server_keypair = NoiseKeypair::generate().unwrap();
        let (client_io, server_io) = duplex(64 * 1024);

        let private_key = server_keypair.private_key.clone();
        let server = tokio::spawn(async move { server_handshake(server_io, &private_key).await });
        let client = client_handshake(client_io, &server_keypair.public_key)
            .await
            .unwrap();
        let server = server.await.unwrap().unwrap();
        (client, server)
    }

    #[test]
    fn test_keypair_generation() {
        let keypair = NoiseKeypair::generate().unwrap();
        assert_eq!(keypair.private_key.len(), KEY_LEN);
        assert_eq!(keypair.public_key.len(), KEY_LEN);
        assert_eq!(keypair.public_key_hex().len(), 2 * KEY_LEN);
    }

    #[tokio::test]
    async fn test_noise_handshake_nk() {
        let ((mut client, _ch), (mut server, _sh)) = connected_pair().await;

        client.write_all(b"Hello from client!").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 18];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello from client!");

        server.write_all(b"Hello from server!").await.unwrap();
        server.flush().await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello from server!");
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let ((mut client, _ch), (mut server, _sh)) = connected_pair().await;
        let data: Vec<u8> = (0..3 * MAX_PLAINTEXT_CHUNK + 17).map(|i| i as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&data).await.unwrap();
            client.flush().await.unwrap();
            client
        });
        let mut received = vec![0u8; expected.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_server_key_fails_handshake() {
        let server_keypair = NoiseKeypair::generate().unwrap();
        let impostor = NoiseKeypair::generate().unwrap();
        let (client_io, server_io) = duplex(8192);

        let server = tokio::spawn(async move {
            // the server drops its end on failure, ending the client's wait
            server_handshake(server_io, &server_keypair.private_key).await
        });
        let client = client_handshake(client_io, &impostor.public_key).await;

        assert!(matches!(server.await.unwrap(), Err(TunnelError::Handshake(_))));
        assert!(matches!(client, Err(TunnelError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_short_public_key_rejected() {
        let (client_io, _server_io) = duplex(8192);
        assert!(matches!(
            client_handshake(client_io, &[0u8; 16]).await,
            Err(TunnelError::InvalidPublicKey(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_message_is_invalid_data() {
        let server_keypair = NoiseKeypair::generate().unwrap();
        let (client_io, mut relay_client) = duplex(8192);
        let (mut relay_server, server_io) = duplex(8192);

        let private_key = server_keypair.private_key.clone();
        let server = tokio::spawn(async move { server_handshake(server_io, &private_key).await });

        // relay the handshake untouched
        let relay = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = relay_client.read(&mut buf).await.unwrap();
            relay_server.write_all(&buf[..n]).await.unwrap();
            let n = relay_server.read(&mut buf).await.unwrap();
            relay_client.write_all(&buf[..n]).await.unwrap();
            (relay_client, relay_server)
        });

        let (mut client, _ch) = client_handshake(client_io, &server_keypair.public_key)
            .await
            .unwrap();
        let (mut server, _sh) = server.await.unwrap().unwrap();
        let (mut relay_client, mut relay_server) = relay.await.unwrap();

        client.write_all(b"secret").await.unwrap();
        client.flush().await.unwrap();
        let mut frame = vec![0u8; 2 + 6 + TAG_LEN];
        relay_client.read_exact(&mut frame).await.unwrap();
        frame[4] ^= 0x01;
        relay_server.write_all(&frame).await.unwrap();

        let mut buf = [0u8; 6];
        let err = server.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_close_fails_io() {
        let ((mut client, handle), (_server, _sh)) = connected_pair().await;
        handle.close().await.unwrap();
        handle.close().await.unwrap();
        assert!(handle.is_closed());

        let err = client.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let mut buf = [0u8; 1];
        let err = client.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
