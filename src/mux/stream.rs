//! One logical stream of a multiplexed session

use bytes::{Buf, Bytes, BytesMut};
use log::trace;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use super::frame::{Cmd, Frame};
use super::session::SessionInner;
use super::{MuxError, INITIAL_PEER_WINDOW};

pub(super) struct StreamState {
    /// Received data not yet read
    recv_buf: BytesMut,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,

    pub(super) fin_received: bool,
    pub(super) fin_sent: bool,
    /// Set when the session dies or the stream is reset
    pub(super) error: Option<MuxError>,

    /// Bytes read by the application, and since the last window update
    num_read: u32,
    incr: u32,

    num_written: u32,
    peer_consumed: u32,
    peer_window: u32,

    pub(super) last_activity: Instant,
}

impl StreamState {
    fn wake_all(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

/// Stream state shared between the application handle and the session
pub(super) struct StreamShared {
    pub(super) id: u32,
    state: Mutex<StreamState>,
}

impl StreamShared {
    pub(super) fn new(id: u32) -> Self {
        Self {
            id,
            state: Mutex::new(StreamState {
                recv_buf: BytesMut::new(),
                read_waker: None,
                write_waker: None,
                fin_received: false,
                fin_sent: false,
                error: None,
                num_read: 0,
                incr: 0,
                num_written: 0,
                peer_consumed: 0,
                peer_window: INITIAL_PEER_WINDOW,
                last_activity: Instant::now(),
            }),
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, StreamState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(super) fn push_data(&self, data: Bytes) {
        let mut state = self.lock();
        state.recv_buf.extend_from_slice(&data);
        state.last_activity = Instant::now();
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
    }

    pub(super) fn push_fin(&self) {
        let mut state = self.lock();
        state.fin_received = true;
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
    }

    pub(super) fn update_window(&self, consumed: u32, window: u32) {
        let mut state = self.lock();
        state.peer_consumed = consumed;
        state.peer_window = window;
        if let Some(waker) = state.write_waker.take() {
            waker.wake();
        }
    }

    /// Fail pending and future I/O. The first error sticks.
    pub(super) fn fail(&self, err: MuxError) {
        let mut state = self.lock();
        if state.error.is_none() {
            state.error = Some(err);
        }
        state.wake_all();
    }
}

/// A multiplexed stream
///
/// Shutting down the write side sends FIN; reading continues until the
/// peer's FIN. Dropping the stream sends FIN if it was not sent yet.
pub struct Stream {
    shared: Arc<StreamShared>,
    session: Arc<SessionInner>,
}

impl Stream {
    pub(super) fn new(shared: Arc<StreamShared>, session: Arc<SessionInner>) -> Self {
        Self { shared, session }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();

        if !state.recv_buf.is_empty() {
            let n = buf.remaining().min(state.recv_buf.len());
            buf.put_slice(&state.recv_buf[..n]);
            state.recv_buf.advance(n);
            state.last_activity = Instant::now();

            let n = n as u32;
            state.num_read = state.num_read.wrapping_add(n);
            state.incr = state.incr.wrapping_add(n);

            // the first read and every half buffer of reads return credit
            let config = self.session.config();
            let notify = state.incr >= config.max_stream_buffer / 2 || state.num_read == n;
            let consumed = state.num_read;
            if notify {
                state.incr = 0;
            }
            drop(state);

            if notify {
                let update = Frame::window_update(
                    config.version,
                    self.shared.id,
                    consumed,
                    config.max_stream_buffer,
                );
                // a dead session fails the next call instead
                let _ = self.session.send_frame(update);
            }
            return Poll::Ready(Ok(()));
        }

        if let Some(err) = &state.error {
            return Poll::Ready(Err(err.clone().into()));
        }
        if state.fin_received {
            return Poll::Ready(Ok(()));
        }

        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.shared.lock();

        if let Some(err) = &state.error {
            return Poll::Ready(Err(err.clone().into()));
        }
        if state.fin_sent {
            return Poll::Ready(Err(MuxError::StreamClosed.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let inflight = state.num_written.wrapping_sub(state.peer_consumed) as i64;
        let window = state.peer_window as i64 - inflight;
        if window <= 0 {
            trace!("stream {} waiting for window update", self.shared.id);
            state.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let config = self.session.config();
        let n = buf
            .len()
            .min(window as usize)
            .min(config.max_frame_size as usize);

        let frame = Frame::data(config.version, self.shared.id, Bytes::copy_from_slice(&buf[..n]));
        self.session.send_frame(frame)?;

        state.num_written = state.num_written.wrapping_add(n as u32);
        state.last_activity = Instant::now();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // frames are queued to the session writer as soon as they are written
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();
        if state.fin_sent || state.error.is_some() {
            return Poll::Ready(Ok(()));
        }
        state.fin_sent = true;
        drop(state);

        let fin = Frame::new(self.session.config().version, Cmd::Fin, self.shared.id);
        Poll::Ready(self.session.send_frame(fin).map_err(Into::into))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let send_fin = {
            let mut state = self.shared.lock();
            let send_fin = !state.fin_sent && state.error.is_none();
            state.fin_sent = true;
            send_fin
        };
        if send_fin {
            let fin = Frame::new(self.session.config().version, Cmd::Fin, self.shared.id);
            let _ = self.session.send_frame(fin);
        }
        self.session.remove_stream(self.shared.id);
    }
}
