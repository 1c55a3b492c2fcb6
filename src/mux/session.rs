//! Multiplexed session: frame reader, frame writer and keepalive tasks

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use super::frame::{parse_window_update, Cmd, Frame, Header, HEADER_SIZE};
use super::stream::{Stream, StreamShared};
use super::{MuxError, ACCEPT_BACKLOG, PROTOCOL_VERSION};
use crate::transport::{BoxedStream, MuxConfig, MuxSession, MuxStream};

/// Which end of the session this is; decides stream id parity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens odd stream ids
    Client,
    /// Opens even stream ids
    Server,
}

pub(super) struct SessionInner {
    config: MuxConfig,
    role: Role,
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    next_id: AtomicU32,
    frames: mpsc::UnboundedSender<Frame>,
    accept_tx: mpsc::Sender<Stream>,
    closed: AtomicBool,
    closed_signal: watch::Sender<bool>,
    /// Set by every received frame, cleared by the keepalive check
    data_ready: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionInner {
    pub(super) fn config(&self) -> &MuxConfig {
        &self.config
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<u32, Arc<StreamShared>>> {
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(super) fn send_frame(&self, frame: Frame) -> Result<(), MuxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::SessionClosed);
        }
        self.frames
            .send(frame)
            .map_err(|_| MuxError::SessionClosed)
    }

    pub(super) fn remove_stream(&self, id: u32) {
        if self.streams().remove(&id).is_some() {
            trace!("stream {} unregistered", id);
        }
    }

    fn get_stream(&self, id: u32) -> Option<Arc<StreamShared>> {
        self.streams().get(&id).cloned()
    }

    /// Kill the session: every stream's I/O fails with `reason`.
    fn shutdown(&self, reason: MuxError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("mux session ({:?}) closing: {}", self.role, reason);
        self.closed_signal.send_replace(true);

        let streams: Vec<_> = self.streams().values().cloned().collect();
        for stream in streams {
            stream.fail(reason.clone());
        }

        self.abort_tasks();
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

/// A multiplexed session over one duplex byte stream
pub struct Session {
    inner: Arc<SessionInner>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
}

impl Session {
    /// Client side: opens odd stream ids.
    pub fn client(conn: BoxedStream, config: &MuxConfig) -> Result<Self, MuxError> {
        Self::new(conn, config, Role::Client)
    }

    /// Server side: opens even stream ids and accepts the client's streams.
    pub fn server(conn: BoxedStream, config: &MuxConfig) -> Result<Self, MuxError> {
        Self::new(conn, config, Role::Server)
    }

    fn new(conn: BoxedStream, config: &MuxConfig, role: Role) -> Result<Self, MuxError> {
        verify_config(config)?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let inner = Arc::new(SessionInner {
            config: config.clone(),
            role,
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(match role {
                Role::Client => 1,
                Role::Server => 0,
            }),
            frames: frames_tx,
            accept_tx,
            closed: AtomicBool::new(false),
            closed_signal: watch::channel(false).0,
            data_ready: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let (reader, writer) = tokio::io::split(conn);
        let tasks = vec![
            tokio::spawn(recv_loop(Arc::clone(&inner), reader)),
            tokio::spawn(send_loop(Arc::clone(&inner), writer, frames_rx)),
            tokio::spawn(keepalive_loop(Arc::clone(&inner))),
        ];
        match inner.tasks.lock() {
            Ok(mut slot) => *slot = tasks,
            Err(poisoned) => *poisoned.into_inner() = tasks,
        }
        // the connection may have died before the tasks were stored
        if inner.closed.load(Ordering::Acquire) {
            inner.abort_tasks();
        }

        debug!(
            "mux session ({:?}) started, version {}, idle timeout {:?}",
            role, config.version, config.idle_timeout
        );

        Ok(Self {
            inner,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Open a new stream; the peer learns of it from the SYN frame.
    pub fn open(&self) -> Result<Stream, MuxError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MuxError::SessionClosed);
        }

        let id = self.inner.next_id.fetch_add(2, Ordering::AcqRel).wrapping_add(2);
        let shared = Arc::new(StreamShared::new(id));
        self.inner.streams().insert(id, Arc::clone(&shared));

        let syn = Frame::new(self.inner.config.version, Cmd::Syn, id);
        if let Err(e) = self.inner.send_frame(syn) {
            self.inner.remove_stream(id);
            return Err(e);
        }
        trace!("stream {} opened", id);
        Ok(Stream::new(shared, Arc::clone(&self.inner)))
    }

    /// Wait for the peer to open a stream.
    pub async fn accept_stream(&self) -> io::Result<MuxStream> {
        let mut closed = self.inner.closed_signal.subscribe();
        let mut accept_rx = self.accept_rx.lock().await;
        if *closed.borrow_and_update() {
            return Err(MuxError::SessionClosed.into());
        }
        let stream = tokio::select! {
            stream = accept_rx.recv() => stream.ok_or(MuxError::SessionClosed)?,
            _ = closed.changed() => return Err(MuxError::SessionClosed.into()),
        };
        Ok(MuxStream {
            id: stream.id(),
            io: Box::new(stream),
        })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown(MuxError::SessionClosed);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.shutdown(MuxError::SessionClosed);
    }
}

#[async_trait]
impl MuxSession for Session {
    async fn open_stream(&self) -> io::Result<MuxStream> {
        let stream = self.open()?;
        Ok(MuxStream {
            id: stream.id(),
            io: Box::new(stream),
        })
    }

    async fn close(&self) -> io::Result<()> {
        self.shutdown();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn num_streams(&self) -> usize {
        self.inner.streams().len()
    }
}

fn verify_config(config: &MuxConfig) -> Result<(), MuxError> {
    if config.version != PROTOCOL_VERSION {
        return Err(MuxError::InvalidConfig(format!(
            "unsupported version {}",
            config.version
        )));
    }
    if config.keepalive_interval.is_zero() || config.idle_timeout.is_zero() {
        return Err(MuxError::InvalidConfig(
            "keepalive interval and idle timeout must be positive".into(),
        ));
    }
    if config.keepalive_interval > config.idle_timeout {
        return Err(MuxError::InvalidConfig(
            "keepalive interval must not exceed idle timeout".into(),
        ));
    }
    if config.max_frame_size == 0 {
        return Err(MuxError::InvalidConfig("max frame size must be positive".into()));
    }
    if config.max_stream_buffer == 0 || config.max_stream_buffer > i32::MAX as u32 {
        return Err(MuxError::InvalidConfig(
            "max stream buffer must be positive and below 2 GiB".into(),
        ));
    }
    Ok(())
}

async fn recv_loop(inner: Arc<SessionInner>, mut reader: ReadHalf<BoxedStream>) {
    let result = read_frames(&inner, &mut reader).await;
    match result {
        Ok(()) => inner.shutdown(MuxError::SessionClosed),
        Err(e) => {
            debug!("mux session receive: {}", e);
            inner.shutdown(e);
        }
    }
}

async fn read_frames(
    inner: &Arc<SessionInner>,
    reader: &mut ReadHalf<BoxedStream>,
) -> Result<(), MuxError> {
    let mut header_buf = [0u8; HEADER_SIZE];

    loop {
        match reader.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => {
                debug!("mux session read: {}", e);
                return Err(MuxError::SessionClosed);
            }
        }
        let header = Header::parse(&header_buf, inner.config.version)?;

        let mut data = BytesMut::zeroed(header.length as usize);
        if !data.is_empty() {
            reader
                .read_exact(&mut data)
                .await
                .map_err(|_| MuxError::SessionClosed)?;
        }
        inner.data_ready.store(true, Ordering::Release);

        match header.cmd {
            Cmd::Nop => {}
            Cmd::Syn => {
                if inner.get_stream(header.stream_id).is_some() {
                    continue;
                }
                let shared = Arc::new(StreamShared::new(header.stream_id));
                inner
                    .streams()
                    .insert(header.stream_id, Arc::clone(&shared));
                let stream = Stream::new(shared, Arc::clone(inner));
                if let Err(mpsc::error::TrySendError::Full(stream)) =
                    inner.accept_tx.try_send(stream)
                {
                    // dropping it refuses the stream with FIN
                    warn!("mux accept backlog full, refusing stream {}", stream.id());
                }
            }
            Cmd::Fin => {
                if let Some(stream) = inner.get_stream(header.stream_id) {
                    stream.push_fin();
                }
            }
            Cmd::Psh => {
                if let Some(stream) = inner.get_stream(header.stream_id) {
                    stream.push_data(data.freeze());
                }
            }
            Cmd::Upd => {
                let (consumed, window) = parse_window_update(&data)?;
                if let Some(stream) = inner.get_stream(header.stream_id) {
                    stream.update_window(consumed, window);
                }
            }
        }
    }
}

async fn send_loop(
    inner: Arc<SessionInner>,
    mut writer: WriteHalf<BoxedStream>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) {
    let mut buf = BytesMut::new();

    while let Some(frame) = frames.recv().await {
        frame.encode(&mut buf);
        // coalesce whatever else is already queued
        while let Ok(frame) = frames.try_recv() {
            frame.encode(&mut buf);
            if buf.len() >= 64 * 1024 {
                break;
            }
        }

        let result = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        buf.clear();

        if let Err(e) = result {
            debug!("mux session write: {}", e);
            inner.shutdown(MuxError::SessionClosed);
            return;
        }
    }
}

async fn keepalive_loop(inner: Arc<SessionInner>) {
    let config = inner.config.clone();
    let mut ping = interval_at(
        Instant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );
    let mut check = interval_at(Instant::now() + config.idle_timeout, config.idle_timeout);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if inner.send_frame(Frame::new(config.version, Cmd::Nop, 0)).is_err() {
                    return;
                }
                close_idle_streams(&inner);
            }
            _ = check.tick() => {
                if !inner.data_ready.swap(false, Ordering::AcqRel) {
                    inner.shutdown(MuxError::KeepaliveTimeout);
                    return;
                }
            }
        }
    }
}

fn close_idle_streams(inner: &SessionInner) {
    let idle_timeout = inner.config.idle_timeout;
    let streams: Vec<_> = inner.streams().values().cloned().collect();

    for stream in streams {
        let send_fin = {
            let mut state = stream.lock();
            if state.error.is_some() || state.last_activity.elapsed() < idle_timeout {
                continue;
            }
            let send_fin = !state.fin_sent;
            state.fin_sent = true;
            send_fin
        };
        debug!("stream {} idle for {:?}, closing", stream.id, idle_timeout);
        if send_fin {
            let _ = inner.send_frame(Frame::new(inner.config.version, Cmd::Fin, stream.id));
        }
        stream.fail(MuxError::StreamIdle);
    }
}
