// Stream multiplexer over the secure channel
//
// Speaks version 2 of the smux framing so it interoperates with existing
// tunnel servers: many logical streams, each with its own credit-based flow
// control, share one duplex byte stream.

pub mod frame;
mod session;
mod stream;

pub use frame::{Cmd, Frame};
pub use session::{Role, Session};
pub use stream::Stream;

use std::io;
use thiserror::Error;

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u8 = 2;

/// Send window assumed for a stream until the peer's first window update
pub const INITIAL_PEER_WINDOW: u32 = 256 * 1024;

/// Accepted streams waiting for `accept_stream`
const ACCEPT_BACKLOG: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("unsupported protocol version {0}")]
    Version(u8),

    #[error("unknown command {0}")]
    UnknownCommand(u8),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("invalid multiplexer config: {0}")]
    InvalidConfig(String),

    #[error("session closed")]
    SessionClosed,

    #[error("stream closed")]
    StreamClosed,

    #[error("stream idle for too long")]
    StreamIdle,

    #[error("keepalive timeout")]
    KeepaliveTimeout,
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        let kind = match err {
            MuxError::Version(_) | MuxError::UnknownCommand(_) | MuxError::Malformed(_) => {
                io::ErrorKind::InvalidData
            }
            MuxError::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            MuxError::SessionClosed | MuxError::StreamClosed => io::ErrorKind::BrokenPipe,
            MuxError::StreamIdle | MuxError::KeepaliveTimeout => io::ErrorKind::TimedOut,
        };
        io::Error::new(kind, err)
    }
}
