//! Multiplexer frame format
//!
//! ```text
//! +---------+-----+-----------+-----------+---------
//! | version | cmd | length    | stream id | data ...
//! | u8      | u8  | u16 (LE)  | u32 (LE)  |
//! +---------+-----+-----------+-----------+---------
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::MuxError;

pub const HEADER_SIZE: usize = 8;

/// Payload length of an UPD frame
pub const UPD_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    /// Open a stream
    Syn = 0,
    /// Half-close a stream
    Fin = 1,
    /// Data
    Psh = 2,
    /// Keepalive
    Nop = 3,
    /// Window update
    Upd = 4,
}

impl TryFrom<u8> for Cmd {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Cmd::Syn),
            1 => Ok(Cmd::Fin),
            2 => Ok(Cmd::Psh),
            3 => Ok(Cmd::Nop),
            4 => Ok(Cmd::Upd),
            other => Err(MuxError::UnknownCommand(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub cmd: Cmd,
    pub length: u16,
    pub stream_id: u32,
}

impl Header {
    pub fn parse(buf: &[u8; HEADER_SIZE], expected_version: u8) -> Result<Self, MuxError> {
        let version = buf[0];
        if version != expected_version {
            return Err(MuxError::Version(version));
        }
        Ok(Self {
            version,
            cmd: Cmd::try_from(buf[1])?,
            length: u16::from_le_bytes([buf[2], buf[3]]),
            stream_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub cmd: Cmd,
    pub stream_id: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(version: u8, cmd: Cmd, stream_id: u32) -> Self {
        Self {
            version,
            cmd,
            stream_id,
            data: Bytes::new(),
        }
    }

    pub fn data(version: u8, stream_id: u32, data: Bytes) -> Self {
        Self {
            version,
            cmd: Cmd::Psh,
            stream_id,
            data,
        }
    }

    /// Window update: bytes consumed so far and the receive window
    pub fn window_update(version: u8, stream_id: u32, consumed: u32, window: u32) -> Self {
        let mut data = BytesMut::with_capacity(UPD_SIZE);
        data.put_u32_le(consumed);
        data.put_u32_le(window);
        Self {
            version,
            cmd: Cmd::Upd,
            stream_id,
            data: data.freeze(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.version);
        dst.put_u8(self.cmd as u8);
        dst.put_u16_le(self.data.len() as u16);
        dst.put_u32_le(self.stream_id);
        dst.put_slice(&self.data);
    }
}

/// Parse an UPD payload into `(consumed, window)`.
pub fn parse_window_update(mut data: &[u8]) -> Result<(u32, u32), MuxError> {
    if data.len() < UPD_SIZE {
        return Err(MuxError::Malformed(format!(
            "window update of {} bytes",
            data.len()
        )));
    }
    Ok((data.get_u32_le(), data.get_u32_le()))
}
