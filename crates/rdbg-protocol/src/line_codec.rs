// crates/rdbg-protocol/src/line_codec.rs

//! Line framing: `[ctx/]payload\n`.
//!
//! The server works on its own connection buffers and uses the plain
//! functions ([`find_frame`], [`decode_line`], [`encode_command`]); async
//! clients use [`FrameCodec`] with `tokio_util`'s `FramedRead` /
//! `FramedWrite`.

use bytes::{Buf, BufMut, BytesMut};
use rdbg_core::{Command, ContextId, ErrorCode};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::wire_types::{
    CARRIAGE_RETURN, CONTEXT_SEPARATOR, DEFAULT_BUFFER_SIZE, FORBIDDEN_BYTE, LINE_FEED,
};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("NUL byte in stream")]
    MaliciousData,

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("broken context id `{0}`")]
    BrokenContextId(String),

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FrameError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FrameError::MaliciousData => ErrorCode::MaliciousData,
            FrameError::FrameTooLarge { .. } => ErrorCode::OutOfMemory,
            FrameError::BrokenContextId(_) | FrameError::InvalidUtf8 => ErrorCode::UnknownProtocol,
            FrameError::Io(_) => ErrorCode::RecvFailed,
        }
    }
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub context_id: ContextId,
    pub payload: String,
}

impl Frame {
    pub fn new(context_id: ContextId, payload: impl Into<String>) -> Self {
        Self {
            context_id,
            payload: payload.into(),
        }
    }

    /// Frame without a context prefix.
    pub fn control(payload: impl Into<String>) -> Self {
        Self::new(ContextId::NONE, payload)
    }
}

impl From<Command> for Frame {
    fn from(command: Command) -> Self {
        Frame::new(command.context_id, command.payload)
    }
}

// ----------------------------------------------------------------------
// Plain helpers
// ----------------------------------------------------------------------

/// Locate the first complete line in `buf`.
///
/// Returns `(line_len, consumed)`: the line without its terminator, and
/// how many bytes to drop once the line has been handled. `\r\n` and `\n`
/// are both accepted. Nothing is consumed here.
pub fn find_frame(buf: &[u8]) -> Option<(usize, usize)> {
    let newline = buf.iter().position(|&b| b == LINE_FEED)?;
    let line_len = if newline > 0 && buf[newline - 1] == CARRIAGE_RETURN {
        newline - 1
    } else {
        newline
    };
    Some((line_len, newline + 1))
}

/// Reject buffers that contain a NUL byte.
pub fn check_clean(buf: &[u8]) -> Result<(), FrameError> {
    if buf.contains(&FORBIDDEN_BYTE) {
        return Err(FrameError::MaliciousData);
    }
    Ok(())
}

/// Split an optional `N/` prefix off `line`.
///
/// The prefix only counts when the separator appears before the first
/// `{`, so slashes inside JSON strings are left alone.
pub fn split_context(line: &str) -> Result<(ContextId, &str), FrameError> {
    let separator = line.find(CONTEXT_SEPARATOR as char);
    let brace = line.find('{');

    match separator {
        Some(at) if brace.map_or(true, |b| at < b) => {
            let prefix = &line[..at];
            let id = prefix
                .trim()
                .parse::<i32>()
                .map_err(|_| FrameError::BrokenContextId(prefix.to_string()))?;
            Ok((ContextId(id), &line[at + 1..]))
        }
        _ => Ok((ContextId::NONE, line)),
    }
}

/// Decode one line (without terminator) into a frame.
pub fn decode_line(line: &[u8]) -> Result<Frame, FrameError> {
    check_clean(line)?;
    let text = std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)?;
    let (context_id, payload) = split_context(text)?;
    Ok(Frame::new(context_id, payload))
}

/// Bytes [`encode_command`] will write for this frame.
pub fn encoded_len(context_id: ContextId, payload: &str) -> usize {
    let prefix = if context_id.is_none() {
        0
    } else {
        context_id.0.to_string().len() + 1
    };
    prefix + payload.len() + 1
}

/// Append `[ctx/]payload\n` to `dst`.
pub fn encode_command(context_id: ContextId, payload: &str, dst: &mut BytesMut) {
    dst.reserve(encoded_len(context_id, payload));
    if !context_id.is_none() {
        dst.put_slice(context_id.0.to_string().as_bytes());
        dst.put_u8(CONTEXT_SEPARATOR);
    }
    dst.put_slice(payload.as_bytes());
    dst.put_u8(LINE_FEED);
}

// ----------------------------------------------------------------------
// tokio-util codec
// ----------------------------------------------------------------------

/// Line codec for async peers.
///
/// Blank lines are skipped. A line longer than the limit, or a buffer
/// growing past it without a terminator, is an error.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            let Some((line_len, consumed)) = find_frame(src) else {
                check_clean(src)?;
                if src.len() > self.max_frame_len {
                    return Err(FrameError::FrameTooLarge {
                        size: src.len(),
                        max: self.max_frame_len,
                    });
                }
                return Ok(None);
            };

            if line_len > self.max_frame_len {
                return Err(FrameError::FrameTooLarge {
                    size: line_len,
                    max: self.max_frame_len,
                });
            }

            let frame = if line_len == 0 {
                None
            } else {
                Some(decode_line(&src[..line_len])?)
            };
            src.advance(consumed);

            if let Some(frame) = frame {
                return Ok(Some(frame));
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let size = encoded_len(item.context_id, &item.payload);
        if size > self.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.max_frame_len,
            });
        }
        check_clean(item.payload.as_bytes())?;
        encode_command(item.context_id, &item.payload, dst);
        Ok(())
    }
}
