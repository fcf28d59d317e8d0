//! rdbg-protocol
//!
//! Wire-level framing for the remote debugger.
//!
//! - [`wire_types`] : constants and control requests
//! - [`line_codec`] : `[ctx/]payload\n` framing, plain and `tokio_util`

pub mod wire_types;
pub mod line_codec;

pub use wire_types::{ControlRequest, DEFAULT_BUFFER_SIZE, DEFAULT_TCP_PORT};

pub use line_codec::{
    FrameError,
    Frame,
    FrameCodec,
    check_clean,
    decode_line,
    encode_command,
    encoded_len,
    find_frame,
    split_context,
};
