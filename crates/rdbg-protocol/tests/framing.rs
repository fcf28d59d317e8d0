// crates/rdbg-protocol/tests/framing.rs

use bytes::BytesMut;
use rdbg_core::{Command, ContextId};
use rdbg_protocol::{decode_line, encode_command, find_frame, Frame, FrameCodec};
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn encoded_command_decodes_over_either_terminator() {
    let command = Command::new(rdbg_core::ClientId(3), ContextId(7), r#"{"a":1}"#);

    let mut wire = BytesMut::new();
    encode_command(command.context_id, &command.payload, &mut wire);

    let lf = wire.to_vec();
    let mut crlf = lf[..lf.len() - 1].to_vec();
    crlf.extend_from_slice(b"\r\n");

    for bytes in [lf, crlf] {
        let (len, consumed) = find_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        let frame = decode_line(&bytes[..len]).unwrap();
        assert_eq!(frame, Frame::new(ContextId(7), r#"{"a":1}"#));
    }
}

#[test]
fn codec_round_trips_a_stream() {
    let mut codec = FrameCodec::new();
    let mut wire = BytesMut::new();
    codec.encode(Frame::control("get_available_contexts"), &mut wire).unwrap();
    codec
        .encode(Frame::from(Command::new(rdbg_core::ClientId(1), ContextId(2), "{}")), &mut wire)
        .unwrap();

    // Deliver the bytes in two uneven chunks.
    let mut inbound = BytesMut::new();
    let split = 5;
    inbound.extend_from_slice(&wire[..split]);
    assert_eq!(codec.decode(&mut inbound).unwrap(), None);
    inbound.extend_from_slice(&wire[split..]);

    assert_eq!(
        codec.decode(&mut inbound).unwrap(),
        Some(Frame::control("get_available_contexts"))
    );
    assert_eq!(
        codec.decode(&mut inbound).unwrap(),
        Some(Frame::new(ContextId(2), "{}"))
    );
    assert_eq!(codec.decode(&mut inbound).unwrap(), None);
}
