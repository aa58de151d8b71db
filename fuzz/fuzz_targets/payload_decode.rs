//! Fuzz target for Payload::from_frame
//!
//! Feeds the same bytes under every opcode to catch type confusion and
//! malformed CBOR. Decoding may fail but must never panic.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use luckyones_proto::{Frame, FrameHeader, Opcode, Payload};

fuzz_target!(|data: &[u8]| {
    let opcodes = [
        Opcode::Join,
        Opcode::Leave,
        Opcode::UserList,
        Opcode::Message,
        Opcode::Image,
        Opcode::CreateThread,
        Opcode::DeleteThread,
        Opcode::ThreadList,
        Opcode::Error,
    ];

    for opcode in opcodes {
        let header = FrameHeader::routed(opcode, 1, 1, 2);
        let frame = Frame::new(header, Bytes::copy_from_slice(data));

        if let Ok(payload) = Payload::from_frame(&frame) {
            assert_eq!(payload.opcode(), opcode);
        }
    }
});
