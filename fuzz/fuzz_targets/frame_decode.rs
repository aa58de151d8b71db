//! Fuzz target for Frame::decode
//!
//! Arbitrary bytes must never panic the parser: size arithmetic, short
//! buffers and bogus headers all come back as errors.

#![no_main]

use libfuzzer_sys::fuzz_target;
use luckyones_proto::Frame;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        assert!(frame.payload.len() <= data.len());
    }
});
