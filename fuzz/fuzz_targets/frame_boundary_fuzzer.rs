//! Fuzz target for frame header boundary conditions
//!
//! # Strategy
//!
//! - Magic bytes: valid, off-by-one, all-zeros, random
//! - Payload size: zero, small, at-max, just-over-max, `u32::MAX`
//! - Version: valid (0x01), zero, random
//! - Thread/sender/recipient: boundary values (0, 1, MAX)
//!
//! # Invariants
//!
//! - `payload_size > MAX_PAYLOAD_SIZE` MUST fail before any payload read
//! - Invalid magic or version MUST fail
//! - Encoded size MUST equal 48 + payload length

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use luckyones_proto::{Frame, FrameHeader, Opcode};

#[derive(Debug, Clone, Arbitrary)]
struct BoundaryFrame {
    magic: MagicBytes,
    version: VersionBytes,
    opcode: u16,
    payload_size: PayloadSize,
    thread_id: Wide,
    sender_id: Narrow,
    recipient_id: Narrow,
}

#[derive(Debug, Clone, Arbitrary)]
enum MagicBytes {
    Valid,
    OffByOne(u8),
    AllZeros,
    Random([u8; 4]),
}

#[derive(Debug, Clone, Arbitrary)]
enum VersionBytes {
    Valid,
    Zero,
    Random(u8),
}

#[derive(Debug, Clone, Arbitrary)]
enum PayloadSize {
    Zero,
    Small(u8),
    AtMax,
    JustOverMax,
    MaxU32,
    Random(u32),
}

#[derive(Debug, Clone, Arbitrary)]
enum Wide {
    Zero,
    One,
    Max,
    Random(u128),
}

#[derive(Debug, Clone, Arbitrary)]
enum Narrow {
    Zero,
    One,
    Max,
    Random(u64),
}

fn wide(value: &Wide) -> u128 {
    match value {
        Wide::Zero => 0,
        Wide::One => 1,
        Wide::Max => u128::MAX,
        Wide::Random(v) => *v,
    }
}

fn narrow(value: &Narrow) -> u64 {
    match value {
        Narrow::Zero => 0,
        Narrow::One => 1,
        Narrow::Max => u64::MAX,
        Narrow::Random(v) => *v,
    }
}

fuzz_target!(|boundary: BoundaryFrame| {
    let payload_size = match boundary.payload_size {
        PayloadSize::Zero => 0,
        PayloadSize::Small(s) => u32::from(s),
        PayloadSize::AtMax => FrameHeader::MAX_PAYLOAD_SIZE,
        PayloadSize::JustOverMax => FrameHeader::MAX_PAYLOAD_SIZE + 1,
        PayloadSize::MaxU32 => u32::MAX,
        PayloadSize::Random(r) => r,
    };
    // Only materialize small payloads; large sizes must fail on the header.
    let actual_payload = (payload_size as usize).min(1024);

    let mut buffer = vec![0u8; FrameHeader::SIZE + actual_payload];
    let magic = match boundary.magic {
        MagicBytes::Valid => FrameHeader::MAGIC.to_be_bytes(),
        MagicBytes::OffByOne(i) => {
            let mut m = FrameHeader::MAGIC.to_be_bytes();
            let index = usize::from(i) % 4;
            m[index] = m[index].wrapping_add(1);
            m
        },
        MagicBytes::AllZeros => [0; 4],
        MagicBytes::Random(r) => r,
    };
    buffer[0..4].copy_from_slice(&magic);
    buffer[4] = match boundary.version {
        VersionBytes::Valid => FrameHeader::VERSION,
        VersionBytes::Zero => 0,
        VersionBytes::Random(v) => v,
    };
    buffer[6..8].copy_from_slice(&boundary.opcode.to_be_bytes());
    buffer[8..12].copy_from_slice(&payload_size.to_be_bytes());

    let thread_id = wide(&boundary.thread_id);
    let sender_id = narrow(&boundary.sender_id);
    let recipient_id = narrow(&boundary.recipient_id);
    buffer[16..32].copy_from_slice(&thread_id.to_be_bytes());
    buffer[32..40].copy_from_slice(&sender_id.to_be_bytes());
    buffer[40..48].copy_from_slice(&recipient_id.to_be_bytes());

    if let Ok(frame) = Frame::decode(&buffer) {
        assert_eq!(u32::from_be_bytes(magic), FrameHeader::MAGIC);
        assert!(payload_size <= FrameHeader::MAX_PAYLOAD_SIZE);
        assert_eq!(frame.header.thread_id(), thread_id);
        assert_eq!(frame.header.sender_id(), sender_id);
        assert_eq!(frame.header.recipient_id(), recipient_id);
    }

    if let Some(opcode) = Opcode::from_u16(boundary.opcode) {
        let header = FrameHeader::routed(opcode, thread_id, sender_id, recipient_id);
        let frame = Frame::new(header, vec![0xAA; actual_payload]);

        let Ok(encoded) = frame.to_vec() else {
            return;
        };
        assert_eq!(encoded.len(), FrameHeader::SIZE + frame.payload.len());

        if let Ok(decoded) = Frame::decode(&encoded) {
            assert_eq!(decoded, frame);
        }
    }
});
