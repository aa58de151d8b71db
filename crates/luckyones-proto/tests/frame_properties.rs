//! Property-based tests for frame and payload decoding
//!
//! Decoding runs on untrusted bytes, so these focus on totality (never
//! panic, always classify) as much as on round trips.

use bytes::Bytes;
use luckyones_proto::{
    CreateThread, DeleteReason, DeleteThread, EncryptedImage, EncryptedMessage, ErrorPayload,
    Frame, FrameHeader, Join, Leave, Opcode, ParticipantInfo, Payload, ProtocolError,
    ThreadList, ThreadSummary, UserList, WireRatchetHeader, WireThreadKind,
};
use proptest::prelude::*;

fn arbitrary_opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![
        Just(Opcode::Join),
        Just(Opcode::Leave),
        Just(Opcode::UserList),
        Just(Opcode::Message),
        Just(Opcode::Image),
        Just(Opcode::CreateThread),
        Just(Opcode::DeleteThread),
        Just(Opcode::ThreadList),
        Just(Opcode::Error),
    ]
}

fn arbitrary_frame() -> impl Strategy<Value = Frame> {
    (
        arbitrary_opcode(),
        any::<u128>(),
        any::<u64>(),
        any::<u64>(),
        prop::collection::vec(any::<u8>(), 0..1024),
    )
        .prop_map(|(opcode, thread, sender, recipient, payload)| {
            Frame::new(FrameHeader::routed(opcode, thread, sender, recipient), Bytes::from(payload))
        })
}

fn arbitrary_kind() -> impl Strategy<Value = WireThreadKind> {
    prop_oneof![
        Just(WireThreadKind::Main),
        Just(WireThreadKind::Public),
        Just(WireThreadKind::Private),
    ]
}

fn arbitrary_ratchet_header() -> impl Strategy<Value = WireRatchetHeader> {
    (any::<[u8; 32]>(), any::<u32>(), any::<u32>()).prop_map(
        |(ratchet_key, previous_chain_length, counter)| WireRatchetHeader {
            ratchet_key,
            previous_chain_length,
            counter,
        },
    )
}

fn arbitrary_payload() -> impl Strategy<Value = Payload> {
    let name = "[a-z]{1,24}";
    prop_oneof![
        (any::<[u8; 32]>(), name, prop::option::of(any::<u128>())).prop_map(
            |(public_key, username, thread_id)| Payload::Join(Join {
                public_key,
                username,
                thread_id
            })
        ),
        prop::option::of(name).prop_map(|reason| Payload::Leave(Leave { reason })),
        prop::collection::vec((any::<u64>(), any::<[u8; 32]>(), name), 0..8).prop_map(|list| {
            Payload::UserList(UserList {
                participants: list
                    .into_iter()
                    .map(|(id, public_key, username)| ParticipantInfo { id, public_key, username })
                    .collect(),
            })
        }),
        (arbitrary_ratchet_header(), prop::collection::vec(any::<u8>(), 16..256)).prop_map(
            |(header, ciphertext)| Payload::Message(EncryptedMessage { header, ciphertext })
        ),
        (arbitrary_ratchet_header(), any::<u128>(), prop::collection::vec(any::<u8>(), 16..256))
            .prop_map(|(header, attachment_id, ciphertext)| {
                Payload::Image(EncryptedImage { header, attachment_id, ciphertext })
            }),
        (
            any::<u128>(),
            arbitrary_kind(),
            name,
            any::<u64>(),
            prop::collection::vec(any::<u64>(), 0..16),
        )
            .prop_map(|(thread_id, kind, name, creator, members)| {
                Payload::CreateThread(CreateThread { thread_id, kind, name, creator, members })
            }),
        (any::<u128>(), prop_oneof![Just(DeleteReason::Expired), Just(DeleteReason::Explicit)])
            .prop_map(|(thread_id, reason)| {
                Payload::DeleteThread(DeleteThread { thread_id, reason })
            }),
        prop::collection::vec(
            (any::<u128>(), arbitrary_kind(), name, prop::option::of(any::<u64>())),
            0..4,
        )
            .prop_map(|threads| {
                Payload::ThreadList(ThreadList {
                    threads: threads
                        .into_iter()
                        .map(|(thread_id, kind, name, remaining_secs)| ThreadSummary {
                            thread_id,
                            kind,
                            name,
                            creator: 1,
                            members: vec![1, 2],
                            remaining_secs,
                        })
                        .collect(),
                })
            }),
        (any::<u16>(), name)
            .prop_map(|(code, message)| Payload::Error(ErrorPayload { code, message })),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_frame_encode_decode_roundtrip(frame in arbitrary_frame()) {
        let wire = frame.to_vec().unwrap();
        prop_assert_eq!(wire.len(), frame.wire_len());

        let decoded = Frame::decode(&wire).unwrap();
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn prop_payload_survives_framing(payload in arbitrary_payload(), thread in any::<u128>()) {
        let header = FrameHeader::routed(Opcode::Error, thread, 1, 2);
        let frame = payload.clone().into_frame(header).unwrap();
        prop_assert_eq!(frame.header.opcode_enum(), Some(payload.opcode()));

        let wire = frame.to_vec().unwrap();
        let decoded = Payload::from_frame(&Frame::decode(&wire).unwrap()).unwrap();
        prop_assert_eq!(decoded, payload);
    }

    #[test]
    fn prop_truncation_is_detected(frame in arbitrary_frame(), cut in 1usize..64) {
        prop_assume!(!frame.payload.is_empty());
        let wire = frame.to_vec().unwrap();
        let cut = cut.min(frame.payload.len());

        let result = Frame::decode(&wire[..wire.len() - cut]);
        let is_truncated = matches!(result, Err(ProtocolError::FrameTruncated { .. }));
        prop_assert!(is_truncated);
    }

    #[test]
    fn prop_arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = Frame::decode(&bytes);
        let opcodes = [
            Opcode::Join,
            Opcode::Message,
            Opcode::Image,
            Opcode::CreateThread,
            Opcode::ThreadList,
        ];
        for opcode in opcodes {
            let _ = Payload::decode(opcode, &bytes);
        }
    }

    #[test]
    fn prop_unknown_opcodes_rejected(
        raw in any::<u16>(),
        payload in prop::collection::vec(any::<u8>(), 0..32),
    ) {
        prop_assume!(Opcode::from_u16(raw).is_none());

        let mut wire = Frame::new(FrameHeader::new(Opcode::Join), payload).to_vec().unwrap();
        wire[6..8].copy_from_slice(&raw.to_be_bytes());

        let frame = Frame::decode(&wire).unwrap();
        prop_assert_eq!(Payload::from_frame(&frame), Err(ProtocolError::UnknownOpcode(raw)));
    }
}
