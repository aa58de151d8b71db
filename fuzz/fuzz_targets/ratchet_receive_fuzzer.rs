//! Fuzz target for ratchet receive
//!
//! Interleaves genuine messages with forged headers and corrupted
//! ciphertext.
//!
//! # Invariants
//!
//! - A forged or corrupted message never decrypts
//! - A rejected message never changes session state: every genuine message
//!   still decrypts exactly once afterwards
//! - Nothing panics

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use luckyones_crypto::{KeyPair, PublicKey, RatchetHeader, RatchetSession, Role, SessionLimits};

const CONTEXT: &[u8] = b"fuzz";

#[derive(Debug, Clone, Arbitrary)]
enum Step {
    /// Initiator sends; responder receives later
    Send,
    /// Deliver genuine message `index` (mod sent)
    Deliver(u8),
    /// Deliver a message with a made-up header
    Forge { ratchet_key: [u8; 32], previous: u16, counter: u16, body: Vec<u8> },
    /// Deliver genuine message `index` with one flipped bit
    Corrupt { index: u8, bit: u16 },
}

fuzz_target!(|steps: Vec<Step>| {
    let limits = SessionLimits { max_skip: 64, max_skipped_keys: 64 };
    let a = KeyPair::from_secret_bytes([1; 32]);
    let b = KeyPair::from_secret_bytes([2; 32]);
    let Ok(mut left) = RatchetSession::establish(&a, &b.public_key(), CONTEXT, [3; 32], limits)
    else {
        return;
    };
    let Ok(mut right) = RatchetSession::establish(&b, &a.public_key(), CONTEXT, [4; 32], limits)
    else {
        return;
    };
    if left.role() == Role::Responder {
        std::mem::swap(&mut left, &mut right);
    }

    let mut sent: Vec<(RatchetHeader, Vec<u8>, bool)> = Vec::new();
    let mut fresh = 0u8;
    let mut next = || {
        fresh = fresh.wrapping_add(1);
        [fresh; 32]
    };

    for step in steps.into_iter().take(128) {
        match step {
            Step::Send => {
                if sent.len() < 60 {
                    if let Ok((header, sealed)) = left.encrypt(CONTEXT, b"payload") {
                        sent.push((header, sealed, false));
                    }
                }
            },
            Step::Deliver(index) if !sent.is_empty() => {
                let slot = usize::from(index) % sent.len();
                let (header, sealed, opened) = &mut sent[slot];
                let result = right.decrypt(header, CONTEXT, sealed, &mut next);
                if *opened {
                    assert!(result.is_err(), "message opened twice");
                } else if result.is_ok() {
                    *opened = true;
                }
            },
            Step::Deliver(_) => {},
            Step::Forge { ratchet_key, previous, counter, body } => {
                let header = RatchetHeader {
                    ratchet_key: PublicKey::from_bytes(ratchet_key),
                    previous_chain_length: u32::from(previous),
                    counter: u32::from(counter),
                };
                assert!(right.decrypt(&header, CONTEXT, &body, &mut next).is_err());
            },
            Step::Corrupt { index, bit } if !sent.is_empty() => {
                let slot = usize::from(index) % sent.len();
                let (header, sealed, _) = &sent[slot];
                if sealed.is_empty() {
                    continue;
                }
                let mut corrupted = sealed.clone();
                let position = usize::from(bit) % (corrupted.len() * 8);
                corrupted[position / 8] ^= 1 << (position % 8);
                assert!(right.decrypt(header, CONTEXT, &corrupted, &mut next).is_err());
            },
            Step::Corrupt { .. } => {},
        }
    }

    for (header, sealed, opened) in &sent {
        if !opened {
            assert!(right.decrypt(header, CONTEXT, sealed, &mut next).is_ok());
        }
    }
});
