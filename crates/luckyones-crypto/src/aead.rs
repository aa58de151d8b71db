//! Authenticated encryption using `ChaCha20-Poly1305`
//!
//! Stateless: the caller owns key and nonce discipline. The ratchet derives a
//! fresh key for every message, so a nonce never repeats under one key.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::error::CryptoError;

/// Symmetric key size (256 bits)
pub const KEY_SIZE: usize = 32;

/// Nonce size (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size, appended to every ciphertext
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext`, binding `associated_data`.
///
/// Returns `ciphertext || tag`, always `plaintext.len() + TAG_SIZE` bytes.
pub fn seal(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    associated_data: &[u8],
    plaintext: &[u8],
) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let payload = Payload { msg: plaintext, aad: associated_data };

    let Ok(sealed) = cipher.encrypt(Nonce::from_slice(nonce), payload) else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail for in-memory buffers");
    };

    sealed
}

/// Decrypt and verify `ciphertext || tag`.
///
/// Fails closed: on any mismatch no plaintext bytes are returned.
///
/// # Errors
///
/// - `Authentication`: tag mismatch, truncated input, wrong key or wrong
///   associated data
pub fn open(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    associated_data: &[u8],
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < TAG_SIZE {
        return Err(CryptoError::Authentication);
    }

    let cipher = ChaCha20Poly1305::new(key.into());
    let payload = Payload { msg: sealed, aad: associated_data };

    cipher.decrypt(Nonce::from_slice(nonce), payload).map_err(|_| CryptoError::Authentication)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const KEY: [u8; KEY_SIZE] = [7u8; KEY_SIZE];
    const NONCE: [u8; NONCE_SIZE] = [1u8; NONCE_SIZE];

    #[test]
    fn seal_appends_tag() {
        let sealed = seal(&KEY, &NONCE, b"", b"hello");
        assert_eq!(sealed.len(), 5 + TAG_SIZE);
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let sealed = seal(&KEY, &NONCE, b"ctx", b"");
        assert_eq!(open(&KEY, &NONCE, b"ctx", &sealed).unwrap(), b"");
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&KEY, &NONCE, b"", b"secret");
        let other = [8u8; KEY_SIZE];
        assert_eq!(open(&other, &NONCE, b"", &sealed), Err(CryptoError::Authentication));
    }

    #[test]
    fn wrong_nonce_fails() {
        let sealed = seal(&KEY, &NONCE, b"", b"secret");
        let other = [2u8; NONCE_SIZE];
        assert_eq!(open(&KEY, &other, b"", &sealed), Err(CryptoError::Authentication));
    }

    #[test]
    fn wrong_associated_data_fails() {
        let sealed = seal(&KEY, &NONCE, b"thread-1", b"secret");
        assert_eq!(open(&KEY, &NONCE, b"thread-2", &sealed), Err(CryptoError::Authentication));
    }

    #[test]
    fn truncated_input_fails() {
        assert_eq!(open(&KEY, &NONCE, b"", &[0u8; TAG_SIZE - 1]), Err(CryptoError::Authentication));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_open_inverts_seal(
            key in any::<[u8; KEY_SIZE]>(),
            nonce in any::<[u8; NONCE_SIZE]>(),
            aad in prop::collection::vec(any::<u8>(), 0..64),
            plaintext in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let sealed = seal(&key, &nonce, &aad, &plaintext);
            prop_assert_eq!(open(&key, &nonce, &aad, &sealed).unwrap(), plaintext);
        }

        #[test]
        fn prop_any_bit_flip_is_rejected(
            plaintext in prop::collection::vec(any::<u8>(), 0..128),
            position in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut sealed = seal(&KEY, &NONCE, b"aad", &plaintext);
            let index = position.index(sealed.len());
            sealed[index] ^= 1 << bit;

            prop_assert_eq!(open(&KEY, &NONCE, b"aad", &sealed), Err(CryptoError::Authentication));
        }
    }
}
