//! Key derivation using HKDF-SHA256

use hkdf::Hkdf;
use sha2::Sha256;

use crate::key_exchange::SharedSecret;

/// Label mixed into every session seed
const SESSION_LABEL: &[u8] = b"luckyonesSessionV1";

/// Label for root-chain steps
const ROOT_LABEL: &[u8] = b"luckyonesRootV1";

/// Derive the initial root seed for a session.
///
/// `context` scopes the session (the thread id), so the same two
/// participants hold unrelated ratchets in different threads.
pub fn derive_session_seed(shared: &SharedSecret, context: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());

    let mut info = Vec::with_capacity(SESSION_LABEL.len() + context.len());
    info.extend_from_slice(SESSION_LABEL);
    info.extend_from_slice(context);

    let mut seed = [0u8; 32];
    let Ok(()) = hkdf.expand(&info, &mut seed) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    seed
}

/// One step of the root chain.
///
/// Uses the current root key as HKDF salt and the DH output as input key
/// material. Returns `(next_root_key, chain_key)`.
pub fn derive_root_step(root_key: &[u8; 32], dh: &SharedSecret) -> ([u8; 32], [u8; 32]) {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key), dh.as_bytes());

    let mut output = [0u8; 64];
    let Ok(()) = hkdf.expand(ROOT_LABEL, &mut output) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut next_root = [0u8; 32];
    let mut chain = [0u8; 32];
    next_root.copy_from_slice(&output[..32]);
    chain.copy_from_slice(&output[32..]);
    zeroize::Zeroize::zeroize(&mut output);

    (next_root, chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_exchange::KeyPair;

    fn shared() -> SharedSecret {
        let a = KeyPair::from_secret_bytes([1u8; 32]);
        let b = KeyPair::from_secret_bytes([2u8; 32]);
        a.agree(&b.public_key()).unwrap()
    }

    #[test]
    fn seed_is_deterministic() {
        assert_eq!(derive_session_seed(&shared(), b"t"), derive_session_seed(&shared(), b"t"));
    }

    #[test]
    fn seed_depends_on_context() {
        let one = derive_session_seed(&shared(), &1u128.to_be_bytes());
        let two = derive_session_seed(&shared(), &2u128.to_be_bytes());
        assert_ne!(one, two);
    }

    #[test]
    fn seed_differs_from_raw_secret() {
        let secret = shared();
        assert_ne!(&derive_session_seed(&secret, b""), secret.as_bytes());
    }

    #[test]
    fn root_step_splits_into_distinct_keys() {
        let (root, chain) = derive_root_step(&[5u8; 32], &shared());
        assert_ne!(root, chain);
        assert_ne!(root, [5u8; 32]);
    }

    #[test]
    fn root_step_depends_on_root_key() {
        let (root_a, chain_a) = derive_root_step(&[5u8; 32], &shared());
        let (root_b, chain_b) = derive_root_step(&[6u8; 32], &shared());
        assert_ne!(root_a, root_b);
        assert_ne!(chain_a, chain_b);
    }
}
