//! X25519 key agreement
//!
//! Static identity keys and per-epoch ratchet keys share one type. Secrets
//! are zeroized on drop by `x25519-dalek`.

use std::fmt;

use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Size of X25519 public keys and shared secrets
pub const PUBLIC_KEY_SIZE: usize = 32;

/// An X25519 public key.
///
/// Ordered byte-wise so two participants can agree on session roles without
/// a round trip.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Wrap raw bytes. See [`PublicKey::validate`].
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Raw bytes, by value.
    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    /// Check that agreement with this key will depend on our secret.
    ///
    /// Clamped scalars are multiples of the cofactor, so any fixed secret
    /// maps every small-order point (on the curve or its twist) to zero.
    ///
    /// # Errors
    ///
    /// - `InvalidKey` if the key is a low-order point
    pub fn validate(&self) -> Result<(), CryptoError> {
        let witness = StaticSecret::from([1u8; PUBLIC_KEY_SIZE]);
        if witness.diffie_hellman(&x25519_dalek::PublicKey::from(self.0)).was_contributory() {
            Ok(())
        } else {
            Err(CryptoError::InvalidKey { reason: "low-order point" })
        }
    }
}

impl From<[u8; PUBLIC_KEY_SIZE]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// An X25519 key pair.
///
/// Used both for long-term participant identity and for one-epoch ratchet
/// keys. Built from caller-supplied secret bytes so tests stay deterministic.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Build a key pair from 32 secret bytes (clamped by X25519).
    pub fn from_secret_bytes(mut bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();
        let public = PublicKey(*x25519_dalek::PublicKey::from(&secret).as_bytes());
        Self { secret, public }
    }

    /// Public half.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Diffie-Hellman against `remote`.
    ///
    /// # Errors
    ///
    /// - `InvalidKey`: `remote` is a low-order point (the shared secret would
    ///   not depend on our secret)
    pub fn agree(&self, remote: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.secret.diffie_hellman(&x25519_dalek::PublicKey::from(remote.0));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey { reason: "low-order point" });
        }
        Ok(SharedSecret(*shared.as_bytes()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Output of X25519. Must go through a KDF before use as key material.
pub struct SharedSecret([u8; PUBLIC_KEY_SIZE]);

impl SharedSecret {
    /// Raw bytes, for KDF input only.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// Perform key agreement between a local key pair and a remote public key.
///
/// # Errors
///
/// - `InvalidKey`: see [`KeyPair::agree`]
pub fn agree(local: &KeyPair, remote: &PublicKey) -> Result<SharedSecret, CryptoError> {
    local.agree(remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let alice = KeyPair::from_secret_bytes([1u8; 32]);
        let bob = KeyPair::from_secret_bytes([2u8; 32]);

        let ab = agree(&alice, &bob.public_key()).unwrap();
        let ba = agree(&bob, &alice.public_key()).unwrap();

        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn different_peers_give_different_secrets() {
        let alice = KeyPair::from_secret_bytes([1u8; 32]);
        let bob = KeyPair::from_secret_bytes([2u8; 32]);
        let carol = KeyPair::from_secret_bytes([3u8; 32]);

        let ab = agree(&alice, &bob.public_key()).unwrap();
        let ac = agree(&alice, &carol.public_key()).unwrap();

        assert_ne!(ab.as_bytes(), ac.as_bytes());
    }

    #[test]
    fn identity_point_is_rejected() {
        let alice = KeyPair::from_secret_bytes([1u8; 32]);
        let zero = PublicKey::from_bytes([0u8; 32]);

        assert!(matches!(agree(&alice, &zero), Err(CryptoError::InvalidKey { .. })));
    }

    #[test]
    fn low_order_point_is_rejected() {
        let alice = KeyPair::from_secret_bytes([1u8; 32]);
        // u = 1 has order 4 on Curve25519
        let mut order_four = [0u8; 32];
        order_four[0] = 1;

        let result = agree(&alice, &PublicKey::from_bytes(order_four));
        assert!(matches!(result, Err(CryptoError::InvalidKey { .. })));
    }

    #[test]
    fn validate_matches_agreement() {
        let alice = KeyPair::from_secret_bytes([1u8; 32]);
        let bob = KeyPair::from_secret_bytes([2u8; 32]);
        assert!(bob.public_key().validate().is_ok());

        let mut order_four = [0u8; 32];
        order_four[0] = 1;
        for bytes in [[0u8; 32], order_four] {
            let key = PublicKey::from_bytes(bytes);
            assert!(matches!(key.validate(), Err(CryptoError::InvalidKey { .. })));
            assert!(agree(&alice, &key).is_err());
        }
    }

    #[test]
    fn debug_does_not_print_secret() {
        let alice = KeyPair::from_secret_bytes([9u8; 32]);
        let rendered = format!("{alice:?}");
        assert!(rendered.contains("REDACTED"));
    }
}
