//! Ed25519 verification and key derivation.
//!
//! Three operations back the subscription admission path:
//!
//! - plain detached-signature verification;
//! - conversion of an Ed25519 public key to its X25519 (Montgomery) form,
//!   used to check that a claimed master key really is the preimage of a
//!   `0x05`-prefixed account id;
//! - derived-subkey computation for the legacy delegated-authentication
//!   scheme, which is plain scalar arithmetic on the main account key.

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::blake2b::Blake2b32;
use crate::{CryptoError, Result};

/// Keyed-hash domain for legacy subkey derivation.
pub const SUBKEY_HASH_KEY: &[u8] = b"OxenSSSubkey";

/// Verify a detached Ed25519 signature.
///
/// Any failure (malformed key, bad signature) is reported uniformly as
/// [`CryptoError::BadSignature`].
pub fn verify_signature(msg: &[u8], sig: &[u8; 64], pubkey: &[u8; 32]) -> Result<()> {
    let vk = VerifyingKey::from_bytes(pubkey).map_err(|_| CryptoError::BadSignature)?;
    vk.verify(msg, &Signature::from_bytes(sig))
        .map_err(|_| CryptoError::BadSignature)
}

/// Convert an Ed25519 public key to the equivalent X25519 public key.
///
/// This is the birational Edwards→Montgomery map; it matches libsodium's
/// `crypto_sign_ed25519_pk_to_curve25519`.
pub fn ed25519_to_x25519(ed: &[u8; 32]) -> Result<[u8; 32]> {
    let vk = VerifyingKey::from_bytes(ed).map_err(|_| CryptoError::InvalidKey)?;
    Ok(vk.to_montgomery().to_bytes())
}

/// Compute the verification key for a legacy 32-byte subkey tag.
///
/// With tag `c` and main account key `A`:
///
/// ```text
/// d = Blake2b-256(c || A, key = "OxenSSSubkey")
/// subkey_pub = (c + d) · A        (unclamped scalar multiplication)
/// ```
///
/// Both `c` and `d` are reduced mod ℓ before the addition. A key that fails
/// to decompress, or a product that lands on the identity, is treated as a
/// signature failure.
pub fn derive_subkey_pubkey(tag: &[u8; 32], pubkey: &[u8; 32]) -> Result<[u8; 32]> {
    let mut h = Blake2b32::new_keyed(SUBKEY_HASH_KEY);
    h.update(tag).update(pubkey);
    let d = h.finalize();

    let scalar = Scalar::from_bytes_mod_order(*tag) + Scalar::from_bytes_mod_order(d);

    let point = CompressedEdwardsY(*pubkey)
        .decompress()
        .ok_or(CryptoError::BadSignature)?;

    let derived = scalar * point;
    if derived.is_identity() {
        return Err(CryptoError::BadSignature);
    }
    Ok(derived.compress().to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn test_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn verify_roundtrip() {
        let sk = test_key(1);
        let sig = sk.sign(b"monitored message");
        let pk = sk.verifying_key().to_bytes();
        assert!(verify_signature(b"monitored message", &sig.to_bytes(), &pk).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let sk = test_key(2);
        let sig = sk.sign(b"right");
        let pk = sk.verifying_key().to_bytes();
        assert!(matches!(
            verify_signature(b"wrong", &sig.to_bytes(), &pk),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let sig = test_key(3).sign(b"msg");
        let other = test_key(4).verifying_key().to_bytes();
        assert!(verify_signature(b"msg", &sig.to_bytes(), &other).is_err());
    }

    #[test]
    fn ed_to_x25519_matches_scalar_mult() {
        // The converted key must equal the X25519 public key computed from
        // the same seed the long way: clamp(SHA-512(seed)[..32]) * basepoint.
        use sha2::{Digest, Sha512};

        for seed in [[9u8; 32], [42u8; 32], [200u8; 32]] {
            let ed_pk = SigningKey::from_bytes(&seed).verifying_key().to_bytes();

            let h = Sha512::digest(seed);
            let mut scalar = [0u8; 32];
            scalar.copy_from_slice(&h[..32]);
            let expected =
                x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(scalar));

            assert_eq!(ed25519_to_x25519(&ed_pk).unwrap(), expected.to_bytes());
        }
    }

    #[test]
    fn ed_to_x25519_is_deterministic() {
        let pk = test_key(5).verifying_key().to_bytes();
        assert_eq!(ed25519_to_x25519(&pk).unwrap(), ed25519_to_x25519(&pk).unwrap());
    }

    #[test]
    fn subkey_derivation_changes_key() {
        let pk = test_key(6).verifying_key().to_bytes();
        let tag = [7u8; 32];
        let derived = derive_subkey_pubkey(&tag, &pk).unwrap();
        assert_ne!(derived, pk);
        // Deterministic
        assert_eq!(derived, derive_subkey_pubkey(&tag, &pk).unwrap());
    }

    #[test]
    fn subkey_derivation_rejects_garbage_point() {
        // Not a canonical curve point
        let bad = [0xff_u8; 32];
        assert!(derive_subkey_pubkey(&[1u8; 32], &bad).is_err());
    }
}
