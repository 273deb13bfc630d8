//! Storage signature verification.
//!
//! Subscribers authenticate one of three ways:
//!
//! - directly, with the account's own Ed25519 key;
//! - with a **subaccount**: a 36-byte tag (network prefix, permission
//!   flags, two reserved bytes, delegated pubkey) that the account owner
//!   has signed, delegating monitor access to the key inside the tag;
//! - with a **legacy subkey tag**: 32 bytes combined with the account key
//!   by scalar arithmetic to produce a derived verification key.

use spns_crypto::ed25519::{derive_subkey_pubkey, verify_signature};
use spns_types::{Signature, SubaccountTag, SubkeyTag, SwarmPubkey};

use crate::{HiveError, Result};

/// A delegated subaccount credential: the signed tag plus the account
/// owner's signature over it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subaccount {
    pub tag: SubaccountTag,
    pub sig: Signature,
}

/// How a subscription authenticates to the account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Auth {
    /// The account's own Ed25519 key signed the request.
    #[default]
    Account,
    /// Legacy 32-byte derived-subkey authentication.
    Subkey(SubkeyTag),
    /// Subaccount tag authentication.
    Subaccount(Subaccount),
}

impl Auth {
    pub fn subkey_tag(&self) -> Option<&SubkeyTag> {
        match self {
            Auth::Subkey(tag) => Some(tag),
            _ => None,
        }
    }

    pub fn subaccount(&self) -> Option<&Subaccount> {
        match self {
            Auth::Subaccount(sub) => Some(sub),
            _ => None,
        }
    }
}

/// Verify `sig` over `msg` for `pubkey` under the given credential.
///
/// For a subaccount the checks are, in order: the read permission bit must
/// be set; the tag's network prefix must match the account's unless the
/// any-prefix bit is set; the account must have signed the tag; and the
/// message signature must verify against the delegated key embedded in the
/// tag. Every failure is reported as a signature failure.
pub fn verify_storage_signature(
    msg: &[u8],
    sig: &Signature,
    pubkey: &SwarmPubkey,
    auth: &Auth,
) -> Result<()> {
    match auth {
        Auth::Account => verify_signature(msg, &sig.0, pubkey.ed25519.as_bytes())?,
        Auth::Subkey(tag) => {
            let derived = derive_subkey_pubkey(tag.as_bytes(), pubkey.ed25519.as_bytes())?;
            verify_signature(msg, &sig.0, &derived)?;
        }
        Auth::Subaccount(sub) => {
            if sub.tag.flags() & SubaccountTag::FLAG_READ == 0 {
                return Err(HiveError::SignatureVerification);
            }
            if sub.tag.flags() & SubaccountTag::FLAG_ANY_PREFIX == 0
                && sub.tag.prefix() != pubkey.id.prefix()
            {
                return Err(HiveError::SignatureVerification);
            }
            verify_signature(sub.tag.as_bytes(), &sub.sig.0, pubkey.ed25519.as_bytes())?;
            verify_signature(msg, &sig.0, sub.tag.delegated_pubkey().as_bytes())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use spns_types::AccountId;

    fn account_for(sk: &SigningKey, prefix: u8) -> SwarmPubkey {
        let mut id = [0u8; 33];
        id[0] = prefix;
        id[1..].copy_from_slice(&sk.verifying_key().to_bytes());
        SwarmPubkey::new(AccountId(id), None).unwrap()
    }

    fn subaccount_for(
        owner: &SigningKey,
        delegate: &SigningKey,
        prefix: u8,
        flags: u8,
    ) -> Subaccount {
        let mut tag = [0u8; 36];
        tag[0] = prefix;
        tag[1] = flags;
        tag[4..].copy_from_slice(&delegate.verifying_key().to_bytes());
        let sig = owner.sign(&tag);
        Subaccount {
            tag: SubaccountTag(tag),
            sig: Signature(sig.to_bytes()),
        }
    }

    #[test]
    fn account_auth_verifies() {
        let sk = SigningKey::from_bytes(&[1; 32]);
        let pubkey = account_for(&sk, 0x03);
        let sig = Signature(sk.sign(b"MONITOR...").to_bytes());
        assert!(verify_storage_signature(b"MONITOR...", &sig, &pubkey, &Auth::Account).is_ok());
        assert!(verify_storage_signature(b"tampered", &sig, &pubkey, &Auth::Account).is_err());
    }

    #[test]
    fn subaccount_auth_verifies_with_delegated_key() {
        let owner = SigningKey::from_bytes(&[2; 32]);
        let delegate = SigningKey::from_bytes(&[3; 32]);
        let pubkey = account_for(&owner, 0x03);
        let sub = subaccount_for(&owner, &delegate, 0x03, SubaccountTag::FLAG_READ);

        let sig = Signature(delegate.sign(b"msg").to_bytes());
        let auth = Auth::Subaccount(sub);
        assert!(verify_storage_signature(b"msg", &sig, &pubkey, &auth).is_ok());

        // The owner's signature no longer authenticates the message itself.
        let owner_sig = Signature(owner.sign(b"msg").to_bytes());
        assert!(verify_storage_signature(b"msg", &owner_sig, &pubkey, &auth).is_err());
    }

    #[test]
    fn subaccount_requires_read_bit() {
        let owner = SigningKey::from_bytes(&[4; 32]);
        let delegate = SigningKey::from_bytes(&[5; 32]);
        let pubkey = account_for(&owner, 0x03);
        let sub = subaccount_for(&owner, &delegate, 0x03, 0);
        let sig = Signature(delegate.sign(b"msg").to_bytes());
        assert!(
            verify_storage_signature(b"msg", &sig, &pubkey, &Auth::Subaccount(sub)).is_err()
        );
    }

    #[test]
    fn subaccount_prefix_rules() {
        let owner = SigningKey::from_bytes(&[6; 32]);
        let delegate = SigningKey::from_bytes(&[7; 32]);
        let pubkey = account_for(&owner, 0x03);
        let sig = Signature(delegate.sign(b"msg").to_bytes());

        // Wrong prefix without the any-prefix bit: rejected.
        let sub = subaccount_for(&owner, &delegate, 0x05, SubaccountTag::FLAG_READ);
        assert!(
            verify_storage_signature(b"msg", &sig, &pubkey, &Auth::Subaccount(sub)).is_err()
        );

        // Same tag with the any-prefix bit: accepted.
        let sub = subaccount_for(
            &owner,
            &delegate,
            0x05,
            SubaccountTag::FLAG_READ | SubaccountTag::FLAG_ANY_PREFIX,
        );
        assert!(verify_storage_signature(b"msg", &sig, &pubkey, &Auth::Subaccount(sub)).is_ok());
    }

    #[test]
    fn subaccount_tag_must_be_signed_by_owner() {
        let owner = SigningKey::from_bytes(&[8; 32]);
        let delegate = SigningKey::from_bytes(&[9; 32]);
        let impostor = SigningKey::from_bytes(&[10; 32]);
        let pubkey = account_for(&owner, 0x03);

        // The tag is signed by someone other than the account owner.
        let sub = subaccount_for(&impostor, &delegate, 0x03, SubaccountTag::FLAG_READ);
        let sig = Signature(delegate.sign(b"msg").to_bytes());
        assert!(
            verify_storage_signature(b"msg", &sig, &pubkey, &Auth::Subaccount(sub)).is_err()
        );
    }

    #[test]
    fn subkey_auth_uses_derived_key() {
        // We can't easily produce a valid derived-key signature without the
        // private scalar arithmetic, but the path must at least reject a
        // signature from the plain account key.
        let sk = SigningKey::from_bytes(&[11; 32]);
        let pubkey = account_for(&sk, 0x03);
        let sig = Signature(sk.sign(b"msg").to_bytes());
        let auth = Auth::Subkey(SubkeyTag([12; 32]));
        assert!(verify_storage_signature(b"msg", &sig, &pubkey, &auth).is_err());
    }
}
