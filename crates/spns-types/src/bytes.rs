//! Fixed-width byte newtypes.
//!
//! Every key, id, and signature on the wire has a fixed width; giving each
//! its own type keeps them from being swapped at call sites. All of them
//! parse uniformly from raw bytes, hex, or unpadded/padded base64, and
//! display as lowercase hex.

use std::fmt;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;

use crate::TypesError;

macro_rules! byte_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Width of this value in bytes.
            pub const SIZE: usize = $len;

            /// Borrow the raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Lowercase hex rendering.
            pub fn hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from raw bytes, hex, or base64 (padded or not).
            pub fn parse(input: &[u8]) -> Result<Self, TypesError> {
                parse_fixed(input).map(Self)
            }

            /// Parse from a string field (hex or base64).
            pub fn parse_str(input: &str) -> Result<Self, TypesError> {
                Self::parse(input.as_bytes())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = TypesError;

            fn try_from(bytes: &[u8]) -> Result<Self, TypesError> {
                let arr: [u8; $len] = bytes
                    .try_into()
                    .map_err(|_| TypesError::BadLength { expected: $len })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.hex())
            }
        }
    };
}

byte_newtype!(
    /// A 33-byte account id; byte 0 is the network prefix tag
    /// (`0x05` = Session id, `0x03` = closed group).
    AccountId,
    33
);
byte_newtype!(
    /// An Ed25519 public key.
    Ed25519Pk,
    32
);
byte_newtype!(
    /// An X25519 public key (service node identity).
    X25519Pk,
    32
);
byte_newtype!(
    /// A legacy 32-byte delegated-authentication subkey tag.
    SubkeyTag,
    32
);
byte_newtype!(
    /// A 36-byte subaccount tag: network prefix, permission bits, two
    /// reserved bytes, then the delegated Ed25519 public key.
    SubaccountTag,
    36
);
byte_newtype!(
    /// A detached Ed25519 signature.
    Signature,
    64
);
byte_newtype!(
    /// A subscriber's 32-byte notification payload encryption key.
    EncKey,
    32
);
byte_newtype!(
    /// A 32-byte Blake2b digest (notification dedup fingerprint).
    Blake2b32,
    32
);

impl AccountId {
    /// The network prefix tag (byte 0).
    pub fn prefix(&self) -> u8 {
        self.0[0]
    }
}

impl SubaccountTag {
    /// Read permission (bit 0 of the flag byte). Required for monitoring.
    pub const FLAG_READ: u8 = 0x01;
    /// Any-prefix permission (bit 3): the tag prefix byte need not match
    /// the account's network prefix.
    pub const FLAG_ANY_PREFIX: u8 = 0x08;

    /// The network prefix byte of the tag.
    pub fn prefix(&self) -> u8 {
        self.0[0]
    }

    /// The permission flag byte.
    pub fn flags(&self) -> u8 {
        self.0[1]
    }

    /// The delegated Ed25519 public key embedded in the tag.
    pub fn delegated_pubkey(&self) -> Ed25519Pk {
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&self.0[4..36]);
        Ed25519Pk(pk)
    }
}

/// Decode a blob of known width from raw bytes, hex, or base64 (padded or
/// not).
pub fn decode_sized(input: &[u8], expected: usize) -> Result<Vec<u8>, TypesError> {
    if input.len() == expected {
        return Ok(input.to_vec());
    }

    if input.len() == 2 * expected && input.iter().all(u8::is_ascii_hexdigit) {
        return hex::decode(input).map_err(|_| TypesError::BadLength { expected });
    }

    // Unpadded base64 length, tolerating trailing '=' padding.
    let mut b64 = input;
    while let [rest @ .., b'='] = b64 {
        b64 = rest;
    }
    if b64.len() == (expected * 4 + 2) / 3 {
        if let Ok(decoded) = STANDARD_NO_PAD.decode(b64) {
            if decoded.len() == expected {
                return Ok(decoded);
            }
        }
    }

    Err(TypesError::BadLength { expected })
}

fn parse_fixed<const N: usize>(input: &[u8]) -> Result<[u8; N], TypesError> {
    let decoded = decode_sized(input, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(&decoded);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_raw() {
        let raw = [7u8; 32];
        assert_eq!(Ed25519Pk::parse(&raw).unwrap().0, raw);
    }

    #[test]
    fn parse_hex() {
        let raw = [0xabu8; 33];
        let parsed = AccountId::parse_str(&hex::encode(raw)).unwrap();
        assert_eq!(parsed.0, raw);
        // Uppercase hex also accepted
        let parsed = AccountId::parse_str(&hex::encode_upper(raw)).unwrap();
        assert_eq!(parsed.0, raw);
    }

    #[test]
    fn parse_base64() {
        let raw = [0x5au8; 32];
        let padded = base64::engine::general_purpose::STANDARD.encode(raw);
        let unpadded = STANDARD_NO_PAD.encode(raw);
        assert_eq!(EncKey::parse_str(&padded).unwrap().0, raw);
        assert_eq!(EncKey::parse_str(&unpadded).unwrap().0, raw);
    }

    #[test]
    fn parse_rejects_wrong_width() {
        assert!(Signature::parse(&[0u8; 63]).is_err());
        assert!(Signature::parse_str("deadbeef").is_err());
        assert!(matches!(
            Ed25519Pk::parse(&[0u8; 31]),
            Err(TypesError::BadLength { expected: 32 })
        ));
    }

    #[test]
    fn subaccount_tag_fields() {
        let mut raw = [0u8; 36];
        raw[0] = 0x03;
        raw[1] = SubaccountTag::FLAG_READ | SubaccountTag::FLAG_ANY_PREFIX;
        raw[4..].copy_from_slice(&[9u8; 32]);
        let tag = SubaccountTag(raw);
        assert_eq!(tag.prefix(), 0x03);
        assert_eq!(tag.flags() & SubaccountTag::FLAG_READ, SubaccountTag::FLAG_READ);
        assert_eq!(tag.delegated_pubkey().0, [9u8; 32]);
    }

    #[test]
    fn display_is_hex() {
        let id = AccountId([0x05; 33]);
        assert!(id.to_string().starts_with("0505"));
        assert_eq!(id.to_string().len(), 66);
    }
}
