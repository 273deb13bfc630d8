//! # spns-types
//!
//! Core value types shared across the push notification server:
//!
//! - [`bytes`] — fixed-width byte newtypes (account ids, keys, signatures)
//!   with uniform raw/hex/base64 parsing
//! - [`swarm`] — [`SwarmPubkey`](swarm::SwarmPubkey), the account identity
//!   plus its coordinate and current assignment in swarm space

pub mod bytes;
pub mod swarm;

pub use bytes::{
    AccountId, Blake2b32, EncKey, Ed25519Pk, Signature, SubaccountTag, SubkeyTag, X25519Pk,
};
pub use swarm::{SwarmPubkey, INVALID_SWARM_ID};

/// Error types for value parsing and construction.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// Input was not raw bytes, hex, or base64 of the expected width.
    #[error("invalid value: expected {expected} bytes, raw, hex or base64")]
    BadLength { expected: usize },

    /// A `session_ed25519` key was supplied for a non-Session account.
    #[error("session_ed25519 may only be used with 05-prefixed session IDs")]
    UnexpectedSessionEd,

    /// A `session_ed25519` key was missing or did not map back to the
    /// claimed account id.
    #[error("account id / session_ed25519 mismatch: key does not convert to the given account")]
    SessionEdMismatch,
}

pub type Result<T> = std::result::Result<T, TypesError>;
