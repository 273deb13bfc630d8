//! # spns-crypto
//!
//! Cryptographic primitives for the push notification server.
//!
//! This crate wraps the dalek-cryptography stack with the exact operations
//! the subscription admission path needs:
//!
//! - [`blake2b`] — incremental keyed/unkeyed Blake2b-256 hashing
//! - [`ed25519`] — Ed25519 signature verification, Ed25519→X25519 public key
//!   conversion, and derived-subkey computation for delegated authentication
//!
//! All functions operate on plain fixed-size byte arrays so that callers can
//! use their own newtypes without this crate having to know about them.

pub mod blake2b;
pub mod ed25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Signature verification failed, or a derived verification key could
    /// not be computed.
    #[error("signature verification failed")]
    BadSignature,

    /// A public key was structurally invalid (not a canonical curve point).
    #[error("invalid public key")]
    InvalidKey,
}

pub type Result<T> = std::result::Result<T, CryptoError>;
