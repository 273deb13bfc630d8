//! # spns-transport
//!
//! RPC plumbing for the push notification server:
//!
//! - [`bencode`] — canonical bencode values (the storage-network wire format)
//! - [`frame`] — the multipart request/command/reply framing
//! - [`link`] — the [`Link`](link::Link)/[`Transport`](link::Transport)
//!   connection abstraction, plus the endpoint [`Router`](link::Router)
//! - [`quic`] — the production transport: QUIC/TLS 1.3 with one
//!   length-prefixed bidirectional stream per exchange
//! - [`mem`] — an in-process transport for tests
//!
//! Peers are symmetric: either side of a connection may issue requests or
//! commands, and both sides dispatch incoming frames through a router.

pub mod bencode;
pub mod frame;
pub mod link;
pub mod mem;
pub mod quic;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Could not reach or handshake with the remote.
    #[error("connection error: {0}")]
    Connection(String),

    /// The connection died mid-exchange.
    #[error("connection closed")]
    Closed,

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The remote replied with an error frame.
    #[error("remote error: {0}")]
    Remote(String),

    /// Malformed frame or bencode data.
    #[error("codec error: {0}")]
    Codec(String),

    /// TLS/certificate setup failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
