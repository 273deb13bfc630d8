//! # spns-hive
//!
//! The stateful engine at the center of the push notification server. It
//! keeps multiplexed RPC connections open to every active storage node,
//! holds each account's subscriptions in sync with the node's swarm,
//! ingests and de-duplicates incoming message notifications, and forwards
//! them to the per-service notifier processes.
//!
//! - [`subscription`] — a signed per-account monitor request
//! - [`signature`] — the storage signature admission path (account,
//!   subaccount, and legacy subkey authentication)
//! - [`snode`] — per-storage-node connection state machine and
//!   resubscribe queue
//! - [`hivemind`] — the engine: RPC handlers, network diffing, dispatch
//! - [`stats`] — write-only counters and the periodic status snapshot

pub mod hivemind;
pub mod signature;
pub mod snode;
pub mod stats;
pub mod subscription;

use std::time::Duration;

use spns_transport::link::LinkAddr;

pub use hivemind::{HiveMind, RpcEndpoint};
pub use signature::{Auth, Subaccount};
pub use subscription::Subscription;

/// How long a subscription signature stays valid. Storage servers expire
/// monitors after this long, so there is no point keeping them.
pub const SIGNATURE_EXPIRY: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Tolerated clock skew on unsubscribe signatures.
pub const UNSUBSCRIBE_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

/// How far ahead of the clock a subscription signature may be.
pub const SIGNATURE_FUTURE_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

pub const MSG_HASH_MIN_SIZE: usize = 32;
pub const MSG_HASH_MAX_SIZE: usize = 99;
pub const SERVICE_NAME_MAX_SIZE: usize = 32;
pub const SERVICE_ID_MIN_SIZE: usize = 32;
pub const SERVICE_ID_MAX_SIZE: usize = 999;
pub const SERVICE_DATA_MAX_SIZE: usize = 99_999;
/// Storage server limit on message payloads.
pub const MSG_DATA_MAX_SIZE: usize = 76_800;

/// Rough cap on the encoded size of one `monitor.messages` batch. Not a
/// hard limit: we stop adding accounts as soon as the body exceeds it, so
/// the last record can push past.
pub const SUBS_REQUEST_LIMIT: usize = 5_000_000;

/// Bounds of the uniform re-subscription delay; the jitter spreads renewal
/// requests out instead of thundering every 50 minutes.
pub const RESUBSCRIBE_MIN: Duration = Duration::from_secs(45 * 60);
pub const RESUBSCRIBE_MAX: Duration = Duration::from_secs(55 * 60);

/// Reconnection backoff ladder; the last entry repeats.
pub const CONNECT_COOLDOWN: [Duration; 4] = [
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
];

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct HiveConfig {
    /// RPC address of the local block-producing node.
    pub local_node: LinkAddr,
    /// How long notification fingerprints are remembered (per generation).
    pub filter_lifetime: Duration,
    /// How long startup waits for notifier services to register.
    pub notifier_wait: Duration,
    /// If non-empty, the notifier wait ends early once all these services
    /// have registered.
    pub notifiers_expected: Vec<String>,
    /// Cadence of the slow full subscription recheck.
    pub subs_interval: Duration,
    /// Maximum simultaneous connection attempts.
    pub max_pending_connects: i64,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            local_node: LinkAddr::new("127.0.0.1", 22025),
            filter_lifetime: Duration::from_secs(10 * 60),
            notifier_wait: Duration::from_secs(10),
            notifiers_expected: Vec::new(),
            subs_interval: Duration::from_secs(30),
            max_pending_connects: 500,
        }
    }
}

/// Errors raised by the engine. The numeric codes are the wire contract
/// with subscribing clients.
#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    /// Unparseable input, missing fields, or failed validation (code 1).
    #[error("{0}")]
    BadInput(String),

    /// The requested notifier service has no live connection (code 2).
    #[error("{0} notification service not currently available")]
    ServiceNotAvailable(String),

    /// The notifier did not answer in time (code 3).
    #[error("{0} notification service timed out")]
    ServiceTimeout(String),

    /// Refusals and other recoverable processing errors (code 4).
    #[error("{0}")]
    Error(String),

    /// The notifier refused the registration; its code and message pass
    /// through to the client verbatim.
    #[error("{message}")]
    Refusal { code: i64, message: String },

    /// Signature verification failed (code 4).
    #[error("signature verification failed")]
    SignatureVerification,

    /// Unexpected internal failure (code 5).
    #[error("internal error: {0}")]
    Internal(String),

    /// Sentinel: the engine is still starting up and the request was
    /// captured for later. Never surfaced to clients.
    #[error("startup in progress")]
    StartupDeferred,
}

impl HiveError {
    /// The numeric code sent to clients.
    pub fn code(&self) -> i64 {
        match self {
            HiveError::BadInput(_) => 1,
            HiveError::ServiceNotAvailable(_) => 2,
            HiveError::ServiceTimeout(_) => 3,
            HiveError::Error(_) | HiveError::SignatureVerification => 4,
            HiveError::Refusal { code, .. } => *code,
            HiveError::Internal(_) | HiveError::StartupDeferred => 5,
        }
    }

    /// The JSON error reply for this failure.
    pub fn to_reply(&self) -> serde_json::Value {
        let message = match self {
            // Don't leak internals to clients.
            HiveError::Internal(_) | HiveError::StartupDeferred => {
                "An internal error occurred while processing your request".to_owned()
            }
            other => other.to_string(),
        };
        serde_json::json!({ "error": self.code(), "message": message })
    }
}

impl From<spns_crypto::CryptoError> for HiveError {
    fn from(_: spns_crypto::CryptoError) -> Self {
        HiveError::SignatureVerification
    }
}

impl From<spns_db::DbError> for HiveError {
    fn from(e: spns_db::DbError) -> Self {
        HiveError::Internal(e.to_string())
    }
}

impl From<spns_types::TypesError> for HiveError {
    fn from(e: spns_types::TypesError) -> Self {
        HiveError::BadInput(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;

/// Wall-clock unix seconds.
pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_the_wire_contract() {
        assert_eq!(HiveError::BadInput("x".into()).code(), 1);
        assert_eq!(HiveError::ServiceNotAvailable("apns".into()).code(), 2);
        assert_eq!(HiveError::ServiceTimeout("apns".into()).code(), 3);
        assert_eq!(HiveError::Error("refused".into()).code(), 4);
        assert_eq!(HiveError::SignatureVerification.code(), 4);
        assert_eq!(HiveError::Internal("boom".into()).code(), 5);
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let reply = HiveError::Internal("secret path /x".into()).to_reply();
        assert!(!reply["message"].as_str().unwrap().contains("secret"));
        assert_eq!(reply["error"], 5);
    }
}
