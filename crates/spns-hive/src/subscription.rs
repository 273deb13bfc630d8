//! Per-account signed monitor specs.

use spns_types::{Signature, SwarmPubkey};

use crate::signature::{verify_storage_signature, Auth};
use crate::{unix_timestamp, HiveError, Result, SIGNATURE_EXPIRY, SIGNATURE_FUTURE_GRACE};

/// One device's request to monitor a set of namespaces on an account.
///
/// Two subscriptions are "the same" when their `(auth, namespaces,
/// want_data)` triples match; renewal then only refreshes the signature.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub auth: Auth,
    /// Monitored namespaces, ascending and unique.
    pub namespaces: Vec<i16>,
    /// Whether the subscriber wants the (encrypted) message body included.
    pub want_data: bool,
    /// Unix seconds at which the signature was produced.
    pub sig_ts: i64,
    pub sig: Signature,
}

impl Subscription {
    /// Validate and build a subscription, verifying the MONITOR signature.
    pub fn new(
        pubkey: &SwarmPubkey,
        auth: Auth,
        namespaces: Vec<i16>,
        want_data: bool,
        sig_ts: i64,
        sig: Signature,
    ) -> Result<Self> {
        Self::build(pubkey, auth, namespaces, want_data, sig_ts, sig, true)
    }

    /// Build from trusted storage: structural checks only, no signature
    /// verification and no timestamp window (expiry is enforced by the
    /// periodic cleanup instead).
    pub fn load(
        auth: Auth,
        namespaces: Vec<i16>,
        want_data: bool,
        sig_ts: i64,
        sig: Signature,
    ) -> Result<Self> {
        check_namespaces(&namespaces)?;
        Ok(Self {
            auth,
            namespaces,
            want_data,
            sig_ts,
            sig,
        })
    }

    fn build(
        pubkey: &SwarmPubkey,
        auth: Auth,
        namespaces: Vec<i16>,
        want_data: bool,
        sig_ts: i64,
        sig: Signature,
        verify: bool,
    ) -> Result<Self> {
        check_namespaces(&namespaces)?;

        if sig_ts == 0 {
            return Err(HiveError::BadInput(
                "signature timestamp is missing".into(),
            ));
        }
        let now = unix_timestamp();
        if sig_ts <= now - SIGNATURE_EXPIRY.as_secs() as i64 {
            return Err(HiveError::BadInput("sig_ts timestamp is too old".into()));
        }
        if sig_ts >= now + SIGNATURE_FUTURE_GRACE.as_secs() as i64 {
            return Err(HiveError::BadInput(
                "sig_ts timestamp is too far in the future".into(),
            ));
        }

        if verify {
            let msg = monitor_message(pubkey, sig_ts, want_data, &namespaces);
            verify_storage_signature(msg.as_bytes(), &sig, pubkey, &auth)?;
        }

        Ok(Self {
            auth,
            namespaces,
            want_data,
            sig_ts,
            sig,
        })
    }

    /// Whether `self` and `other` are the same subscription as far as the
    /// upstream swarm monitor is concerned. Callers must already know both
    /// refer to the same account.
    pub fn is_same(&self, other: &Self) -> bool {
        self.is_same_parts(&other.auth, &other.namespaces, other.want_data)
    }

    /// [`is_same`](Self::is_same) against constituent parts.
    pub fn is_same_parts(&self, auth: &Auth, namespaces: &[i16], want_data: bool) -> bool {
        self.auth == *auth && self.namespaces == namespaces && self.want_data == want_data
    }

    /// Whether `self` subscribes to at least everything `other` needs:
    /// same credential, a superset of namespaces, and data delivery if
    /// `other` wants it. Only meaningful for subscriptions on one account.
    pub fn covers(&self, other: &Self) -> bool {
        if self.auth != other.auth {
            return false;
        }
        if other.want_data && !self.want_data {
            return false;
        }

        // Both sides are sorted: walk them together, skipping extras in
        // self. Failure means other has something self lacks.
        let mut i = 0;
        for &needed in &other.namespaces {
            loop {
                match self.namespaces.get(i) {
                    None => return false,
                    Some(&have) if have > needed => return false,
                    Some(&have) if have == needed => {
                        i += 1;
                        break;
                    }
                    Some(_) => i += 1,
                }
            }
        }
        true
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.sig_ts < now - SIGNATURE_EXPIRY.as_secs() as i64
    }

    pub fn is_newer(&self, other: &Self) -> bool {
        self.sig_ts > other.sig_ts
    }
}

/// The canonical MONITOR signing string:
/// `"MONITOR" || hex(account) || sig_ts || ('1'|'0') || ns0,ns1,...`
pub fn monitor_message(
    pubkey: &SwarmPubkey,
    sig_ts: i64,
    want_data: bool,
    namespaces: &[i16],
) -> String {
    let mut msg = String::with_capacity(7 + 66 + 12 + 1 + 7 * namespaces.len());
    msg.push_str("MONITOR");
    msg.push_str(&pubkey.id.hex());
    msg.push_str(&sig_ts.to_string());
    msg.push(if want_data { '1' } else { '0' });
    for (i, ns) in namespaces.iter().enumerate() {
        if i > 0 {
            msg.push(',');
        }
        msg.push_str(&ns.to_string());
    }
    msg
}

/// The canonical UNSUBSCRIBE signing string:
/// `"UNSUBSCRIBE" || hex(account) || sig_ts`
pub fn unsubscribe_message(pubkey: &SwarmPubkey, sig_ts: i64) -> String {
    format!("UNSUBSCRIBE{}{}", pubkey.id.hex(), sig_ts)
}

fn check_namespaces(namespaces: &[i16]) -> Result<()> {
    if namespaces.is_empty() {
        return Err(HiveError::BadInput("namespaces missing or empty".into()));
    }
    for pair in namespaces.windows(2) {
        if pair[0] > pair[1] {
            return Err(HiveError::BadInput(
                "namespaces are not sorted numerically".into(),
            ));
        }
        if pair[0] == pair[1] {
            return Err(HiveError::BadInput("namespaces contains duplicates".into()));
        }
    }
    Ok(())
}
