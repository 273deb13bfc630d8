//! Account identity in swarm space.
//!
//! Each account maps to a fixed `swarm_space` coordinate (an XOR fold of the
//! account id) and, given the network's current sorted swarm-id list, to the
//! nearest swarm by circular distance. The assignment is recomputed on every
//! swarm-list change; everything else about the identity is immutable.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bytes::{AccountId, Ed25519Pk};
use crate::{Result, TypesError};

/// Sentinel for "not assigned to any swarm".
pub const INVALID_SWARM_ID: u64 = u64::MAX;

/// An account identity plus its swarm-space coordinate and current swarm.
///
/// Equality and hashing consider only the account id, so a `SwarmPubkey` can
/// key maps and sets while its swarm assignment is updated in place through
/// shared references.
pub struct SwarmPubkey {
    /// The 33-byte account id.
    pub id: AccountId,
    /// The Ed25519 key signatures verify against. For `0x05` accounts this
    /// is the supplied master key; otherwise it is `id[1..33]`.
    pub ed25519: Ed25519Pk,
    /// True when `ed25519` is a separate master key rather than the account
    /// id bytes (i.e. a Session X25519 account).
    pub session_ed: bool,
    /// XOR fold of the four big-endian u64 words of `id[1..33]`.
    pub swarm_space: u64,
    swarm: AtomicU64,
}

impl SwarmPubkey {
    /// Build an identity, verifying that a supplied `session_ed25519`
    /// converts to the claimed `0x05` account id.
    pub fn new(id: AccountId, session_ed25519: Option<Ed25519Pk>) -> Result<Self> {
        Self::build(id, session_ed25519, true)
    }

    /// Build an identity from trusted storage, skipping the key conversion
    /// check. The prefix rule for `session_ed25519` still applies.
    pub fn new_unchecked(id: AccountId, session_ed25519: Option<Ed25519Pk>) -> Result<Self> {
        Self::build(id, session_ed25519, false)
    }

    fn build(id: AccountId, session_ed25519: Option<Ed25519Pk>, validate: bool) -> Result<Self> {
        let (ed25519, session_ed) = match session_ed25519 {
            Some(ed) => {
                if id.prefix() != 0x05 {
                    return Err(TypesError::UnexpectedSessionEd);
                }
                if validate {
                    let derived = spns_crypto::ed25519::ed25519_to_x25519(ed.as_bytes())
                        .map_err(|_| TypesError::SessionEdMismatch)?;
                    if derived[..] != id.0[1..] {
                        return Err(TypesError::SessionEdMismatch);
                    }
                }
                (ed, true)
            }
            None => {
                let mut ed = [0u8; 32];
                ed.copy_from_slice(&id.0[1..]);
                (Ed25519Pk(ed), false)
            }
        };

        Ok(Self {
            swarm_space: swarm_space(&id),
            id,
            ed25519,
            session_ed,
            swarm: AtomicU64::new(INVALID_SWARM_ID),
        })
    }

    /// The currently assigned swarm id ([`INVALID_SWARM_ID`] if none).
    pub fn swarm(&self) -> u64 {
        self.swarm.load(Ordering::Relaxed)
    }

    /// Recompute the nearest swarm from a sorted id list. Returns whether
    /// the assignment changed.
    ///
    /// The nearest swarm minimizes unsigned circular distance from
    /// `swarm_space`; ties go to the greater-or-equal side.
    pub fn update_swarm(&self, sorted_ids: &[u64]) -> bool {
        let closest = match sorted_ids {
            [] => INVALID_SWARM_ID,
            [only] => *only,
            _ => {
                // First id >= swarm_space, wrapping to the front if none.
                let right = sorted_ids.partition_point(|&id| id < self.swarm_space);
                let (left, right) = if right == sorted_ids.len() {
                    (sorted_ids.len() - 1, 0)
                } else if right == 0 {
                    (sorted_ids.len() - 1, 0)
                } else {
                    (right - 1, right)
                };

                // swarm_space lies between left and right mod 2^64, so plain
                // wrapping subtraction yields both circular distances.
                let d_right = sorted_ids[right].wrapping_sub(self.swarm_space);
                let d_left = self.swarm_space.wrapping_sub(sorted_ids[left]);

                if d_right <= d_left {
                    sorted_ids[right]
                } else {
                    sorted_ids[left]
                }
            }
        };

        self.swarm.swap(closest, Ordering::Relaxed) != closest
    }
}

/// XOR of the four big-endian u64 words starting at byte 1 of the id.
fn swarm_space(id: &AccountId) -> u64 {
    let mut res = 0u64;
    for chunk in id.0[1..33].chunks_exact(8) {
        let word: [u8; 8] = chunk.try_into().unwrap_or([0; 8]);
        res ^= u64::from_be_bytes(word);
    }
    res
}

impl Clone for SwarmPubkey {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            ed25519: self.ed25519,
            session_ed: self.session_ed,
            swarm_space: self.swarm_space,
            swarm: AtomicU64::new(self.swarm()),
        }
    }
}

impl PartialEq for SwarmPubkey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SwarmPubkey {}

impl Hash for SwarmPubkey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for SwarmPubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmPubkey")
            .field("id", &self.id)
            .field("swarm", &self.swarm())
            .finish()
    }
}
