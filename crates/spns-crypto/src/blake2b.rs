//! Incremental Blake2b-256 hashing, keyed and unkeyed.
//!
//! Notification fingerprints and derived-subkey hashes are Blake2b digests
//! over a mix of byte strings and decimal-rendered integers. The keyed form
//! is RFC 7693 keyed Blake2b (what libsodium calls keyed `generichash`), not
//! HMAC.

use blake2::digest::consts::U32;
use blake2::digest::{FixedOutput, KeyInit, Update};
use blake2::{Blake2b, Blake2bMac, Digest};

/// Incremental Blake2b hasher with a 32-byte output.
///
/// Accepts any interleaving of raw bytes ([`update`](Self::update)) and
/// integers rendered as decimal ASCII ([`update_int`](Self::update_int)).
pub struct Blake2b32 {
    inner: Inner,
}

enum Inner {
    Plain(Blake2b<U32>),
    Keyed(Blake2bMac<U32>),
}

impl Blake2b32 {
    /// Start an unkeyed hash.
    pub fn new() -> Self {
        Self {
            inner: Inner::Plain(Blake2b::<U32>::new()),
        }
    }

    /// Start a keyed hash. The key may be up to 64 bytes.
    pub fn new_keyed(key: &[u8]) -> Self {
        let mac = Blake2bMac::<U32>::new_from_slice(key).expect("blake2b key must be <= 64 bytes");
        Self {
            inner: Inner::Keyed(mac),
        }
    }

    /// Absorb raw bytes.
    pub fn update(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        match &mut self.inner {
            Inner::Plain(h) => Digest::update(h, data.as_ref()),
            Inner::Keyed(h) => Update::update(h, data.as_ref()),
        }
        self
    }

    /// Absorb an integer as its decimal ASCII rendering.
    pub fn update_int(&mut self, val: i64) -> &mut Self {
        let mut buf = [0u8; 20];
        self.update(render_int(val, &mut buf))
    }

    /// Produce the 32-byte digest.
    pub fn finalize(self) -> [u8; 32] {
        match self.inner {
            Inner::Plain(h) => h.finalize_fixed().into(),
            Inner::Keyed(h) => h.finalize_fixed().into(),
        }
    }
}

impl Default for Blake2b32 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot unkeyed Blake2b-256 over a sequence of byte strings.
pub fn blake2b32(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Blake2b32::new();
    for p in parts {
        h.update(p);
    }
    h.finalize()
}

/// One-shot keyed Blake2b-256 over a sequence of byte strings.
pub fn blake2b32_keyed(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Blake2b32::new_keyed(key);
    for p in parts {
        h.update(p);
    }
    h.finalize()
}

fn render_int(val: i64, buf: &mut [u8; 20]) -> &[u8] {
    let mut n = val.unsigned_abs();
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    if val < 0 {
        pos -= 1;
        buf[pos] = b'-';
    }
    &buf[pos..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_int_decimal() {
        let mut buf = [0u8; 20];
        assert_eq!(render_int(0, &mut buf), b"0");
        let mut buf = [0u8; 20];
        assert_eq!(render_int(1234567, &mut buf), b"1234567");
        let mut buf = [0u8; 20];
        assert_eq!(render_int(-32768, &mut buf), b"-32768");
        let mut buf = [0u8; 20];
        assert_eq!(render_int(i64::MIN, &mut buf), b"-9223372036854775808");
    }

    #[test]
    fn unkeyed_known_vector() {
        // Blake2b-256 of the empty string.
        let h = Blake2b32::new().finalize();
        assert_eq!(
            hex::encode(h),
            "0e5751c026e543b2e8ab2eb06099daa1d1e5df47778f7787faab45cdf12fe3a8"
        );
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut h = Blake2b32::new();
        h.update(b"hello ").update(b"world");
        assert_eq!(h.finalize(), blake2b32(&[b"hello world"]));
    }

    #[test]
    fn int_rendering_matches_ascii() {
        let mut a = Blake2b32::new();
        a.update_int(-400).update(b",").update_int(17);
        let mut b = Blake2b32::new();
        b.update(b"-400,17");
        assert_eq!(a.finalize(), b.finalize());
    }

    #[test]
    fn keyed_differs_from_unkeyed() {
        let plain = blake2b32(&[b"data"]);
        let keyed = blake2b32_keyed(b"key", &[b"data"]);
        assert_ne!(plain, keyed);
    }

    #[test]
    fn keyed_is_deterministic() {
        let a = blake2b32_keyed(b"OxenSSSubkey", &[b"abc", b"def"]);
        let b = blake2b32_keyed(b"OxenSSSubkey", &[b"abcdef"]);
        assert_eq!(a, b);
    }
}
