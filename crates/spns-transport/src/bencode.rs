//! Canonical bencode values.
//!
//! The storage network and the notifier protocol both speak bencode with
//! raw byte-string keys in strict ascending order. Dicts are backed by a
//! `BTreeMap`, so encoding is canonical by construction, and the decoder
//! rejects out-of-order or duplicate keys, which makes
//! decode-then-re-encode the identity on any accepted input.

use std::collections::BTreeMap;

use crate::{Result, TransportError};

/// Maximum nesting depth the decoder will follow.
const MAX_DEPTH: usize = 32;

/// A bencode value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Encode into a byte buffer.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                for (key, val) in map {
                    Value::Bytes(key.clone()).encode_into(out);
                    val.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Decode a value, requiring the whole input to be consumed.
    pub fn decode(input: &[u8]) -> Result<Value> {
        let mut r = Reader { buf: input, pos: 0 };
        let value = r.value(0)?;
        if r.pos != input.len() {
            return Err(TransportError::Codec("trailing bytes after value".into()));
        }
        Ok(value)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Bytes(v.as_bytes().to_vec())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn peek(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| TransportError::Codec("truncated bencode".into()))
    }

    fn take(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(TransportError::Codec("bencode nested too deeply".into()));
        }
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                Ok(Value::Int(self.integer(b'e')?))
            }
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut map = BTreeMap::new();
                let mut last_key: Option<Vec<u8>> = None;
                while self.peek()? != b'e' {
                    let key = self.byte_string()?;
                    if let Some(prev) = &last_key {
                        if *prev >= key {
                            return Err(TransportError::Codec(
                                "dict keys out of order or duplicated".into(),
                            ));
                        }
                    }
                    let val = self.value(depth + 1)?;
                    last_key = Some(key.clone());
                    map.insert(key, val);
                }
                self.pos += 1;
                Ok(Value::Dict(map))
            }
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            other => Err(TransportError::Codec(format!(
                "unexpected bencode byte {other:#04x}"
            ))),
        }
    }

    fn byte_string(&mut self) -> Result<Vec<u8>> {
        let len = self.integer(b':')?;
        let len = usize::try_from(len)
            .map_err(|_| TransportError::Codec("negative string length".into()))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| TransportError::Codec("string length out of range".into()))?;
        let bytes = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn integer(&mut self, term: u8) -> Result<i64> {
        let start = self.pos;
        let negative = self.peek()? == b'-';
        if negative {
            self.pos += 1;
        }
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        if self.take()? != term {
            return Err(TransportError::Codec("malformed integer".into()));
        }
        let digits = &self.buf[start..self.pos - 1];
        if digits.is_empty() || (negative && digits.len() == 1) {
            return Err(TransportError::Codec("empty integer".into()));
        }
        // Reject leading zeros ("i03e") and negative zero, which would break
        // canonical round-tripping.
        let abs = if negative { &digits[1..] } else { digits };
        if abs.len() > 1 && abs[0] == b'0' {
            return Err(TransportError::Codec("non-canonical integer".into()));
        }
        if negative && abs == b"0" {
            return Err(TransportError::Codec("negative zero".into()));
        }
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TransportError::Codec("integer out of range".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: Vec<(&[u8], Value)>) -> Value {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.to_vec(), v)).collect())
    }

    #[test]
    fn encodes_scalars() {
        assert_eq!(Value::Int(42).encode(), b"i42e");
        assert_eq!(Value::Int(-400).encode(), b"i-400e");
        assert_eq!(Value::from("spam").encode(), b"4:spam");
        assert_eq!(Value::from(&b""[..]).encode(), b"0:");
    }

    #[test]
    fn encodes_dict_in_key_order() {
        let v = dict(vec![
            (b"n", Value::List(vec![Value::Int(0), Value::Int(17)])),
            (b"!", Value::from("x")),
            (b"@", Value::from("acct")),
        ]);
        assert_eq!(v.encode(), b"d1:!1:x1:@4:acct1:nli0ei17eee");
    }

    #[test]
    fn decode_roundtrip_is_identity() {
        let v = dict(vec![
            (b"", Value::from("apns")),
            (b"#", Value::from("hashhashhash")),
            (b"n", Value::Int(-32768)),
            (b"~", Value::Bytes(vec![0, 1, 2, 255])),
        ]);
        let encoded = v.encode();
        let decoded = Value::decode(&encoded).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn rejects_out_of_order_keys() {
        assert!(Value::decode(b"d1:b1:x1:a1:ye").is_err());
        assert!(Value::decode(b"d1:a1:x1:a1:ye").is_err());
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(Value::decode(b"i1ei2e").is_err());
    }

    #[test]
    fn rejects_truncation() {
        assert!(Value::decode(b"5:spam").is_err());
        assert!(Value::decode(b"li1e").is_err());
        assert!(Value::decode(b"i42").is_err());
    }

    #[test]
    fn rejects_non_canonical_integers() {
        assert!(Value::decode(b"i03e").is_err());
        assert!(Value::decode(b"i-0e").is_err());
        assert_eq!(Value::decode(b"i0e").unwrap(), Value::Int(0));
    }

    #[test]
    fn nested_structures() {
        let input = b"ld1:ai1eeli2ei3eee";
        let v = Value::decode(input).unwrap();
        assert_eq!(v.encode(), input);
    }
}
