//! Multipart message framing.
//!
//! Every exchange on a stream is one frame each way. A frame is a bencode
//! list whose first element is a kind tag:
//!
//! ```text
//! l 7:request 16:monitor.messages <part> ... e     (expects a reply)
//! l 7:command 13:notifier.push    <part> ... e     (fire and forget)
//! l 5:reply   <part> ... e
//! l 5:error   <message> e
//! ```
//!
//! Parts are opaque byte strings; their interpretation belongs to the
//! endpoint handler.

use crate::bencode::Value;
use crate::{Result, TransportError};

/// Message parts, as carried on the wire.
pub type Parts = Vec<Vec<u8>>;

/// A single framed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Invocation that expects a reply on the same stream.
    Request { endpoint: String, parts: Parts },
    /// One-way invocation.
    Command { endpoint: String, parts: Parts },
    /// Successful reply to a request.
    Reply { parts: Parts },
    /// Error reply to a request.
    Error { message: String },
}

impl Frame {
    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let items = match self {
            Frame::Request { endpoint, parts } => tagged("request", Some(endpoint), parts),
            Frame::Command { endpoint, parts } => tagged("command", Some(endpoint), parts),
            Frame::Reply { parts } => tagged("reply", None, parts),
            Frame::Error { message } => vec![
                Value::from("error"),
                Value::from(message.as_bytes().to_vec()),
            ],
        };
        Value::List(items).encode()
    }

    /// Parse from wire bytes.
    pub fn decode(input: &[u8]) -> Result<Frame> {
        let value = Value::decode(input)?;
        let items = value
            .as_list()
            .ok_or_else(|| TransportError::Codec("frame is not a list".into()))?;
        let kind = items
            .first()
            .and_then(Value::as_bytes)
            .ok_or_else(|| TransportError::Codec("frame missing kind tag".into()))?;

        match kind {
            b"request" | b"command" => {
                let endpoint = items
                    .get(1)
                    .and_then(Value::as_bytes)
                    .and_then(|b| std::str::from_utf8(b).ok())
                    .ok_or_else(|| TransportError::Codec("frame missing endpoint".into()))?
                    .to_owned();
                let parts = collect_parts(&items[2..])?;
                if kind == b"request" {
                    Ok(Frame::Request { endpoint, parts })
                } else {
                    Ok(Frame::Command { endpoint, parts })
                }
            }
            b"reply" => Ok(Frame::Reply {
                parts: collect_parts(&items[1..])?,
            }),
            b"error" => {
                let message = items
                    .get(1)
                    .and_then(Value::as_bytes)
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Ok(Frame::Error { message })
            }
            other => Err(TransportError::Codec(format!(
                "unknown frame kind {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

fn tagged(kind: &str, endpoint: Option<&str>, parts: &Parts) -> Vec<Value> {
    let mut items = Vec::with_capacity(2 + parts.len());
    items.push(Value::from(kind));
    if let Some(ep) = endpoint {
        items.push(Value::from(ep));
    }
    items.extend(parts.iter().map(|p| Value::from(p.clone())));
    items
}

fn collect_parts(items: &[Value]) -> Result<Parts> {
    items
        .iter()
        .map(|v| {
            v.as_bytes()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| TransportError::Codec("frame part is not a byte string".into()))
        })
        .collect()
}
