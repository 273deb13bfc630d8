//! Connection and dispatch abstractions.
//!
//! A [`Link`] is one live connection to a peer: requests await a reply,
//! commands are fire-and-forget. A [`Transport`] manufactures outgoing
//! links. Incoming frames — on listened *and* dialed connections — are
//! dispatched through a [`Router`] of endpoint handlers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::frame::{Frame, Parts};
use crate::{Result, TransportError};

/// Address of a remote peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LinkAddr {
    pub host: String,
    pub port: u16,
}

impl LinkAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for LinkAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TransportError::Connection(format!("invalid address {s:?}")))?;
        let port = port
            .parse()
            .map_err(|_| TransportError::Connection(format!("invalid port in {s:?}")))?;
        Ok(Self::new(host, port))
    }
}

/// One live connection to a peer.
#[async_trait]
pub trait Link: Send + Sync {
    /// Invoke `endpoint` on the peer and await its reply.
    async fn request(&self, endpoint: &str, parts: Parts) -> Result<Parts>;

    /// Invoke `endpoint` on the peer without waiting for completion.
    /// Delivery failures are logged by the implementation, not surfaced.
    fn send(&self, endpoint: &str, parts: Parts);

    /// Tear the connection down.
    fn close(&self);
}

/// Connection factory for outgoing links.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, addr: &LinkAddr) -> Result<Arc<dyn Link>>;
}

/// Reply handle for an incoming request. Consumed by the first use; a
/// dropped responder reports an error to the requester.
pub struct Responder {
    tx: oneshot::Sender<Frame>,
}

impl Responder {
    /// Create a responder and the receiving end the serving loop awaits.
    pub fn channel() -> (Self, oneshot::Receiver<Frame>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Send a successful multipart reply.
    pub fn reply(self, parts: Parts) {
        let _ = self.tx.send(Frame::Reply { parts });
    }

    /// Send a single-part JSON reply.
    pub fn reply_json(self, value: &serde_json::Value) {
        self.reply(vec![value.to_string().into_bytes()]);
    }

    /// Send an error reply.
    pub fn error(self, message: impl Into<String>) {
        let _ = self.tx.send(Frame::Error {
            message: message.into(),
        });
    }
}

/// An incoming request or command, as handed to an endpoint handler.
pub struct Incoming {
    /// The endpoint that was invoked.
    pub endpoint: String,
    /// Message parts.
    pub parts: Parts,
    /// Handle back to the peer that sent this (for registering services,
    /// issuing requests in the other direction, ...).
    pub link: Arc<dyn Link>,
    /// Present iff the peer expects a reply.
    pub responder: Option<Responder>,
}

type Handler = Arc<dyn Fn(Incoming) -> BoxFuture<'static, ()> + Send + Sync>;

struct Registration {
    handler: Handler,
    /// Maximum queued+running invocations; beyond it messages are dropped.
    limit: Option<Arc<tokio::sync::Semaphore>>,
}

/// Endpoint registry shared by every connection of a process.
#[derive(Default)]
pub struct Router {
    handlers: RwLock<HashMap<String, Registration>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler for `endpoint`.
    pub fn register<F>(&self, endpoint: &str, handler: F)
    where
        F: Fn(Incoming) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.insert(endpoint, Arc::new(handler), None);
    }

    /// Register a handler with a bound on concurrently outstanding
    /// invocations; excess messages are dropped (commands) or refused
    /// (requests).
    pub fn register_bounded<F>(&self, endpoint: &str, queue: usize, handler: F)
    where
        F: Fn(Incoming) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.insert(
            endpoint,
            Arc::new(handler),
            Some(Arc::new(tokio::sync::Semaphore::new(queue))),
        );
    }

    fn insert(&self, endpoint: &str, handler: Handler, limit: Option<Arc<tokio::sync::Semaphore>>) {
        self.handlers
            .write()
            .expect("router lock")
            .insert(endpoint.to_owned(), Registration { handler, limit });
    }

    /// Dispatch an incoming message to its handler, spawning the handler
    /// future. Unknown endpoints and overflowing queues are answered with an
    /// error (requests) or dropped (commands).
    pub fn dispatch(&self, mut incoming: Incoming) {
        let handlers = self.handlers.read().expect("router lock");
        let Some(reg) = handlers.get(&incoming.endpoint) else {
            tracing::debug!(endpoint = %incoming.endpoint, "no handler for endpoint");
            if let Some(responder) = incoming.responder.take() {
                responder.error(format!("unknown endpoint {:?}", incoming.endpoint));
            }
            return;
        };

        let permit = match &reg.limit {
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::debug!(
                        endpoint = %incoming.endpoint,
                        "endpoint queue full, dropping message"
                    );
                    if let Some(responder) = incoming.responder.take() {
                        responder.error("endpoint queue full");
                    }
                    return;
                }
            },
            None => None,
        };

        let fut = (reg.handler)(incoming);
        tokio::spawn(async move {
            fut.await;
            drop(permit);
        });
    }
}
