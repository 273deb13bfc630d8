//! In-process transport for tests.
//!
//! A [`MemNetwork`] is a registry of listening routers keyed by address.
//! Connecting through a [`MemTransport`] produces a pair of cross-wired
//! [`MemLink`]s, so both sides can issue requests and commands exactly as
//! over QUIC, without sockets. Addresses can be marked refused to exercise
//! connection-failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::frame::{Frame, Parts};
use crate::link::{Incoming, Link, LinkAddr, Responder, Router, Transport};
use crate::{Result, TransportError};

/// Registry of in-process listeners.
#[derive(Default)]
pub struct MemNetwork {
    peers: Mutex<HashMap<LinkAddr, Arc<Router>>>,
    refuse: Mutex<HashSet<LinkAddr>>,
    connects: Mutex<Vec<LinkAddr>>,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener at `addr`.
    pub fn listen(&self, addr: LinkAddr, router: Arc<Router>) {
        self.peers.lock().expect("mem lock").insert(addr, router);
    }

    /// Make connection attempts to `addr` fail (or succeed again).
    pub fn set_refuse(&self, addr: LinkAddr, refuse: bool) {
        let mut set = self.refuse.lock().expect("mem lock");
        if refuse {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }

    /// Every address a transport on this network has dialed, in order.
    pub fn connect_attempts(&self) -> Vec<LinkAddr> {
        self.connects.lock().expect("mem lock").clone()
    }

    /// A transport for one process on this network, serving incoming
    /// traffic through `router`.
    pub fn transport(self: &Arc<Self>, router: Arc<Router>) -> Arc<MemTransport> {
        Arc::new(MemTransport {
            network: Arc::clone(self),
            router,
        })
    }
}

/// One process's connector on a [`MemNetwork`].
pub struct MemTransport {
    network: Arc<MemNetwork>,
    router: Arc<Router>,
}

#[async_trait]
impl Transport for MemTransport {
    async fn connect(&self, addr: &LinkAddr) -> Result<Arc<dyn Link>> {
        self.network
            .connects
            .lock()
            .expect("mem lock")
            .push(addr.clone());

        if self.network.refuse.lock().expect("mem lock").contains(addr) {
            return Err(TransportError::Connection(format!("{addr} refused")));
        }
        let peer = self
            .network
            .peers
            .lock()
            .expect("mem lock")
            .get(addr)
            .cloned()
            .ok_or_else(|| TransportError::Connection(format!("{addr} unreachable")))?;

        let (ours, _theirs) = mem_pair(Arc::clone(&self.router), peer);
        Ok(ours)
    }
}

/// Build a cross-wired pair of links. The first element talks to
/// `right_router`, the second to `left_router`.
pub fn mem_pair(
    left_router: Arc<Router>,
    right_router: Arc<Router>,
) -> (Arc<MemLink>, Arc<MemLink>) {
    let open = Arc::new(AtomicBool::new(true));
    let left = Arc::new(MemLink {
        peer: right_router,
        back: Mutex::new(None),
        open: Arc::clone(&open),
    });
    let right = Arc::new(MemLink {
        peer: left_router,
        back: Mutex::new(Some(Arc::clone(&left))),
        open,
    });
    *left.back.lock().expect("mem lock") = Some(Arc::clone(&right));
    (left, right)
}

/// One direction of an in-process connection.
pub struct MemLink {
    peer: Arc<Router>,
    back: Mutex<Option<Arc<MemLink>>>,
    open: Arc<AtomicBool>,
}

impl MemLink {
    fn back_link(&self) -> Arc<dyn Link> {
        let back = self.back.lock().expect("mem lock");
        match &*back {
            Some(link) => Arc::clone(link) as Arc<dyn Link>,
            None => Arc::new(ClosedLink),
        }
    }
}

#[async_trait]
impl Link for MemLink {
    async fn request(&self, endpoint: &str, parts: Parts) -> Result<Parts> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let (responder, rx) = Responder::channel();
        self.peer.dispatch(Incoming {
            endpoint: endpoint.to_owned(),
            parts,
            link: self.back_link(),
            responder: Some(responder),
        });
        match rx.await {
            Ok(Frame::Reply { parts }) => Ok(parts),
            Ok(Frame::Error { message }) => Err(TransportError::Remote(message)),
            Ok(_) => Err(TransportError::Codec("unexpected reply frame".into())),
            Err(_) => Err(TransportError::Closed),
        }
    }

    fn send(&self, endpoint: &str, parts: Parts) {
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        self.peer.dispatch(Incoming {
            endpoint: endpoint.to_owned(),
            parts,
            link: self.back_link(),
            responder: None,
        });
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

struct ClosedLink;

#[async_trait]
impl Link for ClosedLink {
    async fn request(&self, _: &str, _: Parts) -> Result<Parts> {
        Err(TransportError::Closed)
    }
    fn send(&self, _: &str, _: Parts) {}
    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_and_request() {
        let network = MemNetwork::new();
        let server = Router::new();
        server.register("ping.ping", |incoming| {
            Box::pin(async move {
                if let Some(responder) = incoming.responder {
                    responder.reply(vec![b"pong".to_vec()]);
                }
            })
        });
        network.listen(LinkAddr::new("10.0.0.1", 1000), server);

        let transport = network.transport(Router::new());
        let link = transport
            .connect(&LinkAddr::new("10.0.0.1", 1000))
            .await
            .unwrap();
        assert_eq!(
            link.request("ping.ping", vec![]).await.unwrap(),
            vec![b"pong".to_vec()]
        );
        assert_eq!(network.connect_attempts().len(), 1);
    }

    #[tokio::test]
    async fn refused_addresses_fail() {
        let network = MemNetwork::new();
        let addr = LinkAddr::new("10.0.0.2", 1000);
        network.listen(addr.clone(), Router::new());
        network.set_refuse(addr.clone(), true);

        let transport = network.transport(Router::new());
        assert!(transport.connect(&addr).await.is_err());

        network.set_refuse(addr.clone(), false);
        assert!(transport.connect(&addr).await.is_ok());
    }

    #[tokio::test]
    async fn closed_links_refuse_traffic() {
        let network = MemNetwork::new();
        network.listen(LinkAddr::new("10.0.0.3", 1000), Router::new());
        let transport = network.transport(Router::new());
        let link = transport
            .connect(&LinkAddr::new("10.0.0.3", 1000))
            .await
            .unwrap();
        link.close();
        assert!(matches!(
            link.request("any.thing", vec![]).await,
            Err(TransportError::Closed)
        ));
    }
}
