//! QUIC/TLS 1.3 transport.
//!
//! Every exchange uses one bidirectional stream: the initiator writes a
//! single length-prefixed [`Frame`], the acceptor answers with a reply
//! frame (requests) or just closes the stream (commands). Both sides of a
//! connection serve incoming streams through the shared [`Router`], so a
//! dialed peer can push commands back over the same connection — which is
//! how storage nodes deliver message notifications.
//!
//! Nodes use self-signed TLS certificates; peer identity is not established
//! at the TLS layer (the network's own key material authenticates payloads
//! where it matters).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::frame::{Frame, Parts};
use crate::link::{Incoming, Link, LinkAddr, Responder, Router, Transport};
use crate::{Result, TransportError};

/// ALPN protocol identifier.
pub const ALPN_SPNS: &[u8] = b"spns/1";

/// Hard cap on a single frame, sized for the largest subscription batch
/// plus framing overhead.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// How long a request waits for its reply before giving up.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// A QUIC endpoint acting as both dialer and listener.
pub struct QuicTransport {
    endpoint: Endpoint,
    router: Arc<Router>,
    local_addr: SocketAddr,
}

impl QuicTransport {
    /// Bind an endpoint and start accepting connections, dispatching
    /// incoming frames through `router`.
    pub fn bind(bind_addr: SocketAddr, router: Arc<Router>) -> Result<Arc<Self>> {
        let server_config = build_server_config()?;
        let client_config = build_client_config()?;

        let mut endpoint = Endpoint::server(server_config, bind_addr)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        tracing::info!(%local_addr, "RPC endpoint listening");

        let transport = Arc::new(Self {
            endpoint,
            router,
            local_addr,
        });

        let accept = Arc::clone(&transport);
        tokio::spawn(async move {
            while let Some(incoming) = accept.endpoint.accept().await {
                let router = Arc::clone(&accept.router);
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => {
                            tracing::debug!(remote = %conn.remote_address(), "accepted connection");
                            serve_connection(conn, router).await;
                        }
                        Err(e) => tracing::debug!("inbound handshake failed: {e}"),
                    }
                });
            }
        });

        Ok(transport)
    }

    /// The bound local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the endpoint and every connection on it.
    pub fn shutdown(&self) {
        self.endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn connect(&self, addr: &LinkAddr) -> Result<Arc<dyn Link>> {
        let sockaddr: SocketAddr = tokio::net::lookup_host((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| TransportError::Connection(format!("resolve {addr}: {e}")))?
            .next()
            .ok_or_else(|| TransportError::Connection(format!("no address for {addr}")))?;

        let conn = self
            .endpoint
            .connect(sockaddr, "spns")
            .map_err(|e| TransportError::Connection(e.to_string()))?
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        tracing::debug!(remote = %conn.remote_address(), "connection established");

        // The peer may open streams toward us on this connection too.
        let serve_conn = conn.clone();
        let router = Arc::clone(&self.router);
        tokio::spawn(async move {
            serve_connection(serve_conn, router).await;
        });

        Ok(Arc::new(QuicLink { conn }))
    }
}

/// A live QUIC connection as a [`Link`].
pub struct QuicLink {
    conn: Connection,
}

#[async_trait]
impl Link for QuicLink {
    async fn request(&self, endpoint: &str, parts: Parts) -> Result<Parts> {
        let frame = Frame::Request {
            endpoint: endpoint.to_owned(),
            parts,
        };
        let exchange = async {
            let (mut send, mut recv) = self
                .conn
                .open_bi()
                .await
                .map_err(|_| TransportError::Closed)?;
            write_frame(&mut send, &frame).await?;
            send.finish().ok();
            read_frame(&mut recv).await
        };
        let reply = tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| TransportError::Timeout)??;
        match reply {
            Frame::Reply { parts } => Ok(parts),
            Frame::Error { message } => Err(TransportError::Remote(message)),
            _ => Err(TransportError::Codec("unexpected frame in reply".into())),
        }
    }

    fn send(&self, endpoint: &str, parts: Parts) {
        let conn = self.conn.clone();
        let frame = Frame::Command {
            endpoint: endpoint.to_owned(),
            parts,
        };
        tokio::spawn(async move {
            let result = async {
                let (mut send, _recv) = conn.open_bi().await.map_err(|_| TransportError::Closed)?;
                write_frame(&mut send, &frame).await?;
                send.finish().ok();
                Ok::<_, TransportError>(())
            }
            .await;
            if let Err(e) = result {
                tracing::debug!("command send failed: {e}");
            }
        });
    }

    fn close(&self) {
        self.conn.close(quinn::VarInt::from_u32(0), b"close");
    }
}

/// Accept streams on a connection and route each frame.
async fn serve_connection(conn: Connection, router: Arc<Router>) {
    let link: Arc<dyn Link> = Arc::new(QuicLink { conn: conn.clone() });
    loop {
        let (send, mut recv) = match conn.accept_bi().await {
            Ok(stream) => stream,
            Err(_) => return, // connection closed
        };
        let router = Arc::clone(&router);
        let link = Arc::clone(&link);
        tokio::spawn(async move {
            if let Err(e) = serve_stream(send, &mut recv, router, link).await {
                tracing::debug!("stream error: {e}");
            }
        });
    }
}

async fn serve_stream(
    mut send: SendStream,
    recv: &mut RecvStream,
    router: Arc<Router>,
    link: Arc<dyn Link>,
) -> Result<()> {
    match read_frame(recv).await? {
        Frame::Request { endpoint, parts } => {
            let (responder, reply_rx) = Responder::channel();
            router.dispatch(Incoming {
                endpoint,
                parts,
                link,
                responder: Some(responder),
            });
            let reply = reply_rx.await.unwrap_or(Frame::Error {
                message: "handler dropped the request".into(),
            });
            write_frame(&mut send, &reply).await?;
            send.finish().ok();
        }
        Frame::Command { endpoint, parts } => {
            router.dispatch(Incoming {
                endpoint,
                parts,
                link,
                responder: None,
            });
        }
        _ => return Err(TransportError::Codec("unexpected frame kind".into())),
    }
    Ok(())
}

/// Write a frame: `[length:4 LE][frame bytes]`.
async fn write_frame(stream: &mut SendStream, frame: &Frame) -> Result<()> {
    let data = frame.encode();
    let len = u32::try_from(data.len())
        .map_err(|_| TransportError::Codec("frame too large".into()))?;
    stream
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    stream
        .write_all(&data)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(())
}

/// Read a frame: `[length:4 LE][frame bytes]`.
async fn read_frame(stream: &mut RecvStream) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|_| TransportError::Closed)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Codec(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|_| TransportError::Closed)?;
    Frame::decode(&buf)
}

fn build_server_config() -> Result<ServerConfig> {
    let (cert_der, key_der) = generate_self_signed_cert()?;

    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("server TLS config: {e}")))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| TransportError::Tls(format!("server cert config: {e}")))?;
    tls_config.alpn_protocols = vec![ALPN_SPNS.to_vec()];

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(IDLE_TIMEOUT)
            .map_err(|e| TransportError::Tls(format!("idle timeout: {e}")))?,
    ));

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC server crypto: {e}")))?,
    ));
    server_config.transport_config(Arc::new(transport));
    Ok(server_config)
}

fn build_client_config() -> Result<ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let mut tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(format!("client TLS config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    tls_config.alpn_protocols = vec![ALPN_SPNS.to_vec()];

    Ok(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::Tls(format!("QUIC client crypto: {e}")))?,
    )))
}

fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519)
        .map_err(|e| TransportError::Tls(format!("key generation: {e}")))?;
    let params = rcgen::CertificateParams::new(vec!["spns".to_string()])
        .map_err(|e| TransportError::Tls(format!("cert params: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TransportError::Tls(format!("self-signed cert: {e}")))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((cert_der, key_der))
}

/// Accepts any server certificate; the TLS layer provides encryption only.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}
