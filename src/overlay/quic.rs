//! QUIC-backed overlay adapter.
//!
//! One quinn endpoint per node; peer connections are cached and reused, and
//! each bi-directional stream starts with a small magic/version/JSON header
//! carrying the protocol tag and the dialer's identity. Incoming streams are
//! routed to the acceptor bound for the tag, or reset when no handler is
//! registered.
//!
//! The TLS profile is self-signed with verification disabled: channel
//! security and authenticated peer identities belong to the real overlay
//! transport, not this adapter, so the dialer's identity here is whatever
//! the header claims.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use pin_project_lite::pin_project;
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig, TransportConfig, VarInt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

use crate::net;
use crate::overlay::{Overlay, OverlayAcceptor, OverlaySend, OverlayStream, PeerId};

const ALPN: &[u8] = b"weir/1";
const MAGIC: &[u8; 4] = b"WEIR";
const VERSION: u8 = 1;
const MAX_HEADER_BYTES: u32 = 16 * 1024;
const RESET_CODE: u32 = 1;
const INCOMING_CHANNEL_SIZE: usize = 16;

type Incoming = (OverlayStream, PeerId);
type HandlerMap = Arc<StdMutex<HashMap<String, mpsc::Sender<Incoming>>>>;

#[derive(Debug, Serialize, Deserialize)]
struct StreamHeader {
    protocol: String,
    peer: String,
}

pub struct QuicOverlay {
    id: PeerId,
    endpoint: Endpoint,
    peers: StdMutex<HashMap<PeerId, SocketAddr>>,
    conns: Mutex<HashMap<PeerId, Connection>>,
    handlers: HandlerMap,
    driver: tokio::task::AbortHandle,
}

impl QuicOverlay {
    /// Bind a QUIC endpoint at `addr` and start accepting peer connections.
    pub async fn bind_endpoint(id: impl Into<PeerId>, addr: &str) -> anyhow::Result<Arc<Self>> {
        let bind: SocketAddr = net::normalize_bind_addr(addr)
            .parse()
            .with_context(|| format!("overlay: bad endpoint address {addr:?}"))?;

        let mut transport_cfg = TransportConfig::default();
        transport_cfg.max_idle_timeout(Some(Duration::from_secs(60).try_into()?));
        transport_cfg.keep_alive_interval(Some(Duration::from_secs(20)));
        let transport_cfg = Arc::new(transport_cfg);

        let server_crypto = quic_tls::server_config()?;
        let mut server_cfg = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));
        server_cfg.transport_config(transport_cfg.clone());

        let mut endpoint = Endpoint::server(server_cfg, bind)?;

        let client_crypto = quic_tls::client_config()?;
        let mut client_cfg = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
        ));
        client_cfg.transport_config(transport_cfg);
        endpoint.set_default_client_config(client_cfg);

        let handlers: HandlerMap = Arc::new(StdMutex::new(HashMap::new()));
        let driver = tokio::spawn(accept_connections(endpoint.clone(), handlers.clone()));

        Ok(Arc::new(Self {
            id: id.into(),
            endpoint,
            peers: StdMutex::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            handlers,
            driver: driver.abort_handle(),
        }))
    }

    /// Add or replace the resolved address for a peer identity.
    pub fn add_peer(&self, peer: impl Into<PeerId>, addr: SocketAddr) {
        let mut peers = self.peers.lock().expect("peer map poisoned");
        peers.insert(peer.into(), addr);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    /// Shut the endpoint down; live streams end with an error.
    pub fn close(&self) {
        self.driver.abort();
        self.endpoint.close(0u32.into(), b"");
    }

    async fn connection(&self, peer: &PeerId) -> anyhow::Result<Connection> {
        let addr = {
            let peers = self.peers.lock().expect("peer map poisoned");
            peers
                .get(peer)
                .copied()
                .ok_or_else(|| anyhow!("overlay: unknown peer {peer}"))?
        };

        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.get(peer) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            conns.remove(peer);
        }

        let conn = self
            .endpoint
            .connect(addr, "weir")?
            .await
            .with_context(|| format!("overlay: connect {peer} at {addr}"))?;
        conns.insert(peer.clone(), conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl Overlay for QuicOverlay {
    fn local_peer(&self) -> PeerId {
        self.id.clone()
    }

    async fn dial(&self, peer: &PeerId, protocol: &str) -> anyhow::Result<OverlayStream> {
        let conn = self.connection(peer).await?;
        let (mut send, recv) = conn.open_bi().await.context("overlay: open stream")?;
        write_header(
            &mut send,
            &StreamHeader {
                protocol: protocol.to_string(),
                peer: self.id.to_string(),
            },
        )
        .await?;
        Ok(OverlayStream {
            recv: Box::new(QuicRecvHalf { recv }),
            send: Box::new(QuicSendHalf { send }),
        })
    }

    async fn bind(&self, protocol: &str) -> anyhow::Result<Box<dyn OverlayAcceptor>> {
        let (tx, rx) = mpsc::channel(INCOMING_CHANNEL_SIZE);

        let mut handlers = self.handlers.lock().expect("handler map poisoned");
        if handlers.contains_key(protocol) {
            anyhow::bail!("overlay: handler already registered for {protocol:?}");
        }
        handlers.insert(protocol.to_string(), tx);
        drop(handlers);

        Ok(Box::new(QuicAcceptor {
            handlers: self.handlers.clone(),
            protocol: protocol.to_string(),
            rx: Mutex::new(rx),
        }))
    }
}

struct QuicAcceptor {
    handlers: HandlerMap,
    protocol: String,
    rx: Mutex<mpsc::Receiver<Incoming>>,
}

#[async_trait]
impl OverlayAcceptor for QuicAcceptor {
    async fn accept(&self) -> anyhow::Result<Incoming> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| anyhow!("overlay: protocol handler closed"))
    }

    fn close(&self) {
        let mut handlers = self.handlers.lock().expect("handler map poisoned");
        handlers.remove(&self.protocol);
    }
}

async fn accept_connections(endpoint: Endpoint, handlers: HandlerMap) {
    while let Some(incoming) = endpoint.accept().await {
        let handlers = handlers.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(conn) => serve_connection(conn, handlers).await,
                Err(err) => tracing::debug!(err = %err, "overlay: inbound connection failed"),
            }
        });
    }
}

async fn serve_connection(conn: Connection, handlers: HandlerMap) {
    let remote = conn.remote_address();
    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    route_stream(send, recv, handlers).await;
                });
            }
            Err(err) => {
                tracing::debug!(remote = %remote, err = %err, "overlay: connection closed");
                return;
            }
        }
    }
}

async fn route_stream(mut send: quinn::SendStream, mut recv: quinn::RecvStream, handlers: HandlerMap) {
    let header = match read_header(&mut recv).await {
        Ok(h) => h,
        Err(err) => {
            tracing::debug!(err = %err, "overlay: bad stream header");
            let _ = send.reset(VarInt::from_u32(RESET_CODE));
            return;
        }
    };

    let tx = {
        let handlers = handlers.lock().expect("handler map poisoned");
        handlers.get(&header.protocol).cloned()
    };
    let Some(tx) = tx else {
        tracing::debug!(protocol = %header.protocol, "overlay: no handler for incoming stream");
        let _ = send.reset(VarInt::from_u32(RESET_CODE));
        return;
    };

    let stream = OverlayStream {
        recv: Box::new(QuicRecvHalf { recv }),
        send: Box::new(QuicSendHalf { send }),
    };
    let _ = tx.send((stream, PeerId::new(header.peer))).await;
}

async fn write_header(w: &mut quinn::SendStream, h: &StreamHeader) -> anyhow::Result<()> {
    let body = serde_json::to_vec(h)?;
    let n: u32 = body.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_HEADER_BYTES {
        anyhow::bail!("overlay: stream header too large: {n}");
    }
    w.write_all(MAGIC).await?;
    w.write_all(&[VERSION]).await?;
    w.write_all(&n.to_be_bytes()).await?;
    w.write_all(&body).await?;
    Ok(())
}

async fn read_header(r: &mut quinn::RecvStream) -> anyhow::Result<StreamHeader> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if &magic != MAGIC {
        anyhow::bail!("overlay: bad stream magic");
    }
    let mut ver = [0u8; 1];
    r.read_exact(&mut ver).await?;
    if ver[0] != VERSION {
        anyhow::bail!("overlay: unsupported stream version {}", ver[0]);
    }
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await?;
    let n = u32::from_be_bytes(len);
    if n > MAX_HEADER_BYTES {
        anyhow::bail!("overlay: stream header too large: {n}");
    }
    let mut body = vec![0u8; n as usize];
    r.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

pin_project! {
    struct QuicRecvHalf {
        #[pin]
        recv: quinn::RecvStream,
    }
}

impl tokio::io::AsyncRead for QuicRecvHalf {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        self.project().recv.poll_read(cx, buf)
    }
}

pin_project! {
    struct QuicSendHalf {
        #[pin]
        send: quinn::SendStream,
    }
}

impl tokio::io::AsyncWrite for QuicSendHalf {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        use std::task::Poll;
        match self.project().send.poll_write(cx, data) {
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(n)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::task::Poll;
        match self.project().send.poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::task::Poll;
        match self.project().send.poll_shutdown(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl OverlaySend for QuicSendHalf {
    fn abort(&mut self) {
        let _ = self.send.reset(VarInt::from_u32(RESET_CODE));
    }
}

mod quic_tls {
    use std::sync::Arc;

    use rcgen::generate_simple_self_signed;
    use rustls::client::danger::{ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};

    use super::ALPN;

    fn provider() -> Arc<rustls::crypto::CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub fn server_config() -> anyhow::Result<rustls::ServerConfig> {
        let rcgen::CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(["weir".to_string()])?;
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));

        let mut cfg = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)?;
        cfg.alpn_protocols = vec![ALPN.to_vec()];
        Ok(cfg)
    }

    pub fn client_config() -> anyhow::Result<rustls::ClientConfig> {
        let provider = provider();
        let mut cfg = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth();
        cfg.alpn_protocols = vec![ALPN.to_vec()];
        Ok(cfg)
    }

    /// Certificate verifier that treats any certificate as valid.
    ///
    /// NOTE: vulnerable to MITM; peer authentication is out of scope for
    /// this adapter.
    #[derive(Debug)]
    struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_routes_to_bound_handler() {
        let a = QuicOverlay::bind_endpoint("node-a", "127.0.0.1:0").await.unwrap();
        let b = QuicOverlay::bind_endpoint("node-b", "127.0.0.1:0").await.unwrap();
        a.add_peer("node-b", b.local_addr().unwrap());

        let acceptor = b.bind("echo").await.unwrap();

        let mut dialed = a.dial(&PeerId::new("node-b"), "echo").await.unwrap();
        dialed.send.write_all(b"over quic").await.unwrap();
        dialed.send.shutdown().await.unwrap();

        let (mut incoming, origin) = acceptor.accept().await.unwrap();
        assert_eq!(origin, PeerId::new("node-a"));
        let mut buf = Vec::new();
        incoming.recv.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"over quic");

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn dial_unknown_peer_fails() {
        let a = QuicOverlay::bind_endpoint("node-a", "127.0.0.1:0").await.unwrap();
        let err = a.dial(&PeerId::new("nobody"), "echo").await.unwrap_err();
        assert!(err.to_string().contains("unknown peer"));
        a.close();
    }
}
