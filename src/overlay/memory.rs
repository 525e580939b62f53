//! In-process overlay used by tests and demos.
//!
//! A [`MemoryNet`] routes `(peer, protocol)` dials to registered handlers;
//! streams are pipe pairs whose read half reports `ConnectionReset` instead
//! of a clean EOF when the writing side aborted, so reset semantics stay
//! observable without a real transport.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, SimplexStream, WriteHalf};
use tokio::sync::{Mutex, mpsc};

use crate::overlay::{Overlay, OverlayAcceptor, OverlaySend, OverlayStream, PeerId};

const PIPE_BUF_BYTES: usize = 64 * 1024;
const INCOMING_CHANNEL_SIZE: usize = 16;

type HandlerKey = (PeerId, String);
type Incoming = (OverlayStream, PeerId);

/// Shared hub connecting any number of in-process hosts.
pub struct MemoryNet {
    handlers: StdMutex<HashMap<HandlerKey, mpsc::Sender<Incoming>>>,
}

impl MemoryNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: StdMutex::new(HashMap::new()),
        })
    }

    /// Create an overlay handle for one host identity on this hub.
    pub fn host(self: &Arc<Self>, id: impl Into<PeerId>) -> Arc<MemoryOverlay> {
        Arc::new(MemoryOverlay {
            net: self.clone(),
            id: id.into(),
        })
    }
}

pub struct MemoryOverlay {
    net: Arc<MemoryNet>,
    id: PeerId,
}

#[async_trait]
impl Overlay for MemoryOverlay {
    fn local_peer(&self) -> PeerId {
        self.id.clone()
    }

    async fn dial(&self, peer: &PeerId, protocol: &str) -> anyhow::Result<OverlayStream> {
        let tx = {
            let handlers = self.net.handlers.lock().expect("handler map poisoned");
            handlers
                .get(&(peer.clone(), protocol.to_string()))
                .cloned()
                .ok_or_else(|| anyhow!("overlay: no handler for {protocol:?} on {peer}"))?
        };

        let (dialer, handler) = stream_pair();
        tx.send((handler, self.id.clone()))
            .await
            .map_err(|_| anyhow!("overlay: handler for {protocol:?} on {peer} closed"))?;
        Ok(dialer)
    }

    async fn bind(&self, protocol: &str) -> anyhow::Result<Box<dyn OverlayAcceptor>> {
        let key = (self.id.clone(), protocol.to_string());
        let (tx, rx) = mpsc::channel(INCOMING_CHANNEL_SIZE);

        let mut handlers = self.net.handlers.lock().expect("handler map poisoned");
        if handlers.contains_key(&key) {
            anyhow::bail!("overlay: handler already registered for {protocol:?}");
        }
        handlers.insert(key.clone(), tx);
        drop(handlers);

        Ok(Box::new(MemoryAcceptor {
            net: self.net.clone(),
            key,
            rx: Mutex::new(rx),
        }))
    }
}

struct MemoryAcceptor {
    net: Arc<MemoryNet>,
    key: HandlerKey,
    rx: Mutex<mpsc::Receiver<Incoming>>,
}

#[async_trait]
impl OverlayAcceptor for MemoryAcceptor {
    async fn accept(&self) -> anyhow::Result<Incoming> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| anyhow!("overlay: protocol handler closed"))
    }

    fn close(&self) {
        // Dropping the sender makes pending accepts return None once drained.
        let mut handlers = self.net.handlers.lock().expect("handler map poisoned");
        handlers.remove(&self.key);
    }
}

/// Build a connected pair of overlay streams. Each direction is a simplex
/// pipe plus a shared flag the writer sets on abort; once the half shuts
/// down, the reader turns the EOF into a `ConnectionReset` error when the
/// flag is raised.
pub fn stream_pair() -> (OverlayStream, OverlayStream) {
    let a_aborted = Arc::new(AtomicBool::new(false));
    let b_aborted = Arc::new(AtomicBool::new(false));
    let (a_rd, b_wr) = tokio::io::simplex(PIPE_BUF_BYTES);
    let (b_rd, a_wr) = tokio::io::simplex(PIPE_BUF_BYTES);

    let a = OverlayStream {
        recv: Box::new(MemoryRecv {
            inner: a_rd,
            peer_aborted: b_aborted.clone(),
        }),
        send: Box::new(MemorySend {
            inner: a_wr,
            aborted: a_aborted.clone(),
        }),
    };
    let b = OverlayStream {
        recv: Box::new(MemoryRecv {
            inner: b_rd,
            peer_aborted: a_aborted,
        }),
        send: Box::new(MemorySend {
            inner: b_wr,
            aborted: b_aborted,
        }),
    };
    (a, b)
}

struct MemoryRecv {
    inner: ReadHalf<SimplexStream>,
    peer_aborted: Arc<AtomicBool>,
}

impl AsyncRead for MemoryRecv {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let eof = buf.filled().len() == before;
                if eof && this.peer_aborted.load(Ordering::Acquire) {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "overlay: stream reset by peer",
                    )));
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

struct MemorySend {
    inner: WriteHalf<SimplexStream>,
    aborted: Arc<AtomicBool>,
}

impl AsyncWrite for MemorySend {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl OverlaySend for MemorySend {
    fn abort(&mut self) {
        // The caller's follow-up shutdown closes the pipe; the flag
        // upgrades that EOF to a reset.
        self.aborted.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_without_handler_fails() {
        let net = MemoryNet::new();
        let a = net.host("a");
        let err = a.dial(&PeerId::new("b"), "echo").await.unwrap_err();
        assert!(err.to_string().contains("no handler"));
    }

    #[tokio::test]
    async fn duplicate_bind_rejected() {
        let net = MemoryNet::new();
        let b = net.host("b");
        let acceptor = b.bind("echo").await.unwrap();
        assert!(b.bind("echo").await.is_err());
        acceptor.close();
        let again = b.bind("echo").await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn round_trip_and_origin_identity() {
        let net = MemoryNet::new();
        let a = net.host("a");
        let b = net.host("b");
        let acceptor = b.bind("echo").await.unwrap();

        let mut dialed = a.dial(&PeerId::new("b"), "echo").await.unwrap();
        dialed.send.write_all(b"ping").await.unwrap();
        dialed.send.shutdown().await.unwrap();

        let (mut incoming, origin) = acceptor.accept().await.unwrap();
        assert_eq!(origin, PeerId::new("a"));
        let mut buf = Vec::new();
        incoming.recv.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");
    }

    #[tokio::test]
    async fn abort_is_seen_as_reset_not_eof() {
        let (mut a, mut b) = stream_pair();
        a.send.write_all(b"x").await.unwrap();
        a.send.abort();
        a.send.shutdown().await.unwrap();

        let mut byte = [0u8; 1];
        b.recv.read_exact(&mut byte).await.unwrap();
        let err = b.recv.read(&mut byte).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn overlay_streams_are_debuggable() {
        let (a, _b) = stream_pair();
        assert_eq!(format!("{a:?}"), "OverlayStream { .. }");
    }

    #[tokio::test]
    async fn clean_shutdown_is_eof() {
        let (mut a, mut b) = stream_pair();
        a.send.write_all(b"x").await.unwrap();
        a.send.shutdown().await.unwrap();
        drop(a.send);

        let mut buf = Vec::new();
        b.recv.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"x");
    }
}
