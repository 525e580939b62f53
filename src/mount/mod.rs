//! Tunnel mounting over the overlay: the listener and stream registries and
//! the two forwarding entry points.

pub mod registry;
pub mod stream;

mod local;
mod remote;

use std::sync::Arc;
use std::time::Duration;

use crate::error::ForwardError;
use crate::overlay::{Overlay, PeerId};

pub use registry::{Listener, ListenerInfo, ListenerKey, ListenerRegistry};
pub use stream::{Stream, StreamInfo, StreamRegistry};

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Bound on the overlay dial (local forward) and the local TCP dial
    /// (remote forward). A failed dial affects one connection, never the
    /// listener.
    pub dial_timeout: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// Tunnel mounting service for one overlay node: owns the listener and
/// stream registries and creates listeners via [`Mounts::forward_local`] and
/// [`Mounts::forward_remote`].
pub struct Mounts {
    overlay: Arc<dyn Overlay>,
    listeners: Arc<ListenerRegistry>,
    streams: Arc<StreamRegistry>,
    opts: MountOptions,
}

impl Mounts {
    pub fn new(overlay: Arc<dyn Overlay>, mut opts: MountOptions) -> Self {
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = DEFAULT_DIAL_TIMEOUT;
        }
        Self {
            overlay,
            listeners: Arc::new(ListenerRegistry::new()),
            streams: StreamRegistry::new(),
            opts,
        }
    }

    pub fn overlay(&self) -> &Arc<dyn Overlay> {
        &self.overlay
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    /// Bind `bind_addr` locally and forward every accepted connection to
    /// `peer`'s handler for `protocol`. Returns as soon as the listener is
    /// registered; accepting runs in the background.
    pub async fn forward_local(
        &self,
        peer: PeerId,
        protocol: &str,
        bind_addr: &str,
    ) -> Result<Arc<dyn Listener>, ForwardError> {
        local::LocalListener::open(
            self.overlay.clone(),
            &self.listeners,
            self.streams.clone(),
            peer,
            protocol,
            bind_addr,
            self.opts.dial_timeout,
        )
        .await
    }

    /// Register this node as the overlay handler for `protocol` and forward
    /// every incoming stream to the local `target_addr`.
    pub async fn forward_remote(
        &self,
        protocol: &str,
        target_addr: &str,
    ) -> Result<Arc<dyn Listener>, ForwardError> {
        remote::RemoteListener::open(
            self.overlay.clone(),
            &self.listeners,
            self.streams.clone(),
            protocol,
            target_addr,
            self.opts.dial_timeout,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::overlay::memory::MemoryNet;

    fn mounts_for(net: &Arc<MemoryNet>, id: &str) -> Mounts {
        Mounts::new(net.host(id), MountOptions::default())
    }

    /// TCP echo server; returns its address.
    async fn spawn_echo() -> std::net::SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = ln.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting: {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn duplicate_local_forward_rejected_until_closed() {
        let net = MemoryNet::new();
        let m = mounts_for(&net, "a");
        let peer = PeerId::new("b");

        let first = m
            .forward_local(peer.clone(), "echo", "127.0.0.1:0")
            .await
            .unwrap();
        let err = m
            .forward_local(peer.clone(), "echo", "127.0.0.1:0")
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::DuplicateListener(_)));

        first.close().await;
        assert!(m.listeners().list().is_empty());

        let again = m.forward_local(peer, "echo", "127.0.0.1:0").await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn failed_bind_unlocks_the_key() {
        let net = MemoryNet::new();
        let m = mounts_for(&net, "a");
        let peer = PeerId::new("b");

        // Occupy a port so the first forward's bind fails.
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = blocker.local_addr().unwrap().to_string();

        let err = m
            .forward_local(peer.clone(), "echo", &addr)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Bind { .. }));
        assert!(m.listeners().list().is_empty());

        // The reservation must be gone: the same key locks fine once the
        // port frees up.
        drop(blocker);
        m.forward_local(peer, "echo", &addr).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_remote_forward_rejected() {
        let net = MemoryNet::new();
        let m = mounts_for(&net, "b");

        m.forward_remote("echo", "127.0.0.1:9999").await.unwrap();
        let err = m.forward_remote("echo", "127.0.0.1:9999").await.unwrap_err();
        assert!(matches!(err, ForwardError::DuplicateListener(_)));

        // Same protocol toward a different target: different key, but the
        // overlay handler slot is taken.
        let err = m.forward_remote("echo", "127.0.0.1:9998").await.unwrap_err();
        assert!(matches!(err, ForwardError::Handler(_)));
    }

    #[tokio::test]
    async fn closed_listener_stops_accepting() {
        let net = MemoryNet::new();
        let a = mounts_for(&net, "a");
        let b = mounts_for(&net, "b");

        let echo = spawn_echo().await;
        b.forward_remote("echo", &echo.to_string()).await.unwrap();

        let listener = a
            .forward_local(PeerId::new("b"), "echo", "127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        listener.close().await;
        assert!(a.listeners().list().is_empty());

        // The socket is released; connection attempts no longer reach a
        // relay, so no stream ever appears.
        for _ in 0..3 {
            if let Ok(mut conn) = TcpStream::connect(addr).await {
                let mut buf = [0u8; 1];
                let _ = conn.write_all(b"x").await;
                let _ = conn.read(&mut buf).await;
            }
        }
        assert!(a.streams().list().is_empty());
    }

    #[tokio::test]
    async fn dial_failure_keeps_listener_accepting() {
        let net = MemoryNet::new();
        let a = mounts_for(&net, "a");
        // No handler mounted on "b": every dial fails.

        let listener = a
            .forward_local(PeerId::new("b"), "echo", "127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = conn.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "connection should be closed on dial failure");

        // The listener survived the failed dial.
        assert_eq!(a.listeners().list().len(), 1);
        assert!(TcpStream::connect(addr).await.is_ok());
    }

    #[tokio::test]
    async fn end_to_end_echo_through_two_peers() {
        let net = MemoryNet::new();
        let a = mounts_for(&net, "a");
        let b = mounts_for(&net, "b");

        let echo = spawn_echo().await;
        b.forward_remote("echo", &echo.to_string()).await.unwrap();

        let listener = a
            .forward_local(PeerId::new("b"), "echo", "127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // One listener per side, protocol "echo".
        let ls_a = a.listeners().list();
        let ls_b = b.listeners().list();
        assert_eq!(ls_a.len(), 1);
        assert_eq!(ls_b.len(), 1);
        assert_eq!(ls_a[0].protocol(), "echo");
        assert_eq!(ls_b[0].protocol(), "echo");
        assert_eq!(ls_a[0].target_address(), "peer:b");
        assert_eq!(ls_b[0].listen_address(), "peer:b");

        // Exactly one live stream on each side while the connection is open.
        assert_eq!(a.streams().list().len(), 1);
        assert_eq!(b.streams().list().len(), 1);
        let info = a.streams().list()[0].info();
        assert_eq!(info.protocol, "echo");
        assert_eq!(info.target_address, "peer:b");

        drop(conn);
        wait_for("streams to drain", || {
            a.streams().list().is_empty() && b.streams().list().is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn byte_exact_relay_with_large_payload() {
        let net = MemoryNet::new();
        let a = mounts_for(&net, "a");
        let b = mounts_for(&net, "b");

        let echo = spawn_echo().await;
        b.forward_remote("bulk", &echo.to_string()).await.unwrap();
        let listener = a
            .forward_local(PeerId::new("b"), "bulk", "127.0.0.1:0")
            .await
            .unwrap();

        let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
        let mut conn = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();

        let expected = payload.clone();
        let (mut rd, mut wr) = conn.split();
        let write = async {
            wr.write_all(&payload).await.unwrap();
            wr.shutdown().await.unwrap();
        };
        let read = async {
            let mut got = vec![0u8; expected.len()];
            rd.read_exact(&mut got).await.unwrap();
            got
        };
        let (_, got) = tokio::join!(write, read);
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn remote_forward_dial_failure_resets_overlay_stream() {
        let net = MemoryNet::new();
        let b = mounts_for(&net, "b");

        // Target port is bound then immediately released, so dialing fails.
        let dead = {
            let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ln.local_addr().unwrap()
        };
        b.forward_remote("echo", &dead.to_string()).await.unwrap();

        let dialer = net.host("a");
        let mut stream = dialer.dial(&PeerId::new("b"), "echo").await.unwrap();
        let mut buf = [0u8; 1];
        let res = stream.recv.read(&mut buf).await;
        assert!(res.is_err(), "expected reset from failed local dial");

        // The handler itself survives.
        assert_eq!(b.listeners().list().len(), 1);
    }
}
