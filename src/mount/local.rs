use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

use crate::error::ForwardError;
use crate::mount::registry::{Listener, ListenerKey, ListenerRegistry};
use crate::mount::stream::StreamRegistry;
use crate::net;
use crate::overlay::{Overlay, PeerId};

/// Accepts local TCP connections and forwards each one into the overlay
/// toward `peer`'s handler for `protocol`.
pub(crate) struct LocalListener {
    protocol: String,
    listen_address: String,
    bound_addr: Option<SocketAddr>,
    peer: PeerId,
    overlay: Arc<dyn Overlay>,
    streams: Arc<StreamRegistry>,
    listeners: Weak<ListenerRegistry>,
    dial_timeout: Duration,
    accept_task: StdMutex<Option<AbortHandle>>,
}

impl LocalListener {
    pub(crate) async fn open(
        overlay: Arc<dyn Overlay>,
        listeners: &Arc<ListenerRegistry>,
        streams: Arc<StreamRegistry>,
        peer: PeerId,
        protocol: &str,
        bind_addr: &str,
        dial_timeout: Duration,
    ) -> Result<Arc<dyn Listener>, ForwardError> {
        let listen_address = bind_addr.trim().to_string();
        let key = ListenerKey {
            protocol: protocol.to_string(),
            listen_address: listen_address.clone(),
            target_address: net::peer_addr(&peer),
        };

        listeners.lock(&key)?;

        let ln = match TcpListener::bind(net::normalize_bind_addr(&listen_address).as_ref()).await
        {
            Ok(ln) => ln,
            Err(err) => {
                listeners.unlock(&key);
                return Err(ForwardError::Bind {
                    addr: listen_address,
                    source: err,
                });
            }
        };

        let listener = Arc::new(Self {
            protocol: protocol.to_string(),
            listen_address,
            bound_addr: ln.local_addr().ok(),
            peer,
            overlay,
            streams,
            listeners: Arc::downgrade(listeners),
            dial_timeout,
            accept_task: StdMutex::new(None),
        });
        listeners.register(listener.clone());

        let task = tokio::spawn(listener.clone().accept_loop(ln));
        *listener.accept_task.lock().expect("accept task poisoned") = Some(task.abort_handle());

        tracing::info!(
            protocol = %listener.protocol,
            listen = %listener.listen_address,
            peer = %listener.peer,
            "mount: local forward listening"
        );
        Ok(listener)
    }

    async fn accept_loop(self: Arc<Self>, ln: TcpListener) {
        loop {
            let (conn, origin) = match ln.accept().await {
                Ok(v) => v,
                Err(err) => {
                    // Terminal for this listener; it stays registered until
                    // explicitly closed.
                    tracing::warn!(
                        protocol = %self.protocol,
                        listen = %self.listen_address,
                        err = %err,
                        "mount: accept failed; listener dead"
                    );
                    return;
                }
            };

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.handle_conn(conn, origin).await {
                    tracing::debug!(
                        protocol = %this.protocol,
                        origin = %origin,
                        err = %err,
                        "mount: local connection dropped"
                    );
                }
            });
        }
    }

    /// Dial the target peer and wire the relay up. A failed dial closes the
    /// just-accepted connection only; the listener keeps accepting.
    async fn handle_conn(&self, conn: TcpStream, origin: SocketAddr) -> anyhow::Result<()> {
        let dial = self.overlay.dial(&self.peer, &self.protocol);
        let remote = tokio::time::timeout(self.dial_timeout, dial)
            .await
            .context("mount: dial timed out")??;

        let stream = self
            .streams
            .register(&self.protocol, origin.to_string(), net::peer_addr(&self.peer));
        stream.start(conn, remote);
        Ok(())
    }
}

#[async_trait]
impl Listener for LocalListener {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn listen_address(&self) -> String {
        self.listen_address.clone()
    }

    fn target_address(&self) -> String {
        net::peer_addr(&self.peer)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    async fn close(&self) {
        let task = self
            .accept_task
            .lock()
            .expect("accept task poisoned")
            .take();
        if let Some(task) = task {
            // Dropping the accept loop releases the bound socket.
            task.abort();
        }
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.deregister(&self.key());
        }
        tracing::info!(
            protocol = %self.protocol,
            listen = %self.listen_address,
            "mount: local forward closed"
        );
    }
}
