use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;

use crate::error::ForwardError;
use crate::mount::registry::{Listener, ListenerKey, ListenerRegistry};
use crate::mount::stream::StreamRegistry;
use crate::net;
use crate::overlay::{Overlay, OverlayAcceptor, OverlayStream, PeerId};

/// Handles incoming overlay streams for `protocol` and forwards each one to
/// a local TCP target.
pub(crate) struct RemoteListener {
    protocol: String,
    listen_address: String,
    target_address: String,
    streams: Arc<StreamRegistry>,
    listeners: Weak<ListenerRegistry>,
    acceptor: Arc<dyn OverlayAcceptor>,
    dial_timeout: Duration,
    accept_task: StdMutex<Option<AbortHandle>>,
}

impl RemoteListener {
    pub(crate) async fn open(
        overlay: Arc<dyn Overlay>,
        listeners: &Arc<ListenerRegistry>,
        streams: Arc<StreamRegistry>,
        protocol: &str,
        target_addr: &str,
        dial_timeout: Duration,
    ) -> Result<Arc<dyn Listener>, ForwardError> {
        let key = ListenerKey {
            protocol: protocol.to_string(),
            listen_address: net::peer_addr(&overlay.local_peer()),
            target_address: target_addr.trim().to_string(),
        };

        listeners.lock(&key)?;

        let acceptor = match overlay.bind(protocol).await {
            Ok(a) => a,
            Err(err) => {
                listeners.unlock(&key);
                return Err(ForwardError::Handler(err));
            }
        };

        let listener = Arc::new(Self {
            protocol: key.protocol.clone(),
            listen_address: key.listen_address.clone(),
            target_address: key.target_address.clone(),
            streams,
            listeners: Arc::downgrade(listeners),
            acceptor: Arc::from(acceptor),
            dial_timeout,
            accept_task: StdMutex::new(None),
        });
        listeners.register(listener.clone());

        let task = tokio::spawn(listener.clone().accept_loop());
        *listener.accept_task.lock().expect("accept task poisoned") = Some(task.abort_handle());

        tracing::info!(
            protocol = %listener.protocol,
            target = %listener.target_address,
            "mount: remote forward listening"
        );
        Ok(listener)
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            let (remote, origin) = match self.acceptor.accept().await {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(
                        protocol = %self.protocol,
                        err = %err,
                        "mount: handler accept failed; listener dead"
                    );
                    return;
                }
            };

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.handle_stream(remote, &origin).await {
                    tracing::debug!(
                        protocol = %this.protocol,
                        origin = %origin,
                        err = %err,
                        "mount: incoming stream dropped"
                    );
                }
            });
        }
    }

    /// Dial the local target and wire the relay up. A failed dial aborts
    /// the just-accepted overlay stream only; the listener keeps accepting.
    async fn handle_stream(&self, remote: OverlayStream, origin: &PeerId) -> anyhow::Result<()> {
        let dial = TcpStream::connect(self.target_address.as_str());
        let conn = match tokio::time::timeout(self.dial_timeout, dial).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                let OverlayStream { mut send, .. } = remote;
                send.abort();
                let _ = send.shutdown().await;
                return Err(err).context("mount: dial local target");
            }
            Err(_) => {
                let OverlayStream { mut send, .. } = remote;
                send.abort();
                let _ = send.shutdown().await;
                anyhow::bail!("mount: dial local target timed out");
            }
        };

        let stream = self.streams.register(
            &self.protocol,
            net::peer_addr(origin),
            self.target_address.clone(),
        );
        stream.start(conn, remote);
        Ok(())
    }
}

#[async_trait]
impl Listener for RemoteListener {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn listen_address(&self) -> String {
        self.listen_address.clone()
    }

    fn target_address(&self) -> String {
        self.target_address.clone()
    }

    async fn close(&self) {
        let task = self
            .accept_task
            .lock()
            .expect("accept task poisoned")
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.acceptor.close();
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.deregister(&self.key());
        }
        tracing::info!(
            protocol = %self.protocol,
            target = %self.target_address,
            "mount: remote forward closed"
        );
    }
}
