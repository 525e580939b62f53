use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;

use crate::overlay::{BoxedRecv, BoxedSend, OverlayStream};

/// How a stream ended. `Close` is a clean end of stream on both endpoints;
/// `Reset` aborts the overlay side so the peer can tell the tunnel died
/// abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Close,
    Reset,
}

/// One established pairing of a local connection and an overlay stream.
///
/// The relay runs as two independent copy tasks, one per direction. The
/// first terminal action (from either direction, or an administrative
/// close) wins; it deregisters the stream exactly once and wakes the other
/// direction so both endpoints get released.
pub struct Stream {
    handle: u64,
    protocol: String,
    origin: String,
    target: String,
    verdict: StdMutex<Option<Terminal>>,
    notify: watch::Sender<bool>,
    registry: Weak<StreamRegistry>,
}

/// Serializable stream snapshot for the administrative surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamInfo {
    pub handle: u64,
    pub protocol: String,
    pub origin_address: String,
    pub target_address: String,
}

impl Stream {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn origin_address(&self) -> &str {
        &self.origin
    }

    pub fn target_address(&self) -> &str {
        &self.target
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            handle: self.handle,
            protocol: self.protocol.clone(),
            origin_address: self.origin.clone(),
            target_address: self.target.clone(),
        }
    }

    /// End the stream gracefully: both endpoints see a clean end of stream.
    pub fn close(&self) {
        self.decide(Terminal::Close);
    }

    /// End the stream abruptly: the overlay side is aborted so the remote
    /// peer observes an error rather than EOF.
    pub fn reset(&self) {
        self.decide(Terminal::Reset);
    }

    /// Record the terminal action if none was recorded yet, deregister, and
    /// wake the relay tasks. Returns whether this call was the first.
    fn decide(&self, action: Terminal) -> bool {
        {
            let mut verdict = self.verdict.lock().expect("stream verdict poisoned");
            if verdict.is_some() {
                return false;
            }
            *verdict = Some(action);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.handle);
        }
        let _ = self.notify.send(true);
        tracing::debug!(
            handle = self.handle,
            protocol = %self.protocol,
            action = ?action,
            "mount: stream ended"
        );
        true
    }

    fn terminal(&self) -> Option<Terminal> {
        *self.verdict.lock().expect("stream verdict poisoned")
    }

    /// Start the relay over the given endpoints. The stream owns both from
    /// here on; they are released when the relay ends.
    pub(crate) fn start(self: &Arc<Self>, local: TcpStream, remote: OverlayStream) {
        let wake_a = self.notify.subscribe();
        let wake_b = self.notify.subscribe();
        if self.terminal().is_some() {
            // Closed before the relay started; drop both endpoints as-is.
            return;
        }

        let (local_rd, local_wr) = local.into_split();
        let OverlayStream {
            recv: remote_rd,
            send: remote_send,
        } = remote;

        tokio::spawn(self.clone().run_inbound(remote_rd, local_wr, wake_a));
        tokio::spawn(self.clone().run_outbound(local_rd, remote_send, wake_b));
    }

    /// remote -> local. Natural completion for any reason triggers a reset.
    /// A Close verdict from the other direction does not cut the copy
    /// short: response bytes may still be in flight, so it drains to the
    /// remote's EOF first. Only a Reset cancels it.
    async fn run_inbound(
        self: Arc<Self>,
        mut rd: BoxedRecv,
        mut wr: OwnedWriteHalf,
        mut wake: watch::Receiver<bool>,
    ) {
        let finished = {
            let copy = tokio::io::copy(&mut rd, &mut wr);
            tokio::pin!(copy);
            loop {
                tokio::select! {
                    res = &mut copy => break Some(res),
                    _ = wake.changed() => {
                        if self.terminal() == Some(Terminal::Reset) {
                            break None;
                        }
                    }
                }
            }
        };
        if let Some(res) = finished {
            if let Err(err) = &res {
                tracing::debug!(handle = self.handle, err = %err, "mount: inbound copy failed");
            }
            self.decide(Terminal::Reset);
        }
        match self.terminal() {
            Some(Terminal::Close) => {
                let _ = wr.shutdown().await;
            }
            // Reset: dropping the half closes the local write side.
            _ => {}
        }
    }

    /// local -> remote. Clean EOF closes; an error resets.
    async fn run_outbound(
        self: Arc<Self>,
        mut rd: OwnedReadHalf,
        mut send: BoxedSend,
        mut wake: watch::Receiver<bool>,
    ) {
        let finished = tokio::select! {
            res = tokio::io::copy(&mut rd, &mut send) => Some(res),
            _ = wake.changed() => None,
        };
        if let Some(res) = finished {
            match res {
                Ok(_) => {
                    self.decide(Terminal::Close);
                }
                Err(err) => {
                    tracing::debug!(handle = self.handle, err = %err, "mount: outbound copy failed");
                    self.decide(Terminal::Reset);
                }
            }
        }
        match self.terminal() {
            Some(Terminal::Close) => {
                let _ = send.shutdown().await;
            }
            _ => {
                send.abort();
                let _ = send.shutdown().await;
            }
        }
    }
}

struct Inner {
    streams: BTreeMap<u64, Arc<Stream>>,
    next_handle: u64,
}

/// Process-wide table of live streams, keyed by a monotonically increasing
/// handle. Handles start at 0 and are never reused for the registry's
/// lifetime.
pub struct StreamRegistry {
    inner: StdMutex<Inner>,
}

impl StreamRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StdMutex::new(Inner {
                streams: BTreeMap::new(),
                next_handle: 0,
            }),
        })
    }

    /// Create a stream with the next handle and insert it. Always succeeds.
    pub fn register(
        self: &Arc<Self>,
        protocol: &str,
        origin: String,
        target: String,
    ) -> Arc<Stream> {
        let (notify, _) = watch::channel(false);
        let mut inner = self.inner.lock().expect("stream registry poisoned");
        let handle = inner.next_handle;
        inner.next_handle += 1;

        let stream = Arc::new(Stream {
            handle,
            protocol: protocol.to_string(),
            origin,
            target,
            verdict: StdMutex::new(None),
            notify,
            registry: Arc::downgrade(self),
        });
        inner.streams.insert(handle, stream.clone());
        stream
    }

    /// Remove the entry for `handle`; a no-op when absent.
    pub fn deregister(&self, handle: u64) {
        let mut inner = self.inner.lock().expect("stream registry poisoned");
        inner.streams.remove(&handle);
    }

    pub fn get(&self, handle: u64) -> Option<Arc<Stream>> {
        let inner = self.inner.lock().expect("stream registry poisoned");
        inner.streams.get(&handle).cloned()
    }

    /// Snapshot of the current streams in handle order.
    pub fn list(&self) -> Vec<Arc<Stream>> {
        let inner = self.inner.lock().expect("stream registry poisoned");
        inner.streams.values().cloned().collect()
    }
}
