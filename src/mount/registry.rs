use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use crate::error::ForwardError;

/// A long-lived tunnel acceptor: either a local socket forwarded into the
/// overlay, or an overlay protocol handler forwarded to a local target.
#[async_trait]
pub trait Listener: Send + Sync {
    fn protocol(&self) -> &str;
    fn listen_address(&self) -> String;
    fn target_address(&self) -> String;

    /// Bound socket address, when the listener owns a local socket. Useful
    /// when the listen address was given with port 0.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Stop accepting and remove the listener from its registry. Streams
    /// already established keep running.
    async fn close(&self);

    fn key(&self) -> ListenerKey {
        ListenerKey {
            protocol: self.protocol().to_string(),
            listen_address: self.listen_address(),
            target_address: self.target_address(),
        }
    }
}

impl fmt::Debug for dyn Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("protocol", &self.protocol())
            .field("listen_address", &self.listen_address())
            .field("target_address", &self.target_address())
            .finish()
    }
}

/// Registry identity of a listener. Two listeners with an identical key may
/// not coexist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    pub protocol: String,
    pub listen_address: String,
    pub target_address: String,
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.protocol, self.listen_address, self.target_address
        )
    }
}

/// Serializable listener snapshot for the administrative surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ListenerInfo {
    pub protocol: String,
    pub listen_address: String,
    pub target_address: String,
}

struct Inner {
    listeners: HashMap<ListenerKey, Arc<dyn Listener>>,
    // Keys reserved between the duplicate check and the external bind.
    pending: HashSet<ListenerKey>,
}

/// Process-wide table of live listeners.
///
/// Opening a tunnel is a two-phase act: `lock` reserves the key, the caller
/// performs the external bind (local socket or overlay handler), and only
/// then `register` makes the listener visible. `unlock` releases the
/// reservation when the bind fails. Without the reservation two concurrent
/// opens for the same key could both pass the duplicate check and both bind.
pub struct ListenerRegistry {
    inner: StdMutex<Inner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(Inner {
                listeners: HashMap::new(),
                pending: HashSet::new(),
            }),
        }
    }

    /// Reserve `key` for a registration in flight. Fails when the key is
    /// already registered or reserved.
    pub fn lock(&self, key: &ListenerKey) -> Result<(), ForwardError> {
        let mut inner = self.inner.lock().expect("listener registry poisoned");
        if inner.listeners.contains_key(key) || inner.pending.contains(key) {
            return Err(ForwardError::DuplicateListener(key.clone()));
        }
        inner.pending.insert(key.clone());
        Ok(())
    }

    /// Release a reservation without registering anything.
    pub fn unlock(&self, key: &ListenerKey) {
        let mut inner = self.inner.lock().expect("listener registry poisoned");
        inner.pending.remove(key);
    }

    /// Insert a listener at its key, clearing the reservation. Must only be
    /// called after a successful `lock` on the same key.
    pub fn register(&self, listener: Arc<dyn Listener>) {
        let key = listener.key();
        let mut inner = self.inner.lock().expect("listener registry poisoned");
        inner.pending.remove(&key);
        inner.listeners.insert(key, listener);
    }

    /// Remove the entry for `key`; a no-op when absent.
    pub fn deregister(&self, key: &ListenerKey) {
        let mut inner = self.inner.lock().expect("listener registry poisoned");
        inner.listeners.remove(key);
    }

    /// Snapshot of the current listeners.
    pub fn list(&self) -> Vec<Arc<dyn Listener>> {
        let inner = self.inner.lock().expect("listener registry poisoned");
        inner.listeners.values().cloned().collect()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
