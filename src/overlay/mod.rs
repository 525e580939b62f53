//! Seam toward the overlay transport.
//!
//! The mounting core does not establish peer connections, multiplex streams
//! or secure channels itself; it consumes an [`Overlay`] implementation that
//! does. Two implementations ship with the crate: an in-process hub for
//! tests and demos ([`memory::MemoryNet`]) and a QUIC adapter
//! ([`quic::QuicOverlay`]).

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

pub mod memory;
pub mod quic;

/// Identity of a peer on the overlay. Opaque to the mounting core; the
/// overlay implementation decides what it means and how it is resolved.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Send half of an overlay stream.
///
/// A graceful end of stream is expressed through `poll_shutdown`; `abort`
/// terminates the stream abruptly so the peer observes an error instead of
/// a clean EOF. The distinction is what lets a tunnel reset propagate.
pub trait OverlaySend: AsyncWrite + Send + Unpin {
    /// Abruptly terminate the stream so the peer observes an error. Best
    /// effort; never blocks. Callers shut the half down afterwards so the
    /// peer's pending read is released.
    fn abort(&mut self);
}

pub type BoxedRecv = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedSend = Box<dyn OverlaySend>;

/// One end of a protocol-tagged overlay stream, split into halves so the
/// two relay directions can run independently.
pub struct OverlayStream {
    pub recv: BoxedRecv,
    pub send: BoxedSend,
}

impl fmt::Debug for OverlayStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayStream").finish_non_exhaustive()
    }
}

/// Handle to the overlay transport for one local identity.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Identity streams from this node are attributed to.
    fn local_peer(&self) -> PeerId;

    /// Connect to `peer` and open a stream tagged with `protocol`
    /// (connect-then-open; no retry). The caller bounds this with a timeout.
    async fn dial(&self, peer: &PeerId, protocol: &str) -> anyhow::Result<OverlayStream>;

    /// Register this node as the handler for `protocol`. Streams any peer
    /// opens for that tag are delivered through the returned acceptor.
    /// Fails if a handler for the tag is already registered.
    async fn bind(&self, protocol: &str) -> anyhow::Result<Box<dyn OverlayAcceptor>>;
}

/// Accept side of a bound protocol handler.
#[async_trait]
pub trait OverlayAcceptor: Send + Sync {
    /// Next incoming stream for the bound protocol, together with the
    /// dialing peer's identity. Fails once the handler is closed.
    async fn accept(&self) -> anyhow::Result<(OverlayStream, PeerId)>;

    /// Unregister the handler; pending and future accepts fail.
    fn close(&self);
}
