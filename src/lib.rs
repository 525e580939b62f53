//! # weir — tunnel mounting over a peer-to-peer overlay
//!
//! Weir generalizes SSH-style port forwarding to an overlay network where
//! endpoints are addressed by peer identity plus protocol tag:
//!
//! - **local forward**: a local TCP listener whose inbound connections are
//!   forwarded over a protocol-tagged overlay stream to a handler mounted
//!   by a remote peer;
//! - **remote forward**: a local protocol handler whose incoming overlay
//!   streams are forwarded to a local TCP target.
//!
//! The overlay transport itself sits behind the [`overlay::Overlay`] seam;
//! [`overlay::memory`] provides an in-process hub and [`overlay::quic`] a
//! QUIC adapter. Tunneled bytes cross the relay unmodified in both
//! directions; a tunnel ending abnormally resets the overlay stream so the
//! peer can tell it apart from a clean end of stream.
//!
//! ```ignore
//! let net = MemoryNet::new();
//! let mounts = Mounts::new(net.host("a"), MountOptions::default());
//! mounts.forward_local(PeerId::new("b"), "ssh", "127.0.0.1:2222").await?;
//! ```

pub mod admin;
pub mod error;
pub mod mount;
pub mod net;
pub mod overlay;

pub use error::{AdminError, ForwardError};
pub use mount::{Listener, ListenerRegistry, MountOptions, Mounts, Stream, StreamRegistry};
pub use overlay::{Overlay, OverlayAcceptor, OverlayStream, PeerId};
